//! Browser-level connection and per-tab sessions

use std::sync::Arc;

use serde_json::Value;

use super::transport::Transport;
use super::types::*;
use crate::error::{Error, Result};

/// A CDP connection to Chrome
pub struct Connection {
    transport: Arc<Transport>,
}

impl Connection {
    /// Create a new connection wrapping a transport
    pub fn new(transport: Transport) -> Self {
        Self {
            transport: Arc::new(transport),
        }
    }

    /// Whether Chrome has gone away
    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    /// Get browser version info
    pub async fn version(&self) -> Result<BrowserGetVersionResult> {
        self.transport
            .send("Browser.getVersion", &BrowserGetVersion {})
            .await
    }

    /// Create an isolated browser context (separate cookies and storage)
    pub async fn create_browser_context(&self) -> Result<String> {
        let result: TargetCreateBrowserContextResult = self
            .transport
            .send(
                "Target.createBrowserContext",
                &TargetCreateBrowserContext {
                    dispose_on_detach: Some(true),
                },
            )
            .await?;
        Ok(result.browser_context_id)
    }

    /// Dispose a browser context and every target in it
    pub async fn dispose_browser_context(&self, browser_context_id: &str) -> Result<()> {
        self.transport
            .send::<_, Value>(
                "Target.disposeBrowserContext",
                &TargetDisposeBrowserContext {
                    browser_context_id: browser_context_id.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    /// Create a new target (tab), optionally inside a browser context
    pub async fn create_target(
        &self,
        url: &str,
        width: Option<u32>,
        height: Option<u32>,
        browser_context_id: Option<&str>,
    ) -> Result<String> {
        let result: TargetCreateTargetResult = self
            .transport
            .send(
                "Target.createTarget",
                &TargetCreateTarget {
                    url: url.to_string(),
                    width,
                    height,
                    browser_context_id: browser_context_id.map(String::from),
                },
            )
            .await?;
        Ok(result.target_id)
    }

    /// Attach to a target and get a session
    pub async fn attach_to_target(&self, target_id: &str) -> Result<Session> {
        let result: TargetAttachToTargetResult = self
            .transport
            .send(
                "Target.attachToTarget",
                &TargetAttachToTarget {
                    target_id: target_id.to_string(),
                    flatten: Some(true),
                },
            )
            .await?;

        Ok(Session {
            transport: Arc::clone(&self.transport),
            session_id: result.session_id,
            target_id: target_id.to_string(),
        })
    }

    /// Close a target
    pub async fn close_target(&self, target_id: &str) -> Result<bool> {
        let result: TargetCloseTargetResult = self
            .transport
            .send(
                "Target.closeTarget",
                &TargetCloseTarget {
                    target_id: target_id.to_string(),
                },
            )
            .await?;
        Ok(result.success)
    }

    /// Close the browser
    pub async fn close(&self) -> Result<()> {
        if !self.transport.is_closed() {
            let _ = self
                .transport
                .send::<_, Value>("Browser.close", &BrowserClose {})
                .await;
        }
        self.transport.close().await
    }
}

/// A CDP session attached to a specific target
pub struct Session {
    transport: Arc<Transport>,
    session_id: String,
    target_id: String,
}

impl Session {
    /// Get the target ID
    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    async fn send<C, R>(&self, method: &str, params: &C) -> Result<R>
    where
        C: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        self.transport
            .send_to_session(&self.session_id, method, params)
            .await
    }

    /// Enable page domain (required for frame tree and isolated worlds)
    pub async fn page_enable(&self) -> Result<()> {
        self.send::<_, Value>("Page.enable", &PageEnable {}).await?;
        Ok(())
    }

    /// Start a navigation. A refused navigation comes back in `error_text`.
    pub async fn navigate(&self, url: &str) -> Result<PageNavigateResult> {
        self.send(
            "Page.navigate",
            &PageNavigate {
                url: url.to_string(),
            },
        )
        .await
    }

    /// Get the frame tree
    pub async fn get_frame_tree(&self) -> Result<FrameTree> {
        let result: PageGetFrameTreeResult =
            self.send("Page.getFrameTree", &PageGetFrameTree {}).await?;
        Ok(result.frame_tree)
    }

    /// Create an isolated JavaScript world in a frame, returning its context id
    pub async fn create_isolated_world(&self, frame_id: &str, world_name: &str) -> Result<i64> {
        let result: PageCreateIsolatedWorldResult = self
            .send(
                "Page.createIsolatedWorld",
                &PageCreateIsolatedWorld {
                    frame_id: frame_id.to_string(),
                    world_name: world_name.to_string(),
                },
            )
            .await?;
        Ok(result.execution_context_id)
    }

    /// Evaluate an expression and return its value.
    ///
    /// Runs in `context_id` when given, otherwise in the main frame's default
    /// world. A thrown exception becomes [`Error::Script`].
    pub async fn evaluate(&self, expression: &str, context_id: Option<i64>) -> Result<Value> {
        let result: RuntimeEvaluateResult = self
            .send(
                "Runtime.evaluate",
                &RuntimeEvaluate {
                    expression: expression.to_string(),
                    context_id,
                    return_by_value: true,
                },
            )
            .await?;

        if let Some(details) = result.exception_details {
            let frame = context_id.map_or_else(|| "main".to_string(), |id| id.to_string());
            return Err(Error::script(frame, details.message()));
        }
        Ok(result.result.value.unwrap_or(Value::Null))
    }

    /// Override the user agent and Accept-Language
    pub async fn set_user_agent(&self, user_agent: &str, accept_language: Option<&str>) -> Result<()> {
        self.send::<_, Value>(
            "Emulation.setUserAgentOverride",
            &EmulationSetUserAgentOverride {
                user_agent: user_agent.to_string(),
                accept_language: accept_language.map(String::from),
            },
        )
        .await?;
        Ok(())
    }

    /// Override navigator.language and Intl defaults
    pub async fn set_locale(&self, locale: &str) -> Result<()> {
        self.send::<_, Value>(
            "Emulation.setLocaleOverride",
            &EmulationSetLocaleOverride {
                locale: locale.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    /// Override the timezone
    pub async fn set_timezone(&self, timezone_id: &str) -> Result<()> {
        self.send::<_, Value>(
            "Emulation.setTimezoneOverride",
            &EmulationSetTimezoneOverride {
                timezone_id: timezone_id.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    /// Set the viewport size
    pub async fn set_viewport(&self, width: u32, height: u32) -> Result<()> {
        self.send::<_, Value>(
            "Emulation.setDeviceMetricsOverride",
            &EmulationSetDeviceMetricsOverride {
                width,
                height,
                device_scale_factor: 1.0,
                mobile: false,
            },
        )
        .await?;
        Ok(())
    }
}
