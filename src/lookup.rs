//! Lookup service
//!
//! One call, one isolated browser context: validate the query, open a page,
//! drive the form, and release the context whatever the outcome.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::browser::BrowserPool;
use crate::driver::{InputInfo, Page};
use crate::error::Result;
use crate::form::FormSession;
use crate::frames::FrameSet;
use crate::model::{Query, ResultSet};
use crate::LookupConfig;

/// What a caller gets back: the query as received and its normalized result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupResponse {
    pub query: Query,
    pub result: ResultSet,
}

/// Visible form controls of one frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameInputs {
    pub frame_id: String,
    pub url: String,
    pub inputs: Vec<InputInfo>,
}

/// Credential lookups against the portal, sharing one browser
#[derive(Clone)]
pub struct CedulaLookup {
    pool: BrowserPool,
    config: Arc<LookupConfig>,
}

impl CedulaLookup {
    pub fn new(pool: BrowserPool, config: LookupConfig) -> Self {
        Self {
            pool,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &LookupConfig {
        &self.config
    }

    /// Run one lookup in a fresh browser context
    pub async fn search(&self, query: &Query) -> Result<LookupResponse> {
        query.validate()?;

        let browser = self.pool.browser().await?;
        let page = browser.new_page().await?;

        let outcome = lookup_on(&page, &self.config, query).await;

        if let Err(e) = browser.dispose_page(page).await {
            tracing::warn!("Failed to dispose lookup context: {}", e);
        }
        outcome
    }

    /// Load the portal and list the visible inputs of every frame
    pub async fn inspect_fields(&self) -> Result<Vec<FrameInputs>> {
        let browser = self.pool.browser().await?;
        let page = browser.new_page().await?;

        let outcome = async {
            page.goto(
                &self.config.portal_url,
                std::time::Duration::from_millis(self.config.nav_timeout_ms),
            )
            .await?;
            Ok(inspect_fields(&page).await)
        }
        .await;

        if let Err(e) = browser.dispose_page(page).await {
            tracing::warn!("Failed to dispose inspection context: {}", e);
        }
        outcome
    }
}

/// Validate `query`, then navigate `page` to the portal and run the form on it
pub async fn lookup_on(
    page: &dyn Page,
    config: &LookupConfig,
    query: &Query,
) -> Result<LookupResponse> {
    query.validate()?;

    let fields: Vec<_> = query.present_fields().map(|(f, _)| f.as_str()).collect();
    tracing::info!("Lookup by {}", fields.join(", "));

    let result = FormSession::new(page, config)?
        .run_at(&config.portal_url, query)
        .await
        .inspect_err(|e| tracing::warn!("Lookup failed ({}): {}", e.kind(), e))?;

    Ok(LookupResponse {
        query: query.clone(),
        result,
    })
}

/// Visible inputs of every attached frame, main document first.
///
/// Frames that fail to answer are listed with no inputs.
pub async fn inspect_fields(page: &dyn Page) -> Vec<FrameInputs> {
    let frames = FrameSet::snapshot_or_empty(page).await;
    let mut out = Vec::with_capacity(frames.len());
    for frame in frames.iter() {
        let inputs = frame.inputs().await.unwrap_or_else(|e| {
            tracing::debug!("Input listing failed in frame {}: {}", frame.id(), e);
            Vec::new()
        });
        out.push(FrameInputs {
            frame_id: frame.id().to_string(),
            url: frame.url().to_string(),
            inputs,
        });
    }
    out
}
