//! Browser Launcher
//!
//! Handles Chrome discovery and launch, the shared browser handle, and one
//! isolated browser context per lookup.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::cdp::transport::launch_chrome;
use crate::cdp::{Connection, Transport};
use crate::error::{Error, Result};
use crate::page::CdpPage;
use crate::BrowserConfig;

/// Global counter for unique user data directories
static BROWSER_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Find a Chrome or Chromium binary in the usual install locations
pub fn find_chrome() -> Result<PathBuf> {
    let candidates: &[&str] = if cfg!(target_os = "macos") {
        &[
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
        ]
    } else if cfg!(target_os = "linux") {
        &[
            "/usr/bin/google-chrome",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/snap/bin/chromium",
        ]
    } else if cfg!(target_os = "windows") {
        &[
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
        ]
    } else {
        &[]
    };

    candidates
        .iter()
        .map(Path::new)
        .find(|path| path.exists())
        .map(Path::to_path_buf)
        .ok_or(Error::ChromeNotFound)
}

/// Command-line flags for a headless-friendly container launch
fn launch_args(config: &BrowserConfig, user_data_dir: &Path) -> Vec<String> {
    let mut args = vec![
        "--no-sandbox".into(),
        "--disable-setuid-sandbox".into(),
        "--disable-dev-shm-usage".into(),
        "--disable-gpu".into(),
        "--no-first-run".into(),
        "--no-default-browser-check".into(),
        // Keep cross-origin iframes in-process so every frame shares one session
        "--disable-features=IsolateOrigins,site-per-process".into(),
        format!(
            "--window-size={},{}",
            config.viewport_width, config.viewport_height
        ),
        format!("--user-data-dir={}", user_data_dir.display()),
    ];

    if let Some(ref locale) = config.locale {
        args.push(format!("--lang={}", locale));
    }

    if config.headless {
        args.push("--headless=new".into());
    }

    args.extend(config.extra_args.iter().cloned());
    args
}

/// A running Chrome instance
pub struct Browser {
    connection: Connection,
    config: BrowserConfig,
    /// User data directory (cleaned up on close)
    user_data_dir: PathBuf,
}

impl Browser {
    /// Launch a browser with default config
    pub async fn launch() -> Result<Self> {
        Self::launch_with_config(BrowserConfig::default()).await
    }

    /// Launch with custom config
    pub async fn launch_with_config(config: BrowserConfig) -> Result<Self> {
        let instance_id = BROWSER_COUNTER.fetch_add(1, Ordering::Relaxed);
        let user_data_dir = std::env::temp_dir().join(format!(
            "cedula-lookup-{}-{}",
            std::process::id(),
            instance_id
        ));

        let _ = std::fs::remove_dir_all(&user_data_dir);
        std::fs::create_dir_all(&user_data_dir)?;

        let chrome_path = match &config.chrome_path {
            Some(p) => {
                let path = PathBuf::from(p);
                if !path.exists() {
                    return Err(Error::Launch(format!("Chrome binary not found: {}", p)));
                }
                path
            }
            None => find_chrome()?,
        };

        let args = launch_args(&config, &user_data_dir);

        tracing::info!("Launching Chrome from {:?}", chrome_path);
        let launch_timeout = Duration::from_millis(config.launch_timeout_ms);
        let (child, ws_url) = tokio::task::spawn_blocking(move || {
            launch_chrome(&chrome_path, &args, launch_timeout)
        })
        .await
        .map_err(|e| Error::Launch(format!("Launch task failed: {}", e)))??;

        let transport = Transport::new(
            child,
            &ws_url,
            Duration::from_millis(config.command_timeout_ms),
        )?;
        let connection = Connection::new(transport);

        let version = connection.version().await?;
        tracing::info!("Connected to Chrome: {}", version.product);

        Ok(Self {
            connection,
            config,
            user_data_dir,
        })
    }

    /// Whether the connection to Chrome is gone
    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    /// Get the browser version
    pub async fn version(&self) -> Result<String> {
        Ok(self.connection.version().await?.product)
    }

    /// Open a blank page in a fresh browser context.
    ///
    /// The context has its own cookies and storage and carries the configured
    /// user agent, locale, timezone and viewport. Release it with
    /// [`dispose_page`](Self::dispose_page).
    pub async fn new_page(&self) -> Result<CdpPage> {
        let context_id = self.connection.create_browser_context().await?;

        match self.open_in_context(&context_id).await {
            Ok(page) => {
                tracing::debug!("Opened page in browser context {}", context_id);
                Ok(page)
            }
            Err(e) => {
                if let Err(dispose_err) = self.connection.dispose_browser_context(&context_id).await
                {
                    tracing::warn!(
                        "Failed to dispose context {} after open error: {}",
                        context_id,
                        dispose_err
                    );
                }
                Err(e)
            }
        }
    }

    async fn open_in_context(&self, context_id: &str) -> Result<CdpPage> {
        let target_id = self
            .connection
            .create_target(
                "about:blank",
                Some(self.config.viewport_width),
                Some(self.config.viewport_height),
                Some(context_id),
            )
            .await?;

        let session = self.connection.attach_to_target(&target_id).await?;
        session.page_enable().await?;
        session
            .set_viewport(self.config.viewport_width, self.config.viewport_height)
            .await?;

        if let Some(ref user_agent) = self.config.user_agent {
            session
                .set_user_agent(user_agent, self.config.locale.as_deref())
                .await?;
        }
        if let Some(ref locale) = self.config.locale {
            session.set_locale(locale).await?;
        }
        if let Some(ref timezone) = self.config.timezone {
            session.set_timezone(timezone).await?;
        }

        Ok(CdpPage::new(session, Some(context_id.to_string())))
    }

    /// Close a page and its browser context
    pub async fn dispose_page(&self, page: CdpPage) -> Result<()> {
        match page.browser_context_id() {
            Some(context_id) => {
                self.connection.dispose_browser_context(context_id).await?;
                tracing::debug!("Disposed browser context {}", context_id);
            }
            None => {
                self.connection
                    .close_target(page.session().target_id())
                    .await?;
            }
        }
        Ok(())
    }

    /// Close the browser and remove its profile directory
    pub async fn close(&self) -> Result<()> {
        self.connection.close().await?;
        let _ = std::fs::remove_dir_all(&self.user_data_dir);
        tracing::info!("Browser closed");
        Ok(())
    }
}

impl Drop for Browser {
    fn drop(&mut self) {
        // The Transport's Drop impl handles killing the Chrome process
        let _ = std::fs::remove_dir_all(&self.user_data_dir);
    }
}

/// A value created at most once, on first use.
///
/// Concurrent first callers share a single initialization: the first runs
/// `init` while the rest wait on the lock and then see its result. A failed
/// initialization leaves the slot empty so the next caller tries again. Once
/// [`close`](Self::close) is called every later access fails with
/// [`Error::BrowserClosed`].
pub struct InitOnce<T> {
    slot: Mutex<Option<Arc<T>>>,
    closed: AtomicBool,
}

impl<T> Default for InitOnce<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> InitOnce<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// The value, initializing it with `init` if needed
    pub async fn get_or_try_init<F, Fut>(&self, init: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut slot = self.slot.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::BrowserClosed);
        }
        if let Some(value) = slot.as_ref() {
            return Ok(Arc::clone(value));
        }

        let value = Arc::new(init().await?);
        *slot = Some(Arc::clone(&value));
        Ok(value)
    }

    /// Current value without initializing
    pub async fn get(&self) -> Option<Arc<T>> {
        self.slot.lock().await.clone()
    }

    /// Drop the value if `stale` says so, returning whether it did
    pub async fn reset_if(&self, stale: impl FnOnce(&T) -> bool) -> bool {
        let mut slot = self.slot.lock().await;
        if slot.as_deref().is_some_and(stale) {
            *slot = None;
            return true;
        }
        false
    }

    /// Refuse further access and hand back the value, if one was created.
    ///
    /// Returns `None` on every call after the first.
    pub async fn close(&self) -> Option<Arc<T>> {
        let mut slot = self.slot.lock().await;
        self.closed.store(true, Ordering::SeqCst);
        slot.take()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct PoolInner {
    config: BrowserConfig,
    browser: InitOnce<Browser>,
}

/// Lazily launched browser shared by every lookup
#[derive(Clone)]
pub struct BrowserPool {
    inner: Arc<PoolInner>,
}

impl BrowserPool {
    /// Create a pool; Chrome is not started until the first lookup
    pub fn new(config: BrowserConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                browser: InitOnce::new(),
            }),
        }
    }

    pub fn config(&self) -> &BrowserConfig {
        &self.inner.config
    }

    /// The shared browser, launching it on first use or after it crashed
    pub async fn browser(&self) -> Result<Arc<Browser>> {
        if self.inner.browser.reset_if(Browser::is_closed).await {
            tracing::warn!("Shared browser connection lost, relaunching");
        }
        self.inner
            .browser
            .get_or_try_init(|| Browser::launch_with_config(self.inner.config.clone()))
            .await
    }

    /// Whether a browser has been launched and not shut down
    pub async fn is_running(&self) -> bool {
        self.inner.browser.get().await.is_some()
    }

    /// Close the shared browser. Safe to call repeatedly.
    pub async fn shutdown(&self) -> Result<()> {
        match self.inner.browser.close().await {
            Some(browser) => browser.close().await,
            None => {
                tracing::debug!("Browser pool already shut down");
                Ok(())
            }
        }
    }
}
