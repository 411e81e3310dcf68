//! # cedula-lookup
//!
//! Resilient form automation for the public professional-credential portal.
//!
//! The portal is a single-page app: its fields may sit inside nested frames,
//! selector names drift between releases, and a submitted query answers with
//! either a result table or a "no results" message, rendered asynchronously.
//! This crate finds the controls without knowing their frame or exact
//! selector, fills and submits the form, races the two possible answers under
//! a deadline, and normalizes the table into typed records.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cedula_lookup::{BrowserConfig, BrowserPool, CedulaLookup, LookupConfig, Query};
//!
//! #[tokio::main]
//! async fn main() -> cedula_lookup::Result<()> {
//!     let pool = BrowserPool::new(BrowserConfig::default());
//!     let lookup = CedulaLookup::new(pool.clone(), LookupConfig::from_env()?);
//!
//!     let response = lookup.search(&Query::by_curp("ABCD800101HDFLRN09")).await?;
//!     println!("{} match(es)", response.result.total_count);
//!
//!     pool.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Driving your own page
//!
//! The engine only needs the [`Page`] / [`Frame`] traits. Any provider that can
//! list frames and answer locator queries per frame can run a [`FormSession`].

pub mod browser;
pub mod cdp;
pub mod controls;
pub mod driver;
pub mod error;
pub mod extract;
pub mod form;
pub mod frames;
pub mod lookup;
pub mod model;
pub mod page;
pub mod resolver;
pub mod wait;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports
pub use browser::{Browser, BrowserPool, InitOnce};
pub use controls::{ControlSpec, ControlTable};
pub use driver::{ElementId, Frame, InputInfo, Locator, Page};
pub use error::{Error, Result};
pub use extract::ResultExtractor;
pub use form::{FillPolicy, FillReport, FormSession, Outcome, SessionState};
pub use frames::FrameSet;
pub use lookup::{CedulaLookup, FrameInputs, LookupResponse};
pub use model::{Candidate, Field, Query, RawRow, ResultSet};
pub use page::{CdpFrame, CdpPage};
pub use resolver::{ControlResolver, ResolvedControl};
pub use wait::PollingWaiter;

/// Public landing page of the credential portal
pub const PORTAL_URL: &str = "https://cedulaprofesional.sep.gob.mx/";

/// Default text shown by the portal when a query matches nothing
pub const EMPTY_RESULTS_PATTERN: &str = "sin resultados|no se encontraron";

/// Configuration for a lookup
#[derive(Debug, Clone)]
pub struct LookupConfig {
    /// Page the form lives on
    pub portal_url: String,
    /// Navigation and load-state wait
    pub nav_timeout_ms: u64,
    /// How long the form may take to show any known field
    pub selector_timeout_ms: u64,
    /// Deadline for rows or the empty-result message after submitting
    pub outcome_timeout_ms: u64,
    /// Pause between poll ticks
    pub poll_interval_ms: u64,
    /// Per-frame visibility probe for fields
    pub field_probe_ms: u64,
    /// Per-frame visibility probe for buttons
    pub button_probe_ms: u64,
    /// Selector for result rows
    pub row_selector: String,
    /// Case-insensitive pattern of the "nothing matched" message
    pub empty_results_pattern: String,
    /// Behavior when a field cannot be located
    pub fill_policy: FillPolicy,
    /// How to recognise each control
    pub controls: ControlTable,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            portal_url: PORTAL_URL.to_string(),
            nav_timeout_ms: 180_000,
            selector_timeout_ms: 90_000,
            outcome_timeout_ms: 45_000,
            poll_interval_ms: 250,
            field_probe_ms: 300,
            button_probe_ms: 500,
            row_selector: extract::DEFAULT_ROW_SELECTOR.to_string(),
            empty_results_pattern: EMPTY_RESULTS_PATTERN.to_string(),
            fill_policy: FillPolicy::Lenient,
            controls: ControlTable::portal_default(),
        }
    }
}

impl LookupConfig {
    /// Defaults overridden by environment variables.
    ///
    /// Reads `PORTAL_URL`, `NAV_TIMEOUT_MS`, `SEL_TIMEOUT_MS`,
    /// `OUTCOME_TIMEOUT_MS`, `FILL_POLICY` and `CONTROLS_FILE`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(url) = get("PORTAL_URL") {
            config.portal_url = url;
        }
        if let Some(ms) = env_millis(&get, "NAV_TIMEOUT_MS")? {
            config.nav_timeout_ms = ms;
        }
        if let Some(ms) = env_millis(&get, "SEL_TIMEOUT_MS")? {
            config.selector_timeout_ms = ms;
        }
        if let Some(ms) = env_millis(&get, "OUTCOME_TIMEOUT_MS")? {
            config.outcome_timeout_ms = ms;
        }
        if let Some(policy) = get("FILL_POLICY") {
            config.fill_policy = policy.parse()?;
        }
        if let Some(path) = get("CONTROLS_FILE") {
            config.controls = ControlTable::load(path)?;
        }

        Ok(config)
    }

    /// Short timeouts, for local fixtures
    pub fn fast() -> Self {
        Self {
            nav_timeout_ms: 10_000,
            selector_timeout_ms: 5_000,
            outcome_timeout_ms: 5_000,
            poll_interval_ms: 100,
            ..Default::default()
        }
    }
}

fn env_millis(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>> {
    match get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} must be milliseconds, got '{}'", key, raw))),
    }
}

/// Configuration for the Chrome instance behind [`BrowserPool`]
#[derive(Debug, Clone)]
pub struct BrowserConfig {
    /// Headless mode
    pub headless: bool,
    /// Path to Chrome/Chromium binary
    pub chrome_path: Option<String>,
    /// Viewport width
    pub viewport_width: u32,
    /// Viewport height
    pub viewport_height: u32,
    /// User agent applied to every lookup context
    pub user_agent: Option<String>,
    /// Accept-Language / navigator.language for lookup contexts
    pub locale: Option<String>,
    /// IANA timezone for lookup contexts
    pub timezone: Option<String>,
    /// Extra command-line flags
    pub extra_args: Vec<String>,
    /// Upper bound for a single CDP command
    pub command_timeout_ms: u64,
    /// How long Chrome gets to print its DevTools URL before it is killed
    pub launch_timeout_ms: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_path: None,
            viewport_width: 1280,
            viewport_height: 900,
            user_agent: Some(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                    .to_string(),
            ),
            locale: Some("es-MX".to_string()),
            timezone: Some("America/Mexico_City".to_string()),
            extra_args: Vec::new(),
            command_timeout_ms: 30_000,
            launch_timeout_ms: 30_000,
        }
    }
}

impl BrowserConfig {
    /// Create a visible (non-headless) config
    pub fn visible() -> Self {
        Self {
            headless: false,
            ..Default::default()
        }
    }

    /// No overrides: Chrome's own user agent, locale and timezone
    pub fn minimal() -> Self {
        Self {
            user_agent: None,
            locale: None,
            timezone: None,
            ..Default::default()
        }
    }
}
