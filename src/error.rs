//! Error types for cedula-lookup

use std::time::Duration;

use thiserror::Error;

/// Result type for cedula-lookup operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for cedula-lookup
#[derive(Debug, Error)]
pub enum Error {
    /// The form never became interactive
    #[error("Form not ready: no known field appeared in any frame within {}ms", .timeout.as_millis())]
    ReadinessTimeout { timeout: Duration },

    /// The search action could not be resolved in any frame
    #[error("Submit control not found: no visible search button in any frame")]
    SubmitControlNotFound,

    /// Neither result rows nor the empty-result message appeared
    #[error("No outcome: neither result rows nor an empty-result message appeared within {}ms", .timeout.as_millis())]
    RowWaitTimeout { timeout: Duration },

    /// Result rows were detected but could not be read back
    #[error("Result rows could not be read: {0}")]
    ExtractionFailed(String),

    /// The page failed to load at all
    #[error("Navigation failed for {url}: {reason}")]
    NavigationFailed { url: String, reason: String },

    /// A field control could not be resolved (strict fill only)
    #[error("Field control not resolved: {0}")]
    FieldNotResolved(String),

    /// The query did not carry enough data to search
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Configuration could not be loaded or validated
    #[error("Configuration error: {0}")]
    Config(String),

    /// A label or text pattern failed to compile
    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// Failed to launch Chrome
    #[error("Failed to launch Chrome: {0}")]
    Launch(String),

    /// Chrome not found
    #[error("Chrome not found")]
    ChromeNotFound,

    /// The shared browser has been shut down
    #[error("Browser has been shut down")]
    BrowserClosed,

    /// Transport error
    #[error("Transport error: {context}")]
    Transport {
        context: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// CDP protocol error
    #[error("CDP error in {method}: {message} (code {code})")]
    Cdp {
        method: String,
        code: i64,
        message: String,
    },

    /// A CDP command got no response in time
    #[error("CDP command '{method}' timed out after {}ms", .timeout.as_millis())]
    CommandTimeout { method: String, timeout: Duration },

    /// JavaScript raised inside a frame
    #[error("JavaScript error in frame {frame}: {message}")]
    Script { frame: String, message: String },

    /// The element handle no longer points at a live element
    #[error("Element detached: {0}")]
    ElementDetached(String),

    /// Frame not found or detached
    #[error("Frame not found: {0}")]
    FrameNotFound(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a transport error with context
    pub fn transport(context: impl Into<String>) -> Self {
        Self::Transport {
            context: context.into(),
            source: None,
        }
    }

    /// Create a transport error with IO source
    pub fn transport_io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Transport {
            context: context.into(),
            source: Some(source),
        }
    }

    /// Create a CDP error with full context
    pub fn cdp(method: impl Into<String>, code: i64, message: impl Into<String>) -> Self {
        Self::Cdp {
            method: method.into(),
            code,
            message: message.into(),
        }
    }

    /// Create a navigation failure
    pub fn navigation(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NavigationFailed {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Create a script error raised in a frame
    pub fn script(frame: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Script {
            frame: frame.into(),
            message: message.into(),
        }
    }

    /// Whether this is one of the session outcomes a caller may retry with a fresh page.
    ///
    /// The engine itself never retries: a half-filled form is not safe to resubmit.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ReadinessTimeout { .. }
                | Error::SubmitControlNotFound
                | Error::RowWaitTimeout { .. }
                | Error::ExtractionFailed(_)
                | Error::NavigationFailed { .. }
        )
    }

    /// Short machine-readable tag for structured responses and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ReadinessTimeout { .. } => "readiness_timeout",
            Error::SubmitControlNotFound => "submit_control_not_found",
            Error::RowWaitTimeout { .. } => "row_wait_timeout",
            Error::ExtractionFailed(_) => "extraction_failed",
            Error::NavigationFailed { .. } => "navigation_failed",
            Error::FieldNotResolved(_) => "field_not_resolved",
            Error::InvalidQuery(_) => "invalid_query",
            Error::Config(_) | Error::Pattern(_) => "config",
            Error::Launch(_) | Error::ChromeNotFound | Error::BrowserClosed => "browser",
            Error::Transport { .. } | Error::Cdp { .. } | Error::CommandTimeout { .. } => {
                "protocol"
            }
            Error::Script { .. } | Error::ElementDetached(_) | Error::FrameNotFound(_) => "page",
            Error::Serialization(_) | Error::Io(_) => "internal",
        }
    }

    /// Whether the failure means the frame or element went away mid-probe
    pub fn is_detached(&self) -> bool {
        match self {
            Error::ElementDetached(_) | Error::FrameNotFound(_) => true,
            Error::Cdp { message, .. } => {
                message.contains("Cannot find context")
                    || message.contains("context was destroyed")
                    || message.contains("No frame")
            }
            _ => false,
        }
    }
}
