//! Page provider seam
//!
//! The engine never talks to a browser directly. It drives anything that can
//! list its frames and answer locator queries per frame; [`crate::page::CdpPage`]
//! is the Chrome implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use crate::error::Result;
use crate::model::RawRow;

/// How to find one element inside a single frame
#[derive(Debug, Clone)]
pub enum Locator {
    /// Form control whose accessible label matches (label[for], wrapping
    /// label, aria-label, aria-labelledby)
    Label(Regex),
    /// Plain CSS selector
    Css(String),
    /// Element with the given ARIA role whose accessible name matches
    Role { role: String, name: Regex },
    /// Button-like element whose text contains the string, case-insensitive
    ButtonText(String),
    /// Any element whose own visible text matches
    Text(Regex),
}

impl Locator {
    /// Short description for logs
    pub fn describe(&self) -> String {
        match self {
            Locator::Label(re) => format!("label=/{}/i", re.as_str()),
            Locator::Css(sel) => format!("css={}", sel),
            Locator::Role { role, name } => format!("role={}[name=/{}/i]", role, name.as_str()),
            Locator::ButtonText(text) => format!("button:has-text({:?})", text),
            Locator::Text(re) => format!("text=/{}/i", re.as_str()),
        }
    }
}

/// Opaque reference to an element inside one frame.
///
/// Only meaningful to the frame that produced it, and only until the next
/// navigation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementId(pub String);

impl std::fmt::Display for ElementId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One navigable document: the main page or an embedded frame
#[async_trait]
pub trait Frame: Send + Sync {
    /// Frame identifier, stable while the frame stays attached
    fn id(&self) -> &str;

    /// URL of the frame document when it was listed
    fn url(&self) -> &str;

    /// First visible element matching `locator`, checking for at most `probe`.
    ///
    /// `Ok(None)` means nothing visible matched.
    async fn find_visible(&self, locator: &Locator, probe: Duration) -> Result<Option<ElementId>>;

    /// Whether anything visible matches `locator`, without handing out or
    /// recording an element
    async fn is_visible(&self, locator: &Locator, probe: Duration) -> Result<bool>;

    /// Replace the value of an input and fire the events a framework form listens to
    async fn fill(&self, element: &ElementId, value: &str) -> Result<()>;

    /// Activate an element
    async fn click(&self, element: &ElementId) -> Result<()>;

    /// Number of elements matching a CSS selector
    async fn count(&self, selector: &str) -> Result<usize>;

    /// Trimmed `td` texts of every row matching `row_selector`, in document order
    async fn rows(&self, row_selector: &str) -> Result<Vec<RawRow>>;

    /// Visible `input`, `select` and `textarea` controls, for layout diagnosis
    async fn inputs(&self) -> Result<Vec<InputInfo>> {
        Ok(Vec::new())
    }
}

/// A live page whose frames can be enumerated
#[async_trait]
pub trait Page: Send + Sync {
    /// Every attached frame, main document first, then embedded frames
    /// depth-first in attachment order
    async fn frames(&self) -> Result<Vec<Arc<dyn Frame>>>;

    /// Navigate and wait, up to `timeout`, for the document to finish loading.
    ///
    /// Errors only when the navigation itself is refused; a slow load is not an error.
    async fn goto(&self, url: &str, timeout: Duration) -> Result<()>;
}

/// A visible form control, as reported by [`Frame::inputs`]
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct InputInfo {
    pub tag: String,
    pub id: String,
    #[serde(rename = "formcontrolname")]
    pub form_control_name: String,
    pub placeholder: String,
}
