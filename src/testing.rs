//! In-memory page for unit tests
//!
//! Elements, rows and whole frames can be scheduled to appear after a delay
//! measured on the tokio clock, so tests run with paused time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::driver::{ElementId, Frame, InputInfo, Locator, Page};
use crate::error::{Error, Result};
use crate::model::RawRow;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Action {
    Navigate(String),
    Probe { frame: String, locator: String },
    /// A read-only visibility check
    Check { frame: String, locator: String },
    /// An element was tagged and handed out
    Mark { frame: String, element: String },
    Fill { frame: String, element: String, value: String },
    Click { frame: String, element: String },
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeElement {
    pub name: String,
    label: Option<String>,
    css: Vec<String>,
    role: Option<String>,
    text: String,
    visible_at: Duration,
}

impl FakeElement {
    /// Input with an accessible label and the selectors it answers to
    pub fn input(name: &str, label: Option<&str>, css: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            label: label.map(String::from),
            css: css.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn button(name: &str, text: &str) -> Self {
        Self {
            name: name.to_string(),
            role: Some("button".into()),
            text: text.to_string(),
            css: vec!["button".into()],
            ..Default::default()
        }
    }

    /// A non-interactive element with visible text
    pub fn text(name: &str, text: &str) -> Self {
        Self {
            name: name.to_string(),
            text: text.to_string(),
            ..Default::default()
        }
    }

    pub fn visible_after(mut self, ms: u64) -> Self {
        self.visible_at = Duration::from_millis(ms);
        self
    }

    fn matches(&self, locator: &Locator) -> bool {
        match locator {
            Locator::Label(re) => self.label.as_deref().is_some_and(|l| re.is_match(l)),
            Locator::Css(selector) => selector
                .split(',')
                .map(str::trim)
                .any(|s| self.css.iter().any(|c| c == s)),
            Locator::Role { role, name } => {
                self.role.as_deref() == Some(role.as_str()) && name.is_match(&self.text)
            }
            Locator::ButtonText(text) => {
                self.role.as_deref() == Some("button")
                    && self.text.to_lowercase().contains(&text.to_lowercase())
            }
            Locator::Text(re) => !self.text.is_empty() && re.is_match(&self.text),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeFrame {
    id: String,
    url: String,
    elements: Vec<FakeElement>,
    rows: Vec<RawRow>,
    rows_at: Duration,
    rows_error: Option<String>,
    probe_delay: Duration,
}

impl FakeFrame {
    pub fn new(id: &str, url: &str) -> Self {
        Self {
            id: id.to_string(),
            url: url.to_string(),
            ..Default::default()
        }
    }

    pub fn with(mut self, element: FakeElement) -> Self {
        self.elements.push(element);
        self
    }

    pub fn with_rows(mut self, rows: Vec<RawRow>) -> Self {
        self.rows = rows;
        self
    }

    pub fn rows_after(mut self, ms: u64) -> Self {
        self.rows_at = Duration::from_millis(ms);
        self
    }

    /// Row counts still work but reading the rows fails with `message`
    pub fn fail_rows(mut self, message: &str) -> Self {
        self.rows_error = Some(message.to_string());
        self
    }

    /// Every probe in this frame takes this long before answering
    pub fn probe_delay(mut self, ms: u64) -> Self {
        self.probe_delay = Duration::from_millis(ms);
        self
    }
}

struct AttachedFrame {
    frame: FakeFrame,
    attach_at: Duration,
    started: Instant,
    log: Arc<Mutex<Vec<Action>>>,
}

impl AttachedFrame {
    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn record(&self, action: Action) {
        if let Ok(mut log) = self.log.lock() {
            log.push(action);
        }
    }

    fn element(&self, id: &ElementId) -> Result<&FakeElement> {
        self.frame
            .elements
            .iter()
            .find(|e| format!("{}#{}", self.frame.id, e.name) == id.0)
            .ok_or_else(|| Error::ElementDetached(id.0.clone()))
    }

    fn visible(&self, locator: &Locator) -> Option<&FakeElement> {
        let now = self.elapsed();
        self.frame
            .elements
            .iter()
            .find(|e| now >= e.visible_at && e.matches(locator))
    }

    fn rows_visible(&self) -> bool {
        !self.frame.rows.is_empty() && self.elapsed() >= self.frame.rows_at
    }
}

#[async_trait]
impl Frame for AttachedFrame {
    fn id(&self) -> &str {
        &self.frame.id
    }

    fn url(&self) -> &str {
        &self.frame.url
    }

    async fn find_visible(&self, locator: &Locator, probe: Duration) -> Result<Option<ElementId>> {
        self.record(Action::Probe {
            frame: self.frame.id.clone(),
            locator: locator.describe(),
        });
        if !self.frame.probe_delay.is_zero() {
            tokio::time::sleep(self.frame.probe_delay.min(probe)).await;
            if self.frame.probe_delay > probe {
                return Ok(None);
            }
        }
        let Some(el) = self.visible(locator) else {
            return Ok(None);
        };
        self.record(Action::Mark {
            frame: self.frame.id.clone(),
            element: el.name.clone(),
        });
        Ok(Some(ElementId(format!("{}#{}", self.frame.id, el.name))))
    }

    async fn is_visible(&self, locator: &Locator, probe: Duration) -> Result<bool> {
        self.record(Action::Check {
            frame: self.frame.id.clone(),
            locator: locator.describe(),
        });
        if !self.frame.probe_delay.is_zero() {
            tokio::time::sleep(self.frame.probe_delay.min(probe)).await;
            if self.frame.probe_delay > probe {
                return Ok(false);
            }
        }
        Ok(self.visible(locator).is_some())
    }

    async fn fill(&self, element: &ElementId, value: &str) -> Result<()> {
        let el = self.element(element)?;
        self.record(Action::Fill {
            frame: self.frame.id.clone(),
            element: el.name.clone(),
            value: value.to_string(),
        });
        Ok(())
    }

    async fn click(&self, element: &ElementId) -> Result<()> {
        let el = self.element(element)?;
        self.record(Action::Click {
            frame: self.frame.id.clone(),
            element: el.name.clone(),
        });
        Ok(())
    }

    async fn count(&self, _selector: &str) -> Result<usize> {
        Ok(if self.rows_visible() { self.frame.rows.len() } else { 0 })
    }

    async fn rows(&self, _row_selector: &str) -> Result<Vec<RawRow>> {
        if let Some(message) = &self.frame.rows_error {
            return Err(Error::cdp("Runtime.evaluate", -32000, message.clone()));
        }
        Ok(if self.rows_visible() {
            self.frame.rows.clone()
        } else {
            Vec::new()
        })
    }

    async fn inputs(&self) -> Result<Vec<InputInfo>> {
        let now = self.elapsed();
        Ok(self
            .frame
            .elements
            .iter()
            .filter(|e| e.role.is_none() && !e.css.is_empty() && now >= e.visible_at)
            .map(|e| InputInfo {
                tag: "input".into(),
                id: e.name.clone(),
                ..Default::default()
            })
            .collect())
    }
}

pub(crate) struct FakePage {
    frames: Mutex<Vec<Arc<AttachedFrame>>>,
    started: Instant,
    log: Arc<Mutex<Vec<Action>>>,
    fail_listing: AtomicBool,
    goto_error: Mutex<Option<String>>,
}

impl FakePage {
    pub fn new(frames: Vec<FakeFrame>) -> Self {
        let page = Self {
            frames: Mutex::new(Vec::new()),
            started: Instant::now(),
            log: Arc::new(Mutex::new(Vec::new())),
            fail_listing: AtomicBool::new(false),
            goto_error: Mutex::new(None),
        };
        for frame in frames {
            page.attach_after(Duration::ZERO, frame);
        }
        page
    }

    /// Attach `frame` once `delay` has passed from now
    pub fn attach_after(&self, delay: Duration, frame: FakeFrame) {
        let attached = Arc::new(AttachedFrame {
            frame,
            attach_at: self.started.elapsed() + delay,
            started: self.started,
            log: Arc::clone(&self.log),
        });
        if let Ok(mut frames) = self.frames.lock() {
            frames.push(attached);
        }
    }

    pub fn fail_frame_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    pub fn refuse_navigation(&self, reason: &str) {
        if let Ok(mut err) = self.goto_error.lock() {
            *err = Some(reason.to_string());
        }
    }

    pub fn actions(&self) -> Vec<Action> {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn fills(&self) -> Vec<(String, String)> {
        self.actions()
            .into_iter()
            .filter_map(|a| match a {
                Action::Fill { element, value, .. } => Some((element, value)),
                _ => None,
            })
            .collect()
    }

    /// Elements tagged by `find_visible`, in order
    pub fn marks(&self) -> Vec<String> {
        self.actions()
            .into_iter()
            .filter_map(|a| match a {
                Action::Mark { element, .. } => Some(element),
                _ => None,
            })
            .collect()
    }

    pub fn clicks(&self) -> Vec<String> {
        self.actions()
            .into_iter()
            .filter_map(|a| match a {
                Action::Click { element, .. } => Some(element),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Page for FakePage {
    async fn frames(&self) -> Result<Vec<Arc<dyn Frame>>> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(Error::transport("frame listing failed"));
        }
        let now = self.started.elapsed();
        let frames = self
            .frames
            .lock()
            .map_err(|_| Error::transport("fake page poisoned"))?;
        Ok(frames
            .iter()
            .filter(|f| now >= f.attach_at)
            .map(|f| Arc::clone(f) as Arc<dyn Frame>)
            .collect())
    }

    async fn goto(&self, url: &str, _timeout: Duration) -> Result<()> {
        if let Ok(mut log) = self.log.lock() {
            log.push(Action::Navigate(url.to_string()));
        }
        let refused = self.goto_error.lock().ok().and_then(|e| e.clone());
        match refused {
            Some(reason) => Err(Error::navigation(url, reason)),
            None => Ok(()),
        }
    }
}
