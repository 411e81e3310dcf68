//! Control resolution across frames
//!
//! Strategies are tried tier by tier: a tier sweeps every frame before the
//! next tier starts. That makes a label match anywhere beat a CSS match in the
//! main document, and frame order (main first) the tie-break inside a tier.

use std::sync::Arc;
use std::time::Duration;

use crate::controls::ControlSpec;
use crate::driver::{ElementId, Frame, Locator, Page};
use crate::error::{Error, Result};
use crate::frames::FrameSet;

/// Probe budget for a field lookup in one frame
pub const FIELD_PROBE: Duration = Duration::from_millis(300);

/// Probe budget for a button lookup in one frame
pub const BUTTON_PROBE: Duration = Duration::from_millis(500);

/// A control found in a specific frame.
///
/// Valid for the current document only. It is deliberately neither `Clone`
/// nor serializable: resolve again after any navigation.
pub struct ResolvedControl {
    frame: Arc<dyn Frame>,
    element: ElementId,
    matched_by: String,
}

impl ResolvedControl {
    /// Frame the control lives in
    pub fn frame_id(&self) -> &str {
        self.frame.id()
    }

    /// The locator that found it, for logs
    pub fn matched_by(&self) -> &str {
        &self.matched_by
    }

    /// Write `value` into the control
    pub async fn fill(&self, value: &str) -> Result<()> {
        self.frame.fill(&self.element, value).await
    }

    /// Activate the control
    pub async fn click(&self) -> Result<()> {
        self.frame.click(&self.element).await
    }
}

impl std::fmt::Debug for ResolvedControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedControl")
            .field("frame", &self.frame.id())
            .field("element", &self.element)
            .field("matched_by", &self.matched_by)
            .finish()
    }
}

/// Finds controls from a [`ControlSpec`] without knowing which frame holds them
#[derive(Debug, Clone, Copy)]
pub struct ControlResolver {
    field_probe: Duration,
    button_probe: Duration,
}

impl Default for ControlResolver {
    fn default() -> Self {
        Self::new(FIELD_PROBE, BUTTON_PROBE)
    }
}

impl ControlResolver {
    pub fn new(field_probe: Duration, button_probe: Duration) -> Self {
        Self {
            field_probe,
            button_probe,
        }
    }

    /// Resolve a form field: label in any frame, then each fallback selector in any frame
    pub async fn resolve(&self, page: &dyn Page, spec: &ControlSpec) -> Option<ResolvedControl> {
        self.first_match(page, &spec.field_locators(), self.field_probe)
            .await
    }

    /// Resolve a button: role + name, then contained text, then fallback selectors
    pub async fn resolve_button(
        &self,
        page: &dyn Page,
        spec: &ControlSpec,
    ) -> Option<ResolvedControl> {
        self.first_match(page, &spec.button_locators(), self.button_probe)
            .await
    }

    /// Whether any locator is visible anywhere right now.
    ///
    /// Read-only: nothing is tagged in the page, so it is safe to poll.
    pub async fn any_visible(&self, page: &dyn Page, locators: &[Locator]) -> bool {
        for locator in locators {
            let frames = FrameSet::snapshot_or_empty(page).await;
            for frame in frames.iter() {
                let seen = match tokio::time::timeout(
                    self.field_probe,
                    frame.is_visible(locator, self.field_probe),
                )
                .await
                {
                    Ok(Ok(seen)) => seen,
                    Ok(Err(e)) => {
                        log_probe_error(frame.as_ref(), locator, &e);
                        false
                    }
                    Err(_) => false,
                };
                if seen {
                    return true;
                }
            }
        }
        false
    }

    async fn first_match(
        &self,
        page: &dyn Page,
        locators: &[Locator],
        probe: Duration,
    ) -> Option<ResolvedControl> {
        for locator in locators {
            // Re-read per tier: frames can attach while earlier tiers probe
            let frames = FrameSet::snapshot_or_empty(page).await;
            if let Some(found) = probe_frames(&frames, locator, probe).await {
                return Some(found);
            }
        }
        None
    }
}

/// First frame, in set order, with a visible match for `locator`
pub(crate) async fn probe_frames(
    frames: &FrameSet,
    locator: &Locator,
    probe: Duration,
) -> Option<ResolvedControl> {
    for frame in frames.iter() {
        let found = match tokio::time::timeout(probe, frame.find_visible(locator, probe)).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                log_probe_error(frame.as_ref(), locator, &e);
                None
            }
            Err(_) => None,
        };
        if let Some(element) = found {
            tracing::debug!(
                "Resolved {} in frame {} ({})",
                locator.describe(),
                frame.id(),
                frame.url()
            );
            return Some(ResolvedControl {
                frame: Arc::clone(frame),
                element,
                matched_by: locator.describe(),
            });
        }
    }
    None
}

fn log_probe_error(frame: &dyn Frame, locator: &Locator, err: &Error) {
    if err.is_detached() {
        tracing::debug!("Frame {} detached during probe {}", frame.id(), locator.describe());
    } else {
        tracing::debug!("Probe {} failed in frame {}: {}", locator.describe(), frame.id(), err);
    }
}
