//! Frame snapshots
//!
//! Frames attach and detach while the portal renders, so a [`FrameSet`] is a
//! point-in-time view. Take a fresh one on every probe; never cache it across
//! poll ticks.

use std::sync::Arc;

use crate::driver::{Frame, Page};
use crate::error::Result;

/// Frames attached to a page at one instant, main document first
#[derive(Clone)]
pub struct FrameSet {
    frames: Vec<Arc<dyn Frame>>,
}

impl FrameSet {
    /// Snapshot the frames of `page`
    pub async fn snapshot(page: &dyn Page) -> Result<Self> {
        let frames = page.frames().await?;
        tracing::trace!("Frame snapshot: {} frame(s)", frames.len());
        Ok(Self { frames })
    }

    /// Snapshot, treating a failed frame listing as an empty page.
    ///
    /// Used inside polls where a listing error during navigation just means
    /// "not yet".
    pub async fn snapshot_or_empty(page: &dyn Page) -> Self {
        match Self::snapshot(page).await {
            Ok(set) => set,
            Err(e) => {
                tracing::debug!("Frame listing failed, treating as empty: {}", e);
                Self { frames: Vec::new() }
            }
        }
    }

    /// Frames in traversal order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Frame>> {
        self.frames.iter()
    }

    /// The main document, if the page has one attached
    pub fn main(&self) -> Option<&Arc<dyn Frame>> {
        self.frames.first()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl From<Vec<Arc<dyn Frame>>> for FrameSet {
    fn from(frames: Vec<Arc<dyn Frame>>) -> Self {
        Self { frames }
    }
}

impl std::fmt::Debug for FrameSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.frames.iter().map(|fr| (fr.id(), fr.url())))
            .finish()
    }
}
