//! Result table scraping

use crate::driver::Page;
use crate::error::{Error, Result};
use crate::frames::FrameSet;
use crate::model::{Candidate, ResultSet};

/// Rows of the portal's result table
pub const DEFAULT_ROW_SELECTOR: &str = "table tbody tr";

/// Reads result rows out of whichever frame hosts the table
#[derive(Debug, Clone)]
pub struct ResultExtractor {
    row_selector: String,
}

impl Default for ResultExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_ROW_SELECTOR)
    }
}

impl ResultExtractor {
    pub fn new(row_selector: impl Into<String>) -> Self {
        Self {
            row_selector: row_selector.into(),
        }
    }

    pub fn row_selector(&self) -> &str {
        &self.row_selector
    }

    /// Whether any frame currently has at least one result row
    pub async fn has_rows(&self, page: &dyn Page) -> bool {
        let frames = FrameSet::snapshot_or_empty(page).await;
        for frame in frames.iter() {
            match frame.count(&self.row_selector).await {
                Ok(n) if n > 0 => return true,
                Ok(_) => {}
                Err(e) => tracing::debug!("Row count failed in frame {}: {}", frame.id(), e),
            }
        }
        false
    }

    /// Candidates from the first frame with a non-empty table.
    ///
    /// Rows are never merged across frames. No rows anywhere gives an empty
    /// list, unless some frame failed to answer: then the table may have been
    /// in that frame and the read is an [`Error::ExtractionFailed`].
    pub async fn extract(&self, frames: &FrameSet) -> Result<Vec<Candidate>> {
        let mut failure = None;
        for frame in frames.iter() {
            let rows = match frame.rows(&self.row_selector).await {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::debug!("Row read failed in frame {}: {}", frame.id(), e);
                    failure = Some(format!("frame {}: {}", frame.id(), e));
                    continue;
                }
            };
            if rows.is_empty() {
                continue;
            }
            tracing::debug!("Extracting {} row(s) from frame {}", rows.len(), frame.id());
            return Ok(rows.iter().map(|row| Candidate::from_row(row)).collect());
        }
        match failure {
            Some(reason) => Err(Error::ExtractionFailed(reason)),
            None => Ok(Vec::new()),
        }
    }

    /// Snapshot the page, extract, and aggregate
    pub async fn collect(&self, page: &dyn Page) -> Result<ResultSet> {
        let frames = FrameSet::snapshot(page)
            .await
            .map_err(|e| Error::ExtractionFailed(format!("frame listing: {}", e)))?;
        Ok(ResultSet::from_records(self.extract(&frames).await?))
    }
}
