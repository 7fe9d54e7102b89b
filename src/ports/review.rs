//! Review port: Trait for the human-review queue.
//!
//! Abstained decisions are handed to a `ReviewSink` from a background writer
//! thread, never from the decision path itself. A failing sink is logged and
//! counted, never surfaced to the caller.

use crate::domain::ReviewCase;

/// A page of review cases with pagination metadata.
#[derive(Debug, Clone)]
pub struct ReviewPage {
    /// Cases in this page, newest first
    pub items: Vec<ReviewCase>,
    /// Total number of queued cases
    pub total_count: usize,
    pub offset: usize,
    pub limit: usize,
    pub has_more: bool,
}

impl ReviewPage {
    #[must_use]
    pub fn new(items: Vec<ReviewCase>, total_count: usize, offset: usize, limit: usize) -> Self {
        let has_more = offset.saturating_add(items.len()) < total_count;
        Self {
            items,
            total_count,
            offset,
            limit,
            has_more,
        }
    }

    /// Offset of the next page, if any.
    #[must_use]
    pub fn next_offset(&self) -> Option<usize> {
        self.has_more.then(|| self.offset.saturating_add(self.limit))
    }
}

/// Destination for abstained cases.
pub trait ReviewSink: Send + Sync {
    /// Error type for queue operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Enqueue a case.
    ///
    /// # Errors
    /// Returns error if the backend rejects the write.
    fn submit(&self, case: &ReviewCase) -> Result<(), Self::Error>;

    /// Most recent cases (up to `limit`), newest first.
    ///
    /// # Errors
    /// Returns error if the backend read fails.
    fn load_recent(&self, limit: usize) -> Result<Vec<ReviewCase>, Self::Error>;

    /// Cases with offset pagination, newest first.
    ///
    /// # Errors
    /// Returns error if the backend read fails.
    fn load_paginated(&self, offset: usize, limit: usize) -> Result<ReviewPage, Self::Error>;

    /// Number of queued cases.
    ///
    /// # Errors
    /// Returns error if the backend read fails.
    fn count(&self) -> Result<usize, Self::Error>;

    /// Remove a resolved case. Returns whether it existed.
    ///
    /// # Errors
    /// Returns error if the backend write fails.
    fn resolve(&self, id: &str) -> Result<bool, Self::Error>;
}

/// Sink that drops every case. Used when no review queue is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardReviews;

impl ReviewSink for DiscardReviews {
    type Error = std::convert::Infallible;

    fn submit(&self, _case: &ReviewCase) -> Result<(), Self::Error> {
        Ok(())
    }

    fn load_recent(&self, _limit: usize) -> Result<Vec<ReviewCase>, Self::Error> {
        Ok(Vec::new())
    }

    fn load_paginated(&self, offset: usize, limit: usize) -> Result<ReviewPage, Self::Error> {
        Ok(ReviewPage::new(Vec::new(), 0, offset, limit))
    }

    fn count(&self) -> Result<usize, Self::Error> {
        Ok(0)
    }

    fn resolve(&self, _id: &str) -> Result<bool, Self::Error> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_navigation() {
        let page = ReviewPage::new(Vec::new(), 25, 10, 10);
        assert!(page.has_more);
        assert_eq!(page.next_offset(), Some(20));

        let last = ReviewPage::new(Vec::new(), 0, 0, 10);
        assert_eq!(last.next_offset(), None);
    }

    #[test]
    fn test_page_offsets_saturate() {
        let far = ReviewPage::new(Vec::new(), 0, usize::MAX, 20);
        assert!(!far.has_more);
        assert_eq!(far.next_offset(), None);

        let wide = ReviewPage::new(Vec::new(), usize::MAX, usize::MAX - 5, usize::MAX);
        assert!(wide.has_more);
        assert_eq!(wide.next_offset(), Some(usize::MAX));
    }
}
