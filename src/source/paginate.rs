//! Pagination coordinator
//!
//! Walks a paged listing (a search or a "view more" browse) against one
//! source, carrying the cursor between fetches so callers never touch it.
//! Cursors stay opaque end to end: whatever the source returned is what it
//! gets back on the next fetch.

use crate::core::error::{Result, SourceError};
use crate::source::model::{Page, PageCursor, PartialBook, SearchRequest, SourceId};
use crate::source::registry::SourceRegistry;

/// What is being paged through
#[derive(Debug, Clone)]
pub enum Listing {
    /// A keyword search; its embedded cursor is ignored, the paginator owns
    /// the cursor from here on
    Search(SearchRequest),
    /// A "view more" browse listing identified by the id the source handed
    /// out alongside its featured shelves
    ViewMore(String),
}

/// Cursor-carrying iterator over one listing
///
/// Not `Clone`: two paginators sharing a cursor position would double-fetch
/// pages. Start a second paginator for a second traversal.
pub struct Paginator<'a> {
    registry: &'a SourceRegistry,
    source_id: SourceId,
    listing: Listing,
    cursor: Option<PageCursor>,
    started: bool,
    exhausted: bool,
}

impl<'a> Paginator<'a> {
    pub fn new(registry: &'a SourceRegistry, source_id: impl Into<SourceId>, listing: Listing) -> Self {
        Self {
            registry,
            source_id: source_id.into(),
            listing,
            cursor: None,
            started: false,
            exhausted: false,
        }
    }

    /// Whether the listing has reported its last page
    pub fn exhausted(&self) -> bool {
        self.exhausted
    }

    /// Fetch the next page
    ///
    /// Once the source reports a final page, further calls fail with
    /// `NoMorePages` without reaching the source again. An empty final page
    /// is a normal outcome, not an error.
    ///
    /// A failed fetch leaves the position unchanged: the cursor only
    /// advances on success, so retrying after a transient failure resumes
    /// at the same page instead of restarting the listing.
    pub async fn next_page(&mut self) -> Result<Page<PartialBook>> {
        if self.exhausted {
            return Err(SourceError::NoMorePages(self.describe()));
        }

        let cursor = if self.started { self.cursor.clone() } else { None };
        let page = match &self.listing {
            Listing::Search(request) => {
                let mut request = request.clone();
                request.page = cursor;
                self.registry.search(&self.source_id, request).await?
            }
            Listing::ViewMore(view_more_id) => {
                self.registry
                    .get_view_more(&self.source_id, view_more_id, cursor)
                    .await?
            }
        };

        self.started = true;
        match &page.next_cursor {
            Some(next) => self.cursor = Some(next.clone()),
            None => {
                self.cursor = None;
                self.exhausted = true;
            }
        }
        Ok(page)
    }

    fn describe(&self) -> String {
        match &self.listing {
            Listing::Search(request) => format!("{}:search:{}", self.source_id, request.query),
            Listing::ViewMore(id) => format!("{}:viewMore:{}", self.source_id, id),
        }
    }
}
