//! Source contract
//!
//! The fixed set of operations every source must support, expressed two
//! ways: the [`Source`] trait the registry calls against, and the
//! [`Operation`] enum that names each operation's script export and the
//! capability gating it.

use crate::core::error::Result;
use crate::source::manifest::Capability;
use crate::source::model::{
    BookDetails, DownloadInfo, Page, PageCursor, PartialBook, SearchFilter, SearchRequest,
};
use async_trait::async_trait;

/// The operations a source supports, each as an asynchronous call
///
/// Implemented by the bridge for script-backed sources; tests provide their
/// own implementations.
#[async_trait]
pub trait Source: Send + Sync {
    /// One-time setup (e.g. fetching source configuration)
    ///
    /// Idempotent: calling it on an already-initialized source returns
    /// immediately without re-executing side effects.
    async fn initialize(&self) -> Result<()>;

    /// Keyword search; `next_cursor == None` on the returned page means no
    /// further pages exist
    async fn search(&self, request: SearchRequest) -> Result<Page<PartialBook>>;

    /// Full record for one book; fails with `NotFound` for unknown ids
    async fn get_book_details(&self, book_id: &str) -> Result<BookDetails>;

    /// Continue a "view more" browse listing (capability `viewMore`)
    async fn get_view_more(
        &self,
        view_more_id: &str,
        cursor: Option<PageCursor>,
    ) -> Result<Page<PartialBook>>;

    /// Resolve the download target for a book (capability `download`)
    async fn get_download_info(&self, book_id: &str) -> Result<DownloadInfo>;

    /// Filter descriptors for building search requests (capability `filters`)
    async fn get_search_filters(&self) -> Result<Vec<SearchFilter>>;
}

/// Identifies one contract operation for dispatch and capability checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Initialize,
    Search,
    GetDetails,
    GetViewMore,
    GetDownloadInfo,
    GetSearchFilters,
}

impl Operation {
    /// The fixed export name the loaded script must expose
    pub fn export_name(&self) -> &'static str {
        match self {
            Operation::Initialize => "initialize",
            Operation::Search => "search",
            Operation::GetDetails => "getBookDetails",
            Operation::GetViewMore => "getViewMoreItems",
            Operation::GetDownloadInfo => "getDownloadInfo",
            Operation::GetSearchFilters => "getSearchFilters",
        }
    }

    /// The capability the manifest must declare for this operation
    ///
    /// `None` for the mandatory baseline (`initialize`, `getBookDetails`).
    pub fn required_capability(&self) -> Option<Capability> {
        match self {
            Operation::Initialize | Operation::GetDetails => None,
            Operation::Search => Some(Capability::Search),
            Operation::GetViewMore => Some(Capability::ViewMore),
            Operation::GetDownloadInfo => Some(Capability::Download),
            Operation::GetSearchFilters => Some(Capability::Filters),
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.export_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_names_are_fixed() {
        assert_eq!(Operation::Initialize.export_name(), "initialize");
        assert_eq!(Operation::Search.export_name(), "search");
        assert_eq!(Operation::GetDetails.export_name(), "getBookDetails");
        assert_eq!(Operation::GetViewMore.export_name(), "getViewMoreItems");
        assert_eq!(Operation::GetDownloadInfo.export_name(), "getDownloadInfo");
        assert_eq!(Operation::GetSearchFilters.export_name(), "getSearchFilters");
    }

    #[test]
    fn test_capability_gating() {
        assert_eq!(Operation::Initialize.required_capability(), None);
        assert_eq!(Operation::GetDetails.required_capability(), None);
        assert_eq!(
            Operation::Search.required_capability(),
            Some(Capability::Search)
        );
        assert_eq!(
            Operation::GetViewMore.required_capability(),
            Some(Capability::ViewMore)
        );
        assert_eq!(
            Operation::GetDownloadInfo.required_capability(),
            Some(Capability::Download)
        );
        assert_eq!(
            Operation::GetSearchFilters.required_capability(),
            Some(Capability::Filters)
        );
    }
}
