//! Catalog record model
//!
//! The normalized data shapes shared by the bridge, registry, and everything
//! above them. Scripts return loosely-shaped JSON; the bridge normalizes it
//! into these types before anything else sees it.
//!
//! A book's `id` is unique only within its source's namespace; global
//! identity is always the `(source_id, id)` pair.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique identifier for an installed source
pub type SourceId = String;

/// Opaque pagination cursor
///
/// Produced and consumed only by the source that issued it. The host stores
/// and forwards cursors but never inspects them; there is deliberately no
/// accessor that parses the contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageCursor(String);

impl PageCursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Raw token, for persisting or handing back to the owning source
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PageCursor {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl From<&str> for PageCursor {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

/// Minimal book record returned by search and browse listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialBook {
    /// Identifier within the owning source's namespace; stable across
    /// repeated searches for the same source version, and used as the
    /// detail-fetch key.
    pub id: String,

    /// Book title
    pub title: String,

    /// Author name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    /// Cover image URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

impl PartialBook {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            author: None,
            image_url: None,
        }
    }
}

/// Reference to one chapter or volume within a book
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterRef {
    /// Identifier within the owning source's namespace
    pub id: String,

    /// Chapter or volume title
    pub title: String,

    /// Position in reading order (0-indexed)
    pub index: u32,
}

/// Full book record produced by a detail fetch
///
/// Always carries the partial entry (`info`) so callers can degrade
/// gracefully when enrichment fields are absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookDetails {
    /// The partial entry this detail record enriches
    pub info: PartialBook,

    /// Long-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Tags or categories
    #[serde(default)]
    pub tags: Vec<String>,

    /// Chapters or volumes, in reading order
    #[serde(default)]
    pub chapters: Vec<ChapterRef>,
}

/// A search request against one source
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Free-text query
    pub query: String,

    /// Filter id -> selected value, drawn from the source's declared filters
    #[serde(default)]
    pub filters: HashMap<String, String>,

    /// Resume point; `None` requests the first page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<PageCursor>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            filters: HashMap::new(),
            page: None,
        }
    }

    pub fn with_page(mut self, page: PageCursor) -> Self {
        self.page = Some(page);
        self
    }
}

/// One page of listing results
///
/// `next_cursor == None` signals that no further pages exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<PageCursor>,
}

impl<T> Page<T> {
    pub fn is_last(&self) -> bool {
        self.next_cursor.is_none()
    }
}

/// Everything the external download manager needs to act on a book
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadInfo {
    /// Download URI
    pub url: String,

    /// File format hint (e.g. "epub", "pdf")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,

    /// Chapters or volumes covered by the download, in reading order
    #[serde(default)]
    pub chapters: Vec<ChapterRef>,
}

/// A filter descriptor a source exposes for building search requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilter {
    /// Filter id, used as the key in `SearchRequest::filters`
    pub id: String,

    /// Human-readable label
    pub label: String,

    /// Allowed values; empty means free-form
    #[serde(default)]
    pub values: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_is_opaque_round_trip() {
        let cursor = PageCursor::new("offset=40&seed=7");
        let json = serde_json::to_string(&cursor).unwrap();
        // Transparent serialization: just the token string.
        assert_eq!(json, "\"offset=40&seed=7\"");
        let back: PageCursor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cursor);
    }

    #[test]
    fn test_partial_book_optional_fields_omitted() {
        let book = PartialBook::new("42", "Foo Book");
        let json = serde_json::to_value(&book).unwrap();
        assert!(json.get("author").is_none());
        assert!(json.get("image_url").is_none());
    }

    #[test]
    fn test_page_is_last() {
        let page: Page<PartialBook> = Page {
            items: vec![],
            next_cursor: None,
        };
        assert!(page.is_last());

        let page = Page {
            items: vec![PartialBook::new("1", "A")],
            next_cursor: Some(PageCursor::new("p2")),
        };
        assert!(!page.is_last());
    }

    #[test]
    fn test_search_request_defaults() {
        let req: SearchRequest = serde_json::from_str(r#"{"query":"foo"}"#).unwrap();
        assert_eq!(req.query, "foo");
        assert!(req.filters.is_empty());
        assert!(req.page.is_none());
    }

    #[test]
    fn test_book_details_degrades_to_info() {
        let details = BookDetails {
            info: PartialBook::new("9", "Bare"),
            description: None,
            tags: vec![],
            chapters: vec![],
        };
        let json = serde_json::to_string(&details).unwrap();
        let back: BookDetails = serde_json::from_str(&json).unwrap();
        assert_eq!(back.info.title, "Bare");
        assert!(back.description.is_none());
    }
}
