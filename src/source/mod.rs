//! Source extension runtime
//!
//! Installed sources are script extensions that teach the host how to talk
//! to one book catalog each. This module holds the whole pipeline: manifest
//! discovery, the execution bridge that runs each script on its own worker
//! thread, the registry that owns loaded state, and the pagination
//! coordinator layered on top.

pub mod bridge;
pub mod contract;
pub mod engine;
pub mod manifest;
pub mod model;
pub mod paginate;
pub mod registry;

pub use bridge::{EngineFactory, SourceBridge};
pub use contract::{Operation, Source};
pub use engine::{DenoEngine, ScriptEngine, ScriptFailure};
pub use manifest::{discover, load_manifest, Capability, InstalledSource, SourceManifest};
pub use model::{
    BookDetails, ChapterRef, DownloadInfo, Page, PageCursor, PartialBook, SearchFilter,
    SearchRequest, SourceId,
};
pub use paginate::{Listing, Paginator};
pub use registry::{SourceRegistry, SourceStatus};
