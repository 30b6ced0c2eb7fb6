//! Source registry
//!
//! Single owner of installed-source state. Every host request flows through
//! the registry: it resolves the source, gates the operation on declared
//! capabilities, loads the source on first use, and only then dispatches to
//! the bridge. Callers never reach a bridge directly, so the loaded-state
//! check lives in exactly one place.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::core::config::SourcesConfig;
use crate::core::error::{ErrorReport, Result, SourceError};
use crate::source::bridge::SourceBridge;
use crate::source::contract::{Operation, Source};
use crate::source::manifest::{self, Capability, InstalledSource, SourceManifest};
use crate::source::model::{
    BookDetails, DownloadInfo, Page, PageCursor, PartialBook, SearchFilter, SearchRequest,
    SourceId,
};
use serde::{Deserialize, Serialize};

/// One registered source
struct SourceEntry {
    installed: InstalledSource,
    /// Present only while loaded; in-flight calls keep their own clone, so
    /// dropping this never interrupts them.
    bridge: Option<Arc<SourceBridge>>,
    /// Serializes load attempts so concurrent first calls cannot spawn two
    /// execution contexts for the same source.
    load_lock: Arc<Mutex<()>>,
    last_error: Option<ErrorReport>,
    total_calls: u64,
    failed_calls: u64,
}

impl SourceEntry {
    fn new(installed: InstalledSource) -> Self {
        Self {
            installed,
            bridge: None,
            load_lock: Arc::new(Mutex::new(())),
            last_error: None,
            total_calls: 0,
            failed_calls: 0,
        }
    }
}

/// Snapshot of one source's registration, for status listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceStatus {
    pub source_id: SourceId,
    pub name: String,
    pub version: String,
    pub capabilities: Vec<Capability>,
    pub loaded: bool,
    pub total_calls: u64,
    pub failed_calls: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorReport>,
}

/// Registry of installed sources
pub struct SourceRegistry {
    config: SourcesConfig,
    entries: Arc<RwLock<HashMap<SourceId, SourceEntry>>>,
}

impl SourceRegistry {
    pub fn new(config: SourcesConfig) -> Self {
        Self {
            config,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Scan the sources directory and register everything valid in it
    ///
    /// Registration is cheap: nothing is loaded until first use. Sources
    /// already registered keep their state.
    pub async fn discover(&self) -> Result<Vec<SourceManifest>> {
        info!(dir = %self.config.sources_dir.display(), "Discovering sources");
        let discovered = manifest::discover(&self.config.sources_dir)?;

        let mut entries = self.entries.write().await;
        let mut manifests = Vec::with_capacity(discovered.len());
        for installed in discovered {
            manifests.push(installed.manifest.clone());
            entries
                .entry(installed.manifest.source_id.clone())
                .or_insert_with(|| SourceEntry::new(installed));
        }
        Ok(manifests)
    }

    /// Install a source from a package directory
    ///
    /// Copies the directory into the sources dir under the manifest's
    /// source id and registers it. Re-installing an existing id replaces its
    /// files and resets its state.
    pub async fn install_source(&self, package_dir: &Path) -> Result<SourceManifest> {
        let candidate = manifest::load_manifest(package_dir)?;
        let source_id = candidate.manifest.source_id.clone();
        let dest = self.config.sources_dir.join(&source_id);

        // Unload first so a replaced script cannot race a live worker.
        self.unload_entry(&source_id).await;

        if dest.exists() {
            std::fs::remove_dir_all(&dest)?;
        }
        copy_dir(package_dir, &dest)?;
        let installed = manifest::load_manifest(&dest)?;

        info!(source_id = %source_id, version = %installed.manifest.version, "Installed source");

        let manifest = installed.manifest.clone();
        let mut entries = self.entries.write().await;
        entries.insert(source_id, SourceEntry::new(installed));
        Ok(manifest)
    }

    /// Remove a source: forget it and delete its files
    ///
    /// In-flight calls hold their own bridge handle and run to completion;
    /// new calls fail with `UnknownSource`.
    pub async fn remove_source(&self, source_id: &str) -> Result<()> {
        let entry = {
            let mut entries = self.entries.write().await;
            entries
                .remove(source_id)
                .ok_or_else(|| SourceError::UnknownSource(source_id.to_string()))?
        };
        drop(entry.bridge);

        let dir = &entry.installed.dir;
        if dir.starts_with(&self.config.sources_dir) && dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        info!(source_id, "Removed source");
        Ok(())
    }

    /// Status of every registered source, ordered by id
    pub async fn list(&self) -> Vec<SourceStatus> {
        let entries = self.entries.read().await;
        let mut statuses: Vec<SourceStatus> = entries
            .values()
            .map(|entry| SourceStatus {
                source_id: entry.installed.manifest.source_id.clone(),
                name: entry.installed.manifest.name.clone(),
                version: entry.installed.manifest.version.clone(),
                capabilities: entry.installed.manifest.capabilities.iter().copied().collect(),
                loaded: entry.bridge.is_some(),
                total_calls: entry.total_calls,
                failed_calls: entry.failed_calls,
                last_error: entry.last_error.clone(),
            })
            .collect();
        statuses.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        statuses
    }

    pub async fn search(
        &self,
        source_id: &str,
        request: SearchRequest,
    ) -> Result<Page<PartialBook>> {
        let bridge = self.prepare(source_id, Operation::Search).await?;
        self.record(source_id, bridge.search(request).await).await
    }

    pub async fn get_book_details(&self, source_id: &str, book_id: &str) -> Result<BookDetails> {
        let bridge = self.prepare(source_id, Operation::GetDetails).await?;
        self.record(source_id, bridge.get_book_details(book_id).await)
            .await
    }

    pub async fn get_view_more(
        &self,
        source_id: &str,
        view_more_id: &str,
        cursor: Option<PageCursor>,
    ) -> Result<Page<PartialBook>> {
        let bridge = self.prepare(source_id, Operation::GetViewMore).await?;
        self.record(source_id, bridge.get_view_more(view_more_id, cursor).await)
            .await
    }

    pub async fn get_download_info(&self, source_id: &str, book_id: &str) -> Result<DownloadInfo> {
        let bridge = self.prepare(source_id, Operation::GetDownloadInfo).await?;
        self.record(source_id, bridge.get_download_info(book_id).await)
            .await
    }

    pub async fn get_search_filters(&self, source_id: &str) -> Result<Vec<SearchFilter>> {
        let bridge = self.prepare(source_id, Operation::GetSearchFilters).await?;
        self.record(source_id, bridge.get_search_filters().await)
            .await
    }

    /// Resolve, gate, and load: the single path every operation takes
    ///
    /// The capability gate runs before any loading, so an undeclared
    /// operation is rejected without ever executing script code.
    async fn prepare(&self, source_id: &str, op: Operation) -> Result<Arc<SourceBridge>> {
        let existing = {
            let entries = self.entries.read().await;
            let entry = entries
                .get(source_id)
                .ok_or_else(|| SourceError::UnknownSource(source_id.to_string()))?;

            if let Some(cap) = op.required_capability() {
                if !entry.installed.manifest.has_capability(cap) {
                    return Err(SourceError::CapabilityUnsupported(format!(
                        "{} does not declare '{}'",
                        source_id, cap
                    )));
                }
            }
            entry.bridge.clone()
        };

        match existing {
            Some(bridge) => Ok(bridge),
            None => match self.load(source_id).await {
                Ok(bridge) => Ok(bridge),
                Err(e) => {
                    self.record_failure(source_id, &e).await;
                    Err(e)
                }
            },
        }
    }

    /// Spawn and initialize a bridge, then publish it
    ///
    /// Single-flight: concurrent first calls queue on the entry's load lock
    /// and all reuse the one bridge the winner produced, so exactly one
    /// execution context runs initialize. The registry-wide lock is never
    /// held across the spawn.
    async fn load(&self, source_id: &str) -> Result<Arc<SourceBridge>> {
        let (installed, load_lock) = {
            let entries = self.entries.read().await;
            let entry = entries
                .get(source_id)
                .ok_or_else(|| SourceError::UnknownSource(source_id.to_string()))?;
            (entry.installed.clone(), Arc::clone(&entry.load_lock))
        };

        let _guard = load_lock.lock().await;

        // A queued caller finds the winner's bridge here.
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(source_id) {
                if let Some(bridge) = &entry.bridge {
                    return Ok(Arc::clone(bridge));
                }
            }
        }

        let bridge = Arc::new(SourceBridge::spawn(&installed, &self.config).await?);
        bridge.initialize().await?;

        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(source_id)
            .ok_or_else(|| SourceError::UnknownSource(source_id.to_string()))?;
        entry.bridge = Some(Arc::clone(&bridge));
        entry.last_error = None;
        info!(source_id, "Source loaded");
        Ok(bridge)
    }

    /// Update per-source counters and remember the most recent failure
    async fn record<T>(&self, source_id: &str, result: Result<T>) -> Result<T> {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(source_id) {
            entry.total_calls += 1;
            if let Err(e) = &result {
                entry.failed_calls += 1;
                entry.last_error = Some(ErrorReport::new(e));
            }
        }
        result
    }

    async fn record_failure(&self, source_id: &str, error: &SourceError) {
        warn!(source_id, error = %error, "Source failed to load");
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(source_id) {
            // A failed load still counts as an attempted call.
            entry.total_calls += 1;
            entry.failed_calls += 1;
            entry.last_error = Some(ErrorReport::new(error));
        }
    }

    async fn unload_entry(&self, source_id: &str) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(source_id) {
            entry.bridge = None;
        }
    }
}

/// Shallow-plus-subdirs copy of a source package
fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    std::fs::create_dir_all(to)?;
    for item in std::fs::read_dir(from)? {
        let item = item?;
        let dest = to.join(item.file_name());
        if item.path().is_dir() {
            copy_dir(&item.path(), &dest)?;
        } else {
            std::fs::copy(item.path(), &dest)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::manifest::MANIFEST_FILE;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const SCRIPT: &str = r#"
        function initialize() {}
        function getBookDetails(args) {
            return { info: { id: args.bookId, title: "Book " + args.bookId } };
        }
        function search(args) {
            return { items: [{ id: "1", title: "Hit" }], nextCursor: null };
        }
    "#;

    fn write_package(dir: &Path, id: &str, capabilities: &[&str], script: &str) -> PathBuf {
        let pkg = dir.join(format!("{}-pkg", id));
        std::fs::create_dir_all(&pkg).unwrap();
        let manifest = serde_json::json!({
            "source_id": id,
            "name": "Test Source",
            "version": "1.0.0",
            "entry_location": "main.js",
            "capabilities": capabilities,
        });
        std::fs::write(pkg.join(MANIFEST_FILE), manifest.to_string()).unwrap();
        std::fs::write(pkg.join("main.js"), script).unwrap();
        pkg
    }

    fn registry(tmp: &TempDir) -> SourceRegistry {
        SourceRegistry::new(SourcesConfig {
            sources_dir: tmp.path().join("sources"),
            call_timeout: 5,
            channel_capacity: 8,
        })
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_source() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);

        let err = reg.get_book_details("nope", "1").await.unwrap_err();
        assert!(matches!(err, SourceError::UnknownSource(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_install_and_call() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        let pkg = write_package(tmp.path(), "lib", &["search"], SCRIPT);

        let manifest = reg.install_source(&pkg).await.unwrap();
        assert_eq!(manifest.source_id, "lib");

        let details = reg.get_book_details("lib", "9").await.unwrap();
        assert_eq!(details.info.title, "Book 9");

        let page = reg.search("lib", SearchRequest::new("x")).await.unwrap();
        assert_eq!(page.items[0].id, "1");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_capability_gate_blocks_before_load() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        // Script has no download export; the gate must reject before the
        // script could even be loaded and complain about it.
        let pkg = write_package(tmp.path(), "lib", &[], SCRIPT);
        reg.install_source(&pkg).await.unwrap();

        let err = reg.get_download_info("lib", "1").await.unwrap_err();
        assert!(matches!(err, SourceError::CapabilityUnsupported(_)));

        let statuses = reg.list().await;
        assert!(!statuses[0].loaded);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_discover_registers_unloaded() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        let pkg = write_package(tmp.path(), "lib", &["search"], SCRIPT);
        reg.install_source(&pkg).await.unwrap();

        // A second registry over the same directory sees it cold.
        let reg2 = registry(&tmp);
        let manifests = reg2.discover().await.unwrap();
        assert_eq!(manifests.len(), 1);
        let statuses = reg2.list().await;
        assert!(!statuses[0].loaded);

        reg2.get_book_details("lib", "1").await.unwrap();
        let statuses = reg2.list().await;
        assert!(statuses[0].loaded);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_remove_source() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        let pkg = write_package(tmp.path(), "lib", &[], SCRIPT);
        reg.install_source(&pkg).await.unwrap();
        reg.get_book_details("lib", "1").await.unwrap();

        reg.remove_source("lib").await.unwrap();
        let err = reg.get_book_details("lib", "1").await.unwrap_err();
        assert!(matches!(err, SourceError::UnknownSource(_)));
        assert!(!tmp.path().join("sources").join("lib").exists());

        let err = reg.remove_source("lib").await.unwrap_err();
        assert!(matches!(err, SourceError::UnknownSource(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_load_failure_recorded() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        let pkg = write_package(tmp.path(), "bad", &[], "function nothing() {}");
        reg.install_source(&pkg).await.unwrap();

        let err = reg.get_book_details("bad", "1").await.unwrap_err();
        assert!(matches!(err, SourceError::ContractViolation(_)));

        let statuses = reg.list().await;
        let status = &statuses[0];
        assert!(!status.loaded);
        assert_eq!(status.failed_calls, 1);
        assert_eq!(status.total_calls, 1);
        assert_eq!(
            status.last_error.as_ref().map(|r| r.kind.as_str()),
            Some("ContractViolation")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_first_loads_are_single_flight() {
        let tmp = TempDir::new().unwrap();
        let reg = Arc::new(registry(&tmp));
        // initialize burns a visible amount of time before failing, so two
        // overlapping attempts would finish together while serialized ones
        // finish back to back.
        let script = r#"
            function initialize() {
                const end = Date.now() + 300;
                while (Date.now() < end) {}
                throw { message: "refuses to start" };
            }
            function getBookDetails(args) {
                return { info: { id: args.bookId, title: "T" } };
            }
        "#;
        let pkg = write_package(tmp.path(), "lib", &[], script);
        reg.install_source(&pkg).await.unwrap();

        let start = std::time::Instant::now();
        let (a, b) = tokio::join!(
            {
                let reg = Arc::clone(&reg);
                async move { reg.get_book_details("lib", "1").await }
            },
            {
                let reg = Arc::clone(&reg);
                async move { reg.get_book_details("lib", "2").await }
            }
        );
        assert!(matches!(a, Err(SourceError::InitializationFailed(_))));
        assert!(matches!(b, Err(SourceError::InitializationFailed(_))));

        // Both attempts ran initialize (no cached failure), strictly one
        // after the other.
        assert!(
            start.elapsed() >= std::time::Duration::from_millis(550),
            "load attempts overlapped: {:?}",
            start.elapsed()
        );

        let statuses = reg.list().await;
        assert_eq!(statuses[0].total_calls, 2);
        assert_eq!(statuses[0].failed_calls, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stats_count_calls() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        let pkg = write_package(tmp.path(), "lib", &["search"], SCRIPT);
        reg.install_source(&pkg).await.unwrap();

        reg.get_book_details("lib", "1").await.unwrap();
        reg.search("lib", SearchRequest::new("x")).await.unwrap();

        let statuses = reg.list().await;
        assert_eq!(statuses[0].total_calls, 2);
        assert_eq!(statuses[0].failed_calls, 0);
    }
}
