//! Source manifests
//!
//! Each installed source is a directory containing a `source.json` manifest
//! and the entry script it points at. The manifest is the only part of a
//! source the host persists; loaded state and execution contexts are rebuilt
//! lazily after a restart.

use crate::core::error::{Result, SourceError};
use crate::source::model::SourceId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Manifest file name inside a source directory
pub const MANIFEST_FILE: &str = "source.json";

/// Optional operations a source may declare beyond the mandatory baseline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
    /// Keyword search with pagination
    Search,
    /// "View more" browse listings
    ViewMore,
    /// Download target resolution
    Download,
    /// Search filter descriptors
    Filters,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Search => write!(f, "search"),
            Capability::ViewMore => write!(f, "viewMore"),
            Capability::Download => write!(f, "download"),
            Capability::Filters => write!(f, "filters"),
        }
    }
}

/// Installed metadata describing one source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceManifest {
    /// Unique identifier, immutable once installed
    pub source_id: SourceId,

    /// Display name
    pub name: String,

    /// Source version (semantic versioning)
    pub version: String,

    /// Entry script, relative to the source directory
    pub entry_location: String,

    /// Declared optional operations
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,
}

impl SourceManifest {
    /// Check whether the manifest declares a capability
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Validate identity fields and version syntax
    pub fn validate(&self) -> Result<()> {
        if self.source_id.trim().is_empty() {
            return Err(SourceError::ContractViolation(
                "manifest source_id cannot be empty".to_string(),
            ));
        }
        if self.name.trim().is_empty() {
            return Err(SourceError::ContractViolation(
                "manifest name cannot be empty".to_string(),
            ));
        }
        if self.entry_location.trim().is_empty() {
            return Err(SourceError::ContractViolation(
                "manifest entry_location cannot be empty".to_string(),
            ));
        }
        semver::Version::parse(&self.version).map_err(|e| {
            SourceError::ContractViolation(format!(
                "manifest version '{}' is not valid semver: {}",
                self.version, e
            ))
        })?;
        Ok(())
    }
}

/// A manifest together with the directory it was loaded from
#[derive(Debug, Clone)]
pub struct InstalledSource {
    pub manifest: SourceManifest,
    pub dir: PathBuf,
}

impl InstalledSource {
    /// Resolved path of the entry script
    pub fn entry_path(&self) -> PathBuf {
        self.dir.join(&self.manifest.entry_location)
    }
}

/// Load and validate a manifest from a source directory
///
/// Fails if `source.json` is missing or malformed, or if the entry script it
/// names does not exist.
pub fn load_manifest(dir: &Path) -> Result<InstalledSource> {
    let manifest_path = dir.join(MANIFEST_FILE);
    if !manifest_path.exists() {
        return Err(SourceError::ContractViolation(format!(
            "{} not found in {}",
            MANIFEST_FILE,
            dir.display()
        )));
    }

    let content = std::fs::read_to_string(&manifest_path)?;
    let manifest: SourceManifest = serde_json::from_str(&content).map_err(|e| {
        SourceError::ContractViolation(format!(
            "invalid manifest {}: {}",
            manifest_path.display(),
            e
        ))
    })?;
    manifest.validate()?;

    let installed = InstalledSource {
        manifest,
        dir: dir.to_path_buf(),
    };

    if !installed.entry_path().exists() {
        return Err(SourceError::ContractViolation(format!(
            "entry script not found: {}",
            installed.entry_path().display()
        )));
    }

    Ok(installed)
}

/// Discover installed sources by scanning a directory
///
/// Each immediate subdirectory holding a `source.json` is a candidate.
/// Invalid entries are logged and skipped rather than failing the scan.
pub fn discover(sources_dir: &Path) -> Result<Vec<InstalledSource>> {
    if !sources_dir.exists() {
        std::fs::create_dir_all(sources_dir)?;
    }

    let mut discovered = Vec::new();
    for entry in std::fs::read_dir(sources_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() || !path.join(MANIFEST_FILE).exists() {
            continue;
        }
        match load_manifest(&path) {
            Ok(installed) => discovered.push(installed),
            Err(e) => {
                warn!(dir = %path.display(), error = %e, "Skipping invalid source directory");
            }
        }
    }

    // Deterministic order for discovery logs and CLI output
    discovered.sort_by(|a, b| a.manifest.source_id.cmp(&b.manifest.source_id));
    Ok(discovered)
}
