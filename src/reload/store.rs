//! On-disk adapter version store.
//!
//! Layout under the state directory:
//! - `<provider>/versions/v<N>.adapter` — source blobs
//! - `<provider>/manifest.json` — version records and the current pointer
//! - `<provider>/pending_fix.json` — at most one pending fix per provider
//!
//! All writes go through a temp-file-plus-rename so readers never observe a
//! torn file.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

/// How a version came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionOrigin {
    /// Registered at startup from the built-in mapping.
    Initial,
    /// Applied automatically by the heal pipeline.
    HealedAuto,
    /// Applied from a human-approved pending fix.
    HealedApproved,
    /// Created by an operator rollback.
    ManualRollback,
}

/// Lifecycle state of a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    /// Currently serving requests.
    Live,
    /// In history, not serving.
    Retired,
    /// Failed post-swap verification and was rolled back.
    FailedVerification,
}

/// One adapter version record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterVersion {
    /// Provider the version belongs to.
    pub provider: String,
    /// Monotonically increasing version number.
    pub version: u64,
    /// SHA-256 of the source blob.
    pub hash: String,
    /// When the version was recorded.
    pub created_at: DateTime<Utc>,
    /// How the version came to exist.
    pub origin: VersionOrigin,
    /// Lifecycle state.
    pub status: VersionStatus,
    /// Heal-model confidence, for healed versions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Operator who approved the fix, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Manifest {
    current: u64,
    next_version: u64,
    versions: Vec<AdapterVersion>,
}

/// A web citation collected during heal research.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    /// Source URL.
    pub url: String,
    /// Relevant excerpt.
    pub excerpt: String,
    /// When the source was retrieved.
    pub retrieved_at: DateTime<Utc>,
}

/// Resolution state of a pending fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingStatus {
    /// Awaiting a decision.
    Pending,
    /// Approved and applied.
    Approved,
    /// Rejected; staging artifacts removed.
    Rejected,
    /// Aged out without a decision.
    Expired,
}

/// A proposed adapter version awaiting human approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingFix {
    /// Provider the fix targets.
    pub provider: String,
    /// Proposed source text; cleared on rejection.
    pub source: String,
    /// Diagnosis summary from the heal model.
    pub diagnosis: String,
    /// Research citations backing the fix.
    pub citations: Vec<Citation>,
    /// Heal-model confidence in [0, 1].
    pub confidence: f64,
    /// When the fix was proposed.
    pub created_at: DateTime<Utc>,
    /// Resolution state; resolution is terminal.
    pub status: PendingStatus,
}

/// File-backed version store, one directory per provider.
pub struct VersionStore {
    root: PathBuf,
    max_versions: usize,
}

impl VersionStore {
    /// Open a store rooted at the given directory, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error when the root cannot be created.
    pub fn open(root: impl Into<PathBuf>, max_versions: usize) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create state dir {}", root.display()))?;
        Ok(Self { root, max_versions })
    }

    /// Record the initial version for a provider if none exists yet.
    ///
    /// # Errors
    ///
    /// Returns an error on any filesystem failure.
    pub fn ensure_initial(&self, provider: &str, content: &str) -> anyhow::Result<AdapterVersion> {
        let manifest = self.load_manifest(provider)?;
        if let Some(current) = manifest.versions.iter().find(|v| v.version == manifest.current) {
            return Ok(current.clone());
        }
        let version = self.record_version(provider, content, VersionOrigin::Initial, None, None)?;
        self.set_current(provider, version.version)?;
        Ok(version)
    }

    /// Append a new version record and write its blob.
    ///
    /// The new version is recorded as `Retired` until a commit marks it live.
    /// The history ring is bounded; the oldest non-live version is evicted
    /// when the bound is exceeded.
    ///
    /// # Errors
    ///
    /// Returns an error on any filesystem failure.
    pub fn record_version(
        &self,
        provider: &str,
        content: &str,
        origin: VersionOrigin,
        confidence: Option<f64>,
        approved_by: Option<String>,
    ) -> anyhow::Result<AdapterVersion> {
        let mut manifest = self.load_manifest(provider)?;
        let version = manifest.next_version.max(1);
        manifest.next_version = version.saturating_add(1);

        let blob_path = self.blob_path(provider, version);
        if let Some(parent) = blob_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        write_atomic(&blob_path, content.as_bytes())?;

        let record = AdapterVersion {
            provider: provider.to_owned(),
            version,
            hash: sha256_hex(content.as_bytes()),
            created_at: Utc::now(),
            origin,
            status: VersionStatus::Retired,
            confidence,
            approved_by,
        };
        manifest.versions.push(record.clone());
        self.evict(provider, &mut manifest);
        self.save_manifest(provider, &manifest)?;

        info!(provider, version, ?origin, "recorded adapter version");
        Ok(record)
    }

    /// Mark a version live and retire the previous live version.
    ///
    /// # Errors
    ///
    /// Returns an error when the version is not in history.
    pub fn set_current(&self, provider: &str, version: u64) -> anyhow::Result<()> {
        let mut manifest = self.load_manifest(provider)?;
        anyhow::ensure!(
            manifest.versions.iter().any(|v| v.version == version),
            "version {version} not in history for {provider}"
        );
        for record in &mut manifest.versions {
            if record.version == version {
                record.status = VersionStatus::Live;
            } else if record.status == VersionStatus::Live {
                record.status = VersionStatus::Retired;
            }
        }
        manifest.current = version;
        self.save_manifest(provider, &manifest)
    }

    /// Set the status of one version.
    ///
    /// # Errors
    ///
    /// Returns an error when the version is not in history.
    pub fn set_status(
        &self,
        provider: &str,
        version: u64,
        status: VersionStatus,
    ) -> anyhow::Result<()> {
        let mut manifest = self.load_manifest(provider)?;
        let record = manifest
            .versions
            .iter_mut()
            .find(|v| v.version == version)
            .with_context(|| format!("version {version} not in history for {provider}"))?;
        record.status = status;
        self.save_manifest(provider, &manifest)
    }

    /// The current live version record, when one exists.
    ///
    /// # Errors
    ///
    /// Returns an error when the manifest cannot be read.
    pub fn current(&self, provider: &str) -> anyhow::Result<Option<AdapterVersion>> {
        let manifest = self.load_manifest(provider)?;
        Ok(manifest
            .versions
            .iter()
            .find(|v| v.version == manifest.current)
            .cloned())
    }

    /// Version history, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error when the manifest cannot be read.
    pub fn history(&self, provider: &str) -> anyhow::Result<Vec<AdapterVersion>> {
        Ok(self.load_manifest(provider)?.versions)
    }

    /// Read a version's source blob.
    ///
    /// # Errors
    ///
    /// Returns an error when the blob is absent.
    pub fn read_blob(&self, provider: &str, version: u64) -> anyhow::Result<String> {
        let path = self.blob_path(provider, version);
        std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read blob {}", path.display()))
    }

    // -- Pending fixes --

    /// Persist a pending fix, replacing any existing one for the provider.
    ///
    /// # Errors
    ///
    /// Returns an error on any filesystem failure.
    pub fn save_pending(&self, fix: &PendingFix) -> anyhow::Result<()> {
        let path = self.pending_path(&fix.provider);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_vec_pretty(fix).context("failed to serialize pending fix")?;
        write_atomic(&path, &json)
    }

    /// Load the provider's pending fix, expiring it in place when it has aged
    /// past `expiry`.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be parsed.
    pub fn load_pending(
        &self,
        provider: &str,
        expiry: chrono::Duration,
    ) -> anyhow::Result<Option<PendingFix>> {
        let path = self.pending_path(provider);
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        let mut fix: PendingFix =
            serde_json::from_str(&contents).context("failed to parse pending fix")?;

        let aged_out = Utc::now()
            .signed_duration_since(fix.created_at)
            .gt(&expiry);
        if fix.status == PendingStatus::Pending && aged_out {
            debug!(provider, "expiring pending fix");
            fix.status = PendingStatus::Expired;
            fix.source.clear();
            self.save_pending(&fix)?;
        }
        Ok(Some(fix))
    }

    /// Pending fixes across every provider directory.
    ///
    /// # Errors
    ///
    /// Returns an error when the state dir cannot be listed.
    pub fn all_pending(&self, expiry: chrono::Duration) -> anyhow::Result<Vec<PendingFix>> {
        let mut fixes = Vec::new();
        for entry in std::fs::read_dir(&self.root)
            .with_context(|| format!("failed to list {}", self.root.display()))?
        {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            if !entry.path().is_dir() {
                continue;
            }
            let provider = entry.file_name().to_string_lossy().into_owned();
            if let Some(fix) = self.load_pending(&provider, expiry)? {
                fixes.push(fix);
            }
        }
        fixes.sort_by(|a, b| a.provider.cmp(&b.provider));
        Ok(fixes)
    }

    // -- Internals --

    fn evict(&self, provider: &str, manifest: &mut Manifest) {
        while manifest.versions.len() > self.max_versions {
            let Some(index) = manifest
                .versions
                .iter()
                .position(|v| v.status != VersionStatus::Live && v.version != manifest.current)
            else {
                break;
            };
            let evicted = manifest.versions.remove(index);
            let _ = std::fs::remove_file(self.blob_path(provider, evicted.version));
            debug!(provider, version = evicted.version, "evicted adapter version");
        }
    }

    fn load_manifest(&self, provider: &str) -> anyhow::Result<Manifest> {
        let path = self.manifest_path(provider);
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                serde_json::from_str(&contents).context("failed to parse version manifest")
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Manifest {
                current: 0,
                next_version: 1,
                versions: Vec::new(),
            }),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    fn save_manifest(&self, provider: &str, manifest: &Manifest) -> anyhow::Result<()> {
        let path = self.manifest_path(provider);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_vec_pretty(manifest).context("failed to serialize manifest")?;
        write_atomic(&path, &json)
    }

    fn manifest_path(&self, provider: &str) -> PathBuf {
        self.root.join(provider).join("manifest.json")
    }

    fn pending_path(&self, provider: &str) -> PathBuf {
        self.root.join(provider).join("pending_fix.json")
    }

    fn blob_path(&self, provider: &str, version: u64) -> PathBuf {
        self.root
            .join(provider)
            .join("versions")
            .join(format!("v{version}.adapter"))
    }
}

/// Write via a temp file and rename so readers never see a partial file.
fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename {} into place", tmp.display()))?;
    Ok(())
}

/// SHA-256 hex digest of a blob.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
