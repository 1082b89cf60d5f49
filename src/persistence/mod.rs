//! Durable chain storage: versioned JSON files with optional gzip
//! compression, timestamped backup rotation, and per-path write locking.
//!
//! Chain files are named `{chain_id}.json` (or `.json.gz` when compressed)
//! and contain a [`ChainModel`] snapshot. A `{chain_id}_metadata.json`
//! sidecar holds manager state that does not belong in the graph itself.
//! Every read or write of a given file is serialized through a lock owned
//! by the [`ChainStore`] instance, so two stores pointed at the same
//! directory do not coordinate.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::error::{PersistenceError, PersistenceResult};
use crate::graph::{from_epoch, ChainModel, ReasoningChain};

/// Payloads at or above this size are compressed even when the caller did
/// not ask for compression. Compression is never downgraded.
pub const COMPRESSION_THRESHOLD: usize = 1024 * 1024;

/// How many bytes of a chain file are read when listing, before falling
/// back to streaming the remainder.
const LIST_PREFIX_BYTES: usize = 64 * 1024;

const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

// ============================================================================
// Save options
// ============================================================================

/// Per-save overrides for [`ChainStore::save`].
#[derive(Debug, Clone)]
pub struct SaveOptions {
    /// Explicit target path; defaults to `{dir}/{chain_id}.json`.
    pub path: Option<PathBuf>,
    /// Request gzip compression regardless of payload size.
    pub compress: bool,
    /// Rotate a timestamped backup of the previous file before writing.
    pub backup: bool,
    /// How many backups to retain per chain file.
    pub max_backups: usize,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            path: None,
            compress: false,
            backup: true,
            max_backups: 3,
        }
    }
}

impl SaveOptions {
    /// Options matching the storage configuration defaults.
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            path: None,
            compress: config.compress,
            backup: config.backup,
            max_backups: config.max_backups,
        }
    }

    /// Write to an explicit path instead of the derived one.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Force gzip compression on.
    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Enable or disable backup rotation.
    pub fn with_backup(mut self, backup: bool) -> Self {
        self.backup = backup;
        self
    }

    /// Set the backup retention count.
    pub fn with_max_backups(mut self, max_backups: usize) -> Self {
        self.max_backups = max_backups;
        self
    }
}

// ============================================================================
// Listing
// ============================================================================

/// Header of one stored chain file, extracted without loading its nodes.
#[derive(Debug, Clone, Serialize)]
pub struct ChainFileInfo {
    /// Chain id recorded in the file.
    pub chain_id: String,
    /// Chain name.
    pub name: String,
    /// Chain description.
    pub description: String,
    /// When the chain was created.
    pub created_at: DateTime<Utc>,
    /// When the chain was last saved.
    pub updated_at: DateTime<Utc>,
    /// Number of nodes in the file.
    pub node_count: usize,
    /// Schema version the file was written under.
    pub schema_version: String,
    /// Path the header was read from.
    pub path: PathBuf,
}

/// The chain file header fields, with node values skipped during
/// deserialization so listing never materializes node payloads.
#[derive(Deserialize)]
struct ChainHeader {
    chain_id: String,
    name: String,
    description: String,
    created_at: f64,
    updated_at: f64,
    schema_version: String,
    #[serde(default)]
    nodes: BTreeMap<String, IgnoredAny>,
}

// ============================================================================
// Store
// ============================================================================

/// File-backed chain storage with per-path write locks.
pub struct ChainStore {
    storage_dir: PathBuf,
    defaults: SaveOptions,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for ChainStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainStore")
            .field("storage_dir", &self.storage_dir)
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl ChainStore {
    /// Create a store over the configured directory.
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            storage_dir: config.directory.clone(),
            defaults: SaveOptions::from_config(config),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The directory chain files are derived under.
    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Save options matching this store's configuration.
    pub fn default_options(&self) -> SaveOptions {
        self.defaults.clone()
    }

    /// Serialize a chain to its file, returning the path actually written.
    ///
    /// The write is atomic (temp file plus rename), holds the per-path lock
    /// for its duration, and appends `.gz` when the payload is compressed.
    pub fn save(
        &self,
        chain: &ReasoningChain,
        options: &SaveOptions,
    ) -> PersistenceResult<PathBuf> {
        let base = match &options.path {
            Some(path) => path.clone(),
            None => self.storage_dir.join(format!("{}.json", chain.id)),
        };

        let payload = serde_json::to_vec_pretty(&chain.to_model())?;
        let compress = options.compress || payload.len() >= COMPRESSION_THRESHOLD;
        let target = if compress {
            ensure_gz_suffix(&base)
        } else {
            base
        };

        let lock = self.lock_for(&target);
        let _guard = lock.lock();

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        if options.backup && target.exists() {
            self.rotate_backup(&target, options.max_backups)?;
        }

        let mut tmp = target.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let result = write_payload(&tmp, &payload, compress);
        if let Err(err) = result {
            let _ = fs::remove_file(&tmp);
            return Err(err);
        }
        fs::rename(&tmp, &target)?;

        info!(
            chain_id = %chain.id,
            path = %target.display(),
            bytes = payload.len(),
            compress,
            "Chain saved"
        );
        Ok(target)
    }

    /// Load a chain from a file, transparently decompressing `.gz` files.
    pub fn load(&self, path: &Path) -> PersistenceResult<ReasoningChain> {
        let lock = self.lock_for(path);
        let _guard = lock.lock();

        if !path.exists() {
            return Err(PersistenceError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let file = fs::File::open(path)?;
        let model: ChainModel = if is_gzipped(path) {
            serde_json::from_reader(GzDecoder::new(file))?
        } else {
            serde_json::from_reader(file)?
        };

        let chain = ReasoningChain::from_model(model)?;
        debug!(chain_id = %chain.id, path = %path.display(), nodes = chain.len(), "Chain loaded");
        Ok(chain)
    }

    /// List the chain files under a directory (the store's own directory
    /// when `dir` is `None`), reading only headers.
    ///
    /// Backup files and metadata sidecars are skipped, as is any file that
    /// fails to parse; such failures are logged, never propagated.
    pub fn list_available(&self, dir: Option<&Path>) -> PersistenceResult<Vec<ChainFileInfo>> {
        let dir = dir.unwrap_or(&self.storage_dir);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut infos = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if !is_chain_file(&path) {
                continue;
            }
            match read_header(&path) {
                Ok(info) => infos.push(info),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Skipping unreadable chain file");
                }
            }
        }
        infos.sort_by(|a, b| a.chain_id.cmp(&b.chain_id));
        Ok(infos)
    }

    /// Persist a metadata sidecar next to the chain file.
    pub fn save_metadata<T: Serialize>(
        &self,
        chain_id: &str,
        metadata: &T,
    ) -> PersistenceResult<PathBuf> {
        let target = self.metadata_path(chain_id);
        let lock = self.lock_for(&target);
        let _guard = lock.lock();

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let payload = serde_json::to_vec_pretty(metadata)?;
        let mut tmp = target.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        if let Err(err) = fs::write(&tmp, &payload) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        fs::rename(&tmp, &target)?;

        debug!(chain_id, path = %target.display(), "Metadata sidecar saved");
        Ok(target)
    }

    /// Load a metadata sidecar, returning `None` when absent.
    pub fn load_metadata<T: DeserializeOwned>(
        &self,
        chain_id: &str,
    ) -> PersistenceResult<Option<T>> {
        let path = self.metadata_path(chain_id);
        let lock = self.lock_for(&path);
        let _guard = lock.lock();

        if !path.exists() {
            return Ok(None);
        }
        let file = fs::File::open(&path)?;
        Ok(Some(serde_json::from_reader(file)?))
    }

    /// Delete every file belonging to a chain: the chain file (compressed
    /// or not), its backups, and its metadata sidecar. Returns the paths
    /// removed.
    pub fn delete_chain_files(&self, chain_id: &str) -> PersistenceResult<Vec<PathBuf>> {
        let mut removed = Vec::new();
        if !self.storage_dir.is_dir() {
            return Ok(removed);
        }

        let chain_prefix = format!("{}.", chain_id);
        let metadata_name = format!("{}_metadata.json", chain_id);
        for entry in fs::read_dir(&self.storage_dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            if !name.starts_with(&chain_prefix) && name != metadata_name {
                continue;
            }
            let lock = self.lock_for(&path);
            let _guard = lock.lock();
            fs::remove_file(&path)?;
            removed.push(path);
        }

        info!(chain_id, files = removed.len(), "Chain files deleted");
        Ok(removed)
    }

    fn metadata_path(&self, chain_id: &str) -> PathBuf {
        self.storage_dir.join(format!("{}_metadata.json", chain_id))
    }

    /// One lock per normalized path, created on first use. Waiters block
    /// without a timeout.
    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let key = normalize(path);
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(key).or_default())
    }

    /// Move the existing file to `{stem}.{timestamp}.{rest}` and drop the
    /// oldest backups beyond the retention count.
    fn rotate_backup(&self, target: &Path, max_backups: usize) -> PersistenceResult<()> {
        let name = match target.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => return Ok(()),
        };
        let (stem, rest) = match name.split_once('.') {
            Some(parts) => parts,
            None => (name, "bak"),
        };
        let timestamp = Utc::now().format(BACKUP_TIMESTAMP_FORMAT);
        let backup_name = format!("{}.{}.{}", stem, timestamp, rest);
        let parent = target.parent().unwrap_or_else(|| Path::new("."));
        let backup_path = parent.join(&backup_name);

        fs::rename(target, &backup_path)?;
        debug!(path = %backup_path.display(), "Backup rotated");

        let mut backups: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
        let prefix = format!("{}.", stem);
        let suffix = format!(".{}", rest);
        for entry in fs::read_dir(parent)? {
            let entry = entry?;
            let path = entry.path();
            let candidate = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            if !is_backup_name(candidate, &prefix, &suffix) {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            backups.push((modified, path));
        }

        if backups.len() > max_backups {
            backups.sort_by(|a, b| a.0.cmp(&b.0));
            let excess = backups.len() - max_backups;
            for (_, path) in backups.into_iter().take(excess) {
                fs::remove_file(&path)?;
                debug!(path = %path.display(), "Stale backup pruned");
            }
        }
        Ok(())
    }
}

// ============================================================================
// File helpers
// ============================================================================

fn write_payload(path: &Path, payload: &[u8], compress: bool) -> PersistenceResult<()> {
    let file = fs::File::create(path)?;
    if compress {
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(payload)?;
        encoder.finish()?;
    } else {
        let mut file = file;
        file.write_all(payload)?;
    }
    Ok(())
}

/// Parse a chain file header from a bounded prefix, streaming the
/// remainder only when the file does not fit in the prefix.
fn read_header(path: &Path) -> PersistenceResult<ChainFileInfo> {
    let file = fs::File::open(path)?;
    let header = if is_gzipped(path) {
        parse_header(GzDecoder::new(file))
    } else {
        parse_header(file)
    }?;

    Ok(ChainFileInfo {
        created_at: from_epoch(header.created_at)?,
        updated_at: from_epoch(header.updated_at)?,
        chain_id: header.chain_id,
        name: header.name,
        description: header.description,
        node_count: header.nodes.len(),
        schema_version: header.schema_version,
        path: path.to_path_buf(),
    })
}

fn parse_header<R: Read>(mut reader: R) -> PersistenceResult<ChainHeader> {
    let mut prefix = vec![0u8; LIST_PREFIX_BYTES];
    let mut filled = 0;
    while filled < prefix.len() {
        let n = reader.read(&mut prefix[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    prefix.truncate(filled);

    if filled < LIST_PREFIX_BYTES {
        // Whole file fits in the prefix.
        Ok(serde_json::from_slice(&prefix)?)
    } else {
        Ok(serde_json::from_reader(prefix.as_slice().chain(reader))?)
    }
}

fn is_gzipped(path: &Path) -> bool {
    path.extension().map(|e| e == "gz").unwrap_or(false)
}

fn ensure_gz_suffix(path: &Path) -> PathBuf {
    if is_gzipped(path) {
        return path.to_path_buf();
    }
    let mut with_gz: OsString = path.into();
    with_gz.push(".gz");
    PathBuf::from(with_gz)
}

fn is_chain_file(path: &Path) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name,
        None => return false,
    };
    if !(name.ends_with(".json") || name.ends_with(".json.gz")) {
        return false;
    }
    if name.ends_with("_metadata.json") {
        return false;
    }
    // Backups carry a 14-digit timestamp segment before the extension.
    let segments: Vec<&str> = name.split('.').collect();
    !segments
        .iter()
        .any(|s| s.len() == 14 && s.chars().all(|c| c.is_ascii_digit()))
}

fn is_backup_name(name: &str, prefix: &str, suffix: &str) -> bool {
    if !name.starts_with(prefix) || !name.ends_with(suffix) {
        return false;
    }
    if name.len() < prefix.len() + suffix.len() {
        return false;
    }
    let middle = &name[prefix.len()..name.len() - suffix.len()];
    middle.len() == 14 && middle.chars().all(|c| c.is_ascii_digit())
}

fn normalize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(dir) => dir.join(path),
            Err(_) => path.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{RelationshipKind, ThoughtKind, ThoughtNode};
    use serde_json::json;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> ChainStore {
        ChainStore::new(&StorageConfig {
            directory: dir.path().to_path_buf(),
            compress: false,
            backup: true,
            max_backups: 3,
        })
    }

    fn sample_chain() -> ReasoningChain {
        let mut chain = ReasoningChain::new("sample", "a small chain");
        chain
            .add_node(
                ThoughtNode::new(ThoughtKind::Observation, json!({"text": "root"}), "agent-1")
                    .unwrap()
                    .with_id("n1"),
                None,
                None,
            )
            .unwrap();
        chain
            .add_node(
                ThoughtNode::new(ThoughtKind::Inference, json!({"text": "child"}), "agent-1")
                    .unwrap()
                    .with_id("n2"),
                Some("n1"),
                Some(RelationshipKind::DerivesFrom),
            )
            .unwrap();
        chain
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let chain = sample_chain();

        let path = store.save(&chain, &SaveOptions::default()).unwrap();
        assert_eq!(path, dir.path().join(format!("{}.json", chain.id)));

        let loaded = store.load(&path).unwrap();
        assert_eq!(loaded.to_model(), chain.to_model());
    }

    #[test]
    fn test_compressed_save_appends_gz_suffix() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let chain = sample_chain();

        let path = store
            .save(&chain, &SaveOptions::default().with_compress(true))
            .unwrap();
        assert!(path.to_string_lossy().ends_with(".json.gz"));

        // The bytes on disk are not plain JSON.
        let raw = fs::read(&path).unwrap();
        assert_ne!(&raw[..2], b"{\n");

        let loaded = store.load(&path).unwrap();
        assert_eq!(loaded.id, chain.id);
    }

    #[test]
    fn test_load_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let err = store.load(&dir.path().join("ghost.json")).unwrap_err();
        assert!(matches!(err, PersistenceError::FileNotFound { .. }));
    }

    #[test]
    fn test_backup_rotation_respects_retention() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut chain = sample_chain();
        let options = SaveOptions::default().with_max_backups(2);

        for i in 0..5 {
            chain
                .update_thought_content("n2", json!({"text": format!("rev {}", i)}))
                .unwrap();
            store.save(&chain, &options).unwrap();
        }

        let backups: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                let name = e.file_name();
                let name = name.to_string_lossy().into_owned();
                name.starts_with(&format!("{}.", chain.id))
                    && name != format!("{}.json", chain.id)
            })
            .collect();
        assert!(backups.len() <= 2, "found {} backups", backups.len());
    }

    #[test]
    fn test_list_available_skips_corrupt_and_sidecar_files() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let chain = sample_chain();
        store.save(&chain, &SaveOptions::default()).unwrap();
        store
            .save_metadata(&chain.id, &json!({"chain_id": chain.id}))
            .unwrap();
        fs::write(dir.path().join("broken.json"), b"{ not json").unwrap();

        let infos = store.list_available(None).unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].chain_id, chain.id);
        assert_eq!(infos[0].name, "sample");
        assert_eq!(infos[0].node_count, 2);
    }

    #[test]
    fn test_list_available_reads_compressed_headers() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let chain = sample_chain();
        store
            .save(&chain, &SaveOptions::default().with_compress(true))
            .unwrap();

        let infos = store.list_available(None).unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].node_count, 2);
        assert!(infos[0].path.to_string_lossy().ends_with(".json.gz"));
    }

    #[test]
    fn test_metadata_sidecar_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let missing: Option<serde_json::Value> = store.load_metadata("nope").unwrap();
        assert!(missing.is_none());

        store
            .save_metadata("c1", &json!({"branches": ["main"]}))
            .unwrap();
        let loaded: Option<serde_json::Value> = store.load_metadata("c1").unwrap();
        assert_eq!(loaded.unwrap()["branches"][0], "main");
    }

    #[test]
    fn test_delete_chain_files_removes_backups_and_sidecar() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut chain = sample_chain();

        store.save(&chain, &SaveOptions::default()).unwrap();
        chain
            .update_thought_content("n1", json!({"text": "edited"}))
            .unwrap();
        store.save(&chain, &SaveOptions::default()).unwrap();
        store
            .save_metadata(&chain.id, &json!({"chain_id": chain.id}))
            .unwrap();

        let removed = store.delete_chain_files(&chain.id).unwrap();
        assert!(removed.len() >= 2);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_large_payload_upgrades_to_compression() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut chain = ReasoningChain::new("big", "");
        let blob = "x".repeat(COMPRESSION_THRESHOLD);
        chain
            .add_node(
                ThoughtNode::new(ThoughtKind::Context, json!({ "blob": blob }), "agent-1")
                    .unwrap()
                    .with_id("huge"),
                None,
                None,
            )
            .unwrap();

        let path = store.save(&chain, &SaveOptions::default()).unwrap();
        assert!(path.to_string_lossy().ends_with(".json.gz"));
        let loaded = store.load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
    }
}
