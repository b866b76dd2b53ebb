//! Durable storage port for conversations
//!
//! The conversation store serializes a conversation into a blob and hands it
//! to a [`ConversationStorage`] backend. Blobs above the configured threshold
//! are gzip-compressed; readers detect compression from the gzip magic bytes,
//! so a backend never has to remember which variant it holds.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::StorageConfig;
use crate::error::{ParleyError, Result};
use crate::message::ConversationId;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const PLAIN_EXT: &str = "json";
const GZIP_EXT: &str = "json.gz";

/// Encoded conversation record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub bytes: Vec<u8>,
    pub compressed: bool,
}

impl StoredBlob {
    /// Wrap serialized bytes, compressing when they exceed `threshold`
    pub fn encode(
        id: &ConversationId,
        serialized: Vec<u8>,
        threshold: usize,
    ) -> Result<Self> {
        if serialized.len() <= threshold {
            return Ok(Self {
                bytes: serialized,
                compressed: false,
            });
        }

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&serialized)
            .and_then(|_| encoder.finish())
            .map(|bytes| Self {
                bytes,
                compressed: true,
            })
            .map_err(|e| ParleyError::persistence(id, format!("compression failed: {e}")))
    }

    /// Recover the serialized bytes
    pub fn decode(&self, id: &ConversationId) -> Result<Vec<u8>> {
        if !self.bytes.starts_with(&GZIP_MAGIC) {
            return Ok(self.bytes.clone());
        }

        let mut out = Vec::new();
        GzDecoder::new(self.bytes.as_slice())
            .read_to_end(&mut out)
            .map_err(|e| ParleyError::persistence(id, format!("corrupt compressed record: {e}")))?;
        Ok(out)
    }
}

/// Storage backend for conversation records
pub trait ConversationStorage: Send + Sync {
    /// Replace the current record and keep a timestamped backup
    fn write(&self, id: &ConversationId, blob: &StoredBlob) -> Result<()>;

    /// Read the current record
    fn read(&self, id: &ConversationId) -> Result<StoredBlob>;

    /// Ids of every persisted conversation
    fn list(&self) -> Result<Vec<ConversationId>>;

    /// Delete the current record and its backups
    fn remove(&self, id: &ConversationId) -> Result<bool>;

    /// Backup names for a conversation, oldest first
    fn backups(&self, id: &ConversationId) -> Result<Vec<String>>;
}

static BACKUP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Sortable backup name: UTC timestamp plus a process-wide sequence
fn backup_stamp() -> String {
    let seq = BACKUP_SEQ.fetch_add(1, Ordering::Relaxed);
    format!(
        "{}-{seq:06}",
        chrono::Utc::now().format("%Y%m%dT%H%M%S%.6fZ")
    )
}

/// File-backed storage: one record per conversation plus rotating backups
///
/// ```text
/// <root>/<id>.json | <root>/<id>.json.gz
/// <root>/backups/<id>/<stamp>.json[.gz]
/// ```
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
    retention: usize,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>, retention: usize) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("backups")).map_err(|e| {
            ParleyError::Config(format!("cannot create storage dir {}: {e}", root.display()))
        })?;
        Ok(Self { root, retention })
    }

    /// Storage under `root` keeping `backup_retention` backups per conversation
    pub fn from_config(root: impl Into<PathBuf>, config: &StorageConfig) -> Result<Self> {
        Self::new(root, config.backup_retention)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn check_id(id: &ConversationId) -> Result<()> {
        let raw = id.as_str();
        let valid = !raw.is_empty()
            && raw != "."
            && raw != ".."
            && !raw.contains(['/', '\\', '\0']);
        if valid {
            Ok(())
        } else {
            Err(ParleyError::persistence(id, "conversation id is not a valid file name"))
        }
    }

    fn record_path(&self, id: &ConversationId, compressed: bool) -> PathBuf {
        let ext = if compressed { GZIP_EXT } else { PLAIN_EXT };
        self.root.join(format!("{id}.{ext}"))
    }

    fn backup_dir(&self, id: &ConversationId) -> PathBuf {
        self.root.join("backups").join(id.as_str())
    }

    fn write_backup(&self, id: &ConversationId, blob: &StoredBlob) -> Result<()> {
        if self.retention == 0 {
            return Ok(());
        }

        let dir = self.backup_dir(id);
        fs::create_dir_all(&dir).map_err(|e| ParleyError::persistence(id, e))?;
        let ext = if blob.compressed { GZIP_EXT } else { PLAIN_EXT };
        let path = dir.join(format!("{}.{ext}", backup_stamp()));
        fs::write(&path, &blob.bytes).map_err(|e| ParleyError::persistence(id, e))?;

        self.prune_backups(id)
    }

    fn prune_backups(&self, id: &ConversationId) -> Result<()> {
        let names = self.backups(id)?;
        if names.len() <= self.retention {
            return Ok(());
        }

        let dir = self.backup_dir(id);
        for name in &names[..names.len() - self.retention] {
            if let Err(e) = fs::remove_file(dir.join(name)) {
                warn!(conversation_id = %id, backup = %name, error = %e, "Failed to prune backup");
            }
        }
        Ok(())
    }
}

impl ConversationStorage for FileStorage {
    fn write(&self, id: &ConversationId, blob: &StoredBlob) -> Result<()> {
        Self::check_id(id)?;

        // each writer gets its own temp file; it is removed on drop unless persisted
        let target = self.record_path(id, blob.compressed);
        let mut tmp = tempfile::Builder::new()
            .prefix(&format!(".{id}."))
            .suffix(".tmp")
            .tempfile_in(&self.root)
            .map_err(|e| ParleyError::persistence(id, e))?;
        tmp.write_all(&blob.bytes)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| ParleyError::persistence(id, e))?;
        tmp.persist(&target)
            .map_err(|e| ParleyError::persistence(id, e.error))?;

        // only one variant may exist at a time
        let stale = self.record_path(id, !blob.compressed);
        match fs::remove_file(&stale) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ParleyError::persistence(id, e)),
        }

        self.write_backup(id, blob)?;
        debug!(
            conversation_id = %id,
            bytes = blob.bytes.len(),
            compressed = blob.compressed,
            "Wrote conversation record"
        );
        Ok(())
    }

    fn read(&self, id: &ConversationId) -> Result<StoredBlob> {
        Self::check_id(id)?;

        for compressed in [true, false] {
            let path = self.record_path(id, compressed);
            if path.exists() {
                let bytes = fs::read(&path).map_err(|e| ParleyError::persistence(id, e))?;
                return Ok(StoredBlob { bytes, compressed });
            }
        }
        Err(ParleyError::persistence(id, "no persisted record"))
    }

    fn list(&self) -> Result<Vec<ConversationId>> {
        let entries = fs::read_dir(&self.root).map_err(|e| {
            ParleyError::Config(format!("cannot list {}: {e}", self.root.display()))
        })?;

        let mut ids = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let stem = name
                .strip_suffix(&format!(".{GZIP_EXT}"))
                .or_else(|| name.strip_suffix(&format!(".{PLAIN_EXT}")));
            if let Some(stem) = stem {
                ids.push(ConversationId::from(stem));
            }
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    fn remove(&self, id: &ConversationId) -> Result<bool> {
        Self::check_id(id)?;

        let mut removed = false;
        for compressed in [true, false] {
            let path = self.record_path(id, compressed);
            if path.exists() {
                fs::remove_file(&path).map_err(|e| ParleyError::persistence(id, e))?;
                removed = true;
            }
        }
        let backups = self.backup_dir(id);
        if backups.exists() {
            fs::remove_dir_all(&backups).map_err(|e| ParleyError::persistence(id, e))?;
        }
        Ok(removed)
    }

    fn backups(&self, id: &ConversationId) -> Result<Vec<String>> {
        Self::check_id(id)?;

        let dir = self.backup_dir(id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names: Vec<String> = fs::read_dir(&dir)
            .map_err(|e| ParleyError::persistence(id, e))?
            .flatten()
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        Ok(names)
    }
}

#[derive(Debug, Default)]
struct MemoryEntry {
    current: Option<StoredBlob>,
    backups: VecDeque<(String, StoredBlob)>,
}

/// In-memory storage with the same backup semantics as [`FileStorage`]
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<ConversationId, MemoryEntry>>,
    retention: usize,
}

impl MemoryStorage {
    pub fn new(retention: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            retention,
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(config.backup_retention)
    }

    /// Read a backup by name
    pub fn backup(&self, id: &ConversationId, name: &str) -> Option<StoredBlob> {
        self.entries.lock().get(id).and_then(|entry| {
            entry
                .backups
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, blob)| blob.clone())
        })
    }
}

impl ConversationStorage for MemoryStorage {
    fn write(&self, id: &ConversationId, blob: &StoredBlob) -> Result<()> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(id.clone()).or_default();
        entry.current = Some(blob.clone());
        if self.retention > 0 {
            entry.backups.push_back((backup_stamp(), blob.clone()));
            while entry.backups.len() > self.retention {
                entry.backups.pop_front();
            }
        }
        Ok(())
    }

    fn read(&self, id: &ConversationId) -> Result<StoredBlob> {
        self.entries
            .lock()
            .get(id)
            .and_then(|entry| entry.current.clone())
            .ok_or_else(|| ParleyError::persistence(id, "no persisted record"))
    }

    fn list(&self) -> Result<Vec<ConversationId>> {
        let mut ids: Vec<_> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.current.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn remove(&self, id: &ConversationId) -> Result<bool> {
        Ok(self
            .entries
            .lock()
            .remove(id)
            .is_some_and(|entry| entry.current.is_some()))
    }

    fn backups(&self, id: &ConversationId) -> Result<Vec<String>> {
        Ok(self
            .entries
            .lock()
            .get(id)
            .map(|entry| entry.backups.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(text: &str) -> StoredBlob {
        StoredBlob {
            bytes: text.as_bytes().to_vec(),
            compressed: false,
        }
    }

    // === Codec Tests ===

    #[test]
    fn test_small_payload_stays_plain() {
        let id = ConversationId::from("c1");
        let blob = StoredBlob::encode(&id, b"{}".to_vec(), 1024).unwrap();
        assert!(!blob.compressed);
        assert_eq!(blob.decode(&id).unwrap(), b"{}");
    }

    #[test]
    fn test_large_payload_compressed() {
        let id = ConversationId::from("c1");
        let payload = "x".repeat(4096).into_bytes();
        let blob = StoredBlob::encode(&id, payload.clone(), 100).unwrap();

        assert!(blob.compressed);
        assert!(blob.bytes.starts_with(&GZIP_MAGIC));
        assert!(blob.bytes.len() < payload.len());
        assert_eq!(blob.decode(&id).unwrap(), payload);
    }

    #[test]
    fn test_truncated_gzip_is_persistence_error() {
        let id = ConversationId::from("c1");
        let mut blob = StoredBlob::encode(&id, "y".repeat(2048).into_bytes(), 10).unwrap();
        blob.bytes.truncate(12);

        let err = blob.decode(&id).unwrap_err();
        assert!(matches!(err, ParleyError::Persistence { .. }));
    }

    // === FileStorage Tests ===

    #[test]
    fn test_file_write_read_list() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path(), 3).unwrap();
        let id = ConversationId::from("c1");

        storage.write(&id, &blob("{\"a\":1}")).unwrap();
        assert_eq!(storage.read(&id).unwrap(), blob("{\"a\":1}"));
        assert_eq!(storage.list().unwrap(), vec![id.clone()]);
    }

    #[test]
    fn test_file_switches_variant() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path(), 3).unwrap();
        let id = ConversationId::from("c1");

        storage.write(&id, &blob("plain")).unwrap();
        let packed = StoredBlob::encode(&id, "z".repeat(1000).into_bytes(), 10).unwrap();
        storage.write(&id, &packed).unwrap();

        assert!(!dir.path().join("c1.json").exists());
        assert!(dir.path().join("c1.json.gz").exists());
        assert!(storage.read(&id).unwrap().compressed);
        assert_eq!(storage.list().unwrap().len(), 1);
    }

    #[test]
    fn test_file_backups_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path(), 2).unwrap();
        let id = ConversationId::from("c1");

        for i in 0..5 {
            storage.write(&id, &blob(&format!("v{i}"))).unwrap();
        }

        let backups = storage.backups(&id).unwrap();
        assert_eq!(backups.len(), 2);
        let newest = fs::read(storage.backup_dir(&id).join(&backups[1])).unwrap();
        assert_eq!(newest, b"v4");
    }

    #[test]
    fn test_file_retention_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            backup_retention: 1,
            ..StorageConfig::default()
        };
        let storage = FileStorage::from_config(dir.path(), &config).unwrap();
        let id = ConversationId::from("c1");

        for i in 0..3 {
            storage.write(&id, &blob(&format!("v{i}"))).unwrap();
        }
        assert_eq!(storage.backups(&id).unwrap().len(), 1);
    }

    #[test]
    fn test_file_concurrent_writes_leave_one_record() {
        let dir = tempfile::tempdir().unwrap();
        let storage = std::sync::Arc::new(FileStorage::new(dir.path(), 3).unwrap());
        let id = ConversationId::from("c1");

        let writers: Vec<_> = (0..8)
            .map(|t| {
                let storage = std::sync::Arc::clone(&storage);
                let id = id.clone();
                std::thread::spawn(move || {
                    for i in 0..20 {
                        storage.write(&id, &blob(&format!("t{t}-{i}"))).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let current = String::from_utf8(storage.read(&id).unwrap().bytes).unwrap();
        assert!(current.starts_with('t'));
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
        assert_eq!(storage.list().unwrap(), vec![id]);
    }

    #[test]
    fn test_file_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path(), 2).unwrap();

        for bad in ["../escape", "a/b", ".."] {
            let err = storage.write(&ConversationId::from(bad), &blob("x")).unwrap_err();
            assert!(matches!(err, ParleyError::Persistence { .. }));
        }
    }

    #[test]
    fn test_file_missing_record() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path(), 2).unwrap();
        assert!(storage.read(&ConversationId::from("nope")).is_err());
    }

    #[test]
    fn test_file_remove() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path(), 2).unwrap();
        let id = ConversationId::from("c1");
        storage.write(&id, &blob("x")).unwrap();

        assert!(storage.remove(&id).unwrap());
        assert!(storage.backups(&id).unwrap().is_empty());
        assert!(storage.list().unwrap().is_empty());
    }

    // === MemoryStorage Tests ===

    #[test]
    fn test_memory_retention() {
        let config = StorageConfig {
            backup_retention: 2,
            ..StorageConfig::default()
        };
        let storage = MemoryStorage::from_config(&config);
        let id = ConversationId::from("c1");
        for i in 0..4 {
            storage.write(&id, &blob(&format!("v{i}"))).unwrap();
        }

        let names = storage.backups(&id).unwrap();
        assert_eq!(names.len(), 2);
        assert_eq!(storage.backup(&id, &names[0]).unwrap(), blob("v2"));
        assert_eq!(storage.read(&id).unwrap(), blob("v3"));
    }
}
