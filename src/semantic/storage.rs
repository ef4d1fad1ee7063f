//! Partitioned key-value persistence for embedding vectors.
//!
//! On-disk layout: one directory per partition, one file per key. Entries
//! are listed oldest write first, by file modification time.
//!
//! Record format (`<key>.vec`):
//! - version: u8 (1)
//! - dimensions: u16 (little-endian)
//! - checksum: u32 (CRC32 of the payload, little-endian)
//! - payload: [f32; dimensions] (little-endian)

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::SystemTime;

use super::Vector;

/// Current record format version
const FORMAT_VERSION: u8 = 1;

/// Header size in bytes: version(1) + dimensions(2) + checksum(4)
const HEADER_SIZE: usize = 7;

/// File extension of stored records
const RECORD_EXTENSION: &str = "vec";

/// Named partitions of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    /// Fingerprint-keyed vectors of the vector cache
    EmbeddingsCache,
    /// Note-id-keyed vectors of the note index
    NoteEmbeddings,
}

impl Partition {
    pub const ALL: [Partition; 2] = [Partition::EmbeddingsCache, Partition::NoteEmbeddings];

    pub fn name(self) -> &'static str {
        match self {
            Partition::EmbeddingsCache => "embeddings_cache",
            Partition::NoteEmbeddings => "note_embeddings",
        }
    }
}

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid key: {0:?}")]
    InvalidKey(String),

    #[error("Invalid record format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: record version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Checksum mismatch: record may be corrupted")]
    ChecksumMismatch,

    #[error("Vector too large to store: {0} dimensions")]
    TooLarge(usize),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Durable mapping from string keys to vectors, split into partitions.
///
/// Writes to different keys must not interfere with each other. There is no
/// cross-key atomicity.
pub trait VectorStore: Send + Sync {
    fn get(&self, partition: Partition, key: &str) -> Result<Option<Vector>, StoreError>;
    fn set(&self, partition: Partition, key: &str, vector: &[f32]) -> Result<(), StoreError>;
    /// Deleting an absent key is not an error.
    fn delete(&self, partition: Partition, key: &str) -> Result<(), StoreError>;
    fn entries(&self, partition: Partition) -> Result<Vec<(String, Vector)>, StoreError>;
    fn clear(&self, partition: Partition) -> Result<(), StoreError>;
}

/// File-backed store rooted at a directory.
pub struct FileVectorStore {
    root: PathBuf,
}

impl FileVectorStore {
    /// Create a store rooted at `root`. Directories are created lazily.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn partition_dir(&self, partition: Partition) -> PathBuf {
        self.root.join(partition.name())
    }

    fn record_path(&self, partition: Partition, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self
            .partition_dir(partition)
            .join(format!("{key}.{RECORD_EXTENSION}")))
    }

    fn read_record(path: &Path) -> Result<Vector, StoreError> {
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;
        decode_vector(&bytes)
    }
}

impl VectorStore for FileVectorStore {
    fn get(&self, partition: Partition, key: &str) -> Result<Option<Vector>, StoreError> {
        let path = self.record_path(partition, key)?;
        match Self::read_record(&path) {
            Ok(vector) => Ok(Some(vector)),
            Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Uses atomic write: temp file -> fsync -> rename
    fn set(&self, partition: Partition, key: &str, vector: &[f32]) -> Result<(), StoreError> {
        let path = self.record_path(partition, key)?;
        let bytes = encode_vector(vector)?;

        fs::create_dir_all(self.partition_dir(partition))?;

        // unique per write so concurrent writers of one key never share a temp file
        let temp_path = path.with_extension(format!("{:08x}.tmp", rand::random::<u32>()));

        let result = (|| -> Result<(), StoreError> {
            let mut file = File::create(&temp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_file(&temp_path);
            return result;
        }

        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    fn delete(&self, partition: Partition, key: &str) -> Result<(), StoreError> {
        let path = self.record_path(partition, key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn entries(&self, partition: Partition) -> Result<Vec<(String, Vector)>, StoreError> {
        let dir = self.partition_dir(partition);
        let read_dir = match fs::read_dir(&dir) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for entry in read_dir {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if validate_key(key).is_err() {
                continue;
            }

            let modified = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);

            match Self::read_record(&path) {
                Ok(vector) => entries.push((modified, key.to_string(), vector)),
                Err(e) => {
                    log::warn!(
                        "Skipping unreadable record {} in {}: {}",
                        key,
                        partition.name(),
                        e
                    );
                }
            }
        }

        entries.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        Ok(entries
            .into_iter()
            .map(|(_, key, vector)| (key, vector))
            .collect())
    }

    fn clear(&self, partition: Partition) -> Result<(), StoreError> {
        match fs::remove_dir_all(self.partition_dir(partition)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process store. State is lost when the process exits.
#[derive(Default)]
pub struct MemoryVectorStore {
    partitions: RwLock<HashMap<Partition, HashMap<String, Vector>>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys stored in a partition.
    pub fn len(&self, partition: Partition) -> usize {
        self.partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&partition)
            .map(|p| p.len())
            .unwrap_or(0)
    }
}

impl VectorStore for MemoryVectorStore {
    fn get(&self, partition: Partition, key: &str) -> Result<Option<Vector>, StoreError> {
        let partitions = self.partitions.read().unwrap_or_else(PoisonError::into_inner);
        Ok(partitions.get(&partition).and_then(|p| p.get(key)).cloned())
    }

    fn set(&self, partition: Partition, key: &str, vector: &[f32]) -> Result<(), StoreError> {
        let mut partitions = self.partitions.write().unwrap_or_else(PoisonError::into_inner);
        partitions
            .entry(partition)
            .or_default()
            .insert(key.to_string(), vector.to_vec());
        Ok(())
    }

    fn delete(&self, partition: Partition, key: &str) -> Result<(), StoreError> {
        let mut partitions = self.partitions.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(p) = partitions.get_mut(&partition) {
            p.remove(key);
        }
        Ok(())
    }

    fn entries(&self, partition: Partition) -> Result<Vec<(String, Vector)>, StoreError> {
        let partitions = self.partitions.read().unwrap_or_else(PoisonError::into_inner);
        Ok(partitions
            .get(&partition)
            .map(|p| p.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn clear(&self, partition: Partition) -> Result<(), StoreError> {
        let mut partitions = self.partitions.write().unwrap_or_else(PoisonError::into_inner);
        partitions.remove(&partition);
        Ok(())
    }
}

/// Keys become file names, so only `[A-Za-z0-9_-]` is accepted.
fn validate_key(key: &str) -> Result<(), StoreError> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

/// Encode a vector into a self-describing record.
pub fn encode_vector(vector: &[f32]) -> Result<Vec<u8>, StoreError> {
    let dimensions =
        u16::try_from(vector.len()).map_err(|_| StoreError::TooLarge(vector.len()))?;

    let mut payload = Vec::with_capacity(vector.len() * 4);
    for &value in vector {
        payload.extend_from_slice(&value.to_le_bytes());
    }

    let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
    bytes.push(FORMAT_VERSION);
    bytes.extend_from_slice(&dimensions.to_le_bytes());
    bytes.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    bytes.extend_from_slice(&payload);

    Ok(bytes)
}

/// Decode a record produced by [`encode_vector`].
pub fn decode_vector(bytes: &[u8]) -> Result<Vector, StoreError> {
    if bytes.len() < HEADER_SIZE {
        return Err(StoreError::InvalidFormat(format!(
            "record is {} bytes, header needs {}",
            bytes.len(),
            HEADER_SIZE
        )));
    }

    let version = bytes[0];
    if version != FORMAT_VERSION {
        return Err(StoreError::VersionMismatch(version, FORMAT_VERSION));
    }

    let dimensions = u16::from_le_bytes([bytes[1], bytes[2]]) as usize;
    let stored_checksum = u32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]);

    let payload = &bytes[HEADER_SIZE..];
    if payload.len() != dimensions * 4 {
        return Err(StoreError::InvalidFormat(format!(
            "expected {} payload bytes for {} dimensions, got {}",
            dimensions * 4,
            dimensions,
            payload.len()
        )));
    }

    if crc32fast::hash(payload) != stored_checksum {
        return Err(StoreError::ChecksumMismatch);
    }

    Ok(payload
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, FileVectorStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileVectorStore::new(dir.path().join("vectors"));
        (dir, store)
    }

    #[test]
    fn test_set_and_get() {
        let (_dir, store) = temp_store();

        store
            .set(Partition::NoteEmbeddings, "42", &[1.0, -0.5, 0.25])
            .unwrap();

        let loaded = store.get(Partition::NoteEmbeddings, "42").unwrap();
        assert_eq!(loaded, Some(vec![1.0, -0.5, 0.25]));
    }

    #[test]
    fn test_get_missing_returns_none() {
        let (_dir, store) = temp_store();
        assert_eq!(store.get(Partition::EmbeddingsCache, "abc").unwrap(), None);
    }

    #[test]
    fn test_overwrite() {
        let (_dir, store) = temp_store();

        store.set(Partition::NoteEmbeddings, "1", &[1.0, 0.0]).unwrap();
        store.set(Partition::NoteEmbeddings, "1", &[0.0, 1.0]).unwrap();

        assert_eq!(
            store.get(Partition::NoteEmbeddings, "1").unwrap(),
            Some(vec![0.0, 1.0])
        );
        assert_eq!(store.entries(Partition::NoteEmbeddings).unwrap().len(), 1);
    }

    #[test]
    fn test_partitions_are_independent() {
        let (_dir, store) = temp_store();

        store.set(Partition::EmbeddingsCache, "k1", &[1.0]).unwrap();
        store.set(Partition::NoteEmbeddings, "k1", &[2.0]).unwrap();

        store.clear(Partition::EmbeddingsCache).unwrap();

        assert_eq!(store.get(Partition::EmbeddingsCache, "k1").unwrap(), None);
        assert_eq!(
            store.get(Partition::NoteEmbeddings, "k1").unwrap(),
            Some(vec![2.0])
        );
    }

    #[test]
    fn test_entries_lists_all_keys() {
        let (_dir, store) = temp_store();

        store.set(Partition::NoteEmbeddings, "1", &[1.0, 0.0]).unwrap();
        store.set(Partition::NoteEmbeddings, "2", &[0.0, 1.0]).unwrap();

        let mut entries = store.entries(Partition::NoteEmbeddings).unwrap();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        assert_eq!(
            entries,
            vec![
                ("1".to_string(), vec![1.0, 0.0]),
                ("2".to_string(), vec![0.0, 1.0]),
            ]
        );
    }

    #[test]
    fn test_entries_ordered_by_write_time() {
        let (_dir, store) = temp_store();

        for (key, age_secs) in [("a", 10), ("b", 30), ("c", 20)] {
            store.set(Partition::NoteEmbeddings, key, &[1.0]).unwrap();
            let path = store.root().join("note_embeddings").join(format!("{key}.vec"));
            File::options()
                .write(true)
                .open(path)
                .unwrap()
                .set_modified(SystemTime::now() - std::time::Duration::from_secs(age_secs))
                .unwrap();
        }

        let keys: Vec<String> = store
            .entries(Partition::NoteEmbeddings)
            .unwrap()
            .into_iter()
            .map(|(key, _)| key)
            .collect();

        assert_eq!(keys, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_entries_of_missing_partition_is_empty() {
        let (_dir, store) = temp_store();
        assert!(store.entries(Partition::EmbeddingsCache).unwrap().is_empty());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (_dir, store) = temp_store();

        store.set(Partition::NoteEmbeddings, "7", &[1.0]).unwrap();
        store.delete(Partition::NoteEmbeddings, "7").unwrap();
        store.delete(Partition::NoteEmbeddings, "7").unwrap();

        assert_eq!(store.get(Partition::NoteEmbeddings, "7").unwrap(), None);
    }

    #[test]
    fn test_clear_missing_partition() {
        let (_dir, store) = temp_store();
        assert!(store.clear(Partition::NoteEmbeddings).is_ok());
    }

    #[test]
    fn test_rejects_path_like_keys() {
        let (_dir, store) = temp_store();

        for key in ["", "../escape", "a/b", "a.b"] {
            let result = store.set(Partition::NoteEmbeddings, key, &[1.0]);
            assert!(
                matches!(result, Err(StoreError::InvalidKey(_))),
                "key {key:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let (_dir, store) = temp_store();

        store.set(Partition::EmbeddingsCache, "abc", &[1.0, 2.0]).unwrap();

        let names: Vec<String> = fs::read_dir(store.root().join("embeddings_cache"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["abc.vec".to_string()]);
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let (_dir, store) = temp_store();

        store
            .set(Partition::NoteEmbeddings, "1", &[1.0, 0.0, 0.0])
            .unwrap();

        let path = store.root().join("note_embeddings").join("1.vec");
        let mut bytes = fs::read(&path).unwrap();
        bytes[HEADER_SIZE + 1] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let result = store.get(Partition::NoteEmbeddings, "1");
        assert!(matches!(result, Err(StoreError::ChecksumMismatch)));

        // corrupt records are skipped when listing
        assert!(store.entries(Partition::NoteEmbeddings).unwrap().is_empty());
    }

    #[test]
    fn test_decode_rejects_unknown_version() {
        let mut bytes = encode_vector(&[1.0]).unwrap();
        bytes[0] = 9;
        assert!(matches!(
            decode_vector(&bytes),
            Err(StoreError::VersionMismatch(9, FORMAT_VERSION))
        ));
    }

    #[test]
    fn test_decode_rejects_truncated_record() {
        let bytes = encode_vector(&[1.0, 2.0]).unwrap();
        assert!(matches!(
            decode_vector(&bytes[..bytes.len() - 1]),
            Err(StoreError::InvalidFormat(_))
        ));
        assert!(matches!(
            decode_vector(&bytes[..3]),
            Err(StoreError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_encode_preserves_bits() {
        let vector = vec![f32::MIN_POSITIVE, -0.0, 1.0e-7, 384.5];
        let decoded = decode_vector(&encode_vector(&vector).unwrap()).unwrap();
        let bits = |v: &[f32]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&decoded), bits(&vector));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryVectorStore::new();

        store.set(Partition::EmbeddingsCache, "a", &[1.0]).unwrap();
        store.set(Partition::NoteEmbeddings, "1", &[2.0]).unwrap();
        assert_eq!(store.len(Partition::EmbeddingsCache), 1);

        store.delete(Partition::EmbeddingsCache, "missing").unwrap();
        store.clear(Partition::EmbeddingsCache).unwrap();

        assert_eq!(store.len(Partition::EmbeddingsCache), 0);
        assert_eq!(
            store.get(Partition::NoteEmbeddings, "1").unwrap(),
            Some(vec![2.0])
        );
    }
}
