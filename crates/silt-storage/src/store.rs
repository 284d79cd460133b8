//! Object store abstraction over local files and object storage.
//!
//! Every backend gives whole-blob atomic puts: a concurrent `get` sees either
//! the old content, the new content, or not-found, never a prefix.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, trace, warn};

use crate::error::{StorageError, StorageResult};
use crate::id::Id;
use crate::uri::{StorageUri, FILE_SCHEME, MEM_SCHEME};

/// Shared handle to an object store, bound once per lake.
pub type SharedStore = Arc<dyn ObjectStore>;

/// Capability interface implemented by every storage backend.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read an entire blob.
    async fn get(&self, uri: &StorageUri) -> StorageResult<Bytes>;
    /// Positional read of up to `len` bytes starting at `offset`.
    async fn get_range(&self, uri: &StorageUri, offset: u64, len: u64) -> StorageResult<Bytes>;
    /// Replace a blob atomically.
    async fn put(&self, uri: &StorageUri, data: Bytes) -> StorageResult<()>;
    /// Create a blob only if nothing exists at `uri`; `Exists` otherwise.
    async fn put_if_absent(&self, uri: &StorageUri, data: Bytes) -> StorageResult<()>;
    /// Check whether a blob exists.
    async fn exists(&self, uri: &StorageUri) -> StorageResult<bool>;
    /// Size of a blob in bytes.
    async fn size(&self, uri: &StorageUri) -> StorageResult<u64>;
    /// Remove a blob; missing blobs are not an error.
    async fn delete(&self, uri: &StorageUri) -> StorageResult<()>;
    /// Remove every blob beneath `prefix/`; missing prefixes are not an error.
    async fn delete_by_prefix(&self, prefix: &StorageUri) -> StorageResult<()>;
    /// List every blob beneath `prefix/`, sorted by URI.
    async fn list(&self, prefix: &StorageUri) -> StorageResult<Vec<StorageUri>>;
}

/// Open the backend for `root`'s scheme.
pub fn open_store(root: &StorageUri) -> StorageResult<SharedStore> {
    match root.scheme() {
        FILE_SCHEME => Ok(Arc::new(FileStore::new())),
        MEM_SCHEME => Ok(Arc::new(MemoryStore::new())),
        other => Err(StorageError::UnsupportedScheme(other.to_string())),
    }
}

/// Local filesystem backend.
///
/// Puts go to a temp file in the target directory which is then renamed
/// (or hard-linked for `put_if_absent`) into place.
#[derive(Debug, Default, Clone)]
pub struct FileStore;

impl FileStore {
    /// Create a file backend.
    pub fn new() -> Self {
        FileStore
    }

    fn path_of(uri: &StorageUri) -> StorageResult<PathBuf> {
        uri.to_file_path()
            .ok_or_else(|| StorageError::UnsupportedScheme(uri.scheme().to_string()))
    }

    async fn write_temp(uri: &StorageUri, path: &Path, data: &[u8]) -> StorageResult<PathBuf> {
        let dir = path
            .parent()
            .ok_or_else(|| StorageError::InvalidUri(uri.to_string()))?;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| StorageError::io(uri, e))?;
        let tmp = dir.join(format!(".{}.{}.tmp", uri.name(), Id::new()));
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| StorageError::io(uri, e))?;
        let written = async {
            file.write_all(data).await?;
            file.sync_all().await
        }
        .await;
        if let Err(e) = written {
            Self::remove_temp(&tmp).await;
            return Err(StorageError::io(uri, e));
        }
        Ok(tmp)
    }

    async fn remove_temp(tmp: &Path) {
        if let Err(e) = tokio::fs::remove_file(tmp).await {
            warn!(path = %tmp.display(), error = %e, "failed to remove temp file");
        }
    }

    async fn walk(root: &StorageUri, dir: PathBuf) -> StorageResult<Vec<StorageUri>> {
        let mut out = Vec::new();
        let mut stack = vec![dir];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::io(root, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StorageError::io(root, e))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| StorageError::io(root, e))?;
                if file_type.is_dir() {
                    stack.push(entry.path());
                } else {
                    out.push(StorageUri::parse(&entry.path().to_string_lossy())?);
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

#[async_trait]
impl ObjectStore for FileStore {
    async fn get(&self, uri: &StorageUri) -> StorageResult<Bytes> {
        let path = Self::path_of(uri)?;
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| StorageError::io(uri, e))?;
        trace!(uri = %uri, bytes = data.len(), "file get");
        Ok(Bytes::from(data))
    }

    async fn get_range(&self, uri: &StorageUri, offset: u64, len: u64) -> StorageResult<Bytes> {
        let path = Self::path_of(uri)?;
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| StorageError::io(uri, e))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| StorageError::io(uri, e))?
            .len();
        let start = offset.min(size);
        let end = offset.saturating_add(len).min(size);
        file.seek(std::io::SeekFrom::Start(start))
            .await
            .map_err(|e| StorageError::io(uri, e))?;
        let mut buf = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buf)
            .await
            .map_err(|e| StorageError::io(uri, e))?;
        Ok(Bytes::from(buf))
    }

    async fn put(&self, uri: &StorageUri, data: Bytes) -> StorageResult<()> {
        let path = Self::path_of(uri)?;
        let tmp = Self::write_temp(uri, &path, &data).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            Self::remove_temp(&tmp).await;
            return Err(StorageError::io(uri, e));
        }
        debug!(uri = %uri, bytes = data.len(), "file put");
        Ok(())
    }

    async fn put_if_absent(&self, uri: &StorageUri, data: Bytes) -> StorageResult<()> {
        let path = Self::path_of(uri)?;
        let tmp = Self::write_temp(uri, &path, &data).await?;
        let linked = tokio::fs::hard_link(&tmp, &path).await;
        Self::remove_temp(&tmp).await;
        linked.map_err(|e| StorageError::io(uri, e))?;
        debug!(uri = %uri, bytes = data.len(), "file put_if_absent");
        Ok(())
    }

    async fn exists(&self, uri: &StorageUri) -> StorageResult<bool> {
        let path = Self::path_of(uri)?;
        match tokio::fs::metadata(&path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io(uri, e)),
        }
    }

    async fn size(&self, uri: &StorageUri) -> StorageResult<u64> {
        let path = Self::path_of(uri)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| StorageError::io(uri, e))?;
        Ok(meta.len())
    }

    async fn delete(&self, uri: &StorageUri) -> StorageResult<()> {
        let path = Self::path_of(uri)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(uri, e)),
        }
    }

    async fn delete_by_prefix(&self, prefix: &StorageUri) -> StorageResult<()> {
        let path = Self::path_of(prefix)?;
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(prefix, e)),
        }
    }

    async fn list(&self, prefix: &StorageUri) -> StorageResult<Vec<StorageUri>> {
        let path = Self::path_of(prefix)?;
        Self::walk(prefix, path).await
    }
}

/// Operation counters for the in-memory backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStoreStats {
    /// Number of put operations.
    pub puts: u64,
    /// Number of get and get_range operations.
    pub gets: u64,
    /// Number of blobs removed.
    pub deletes: u64,
    /// Number of list operations.
    pub list_calls: u64,
    /// Total bytes currently stored.
    pub bytes_stored: u64,
}

#[derive(Default)]
struct MemoryInner {
    blobs: BTreeMap<String, (StorageUri, Bytes)>,
    stats: MemoryStoreStats,
}

/// In-memory object backend serving the `mem` scheme.
///
/// Clones share the same blob map.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of operation counters.
    pub fn stats(&self) -> MemoryStoreStats {
        self.inner.lock().stats.clone()
    }

    /// Number of stored blobs.
    pub fn stored_count(&self) -> usize {
        self.inner.lock().blobs.len()
    }

    fn insert(&self, uri: &StorageUri, data: Bytes, only_if_absent: bool) -> StorageResult<()> {
        let key = uri.to_string();
        let mut inner = self.inner.lock();
        if only_if_absent && inner.blobs.contains_key(&key) {
            return Err(StorageError::Exists { uri: key });
        }
        let added = data.len() as u64;
        let removed = inner
            .blobs
            .insert(key, (uri.clone(), data))
            .map(|(_, old)| old.len() as u64)
            .unwrap_or(0);
        inner.stats.puts += 1;
        inner.stats.bytes_stored = inner.stats.bytes_stored.saturating_sub(removed) + added;
        Ok(())
    }

    fn lookup(&self, uri: &StorageUri) -> StorageResult<Bytes> {
        let mut inner = self.inner.lock();
        inner.stats.gets += 1;
        inner
            .blobs
            .get(&uri.to_string())
            .map(|(_, data)| data.clone())
            .ok_or_else(|| StorageError::NotFound {
                uri: uri.to_string(),
            })
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, uri: &StorageUri) -> StorageResult<Bytes> {
        self.lookup(uri)
    }

    async fn get_range(&self, uri: &StorageUri, offset: u64, len: u64) -> StorageResult<Bytes> {
        let data = self.lookup(uri)?;
        let size = data.len() as u64;
        let start = offset.min(size) as usize;
        let end = offset.saturating_add(len).min(size) as usize;
        Ok(data.slice(start..end))
    }

    async fn put(&self, uri: &StorageUri, data: Bytes) -> StorageResult<()> {
        self.insert(uri, data, false)
    }

    async fn put_if_absent(&self, uri: &StorageUri, data: Bytes) -> StorageResult<()> {
        self.insert(uri, data, true)
    }

    async fn exists(&self, uri: &StorageUri) -> StorageResult<bool> {
        Ok(self.inner.lock().blobs.contains_key(&uri.to_string()))
    }

    async fn size(&self, uri: &StorageUri) -> StorageResult<u64> {
        self.inner
            .lock()
            .blobs
            .get(&uri.to_string())
            .map(|(_, data)| data.len() as u64)
            .ok_or_else(|| StorageError::NotFound {
                uri: uri.to_string(),
            })
    }

    async fn delete(&self, uri: &StorageUri) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if let Some((_, old)) = inner.blobs.remove(&uri.to_string()) {
            inner.stats.deletes += 1;
            inner.stats.bytes_stored = inner.stats.bytes_stored.saturating_sub(old.len() as u64);
        }
        Ok(())
    }

    async fn delete_by_prefix(&self, prefix: &StorageUri) -> StorageResult<()> {
        {
            let mut inner = self.inner.lock();
            let doomed: Vec<String> = inner
                .blobs
                .values()
                .filter(|(uri, _)| uri.is_under(prefix))
                .map(|(uri, _)| uri.to_string())
                .collect();
            for key in doomed {
                if let Some((_, old)) = inner.blobs.remove(&key) {
                    inner.stats.deletes += 1;
                    inner.stats.bytes_stored =
                        inner.stats.bytes_stored.saturating_sub(old.len() as u64);
                }
            }
        }
        debug!(prefix = %prefix, "mem delete_by_prefix");
        Ok(())
    }

    async fn list(&self, prefix: &StorageUri) -> StorageResult<Vec<StorageUri>> {
        let mut uris: Vec<StorageUri> = {
            let mut inner = self.inner.lock();
            inner.stats.list_calls += 1;
            inner
                .blobs
                .values()
                .filter(|(uri, _)| uri.is_under(prefix))
                .map(|(uri, _)| uri.clone())
                .collect()
        };
        uris.sort();
        Ok(uris)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_uri(path: &str) -> StorageUri {
        StorageUri::parse(&format!("mem://test{}", path)).unwrap()
    }

    #[tokio::test]
    async fn test_memory_put_get() {
        let store = MemoryStore::new();
        let uri = mem_uri("/a/b.bin");
        store.put(&uri, Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(store.get(&uri).await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(store.size(&uri).await.unwrap(), 5);
        assert!(store.exists(&uri).await.unwrap());
        assert_eq!(store.stats().puts, 1);
    }

    #[tokio::test]
    async fn test_memory_get_range_clamps() {
        let store = MemoryStore::new();
        let uri = mem_uri("/r.bin");
        store.put(&uri, Bytes::from_static(b"0123456789")).await.unwrap();
        assert_eq!(store.get_range(&uri, 2, 3).await.unwrap(), Bytes::from_static(b"234"));
        assert_eq!(store.get_range(&uri, 8, 10).await.unwrap(), Bytes::from_static(b"89"));
        assert!(store.get_range(&uri, 20, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_put_if_absent() {
        let store = MemoryStore::new();
        let uri = mem_uri("/once");
        store.put_if_absent(&uri, Bytes::from_static(b"1")).await.unwrap();
        let err = store
            .put_if_absent(&uri, Bytes::from_static(b"2"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Exists { .. }));
        assert_eq!(store.get(&uri).await.unwrap(), Bytes::from_static(b"1"));
    }

    #[tokio::test]
    async fn test_memory_delete_swallows_not_found() {
        let store = MemoryStore::new();
        store.delete(&mem_uri("/missing")).await.unwrap();
        let err = store.get(&mem_uri("/missing")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_memory_list_and_delete_by_prefix() {
        let store = MemoryStore::new();
        for path in ["/p/data/1.bin", "/p/data/2.bin", "/p/commits/c.bin", "/p/database"] {
            store.put(&mem_uri(path), Bytes::from_static(b"x")).await.unwrap();
        }
        let data = mem_uri("/p/data");
        let listed = store.list(&data).await.unwrap();
        assert_eq!(listed.len(), 2);
        store.delete_by_prefix(&data).await.unwrap();
        assert!(store.list(&data).await.unwrap().is_empty());
        assert_eq!(store.stored_count(), 2);
    }

    #[tokio::test]
    async fn test_file_put_get_range_list() {
        let dir = tempfile::tempdir().unwrap();
        let root = StorageUri::parse(&dir.path().to_string_lossy()).unwrap();
        let store = FileStore::new();
        let uri = root.join("pool").join("obj.bin");
        store.put(&uri, Bytes::from_static(b"abcdef")).await.unwrap();
        assert_eq!(store.get_range(&uri, 1, 2).await.unwrap(), Bytes::from_static(b"bc"));
        assert_eq!(store.size(&uri).await.unwrap(), 6);

        let listed = store.list(&root).await.unwrap();
        assert_eq!(listed, vec![uri.clone()]);
    }

    #[tokio::test]
    async fn test_file_put_if_absent_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let root = StorageUri::parse(&dir.path().to_string_lossy()).unwrap();
        let store = FileStore::new();
        let uri = root.join("journal").join("1.bin");
        store.put_if_absent(&uri, Bytes::from_static(b"a")).await.unwrap();
        let err = store
            .put_if_absent(&uri, Bytes::from_static(b"b"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Exists { .. }));
        // No temp files survive a failed conditional put.
        assert_eq!(store.list(&root).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_delete_missing_ok() {
        let dir = tempfile::tempdir().unwrap();
        let root = StorageUri::parse(&dir.path().to_string_lossy()).unwrap();
        let store = FileStore::new();
        store.delete(&root.join("nope")).await.unwrap();
        store.delete_by_prefix(&root.join("nodir")).await.unwrap();
        assert!(store.list(&root.join("nodir")).await.unwrap().is_empty());
    }

    #[test]
    fn test_open_store_by_scheme() {
        assert!(open_store(&StorageUri::parse("mem://b").unwrap()).is_ok());
        assert!(open_store(&StorageUri::parse("/tmp/lake").unwrap()).is_ok());
        assert!(matches!(
            open_store(&StorageUri::parse("s3://b/x").unwrap()),
            Err(StorageError::UnsupportedScheme(_))
        ));
    }
}
