//! Journaled registry of named configuration entries.
//!
//! The table is the fold of every journal entry; each journal entry is a
//! batch of [`Update`]s applied atomically. Mutations are compare-and-swap
//! against the journal head: the caller's checks run against the table at
//! head `n`, and the batch is committed at `n + 1` or retried.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use silt_storage::{SharedStore, StorageError, StorageUri, BLOB_EXT};
use tracing::{debug, warn};

use crate::error::{MetaError, MetaResult};
use crate::journal::{Position, Queue, MAX_COMMIT_RETRIES};

/// Journal entries between persisted table snapshots.
pub const SNAPSHOT_INTERVAL: u64 = 10;

/// A registry entry keyed by name.
pub trait Entry: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique key.
    fn key(&self) -> &str;
    /// Copy of the entry under a different key.
    fn with_key(&self, key: &str) -> Self;
}

/// One change to the table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Update<E> {
    /// Insert a new entry.
    Add(E),
    /// Remove the entry with this key.
    Delete(E),
    /// Replace the entry with this key.
    Update(E),
}

#[derive(Serialize, Deserialize)]
struct TableSnapshot<E> {
    at: Position,
    entries: BTreeMap<String, E>,
}

type Table<E> = Arc<BTreeMap<String, E>>;

struct Cached<E> {
    head: Position,
    table: Table<E>,
    snapshot_at: Position,
}

/// Registry of entries stored in a journal directory.
pub struct Registry<E: Entry> {
    journal: Queue,
    store: SharedStore,
    snapshot_uri: StorageUri,
    cache: Mutex<Option<Cached<E>>>,
}

impl<E: Entry> Registry<E> {
    /// Registry journaled under `dir`.
    pub fn new(store: SharedStore, dir: StorageUri) -> Self {
        Self {
            journal: Queue::new(store.clone(), dir.clone()),
            snapshot_uri: dir.join(&format!("snap.{}", BLOB_EXT)),
            store,
            cache: Mutex::new(None),
        }
    }

    fn apply(table: &mut BTreeMap<String, E>, update: Update<E>) {
        match update {
            Update::Add(e) | Update::Update(e) => {
                table.insert(e.key().to_string(), e);
            }
            Update::Delete(e) => {
                table.remove(e.key());
            }
        }
    }

    async fn load_snapshot(&self, head: Position) -> (Position, BTreeMap<String, E>) {
        match self.store.get(&self.snapshot_uri).await {
            Ok(data) => match bincode::deserialize::<TableSnapshot<E>>(&data) {
                Ok(snap) if snap.at <= head => return (snap.at, snap.entries),
                Ok(snap) => {
                    warn!(registry = %self.journal.dir(), at = snap.at, head, "table snapshot ahead of journal")
                }
                Err(e) => warn!(registry = %self.journal.dir(), error = %e, "unreadable table snapshot"),
            },
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(registry = %self.journal.dir(), error = %e, "table snapshot read failed"),
        }
        (0, BTreeMap::new())
    }

    async fn write_snapshot(&self, at: Position, entries: &BTreeMap<String, E>) {
        let snap = TableSnapshot {
            at,
            entries: entries.clone(),
        };
        let data = match bincode::serialize(&snap) {
            Ok(data) => data,
            Err(e) => {
                warn!(registry = %self.journal.dir(), error = %e, "failed to encode table snapshot");
                return;
            }
        };
        match self.store.put(&self.snapshot_uri, Bytes::from(data)).await {
            Ok(()) => debug!(registry = %self.journal.dir(), at, "table snapshot written"),
            Err(e) => warn!(registry = %self.journal.dir(), error = %e, "failed to write table snapshot"),
        }
    }

    /// The table at the current journal head.
    async fn table(&self) -> MetaResult<(Position, Table<E>)> {
        let head = self.journal.read_head().await?;
        let cached = self
            .cache
            .lock()
            .as_ref()
            .map(|c| (c.head, c.table.clone(), c.snapshot_at));
        let (mut at, mut entries, mut snapshot_at) = match cached {
            Some((at, table, _)) if at == head => return Ok((at, table)),
            Some((at, table, snapshot_at)) if at < head => (at, (*table).clone(), snapshot_at),
            _ => {
                let (at, entries) = self.load_snapshot(head).await;
                (at, entries, at)
            }
        };
        while at < head {
            at += 1;
            let data = self.journal.load(at).await?;
            let updates: Vec<Update<E>> =
                bincode::deserialize(&data).map_err(StorageError::from)?;
            for update in updates {
                Self::apply(&mut entries, update);
            }
        }
        if head - snapshot_at > SNAPSHOT_INTERVAL {
            self.write_snapshot(head, &entries).await;
            snapshot_at = head;
        }
        let table = Arc::new(entries);
        *self.cache.lock() = Some(Cached {
            head,
            table: table.clone(),
            snapshot_at,
        });
        Ok((head, table))
    }

    /// Commit a batch built from the current table, retrying when another
    /// writer advances the journal first.
    async fn mutate<F>(&self, build: F) -> MetaResult<()>
    where
        F: Fn(&BTreeMap<String, E>) -> MetaResult<Vec<Update<E>>> + Send + Sync,
    {
        for _ in 0..MAX_COMMIT_RETRIES {
            let (at, table) = self.table().await?;
            let updates = build(&table)?;
            let data = bincode::serialize(&updates).map_err(StorageError::from)?;
            match self.journal.commit_at(at, Bytes::from(data)).await {
                Ok(_) => return Ok(()),
                Err(MetaError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(MetaError::Conflict(format!(
            "registry {}: gave up after {} attempts",
            self.journal.dir(),
            MAX_COMMIT_RETRIES
        )))
    }

    /// Entry by key.
    pub async fn lookup(&self, key: &str) -> MetaResult<Option<E>> {
        Ok(self.table().await?.1.get(key).cloned())
    }

    /// First entry matching `pred`.
    pub async fn find<P>(&self, pred: P) -> MetaResult<Option<E>>
    where
        P: Fn(&E) -> bool + Send + Sync,
    {
        Ok(self.table().await?.1.values().find(|e| pred(e)).cloned())
    }

    /// Every entry in key order.
    pub async fn all(&self) -> MetaResult<Vec<E>> {
        Ok(self.table().await?.1.values().cloned().collect())
    }

    /// Add an entry; `Exists` if the key is taken.
    pub async fn insert(&self, entry: E) -> MetaResult<()> {
        self.mutate(|table| {
            if table.contains_key(entry.key()) {
                return Err(MetaError::Exists(format!("{:?}", entry.key())));
            }
            Ok(vec![Update::Add(entry.clone())])
        })
        .await
    }

    /// Remove `key` if `check` accepts the current entry.
    pub async fn delete<P>(&self, key: &str, check: P) -> MetaResult<E>
    where
        P: Fn(&E) -> bool + Send + Sync,
    {
        let removed = Mutex::new(None);
        self.mutate(|table| {
            let current = table
                .get(key)
                .ok_or_else(|| MetaError::NotFound(format!("{:?}", key)))?;
            if !check(current) {
                return Err(MetaError::Constraint(format!("{:?} changed", key)));
            }
            *removed.lock() = Some(current.clone());
            Ok(vec![Update::Delete(current.clone())])
        })
        .await?;
        removed
            .into_inner()
            .ok_or_else(|| MetaError::NotFound(format!("{:?}", key)))
    }

    /// Replace the entry under `entry.key()` if `check` accepts the current one.
    pub async fn update<P>(&self, entry: E, check: P) -> MetaResult<()>
    where
        P: Fn(&E) -> bool + Send + Sync,
    {
        self.mutate(|table| {
            let current = table
                .get(entry.key())
                .ok_or_else(|| MetaError::NotFound(format!("{:?}", entry.key())))?;
            if !check(current) {
                return Err(MetaError::Constraint(format!("{:?} changed", entry.key())));
            }
            Ok(vec![Update::Update(entry.clone())])
        })
        .await
    }

    /// Move the entry at `old` to `new` in a single journal entry.
    pub async fn rename<P>(&self, old: &str, new: &str, check: P) -> MetaResult<()>
    where
        P: Fn(&E) -> bool + Send + Sync,
    {
        self.mutate(|table| {
            let current = table
                .get(old)
                .ok_or_else(|| MetaError::NotFound(format!("{:?}", old)))?;
            if table.contains_key(new) {
                return Err(MetaError::Exists(format!("{:?}", new)));
            }
            if !check(current) {
                return Err(MetaError::Constraint(format!("{:?} changed", old)));
            }
            Ok(vec![
                Update::Delete(current.clone()),
                Update::Add(current.with_key(new)),
            ])
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silt_storage::MemoryStore;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        name: String,
        version: u32,
    }

    impl Entry for Item {
        fn key(&self) -> &str {
            &self.name
        }
        fn with_key(&self, key: &str) -> Self {
            Item {
                name: key.to_string(),
                version: self.version,
            }
        }
    }

    fn item(name: &str, version: u32) -> Item {
        Item {
            name: name.to_string(),
            version,
        }
    }

    fn registry(store: &SharedStore) -> Registry<Item> {
        Registry::new(store.clone(), StorageUri::parse("mem://lake/items").unwrap())
    }

    #[tokio::test]
    async fn test_insert_and_exists() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let r = registry(&store);
        r.insert(item("a", 1)).await.unwrap();
        assert!(matches!(r.insert(item("a", 2)).await, Err(MetaError::Exists(_))));
        assert_eq!(r.lookup("a").await.unwrap(), Some(item("a", 1)));
    }

    #[tokio::test]
    async fn test_delete_with_predicate() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let r = registry(&store);
        r.insert(item("a", 1)).await.unwrap();
        let err = r.delete("a", |e| e.version == 7).await.unwrap_err();
        assert!(matches!(err, MetaError::Constraint(_)));
        assert_eq!(r.delete("a", |e| e.version == 1).await.unwrap(), item("a", 1));
        assert!(matches!(r.delete("a", |_| true).await, Err(MetaError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_rename() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let r = registry(&store);
        r.insert(item("a", 1)).await.unwrap();
        r.insert(item("b", 1)).await.unwrap();
        assert!(matches!(r.rename("a", "b", |_| true).await, Err(MetaError::Exists(_))));
        assert!(matches!(r.rename("z", "y", |_| true).await, Err(MetaError::NotFound(_))));
        r.rename("a", "c", |_| true).await.unwrap();
        let names: Vec<String> = r.all().await.unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_other_process_sees_updates() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let r1 = registry(&store);
        let r2 = registry(&store);
        r1.insert(item("a", 1)).await.unwrap();
        assert!(r2.lookup("a").await.unwrap().is_some());
        r2.update(item("a", 2), |e| e.version == 1).await.unwrap();
        assert_eq!(r1.lookup("a").await.unwrap(), Some(item("a", 2)));
        let err = r1.update(item("a", 3), |e| e.version == 1).await.unwrap_err();
        assert!(matches!(err, MetaError::Constraint(_)));
    }

    #[tokio::test]
    async fn test_snapshot_bounds_replay() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let r = registry(&store);
        for i in 0..15 {
            r.insert(item(&format!("k{:02}", i), i)).await.unwrap();
        }
        assert_eq!(r.all().await.unwrap().len(), 15);
        let snap = StorageUri::parse("mem://lake/items/snap.bin").unwrap();
        assert!(store.exists(&snap).await.unwrap());
        assert_eq!(registry(&store).all().await.unwrap().len(), 15);
    }
}
