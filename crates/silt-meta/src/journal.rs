//! Append-only journal queue on top of the object store.
//!
//! Entries occupy numbered slots `<n>.bin` starting at 1. A writer claims the
//! slot after the head with a conditional put, so two writers racing for the
//! same position cannot both succeed. `HEAD` is a hint only; readers probe
//! forward from it to find the true head.

use bytes::Bytes;
use silt_storage::{SharedStore, StorageUri, BLOB_EXT};
use tracing::{debug, warn};

use crate::error::{MetaError, MetaResult};

/// Journal position. Zero means no entries.
pub type Position = u64;

/// Attempts made by [`Queue::commit`] before giving up.
pub const MAX_COMMIT_RETRIES: usize = 10;

const HEAD: &str = "HEAD";
const TAIL: &str = "TAIL";

/// A journal queue rooted at a directory.
#[derive(Clone)]
pub struct Queue {
    store: SharedStore,
    dir: StorageUri,
}

impl Queue {
    /// Journal rooted at `dir`. Nothing is written until the first commit.
    pub fn new(store: SharedStore, dir: StorageUri) -> Self {
        Self { store, dir }
    }

    /// Root directory.
    pub fn dir(&self) -> &StorageUri {
        &self.dir
    }

    fn slot(&self, n: Position) -> StorageUri {
        self.dir.join(&format!("{}.{}", n, BLOB_EXT))
    }

    async fn read_marker(&self, name: &str) -> MetaResult<Option<Position>> {
        match self.store.get(&self.dir.join(name)).await {
            Ok(data) => {
                let text = String::from_utf8_lossy(&data);
                let n = text.trim().parse::<Position>().map_err(|e| {
                    MetaError::InvalidArgument(format!("journal {} marker: {}", name, e))
                })?;
                Ok(Some(n))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Current head position.
    pub async fn read_head(&self) -> MetaResult<Position> {
        let mut head = self.read_marker(HEAD).await?.unwrap_or(0);
        while self.store.exists(&self.slot(head + 1)).await? {
            head += 1;
        }
        Ok(head)
    }

    /// Oldest retained position.
    pub async fn read_tail(&self) -> MetaResult<Position> {
        Ok(self.read_marker(TAIL).await?.unwrap_or(1))
    }

    /// Read entry `n`.
    pub async fn load(&self, n: Position) -> MetaResult<Bytes> {
        match self.store.get(&self.slot(n)).await {
            Ok(data) => Ok(data),
            Err(e) if e.is_not_found() => {
                Err(MetaError::NotFound(format!("journal entry {}", n)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Append `data` at position `at + 1`; `Conflict` if another writer got
    /// there first.
    pub async fn commit_at(&self, at: Position, data: Bytes) -> MetaResult<Position> {
        let next = at + 1;
        match self.store.put_if_absent(&self.slot(next), data).await {
            Ok(()) => {}
            Err(e) if e.kind() == silt_storage::ErrorKind::Exists => {
                return Err(MetaError::Conflict(format!(
                    "journal {} position {} already taken",
                    self.dir, next
                )))
            }
            Err(e) => return Err(e.into()),
        }
        if next == 1 {
            if let Err(e) = self.store.put(&self.dir.join(TAIL), Bytes::from("1")).await {
                warn!(journal = %self.dir, error = %e, "failed to write journal tail");
            }
        }
        if let Err(e) = self
            .store
            .put(&self.dir.join(HEAD), Bytes::from(next.to_string()))
            .await
        {
            warn!(journal = %self.dir, error = %e, "failed to update journal head hint");
        }
        debug!(journal = %self.dir, position = next, "journal entry committed");
        Ok(next)
    }

    /// Append `data` after whatever the head currently is.
    pub async fn commit(&self, data: Bytes) -> MetaResult<Position> {
        for _ in 0..MAX_COMMIT_RETRIES {
            let head = self.read_head().await?;
            match self.commit_at(head, data.clone()).await {
                Err(MetaError::Conflict(_)) => continue,
                result => return result,
            }
        }
        Err(MetaError::Conflict(format!(
            "journal {}: gave up after {} attempts",
            self.dir, MAX_COMMIT_RETRIES
        )))
    }
}
