//! Shared fixtures for silt-meta integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use silt_meta::{CommitObject, CommitStore, DEFAULT_AUTHOR};
use silt_storage::{DataObject, Id, MemoryStore, SharedStore, StorageUri, Value};

/// Commit store over a fresh in-memory backend.
pub fn memory_commits() -> (SharedStore, CommitStore) {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let dir = StorageUri::parse("mem://lake/pool/commits").unwrap();
    (store.clone(), CommitStore::new(store, dir))
}

/// Object metadata covering `[min, max]`.
pub fn object(min: i64, max: i64) -> DataObject {
    DataObject {
        id: Id::new(),
        min: Value::Int(min),
        max: Value::Int(max),
        count: (max - min + 1) as u64,
        size: 128,
        created: None,
    }
}

/// Commit adding `objects` on top of `parent`.
pub async fn commit_adds(commits: &CommitStore, parent: Id, objects: &[&DataObject]) -> Id {
    let mut c = CommitObject::new(parent, 0, DEFAULT_AUTHOR, "add");
    for o in objects {
        c.append_add(o);
    }
    commits.put(c).await.unwrap().id()
}

/// Commit deleting `ids` on top of `parent`.
pub async fn commit_deletes(commits: &CommitStore, parent: Id, ids: &[Id]) -> Id {
    let mut c = CommitObject::new(parent, 0, DEFAULT_AUTHOR, "delete");
    for id in ids {
        c.append_delete(*id);
    }
    commits.put(c).await.unwrap().id()
}
