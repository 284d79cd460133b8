//! Shared fixtures for silt-lake integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use silt_lake::{collect, CommitMessage, Lake, LocalLake, VecPuller};
use silt_storage::{Id, Layout, MemoryStore, SharedStore, StorageUri, Value};
use tokio_util::sync::CancellationToken;

/// Lake over a fresh in-memory backend.
pub fn memory_lake() -> LocalLake {
    let store: SharedStore = Arc::new(MemoryStore::new());
    LocalLake::with_store(store, StorageUri::parse("mem://lake").unwrap())
}

/// Records `{ts: k, msg: "r<k>"}`.
pub fn records(keys: &[i64]) -> Vec<Value> {
    keys.iter()
        .map(|k| {
            Value::record([
                ("ts", Value::Int(*k)),
                ("msg", Value::from(format!("r{}", k))),
            ])
        })
        .collect()
}

/// Key of every record.
pub fn keys(values: &[Value]) -> Vec<i64> {
    values
        .iter()
        .map(|v| v.path("ts").as_int().unwrap())
        .collect()
}

/// Pool keyed on `ts` with default stride and threshold.
pub async fn create_pool(lake: &dyn Lake, name: &str, layout: &str) -> Id {
    let layout: Layout = layout.parse().unwrap();
    lake.create_pool(name, layout, 0, 0).await.unwrap().id
}

/// Load `keys` on `branch` and return the commit.
pub async fn load_keys(lake: &dyn Lake, pool: Id, branch: &str, keys: &[i64]) -> Id {
    let mut input = VecPuller::new(records(keys), 16);
    lake.load(
        pool,
        branch,
        &mut input,
        &CommitMessage::new("load"),
        &CancellationToken::new(),
    )
    .await
    .unwrap()
}

/// Run `source` against `head` and collect everything.
pub async fn query_all(lake: &dyn Lake, head: &str, source: &str) -> Vec<Value> {
    let mut scan = lake
        .query(head, source, &CancellationToken::new())
        .await
        .unwrap();
    collect(scan.as_mut()).await.unwrap()
}

/// Object ids at the tip of `head`, in key order.
pub async fn object_ids(lake: &dyn Lake, head: &str) -> Vec<Id> {
    query_all(lake, head, ":objects")
        .await
        .iter()
        .map(|row| row.path("id").as_str().unwrap().parse().unwrap())
        .collect()
}
