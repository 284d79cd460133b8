//! Integration tests for commit folding, patches and registries.

mod common;

use std::sync::Arc;

use common::{commit_adds, commit_deletes, memory_commits, object};
use silt_meta::{
    BranchConfig, CommitStore, MetaError, PoolConfig, Registry, View, DEFAULT_AUTHOR,
};
use silt_storage::{FileStore, Id, Layout, SharedStore, StorageUri};

#[tokio::test]
async fn test_snapshot_fold_add_delete() {
    let (_, commits) = memory_commits();
    let a = object(0, 1);
    let b = object(2, 3);
    let c = object(4, 5);
    let t1 = commit_adds(&commits, Id::nil(), &[&a]).await;
    let t2 = commit_adds(&commits, t1, &[&b]).await;
    let t3 = commit_deletes(&commits, t2, &[a.id]).await;
    let t4 = commit_adds(&commits, t3, &[&c]).await;

    let snap = commits.snapshot(t4).await.unwrap();
    let mut ids: Vec<Id> = snap.select_all().iter().map(|o| o.id).collect();
    ids.sort();
    let mut want = vec![b.id, c.id];
    want.sort();
    assert_eq!(ids, want);
    assert_eq!(commits.path(t4).await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_delete_of_missing_object_fails_fold() {
    let (_, commits) = memory_commits();
    let a = object(0, 1);
    let t1 = commit_adds(&commits, Id::nil(), &[&a]).await;
    let t2 = commit_deletes(&commits, t1, &[Id::new()]).await;
    let err = commits.snapshot(t2).await.unwrap_err();
    assert!(matches!(err, MetaError::WriteConflict(_)));
}

#[tokio::test]
async fn test_snapshot_from_cached_ancestor() {
    let (_, commits) = memory_commits();
    let a = object(0, 1);
    let t1 = commit_adds(&commits, Id::nil(), &[&a]).await;
    assert_eq!(commits.snapshot(t1).await.unwrap().len(), 1);
    let b = object(5, 6);
    let t2 = commit_adds(&commits, t1, &[&b]).await;
    assert_eq!(commits.snapshot(t2).await.unwrap().len(), 2);
    assert_eq!(commits.snapshot(t1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_undo_round_trip() {
    let (_, commits) = memory_commits();
    let a = object(0, 1);
    let b = object(2, 3);
    let t1 = commit_adds(&commits, Id::nil(), &[&a, &b]).await;

    let mut c = silt_meta::CommitObject::new(t1, 0, DEFAULT_AUTHOR, "compact");
    let merged = object(0, 3);
    c.append_delete(a.id);
    c.append_delete(b.id);
    c.append_add(&merged);
    let t2 = commits.put(c).await.unwrap().id();
    let before = commits.snapshot(t2).await.unwrap();

    let patch = commits.patch_of_commit(t2).await.unwrap();
    let tip: Arc<dyn View> = before.clone();
    let undo = patch.undo(tip).unwrap();
    let t3 = commits
        .put(undo.new_commit(t2, 0, DEFAULT_AUTHOR, "revert").unwrap())
        .await
        .unwrap()
        .id();
    assert_eq!(
        commits.snapshot(t3).await.unwrap().select_all(),
        commits.snapshot(t1).await.unwrap().select_all()
    );

    let redo = patch.rebase(commits.snapshot(t3).await.unwrap()).unwrap();
    let t4 = commits
        .put(redo.new_commit(t3, 0, DEFAULT_AUTHOR, "redo").unwrap())
        .await
        .unwrap()
        .id();
    assert_eq!(*commits.snapshot(t4).await.unwrap(), *before);
}

#[tokio::test]
async fn test_commit_store_on_local_files() {
    let dir = tempfile::tempdir().unwrap();
    let root = StorageUri::parse(&format!("file://{}", dir.path().display())).unwrap();
    let store: SharedStore = Arc::new(FileStore::new());
    let commits_dir = root.join("pool").join("commits");
    let commits = CommitStore::new(store.clone(), commits_dir.clone());
    let a = object(0, 9);
    let t1 = commit_adds(&commits, Id::nil(), &[&a]).await;

    let reopened = CommitStore::new(store, commits_dir);
    let snap = reopened.snapshot(t1).await.unwrap();
    assert_eq!(snap.lookup(a.id).map(|o| o.count), Some(10));
}

#[tokio::test]
async fn test_pool_and_branch_registries() {
    let (store, _) = memory_commits();
    let pools: Registry<PoolConfig> =
        Registry::new(store.clone(), StorageUri::parse("mem://lake/pools").unwrap());
    let pool = PoolConfig::new("logs", Layout::asc("ts"), 0, 0);
    pools.insert(pool.clone()).await.unwrap();
    let found = pools.find(|p| p.id == pool.id).await.unwrap().unwrap();
    assert_eq!(found.name, "logs");

    let id = pool.id;
    pools.rename("logs", "events", |p| p.id == id).await.unwrap();
    assert!(pools.lookup("logs").await.unwrap().is_none());
    assert_eq!(pools.lookup("events").await.unwrap().unwrap().id, id);

    let branches: Registry<BranchConfig> = Registry::new(
        store,
        StorageUri::parse(&format!("mem://lake/{}/branches", id)).unwrap(),
    );
    branches.insert(BranchConfig::new("main", Id::nil())).await.unwrap();
    let tip = Id::new();
    branches
        .update(BranchConfig::new("main", tip), |b| b.commit.is_nil())
        .await
        .unwrap();
    let stale = branches
        .update(BranchConfig::new("main", Id::new()), |b| b.commit.is_nil())
        .await
        .unwrap_err();
    assert!(matches!(stale, MetaError::Constraint(_)));
}
