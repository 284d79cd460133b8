//! Integration tests for the lake façade, branch commits and scans.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{create_pool, keys, load_keys, memory_lake, object_ids, query_all, records};
use futures::StreamExt;
use silt_lake::{
    CommitMessage, EventKind, KeyRange, Lake, LocalLake, MatchAll, Progress, Puller,
    RemoteLake, SequenceScanner,
};
use silt_meta::{Patch, View};
use silt_storage::{
    DataObject, ErrorKind, Id, ObjectWriter, SharedStore, Value, VectorObject,
};
use tokio_util::sync::CancellationToken;

fn msg(text: &str) -> CommitMessage {
    CommitMessage::new(text)
}

#[tokio::test]
async fn test_load_and_query_in_key_order() {
    let lake = memory_lake();
    let pool = create_pool(&lake, "logs", "ts:asc").await;
    load_keys(&lake, pool, "main", &[5, 1, 3]).await;
    load_keys(&lake, pool, "main", &[2, 4]).await;

    assert_eq!(keys(&query_all(&lake, "", "logs").await), vec![1, 2, 3, 4, 5]);
    assert_eq!(keys(&query_all(&lake, "logs", "range 4 2").await), vec![2, 3, 4]);
    assert_eq!(object_ids(&lake, "logs").await.len(), 2);
}

#[tokio::test]
async fn test_descending_pool_scans_descending() {
    let lake = memory_lake();
    let pool = create_pool(&lake, "logs", "ts:desc").await;
    load_keys(&lake, pool, "main", &[1, 7, 4]).await;
    load_keys(&lake, pool, "main", &[6, 2]).await;
    assert_eq!(keys(&query_all(&lake, "", "logs").await), vec![7, 6, 4, 2, 1]);
}

#[tokio::test]
async fn test_load_splits_at_threshold() {
    let lake = memory_lake();
    let layout = "ts".parse().unwrap();
    let pool = lake.create_pool("logs", layout, 64, 128).await.unwrap().id;
    let input: Vec<i64> = (0..40).rev().collect();
    load_keys(&lake, pool, "main", &input).await;

    let objects = query_all(&lake, "logs", ":objects").await;
    assert!(objects.len() > 1);
    let total: i64 = objects.iter().map(|o| o.path("count").as_int().unwrap()).sum();
    assert_eq!(total, 40);
    assert_eq!(keys(&query_all(&lake, "logs", "").await), (0..40).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_empty_load_is_empty_transaction() {
    let lake = memory_lake();
    let pool = create_pool(&lake, "logs", "ts").await;
    let mut input = silt_lake::VecPuller::new(Vec::new(), 8);
    let err = lake
        .load(pool, "main", &mut input, &msg("nothing"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EmptyTransaction);
    assert!(lake.tip(pool, "main").await.unwrap().is_nil());
}

async fn write_object(store: &SharedStore, lake: &LocalLake, pool: Id, ks: &[i64]) -> DataObject {
    let p = lake.root().open_pool(pool).await.unwrap();
    let mut w = ObjectWriter::new(store.clone(), p.data_dir().clone(), p.layout().clone(), 64);
    for r in records(ks) {
        w.write(&r).unwrap();
    }
    w.close().await.unwrap()
}

#[tokio::test]
async fn test_commit_retries_after_concurrent_commit() {
    let lake = memory_lake();
    let pool = create_pool(&lake, "logs", "ts").await;
    let branch = lake.branch(pool, "main").await.unwrap();
    let store = branch.pool().store().clone();

    let (t0, base) = branch.snapshot().await.unwrap();
    let x = write_object(&store, &lake, pool, &[1, 2]).await;
    let mut p1 = Patch::new(base);
    p1.add_object(x.clone()).unwrap();

    let t1 = load_keys(&lake, pool, "main", &[10, 11]).await;
    assert_ne!(t0, t1);

    let id = branch.commit_patch(p1, t0, &msg("x")).await.unwrap();
    let commit = branch.pool().commits().get(id).await.unwrap();
    assert_eq!(commit.header().retries, 1);
    assert_eq!(commit.parent(), t1);

    let (_, tip) = branch.snapshot().await.unwrap();
    assert!(tip.exists(x.id));
    assert_eq!(tip.select_all().len(), 2);
    assert_eq!(keys(&query_all(&lake, "logs", "").await), vec![1, 2, 10, 11]);
}

#[tokio::test]
async fn test_overlapping_deletes_conflict() {
    let lake = memory_lake();
    let pool = create_pool(&lake, "logs", "ts").await;
    load_keys(&lake, pool, "main", &[1, 2]).await;
    let target = object_ids(&lake, "logs").await[0];

    let branch = lake.branch(pool, "main").await.unwrap();
    let (t0, base) = branch.snapshot().await.unwrap();
    let mut first = Patch::new(base.clone());
    first.delete_object(target).unwrap();
    let mut second = Patch::new(base);
    second.delete_object(target).unwrap();

    branch.commit_patch(first, t0, &msg("first")).await.unwrap();
    let err = branch.commit_patch(second, t0, &msg("second")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_concurrent_loads_both_land() {
    let lake = Arc::new(memory_lake());
    let pool = create_pool(lake.as_ref(), "logs", "ts").await;
    let mut handles = Vec::new();
    for i in 0..4i64 {
        let lake = lake.clone();
        handles.push(tokio::spawn(async move {
            load_keys(lake.as_ref(), pool, "main", &[i * 10, i * 10 + 1]).await
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
    let got = keys(&query_all(lake.as_ref(), "logs", "").await);
    assert_eq!(got, vec![0, 1, 10, 11, 20, 21, 30, 31]);
    let log = query_all(lake.as_ref(), "logs", ":log").await;
    let headers = log
        .iter()
        .filter(|row| row.path("kind").as_str() == Some("commit"))
        .count();
    assert_eq!(headers, 4);
}

#[tokio::test]
async fn test_cancel_releases_readers() {
    let lake = memory_lake();
    let pool = create_pool(&lake, "logs", "ts").await;
    let p = lake.root().open_pool(pool).await.unwrap();
    let store = p.store().clone();
    let mut snap = silt_meta::Snapshot::new();
    snap.add_object(write_object(&store, &lake, pool, &[1, 2]).await).unwrap();
    snap.add_object(write_object(&store, &lake, pool, &[10, 11, 12, 20]).await).unwrap();
    snap.add_object(write_object(&store, &lake, pool, &[15, 25]).await).unwrap();

    let cancel = CancellationToken::new();
    let mut scanner = SequenceScanner::new(
        store,
        p.data_dir().clone(),
        p.layout().clone(),
        &snap,
        Arc::new(MatchAll),
        cancel.clone(),
    )
    .with_batch_size(2);

    let first = scanner.pull(false).await.unwrap().unwrap();
    assert_eq!(keys(&first), vec![1, 2]);
    let second = scanner.pull(false).await.unwrap().unwrap();
    assert_eq!(keys(&second), vec![10, 11]);
    assert_eq!(scanner.open_readers(), 2);

    cancel.cancel();
    let err = scanner.pull(false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(scanner.open_readers(), 0);
    let progress = scanner.progress();
    assert_eq!(
        Progress {
            bytes_read: 0,
            ..progress
        },
        Progress {
            objects_read: 1,
            bytes_read: 0,
            records_read: 2,
            records_matched: 2,
        }
    );
    assert!(progress.bytes_read > 0);
}

#[tokio::test]
async fn test_done_stops_scan() {
    let lake = memory_lake();
    let pool = create_pool(&lake, "logs", "ts").await;
    load_keys(&lake, pool, "main", &(0..100).collect::<Vec<_>>()).await;
    let mut scan = lake
        .query("logs", "", &CancellationToken::new())
        .await
        .unwrap();
    assert!(scan.pull(false).await.unwrap().is_some());
    assert!(scan.pull(true).await.unwrap().is_none());
    assert!(scan.pull(false).await.unwrap().is_none());
}

#[tokio::test]
async fn test_delete_where_rewrites_survivors() {
    let lake = memory_lake();
    let pool = create_pool(&lake, "logs", "ts").await;
    load_keys(&lake, pool, "main", &(1..=10).collect::<Vec<_>>()).await;
    load_keys(&lake, pool, "main", &[20, 21]).await;
    let before = object_ids(&lake, "logs").await;

    let cancel = CancellationToken::new();
    lake.delete_where(pool, "main", &KeyRange::new(3i64, 5i64), &msg("trim"), &cancel)
        .await
        .unwrap();
    assert_eq!(
        keys(&query_all(&lake, "logs", "").await),
        vec![1, 2, 6, 7, 8, 9, 10, 20, 21]
    );
    let after = object_ids(&lake, "logs").await;
    assert_eq!(after.len(), 2);
    assert_ne!(after[0], before[0]);
    assert_eq!(after[1], before[1]);

    let err = lake
        .delete_where(pool, "main", &KeyRange::new(3i64, 5i64), &msg("again"), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EmptyTransaction);
}

#[tokio::test]
async fn test_delete_by_id() {
    let lake = memory_lake();
    let pool = create_pool(&lake, "logs", "ts").await;
    load_keys(&lake, pool, "main", &[1]).await;
    load_keys(&lake, pool, "main", &[2]).await;
    let ids = object_ids(&lake, "logs").await;
    lake.delete(pool, "main", &ids[..1], &msg("drop")).await.unwrap();
    assert_eq!(keys(&query_all(&lake, "logs", "").await), vec![2]);
    let err = lake.delete(pool, "main", &ids[..1], &msg("drop")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_revert_undoes_commit() {
    let lake = memory_lake();
    let pool = create_pool(&lake, "logs", "ts").await;
    let c1 = load_keys(&lake, pool, "main", &[1, 2]).await;
    load_keys(&lake, pool, "main", &[3]).await;

    lake.revert(pool, "main", c1, &msg("undo")).await.unwrap();
    assert_eq!(keys(&query_all(&lake, "logs", "").await), vec![3]);
    let err = lake.revert(pool, "main", c1, &msg("undo")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EmptyTransaction);
}

#[tokio::test]
async fn test_compact_preserves_records() {
    let lake = memory_lake();
    let pool = create_pool(&lake, "logs", "ts").await;
    load_keys(&lake, pool, "main", &[1, 5, 9]).await;
    load_keys(&lake, pool, "main", &[2, 5, 8]).await;
    load_keys(&lake, pool, "main", &[3]).await;
    let ids = object_ids(&lake, "logs").await;
    assert_eq!(ids.len(), 3);

    let cancel = CancellationToken::new();
    lake.compact(pool, "main", &ids, true, &msg("compact"), &cancel)
        .await
        .unwrap();
    let after = object_ids(&lake, "logs").await;
    assert_eq!(after.len(), 1);
    assert_eq!(
        keys(&query_all(&lake, "logs", "").await),
        vec![1, 2, 3, 5, 5, 8, 9]
    );

    let vectors = query_all(&lake, "logs", ":vectors").await;
    assert_eq!(vectors.len(), 1);
    let p = lake.root().open_pool(pool).await.unwrap();
    let vector = VectorObject::read(p.store().as_ref(), p.data_dir(), after[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(vector.rows, 7);

    let err = lake
        .compact(pool, "main", &ids, false, &msg("stale"), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_vectors_add_and_delete() {
    let lake = memory_lake();
    let pool = create_pool(&lake, "logs", "ts").await;
    load_keys(&lake, pool, "main", &[1, 2]).await;
    let ids = object_ids(&lake, "logs").await;
    let cancel = CancellationToken::new();
    lake.add_vectors(pool, "main", &ids, &msg("vec"), &cancel)
        .await
        .unwrap();
    assert_eq!(query_all(&lake, "logs", ":vectors").await.len(), 1);
    let err = lake
        .add_vectors(pool, "main", &ids, &msg("vec"), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    lake.delete_vectors(pool, "main", &ids, &msg("unvec"))
        .await
        .unwrap();
    assert!(query_all(&lake, "logs", ":vectors").await.is_empty());
}

#[tokio::test]
async fn test_merge_branch() {
    let lake = memory_lake();
    let pool = create_pool(&lake, "logs", "ts").await;
    let base = load_keys(&lake, pool, "main", &[1]).await;
    lake.create_branch(pool, "dev", base).await.unwrap();
    load_keys(&lake, pool, "dev", &[2]).await;
    load_keys(&lake, pool, "main", &[3]).await;

    lake.merge_branch(pool, "dev", "main", &msg("merge dev"))
        .await
        .unwrap();
    assert_eq!(keys(&query_all(&lake, "logs@main", "").await), vec![1, 2, 3]);
    assert_eq!(keys(&query_all(&lake, "logs@dev", "").await), vec![1, 2]);
}

#[tokio::test]
async fn test_merge_conflicting_deletes() {
    let lake = memory_lake();
    let pool = create_pool(&lake, "logs", "ts").await;
    let base = load_keys(&lake, pool, "main", &[1]).await;
    let target = object_ids(&lake, "logs").await;
    lake.create_branch(pool, "dev", base).await.unwrap();
    lake.delete(pool, "dev", &target, &msg("dev drop")).await.unwrap();
    lake.delete(pool, "main", &target, &msg("main drop")).await.unwrap();
    let err = lake
        .merge_branch(pool, "dev", "main", &msg("merge"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_vacuum_removes_only_unreachable() {
    let lake = memory_lake();
    let pool = create_pool(&lake, "logs", "ts").await;
    load_keys(&lake, pool, "main", &[1]).await;
    let live = object_ids(&lake, "logs").await;
    lake.delete(pool, "main", &live, &msg("drop")).await.unwrap();

    let p = lake.root().open_pool(pool).await.unwrap();
    let store = p.store().clone();
    let orphan = write_object(&store, &lake, pool, &[9]).await;

    let cancel = CancellationToken::new();
    let found = lake.vacuum(pool, "main", true, &cancel).await.unwrap();
    assert_eq!(found, vec![orphan.id]);
    let seq = DataObject::sequence_uri(p.data_dir(), orphan.id);
    assert!(store.exists(&seq).await.unwrap());

    assert_eq!(lake.vacuum(pool, "main", false, &cancel).await.unwrap(), vec![orphan.id]);
    assert!(!store.exists(&seq).await.unwrap());
    assert!(store
        .exists(&DataObject::sequence_uri(p.data_dir(), live[0]))
        .await
        .unwrap());
    assert!(lake.vacuum(pool, "main", false, &cancel).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_metadata_queries() {
    let lake = memory_lake();
    let logs = create_pool(&lake, "logs", "ts").await;
    create_pool(&lake, "metrics", "ts:desc").await;
    lake.create_branch(logs, "dev", Id::nil()).await.unwrap();
    load_keys(&lake, logs, "main", &[0, 3]).await;
    load_keys(&lake, logs, "main", &[2, 9]).await;

    let pools = query_all(&lake, "", ":pools").await;
    let names: Vec<&str> = pools.iter().map(|p| p.path("name").as_str().unwrap()).collect();
    assert_eq!(names, vec!["logs", "metrics"]);
    assert_eq!(query_all(&lake, "", ":branches").await.len(), 3);
    assert_eq!(query_all(&lake, "", "logs:branches").await.len(), 2);

    let objects = query_all(&lake, "logs", ":objects").await;
    let mins: Vec<i64> = objects.iter().map(|o| o.path("min").as_int().unwrap()).collect();
    assert_eq!(mins, vec![0, 2]);

    let parts = query_all(&lake, "logs", ":partitions").await;
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].path("max"), &Value::Int(9));

    let log = query_all(&lake, "logs", ":log").await;
    assert_eq!(log[0].path("kind").as_str(), Some("commit"));
    assert_eq!(log.len(), 4);

    assert!(query_all(&lake, "logs@dev", ":objects").await.is_empty());
    let err = lake
        .query("", "nope", &CancellationToken::new())
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_events_published() {
    let lake = memory_lake();
    let mut events = lake.subscribe_events().await.unwrap();
    let pool = create_pool(&lake, "logs", "ts").await;
    let commit = load_keys(&lake, pool, "main", &[1]).await;

    let first = events.next().await.unwrap().unwrap();
    assert_eq!(first.kind, EventKind::PoolNew);
    assert_eq!(first.detail.pool_id, pool);
    let second = events.next().await.unwrap().unwrap();
    assert_eq!(second.kind, EventKind::BranchCommit);
    assert_eq!(second.detail.commit, Some(commit));
    assert_eq!(second.detail.branch.as_deref(), Some("main"));

    lake.rename_pool(pool, "archive").await.unwrap();
    let third = events.next().await.unwrap().unwrap();
    assert_eq!(third.kind, EventKind::PoolUpdate);
    assert_eq!(third.kind.as_str(), "pool-update");
    assert_eq!(third.detail.pool_id, pool);
    assert_eq!(third.detail.branch, None);
}

#[tokio::test]
async fn test_remote_round_trip() {
    let local: Arc<dyn Lake> = Arc::new(memory_lake());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(silt_lake::serve(local.clone(), listener, shutdown.clone()));

    let remote = RemoteLake::new(&format!("http://{}", addr)).unwrap();
    let mut events = remote.subscribe_events().await.unwrap();

    let pool = create_pool(&remote, "logs", "ts:desc").await;
    assert_eq!(remote.id_of("logs").await.unwrap(), pool);
    let dup = remote
        .create_pool("logs", "ts".parse().unwrap(), 0, 0)
        .await
        .unwrap_err();
    assert_eq!(dup.kind(), ErrorKind::Exists);

    let commit = load_keys(&remote, pool, "main", &[3, 1, 2]).await;
    assert_eq!(remote.tip(pool, "main").await.unwrap(), commit);
    assert_eq!(keys(&query_all(&remote, "logs", "").await), vec![3, 2, 1]);

    let mut scan = remote
        .query("logs", "", &CancellationToken::new())
        .await
        .unwrap();
    silt_lake::collect(scan.as_mut()).await.unwrap();
    assert_eq!(scan.progress().records_matched, 3);

    let missing = remote.tip(pool, "nope").await.unwrap_err();
    assert_eq!(missing.kind(), ErrorKind::NotFound);

    let first = tokio::time::timeout(Duration::from_secs(5), events.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(first.kind, EventKind::PoolNew);

    remote.remove_pool(pool).await.unwrap();
    assert!(remote.list_pools().await.unwrap().is_empty());

    drop(events);
    shutdown.cancel();
    server.abort();
}

#[tokio::test]
async fn test_remote_connection_refused() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let remote = RemoteLake::new(&format!("http://{}", addr)).unwrap();
    let err = remote.list_pools().await.unwrap_err();
    assert!(err.is_connection_refused());
    assert_eq!(err.kind(), ErrorKind::Transport);
}

async fn serve_local(local: Arc<dyn Lake>) -> (RemoteLake, CancellationToken) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(silt_lake::serve(local, listener, shutdown.clone()));
    (RemoteLake::new(&format!("http://{}", addr)).unwrap(), shutdown)
}

fn mixed_records() -> Vec<Value> {
    (1..=3)
        .map(|k| {
            Value::record([
                ("ts", Value::Int(k)),
                ("z", Value::Bytes(vec![0xde, 0xad, k as u8])),
                ("a", Value::Float(f64::NAN)),
                (
                    "nested",
                    Value::record([
                        ("y", Value::Float(-0.5 * k as f64)),
                        ("b", Value::Array(vec![Value::Null, Value::Bool(true)])),
                    ]),
                ),
            ])
        })
        .collect()
}

#[tokio::test]
async fn test_remote_values_match_local() {
    let local: Arc<dyn Lake> = Arc::new(memory_lake());
    let (remote, shutdown) = serve_local(local.clone()).await;

    let pool = create_pool(local.as_ref(), "mixed", "ts:asc").await;
    let mut input = silt_lake::VecPuller::new(mixed_records(), 2);
    local
        .load(pool, "main", &mut input, &msg("local"), &CancellationToken::new())
        .await
        .unwrap();

    let here = query_all(local.as_ref(), "mixed", "").await;
    let there = query_all(&remote, "mixed", "").await;
    assert_eq!(here.len(), 3);
    assert_eq!(here, there);
    for (l, r) in here.iter().zip(&there) {
        assert_eq!(l, r);
        let Value::Record(fields) = r else {
            panic!("expected a record, got {}", r);
        };
        let names: Vec<&str> = fields.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["ts", "z", "a", "nested"]);
        assert!(matches!(r.path("a"), Value::Float(f) if f.is_nan()));
        assert!(matches!(r.path("z"), Value::Bytes(_)));
    }

    // Loading through the remote stores the same values.
    let copy = create_pool(&remote, "copy", "ts:asc").await;
    let mut input = silt_lake::VecPuller::new(mixed_records(), 2);
    remote
        .load(copy, "main", &mut input, &msg("remote"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(query_all(local.as_ref(), "copy", "").await, here);

    // A key range survives the trip too.
    remote
        .delete_where(
            copy,
            "main",
            &KeyRange::new(Value::Int(2), Value::Int(3)),
            &msg("trim"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(keys(&query_all(&remote, "copy", "").await), vec![1]);

    shutdown.cancel();
}

#[tokio::test]
async fn test_remote_query_streams_and_cancels() {
    let local: Arc<dyn Lake> = Arc::new(memory_lake());
    let (remote, shutdown) = serve_local(local.clone()).await;
    let pool = create_pool(local.as_ref(), "logs", "ts:asc").await;
    let all: Vec<i64> = (0..2_000).collect();
    load_keys(local.as_ref(), pool, "main", &all).await;

    let cancel = CancellationToken::new();
    let mut scan = remote.query("logs", "", &cancel).await.unwrap();
    let first = scan.pull(false).await.unwrap().unwrap();
    assert!(!first.is_empty());
    assert!(first.len() < all.len());

    cancel.cancel();
    let err = scan.pull(false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(scan.pull(false).await.unwrap_err().kind(), ErrorKind::Cancelled);

    let mut scan = remote
        .query("logs", "", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(keys(&silt_lake::collect(scan.as_mut()).await.unwrap()), all);
    assert_eq!(scan.progress().records_matched, all.len() as u64);

    shutdown.cancel();
}
