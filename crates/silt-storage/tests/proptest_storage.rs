//! Property-based tests for silt-storage using proptest.
//!
//! These check the writer/reader contract: whatever a writer accepts comes
//! back in the same order, and seek-narrowed reads never lose a record in
//! the requested span.

use std::sync::Arc;

use proptest::prelude::*;
use silt_storage::{
    read_object, Layout, MemoryStore, ObjectReader, ObjectWriter, SharedStore, Span, StorageUri,
    Value,
};

fn rt() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn rec(k: i64, seq: usize) -> Value {
    Value::record([("k", Value::Int(k)), ("seq", Value::Int(seq as i64))])
}

/// Sorted keys with duplicates.
fn sorted_keys() -> impl Strategy<Value = Vec<i64>> {
    proptest::collection::vec(-500i64..500, 0..300).prop_map(|mut v| {
        v.sort();
        v
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_written_records_read_back_in_order(keys in sorted_keys(), stride in 16u64..2048) {
        rt().block_on(async {
            let store: SharedStore = Arc::new(MemoryStore::new());
            let dir = StorageUri::parse("mem://p/data").unwrap();
            let layout = Layout::asc("k");
            let mut w = ObjectWriter::new(store.clone(), dir.clone(), layout.clone(), stride);
            let recs: Vec<Value> = keys.iter().enumerate().map(|(i, k)| rec(*k, i)).collect();
            for r in &recs {
                w.write(r).unwrap();
            }
            let obj = w.close().await.unwrap();
            prop_assert_eq!(obj.count as usize, recs.len());
            let back = read_object(store, &dir, &obj, &layout).await.unwrap();
            prop_assert_eq!(back, recs);
            Ok(())
        })?;
    }

    #[test]
    fn prop_seek_narrowing_keeps_span(
        keys in sorted_keys(),
        stride in 16u64..512,
        a in -500i64..500,
        b in -500i64..500,
    ) {
        rt().block_on(async {
            let store: SharedStore = Arc::new(MemoryStore::new());
            let dir = StorageUri::parse("mem://p/data").unwrap();
            let layout = Layout::asc("k");
            let mut w = ObjectWriter::new(store.clone(), dir.clone(), layout.clone(), stride);
            for (i, k) in keys.iter().enumerate() {
                w.write(&rec(*k, i)).unwrap();
            }
            let obj = w.close().await.unwrap();
            let span = Span::new(&layout, Value::Int(a), Value::Int(b));
            let mut r = ObjectReader::open(store, &dir, &obj, &layout, Some(&span), None)
                .await
                .unwrap();
            let mut got = Vec::new();
            while let Some(v) = r.read().await.unwrap() {
                got.push(v);
            }
            let want = keys
                .iter()
                .filter(|k| span.contains(&layout, &Value::Int(**k)))
                .count();
            let have = got
                .iter()
                .filter(|v| span.contains(&layout, v.path("k")))
                .count();
            prop_assert_eq!(have, want);
            Ok(())
        })?;
    }
}
