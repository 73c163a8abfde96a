//! Property tests for cache validity.
//!
//! An entry written under one schema version must never be returned by a
//! cache reading under another, and a fresh write under the new version
//! always wins.

use proptest::prelude::*;
use serde_json::{Value, json};
use std::sync::Arc;
use taskmesh_cache::{CacheSchema, CacheStore, MemoryBackend, SchemaCache};

fn run<F: std::future::Future<Output = ()>>(f: F) {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(f);
}

proptest! {
    #[test]
    fn mismatched_version_is_never_returned(
        written in 0u32..50,
        read in 0u32..50,
        payload in "[a-z]{0,12}",
    ) {
        run(async move {
            let backend = Arc::new(MemoryBackend::new());
            let store = CacheStore::new(backend);
            let writer: SchemaCache<Value> =
                store.cache("ns", CacheSchema::any("t", written), None);
            writer.set("k", json!(payload.clone())).await.unwrap();

            let reader: SchemaCache<Value> = store.cache("ns", CacheSchema::any("t", read), None);
            let got = reader.get("k").await.unwrap();
            if written == read {
                assert_eq!(got, Some(json!(payload)));
            } else {
                assert_eq!(got, None);
                reader.set("k", json!("fresh")).await.unwrap();
                assert_eq!(reader.get("k").await.unwrap(), Some(json!("fresh")));
            }
        });
    }
}
