mod common;

use anyhow::Result;
use async_compression::tokio::write::GzipEncoder;
use async_trait::async_trait;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;

use shelfwise::embedding::Embedder;
use shelfwise::handlers::SemanticSearchHandler;
use shelfwise::llm::DisabledGenerator;
use shelfwise::mirror::MirrorSyncEngine;
use shelfwise::router::{DataAccessRouter, MirrorSource};
use shelfwise_core::handler::Handler;
use shelfwise_core::models::{Request, SqlValue};
use shelfwise_core::store::DataStore;

use common::{dump_with_extra_items, mirror_config, write_dump, DUMP, DUMP_ITEMS};

async fn count(store: &dyn DataStore, table: &str) -> i64 {
    let result = store
        .query(&format!("SELECT COUNT(*) AS n FROM {}", table), &[])
        .await
        .unwrap();
    result.get(0, "n").and_then(SqlValue::as_i64).unwrap()
}

#[tokio::test]
async fn test_round_trip_preserves_row_counts() {
    let tmp = TempDir::new().unwrap();
    let dump = write_dump(tmp.path(), "dump.sql", DUMP);
    let engine = MirrorSyncEngine::new(mirror_config(&tmp, Some(dump))).unwrap();

    assert!(engine.sync(false).await.unwrap());
    let store = engine.store().unwrap();
    assert_eq!(count(store.as_ref(), "vip_brands").await, 3);
    assert_eq!(count(store.as_ref(), "vip_products").await, 4);
    assert_eq!(count(store.as_ref(), "vip_items").await, DUMP_ITEMS);
    assert_eq!(count(store.as_ref(), "app_inventory").await, DUMP_ITEMS);
}

#[tokio::test]
async fn test_copy_nulls_and_escapes_survive() {
    let tmp = TempDir::new().unwrap();
    let dump = write_dump(tmp.path(), "dump.sql", DUMP);
    let engine = MirrorSyncEngine::new(mirror_config(&tmp, Some(dump))).unwrap();
    engine.sync(false).await.unwrap();
    let store = engine.store().unwrap();

    let nulls = store
        .query(
            "SELECT COUNT(*) AS n FROM vip_products WHERE consumer_product_name IS NULL",
            &[],
        )
        .await
        .unwrap();
    assert_eq!(nulls.get(0, "n").and_then(SqlValue::as_i64), Some(2));

    let names = store
        .query(
            "SELECT product_name, brand_name FROM app_inventory WHERE store = $1 ORDER BY quantity",
            &["2".into()],
        )
        .await
        .unwrap();
    assert_eq!(names.len(), 3);
    assert_eq!(names.text(0, "product_name").as_deref(), Some("Unknown"));
    assert_eq!(names.text(1, "product_name").as_deref(), Some("Oak Reserve Wine"));
    assert_eq!(names.text(1, "brand_name").as_deref(), Some("Northern Oak"));
}

#[tokio::test]
async fn test_whitespace_names_fall_through() {
    let tmp = TempDir::new().unwrap();
    let dump = write_dump(tmp.path(), "dump.sql", DUMP);
    let engine = MirrorSyncEngine::new(mirror_config(&tmp, Some(dump))).unwrap();
    engine.sync(false).await.unwrap();
    let store = engine.store().unwrap();

    let row = store
        .query(
            "SELECT store, product_name, brand_name FROM app_inventory WHERE store = 'source_5'",
            &[],
        )
        .await
        .unwrap();
    assert_eq!(row.text(0, "product_name").as_deref(), Some("Blanco Tequila"));
    assert_eq!(row.text(0, "brand_name").as_deref(), Some("Blanco"));
}

#[tokio::test]
async fn test_startup_reuses_existing_file() {
    let tmp = TempDir::new().unwrap();
    let dump = write_dump(tmp.path(), "dump.sql", DUMP);

    let first = MirrorSyncEngine::new(mirror_config(&tmp, Some(dump.clone()))).unwrap();
    assert!(first.startup().await);
    let synced_at = first.state().last_sync;
    drop(first);

    // The dump is gone; the file on disk must be enough.
    std::fs::remove_file(&dump).unwrap();
    let second = MirrorSyncEngine::new(mirror_config(&tmp, Some(dump))).unwrap();
    assert!(second.startup().await);
    assert_eq!(second.state().last_sync, synced_at);
    assert_eq!(count(second.store().unwrap().as_ref(), "app_inventory").await, DUMP_ITEMS);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_syncs_never_expose_torn_snapshot() {
    let tmp = TempDir::new().unwrap();
    let small = write_dump(tmp.path(), "small.sql", DUMP);
    let large = write_dump(tmp.path(), "large.sql", &dump_with_extra_items(3));
    let engine = Arc::new(MirrorSyncEngine::new(mirror_config(&tmp, Some(small.clone()))).unwrap());
    engine.sync(false).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..6 {
        let engine = Arc::clone(&engine);
        let dump = if i % 2 == 0 { large.clone() } else { small.clone() };
        tasks.push(tokio::spawn(async move {
            engine.sync_from(&dump, true).await.map(|_| ())
        }));
    }

    let reader = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..40 {
                if let Some(store) = engine.store() {
                    seen.push(count(store.as_ref(), "app_inventory").await);
                }
                tokio::task::yield_now().await;
            }
            seen
        })
    };

    for task in tasks {
        task.await.unwrap().unwrap();
    }
    let seen = reader.await.unwrap();
    assert!(!seen.is_empty());
    assert!(
        seen.iter().all(|n| *n == DUMP_ITEMS || *n == DUMP_ITEMS + 3),
        "torn snapshot observed: {:?}",
        seen
    );

    let state = engine.state();
    assert!(state.ready);
    assert!(!state.sync_in_progress);
    let temps = std::fs::read_dir(tmp.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .count();
    assert_eq!(temps, 0);
}

#[tokio::test]
async fn test_changed_dump_triggers_rebuild() {
    let tmp = TempDir::new().unwrap();
    let dump = write_dump(tmp.path(), "dump.sql", DUMP);
    let engine = MirrorSyncEngine::new(mirror_config(&tmp, Some(dump.clone()))).unwrap();
    engine.sync(false).await.unwrap();
    let before = engine.state().checksum;

    std::fs::write(&dump, dump_with_extra_items(2)).unwrap();
    assert!(engine.sync(false).await.unwrap());
    assert_ne!(engine.state().checksum, before);
    assert_eq!(
        count(engine.store().unwrap().as_ref(), "app_inventory").await,
        DUMP_ITEMS + 2
    );
}

#[tokio::test]
async fn test_gzip_dump_builds_same_mirror() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("dump.sql.gz");
    let file = tokio::fs::File::create(&path).await.unwrap();
    let mut encoder = GzipEncoder::new(file);
    encoder.write_all(DUMP.as_bytes()).await.unwrap();
    encoder.shutdown().await.unwrap();

    let engine = MirrorSyncEngine::new(mirror_config(&tmp, Some(path))).unwrap();
    assert!(engine.sync(false).await.unwrap());
    let store = engine.store().unwrap();
    assert_eq!(count(store.as_ref(), "vip_products").await, 4);
    assert_eq!(count(store.as_ref(), "app_inventory").await, DUMP_ITEMS);
}

struct FixedEmbedder(Vec<f32>);

#[async_trait]
impl Embedder for FixedEmbedder {
    fn is_enabled(&self) -> bool {
        true
    }
    fn model_name(&self) -> &str {
        "fixed"
    }
    fn dims(&self) -> usize {
        self.0.len()
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| self.0.clone()).collect())
    }
}

#[tokio::test]
async fn test_semantic_search_ranks_mirror_vectors() {
    let tmp = TempDir::new().unwrap();
    let dump = write_dump(tmp.path(), "dump.sql", DUMP);
    let engine = Arc::new(MirrorSyncEngine::new(mirror_config(&tmp, Some(dump))).unwrap());
    engine.sync(false).await.unwrap();

    let router = Arc::new(DataAccessRouter::new(
        None,
        Some(engine as Arc<dyn MirrorSource>),
    ));
    let handler = SemanticSearchHandler::new(
        router,
        Arc::new(FixedEmbedder(vec![0.1, 0.9, 0.0])),
        Arc::new(DisabledGenerator),
        2,
    );

    let reply = handler.handle(&Request::new("a red for dinner")).await.unwrap();
    assert_eq!(
        reply,
        "These products look closest:\nOak Reserve Wine by Northern Oak\nVodka Classic by Acme Spirits"
    );
}
