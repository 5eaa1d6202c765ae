//! End-to-end tests for the index, cache, weight engine and memory core.

use chrono::{Duration, Utc};
use koru_recall::cache::{CacheLevel, LevelCapacity};
use koru_recall::prelude::*;
use koru_recall::vector::checkpoint;
use koru_recall::{CacheConfig, EventCounter, IndexConfig, Layer, MemoryCore, Remember, SearchHit};
use std::sync::Arc;
use tempfile::TempDir;

fn vec4(values: [f32; 4]) -> Vector {
    Vector::new(values.to_vec(), "test-model")
}

fn five_keys(index: &VectorIndex) {
    let vectors = [
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
        [0.0, 0.0, 0.0, 1.0],
        [0.5, 0.5, 0.5, 0.5],
    ];
    for (i, values) in vectors.into_iter().enumerate() {
        index.add(&format!("k{}", i + 1), &vec4(values)).unwrap();
    }
}

#[test]
fn test_search_returns_exact_match_first() {
    for config in [IndexConfig::flat(4), IndexConfig::graph(4)] {
        let index = VectorIndex::new(config).unwrap();
        five_keys(&index);

        let hits = index.search(&vec4([0.0, 1.0, 0.0, 0.0]), 3, 0.0).unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].key, "k2");
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);
        assert!(hits.windows(2).all(|w| w[0].similarity >= w[1].similarity));
    }
}

#[test]
fn test_search_rejects_wrong_dimension() {
    let index = VectorIndex::new(IndexConfig::flat(4)).unwrap();
    five_keys(&index);
    let err = index
        .search(&Vector::new(vec![1.0, 0.0], "test-model"), 3, 0.0)
        .unwrap_err();
    assert!(matches!(err, RecallError::DimensionMismatch { expected: 4, actual: 2 }));
}

#[tokio::test]
async fn test_save_load_reproduces_search() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("vectors");
    let index = VectorIndex::new(IndexConfig::flat(4).checkpoint_path(&base)).unwrap();
    five_keys(&index);
    index.save().await.unwrap();

    let restored = VectorIndex::new(IndexConfig::flat(4).checkpoint_path(&base)).unwrap();
    let report = restored.load().await.unwrap();
    assert!(report.found);
    assert_eq!(report.restored, 5);

    for query in [
        vec4([0.0, 1.0, 0.0, 0.0]),
        vec4([0.4, 0.4, 0.6, 0.5]),
        vec4([0.5, 0.5, 0.5, 0.5]),
    ] {
        let before = index.search(&query, 5, 0.0).unwrap();
        let after = restored.search(&query, 5, 0.0).unwrap();
        let keys = |hits: &[SearchHit]| hits.iter().map(|h| h.key.clone()).collect::<Vec<_>>();
        assert_eq!(keys(&before), keys(&after));
        for (a, b) in before.iter().zip(&after) {
            assert!((a.similarity - b.similarity).abs() < 1e-6);
        }
    }
}

#[tokio::test]
async fn test_legacy_array_sidecar_loads() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("legacy");
    let index = VectorIndex::new(IndexConfig::flat(4)).unwrap();
    five_keys(&index);
    index.save_to(&base).await.unwrap();

    tokio::fs::write(
        checkpoint::meta_path(&base),
        r#"["a", "b", "c", "d", "e"]"#,
    )
    .await
    .unwrap();

    let restored = VectorIndex::new(IndexConfig::flat(4)).unwrap();
    restored.load_from(&base).await.unwrap();
    let mut keys = restored.keys();
    keys.sort();
    assert_eq!(keys, vec!["a", "b", "c", "d", "e"]);
}

#[tokio::test]
async fn test_missing_sidecar_reconstructs_keys() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("nometa");
    let index = VectorIndex::new(IndexConfig::flat(4)).unwrap();
    five_keys(&index);
    index.save_to(&base).await.unwrap();
    tokio::fs::remove_file(checkpoint::meta_path(&base)).await.unwrap();

    let restored = VectorIndex::new(IndexConfig::flat(4)).unwrap();
    let report = restored.load_from(&base).await.unwrap();
    assert_eq!(report.reconstructed_keys, 5);
    assert!(restored.contains("unknown_0"));
}

#[tokio::test]
async fn test_corrupt_blob_is_rejected() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("corrupt");
    let index = VectorIndex::new(IndexConfig::flat(4)).unwrap();
    five_keys(&index);
    index.save_to(&base).await.unwrap();

    let path = checkpoint::index_path(&base);
    let mut bytes = tokio::fs::read(&path).await.unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    tokio::fs::write(&path, bytes).await.unwrap();

    let restored = VectorIndex::new(IndexConfig::flat(4)).unwrap();
    let err = restored.load_from(&base).await.unwrap_err();
    assert!(matches!(err, RecallError::CorruptCheckpoint(_)));
    assert!(restored.is_empty());
}

#[test]
fn test_delete_is_idempotent() {
    let bus = Arc::new(CacheEventBus::new());
    let counter = Arc::new(EventCounter::new());
    bus.subscribe(counter.clone());
    let cache = TieredCache::new("test", CacheConfig::default(), bus).unwrap();

    cache.put("k", json!({"v": 1}), EntryMetadata::weight(5.0)).unwrap();
    assert!(cache.delete("k").unwrap());
    assert!(!cache.delete("k").unwrap());
    assert!(cache.get("k").is_none());
    assert_eq!(counter.count(CacheEventKind::Put), 1);
}

#[test]
fn test_capacity_holds_under_churn() {
    let config = CacheConfig::uniform(4, 1 << 20);
    let cache = TieredCache::new("churn", config, Arc::new(CacheEventBus::new())).unwrap();

    for i in 0..200 {
        let weight = 0.1 + (i % 100) as f64 / 10.0;
        cache
            .put(&format!("k{i}"), json!(i), EntryMetadata::weight(weight))
            .unwrap();
        for level in [CacheLevel::Hot, CacheLevel::Warm, CacheLevel::Cold] {
            assert!(cache.keys_at(level).len() <= 4);
        }
    }
    let stats = cache.stats();
    assert!(stats.evictions > 0);
    assert!(stats.entries <= 12);
}

#[test]
fn test_byte_budget_holds() {
    let mut config = CacheConfig::default();
    config.cold = LevelCapacity {
        max_items: 100,
        max_bytes: 256,
    };
    let cache = TieredCache::new("bytes", config, Arc::new(CacheEventBus::new())).unwrap();
    for i in 0..20 {
        cache
            .put(&format!("k{i}"), json!("x".repeat(40)), EntryMetadata::weight(1.0))
            .unwrap();
    }
    let stats = cache.stats();
    assert!(stats.levels["cold"].bytes <= 256);
}

#[test]
fn test_hundred_day_decay() {
    let engine = WeightEngine::default();
    let now = Utc::now();
    let created = now - Duration::days(100);

    let short_term = MemoryRecord::new("old small talk", Role::User)
        .weight(1.0)
        .created(created)
        .accessed(created);
    let update = engine.compute(&short_term, now, WeightContext::none());
    assert_eq!(update.layer_before, Layer::ShortTerm);
    assert!(update.weight <= 0.1 + 1e-9);
    assert!(update.eviction_candidate);

    let core = MemoryRecord::new("user's name is Ada", Role::User)
        .weight(9.5)
        .created(created)
        .accessed(created);
    let update = engine.compute(&core, now, WeightContext::none());
    assert_eq!(update.layer_before, Layer::Core);
    assert!(update.weight > 8.5);
}

fn core_config(dir: &TempDir) -> RecallConfig {
    let mut config = RecallConfig::default();
    config.index = IndexConfig::flat(4).checkpoint_path(dir.path().join("vectors"));
    config.cache.spill_dir = Some(dir.path().join("spill"));
    config.maintenance.reconcile_interval_secs = 0;
    config
}

#[tokio::test]
async fn test_core_round_trip_with_events() {
    let dir = TempDir::new().unwrap();
    let bus = Arc::new(CacheEventBus::new());
    let counter = Arc::new(EventCounter::new());
    bus.subscribe(counter.clone());

    let core = MemoryCore::open_with(
        core_config(&dir),
        Arc::new(InMemoryStore::new()),
        Arc::new(koru_recall::maintenance::ExtractiveSummarizer::default()),
        bus,
    )
    .await
    .unwrap();

    let pinned = MemoryRecord::with_id("name", "The user's name is Ada.", Role::User).weight(9.0);
    core.remember(pinned, vec4([1.0, 0.0, 0.0, 0.0]), Remember::default().pinned().keywords(["name"]))
        .await
        .unwrap();
    let chatter = MemoryRecord::with_id("weather", "It rained today.", Role::User).weight(1.0);
    core.remember(chatter, vec4([0.0, 1.0, 0.0, 0.0]), Remember::default())
        .await
        .unwrap();
    core.wait_idle().await;

    assert_eq!(core.cache().level_of("name"), Some(CacheLevel::Persistent));
    assert_eq!(core.cache().level_of("weather"), Some(CacheLevel::Cold));

    let hits = core
        .recall_matching(&vec4([0.9, 0.1, 0.0, 0.0]), 1, 0.1, &["name"])
        .await
        .unwrap();
    assert_eq!(hits[0].record.id, "name");
    assert!(hits[0].record.weight > 9.0);

    assert!(counter.count(CacheEventKind::Init) >= 2);
    assert_eq!(counter.count(CacheEventKind::Put), 2);
    assert!(counter.count(CacheEventKind::Maintenance) >= 2);

    let stats = core.stats().await.unwrap();
    assert_eq!(stats.vectors, 2);
    assert!(stats.records >= 4);
    core.shutdown().await;
}

#[tokio::test]
async fn test_reconcile_pass_cleans_dangling_vectors() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(InMemoryStore::new());
    let core = MemoryCore::open(core_config(&dir), store.clone()).await.unwrap();

    core.remember(
        MemoryRecord::with_id("kept", "stays around", Role::User),
        vec4([1.0, 1.0, 0.0, 0.0]),
        Remember::default(),
    )
    .await
    .unwrap();
    core.wait_idle().await;
    core.index().add("orphan", &vec4([0.0, 0.0, 1.0, 1.0])).unwrap();

    let report = core.run_maintenance().await.unwrap();
    assert_eq!(report.dangling_removed, 1);
    assert!(!core.index().contains("orphan"));
    assert!(core.index().contains("kept"));
    core.shutdown().await;
}
