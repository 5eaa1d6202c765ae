//! Cache and memory core under concurrent callers.

use async_trait::async_trait;
use koru_recall::cache::CacheLevel;
use koru_recall::maintenance::{Summarizer, Summary};
use koru_recall::prelude::*;
use koru_recall::{CacheConfig, IndexConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

const LEVELS: [CacheLevel; 4] = [
    CacheLevel::Hot,
    CacheLevel::Warm,
    CacheLevel::Cold,
    CacheLevel::Persistent,
];

/// Holds stage 2 open long enough for callers to land in between.
struct SlowSummarizer {
    delay: Duration,
    calls: AtomicUsize,
}

#[async_trait]
impl Summarizer for SlowSummarizer {
    async fn summarize(&self, record: &MemoryRecord, _: &[MemoryRecord]) -> anyhow::Result<Summary> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(Summary {
            text: format!("summary of {}", record.content),
            keywords: vec![record.id.clone()],
        })
    }
}

fn core_config(dir: &TempDir) -> RecallConfig {
    let mut config = RecallConfig::default();
    config.index = IndexConfig::flat(2).checkpoint_path(dir.path().join("vectors"));
    config.maintenance.reconcile_interval_secs = 0;
    config
}

fn v(x: f32, y: f32) -> Vector {
    Vector::new(vec![x, y], "test")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cache_holds_capacity_under_contention() {
    let config = CacheConfig::uniform(8, 2048);
    let cache = Arc::new(TieredCache::new("shared", config.clone(), Arc::new(CacheEventBus::new())).unwrap());

    let mut workers = Vec::new();
    for worker in 0..8usize {
        let cache = Arc::clone(&cache);
        workers.push(tokio::task::spawn_blocking(move || {
            for step in 0..300usize {
                let key = format!("k{}", (worker * 31 + step * 7) % 40);
                match (worker + step) % 5 {
                    0 | 1 => {
                        let weight = ((worker * 3 + step) % 100) as f64 / 10.0 + 0.1;
                        let mut metadata = EntryMetadata::weight(weight);
                        if step % 17 == 0 {
                            metadata = metadata.pinned();
                        }
                        let _ = cache.put(&key, json!({"by": worker, "step": step}), metadata);
                    }
                    2 | 3 => {
                        let _ = cache.get(&key);
                    }
                    _ => {
                        let _ = cache.delete(&key);
                    }
                }
            }
        }));
    }
    for worker in workers {
        worker.await.unwrap();
    }

    let stats = cache.stats();
    let mut total = 0;
    for level in LEVELS {
        let capacity = config.capacity(level);
        let level_stats = &stats.levels[&level.to_string()];
        assert!(level_stats.items <= capacity.max_items, "{level} over item budget");
        assert!(level_stats.bytes <= capacity.max_bytes, "{level} over byte budget");

        let keys = cache.keys_at(level);
        assert_eq!(keys.len(), level_stats.items);
        for key in keys {
            assert_eq!(cache.level_of(&key), Some(level));
        }
        total += level_stats.items;
    }
    assert_eq!(total, cache.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_recall_during_maintenance_keeps_its_weight() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(InMemoryStore::new());
    let summarizer = Arc::new(SlowSummarizer {
        delay: Duration::from_millis(150),
        calls: AtomicUsize::new(0),
    });
    let core = MemoryCore::open_with(
        core_config(&dir),
        store.clone(),
        summarizer.clone(),
        Arc::new(CacheEventBus::new()),
    )
    .await
    .unwrap();

    let record = MemoryRecord::with_id("t1", "Overlapping access.", Role::User).weight(5.0);
    core.remember(record, v(1.0, 0.0), Remember::default())
        .await
        .unwrap();
    while summarizer.calls.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let first = core.recall(&v(1.0, 0.0), 1, 0.1).await.unwrap()[0].record.clone();
    let second = core.recall(&v(1.0, 0.0), 1, 0.1).await.unwrap()[0].record.clone();
    assert!(second.weight > first.weight);
    core.wait_idle().await;

    let stored = store.get_record("t1").await.unwrap().unwrap();
    assert_eq!(stored.weight, second.weight);
    assert_eq!(stored.last_accessed_at, second.last_accessed_at);
    assert!(stored.metadata.contains_key("summary_id"));
    core.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_recalls_all_reinforce() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(InMemoryStore::new());
    let core = Arc::new(MemoryCore::open(core_config(&dir), store.clone()).await.unwrap());

    let record = MemoryRecord::with_id("t1", "Recalled by everyone.", Role::User).weight(2.0);
    core.remember(record, v(0.0, 1.0), Remember::default())
        .await
        .unwrap();
    core.wait_idle().await;
    let start = store.get_record("t1").await.unwrap().unwrap().weight;

    let mut callers = Vec::new();
    for _ in 0..6 {
        let core = Arc::clone(&core);
        callers.push(tokio::spawn(async move {
            core.recall(&v(0.0, 1.0), 1, 0.1).await.unwrap().len()
        }));
    }
    for caller in callers {
        assert_eq!(caller.await.unwrap(), 1);
    }

    let engine = WeightEngine::default();
    let expected = (0..6).fold(start, |weight, _| engine.reinforce(weight, WeightContext::none()));
    let weight = store.get_record("t1").await.unwrap().unwrap().weight;
    assert!((weight - expected).abs() < 1e-9, "{weight} != {expected}");
    core.shutdown().await;
}
