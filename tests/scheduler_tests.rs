//! Maintenance scheduler under load.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use koru_recall::maintenance::{
    MaintenanceScheduler, MaintenanceTask, Pipeline, SchedulerConfig, Stage, StageOutcome,
    Submission, Summarizer, Summary,
};
use koru_recall::{CacheEventBus, InMemoryStore, MemoryRecord, MemoryStore, Role, SharedWeightConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Summarizer that holds a worker busy for a while.
struct SlowSummarizer {
    delay: Duration,
    calls: AtomicUsize,
}

#[async_trait]
impl Summarizer for SlowSummarizer {
    async fn summarize(
        &self,
        record: &MemoryRecord,
        _related: &[MemoryRecord],
    ) -> anyhow::Result<Summary> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(Summary {
            text: format!("summary of {}", record.id),
            keywords: vec![record.id.clone()],
        })
    }
}

async fn seeded_store(count: usize) -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    let old = Utc::now() - ChronoDuration::days(10);
    for i in 0..count {
        let record = MemoryRecord::with_id(format!("r{i}"), format!("turn number {i}"), Role::User)
            .weight(5.0)
            .created(old)
            .accessed(old);
        store.upsert_record(record).await.unwrap();
    }
    store
}

fn slow_pipeline(store: Arc<InMemoryStore>, summarizer: Arc<SlowSummarizer>) -> Arc<Pipeline> {
    Arc::new(Pipeline::new(
        store,
        SharedWeightConfig::default(),
        summarizer,
        Arc::new(CacheEventBus::new()),
    ))
}

#[tokio::test]
async fn test_ten_tasks_three_workers() {
    let store = seeded_store(10).await;
    let summarizer = Arc::new(SlowSummarizer {
        delay: Duration::from_millis(50),
        calls: AtomicUsize::new(0),
    });
    let scheduler = MaintenanceScheduler::start(
        slow_pipeline(store.clone(), summarizer.clone()),
        SchedulerConfig::default(),
    )
    .unwrap();

    let mut asynchronous = 0;
    let mut inline = 0;
    for i in 0..10 {
        match scheduler.submit(MaintenanceTask::new(format!("r{i}"))).await.unwrap() {
            Submission::Accepted(_) => asynchronous += 1,
            Submission::ExecutedInline(report) => {
                assert!(report.inline);
                assert_eq!(report.outcome(Stage::Score), Some(&StageOutcome::Done));
                inline += 1;
            }
        }
    }
    scheduler.wait_idle().await;

    assert_eq!(asynchronous + inline, 10);
    assert!(asynchronous >= 7, "only {asynchronous} ran asynchronously");
    assert!(inline >= 1, "no task overflowed to the caller");
    assert_eq!(summarizer.calls.load(Ordering::SeqCst), 10);

    let stats = scheduler.stats();
    assert_eq!(stats.finished_async, asynchronous);
    assert_eq!(stats.inline, inline);
    assert_eq!(stats.failed, 0);

    // Every task's weight write landed.
    let cutoff = Utc::now() - ChronoDuration::minutes(1);
    for i in 0..10 {
        let record = store.get_record(&format!("r{i}")).await.unwrap().unwrap();
        assert!(record.last_accessed_at > cutoff, "r{i} was never scored");
        assert!((record.weight - 5.0).abs() > 1e-9, "r{i} kept its old weight");
    }

    let report = scheduler.shutdown().await;
    assert_eq!(report.aborted, 0);
}

#[tokio::test]
async fn test_submit_after_shutdown_is_cancelled() {
    let store = seeded_store(1).await;
    let summarizer = Arc::new(SlowSummarizer {
        delay: Duration::from_millis(1),
        calls: AtomicUsize::new(0),
    });
    let scheduler = MaintenanceScheduler::start(
        slow_pipeline(store, summarizer),
        SchedulerConfig::default(),
    )
    .unwrap();
    scheduler.shutdown().await;

    let err = scheduler.submit(MaintenanceTask::new("r0")).await.unwrap_err();
    assert!(matches!(err, koru_recall::RecallError::Cancelled));
}

#[tokio::test]
async fn test_shutdown_aborts_stuck_workers() {
    let store = seeded_store(3).await;
    let summarizer = Arc::new(SlowSummarizer {
        delay: Duration::from_secs(30),
        calls: AtomicUsize::new(0),
    });
    let scheduler = MaintenanceScheduler::start(
        slow_pipeline(store, summarizer.clone()),
        SchedulerConfig::default(),
    )
    .unwrap();

    for i in 0..3 {
        scheduler.submit(MaintenanceTask::new(format!("r{i}"))).await.unwrap();
    }
    while summarizer.calls.load(Ordering::SeqCst) < 3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let report = scheduler.shutdown_within(Duration::from_millis(50)).await;
    assert_eq!(report.joined + report.aborted, 3);
    assert_eq!(report.aborted, 3);
}
