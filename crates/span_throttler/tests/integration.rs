use span_throttler::{
    ActivityDatabase, ActivitySpan, DatabaseId, ExtraBag, MemoryStore, PersistentStore,
    StoreError, SubmitKind, Throttler, ThrottlerConfig, Timestamp,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Store double that counts write operations on top of `MemoryStore`, to
/// verify that high-frequency submissions coalesce into few store calls.
struct CountingStore {
    inner: MemoryStore,
    inserts: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
}

impl CountingStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            inserts: AtomicU64::new(0),
            updates: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }

    fn write_count(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed) + self.updates.load(Ordering::Relaxed)
    }
}

impl PersistentStore for CountingStore {
    async fn insert(
        &self,
        activity: &str,
        instance_id: &str,
        started_at: Timestamp,
        ended_at: Timestamp,
        is_finished: bool,
        extra: &ExtraBag,
    ) -> Result<DatabaseId, StoreError> {
        self.inserts.fetch_add(1, Ordering::Relaxed);
        self.inner
            .insert(activity, instance_id, started_at, ended_at, is_finished, extra)
            .await
    }

    async fn update(
        &self,
        id: DatabaseId,
        ended_at: Timestamp,
        is_finished: bool,
    ) -> Result<(), StoreError> {
        self.updates.fetch_add(1, Ordering::Relaxed);
        self.inner.update(id, ended_at, is_finished).await
    }

    async fn delete_by_activity(
        &self,
        activity: &str,
        instance_id: &str,
    ) -> Result<u64, StoreError> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        self.inner.delete_by_activity(activity, instance_id).await
    }

    async fn end_all_events(&self) -> Result<u64, StoreError> {
        self.inner.end_all_events().await
    }

    async fn query_longest_span(
        &self,
        activity: &str,
        from: Option<Timestamp>,
        until: Option<Timestamp>,
    ) -> Result<Option<ActivitySpan>, StoreError> {
        self.inner.query_longest_span(activity, from, until).await
    }

    fn name(&self) -> &str {
        "counting"
    }
}

fn quiet_config() -> ThrottlerConfig {
    // Scheduler effectively disabled; tests drive flushes explicitly.
    ThrottlerConfig {
        update_pause: Duration::from_secs(3600),
        ttl: Duration::from_millis(100),
    }
}

#[tokio::test]
async fn high_frequency_periodic_coalesces_into_one_row() {
    let store = Arc::new(CountingStore::new());
    let throttler = Throttler::new(quiet_config(), store.clone());

    // A burst of "still happening" signals: zero store writes while buffered.
    for _ in 0..500 {
        throttler
            .submit_periodic("typing", "session-1", true, None)
            .await
            .unwrap();
    }
    assert_eq!(store.write_count(), 0);

    // Let the TTL lapse, then flush: the whole burst becomes one finished row.
    tokio::time::sleep(Duration::from_millis(150)).await;
    throttler.commit_changes(false).await.unwrap();

    assert_eq!(store.inner.row_count(), 1);
    assert_eq!(store.write_count(), 1);
    assert!(store.inner.all_spans()[0].is_finished);
    assert_eq!(throttler.open_events().await, 0);

    throttler.shutdown().await.unwrap();
    assert_eq!(store.inner.row_count(), 1);
}

#[tokio::test]
async fn periodic_refresh_extends_the_open_span() {
    let store = Arc::new(MemoryStore::new());
    let config = ThrottlerConfig {
        update_pause: Duration::from_secs(3600),
        ttl: Duration::from_millis(200),
    };
    let throttler = Throttler::new(config, store.clone());

    let started = throttler
        .submit_periodic("typing", "id2", true, None)
        .await
        .unwrap();

    // Keep refreshing faster than the TTL: flushes must not finalize.
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let again = throttler
            .submit_periodic("typing", "id2", true, None)
            .await
            .unwrap();
        assert_eq!(again, started);
        throttler.commit_changes(false).await.unwrap();
        assert_eq!(throttler.open_events().await, 1);
    }

    // Stop refreshing; once the TTL lapses the next flush finalizes it.
    tokio::time::sleep(Duration::from_millis(250)).await;
    throttler.commit_changes(false).await.unwrap();
    assert_eq!(throttler.open_events().await, 0);

    let spans = store.spans_for("typing");
    assert_eq!(spans.len(), 1);
    assert!(spans[0].is_finished);
    assert_eq!(spans[0].started_at, started);

    throttler.shutdown().await.unwrap();
}

#[tokio::test]
async fn background_scheduler_flushes_without_explicit_calls() {
    let store = Arc::new(MemoryStore::new());
    let config = ThrottlerConfig {
        update_pause: Duration::from_millis(50),
        ttl: Duration::from_millis(30),
    };
    let throttler = Throttler::new(config, store.clone());

    throttler
        .submit_periodic("typing", "bg", true, None)
        .await
        .unwrap();

    // No explicit commit: the scheduler must finalize it once stale.
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(throttler.open_events().await, 0);
    let spans = store.spans_for("typing");
    assert_eq!(spans.len(), 1);
    assert!(spans[0].is_finished);

    throttler.shutdown().await.unwrap();
}

#[tokio::test]
async fn stale_manual_span_is_force_closed_at_shutdown() {
    let store = Arc::new(MemoryStore::new());
    let db = ActivityDatabase::new(quiet_config(), store.clone());

    // Contract violation staged deliberately: never ended, cannot be stale.
    let started = db
        .submit_manual("build", "id1", SubmitKind::Start, false, None, None)
        .await
        .unwrap()
        .unwrap();

    db.close().await.unwrap();

    let spans = store.spans_for("build");
    assert_eq!(spans.len(), 1);
    assert!(spans[0].is_finished);
    assert_eq!(spans[0].started_at, started);
    assert!(spans[0].ended_at >= started);
}

#[tokio::test]
async fn mixed_workload_survives_close_without_loss_or_duplication() {
    let store = Arc::new(CountingStore::new());
    let db = ActivityDatabase::new(quiet_config(), store.clone());

    db.submit_manual("build", "done", SubmitKind::Start, true, Some(1_000), None)
        .await
        .unwrap();
    db.submit_manual("build", "done", SubmitKind::End, true, Some(9_000), None)
        .await
        .unwrap();
    db.submit_manual("build", "open", SubmitKind::Start, false, Some(2_000), None)
        .await
        .unwrap();
    for _ in 0..10 {
        db.submit_periodic("typing", "t1", true, None).await.unwrap();
    }
    db.submit_manual("index", "gone", SubmitKind::Start, true, Some(3_000), None)
        .await
        .unwrap();
    db.cancel("index", "gone").await.unwrap();

    db.close().await.unwrap();

    let spans = store.inner.all_spans();
    assert_eq!(spans.len(), 3);
    assert!(spans.iter().all(|s| s.is_finished));
    assert!(!spans.iter().any(|s| s.activity == "index"));

    let mut keys: Vec<_> = spans
        .iter()
        .map(|s| (s.activity.as_str(), s.instance_id.as_str()))
        .collect();
    keys.sort_unstable();
    keys.dedup();
    assert_eq!(keys.len(), 3);
}

#[tokio::test]
async fn facade_rejects_mixed_periodic_and_manual_usage() {
    let store = Arc::new(MemoryStore::new());
    let db = ActivityDatabase::new(quiet_config(), store.clone());

    assert!(db.submit_periodic("scroll", "k", true, None).await.is_some());
    assert!(db
        .submit_manual("scroll", "k", SubmitKind::Start, true, None, None)
        .await
        .unwrap()
        .is_none());
    assert!(db
        .submit_manual("scroll", "k", SubmitKind::End, true, None, None)
        .await
        .unwrap()
        .is_none());

    db.submit_manual("save", "k", SubmitKind::Start, true, None, None)
        .await
        .unwrap()
        .unwrap();
    assert!(db.submit_periodic("save", "k", true, None).await.is_none());

    db.close().await.unwrap();
}

#[tokio::test]
async fn longest_activity_after_restart_includes_recovered_rows() {
    let store = Arc::new(MemoryStore::new());

    // First "process run": two finished builds, one left open by a crash.
    {
        let db = ActivityDatabase::new(quiet_config(), store.clone());
        db.submit_manual("build", "a", SubmitKind::Start, true, Some(0), None)
            .await
            .unwrap();
        db.submit_manual("build", "a", SubmitKind::End, true, Some(30_000), None)
            .await
            .unwrap();
        db.close().await.unwrap();
    }
    store.seed(ActivitySpan {
        activity: "build".to_string(),
        instance_id: "crashed".to_string(),
        started_at: 0,
        ended_at: 5_000,
        is_finished: false,
        extra: ExtraBag::new(),
    });

    // Second run: startup recovery closes the crashed row.
    let db = ActivityDatabase::new(quiet_config(), store.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(store.all_spans().iter().all(|s| s.is_finished));
    let longest = db
        .get_longest_activity("build", None, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(longest.instance_id, "a");

    db.close().await.unwrap();
}

#[tokio::test]
async fn extra_metadata_reaches_the_store_intact() {
    let store = Arc::new(MemoryStore::new());
    let db = ActivityDatabase::new(quiet_config(), store.clone());

    let extra: ExtraBag = [("project", "core"), ("branch", "main")]
        .into_iter()
        .collect();
    db.submit_manual(
        "build",
        "id1",
        SubmitKind::Start,
        true,
        Some(1_000),
        Some(extra),
    )
    .await
    .unwrap();
    db.submit_manual("build", "id1", SubmitKind::End, true, Some(2_000), None)
        .await
        .unwrap();

    let spans = store.spans_for("build");
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].extra.get("project"), Some("core"));
    assert_eq!(spans[0].extra.get("branch"), Some("main"));

    db.close().await.unwrap();
}
