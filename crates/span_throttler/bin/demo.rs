//! # Activity Span Throttler Demo
//!
//! End-to-end walk through the write-coalescing pipeline against the
//! in-memory reference store:
//!
//! 1. a manual activity with an explicit start and end;
//! 2. a periodic activity refreshed in a burst, finalized by TTL;
//! 3. a cancelled activity that leaves no trace;
//! 4. an activity left open until shutdown, force-closed by the drain.
//!
//! ```bash
//! cargo run -p span_throttler --bin demo
//! ```

use span_throttler::{
    ActivityDatabase, ExtraBag, MemoryStore, SubmitKind, ThrottlerConfig,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    let store = Arc::new(MemoryStore::new());
    let config = ThrottlerConfig {
        update_pause: Duration::from_millis(200),
        ttl: Duration::from_millis(100),
    };
    let db = ActivityDatabase::new(config, store.clone());

    // Manual regime: explicit start and end.
    let extra: ExtraBag = [("project", "demo"), ("branch", "main")]
        .into_iter()
        .collect();
    db.submit_manual("build", "run-1", SubmitKind::Start, false, None, Some(extra))
        .await
        .expect("store write failed");
    tokio::time::sleep(Duration::from_millis(120)).await;
    db.submit_manual("build", "run-1", SubmitKind::End, false, None, None)
        .await
        .expect("store write failed");

    // Periodic regime: a burst of "still happening" signals becomes one row
    // once the TTL lapses without a refresh.
    for _ in 0..50 {
        db.submit_periodic("typing", "editor-1", true, None).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    tokio::time::sleep(Duration::from_millis(400)).await;

    // Cancelled activity: deleted from the store, removed from the buffer.
    db.submit_manual("index", "aborted", SubmitKind::Start, true, None, None)
        .await
        .expect("store write failed");
    db.cancel("index", "aborted").await.expect("store delete failed");

    // Left open on purpose: the shutdown drain will force-close it.
    db.submit_manual("debug", "session-9", SubmitKind::Start, true, None, None)
        .await
        .expect("store write failed");

    let longest = db
        .get_longest_activity("typing", None, None)
        .await
        .expect("store query failed");
    println!(
        "longest typing span: {}",
        serde_json::to_string_pretty(&longest).expect("serialization failed")
    );

    db.close().await.expect("shutdown drain failed");

    println!(
        "persisted spans after shutdown:\n{}",
        serde_json::to_string_pretty(&store.all_spans()).expect("serialization failed")
    );
}
