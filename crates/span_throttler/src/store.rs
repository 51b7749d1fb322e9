//! The persistent store boundary consumed by the throttler.
//!
//! The throttler never touches a database directly; it speaks to a
//! [`PersistentStore`] implementation that owns schema, queries and the
//! connection lifecycle. This module ships two reference backends:
//! [`NullStore`] (discards everything, for benchmarking) and [`MemoryStore`]
//! (an in-memory row vector, for tests and demos).

use crate::event::{DatabaseId, ExtraBag, Timestamp};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Error types for store operations.
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    /// Backend-layer error (driver, connection, SQL).
    #[error("backend error: {0}")]
    Backend(String),
    /// The store connection has already been closed.
    #[error("store is closed")]
    Closed,
}

/// A persisted activity span as returned by store queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySpan {
    pub activity: String,
    pub instance_id: String,
    pub started_at: Timestamp,
    pub ended_at: Timestamp,
    pub is_finished: bool,
    pub extra: ExtraBag,
}

impl ActivitySpan {
    /// Span duration in milliseconds. Zero if the row is malformed.
    pub fn duration_millis(&self) -> u64 {
        self.ended_at.saturating_sub(self.started_at)
    }
}

/// Write/delete/query primitives the throttler depends on.
///
/// Uses native async fn in traits. This trait is not object-safe; for
/// dynamic dispatch use [`PersistentStoreBoxed`].
pub trait PersistentStore: Send + Sync {
    /// Inserts a new span row and returns its store-assigned identity.
    fn insert(
        &self,
        activity: &str,
        instance_id: &str,
        started_at: Timestamp,
        ended_at: Timestamp,
        is_finished: bool,
        extra: &ExtraBag,
    ) -> impl Future<Output = Result<DatabaseId, StoreError>> + Send;

    /// Updates the end timestamp and finished flag of an existing row.
    fn update(
        &self,
        id: DatabaseId,
        ended_at: Timestamp,
        is_finished: bool,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Deletes any persisted rows for one activity occurrence.
    ///
    /// Returns the number of rows affected (zero is not an error).
    fn delete_by_activity(
        &self,
        activity: &str,
        instance_id: &str,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Marks every still-open row as finished (crash recovery, run once at
    /// startup before the in-memory buffer accepts submissions).
    ///
    /// The end timestamp for recovered rows is the store's concern.
    fn end_all_events(&self) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Returns the single longest span of the given activity overlapping
    /// `[from, until]` (either bound may be absent).
    ///
    /// Conforming stores break duration ties by earliest `started_at`, then
    /// lowest row id, so the result is deterministic.
    fn query_longest_span(
        &self,
        activity: &str,
        from: Option<Timestamp>,
        until: Option<Timestamp>,
    ) -> impl Future<Output = Result<Option<ActivitySpan>, StoreError>> + Send;

    /// Returns the store name for logging.
    fn name(&self) -> &str;
}

/// Object-safe version of [`PersistentStore`] for dynamic dispatch.
pub trait PersistentStoreBoxed: Send + Sync {
    fn insert_boxed<'a>(
        &'a self,
        activity: &'a str,
        instance_id: &'a str,
        started_at: Timestamp,
        ended_at: Timestamp,
        is_finished: bool,
        extra: &'a ExtraBag,
    ) -> Pin<Box<dyn Future<Output = Result<DatabaseId, StoreError>> + Send + 'a>>;

    fn update_boxed(
        &self,
        id: DatabaseId,
        ended_at: Timestamp,
        is_finished: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;

    fn delete_by_activity_boxed<'a>(
        &'a self,
        activity: &'a str,
        instance_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<u64, StoreError>> + Send + 'a>>;

    fn end_all_events_boxed(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<u64, StoreError>> + Send + '_>>;

    fn query_longest_span_boxed<'a>(
        &'a self,
        activity: &'a str,
        from: Option<Timestamp>,
        until: Option<Timestamp>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ActivitySpan>, StoreError>> + Send + 'a>>;

    fn name(&self) -> &str;
}

/// Blanket implementation: any [`PersistentStore`] can be used boxed.
impl<T: PersistentStore> PersistentStoreBoxed for T {
    fn insert_boxed<'a>(
        &'a self,
        activity: &'a str,
        instance_id: &'a str,
        started_at: Timestamp,
        ended_at: Timestamp,
        is_finished: bool,
        extra: &'a ExtraBag,
    ) -> Pin<Box<dyn Future<Output = Result<DatabaseId, StoreError>> + Send + 'a>> {
        Box::pin(self.insert(activity, instance_id, started_at, ended_at, is_finished, extra))
    }

    fn update_boxed(
        &self,
        id: DatabaseId,
        ended_at: Timestamp,
        is_finished: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(self.update(id, ended_at, is_finished))
    }

    fn delete_by_activity_boxed<'a>(
        &'a self,
        activity: &'a str,
        instance_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<u64, StoreError>> + Send + 'a>> {
        Box::pin(self.delete_by_activity(activity, instance_id))
    }

    fn end_all_events_boxed(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<u64, StoreError>> + Send + '_>> {
        Box::pin(self.end_all_events())
    }

    fn query_longest_span_boxed<'a>(
        &'a self,
        activity: &'a str,
        from: Option<Timestamp>,
        until: Option<Timestamp>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ActivitySpan>, StoreError>> + Send + 'a>> {
        Box::pin(self.query_longest_span(activity, from, until))
    }

    fn name(&self) -> &str {
        PersistentStore::name(self)
    }
}

/// Store that discards all writes (for benchmarking).
///
/// Inserts still hand out unique ids so the insert-then-update transition of
/// buffered descriptors behaves normally.
pub struct NullStore {
    next_id: std::sync::atomic::AtomicI64,
}

impl NullStore {
    pub fn new() -> Self {
        Self {
            next_id: std::sync::atomic::AtomicI64::new(1),
        }
    }
}

impl Default for NullStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistentStore for NullStore {
    async fn insert(
        &self,
        _activity: &str,
        _instance_id: &str,
        _started_at: Timestamp,
        _ended_at: Timestamp,
        _is_finished: bool,
        _extra: &ExtraBag,
    ) -> Result<DatabaseId, StoreError> {
        Ok(self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed))
    }

    async fn update(
        &self,
        _id: DatabaseId,
        _ended_at: Timestamp,
        _is_finished: bool,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    async fn delete_by_activity(
        &self,
        _activity: &str,
        _instance_id: &str,
    ) -> Result<u64, StoreError> {
        Ok(0)
    }

    async fn end_all_events(&self) -> Result<u64, StoreError> {
        Ok(0)
    }

    async fn query_longest_span(
        &self,
        _activity: &str,
        _from: Option<Timestamp>,
        _until: Option<Timestamp>,
    ) -> Result<Option<ActivitySpan>, StoreError> {
        Ok(None)
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// One persisted row inside [`MemoryStore`].
#[derive(Debug, Clone)]
struct MemoryRow {
    id: DatabaseId,
    span: ActivitySpan,
}

/// In-memory store backend for tests and demos.
///
/// Rows live in a mutex-guarded vector; ids are assigned sequentially.
pub struct MemoryStore {
    rows: std::sync::Mutex<Vec<MemoryRow>>,
    next_id: std::sync::atomic::AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            rows: std::sync::Mutex::new(Vec::new()),
            next_id: std::sync::atomic::AtomicI64::new(1),
        }
    }

    /// Number of rows currently persisted.
    pub fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    /// Snapshot of all persisted spans, in insertion order.
    pub fn all_spans(&self) -> Vec<ActivitySpan> {
        self.rows.lock().unwrap().iter().map(|r| r.span.clone()).collect()
    }

    /// Spans persisted for one activity kind, in insertion order.
    pub fn spans_for(&self, activity: &str) -> Vec<ActivitySpan> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.span.activity == activity)
            .map(|r| r.span.clone())
            .collect()
    }

    /// Seeds a row directly, bypassing the insert path. Returns its id.
    ///
    /// Lets tests stage leftover rows from a "previous run" before the
    /// throttler's startup recovery kicks in.
    pub fn seed(&self, span: ActivitySpan) -> DatabaseId {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.rows.lock().unwrap().push(MemoryRow { id, span });
        id
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistentStore for MemoryStore {
    async fn insert(
        &self,
        activity: &str,
        instance_id: &str,
        started_at: Timestamp,
        ended_at: Timestamp,
        is_finished: bool,
        extra: &ExtraBag,
    ) -> Result<DatabaseId, StoreError> {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.rows.lock().unwrap().push(MemoryRow {
            id,
            span: ActivitySpan {
                activity: activity.to_string(),
                instance_id: instance_id.to_string(),
                started_at,
                ended_at,
                is_finished,
                extra: extra.clone(),
            },
        });
        Ok(id)
    }

    async fn update(
        &self,
        id: DatabaseId,
        ended_at: Timestamp,
        is_finished: bool,
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        match rows.iter_mut().find(|r| r.id == id) {
            Some(row) => {
                row.span.ended_at = ended_at;
                row.span.is_finished = is_finished;
                Ok(())
            }
            None => Err(StoreError::Backend(format!("no row with id {id}"))),
        }
    }

    async fn delete_by_activity(
        &self,
        activity: &str,
        instance_id: &str,
    ) -> Result<u64, StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|r| !(r.span.activity == activity && r.span.instance_id == instance_id));
        Ok((before - rows.len()) as u64)
    }

    async fn end_all_events(&self) -> Result<u64, StoreError> {
        let now = crate::event::now_millis();
        let mut rows = self.rows.lock().unwrap();
        let mut affected = 0;
        for row in rows.iter_mut().filter(|r| !r.span.is_finished) {
            row.span.is_finished = true;
            if row.span.ended_at < row.span.started_at {
                row.span.ended_at = now.max(row.span.started_at);
            }
            affected += 1;
        }
        Ok(affected)
    }

    async fn query_longest_span(
        &self,
        activity: &str,
        from: Option<Timestamp>,
        until: Option<Timestamp>,
    ) -> Result<Option<ActivitySpan>, StoreError> {
        let from = from.unwrap_or(0);
        let until = until.unwrap_or(Timestamp::MAX);
        let rows = self.rows.lock().unwrap();
        // Longest duration wins; ties broken by earliest start, then lowest id.
        let best = rows
            .iter()
            .filter(|r| {
                r.span.activity == activity
                    && r.span.started_at <= until
                    && r.span.ended_at >= from
            })
            .max_by(|a, b| {
                a.span
                    .duration_millis()
                    .cmp(&b.span.duration_millis())
                    .then_with(|| b.span.started_at.cmp(&a.span.started_at))
                    .then_with(|| b.id.cmp(&a.id))
            });
        Ok(best.map(|r| r.span.clone()))
    }

    fn name(&self) -> &str {
        "memory"
    }
}
