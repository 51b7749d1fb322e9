//! The write-coalescing core.
//!
//! The [`Throttler`] owns the `key → descriptor` buffer behind a single
//! exclusive lock, a background flush task that periodically persists matured
//! spans, a one-shot startup recovery task, and the shutdown drain protocol.
//!
//! Locking discipline: the flush path holds the lock for map reads/writes
//! and snapshotting only, copying descriptor values out and doing store I/O
//! outside the critical section, then re-acquiring the lock just to apply
//! the resulting transition (remove-if-finished / set-id-if-inserted).
//! Single-event paths (`End`, `cancel`) instead keep the lock across their
//! one-row store call, so per-key operations stay totally ordered by lock
//! acquisition; a trade-off favoring simplicity over throughput at low
//! event rates.

use crate::event::{now_millis, EventDescriptor, EventKey, ExtraBag, SubmitKind, Timestamp};
use crate::store::{PersistentStoreBoxed, StoreError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Configuration for the throttler.
#[derive(Debug, Clone)]
pub struct ThrottlerConfig {
    /// Interval between scheduled flushes of the in-memory buffer.
    pub update_pause: Duration,
    /// How long a periodic event may go unrefreshed before a flush
    /// finalizes it. Also the basis for zero-duration padding (half TTL).
    pub ttl: Duration,
}

impl Default for ThrottlerConfig {
    fn default() -> Self {
        Self {
            update_pause: Duration::from_secs(4 * 60),
            // Twice the flush interval, so an activity refreshed at least
            // once per flush is never finalized prematurely.
            ttl: Duration::from_secs(8 * 60),
        }
    }
}

/// Shared state between the public handle and the background flush task.
struct Inner {
    events: Mutex<HashMap<EventKey, EventDescriptor>>,
    store: Arc<dyn PersistentStoreBoxed>,
    config: ThrottlerConfig,
}

impl Inner {
    fn ttl_millis(&self) -> u64 {
        self.config.ttl.as_millis() as u64
    }

    async fn submit_manual(
        &self,
        activity: &str,
        instance_id: &str,
        kind: SubmitKind,
        can_be_stale: bool,
        moment: Option<Timestamp>,
        extra: Option<ExtraBag>,
    ) -> Result<Option<Timestamp>, StoreError> {
        let key = EventKey::new(activity, instance_id);
        let mut events = self.events.lock().await;
        match kind {
            SubmitKind::Start => {
                match events.get(&key) {
                    Some(existing) if existing.is_periodic => {
                        warn!(%key, "manual start submitted for a periodic activity, rejecting");
                        return Ok(None);
                    }
                    Some(_) => {
                        warn!(%key, "activity already started, ignoring duplicate start");
                        return Ok(None);
                    }
                    None => {}
                }
                let started_at = moment.unwrap_or_else(now_millis);
                events.insert(
                    key,
                    EventDescriptor::new(
                        activity,
                        instance_id,
                        can_be_stale,
                        false,
                        started_at,
                        extra.unwrap_or_default(),
                    ),
                );
                Ok(Some(started_at))
            }
            SubmitKind::End => {
                let Some(descriptor) = events.get(&key) else {
                    warn!(%key, "ending an activity that was never started");
                    return Ok(None);
                };
                if descriptor.is_periodic {
                    warn!(%key, "manual end submitted for a periodic activity, rejecting");
                    return Ok(None);
                }
                let descriptor = descriptor.clone();
                // One-row path: the lock stays held across the store call so
                // a concurrent cancel cannot interleave between the removal
                // and the write.
                self.end_event_locked(
                    &mut events,
                    descriptor,
                    moment.unwrap_or_else(now_millis),
                    true,
                )
                .await
            }
        }
    }

    async fn submit_periodic(
        &self,
        activity: &str,
        instance_id: &str,
        can_be_stale: bool,
        extra: Option<ExtraBag>,
        now: Timestamp,
    ) -> Option<Timestamp> {
        let key = EventKey::new(activity, instance_id);
        let mut events = self.events.lock().await;
        match events.get_mut(&key) {
            Some(descriptor) if !descriptor.is_periodic => {
                warn!(%key, "periodic submission for a manually tracked activity, rejecting");
                None
            }
            Some(descriptor) => {
                // Refresh only; extra is first-submission-wins.
                descriptor.end_at = Some(now);
                Some(descriptor.started_at)
            }
            None => {
                let mut descriptor = EventDescriptor::new(
                    activity,
                    instance_id,
                    can_be_stale,
                    true,
                    now,
                    extra.unwrap_or_default(),
                );
                descriptor.end_at = Some(now);
                events.insert(key, descriptor);
                Some(now)
            }
        }
    }

    async fn cancel(&self, activity: &str, instance_id: &str) -> Result<(), StoreError> {
        let key = EventKey::new(activity, instance_id);
        // One-row path: delete and map removal happen under the lock so an
        // in-flight end for the same key cannot land a row after the cancel
        // has returned.
        let mut events = self.events.lock().await;
        let affected = self
            .store
            .delete_by_activity_boxed(activity, instance_id)
            .await?;
        if affected == 0 {
            debug!(%key, "cancel found nothing to delete in the store");
        }
        if events.remove(&key).is_none() {
            warn!(%key, "cancel of an activity that was never started");
        }
        Ok(())
    }

    /// Flushes matured spans to the store.
    ///
    /// Snapshots descriptor values under the lock, then does all store I/O
    /// outside it. A store error does not abort the pass; the first error is
    /// returned after every descriptor has been attempted. Unfinished
    /// periodic events stay buffered, so the next scheduled flush is the
    /// natural retry.
    async fn commit_changes(&self, now: Timestamp, is_final: bool) -> Result<(), StoreError> {
        let snapshot: Vec<EventDescriptor> =
            self.events.lock().await.values().cloned().collect();
        let ttl = self.ttl_millis();
        let mut first_err = None;

        for descriptor in snapshot {
            let key = descriptor.key();
            let result = if descriptor.is_periodic {
                let Some(end_at) = descriptor.end_at else {
                    // Periodic descriptors always carry an end timestamp.
                    warn!(%key, "periodic event without end timestamp, skipping");
                    continue;
                };
                let is_finished = is_final || end_at + ttl < now;
                self.end_event(descriptor, end_at, is_finished).await
            } else if descriptor.end_at.is_none() {
                // Open manual span: update-in-place so a crash cannot lose
                // the start. The in-memory entry is retained.
                self.end_event(descriptor, now, false).await
            } else {
                continue;
            };

            if let Err(e) = result {
                warn!(%key, error = %e, "flush failed for event");
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Shutdown-only drain: force-closes everything still buffered.
    async fn commit_stale_events(&self, now: Timestamp) -> Result<(), StoreError> {
        let snapshot: Vec<EventDescriptor> =
            self.events.lock().await.values().cloned().collect();
        let mut first_err = None;

        for descriptor in snapshot {
            let key = descriptor.key();
            if !descriptor.can_be_stale && descriptor.end_at.is_none() {
                warn!(%key, "activity still open at shutdown was never ended by its caller");
            }
            if let Err(e) = self.end_event(descriptor, now, true).await {
                warn!(%key, error = %e, "stale drain failed for event");
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Applies the zero-duration pad and the ordering guard.
    ///
    /// Returns the timestamp to persist, or `None` when the event must be
    /// discarded because it would end before it starts.
    fn resolve_end(&self, started_at: Timestamp, ended_at: Timestamp) -> Option<Timestamp> {
        // Spans have some nonzero duration; a zero-length span is a
        // measurement artifact, so pad it by half the TTL.
        let ended_at = if ended_at == started_at {
            started_at + self.ttl_millis() / 2
        } else {
            ended_at
        };
        (ended_at >= started_at).then_some(ended_at)
    }

    /// Issues the store write for one span: insert when the descriptor has
    /// no row yet, update otherwise. Returns the id of a fresh insert.
    async fn write_span(
        &self,
        descriptor: &EventDescriptor,
        ended_at: Timestamp,
        is_finished: bool,
    ) -> Result<Option<crate::event::DatabaseId>, StoreError> {
        match descriptor.database_id {
            None => {
                let id = self
                    .store
                    .insert_boxed(
                        &descriptor.activity,
                        &descriptor.instance_id,
                        descriptor.started_at,
                        ended_at,
                        is_finished,
                        &descriptor.extra,
                    )
                    .await?;
                Ok(Some(id))
            }
            Some(id) => {
                self.store.update_boxed(id, ended_at, is_finished).await?;
                Ok(None)
            }
        }
    }

    /// Core persistence primitive for the single-event paths: the caller
    /// already holds the map lock and keeps it across the store call, so no
    /// other operation on the same key can interleave.
    async fn end_event_locked(
        &self,
        events: &mut HashMap<EventKey, EventDescriptor>,
        descriptor: EventDescriptor,
        ended_at: Timestamp,
        is_finished: bool,
    ) -> Result<Option<Timestamp>, StoreError> {
        let key = descriptor.key();

        let Some(ended_at) = self.resolve_end(descriptor.started_at, ended_at) else {
            // Clock or caller-ordering bug; never persist such a span.
            events.remove(&key);
            warn!(
                %key,
                started_at = descriptor.started_at,
                ended_at,
                "event ends before it starts, discarding"
            );
            return Ok(None);
        };

        if is_finished && events.remove(&key).is_none() {
            warn!(%key, "event vanished before finalization, skipping store write");
            return Ok(None);
        }

        let inserted = self.write_span(&descriptor, ended_at, is_finished).await?;
        if !is_finished {
            if let Some(id) = inserted {
                if let Some(live) = events.get_mut(&key) {
                    if live.database_id.is_none() {
                        live.database_id = Some(id);
                    }
                }
            }
        }

        Ok(Some(ended_at))
    }

    /// Core persistence primitive for the flush paths.
    ///
    /// `descriptor` is a value copy; the live map entry is only touched under
    /// the lock, for removal (finished) or to record the inserted id, and the
    /// store call itself runs outside the critical section.
    /// Returns the persisted end timestamp, or `None` when the event was
    /// discarded or a concurrent finisher already removed it.
    async fn end_event(
        &self,
        descriptor: EventDescriptor,
        ended_at: Timestamp,
        is_finished: bool,
    ) -> Result<Option<Timestamp>, StoreError> {
        let key = descriptor.key();

        let Some(ended_at) = self.resolve_end(descriptor.started_at, ended_at) else {
            // Clock or caller-ordering bug; never persist such a span.
            self.events.lock().await.remove(&key);
            warn!(
                %key,
                started_at = descriptor.started_at,
                ended_at,
                "event ends before it starts, discarding"
            );
            return Ok(None);
        };

        if is_finished {
            // Remove before the store call so a concurrent duplicate end
            // cannot double-finish the span.
            if self.events.lock().await.remove(&key).is_none() {
                warn!(%key, "event vanished before finalization, skipping store write");
                return Ok(None);
            }
        }

        if let Some(id) = self.write_span(&descriptor, ended_at, is_finished).await? {
            if !is_finished {
                let mut events = self.events.lock().await;
                if let Some(live) = events.get_mut(&key) {
                    // Absent to present, once.
                    if live.database_id.is_none() {
                        live.database_id = Some(id);
                    }
                }
            }
        }

        Ok(Some(ended_at))
    }
}

/// Write-coalescing buffer for activity spans.
///
/// Accepts high-frequency start/still-happening/end signals and reduces them
/// to a small number of durable span rows, guaranteeing at most one open
/// record per `(activity, instance_id)` key. Owns a background task that
/// flushes matured spans every [`ThrottlerConfig::update_pause`], and a
/// startup task that closes rows left open by a previous crash.
///
/// All operations may block briefly on the internal lock and, for the
/// single-row paths, on store I/O.
pub struct Throttler {
    inner: Arc<Inner>,
    flush_task: Option<JoinHandle<()>>,
    recovery_task: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl Throttler {
    /// Creates the throttler and starts its background tasks.
    ///
    /// Spawns the startup recovery pass (`end_all_events` on the store) and
    /// the periodic flush scheduler. Recovery runs concurrently with early
    /// submissions; it only touches store rows, never the (empty) buffer.
    pub fn new(config: ThrottlerConfig, store: Arc<dyn PersistentStoreBoxed>) -> Self {
        let inner = Arc::new(Inner {
            events: Mutex::new(HashMap::new()),
            store,
            config,
        });

        let recovery_inner = Arc::clone(&inner);
        let recovery_task = tokio::spawn(async move {
            match recovery_inner.store.end_all_events_boxed().await {
                Ok(0) => debug!("startup recovery: no open spans from a previous run"),
                Ok(recovered) => {
                    info!(recovered, "startup recovery: closed spans left open by a previous run");
                }
                Err(error) => warn!(%error, "startup recovery failed"),
            }
        });

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let flush_inner = Arc::clone(&inner);
        let flush_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(flush_inner.config.update_pause);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately; skip it so the first
            // real flush happens one full pause after construction.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(error) = flush_inner.commit_changes(now_millis(), false).await {
                            warn!(%error, "scheduled flush failed");
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Self {
            inner,
            flush_task: Some(flush_task),
            recovery_task: Some(recovery_task),
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Submits an explicit start or end signal for a manually tracked
    /// activity.
    ///
    /// Returns the recorded start (for `Start`) or end (for `End`)
    /// timestamp. Caller-contract violations (duplicate start, end without
    /// start, manual end of a periodic key) are logged and answered with
    /// `Ok(None)`; only store I/O failures are errors.
    pub async fn submit_manual(
        &self,
        activity: &str,
        instance_id: &str,
        kind: SubmitKind,
        can_be_stale: bool,
        moment: Option<Timestamp>,
        extra: Option<ExtraBag>,
    ) -> Result<Option<Timestamp>, StoreError> {
        self.inner
            .submit_manual(activity, instance_id, kind, can_be_stale, moment, extra)
            .await
    }

    /// Submits a "still happening" signal for a periodic activity.
    ///
    /// Creates the span on first call (first call wins on `extra`) and
    /// refreshes its end timestamp on every call. Returns the span's start
    /// timestamp, or `None` if the key is already tracked manually. Does no
    /// store I/O.
    pub async fn submit_periodic(
        &self,
        activity: &str,
        instance_id: &str,
        can_be_stale: bool,
        extra: Option<ExtraBag>,
    ) -> Option<Timestamp> {
        self.inner
            .submit_periodic(activity, instance_id, can_be_stale, extra, now_millis())
            .await
    }

    /// Drops an activity occurrence: deletes any persisted row and removes
    /// the buffered entry. Unknown keys are logged, not errors.
    pub async fn cancel(&self, activity: &str, instance_id: &str) -> Result<(), StoreError> {
        self.inner.cancel(activity, instance_id).await
    }

    /// Flushes matured spans to the store. Called by the background
    /// scheduler with `is_final = false`; called once with `is_final = true`
    /// during shutdown, which finalizes every periodic span regardless of
    /// TTL.
    pub async fn commit_changes(&self, is_final: bool) -> Result<(), StoreError> {
        self.inner.commit_changes(now_millis(), is_final).await
    }

    /// Shutdown-only drain after `commit_changes(true)`: force-closes every
    /// remaining buffered span. An open span marked `!can_be_stale` is
    /// logged as a contract violation but closed all the same.
    pub async fn commit_stale_events(&self) -> Result<(), StoreError> {
        self.inner.commit_stale_events(now_millis()).await
    }

    /// Number of spans currently buffered.
    pub async fn open_events(&self) -> usize {
        self.inner.events.lock().await.len()
    }

    /// Waits for the startup recovery pass to complete.
    ///
    /// Construction never blocks on recovery; callers that must know no
    /// leftover open rows remain (e.g. before querying) can await this.
    pub async fn recovery_complete(&mut self) {
        if let Some(task) = self.recovery_task.take() {
            let _ = task.await;
        }
    }

    /// Runs the shutdown protocol: stops the scheduler, then
    /// `commit_changes(true)` followed by `commit_stale_events()`, in that
    /// order. Must complete before the underlying store connection closes.
    pub async fn shutdown(mut self) -> Result<(), StoreError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.flush_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.recovery_task.take() {
            let _ = task.await;
        }

        let now = now_millis();
        let committed = self.inner.commit_changes(now, true).await;
        let drained = self.inner.commit_stale_events(now).await;
        committed.and(drained)
    }
}

impl Drop for Throttler {
    fn drop(&mut self) {
        // Shutdown consumed self and already stopped the task; a handle
        // still present here means the throttler was dropped without
        // draining, so at least stop the scheduler.
        if let Some(task) = &self.flush_task {
            task.abort();
        }
    }
}
