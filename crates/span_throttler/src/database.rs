//! Public facade over the throttler and the store's read path.
//!
//! Writes go through the [`Throttler`]; `get_longest_activity` reads the
//! store directly with no throttler interaction. `close` is the before-close
//! hook of the store connection: it must run to completion before the
//! connection is allowed to close.

use crate::event::{ExtraBag, SubmitKind, Timestamp};
use crate::store::{ActivitySpan, PersistentStoreBoxed, StoreError};
use crate::throttler::{Throttler, ThrottlerConfig};
use std::sync::Arc;

/// Activity span database: the public API of this crate.
pub struct ActivityDatabase {
    throttler: Throttler,
    store: Arc<dyn PersistentStoreBoxed>,
}

impl ActivityDatabase {
    /// Creates the database facade, starting the throttler's background
    /// tasks (periodic flush + startup recovery).
    pub fn new(config: ThrottlerConfig, store: Arc<dyn PersistentStoreBoxed>) -> Self {
        Self {
            throttler: Throttler::new(config, Arc::clone(&store)),
            store,
        }
    }

    /// See [`Throttler::submit_manual`].
    pub async fn submit_manual(
        &self,
        activity: &str,
        instance_id: &str,
        kind: SubmitKind,
        can_be_stale: bool,
        moment: Option<Timestamp>,
        extra: Option<ExtraBag>,
    ) -> Result<Option<Timestamp>, StoreError> {
        self.throttler
            .submit_manual(activity, instance_id, kind, can_be_stale, moment, extra)
            .await
    }

    /// See [`Throttler::submit_periodic`].
    pub async fn submit_periodic(
        &self,
        activity: &str,
        instance_id: &str,
        can_be_stale: bool,
        extra: Option<ExtraBag>,
    ) -> Option<Timestamp> {
        self.throttler
            .submit_periodic(activity, instance_id, can_be_stale, extra)
            .await
    }

    /// See [`Throttler::cancel`].
    pub async fn cancel(&self, activity: &str, instance_id: &str) -> Result<(), StoreError> {
        self.throttler.cancel(activity, instance_id).await
    }

    /// Returns the single longest persisted span of `activity` overlapping
    /// `[from, until]`. Pure store read; buffered-but-unflushed spans are
    /// not visible here.
    pub async fn get_longest_activity(
        &self,
        activity: &str,
        from: Option<Timestamp>,
        until: Option<Timestamp>,
    ) -> Result<Option<ActivitySpan>, StoreError> {
        self.store
            .query_longest_span_boxed(activity, from, until)
            .await
    }

    /// Access to the underlying throttler, for explicit flush control.
    pub fn throttler(&self) -> &Throttler {
        &self.throttler
    }

    /// Runs the shutdown protocol (final flush, then stale drain). Call
    /// before closing the underlying store connection.
    pub async fn close(self) -> Result<(), StoreError> {
        self.throttler.shutdown().await
    }
}
