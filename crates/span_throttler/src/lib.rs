//! Activity Span Throttler
//!
//! A write-coalescing layer between high-frequency activity signals and a
//! persistent span store. Callers report that an activity started, is still
//! happening, or ended; the throttler buffers those signals in memory and
//! reduces them to a small number of durable time-span rows, guaranteeing
//! at most one open record per activity occurrence.
//!
//! Three timing regimes are reconciled under one lock:
//!
//! - **manual**: explicit start/end calls;
//! - **periodic**: repeated "still happening" calls with no explicit end,
//!   finalized once a TTL passes without a refresh;
//! - **recovery**: rows left open by a crash are closed at startup, and a
//!   shutdown drain force-closes everything still buffered.
//!
//! The persistent store is consumed through the [`PersistentStore`] trait;
//! this crate never owns schema or queries.

pub mod database;
pub mod event;
pub mod store;
pub mod throttler;

// Re-export main types
pub use database::ActivityDatabase;
pub use event::{
    now_millis, DatabaseId, EventDescriptor, EventKey, ExtraBag, SubmitKind, Timestamp,
};
pub use store::{
    ActivitySpan, MemoryStore, NullStore, PersistentStore, PersistentStoreBoxed, StoreError,
};
pub use throttler::{Throttler, ThrottlerConfig};
