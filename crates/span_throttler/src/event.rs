//! Value types for buffered activity events.
//!
//! An [`EventDescriptor`] is the in-memory record for one open (or
//! just-closed) activity span. Identity is the composite key
//! `(activity, instance_id)`; everything else is timing and metadata that
//! the throttler mutates under its lock.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Opaque row identity assigned by the persistent store on first insert.
pub type DatabaseId = i64;

/// Returns the current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as Timestamp
}

/// Composite key identifying one occurrence of an activity.
///
/// Unique among *open* events; a key may be reused after a prior span with
/// that key has been finalized and removed from the buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    /// Activity type identifier (opaque to this crate).
    pub activity: String,
    /// Caller-supplied identifier for this specific occurrence.
    pub instance_id: String,
}

impl EventKey {
    pub fn new(activity: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            activity: activity.into(),
            instance_id: instance_id.into(),
        }
    }
}

impl std::fmt::Display for EventKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.activity, self.instance_id)
    }
}

/// Insertion-ordered string metadata with first-write-wins semantics.
///
/// Set once when a descriptor is created; a later insert for an existing key
/// is ignored rather than overwriting the original value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraBag {
    entries: Vec<(String, String)>,
}

impl ExtraBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a key/value pair unless the key is already present.
    ///
    /// Returns `true` if the pair was inserted.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        if self.entries.iter().any(|(k, _)| *k == key) {
            return false;
        }
        self.entries.push((key, value.into()));
        true
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ExtraBag {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut bag = Self::new();
        for (k, v) in iter {
            bag.insert(k, v);
        }
        bag
    }
}

/// Whether a manual submission opens or closes a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitKind {
    Start,
    End,
}

/// In-memory record for one open or recently-closed activity span.
#[derive(Debug, Clone)]
pub struct EventDescriptor {
    /// Activity type identifier.
    pub activity: String,
    /// Caller-supplied occurrence identifier.
    pub instance_id: String,
    /// If true the span may be force-closed at shutdown without being a
    /// contract violation.
    pub can_be_stale: bool,
    /// Periodic ("still happening") vs manual (explicit start/end) semantics.
    pub is_periodic: bool,
    /// Set once at creation, immutable afterwards.
    pub started_at: Timestamp,
    /// Absent for an open manual span; always present (and repeatedly
    /// refreshed) for a periodic span.
    pub end_at: Option<Timestamp>,
    /// Assigned by the store on first successful insert; present means the
    /// next write must be an update against this id.
    pub database_id: Option<DatabaseId>,
    /// First-submission-wins metadata.
    pub extra: ExtraBag,
}

impl EventDescriptor {
    pub fn new(
        activity: impl Into<String>,
        instance_id: impl Into<String>,
        can_be_stale: bool,
        is_periodic: bool,
        started_at: Timestamp,
        extra: ExtraBag,
    ) -> Self {
        Self {
            activity: activity.into(),
            instance_id: instance_id.into(),
            can_be_stale,
            is_periodic,
            started_at,
            end_at: None,
            database_id: None,
            extra,
        }
    }

    /// The composite map key for this descriptor. Pure and deterministic.
    pub fn key(&self) -> EventKey {
        EventKey::new(self.activity.clone(), self.instance_id.clone())
    }
}
