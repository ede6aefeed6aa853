//! TTL-keyed schedule cache and per-property flight guards.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};

use crate::model::{PropertyRef, Schedule};

#[derive(Debug, Clone)]
/// A cached schedule with its freshness horizon.
pub struct CacheRecord {
    /// The last successfully scraped schedule.
    pub schedule: Schedule,
    /// Instant after which the record no longer counts as fresh.
    pub expires_at: DateTime<Utc>,
}

impl CacheRecord {
    /// A record is fresh strictly before its expiry.
    #[must_use]
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// In-process keyed store mapping property reference → last-known schedule.
///
/// `get` returns records regardless of freshness; interpreting
/// [`CacheRecord::expires_at`] is the caller's responsibility, which is what
/// enables the degraded stale-serving path after an upstream failure.
pub struct ScheduleCache {
    ttl: Duration,
    records: Mutex<HashMap<PropertyRef, CacheRecord>>,
}

impl Default for ScheduleCache {
    fn default() -> Self {
        Self::new(Duration::hours(24))
    }
}

impl ScheduleCache {
    /// Create a cache whose records stay fresh for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Look up the record for a property, fresh or not.
    #[must_use]
    pub fn get(&self, property_ref: &PropertyRef) -> Option<CacheRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(property_ref)
            .cloned()
    }

    /// Store a freshly scraped schedule, replacing any previous record.
    pub fn put(&self, property_ref: &PropertyRef, schedule: Schedule) {
        let record = CacheRecord {
            schedule,
            expires_at: Utc::now() + self.ttl,
        };
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(property_ref.clone(), record);
    }

    /// Evict the record for a single property. Scoped per key, never a global
    /// wipe.
    pub fn invalidate(&self, property_ref: &PropertyRef) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(property_ref);
    }
}

/// Per-property guards enforcing at-most-one concurrent upstream scrape.
///
/// The first caller for a key holds its guard across fetch+parse+store;
/// concurrent callers for the same key wait on the guard and then observe the
/// first caller's result through the cache re-check.
#[derive(Default)]
pub struct FlightGuards {
    guards: Mutex<HashMap<PropertyRef, Arc<tokio::sync::Mutex<()>>>>,
}

impl FlightGuards {
    /// Fetch (or create) the guard for a property.
    #[must_use]
    pub fn guard_for(&self, property_ref: &PropertyRef) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.guards
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(property_ref.clone())
                .or_default(),
        )
    }

    /// Drop the tracked guard for a property once no caller holds it, keeping
    /// the map bounded by in-flight keys rather than every key ever seen.
    pub fn prune(&self, property_ref: &PropertyRef) {
        let mut guards = self.guards.lock().unwrap_or_else(PoisonError::into_inner);
        if guards
            .get(property_ref)
            .is_some_and(|guard| Arc::strong_count(guard) == 1)
        {
            guards.remove(property_ref);
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked(&self) -> usize {
        self.guards
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
