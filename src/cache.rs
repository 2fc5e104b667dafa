//! TTL-bounded cache cells for remote lookups that are expensive but
//! tolerably stale (role membership, helpdesk state list).
//!
//! Cached values are never authoritative: callers refresh through the
//! owning client when `is_stale` reports true.

use std::time::{Duration, Instant};

/// A value together with the instant it was fetched and how long it may
/// be served before a refresh is required.
#[derive(Debug, Clone)]
pub struct Cached<T> {
    value: T,
    fetched_at: Instant,
    ttl: Duration,
}

impl<T> Cached<T> {
    pub fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            fetched_at: Instant::now(),
            ttl,
        }
    }

    pub fn is_stale(&self) -> bool {
        self.fetched_at.elapsed() >= self.ttl
    }

    /// The cached value regardless of freshness. Callers that must not
    /// serve stale data check `is_stale` first.
    pub fn value(&self) -> &T {
        &self.value
    }

    /// The value only while fresh.
    pub fn fresh(&self) -> Option<&T> {
        if self.is_stale() {
            None
        } else {
            Some(&self.value)
        }
    }

    pub fn replace(&mut self, value: T) {
        self.value = value;
        self.fetched_at = Instant::now();
    }
}
