//! Core traits and types for the caching system.

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::SyncError;

/// Payloads the cache can hold and persist.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Cacheable for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Source of wall-clock time for freshness and hydration checks.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// The real clock.
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// Last successfully fetched payload for a key.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
  pub value: T,
  pub fetched_at: DateTime<Utc>,
  pub ttl: Duration,
}

impl<T> CacheEntry<T> {
  /// Fresh iff `now - fetched_at < ttl`.
  pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
    self.age(now) < self.ttl
  }

  pub fn age(&self, now: DateTime<Utc>) -> Duration {
    now - self.fetched_at
  }
}

/// What a read hands back immediately.
#[derive(Debug, Clone)]
pub struct ReadResult<T> {
  /// Last known value, possibly stale. `None` until the first fetch lands.
  pub value: Option<T>,
  /// True when the value is missing or older than its TTL.
  pub is_stale: bool,
  /// True when a background refresh is pending for the key.
  pub refreshing: bool,
  pub fetched_at: Option<DateTime<Utc>>,
  /// Error from the most recent failed refresh, cleared on success.
  pub error: Option<SyncError>,
}

impl<T> ReadResult<T> {
  pub fn empty() -> Self {
    Self {
      value: None,
      is_stale: true,
      refreshing: false,
      fetched_at: None,
      error: None,
    }
  }
}

/// Notification sent to subscribers whenever a key changes.
#[derive(Debug, Clone)]
pub struct CacheEvent {
  pub key: String,
  pub kind: CacheEventKind,
}

#[derive(Debug, Clone)]
pub enum CacheEventKind {
  /// A refresh succeeded and replaced the entry.
  Updated { fetched_at: DateTime<Utc> },
  /// A refresh failed; the previous value (if any) is still served.
  Failed(SyncError),
  /// The entry was dropped from memory and storage.
  Invalidated,
}

#[cfg(test)]
pub use self::manual::ManualClock;

#[cfg(test)]
mod manual {
  use super::*;
  use std::sync::Mutex;

  /// Clock that only moves when told to.
  pub struct ManualClock(Mutex<DateTime<Utc>>);

  impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
      Self(Mutex::new(start))
    }

    pub fn advance(&self, by: Duration) {
      let mut now = self.0.lock().unwrap();
      *now += by;
    }
  }

  impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
      *self.0.lock().unwrap()
    }
  }
}
