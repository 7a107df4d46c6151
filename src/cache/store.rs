//! Stale-while-revalidate store on top of the request coordinator.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::storage::KvStorage;
use super::traits::{
  CacheEntry, CacheEvent, CacheEventKind, Cacheable, Clock, ReadResult, SystemClock,
};
use crate::coordinator::{Cancel, RequestCoordinator};
use crate::error::{SyncError, SyncResult};

/// Bump whenever the persisted payload shape changes.
pub const SCHEMA_VERSION: u32 = 1;

/// Tunables for a [`CacheStore`].
#[derive(Debug, Clone)]
pub struct CacheOptions {
  /// Prefix of persisted keys: `<namespace>_cache_v<N>:<key>`.
  pub namespace: String,
  pub schema_version: u32,
  /// Persisted entries older than `ttl * max_age_factor` are not hydrated.
  pub max_age_factor: i32,
  /// When set, [`CacheStore::get`] waits for a refresh instead of serving a
  /// value older than this.
  pub blocking_staleness: Option<Duration>,
}

impl Default for CacheOptions {
  fn default() -> Self {
    Self {
      namespace: "opsdeck".to_string(),
      schema_version: SCHEMA_VERSION,
      max_age_factor: 5,
      blocking_staleness: None,
    }
  }
}

/// Persisted form of an entry.
#[derive(Serialize, Deserialize)]
struct Envelope<T> {
  v: u32,
  /// Fetch time, milliseconds since the Unix epoch.
  ts: i64,
  #[serde(rename = "ttlMs")]
  ttl_ms: i64,
  data: T,
}

struct State<T> {
  entries: HashMap<String, CacheEntry<T>>,
  /// Keys already looked up in durable storage this session.
  hydrated: HashSet<String>,
  errors: HashMap<String, SyncError>,
  disposed: bool,
}

struct Inner<T> {
  state: Mutex<State<T>>,
  coordinator: RequestCoordinator<T>,
  storage: Arc<dyn KvStorage>,
  clock: Arc<dyn Clock>,
  events: broadcast::Sender<CacheEvent>,
  options: CacheOptions,
}

/// Keyed cache that answers immediately and refreshes in the background.
///
/// Reads never block on the network: they return whatever is cached (even
/// if stale) and, when the entry is missing or stale, start a refresh through
/// the coordinator. Successful refreshes replace the entry, are written to
/// durable storage and announced to subscribers. Failed refreshes keep the
/// previous value and are reported through [`CacheStore::subscribe`] and the
/// `error` field of the next read.
pub struct CacheStore<T> {
  inner: Arc<Inner<T>>,
}

impl<T: Cacheable> CacheStore<T> {
  pub fn new(storage: Arc<dyn KvStorage>, options: CacheOptions) -> Self {
    Self::with_clock(storage, options, Arc::new(SystemClock))
  }

  pub fn with_clock(
    storage: Arc<dyn KvStorage>,
    options: CacheOptions,
    clock: Arc<dyn Clock>,
  ) -> Self {
    let (events, _) = broadcast::channel(64);
    Self {
      inner: Arc::new(Inner {
        state: Mutex::new(State {
          entries: HashMap::new(),
          hydrated: HashSet::new(),
          errors: HashMap::new(),
          disposed: false,
        }),
        coordinator: RequestCoordinator::new(),
        storage,
        clock,
        events,
        options,
      }),
    }
  }

  fn lock(&self) -> MutexGuard<'_, State<T>> {
    self
      .inner
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Durable storage key for a query key.
  pub fn storage_key(&self, key: &str) -> String {
    format!(
      "{}_cache_v{}:{}",
      self.inner.options.namespace, self.inner.options.schema_version, key
    )
  }

  /// Hydrate the given keys from durable storage. Returns how many loaded.
  pub fn init(&self, keys: &[&str]) -> usize {
    let mut state = self.lock();
    state.disposed = false;
    keys
      .iter()
      .filter(|key| self.hydrate(&mut state, key))
      .count()
  }

  /// Cancel pending refreshes and drop everything held in memory.
  ///
  /// Persisted entries are kept. Results that arrive afterwards are ignored
  /// until [`CacheStore::init`] is called again.
  pub fn dispose(&self) {
    let mut state = self.lock();
    self.inner.coordinator.cancel_all();
    state.entries.clear();
    state.errors.clear();
    state.hydrated.clear();
    state.disposed = true;
    debug!(namespace = %self.inner.options.namespace, "cache store disposed");
  }

  /// Receive update, failure and invalidation notices.
  pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
    self.inner.events.subscribe()
  }

  /// Current entry for `key`, without triggering anything.
  pub fn peek(&self, key: &str) -> Option<CacheEntry<T>> {
    self.lock().entries.get(key).cloned()
  }

  /// Return the cached value now; refresh in the background if needed.
  ///
  /// Must be called from within a tokio runtime.
  pub fn read<F, Fut, E>(&self, key: &str, ttl: Duration, fetcher: F) -> ReadResult<T>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: Into<SyncError> + 'static,
  {
    let now = self.inner.clock.now();
    let (mut result, disposed) = {
      let mut state = self.lock();
      self.hydrate(&mut state, key);
      (Self::snapshot(&state, key, now), state.disposed)
    };

    let in_flight = self.inner.coordinator.is_in_flight(key);
    if result.is_stale && !disposed {
      if !in_flight {
        debug!(key, has_value = result.value.is_some(), "revalidating");
        self.spawn_refresh(key, ttl, fetcher);
      }
      result.refreshing = true;
    } else {
      result.refreshing = in_flight;
    }
    result
  }

  /// Like [`CacheStore::read`], but waits for the network when nothing is
  /// cached or the cached value is older than the blocking staleness bound.
  ///
  /// When a blocking refresh fails and an older value exists, that value is
  /// returned with the error attached.
  pub async fn get<F, Fut, E>(&self, key: &str, ttl: Duration, fetcher: F) -> SyncResult<ReadResult<T>>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: Into<SyncError> + 'static,
  {
    let now = self.inner.clock.now();
    let current = {
      let mut state = self.lock();
      self.hydrate(&mut state, key);
      Self::snapshot(&state, key, now)
    };

    let must_block = match current.fetched_at {
      None => true,
      Some(fetched_at) => self
        .inner
        .options
        .blocking_staleness
        .is_some_and(|bound| now - fetched_at > bound),
    };
    if !must_block {
      return Ok(self.read(key, ttl, fetcher));
    }

    match self.refresh(key, ttl, fetcher).await {
      Ok(_) => Ok(self.snapshot_now(key)),
      Err(err) if current.value.is_some() => Ok(ReadResult {
        error: Some(err),
        ..self.snapshot_now(key)
      }),
      Err(err) => Err(err),
    }
  }

  /// Fetch `key` now (joining any pending fetch) and apply the result.
  pub async fn refresh<F, Fut, E>(&self, key: &str, ttl: Duration, fetcher: F) -> SyncResult<T>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: Into<SyncError> + 'static,
  {
    let epoch = self.inner.coordinator.epoch(key);
    match self.inner.coordinator.run(key, fetcher).await {
      Ok(value) => {
        if self.apply(key, ttl, epoch, value.clone()) {
          Ok(value)
        } else {
          Err(SyncError::Cancelled)
        }
      }
      Err(err) if err.is_cancelled() => Err(err),
      Err(err) => {
        self.record_failure(key, epoch, &err);
        Err(err)
      }
    }
  }

  /// Drop `key` from memory and durable storage, cancelling any refresh.
  pub fn invalidate(&self, key: &str) {
    {
      let mut state = self.lock();
      self.inner.coordinator.cancel(key);
      state.entries.remove(key);
      state.errors.remove(key);
      // Nothing left to hydrate once the persisted copy is gone
      state.hydrated.insert(key.to_string());
      if let Err(e) = self.inner.storage.remove(&self.storage_key(key)) {
        warn!(key, error = %e, "failed to remove persisted cache entry");
      }
    }
    info!(key, "cache entry invalidated");
    let _ = self.inner.events.send(CacheEvent {
      key: key.to_string(),
      kind: CacheEventKind::Invalidated,
    });
  }

  /// Invalidate `prefix` itself and every `prefix:<filters>` variant, in
  /// memory and in durable storage. Returns how many keys were dropped.
  ///
  /// Used after a write, when every cached view of a resource is suspect.
  pub fn invalidate_prefix(&self, prefix: &str) -> usize {
    let scoped = format!("{}:", prefix);
    let matches = |key: &str| key == prefix || key.starts_with(&scoped);

    let mut keys: Vec<String> = self
      .lock()
      .entries
      .keys()
      .filter(|key| matches(key))
      .cloned()
      .collect();

    let root = self.storage_key("");
    match self.inner.storage.keys_with_prefix(&self.storage_key(prefix)) {
      Ok(stored) => keys.extend(
        stored
          .iter()
          .filter_map(|key| key.strip_prefix(&root))
          .filter(|key| matches(key))
          .map(str::to_string),
      ),
      Err(e) => warn!(prefix, error = %e, "failed to list persisted cache entries"),
    }

    keys.sort();
    keys.dedup();
    for key in &keys {
      self.invalidate(key);
    }
    keys.len()
  }

  fn spawn_refresh<F, Fut, E>(&self, key: &str, ttl: Duration, fetcher: F)
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: Into<SyncError> + 'static,
  {
    let store = self.clone();
    let key = key.to_string();
    tokio::spawn(async move {
      // Failures already went out on the event channel
      let _ = store.refresh(&key, ttl, fetcher).await;
    });
  }

  fn snapshot(state: &State<T>, key: &str, now: DateTime<Utc>) -> ReadResult<T> {
    let error = state.errors.get(key).cloned();
    match state.entries.get(key) {
      Some(entry) => ReadResult {
        value: Some(entry.value.clone()),
        is_stale: !entry.is_fresh(now),
        refreshing: false,
        fetched_at: Some(entry.fetched_at),
        error,
      },
      None => ReadResult {
        error,
        ..ReadResult::empty()
      },
    }
  }

  fn snapshot_now(&self, key: &str) -> ReadResult<T> {
    let now = self.inner.clock.now();
    let state = self.lock();
    Self::snapshot(&state, key, now)
  }

  fn apply(&self, key: &str, ttl: Duration, epoch: u64, value: T) -> bool {
    let fetched_at = self.inner.clock.now();
    {
      let mut state = self.lock();
      if state.disposed || self.inner.coordinator.epoch(key) != epoch {
        debug!(key, "dropping result for superseded request");
        return false;
      }
      let entry = CacheEntry {
        value,
        fetched_at,
        ttl,
      };
      self.persist(key, &entry);
      state.entries.insert(key.to_string(), entry);
      state.errors.remove(key);
      state.hydrated.insert(key.to_string());
    }
    debug!(key, "cache entry refreshed");
    let _ = self.inner.events.send(CacheEvent {
      key: key.to_string(),
      kind: CacheEventKind::Updated { fetched_at },
    });
    true
  }

  fn record_failure(&self, key: &str, epoch: u64, err: &SyncError) {
    {
      let mut state = self.lock();
      if state.disposed || self.inner.coordinator.epoch(key) != epoch {
        return;
      }
      state.errors.insert(key.to_string(), err.clone());
    }
    warn!(key, error = %err, "refresh failed; keeping last known value");
    let _ = self.inner.events.send(CacheEvent {
      key: key.to_string(),
      kind: CacheEventKind::Failed(err.clone()),
    });
  }

  fn persist(&self, key: &str, entry: &CacheEntry<T>) {
    let envelope = Envelope {
      v: self.inner.options.schema_version,
      ts: entry.fetched_at.timestamp_millis(),
      ttl_ms: entry.ttl.num_milliseconds(),
      data: &entry.value,
    };
    let result = serde_json::to_string(&envelope)
      .map_err(color_eyre::Report::from)
      .and_then(|raw| self.inner.storage.set(&self.storage_key(key), &raw));
    if let Err(e) = result {
      warn!(key, error = %e, "failed to persist cache entry");
    }
  }

  /// Load `key` from durable storage once per session.
  fn hydrate(&self, state: &mut State<T>, key: &str) -> bool {
    if state.entries.contains_key(key) || !state.hydrated.insert(key.to_string()) {
      return false;
    }

    let storage_key = self.storage_key(key);
    let raw = match self.inner.storage.get(&storage_key) {
      Ok(Some(raw)) => raw,
      Ok(None) => return false,
      Err(e) => {
        warn!(key, error = %e, "failed to read persisted cache entry");
        return false;
      }
    };

    match self.decode(&raw) {
      Some(entry) => {
        debug!(key, fetched_at = %entry.fetched_at, "hydrated cache entry");
        state.entries.insert(key.to_string(), entry);
        true
      }
      None => {
        debug!(key, "discarding unusable persisted cache entry");
        if let Err(e) = self.inner.storage.remove(&storage_key) {
          warn!(key, error = %e, "failed to remove persisted cache entry");
        }
        false
      }
    }
  }

  /// Corrupt, unversioned, mismatched, future-dated or too old envelopes
  /// yield `None`.
  fn decode(&self, raw: &str) -> Option<CacheEntry<T>> {
    let envelope: Envelope<T> = serde_json::from_str(raw).ok()?;
    if envelope.v != self.inner.options.schema_version || envelope.ttl_ms <= 0 {
      return None;
    }
    let fetched_at = DateTime::<Utc>::from_timestamp_millis(envelope.ts)?;
    let ttl = Duration::try_milliseconds(envelope.ttl_ms)?;
    let ceiling = ttl.checked_mul(self.inner.options.max_age_factor)?;
    let now = self.inner.clock.now();
    // A fetch time ahead of the clock would read as fresh indefinitely
    if fetched_at > now || now - fetched_at > ceiling {
      return None;
    }
    Some(CacheEntry {
      value: envelope.data,
      fetched_at,
      ttl,
    })
  }
}

impl<T: Cacheable> Cancel for CacheStore<T> {
  fn cancel(&self, key: &str) {
    self.inner.coordinator.cancel(key);
  }
}

impl<T> Clone for CacheStore<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}
