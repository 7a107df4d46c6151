//! Per-key request de-duplication and cooperative cancellation.
//!
//! At most one request per key is in flight. Callers that arrive while a
//! request is pending join it and receive the same outcome. Cancelling a key
//! aborts the pending future and bumps the key's epoch, so a result that
//! still manages to arrive is reported as [`SyncError::Cancelled`] instead of
//! being handed to anyone who would apply it.

use futures::future::{abortable, AbortHandle, Aborted, BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use crate::error::{SyncError, SyncResult};

type SharedOutcome<T> = Shared<BoxFuture<'static, SyncResult<T>>>;

/// Anything that can cancel the outstanding work for a query key.
pub trait Cancel: Send + Sync {
  fn cancel(&self, key: &str);
}

struct InFlight<T> {
  /// Identifies this particular issuance, so only it removes itself.
  ticket: u64,
  /// Key epoch at issuance; a later cancel makes this stale.
  epoch: u64,
  outcome: SharedOutcome<T>,
  abort: AbortHandle,
}

struct Inner<T> {
  in_flight: HashMap<String, InFlight<T>>,
  epochs: HashMap<String, u64>,
  next_ticket: u64,
}

impl<T> Inner<T> {
  fn epoch(&self, key: &str) -> u64 {
    self.epochs.get(key).copied().unwrap_or(0)
  }
}

/// De-duplicates concurrent fetches by key.
pub struct RequestCoordinator<T> {
  inner: Arc<Mutex<Inner<T>>>,
}

impl<T> RequestCoordinator<T>
where
  T: Clone + Send + Sync + 'static,
{
  pub fn new() -> Self {
    Self {
      inner: Arc::new(Mutex::new(Inner {
        in_flight: HashMap::new(),
        epochs: HashMap::new(),
        next_ticket: 0,
      })),
    }
  }

  fn lock(&self) -> MutexGuard<'_, Inner<T>> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Run `operation` for `key`, or join the request already in flight.
  ///
  /// `operation` is only invoked when nothing is pending for the key. A
  /// rejection reaches every joined caller but leaves no trace behind: the
  /// next call after settlement issues a fresh request.
  pub async fn run<F, Fut, E>(&self, key: &str, operation: F) -> SyncResult<T>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: Into<SyncError> + 'static,
  {
    let (ticket, epoch, outcome) = {
      let mut inner = self.lock();
      match inner.in_flight.get(key) {
        Some(flight) => {
          debug!(key, "joining in-flight request");
          (flight.ticket, flight.epoch, flight.outcome.clone())
        }
        None => {
          let ticket = inner.next_ticket;
          inner.next_ticket += 1;
          let epoch = inner.epoch(key);

          let (future, abort) = abortable(operation());
          let outcome = async move {
            match future.await {
              Ok(result) => result.map_err(Into::into),
              Err(Aborted) => Err(SyncError::Cancelled),
            }
          }
          .boxed()
          .shared();

          debug!(key, ticket, epoch, "issuing request");
          inner.in_flight.insert(
            key.to_string(),
            InFlight {
              ticket,
              epoch,
              outcome: outcome.clone(),
              abort,
            },
          );
          (ticket, epoch, outcome)
        }
      }
    };

    let result = outcome.await;

    let mut inner = self.lock();
    if inner
      .in_flight
      .get(key)
      .is_some_and(|flight| flight.ticket == ticket)
    {
      inner.in_flight.remove(key);
    }
    if inner.epoch(key) != epoch {
      debug!(key, ticket, "discarding result of cancelled request");
      return Err(SyncError::Cancelled);
    }
    result
  }

  /// Whether a request for `key` is currently pending.
  pub fn is_in_flight(&self, key: &str) -> bool {
    self.lock().in_flight.contains_key(key)
  }

  /// Current epoch of `key`. Increases every time the key is cancelled.
  pub fn epoch(&self, key: &str) -> u64 {
    self.lock().epoch(key)
  }

  /// Cancel whatever is pending for every key.
  pub fn cancel_all(&self) {
    let keys: Vec<String> = self.lock().in_flight.keys().cloned().collect();
    for key in keys {
      self.cancel(&key);
    }
  }
}

impl<T> Cancel for RequestCoordinator<T>
where
  T: Clone + Send + Sync + 'static,
{
  fn cancel(&self, key: &str) {
    let mut inner = self.lock();
    *inner.epochs.entry(key.to_string()).or_insert(0) += 1;
    if let Some(flight) = inner.in_flight.remove(key) {
      debug!(key, ticket = flight.ticket, "cancelling in-flight request");
      flight.abort.abort();
    }
  }
}

impl<T> Clone for RequestCoordinator<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T> Default for RequestCoordinator<T>
where
  T: Clone + Send + Sync + 'static,
{
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::{eyre, Report};
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::time::Duration;

  async fn wait_until_in_flight<T: Clone + Send + Sync + 'static>(
    coordinator: &RequestCoordinator<T>,
    key: &str,
  ) {
    while !coordinator.is_in_flight(key) {
      tokio::task::yield_now().await;
    }
  }

  #[tokio::test]
  async fn test_concurrent_runs_invoke_operation_once() {
    let coordinator = RequestCoordinator::<u32>::new();
    let calls = Arc::new(AtomicU32::new(0));

    let op = |calls: Arc<AtomicU32>| {
      move || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok::<_, Report>(7)
      }
    };

    let (a, b) = tokio::join!(
      coordinator.run("jobs", op(calls.clone())),
      coordinator.run("jobs", op(calls.clone())),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.unwrap(), 7);
    assert_eq!(b.unwrap(), 7);
    assert!(!coordinator.is_in_flight("jobs"));
  }

  #[tokio::test]
  async fn test_different_keys_do_not_join() {
    let coordinator = RequestCoordinator::<&'static str>::new();
    let (a, b) = tokio::join!(
      coordinator.run("a", || async { Ok::<_, Report>("a") }),
      coordinator.run("b", || async { Ok::<_, Report>("b") }),
    );
    assert_eq!(a.unwrap(), "a");
    assert_eq!(b.unwrap(), "b");
  }

  #[tokio::test]
  async fn test_rejection_reaches_all_callers_without_poisoning() {
    let coordinator = RequestCoordinator::<u32>::new();

    let failing = || async {
      tokio::time::sleep(Duration::from_millis(10)).await;
      Err::<u32, _>(eyre!("backend down"))
    };
    let (a, b) = tokio::join!(
      coordinator.run("stats", failing),
      coordinator.run("stats", failing),
    );
    assert_eq!(a.unwrap_err().to_string(), "backend down");
    assert_eq!(b.unwrap_err().to_string(), "backend down");

    let retry = coordinator
      .run("stats", || async { Ok::<_, Report>(1) })
      .await;
    assert_eq!(retry.unwrap(), 1);
  }

  #[tokio::test]
  async fn test_cancel_settles_joined_callers_as_cancelled() {
    let coordinator = RequestCoordinator::<u32>::new();
    let pending = coordinator.clone();
    let task = tokio::spawn(async move {
      pending
        .run("jobs", || async {
          tokio::time::sleep(Duration::from_secs(60)).await;
          Ok::<_, Report>(1)
        })
        .await
    });

    wait_until_in_flight(&coordinator, "jobs").await;
    coordinator.cancel("jobs");

    let outcome = task.await.unwrap();
    assert!(outcome.unwrap_err().is_cancelled());
    assert!(!coordinator.is_in_flight("jobs"));
    assert_eq!(coordinator.epoch("jobs"), 1);
  }

  #[tokio::test]
  async fn test_run_after_cancel_starts_fresh() {
    let coordinator = RequestCoordinator::<u32>::new();
    let calls = Arc::new(AtomicU32::new(0));

    let pending = coordinator.clone();
    let first_calls = calls.clone();
    let task = tokio::spawn(async move {
      pending
        .run("items", move || async move {
          first_calls.fetch_add(1, Ordering::SeqCst);
          tokio::time::sleep(Duration::from_secs(60)).await;
          Ok::<_, Report>(1)
        })
        .await
    });
    wait_until_in_flight(&coordinator, "items").await;
    coordinator.cancel("items");

    let second_calls = calls.clone();
    let fresh = coordinator
      .run("items", move || async move {
        second_calls.fetch_add(1, Ordering::SeqCst);
        Ok::<_, Report>(2)
      })
      .await;

    assert_eq!(fresh.unwrap(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(task.await.unwrap().unwrap_err().is_cancelled());
  }

  #[tokio::test]
  async fn test_cancel_all_clears_every_key() {
    let coordinator = RequestCoordinator::<u32>::new();
    let mut tasks = Vec::new();
    for key in ["a", "b"] {
      let pending = coordinator.clone();
      tasks.push(tokio::spawn(async move {
        pending
          .run(key, || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, Report>(0)
          })
          .await
      }));
      wait_until_in_flight(&coordinator, key).await;
    }

    coordinator.cancel_all();

    for task in tasks {
      assert!(task.await.unwrap().unwrap_err().is_cancelled());
    }
  }
}
