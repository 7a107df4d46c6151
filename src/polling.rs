//! Adaptive-interval polling tied to a handle's lifetime.
//!
//! Each [`PollHandle`] owns exactly one poll loop. The loop is a small state
//! machine: `Polling` while the poller runs, `Scheduled` while it waits for
//! the next round, `Idle` once stopped. The wait after a poll is computed
//! from that poll's own result, so the cadence follows current activity.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::coordinator::Cancel;
use crate::error::SyncResult;

/// Where a poll loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
  Idle,
  Polling,
  Scheduled { delay: Duration },
}

/// Chooses the wait before the next poll.
pub trait IntervalPolicy<T>: Send + Sync + 'static {
  /// Delay after a successful poll that returned `payload`.
  fn delay_for(&self, payload: &T) -> Duration;

  /// Delay after a failed poll.
  fn delay_after_failure(&self) -> Duration;
}

/// Payloads that can report whether work is still in progress.
pub trait Activity {
  fn is_active(&self) -> bool;
}

/// Short delay while anything is active, long delay otherwise.
#[derive(Debug, Clone, Copy)]
pub struct ActivityPolicy {
  pub active: Duration,
  pub idle: Duration,
}

impl<T: Activity> IntervalPolicy<T> for ActivityPolicy {
  fn delay_for(&self, payload: &T) -> Duration {
    if payload.is_active() {
      self.active
    } else {
      self.idle
    }
  }

  fn delay_after_failure(&self) -> Duration {
    self.idle
  }
}

/// Same delay every time.
#[derive(Debug, Clone, Copy)]
pub struct FixedInterval(pub Duration);

impl<T> IntervalPolicy<T> for FixedInterval {
  fn delay_for(&self, _payload: &T) -> Duration {
    self.0
  }

  fn delay_after_failure(&self) -> Duration {
    self.0
  }
}

/// Starts poll loops whose in-flight requests are cancelled through
/// `canceller` when they stop.
pub struct PollingScheduler {
  canceller: Arc<dyn Cancel>,
}

impl PollingScheduler {
  pub fn new(canceller: Arc<dyn Cancel>) -> Self {
    Self { canceller }
  }

  /// Poll immediately, then keep polling with delays from `policy`.
  ///
  /// `poller` should route its request through the coordinator under `key`
  /// so stopping the handle can cancel it. Results (other than
  /// cancellations) are delivered through the handle.
  pub fn start<T, P, F, Fut>(&self, key: &str, policy: P, poller: F) -> PollHandle<T>
  where
    T: Send + 'static,
    P: IntervalPolicy<T>,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = SyncResult<T>> + Send + 'static,
  {
    let stopped = Arc::new(Mutex::new(false));
    let (phase_tx, phase_rx) = watch::channel(PollPhase::Idle);
    let (updates_tx, updates_rx) = mpsc::unbounded_channel();

    debug!(key, "starting poll loop");
    let task = tokio::spawn(poll_loop(
      key.to_string(),
      policy,
      poller,
      stopped.clone(),
      phase_tx,
      updates_tx,
    ));

    PollHandle {
      key: key.to_string(),
      stopped,
      phase: phase_rx,
      updates: updates_rx,
      task,
      canceller: self.canceller.clone(),
    }
  }

  /// Stop `handle`'s loop. Same as dropping it.
  pub fn stop<T>(&self, handle: PollHandle<T>) {
    handle.stop();
  }
}

fn lock(stopped: &Mutex<bool>) -> MutexGuard<'_, bool> {
  stopped.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn poll_loop<T, P, F, Fut>(
  key: String,
  policy: P,
  mut poller: F,
  stopped: Arc<Mutex<bool>>,
  phase: watch::Sender<PollPhase>,
  updates: mpsc::UnboundedSender<SyncResult<T>>,
) where
  P: IntervalPolicy<T>,
  F: FnMut() -> Fut,
  Fut: Future<Output = SyncResult<T>>,
{
  loop {
    // Invoking under the lock means no poll can start once stop() returns
    let poll = {
      let stopped = lock(&stopped);
      if *stopped {
        break;
      }
      phase.send_replace(PollPhase::Polling);
      poller()
    };

    let outcome = poll.await;

    let delay = {
      let stopped = lock(&stopped);
      if *stopped {
        debug!(key, "discarding poll result after stop");
        break;
      }
      let delay = match &outcome {
        Ok(payload) => policy.delay_for(payload),
        Err(_) => policy.delay_after_failure(),
      };
      match outcome {
        Err(err) if err.is_cancelled() => {}
        outcome => {
          let _ = updates.send(outcome);
        }
      }
      phase.send_replace(PollPhase::Scheduled { delay });
      delay
    };

    debug!(key, delay_ms = delay.as_millis() as u64, "next poll scheduled");
    tokio::time::sleep(delay).await;
  }
  phase.send_replace(PollPhase::Idle);
}

/// Live poll loop. Dropping the handle stops the loop.
pub struct PollHandle<T> {
  key: String,
  stopped: Arc<Mutex<bool>>,
  phase: watch::Receiver<PollPhase>,
  updates: mpsc::UnboundedReceiver<SyncResult<T>>,
  task: JoinHandle<()>,
  canceller: Arc<dyn Cancel>,
}

impl<T> PollHandle<T> {
  pub fn key(&self) -> &str {
    &self.key
  }

  pub fn is_stopped(&self) -> bool {
    *lock(&self.stopped)
  }

  pub fn phase(&self) -> PollPhase {
    if self.is_stopped() {
      PollPhase::Idle
    } else {
      *self.phase.borrow()
    }
  }

  /// Wait for the next poll result. `None` once the loop is gone.
  pub async fn next(&mut self) -> Option<SyncResult<T>> {
    self.updates.recv().await
  }

  /// Cancel the timer and any request the loop has in flight.
  ///
  /// After this returns the poller is never invoked again, and a result that
  /// is still on its way is dropped.
  pub fn stop(&self) {
    {
      let mut stopped = lock(&self.stopped);
      if *stopped {
        return;
      }
      *stopped = true;
    }
    self.canceller.cancel(&self.key);
    self.task.abort();
    debug!(key = %self.key, "poll loop stopped");
  }
}

impl<T> Drop for PollHandle<T> {
  fn drop(&mut self) {
    self.stop();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::types::{JobRecord, JobStatus, JobsSnapshot};
  use crate::cache::{CacheOptions, CacheStore, MemoryStorage};
  use crate::coordinator::RequestCoordinator;
  use crate::error::SyncError;
  use color_eyre::eyre::eyre;
  use std::collections::{BTreeMap, VecDeque};
  use std::sync::atomic::{AtomicU32, Ordering};
  use tokio::sync::Notify;

  const ACTIVE: Duration = Duration::from_millis(3000);
  const IDLE: Duration = Duration::from_millis(15000);

  fn policy() -> ActivityPolicy {
    ActivityPolicy {
      active: ACTIVE,
      idle: IDLE,
    }
  }

  fn job(id: &str, status: JobStatus) -> JobRecord {
    JobRecord {
      id: id.to_string(),
      name: "scout".to_string(),
      status,
      started_at: None,
      completed_at: None,
      result: None,
      error: None,
    }
  }

  fn snapshot(statuses: &[JobStatus]) -> JobsSnapshot {
    let jobs: BTreeMap<String, JobRecord> = statuses
      .iter()
      .enumerate()
      .map(|(i, status)| (i.to_string(), job(&i.to_string(), *status)))
      .collect();
    JobsSnapshot {
      total: jobs.len() as u64,
      jobs,
      has_more: false,
    }
  }

  fn scheduler() -> PollingScheduler {
    PollingScheduler::new(Arc::new(RequestCoordinator::<u32>::new()))
  }

  #[tokio::test(start_paused = true)]
  async fn test_polls_immediately_then_waits_policy_delay() {
    let calls = Arc::new(AtomicU32::new(0));
    let counted = calls.clone();
    let mut handle = scheduler().start("jobs", policy(), move || {
      counted.fetch_add(1, Ordering::SeqCst);
      async { Ok(snapshot(&[JobStatus::Completed])) }
    });

    assert!(handle.next().await.unwrap().is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(handle.phase(), PollPhase::Scheduled { delay: IDLE });

    // Nothing happens before the delay elapses
    tokio::time::sleep(IDLE - Duration::from_millis(1)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    handle.next().await.unwrap().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_next_delay_tracks_latest_result() {
    let rounds = Arc::new(Mutex::new(VecDeque::from(vec![
      snapshot(&[JobStatus::Completed, JobStatus::Failed]),
      snapshot(&[JobStatus::Completed, JobStatus::Running]),
      snapshot(&[JobStatus::Completed, JobStatus::Completed]),
    ])));
    let mut handle = scheduler().start("jobs", policy(), move || {
      let next = rounds.lock().unwrap().pop_front();
      async move { next.ok_or_else(|| SyncError::from(eyre!("no more rounds"))) }
    });

    handle.next().await.unwrap().unwrap();
    assert_eq!(handle.phase(), PollPhase::Scheduled { delay: IDLE });

    // The poll that sees a running job schedules the fast cadence at once
    handle.next().await.unwrap().unwrap();
    assert_eq!(handle.phase(), PollPhase::Scheduled { delay: ACTIVE });

    handle.next().await.unwrap().unwrap();
    assert_eq!(handle.phase(), PollPhase::Scheduled { delay: IDLE });
  }

  #[tokio::test(start_paused = true)]
  async fn test_failure_is_reported_and_uses_failure_delay() {
    let mut handle = scheduler().start("stats", policy(), || async {
      Err::<JobsSnapshot, _>(SyncError::from(eyre!("backend down")))
    });

    let err = handle.next().await.unwrap().unwrap_err();
    assert_eq!(err.to_string(), "backend down");
    assert_eq!(handle.phase(), PollPhase::Scheduled { delay: IDLE });
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancelled_results_are_not_delivered() {
    let calls = Arc::new(AtomicU32::new(0));
    let counted = calls.clone();
    let mut handle = scheduler().start("jobs", FixedInterval(ACTIVE), move || {
      let n = counted.fetch_add(1, Ordering::SeqCst);
      async move {
        if n == 0 {
          Err(SyncError::Cancelled)
        } else {
          Ok(n)
        }
      }
    });

    assert_eq!(handle.next().await.unwrap().unwrap(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stop_prevents_further_polls() {
    let calls = Arc::new(AtomicU32::new(0));
    let counted = calls.clone();
    let scheduler = scheduler();
    let mut handle = scheduler.start("logs", FixedInterval(ACTIVE), move || {
      counted.fetch_add(1, Ordering::SeqCst);
      async { Ok(()) }
    });

    handle.next().await.unwrap().unwrap();
    scheduler.stop(handle);

    tokio::time::sleep(ACTIVE * 10).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_drop_stops_loop() {
    let calls = Arc::new(AtomicU32::new(0));
    let counted = calls.clone();
    let handle = scheduler().start("logs", FixedInterval(ACTIVE), move || {
      counted.fetch_add(1, Ordering::SeqCst);
      async { Ok(()) }
    });
    while calls.load(Ordering::SeqCst) == 0 {
      tokio::task::yield_now().await;
    }
    drop(handle);

    tokio::time::sleep(ACTIVE * 10).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stop_mid_flight_leaves_cache_untouched() {
    let store = CacheStore::<JobsSnapshot>::new(
      Arc::new(MemoryStorage::new()),
      CacheOptions::default(),
    );
    let scheduler = PollingScheduler::new(Arc::new(store.clone()));
    let gate = Arc::new(Notify::new());
    let calls = Arc::new(AtomicU32::new(0));

    let poll_store = store.clone();
    let poll_gate = gate.clone();
    let counted = calls.clone();
    let handle = scheduler.start("jobs", policy(), move || {
      counted.fetch_add(1, Ordering::SeqCst);
      let store = poll_store.clone();
      let gate = poll_gate.clone();
      async move {
        store
          .refresh("jobs", chrono::Duration::seconds(30), move || async move {
            gate.notified().await;
            Ok::<_, SyncError>(snapshot(&[JobStatus::Running]))
          })
          .await
      }
    });

    while calls.load(Ordering::SeqCst) == 0 {
      tokio::task::yield_now().await;
    }
    for _ in 0..10 {
      tokio::task::yield_now().await;
    }
    assert_eq!(handle.phase(), PollPhase::Polling);

    scheduler.stop(handle);
    gate.notify_waiters();
    tokio::time::sleep(IDLE * 2).await;

    assert!(store.peek("jobs").is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }
}
