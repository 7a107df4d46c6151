//! Cursor-based list loading with filter-driven resets.
//!
//! A [`PageState`] is only meaningful for the exact filters that produced
//! its cursor. Changing filters (by value, not identity) throws the items and
//! cursor away and loads from the start. "Load more" appends pages in server
//! order; nothing is reordered or de-duplicated here.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use crate::coordinator::RequestCoordinator;
use crate::error::{SyncError, SyncResult};

/// Opaque server-issued position in a result set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor(pub String);

impl Cursor {
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

/// One page as returned by a [`PageSource`].
#[derive(Debug, Clone)]
pub struct Page<I> {
  pub items: Vec<I>,
  pub next_cursor: Option<Cursor>,
  pub has_more: bool,
}

/// A paginated remote collection.
pub trait PageSource: Send + Sync + 'static {
  type Item: Clone + Send + Sync + 'static;
  type Filters: Clone + PartialEq + Serialize + Debug + Send + Sync + 'static;

  /// Short label used in request keys and logs (e.g. "jobs").
  fn name(&self) -> &'static str;

  fn fetch_page(
    &self,
    filters: &Self::Filters,
    cursor: Option<&Cursor>,
    limit: usize,
  ) -> BoxFuture<'static, SyncResult<Page<Self::Item>>>;
}

/// What a list view shows.
#[derive(Debug, Clone, PartialEq)]
pub struct PageState<I, F> {
  pub items: Vec<I>,
  pub cursor: Option<Cursor>,
  pub has_more: bool,
  pub filters: F,
}

impl<I, F> PageState<I, F> {
  /// Nothing loaded yet for `filters`.
  pub fn empty(filters: F) -> Self {
    Self {
      items: Vec::new(),
      cursor: None,
      has_more: false,
      filters,
    }
  }

  pub fn can_load_more(&self) -> bool {
    self.has_more && self.cursor.is_some()
  }
}

/// Loads first and subsequent pages for one list view.
pub struct PaginationCursorManager<S: PageSource> {
  source: Arc<S>,
  coordinator: RequestCoordinator<Page<S::Item>>,
  page_size: usize,
  /// Fingerprint of the filters the view currently shows.
  active: Mutex<Option<String>>,
}

impl<S: PageSource> PaginationCursorManager<S> {
  pub fn new(source: S, page_size: usize) -> Self {
    Self {
      source: Arc::new(source),
      coordinator: RequestCoordinator::new(),
      page_size,
      active: Mutex::new(None),
    }
  }

  fn active(&self) -> MutexGuard<'_, Option<String>> {
    self.active.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn page_size(&self) -> usize {
    self.page_size
  }

  /// Make `filters` the active ones and return the cleared state for them.
  ///
  /// Requests still pending for other filters are cancelled; their results
  /// will never be applied.
  pub fn reset_for(&self, filters: S::Filters) -> PageState<S::Item, S::Filters> {
    let fingerprint = fingerprint(&filters);
    let mut active = self.active();
    if active.as_deref() != Some(fingerprint.as_str()) {
      if active.is_some() {
        info!(source = self.source.name(), ?filters, "filters changed; resetting list");
      }
      self.coordinator.cancel_all();
      *active = Some(fingerprint);
    }
    PageState::empty(filters)
  }

  /// Load the first page for `filters`.
  pub async fn load_first_page(
    &self,
    filters: S::Filters,
  ) -> SyncResult<PageState<S::Item, S::Filters>> {
    let state = self.reset_for(filters);
    let page = self.fetch(&state.filters, None).await?;
    debug!(
      source = self.source.name(),
      count = page.items.len(),
      has_more = page.has_more,
      "loaded first page"
    );
    Ok(PageState {
      items: page.items,
      cursor: page.next_cursor,
      has_more: page.has_more,
      filters: state.filters,
    })
  }

  /// Append the next page to `current`.
  ///
  /// Returns `current` unchanged when there is no cursor, the server said
  /// there is nothing more, or the same page is already being loaded. On
  /// failure `current` is untouched, so the caller can simply retry.
  pub async fn load_next_page(
    &self,
    current: &PageState<S::Item, S::Filters>,
  ) -> SyncResult<PageState<S::Item, S::Filters>> {
    let Some(cursor) = current.cursor.as_ref().filter(|_| current.has_more) else {
      return Ok(current.clone());
    };

    let key = self.request_key(&fingerprint(&current.filters), Some(cursor));
    if self.coordinator.is_in_flight(&key) {
      debug!(source = self.source.name(), cursor = cursor.as_str(), "page already loading");
      return Ok(current.clone());
    }

    let page = self.fetch(&current.filters, Some(cursor)).await?;
    debug!(
      source = self.source.name(),
      count = page.items.len(),
      has_more = page.has_more,
      "appended page"
    );

    let mut next = current.clone();
    next.items.extend(page.items);
    next.cursor = page.next_cursor;
    next.has_more = page.has_more;
    Ok(next)
  }

  /// Reload from the start when `filters` differ (by value) from `current`'s.
  pub async fn apply_filters(
    &self,
    current: &PageState<S::Item, S::Filters>,
    filters: S::Filters,
  ) -> SyncResult<PageState<S::Item, S::Filters>> {
    if current.filters == filters {
      return Ok(current.clone());
    }
    self.load_first_page(filters).await
  }

  /// Forget the active filters and cancel everything pending (view exit).
  pub fn reset(&self) {
    self.coordinator.cancel_all();
    *self.active() = None;
  }

  fn request_key(&self, fingerprint: &str, cursor: Option<&Cursor>) -> String {
    format!(
      "{}:{}:{}",
      self.source.name(),
      fingerprint,
      cursor.map(Cursor::as_str).unwrap_or("start")
    )
  }

  async fn fetch(
    &self,
    filters: &S::Filters,
    cursor: Option<&Cursor>,
  ) -> SyncResult<Page<S::Item>> {
    let fingerprint = fingerprint(filters);
    let key = self.request_key(&fingerprint, cursor);

    let source = Arc::clone(&self.source);
    let owned_filters = filters.clone();
    let owned_cursor = cursor.cloned();
    let limit = self.page_size;
    let page = self
      .coordinator
      .run(&key, move || {
        source.fetch_page(&owned_filters, owned_cursor.as_ref(), limit)
      })
      .await?;

    // Filters changed while the page was in flight
    if self.active().as_deref() != Some(fingerprint.as_str()) {
      debug!(key, "dropping page for superseded filters");
      return Err(SyncError::Cancelled);
    }
    Ok(page)
  }
}

/// Stable digest of a filter set, equal for equal values.
fn fingerprint<F: Serialize + Debug>(filters: &F) -> String {
  let input = serde_json::to_string(filters).unwrap_or_else(|_| format!("{:?}", filters));
  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::eyre;
  use futures::FutureExt;
  use std::sync::atomic::{AtomicBool, Ordering};
  use tokio::sync::Notify;

  #[derive(Debug, Clone, PartialEq, Serialize)]
  struct Filters {
    status: String,
    name: Option<String>,
  }

  fn filters(status: &str) -> Filters {
    Filters {
      status: status.to_string(),
      name: None,
    }
  }

  /// Serves `items` in offset order, `limit` at a time.
  #[derive(Clone)]
  struct FakeSource {
    items: Vec<u32>,
    calls: Arc<Mutex<Vec<(Filters, Option<Cursor>)>>>,
    fail: Arc<AtomicBool>,
    /// While set, fetches wait for `gate` before answering.
    gated: Arc<AtomicBool>,
    gate: Arc<Notify>,
  }

  impl FakeSource {
    fn new(count: u32) -> Self {
      Self {
        items: (1..=count).collect(),
        calls: Arc::new(Mutex::new(Vec::new())),
        fail: Arc::new(AtomicBool::new(false)),
        gated: Arc::new(AtomicBool::new(false)),
        gate: Arc::new(Notify::new()),
      }
    }

    fn calls(&self) -> Vec<(Filters, Option<Cursor>)> {
      self.calls.lock().unwrap().clone()
    }
  }

  impl PageSource for FakeSource {
    type Item = u32;
    type Filters = Filters;

    fn name(&self) -> &'static str {
      "fake"
    }

    fn fetch_page(
      &self,
      filters: &Filters,
      cursor: Option<&Cursor>,
      limit: usize,
    ) -> BoxFuture<'static, SyncResult<Page<u32>>> {
      self
        .calls
        .lock()
        .unwrap()
        .push((filters.clone(), cursor.cloned()));
      let offset: usize = cursor.map(|c| c.0.parse().unwrap()).unwrap_or(0);
      let items: Vec<u32> = self.items.iter().skip(offset).take(limit).copied().collect();
      let end = offset + items.len();
      let has_more = end < self.items.len();
      let fail = self.fail.load(Ordering::SeqCst);
      let gate = self.gated.load(Ordering::SeqCst).then(|| self.gate.clone());
      async move {
        if let Some(gate) = gate {
          gate.notified().await;
        }
        if fail {
          return Err(SyncError::from(eyre!("connection reset")));
        }
        Ok(Page {
          items,
          next_cursor: has_more.then(|| Cursor(end.to_string())),
          has_more,
        })
      }
      .boxed()
    }
  }

  #[tokio::test]
  async fn test_load_more_appends_in_server_order() {
    let source = FakeSource::new(5);
    let manager = PaginationCursorManager::new(source.clone(), 2);

    let first = manager.load_first_page(filters("drafted")).await.unwrap();
    assert_eq!(first.items, vec![1, 2]);
    assert_eq!(first.cursor, Some(Cursor("2".into())));

    let second = manager.load_next_page(&first).await.unwrap();
    assert_eq!(second.items, vec![1, 2, 3, 4]);

    let third = manager.load_next_page(&second).await.unwrap();
    assert_eq!(third.items, vec![1, 2, 3, 4, 5]);
    assert!(!third.has_more);
    assert_eq!(third.cursor, None);

    // End of list: no request, state unchanged
    let fourth = manager.load_next_page(&third).await.unwrap();
    assert_eq!(fourth, third);
    assert_eq!(source.calls().len(), 3);
  }

  #[tokio::test]
  async fn test_filter_change_restarts_from_null_cursor() {
    let source = FakeSource::new(6);
    let manager = PaginationCursorManager::new(source.clone(), 2);

    let first = manager.load_first_page(filters("drafted")).await.unwrap();
    let more = manager.load_next_page(&first).await.unwrap();
    assert_eq!(more.items.len(), 4);

    let changed = manager
      .apply_filters(&more, filters("published"))
      .await
      .unwrap();
    assert_eq!(changed.items, vec![1, 2]);
    assert_eq!(changed.filters, filters("published"));

    let calls = source.calls();
    let (last_filters, last_cursor) = calls.last().unwrap();
    assert_eq!(last_filters, &filters("published"));
    assert_eq!(last_cursor, &None);
  }

  #[tokio::test]
  async fn test_equal_filters_do_not_refetch() {
    let source = FakeSource::new(4);
    let manager = PaginationCursorManager::new(source.clone(), 2);

    let first = manager.load_first_page(filters("drafted")).await.unwrap();
    let same = manager
      .apply_filters(&first, filters("drafted"))
      .await
      .unwrap();
    assert_eq!(same, first);
    assert_eq!(source.calls().len(), 1);
  }

  #[tokio::test]
  async fn test_reset_for_clears_items() {
    let manager = PaginationCursorManager::new(FakeSource::new(4), 2);
    let cleared = manager.reset_for(filters("failed"));
    assert!(cleared.items.is_empty());
    assert_eq!(cleared.cursor, None);
    assert!(!cleared.can_load_more());
  }

  #[tokio::test]
  async fn test_failed_next_page_leaves_state_for_retry() {
    let source = FakeSource::new(4);
    let manager = PaginationCursorManager::new(source.clone(), 2);
    let first = manager.load_first_page(filters("drafted")).await.unwrap();

    source.fail.store(true, Ordering::SeqCst);
    let err = manager.load_next_page(&first).await.unwrap_err();
    assert_eq!(err.to_string(), "connection reset");
    assert_eq!(first.items, vec![1, 2]);

    source.fail.store(false, Ordering::SeqCst);
    let retried = manager.load_next_page(&first).await.unwrap();
    assert_eq!(retried.items, vec![1, 2, 3, 4]);
  }

  #[tokio::test]
  async fn test_next_page_is_noop_while_same_page_loads() {
    let source = FakeSource::new(4);
    let manager = Arc::new(PaginationCursorManager::new(source.clone(), 2));
    let first = manager.load_first_page(filters("drafted")).await.unwrap();

    source.gated.store(true, Ordering::SeqCst);
    let pending = manager.clone();
    let pending_state = first.clone();
    let task = tokio::spawn(async move { pending.load_next_page(&pending_state).await });
    let key = manager.request_key(&fingerprint(&first.filters), first.cursor.as_ref());
    while !manager.coordinator.is_in_flight(&key) {
      tokio::task::yield_now().await;
    }

    let unchanged = manager.load_next_page(&first).await.unwrap();
    assert_eq!(unchanged, first);

    source.gate.notify_one();
    let appended = task.await.unwrap().unwrap();
    assert_eq!(appended.items, vec![1, 2, 3, 4]);
    assert_eq!(source.calls().len(), 2);
  }

  #[tokio::test]
  async fn test_page_for_superseded_filters_is_discarded() {
    let source = FakeSource::new(4);
    source.gated.store(true, Ordering::SeqCst);
    let manager = Arc::new(PaginationCursorManager::new(source.clone(), 2));

    let pending = manager.clone();
    let task = tokio::spawn(async move { pending.load_first_page(filters("drafted")).await });
    let key = manager.request_key(&fingerprint(&filters("drafted")), None);
    while !manager.coordinator.is_in_flight(&key) {
      tokio::task::yield_now().await;
    }

    manager.reset_for(filters("published"));
    source.gate.notify_one();

    assert!(task.await.unwrap().unwrap_err().is_cancelled());
  }

  #[tokio::test]
  async fn test_reset_cancels_pending_page() {
    let source = FakeSource::new(4);
    source.gated.store(true, Ordering::SeqCst);
    let manager = Arc::new(PaginationCursorManager::new(source.clone(), 2));
    assert_eq!(manager.page_size(), 2);

    let pending = manager.clone();
    let task = tokio::spawn(async move { pending.load_first_page(filters("drafted")).await });
    let key = manager.request_key(&fingerprint(&filters("drafted")), None);
    while !manager.coordinator.is_in_flight(&key) {
      tokio::task::yield_now().await;
    }

    manager.reset();
    assert!(!manager.coordinator.is_in_flight(&key));
    assert!(task.await.unwrap().unwrap_err().is_cancelled());

    // Same filters load normally afterwards
    source.gated.store(false, Ordering::SeqCst);
    let reloaded = manager.load_first_page(filters("drafted")).await.unwrap();
    assert_eq!(reloaded.items, vec![1, 2]);
  }

  #[test]
  fn test_fingerprint_is_value_based() {
    let a = filters("drafted");
    let b = a.clone();
    assert_eq!(fingerprint(&a), fingerprint(&b));

    let mut c = a.clone();
    c.name = Some("scout".into());
    assert_ne!(fingerprint(&a), fingerprint(&c));
  }
}
