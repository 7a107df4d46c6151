//! Command runners. Each wires the sync layer for one console view.

use chrono::{Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::api::types::{
  DashboardSnapshot, ItemFilters, ItemRecord, JobFilters, JobRecord, JobStatus, JobsSnapshot,
  LogEntry, LogFilters, LogsSnapshot, Trigger, WriteAck,
};
use crate::api::{ConsoleClient, ItemsSource, JobsSource};
use crate::cache::{
  CacheEventKind, CacheStore, Cacheable, KvStorage, NoopStorage, ReadResult, SqliteStorage,
};
use crate::config::Config;
use crate::error::{SyncError, SyncResult};
use crate::metrics::{derive_cost_trend, derive_distribution, virality_bucket, ViralityBucket};
use crate::pagination::{PageSource, PageState, PaginationCursorManager};
use crate::polling::{FixedInterval, PollHandle, PollingScheduler};

/// Items pulled for the dashboard's derived metrics.
const METRICS_ITEM_LIMIT: usize = 100;
/// Jobs requested per poll of the jobs view.
const JOBS_POLL_LIMIT: usize = 100;

const DASHBOARD_KEY: &str = "dashboard";
const METRICS_ITEMS_KEY: &str = "items:recent";

/// Operator decisions on a single content item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemAction {
  Approve,
  Reject,
  Delete,
}

pub struct App {
  config: Config,
  client: ConsoleClient,
  storage: Arc<dyn KvStorage>,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let client = ConsoleClient::new(&config)?;
    let storage = open_storage(&config);
    Ok(Self {
      config,
      client,
      storage,
    })
  }

  fn store<T: Cacheable>(&self) -> CacheStore<T> {
    CacheStore::new(self.storage.clone(), self.config.cache.options())
  }

  fn ttl(&self) -> chrono::Duration {
    self.config.cache.ttl()
  }

  /// List jobs a page at a time, or follow them with adaptive polling.
  pub async fn jobs(&self, filters: JobFilters, pages: usize, watch: bool) -> Result<()> {
    if watch {
      return self.watch_jobs(filters).await;
    }

    let manager = PaginationCursorManager::new(
      JobsSource::new(self.client.clone()),
      self.config.pagination.page_size,
    );
    let state = load_pages(&manager, filters, pages).await?;
    for job in &state.items {
      println!("{}", format_job(job));
    }
    print_more_hint(&state, manager.page_size());
    Ok(())
  }

  async fn watch_jobs(&self, filters: JobFilters) -> Result<()> {
    let store: CacheStore<JobsSnapshot> = self.store();
    let key = query_key("jobs", &filters);
    store.init(&[&key]);

    let mut known: BTreeMap<String, JobStatus> = BTreeMap::new();
    let mut truncated = None;
    if let Some(entry) = store.peek(&key) {
      println!(
        "cached {} ({} jobs)",
        describe_age(entry.age(Utc::now())),
        entry.value.jobs.len()
      );
      known = statuses(&entry.value);
    }

    let scheduler = PollingScheduler::new(Arc::new(store.clone()));
    let ttl = self.ttl();
    let client = self.client.clone();
    let poll_key = key.clone();
    let mut handle = scheduler.start(&key, self.config.polling.jobs_policy(), move || {
      let store = store.clone();
      let client = client.clone();
      let filters = filters.clone();
      let key = poll_key.clone();
      async move {
        store
          .refresh(&key, ttl, move || fetch_jobs_snapshot(client, filters))
          .await
      }
    });

    follow(&mut handle, |snapshot| {
      for line in job_transitions(&known, &snapshot) {
        println!("{}", line);
      }
      let note = truncation_note(&snapshot);
      if note != truncated {
        if let Some(note) = &note {
          println!("{}", note);
        }
        truncated = note;
      }
      known = statuses(&snapshot);
    })
    .await
  }

  /// Start a pipeline run, then show the jobs list as the server now sees it.
  pub async fn run(&self, trigger: Trigger) -> Result<()> {
    let ack = self.client.run_trigger(trigger).await.map_err(user_error)?;
    println!("{}", describe_ack(&ack, "started"));
    let dropped = self.invalidate_views(trigger.touches());
    info!(path = trigger.path(), dropped, "trigger accepted");

    if !trigger.touches().contains(&"jobs") {
      return Ok(());
    }
    let store: CacheStore<JobsSnapshot> = self.store();
    let filters = JobFilters::default();
    let key = query_key("jobs", &filters);
    let client = self.client.clone();
    let result = store
      .get(&key, self.ttl(), move || fetch_jobs_snapshot(client, filters))
      .await
      .map_err(user_error)?;
    if let Some(snapshot) = &result.value {
      for job in snapshot.running() {
        println!("{}", format_job(job));
      }
      if let Some(note) = truncation_note(snapshot) {
        println!("{}", note);
      }
    }
    report_staleness(&result);
    Ok(())
  }

  /// Approve, reject or delete one item.
  pub async fn item(&self, action: ItemAction, id: &str) -> Result<()> {
    let ack = match action {
      ItemAction::Approve => self.client.approve_item(id).await,
      ItemAction::Reject => self.client.reject_item(id).await,
      ItemAction::Delete => self.client.delete_item(id).await,
    }
    .map_err(user_error)?;
    println!("{}", describe_ack(&ack, "done"));
    self.invalidate_views(&["items", DASHBOARD_KEY]);
    Ok(())
  }

  /// Delete the server's activity log.
  pub async fn clear_logs(&self) -> Result<()> {
    let ack = self.client.clear_logs().await.map_err(user_error)?;
    println!("{}", describe_ack(&ack, "logs cleared"));
    self.invalidate_views(&["logs", DASHBOARD_KEY]);
    Ok(())
  }

  /// Forget every cached view under `prefixes` so the next read fetches.
  fn invalidate_views(&self, prefixes: &[&str]) -> usize {
    let store: CacheStore<Value> = self.store();
    let dropped: usize = prefixes
      .iter()
      .map(|prefix| store.invalidate_prefix(prefix))
      .sum();
    debug!(?prefixes, dropped, "invalidated cached views");
    dropped
  }

  /// Show one job's status.
  pub async fn job(&self, id: &str) -> Result<()> {
    let store: CacheStore<JobRecord> = self.store();
    let key = format!("job:{}", id);
    let client = self.client.clone();
    let job_id = id.to_string();
    let result = store
      .get(&key, self.ttl(), move || async move { client.get_job(&job_id).await })
      .await
      .map_err(user_error)?;

    if let Some(job) = &result.value {
      println!("{}", format_job(job));
      if let Some(error) = &job.error {
        println!("  error: {}", error);
      }
      if let Some(output) = &job.result {
        println!("  result: {}", output);
      }
    }
    report_staleness(&result);
    Ok(())
  }

  /// Load the first page of items plus `pages - 1` more.
  pub async fn items(&self, filters: ItemFilters, pages: usize) -> Result<()> {
    let manager = PaginationCursorManager::new(
      ItemsSource::new(self.client.clone()),
      self.config.pagination.page_size,
    );
    let state = load_pages(&manager, filters, pages).await?;
    for item in &state.items {
      println!("{}", format_item(item));
    }
    print_more_hint(&state, manager.page_size());
    Ok(())
  }

  /// Stats, health, recent logs and derived metrics.
  pub async fn dashboard(&self, watch: bool) -> Result<()> {
    let dashboard: CacheStore<DashboardSnapshot> = self.store();
    let items: CacheStore<Vec<ItemRecord>> = self.store();
    dashboard.init(&[DASHBOARD_KEY]);
    items.init(&[METRICS_ITEMS_KEY]);

    let client = self.client.clone();
    let result = dashboard
      .get(DASHBOARD_KEY, self.ttl(), move || async move {
        client.dashboard_snapshot().await
      })
      .await
      .map_err(user_error)?;
    if let Some(snapshot) = &result.value {
      print_dashboard(snapshot);
    }
    report_staleness(&result);
    match items
      .get(METRICS_ITEMS_KEY, self.ttl(), self.fetch_metric_items())
      .await
    {
      Ok(read) => match read.value {
        Some(records) => print_metrics(&records, self.config.metrics.max_points),
        None => println!("metrics: unavailable"),
      },
      Err(err) => warn!("Failed to load items for metrics: {}", err),
    }

    if !watch {
      return Ok(());
    }

    let mut item_events = items.subscribe();
    let scheduler = PollingScheduler::new(Arc::new(dashboard.clone()));
    let ttl = self.ttl();
    let client = self.client.clone();
    let mut handle = scheduler.start(
      DASHBOARD_KEY,
      FixedInterval(self.config.polling.dashboard_interval()),
      move || {
        let store = dashboard.clone();
        let client = client.clone();
        async move {
          store
            .refresh(DASHBOARD_KEY, ttl, move || async move {
              client.dashboard_snapshot().await
            })
            .await
        }
      },
    );

    loop {
      tokio::select! {
        _ = tokio::signal::ctrl_c() => break,
        update = handle.next() => match update {
          None => break,
          Some(Ok(snapshot)) => {
            print_dashboard(&snapshot);
            // Revalidates in the background; the event arm prints the result
            self.print_item_metrics(&items);
          }
          Some(Err(err)) => report_poll_error(&handle, err)?,
        },
        event = item_events.recv() => match event {
          Ok(event) if matches!(event.kind, CacheEventKind::Updated { .. }) => {
            self.print_item_metrics(&items);
          }
          Ok(_) | Err(RecvError::Lagged(_)) => {}
          Err(RecvError::Closed) => break,
        },
      }
    }
    handle.stop();
    items.dispose();
    Ok(())
  }

  /// Print derived metrics from whatever items are cached; revalidate if stale.
  fn print_item_metrics(&self, items: &CacheStore<Vec<ItemRecord>>) {
    let read = items.read(METRICS_ITEMS_KEY, self.ttl(), self.fetch_metric_items());
    match read.value {
      Some(records) => print_metrics(&records, self.config.metrics.max_points),
      None if read.refreshing => println!("metrics: loading..."),
      None => println!("metrics: unavailable"),
    }
  }

  fn fetch_metric_items(
    &self,
  ) -> impl FnOnce() -> BoxFuture<'static, SyncResult<Vec<ItemRecord>>> + Send + 'static {
    let client = self.client.clone();
    move || {
      async move {
        client
          .get_items(&ItemFilters::default(), METRICS_ITEM_LIMIT, 0)
          .await
          .map(|response| response.items)
      }
      .boxed()
    }
  }

  /// Filtered logs with a per-level summary.
  pub async fn logs(&self, filters: LogFilters, watch: bool) -> Result<()> {
    let store: CacheStore<LogsSnapshot> = self.store();
    let key = query_key("logs", &filters);
    store.init(&[&key]);

    let client = self.client.clone();
    let fetch_filters = filters.clone();
    let result = store
      .get(&key, self.ttl(), move || async move {
        client.logs_snapshot(&fetch_filters).await
      })
      .await
      .map_err(user_error)?;
    if let Some(snapshot) = &result.value {
      print_logs(snapshot);
    }
    report_staleness(&result);

    if !watch {
      return Ok(());
    }

    let scheduler = PollingScheduler::new(Arc::new(store.clone()));
    let ttl = self.ttl();
    let client = self.client.clone();
    let poll_key = key.clone();
    let mut handle = scheduler.start(
      &key,
      FixedInterval(self.config.polling.logs_interval()),
      move || {
        let store = store.clone();
        let client = client.clone();
        let filters = filters.clone();
        let key = poll_key.clone();
        async move {
          store
            .refresh(&key, ttl, move || async move {
              client.logs_snapshot(&filters).await
            })
            .await
        }
      },
    );

    follow(&mut handle, |snapshot| print_logs(&snapshot)).await
  }

  /// Drop a cached key from memory and disk.
  pub fn clear_cache(&self, key: &str) {
    let store: CacheStore<Value> = self.store();
    store.invalidate(key);
    println!("cleared {}", store.storage_key(key));
  }
}

fn open_storage(config: &Config) -> Arc<dyn KvStorage> {
  if !config.cache.enabled {
    return Arc::new(NoopStorage);
  }
  match SqliteStorage::open(config.cache.resolved_path().as_deref()) {
    Ok(storage) => Arc::new(storage),
    Err(e) => {
      warn!("Persistent cache unavailable, continuing in memory: {}", e);
      Arc::new(NoopStorage)
    }
  }
}

/// Cache key for a filtered query: `prefix` plus the filters that are set.
fn query_key<F: Serialize>(prefix: &str, filters: &F) -> String {
  let parts: Vec<String> = match serde_json::to_value(filters) {
    Ok(Value::Object(map)) => map
      .into_iter()
      .filter(|(_, v)| !v.is_null())
      .map(|(k, v)| match v {
        Value::String(s) => format!("{}={}", k, s),
        other => format!("{}={}", k, other),
      })
      .collect(),
    _ => Vec::new(),
  };
  if parts.is_empty() {
    prefix.to_string()
  } else {
    format!("{}:{}", prefix, parts.join(","))
  }
}

/// Load up to `pages` pages. Ctrl-C abandons the list and whatever is loading.
async fn load_pages<S: PageSource>(
  manager: &PaginationCursorManager<S>,
  filters: S::Filters,
  pages: usize,
) -> Result<PageState<S::Item, S::Filters>> {
  let loading = async {
    let mut state = manager.load_first_page(filters).await?;
    for _ in 1..pages.max(1) {
      if !state.can_load_more() {
        break;
      }
      state = manager.load_next_page(&state).await?;
    }
    Ok::<_, SyncError>(state)
  };
  tokio::select! {
    state = loading => state.map_err(user_error),
    _ = tokio::signal::ctrl_c() => {
      manager.reset();
      Err(eyre!("interrupted"))
    }
  }
}

async fn fetch_jobs_snapshot(client: ConsoleClient, filters: JobFilters) -> SyncResult<JobsSnapshot> {
  client
    .get_jobs(&filters, JOBS_POLL_LIMIT, None)
    .await
    .map(JobsSnapshot::from)
}

/// Deliver poll results to `on_update` until Ctrl-C or the loop ends.
async fn follow<T, F>(handle: &mut PollHandle<T>, mut on_update: F) -> Result<()>
where
  F: FnMut(T),
{
  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      update = handle.next() => match update {
        None => break,
        Some(Ok(payload)) => on_update(payload),
        Some(Err(err)) => report_poll_error(handle, err)?,
      },
    }
  }
  handle.stop();
  info!(key = handle.key(), "stopped following");
  Ok(())
}

/// Poll failures are retried by the loop; only bad credentials end it.
fn report_poll_error<T>(handle: &PollHandle<T>, err: SyncError) -> Result<()> {
  match err {
    SyncError::Unauthorized => {
      handle.stop();
      Err(user_error(err))
    }
    err => {
      warn!(key = handle.key(), "poll failed: {}", err);
      Ok(())
    }
  }
}

fn user_error(err: SyncError) -> color_eyre::Report {
  eyre!("{}", err)
}

fn report_staleness<T>(result: &ReadResult<T>) {
  if let Some(err) = &result.error {
    println!("(showing cached data: {})", err);
  } else if result.is_stale {
    if let Some(fetched_at) = result.fetched_at {
      println!("(cached {})", describe_age(Utc::now() - fetched_at));
    }
  }
}

fn describe_age(age: Duration) -> String {
  let secs = age.num_seconds().max(0);
  match secs {
    0..=59 => format!("{}s ago", secs),
    60..=3599 => format!("{}m ago", secs / 60),
    _ => format!("{}h ago", secs / 3600),
  }
}

fn print_more_hint<I, F>(state: &PageState<I, F>, page_size: usize) {
  if state.can_load_more() {
    println!("-- more available (use --pages, {} per page) --", page_size);
  }
}

/// The jobs view only polls the first page; say so when the backend has more.
fn truncation_note(snapshot: &JobsSnapshot) -> Option<String> {
  snapshot.has_more.then(|| {
    format!(
      "-- showing {} of {} jobs; narrow with --status/--type/--name --",
      snapshot.jobs.len(),
      snapshot.total
    )
  })
}

fn describe_ack(ack: &WriteAck, fallback: &str) -> String {
  let message = ack.message.as_deref().unwrap_or(fallback);
  match (&ack.job_id, ack.items_processed) {
    (Some(job_id), _) => format!("{} (job {})", message, job_id),
    (None, Some(count)) => format!("{} ({} items)", message, count),
    (None, None) => message.to_string(),
  }
}

fn statuses(snapshot: &JobsSnapshot) -> BTreeMap<String, JobStatus> {
  snapshot
    .jobs
    .iter()
    .map(|(id, job)| (id.clone(), job.status))
    .collect()
}

/// One line per job that is new or changed status since `known`.
fn job_transitions(known: &BTreeMap<String, JobStatus>, next: &JobsSnapshot) -> Vec<String> {
  next
    .jobs
    .values()
    .filter_map(|job| match known.get(&job.id) {
      None => Some(format_job(job)),
      Some(previous) if *previous != job.status => Some(format!(
        "{} {} -> {}",
        job_label(job),
        previous,
        job.status
      )),
      Some(_) => None,
    })
    .collect()
}

fn job_label(job: &JobRecord) -> String {
  if job.name.is_empty() {
    job.id.clone()
  } else {
    format!("{} ({})", job.name, job.id)
  }
}

fn format_job(job: &JobRecord) -> String {
  let mut line = format!("{:<9} {}", job.status, job_label(job));
  if let Some(started) = &job.started_at {
    line.push_str(&format!("  started {}", started));
  }
  if let Some(completed) = &job.completed_at {
    line.push_str(&format!("  finished {}", completed));
  }
  line
}

fn format_item(item: &ItemRecord) -> String {
  let score = item.payload.virality_score;
  format!(
    "{:<8} {:<10} {:>5} {:<6} {}",
    item.id.to_string(),
    item.status.as_deref().unwrap_or("-"),
    score.map(|s| format!("{:.1}", s)).unwrap_or_else(|| "-".to_string()),
    virality_bucket(score),
    item.payload.title.as_deref().unwrap_or("")
  )
}

fn print_dashboard(snapshot: &DashboardSnapshot) {
  let stats = &snapshot.stats;
  println!("health: {}", snapshot.health.status);
  println!(
    "items: {} total ({} high / {} medium / {} low)",
    stats.total_items, stats.high_virality, stats.medium_virality, stats.low_virality
  );
  if let Some(avg) = stats.avg_virality_score {
    println!("avg virality: {:.2}", avg);
  }
  if let Some(total) = stats.total_cost_usd {
    println!("cost: ${:.2} total", total);
  }
  for entry in &snapshot.recent_logs {
    println!("  {}", format_log(entry));
  }
}

fn print_metrics(records: &[ItemRecord], max_points: usize) {
  let distribution = derive_distribution(records, |item| {
    virality_bucket(item.payload.virality_score)
  });
  let counts: Vec<String> = [ViralityBucket::High, ViralityBucket::Medium, ViralityBucket::Low]
    .iter()
    .map(|bucket| format!("{} {}", bucket, distribution.get(bucket).copied().unwrap_or(0)))
    .collect();
  println!("virality: {}", counts.join(" / "));

  let trend = derive_cost_trend(records, max_points);
  if trend.is_empty() {
    println!("cost trend: no data");
    return;
  }
  let points: Vec<String> = trend.iter().map(|p| format!("{:.3}", p.cost)).collect();
  println!("cost trend ({} points): {}", trend.len(), points.join(" "));
}

fn print_logs(snapshot: &LogsSnapshot) {
  for entry in &snapshot.logs {
    println!("{}", format_log(entry));
  }
  let levels: Vec<String> = snapshot
    .summary
    .by_level
    .iter()
    .map(|(level, count)| format!("{}={}", level, count))
    .collect();
  if !levels.is_empty() {
    println!("-- {} --", levels.join(" "));
  }
}

fn format_log(entry: &LogEntry) -> String {
  format!(
    "{} {:<7} [{}] {}",
    entry.timestamp.as_deref().unwrap_or("-"),
    entry.level,
    entry.kind,
    entry.message
  )
}
