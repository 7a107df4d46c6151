//! Serde types matching the console backend's responses.
//!
//! Aggregate snapshots (stats, health, log summary) keep unknown fields in
//! `extra`, so newer backends round-trip through the cache unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::metrics::{parse_timestamp, Costed};
use crate::polling::Activity;

// ============================================================================
// Jobs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
  Running,
  Completed,
  Failed,
}

impl JobStatus {
  /// `running` is the only non-terminal state.
  pub fn is_terminal(&self) -> bool {
    !matches!(self, JobStatus::Running)
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      JobStatus::Running => "running",
      JobStatus::Completed => "completed",
      JobStatus::Failed => "failed",
    }
  }
}

impl fmt::Display for JobStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(self.as_str())
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
  /// Taken from the response map key when the body omits it.
  #[serde(default)]
  pub id: String,
  #[serde(default)]
  pub name: String,
  pub status: JobStatus,
  pub started_at: Option<String>,
  pub completed_at: Option<String>,
  pub result: Option<Value>,
  pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobsResponse {
  #[serde(default)]
  pub jobs: BTreeMap<String, JobRecord>,
  #[serde(default)]
  pub total: Option<u64>,
  #[serde(default, rename = "hasMore", alias = "has_more")]
  pub has_more: bool,
  #[serde(default, rename = "nextCursor", alias = "next_cursor")]
  pub next_cursor: Option<String>,
}

impl JobsResponse {
  /// Jobs with their ids filled in from the map keys.
  pub fn into_records(self) -> Vec<JobRecord> {
    self
      .jobs
      .into_iter()
      .map(|(id, mut job)| {
        if job.id.is_empty() {
          job.id = id;
        }
        job
      })
      .collect()
  }
}

/// Cached view of the first page of jobs the backend reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobsSnapshot {
  pub jobs: BTreeMap<String, JobRecord>,
  pub total: u64,
  /// More jobs exist beyond `jobs`.
  #[serde(default)]
  pub has_more: bool,
}

impl JobsSnapshot {
  pub fn running(&self) -> impl Iterator<Item = &JobRecord> {
    self.jobs.values().filter(|job| !job.status.is_terminal())
  }
}

impl From<JobsResponse> for JobsSnapshot {
  fn from(response: JobsResponse) -> Self {
    let total = response.total;
    let has_more = response.has_more;
    let jobs: BTreeMap<String, JobRecord> = response
      .into_records()
      .into_iter()
      .map(|job| (job.id.clone(), job))
      .collect();
    Self {
      total: total.unwrap_or(jobs.len() as u64),
      jobs,
      has_more,
    }
  }
}

impl Activity for JobsSnapshot {
  fn is_active(&self) -> bool {
    self.running().next().is_some()
  }
}

/// Pipeline runs an operator can start.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Trigger {
  Scan,
  Generation,
  FullPipeline,
  /// Publish every drafted item scoring at least `min_score`.
  AutoPublish { min_score: f64 },
}

impl Trigger {
  pub fn path(&self) -> &'static str {
    match self {
      Trigger::Scan => "system/run-scan",
      Trigger::Generation => "system/run-generation",
      Trigger::FullPipeline => "system/run-full-pipeline",
      Trigger::AutoPublish { .. } => "system/auto-publish",
    }
  }

  pub fn query(&self) -> Vec<(&'static str, String)> {
    match self {
      Trigger::AutoPublish { min_score } => vec![("min_score", min_score.to_string())],
      _ => vec![("blocking", "false".to_string())],
    }
  }

  /// Cache prefixes whose contents the run changes.
  pub fn touches(&self) -> &'static [&'static str] {
    match self {
      // Publishing runs inline and starts no job
      Trigger::AutoPublish { .. } => &["items", "dashboard"],
      _ => &["jobs", "items", "dashboard"],
    }
  }
}

/// Acknowledgement returned by write endpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteAck {
  pub message: Option<String>,
  pub job_id: Option<String>,
  pub items_processed: Option<u64>,
  #[serde(flatten)]
  pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobFilters {
  pub name: Option<String>,
  #[serde(rename = "type")]
  pub job_type: Option<String>,
  pub status: Option<JobStatus>,
}

// ============================================================================
// Items
// ============================================================================

/// Backend ids are integers on some routes and strings on others.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
  Int(i64),
  Text(String),
}

impl fmt::Display for RecordId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RecordId::Int(id) => write!(f, "{}", id),
      RecordId::Text(id) => f.write_str(id),
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemPayload {
  pub title: Option<String>,
  pub virality_score: Option<f64>,
  pub generation_cost_usd: Option<f64>,
  pub created_at: Option<String>,
  pub published_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
  pub id: RecordId,
  #[serde(default)]
  pub status: Option<String>,
  #[serde(default)]
  pub payload: ItemPayload,
}

impl Costed for ItemRecord {
  fn cost(&self) -> Option<f64> {
    self.payload.generation_cost_usd
  }

  fn created_at(&self) -> Option<DateTime<Utc>> {
    self.payload.created_at.as_deref().and_then(parse_timestamp)
  }

  fn published_at(&self) -> Option<DateTime<Utc>> {
    self.payload.published_at.as_deref().and_then(parse_timestamp)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ItemsResponse {
  #[serde(default)]
  pub items: Vec<ItemRecord>,
  #[serde(default, rename = "nextOffset", alias = "next_offset")]
  pub next_offset: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemFilters {
  pub status: Option<String>,
}

// ============================================================================
// Aggregates
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
  #[serde(default)]
  pub total_items: u64,
  #[serde(default)]
  pub high_virality: u64,
  #[serde(default)]
  pub medium_virality: u64,
  #[serde(default)]
  pub low_virality: u64,
  pub avg_virality_score: Option<f64>,
  pub total_cost_usd: Option<f64>,
  pub daily_cost_usd: Option<f64>,
  pub auto_publish_min_score: Option<f64>,
  #[serde(flatten)]
  pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Health {
  #[serde(default)]
  pub status: String,
  #[serde(flatten)]
  pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
  pub timestamp: Option<String>,
  #[serde(rename = "type", default)]
  pub kind: String,
  #[serde(default)]
  pub level: String,
  #[serde(default)]
  pub message: String,
  pub details: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogsResponse {
  #[serde(default)]
  pub logs: Vec<LogEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogSummary {
  #[serde(default)]
  pub by_level: BTreeMap<String, u64>,
  #[serde(flatten)]
  pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogFilters {
  pub limit: usize,
  #[serde(rename = "type")]
  pub activity_type: Option<String>,
  pub level: Option<String>,
}

impl Default for LogFilters {
  fn default() -> Self {
    Self {
      limit: 100,
      activity_type: None,
      level: None,
    }
  }
}

/// Everything the dashboard shows, fetched and cached together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardSnapshot {
  pub stats: Stats,
  pub health: Health,
  pub recent_logs: Vec<LogEntry>,
}

/// Filtered logs plus the per-level summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogsSnapshot {
  pub logs: Vec<LogEntry>,
  pub summary: LogSummary,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_jobs_response_fills_ids_and_detects_activity() {
    let raw = r#"{
      "jobs": {
        "a1": {"name": "scout", "status": "completed", "started_at": "2024-01-01T10:00:00"},
        "b2": {"id": "b2", "name": "publish", "status": "running", "started_at": "2024-01-01T10:05:00"}
      },
      "total": 2,
      "hasMore": false,
      "nextCursor": null
    }"#;
    let response: JobsResponse = serde_json::from_str(raw).unwrap();
    let snapshot = JobsSnapshot::from(response);

    assert_eq!(snapshot.total, 2);
    assert_eq!(snapshot.jobs["a1"].id, "a1");
    assert!(snapshot.is_active());
    assert_eq!(snapshot.running().count(), 1);
    assert!(!snapshot.has_more);
  }

  #[test]
  fn test_snapshot_keeps_has_more() {
    let raw = r#"{"jobs": {"a": {"status": "running"}}, "total": 250, "hasMore": true, "nextCursor": "a"}"#;
    let snapshot = JobsSnapshot::from(serde_json::from_str::<JobsResponse>(raw).unwrap());
    assert!(snapshot.has_more);
    assert_eq!(snapshot.total, 250);

    // Snapshots cached before the field existed still load
    let old: JobsSnapshot = serde_json::from_str(r#"{"jobs": {}, "total": 0}"#).unwrap();
    assert!(!old.has_more);
  }

  #[test]
  fn test_trigger_routes() {
    assert_eq!(Trigger::Scan.path(), "system/run-scan");
    assert_eq!(Trigger::Scan.query(), vec![("blocking", "false".to_string())]);
    let publish = Trigger::AutoPublish { min_score: 6.5 };
    assert_eq!(publish.path(), "system/auto-publish");
    assert_eq!(publish.query(), vec![("min_score", "6.5".to_string())]);
    assert!(Trigger::FullPipeline.touches().contains(&"jobs"));
    assert!(!publish.touches().contains(&"jobs"));
  }

  #[test]
  fn test_write_ack_is_lenient() {
    let ack: WriteAck = serde_json::from_str(r#"{"job_id": "j1", "status": "started"}"#).unwrap();
    assert_eq!(ack.job_id.as_deref(), Some("j1"));
    assert_eq!(ack.extra["status"], "started");
    let empty: WriteAck = serde_json::from_str("{}").unwrap();
    assert_eq!(empty, WriteAck::default());
  }

  #[test]
  fn test_all_terminal_jobs_are_idle() {
    let raw = r#"{"jobs": {"x": {"status": "failed", "error": "boom"}}}"#;
    let snapshot = JobsSnapshot::from(serde_json::from_str::<JobsResponse>(raw).unwrap());
    assert!(!snapshot.is_active());
    assert_eq!(snapshot.total, 1);
    assert!(JobStatus::Failed.is_terminal());
    assert!(JobStatus::Completed.is_terminal());
  }

  #[test]
  fn test_items_response_accepts_snake_case_offset() {
    let raw = r#"{
      "items": [
        {"id": 7, "status": "drafted", "payload": {"virality_score": 8.5, "generation_cost_usd": 0.02, "created_at": "2024-01-01T00:00:00"}},
        {"id": "x9", "payload": {}}
      ],
      "next_offset": 20
    }"#;
    let response: ItemsResponse = serde_json::from_str(raw).unwrap();
    assert_eq!(response.next_offset, Some(20));
    assert_eq!(response.items[0].id.to_string(), "7");
    assert_eq!(response.items[1].id.to_string(), "x9");
    assert_eq!(response.items[0].cost(), Some(0.02));
    assert!(response.items[0].created_at().is_some());
  }

  #[test]
  fn test_stats_keep_unknown_fields() {
    let raw = r#"{"total_items": 10, "high_virality": 3, "queue_depth": 4}"#;
    let stats: Stats = serde_json::from_str(raw).unwrap();
    assert_eq!(stats.total_items, 10);
    assert_eq!(stats.extra["queue_depth"], 4);

    let back = serde_json::to_value(&stats).unwrap();
    assert_eq!(back["queue_depth"], 4);
  }
}
