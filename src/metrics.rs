//! Chart-ready series derived from raw record snapshots.
//!
//! Everything here is pure: same input, same output, no I/O.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Records that carry a generation cost and timestamps.
pub trait Costed {
  fn cost(&self) -> Option<f64>;
  fn created_at(&self) -> Option<DateTime<Utc>>;
  fn published_at(&self) -> Option<DateTime<Utc>>;
}

/// One point of the cost trend, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostPoint {
  /// 1-based position in the series.
  pub index: usize,
  pub cost: f64,
  pub date: Option<DateTime<Utc>>,
}

/// Positive-cost records in timestamp order, limited to the newest `max_points`.
///
/// Records are ordered by creation time, falling back to publish time;
/// records with neither sort as the Unix epoch. Ties keep input order.
pub fn derive_cost_trend<R: Costed>(records: &[R], max_points: usize) -> Vec<CostPoint> {
  let mut costed: Vec<(DateTime<Utc>, Option<DateTime<Utc>>, f64)> = records
    .iter()
    .filter_map(|record| {
      let cost = record.cost().filter(|c| *c > 0.0)?;
      let date = record.created_at().or_else(|| record.published_at());
      Some((date.unwrap_or(DateTime::<Utc>::UNIX_EPOCH), date, cost))
    })
    .collect();

  costed.sort_by_key(|(sort_key, _, _)| *sort_key);

  let skip = costed.len().saturating_sub(max_points);
  costed
    .into_iter()
    .skip(skip)
    .enumerate()
    .map(|(i, (_, date, cost))| CostPoint {
      index: i + 1,
      cost,
      date,
    })
    .collect()
}

/// Count records per bucket assigned by `classifier`.
pub fn derive_distribution<R, K, F>(records: &[R], classifier: F) -> BTreeMap<K, usize>
where
  K: Ord,
  F: Fn(&R) -> K,
{
  let mut counts = BTreeMap::new();
  for record in records {
    *counts.entry(classifier(record)).or_insert(0) += 1;
  }
  counts
}

/// Virality score bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ViralityBucket {
  High,
  Medium,
  Low,
}

impl ViralityBucket {
  pub fn as_str(&self) -> &'static str {
    match self {
      ViralityBucket::High => "high",
      ViralityBucket::Medium => "medium",
      ViralityBucket::Low => "low",
    }
  }
}

impl fmt::Display for ViralityBucket {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(self.as_str())
  }
}

/// >= 7 high, >= 4 medium, everything else (including missing) low.
pub fn virality_bucket(score: Option<f64>) -> ViralityBucket {
  match score {
    Some(s) if s >= 7.0 => ViralityBucket::High,
    Some(s) if s >= 4.0 => ViralityBucket::Medium,
    _ => ViralityBucket::Low,
  }
}

/// Parse the timestamp shapes the backend emits.
///
/// Accepts RFC 3339, naive ISO date-times (taken as UTC) and bare dates.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
  let s = s.trim();
  if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
    return Some(dt.with_timezone(&Utc));
  }
  for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
      return Some(dt.and_utc());
    }
  }
  NaiveDate::parse_from_str(s, "%Y-%m-%d")
    .ok()
    .and_then(|d| d.and_hms_opt(0, 0, 0))
    .map(|dt| dt.and_utc())
}
