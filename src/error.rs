//! Error type shared by every caller joined on the same request.

use color_eyre::eyre::Report;
use std::sync::Arc;

/// Failure surfaced by the synchronization layer.
///
/// Cheap to clone so a single settled request can hand the same outcome to
/// every caller that joined it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
  /// The fetcher rejected (transport failure, timeout, bad payload).
  #[error("{0}")]
  Fetch(Arc<Report>),
  /// The backend rejected our credentials.
  #[error("not authorized: check OPSDECK_API_KEY")]
  Unauthorized,
  /// The request was superseded or cancelled before its result was applied.
  #[error("request cancelled")]
  Cancelled,
}

impl SyncError {
  /// Cancellation is not an error condition for callers; they drop it.
  pub fn is_cancelled(&self) -> bool {
    matches!(self, SyncError::Cancelled)
  }
}

impl From<Report> for SyncError {
  fn from(report: Report) -> Self {
    SyncError::Fetch(Arc::new(report))
  }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
