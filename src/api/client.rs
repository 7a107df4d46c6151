use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::api::types::{
  DashboardSnapshot, Health, ItemFilters, ItemsResponse, JobFilters, JobRecord, JobsResponse,
  LogFilters, LogSummary, LogsResponse, LogsSnapshot, Stats, Trigger, WriteAck,
};
use crate::config::Config;
use crate::error::{SyncError, SyncResult};

/// Entries fetched alongside stats and health for the dashboard.
const DASHBOARD_LOG_LIMIT: usize = 10;

/// HTTP client for the console backend.
#[derive(Clone)]
pub struct ConsoleClient {
  http: reqwest::Client,
  base: Url,
  api_key: Option<String>,
}

impl ConsoleClient {
  pub fn new(config: &Config) -> Result<Self> {
    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.api.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Self::with_http(http, &config.api.url, Config::get_api_key())
  }

  fn with_http(http: reqwest::Client, base_url: &str, api_key: Option<String>) -> Result<Self> {
    let mut base =
      Url::parse(base_url).map_err(|e| eyre!("Invalid API url {}: {}", base_url, e))?;
    // Relative joins replace the last segment unless the path ends in '/'
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    Ok(Self {
      http,
      base,
      api_key,
    })
  }

  pub fn endpoint(&self, path: &str) -> SyncResult<Url> {
    self
      .base
      .join(path)
      .map_err(|e| eyre!("Invalid endpoint {}: {}", path, e).into())
  }

  async fn get_json<T: DeserializeOwned>(
    &self,
    path: &str,
    query: &[(&str, String)],
  ) -> SyncResult<T> {
    self.send_json(Method::GET, path, query).await
  }

  async fn send_json<T: DeserializeOwned>(
    &self,
    method: Method,
    path: &str,
    query: &[(&str, String)],
  ) -> SyncResult<T> {
    let url = self.endpoint(path)?;
    debug!(%url, %method, "request");

    let mut request = self.http.request(method, url).query(query);
    if let Some(key) = &self.api_key {
      request = request.header("X-API-Key", key);
    }

    let response = request
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", path, e))?;

    if response.status() == StatusCode::UNAUTHORIZED {
      return Err(SyncError::Unauthorized);
    }

    let response = response
      .error_for_status()
      .map_err(|e| eyre!("Request to {} failed: {}", path, e))?;

    response
      .json::<T>()
      .await
      .map_err(|e| eyre!("Failed to parse {} response: {}", path, e).into())
  }

  /// One page of jobs
  pub async fn get_jobs(
    &self,
    filters: &JobFilters,
    limit: usize,
    cursor: Option<&str>,
  ) -> SyncResult<JobsResponse> {
    let mut query = vec![("limit", limit.to_string())];
    push_opt(&mut query, "name", filters.name.as_deref());
    push_opt(&mut query, "type", filters.job_type.as_deref());
    push_opt(&mut query, "status", filters.status.map(|s| s.as_str()));
    push_opt(&mut query, "cursor", cursor);
    self.get_json("jobs", &query).await
  }

  /// Status of a single job
  pub async fn get_job(&self, id: &str) -> SyncResult<JobRecord> {
    let mut job: JobRecord = self.get_json(&format!("jobs/{}", id), &[]).await?;
    if job.id.is_empty() {
      job.id = id.to_string();
    }
    Ok(job)
  }

  pub async fn get_items(
    &self,
    filters: &ItemFilters,
    limit: usize,
    offset: u64,
  ) -> SyncResult<ItemsResponse> {
    let mut query = vec![("limit", limit.to_string()), ("offset", offset.to_string())];
    push_opt(&mut query, "status", filters.status.as_deref());
    self.get_json("items", &query).await
  }

  pub async fn get_stats(&self) -> SyncResult<Stats> {
    self.get_json("stats", &[]).await
  }

  pub async fn get_health(&self) -> SyncResult<Health> {
    self.get_json("health", &[]).await
  }

  pub async fn get_logs(&self, filters: &LogFilters) -> SyncResult<LogsResponse> {
    let mut query = vec![("limit", filters.limit.to_string())];
    push_opt(&mut query, "type", filters.activity_type.as_deref());
    push_opt(&mut query, "level", filters.level.as_deref());
    self.get_json("logs", &query).await
  }

  pub async fn get_logs_summary(&self) -> SyncResult<LogSummary> {
    self.get_json("logs/summary", &[]).await
  }

  /// Start a pipeline run. Scans and generations return a job id to follow.
  pub async fn run_trigger(&self, trigger: Trigger) -> SyncResult<WriteAck> {
    self
      .send_json(Method::POST, trigger.path(), &trigger.query())
      .await
  }

  pub async fn approve_item(&self, id: &str) -> SyncResult<WriteAck> {
    self
      .send_json(Method::POST, &format!("items/{}/approve", id), &[])
      .await
  }

  pub async fn reject_item(&self, id: &str) -> SyncResult<WriteAck> {
    self
      .send_json(Method::POST, &format!("items/{}/reject", id), &[])
      .await
  }

  pub async fn delete_item(&self, id: &str) -> SyncResult<WriteAck> {
    self
      .send_json(Method::DELETE, &format!("items/{}", id), &[])
      .await
  }

  /// Delete every activity log entry on the server.
  pub async fn clear_logs(&self) -> SyncResult<WriteAck> {
    self.send_json(Method::DELETE, "logs", &[]).await
  }

  /// Stats, health and the latest log entries, fetched concurrently.
  ///
  /// Fails as a whole if any part fails, so a cached dashboard is never a
  /// mix of two refreshes.
  pub async fn dashboard_snapshot(&self) -> SyncResult<DashboardSnapshot> {
    let recent = LogFilters {
      limit: DASHBOARD_LOG_LIMIT,
      ..LogFilters::default()
    };
    let (stats, health, logs) = futures::try_join!(
      self.get_stats(),
      self.get_health(),
      self.get_logs(&recent)
    )?;

    Ok(DashboardSnapshot {
      stats,
      health,
      recent_logs: logs.logs,
    })
  }

  /// Filtered logs and the level summary, fetched concurrently.
  pub async fn logs_snapshot(&self, filters: &LogFilters) -> SyncResult<LogsSnapshot> {
    let (logs, summary) = futures::try_join!(self.get_logs(filters), self.get_logs_summary())?;
    Ok(LogsSnapshot {
      logs: logs.logs,
      summary,
    })
  }
}

fn push_opt(query: &mut Vec<(&'static str, String)>, name: &'static str, value: Option<&str>) {
  if let Some(value) = value {
    query.push((name, value.to_string()));
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;

  /// Serve one canned response; resolves to the request head it received.
  async fn one_shot(status: &str, body: &str) -> (String, tokio::task::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}/api", listener.local_addr().unwrap());
    let reply = format!(
      "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
      status,
      body.len(),
      body
    );
    let served = tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut buf = vec![0u8; 4096];
      let n = socket.read(&mut buf).await.unwrap();
      socket.write_all(reply.as_bytes()).await.unwrap();
      socket.shutdown().await.unwrap();
      String::from_utf8_lossy(&buf[..n]).to_string()
    });
    (base, served)
  }

  fn client(base: &str) -> ConsoleClient {
    ConsoleClient::with_http(reqwest::Client::new(), base, None).unwrap()
  }

  #[test]
  fn test_endpoint_keeps_base_path() {
    let bare = client("http://localhost:8000/api/v1");
    assert_eq!(
      bare.endpoint("logs/summary").unwrap().as_str(),
      "http://localhost:8000/api/v1/logs/summary"
    );

    let slashed = client("http://localhost:8000/api/v1/");
    assert_eq!(
      slashed.endpoint("jobs/abc").unwrap().as_str(),
      "http://localhost:8000/api/v1/jobs/abc"
    );
  }

  #[test]
  fn test_invalid_base_url() {
    assert!(ConsoleClient::with_http(reqwest::Client::new(), "not a url", None).is_err());
  }

  #[test]
  fn test_push_opt_skips_missing_values() {
    let mut query = vec![("limit", "20".to_string())];
    push_opt(&mut query, "status", None);
    push_opt(&mut query, "type", Some("scout"));
    assert_eq!(
      query,
      vec![("limit", "20".to_string()), ("type", "scout".to_string())]
    );
  }

  #[tokio::test]
  async fn test_trigger_posts_and_parses_ack() {
    let (base, served) = one_shot("200 OK", r#"{"job_id": "scan-1", "message": "started"}"#).await;
    let ack = client(&base).run_trigger(Trigger::Scan).await.unwrap();
    assert_eq!(ack.job_id.as_deref(), Some("scan-1"));

    let head = served.await.unwrap();
    assert!(head.starts_with("POST /api/system/run-scan?blocking=false "), "{}", head);
  }

  #[tokio::test]
  async fn test_write_unauthorized() {
    let (base, served) = one_shot("401 Unauthorized", "{}").await;
    let err = client(&base).clear_logs().await.unwrap_err();
    assert!(matches!(err, SyncError::Unauthorized));
    assert!(served.await.unwrap().starts_with("DELETE /api/logs "));
  }
}
