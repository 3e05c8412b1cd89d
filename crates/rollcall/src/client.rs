//! HTTP client for the attendance server.
//!
//! The sync engine and capture adapter talk to the server through the
//! [`SyncClient`] trait; [`ServerClient`] is the `reqwest` implementation.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::record::{AttendanceRecord, StudentId};
use crate::storage::SyncBatch;

/// Header carrying the batch digest so the server can spot a retried batch.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Longest response body kept in error messages.
const MAX_ERROR_BODY: usize = 500;

/// Response shape shared by the submit and bulk-sync endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Whether the server accepted the whole request.
    pub success: bool,
    /// Reason given when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Records the server stored (bulk endpoint only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_count: Option<u64>,
    /// Records the server dropped as invalid (bulk endpoint only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped: Option<u64>,
}

impl SyncResponse {
    /// Convert a refusal into [`Error::ServerRejected`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServerRejected`] when `success` is false.
    pub fn into_result(self) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(Error::server_rejected(
                self.error
                    .unwrap_or_else(|| "no reason given".to_string()),
            ))
        }
    }
}

/// Monthly attendance summary for the signed-in student.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyStats {
    /// Percentage of days present this month.
    pub percentage: u32,
    /// Days marked present.
    pub present_days: u32,
    /// Days not marked present.
    pub absent_days: u32,
}

#[derive(Debug, Deserialize)]
struct StatsEnvelope {
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(flatten)]
    stats: Option<MonthlyStats>,
}

#[derive(Debug, Deserialize)]
struct StudentIdEnvelope {
    student_id: Option<StudentId>,
}

/// Transport used to deliver records to the server.
#[async_trait]
pub trait SyncClient: Send + Sync + std::fmt::Debug {
    /// Send every record of a batch in one request.
    ///
    /// A well-formed response is returned as-is, including `success: false`.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, timeout, non-2xx status, or an
    /// unparseable body.
    async fn submit_batch(&self, batch: &SyncBatch) -> Result<SyncResponse>;

    /// Send a single record captured while online.
    ///
    /// # Errors
    ///
    /// Same as [`SyncClient::submit_batch`].
    async fn submit_one(&self, record: &AttendanceRecord) -> Result<SyncResponse>;
}

/// `reqwest`-backed client for the attendance server.
#[derive(Debug, Clone)]
pub struct ServerClient {
    config: ServerConfig,
    client: reqwest::Client,
}

impl ServerClient {
    /// Create a client for the configured server.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("rollcall/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { config, client })
    }

    /// Returns a reference to the server configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    /// Resolve the signed-in student's id.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the body is malformed.
    pub async fn student_id(&self) -> Result<Option<StudentId>> {
        let url = self.url(&self.config.student_id_path);
        let resp = self.client.get(&url).send().await.map_err(classify)?;
        let envelope: StudentIdEnvelope = read_json(resp).await?;
        Ok(envelope.student_id)
    }

    /// Fetch the monthly attendance summary.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServerRejected`] if the server reports failure, or a
    /// transport error.
    pub async fn monthly_stats(&self) -> Result<MonthlyStats> {
        let url = self.url(&self.config.stats_path);
        let resp = self.client.get(&url).send().await.map_err(classify)?;
        let envelope: StatsEnvelope = read_json(resp).await?;

        if !envelope.success {
            return Err(Error::server_rejected(
                envelope
                    .error
                    .unwrap_or_else(|| "no reason given".to_string()),
            ));
        }
        envelope
            .stats
            .ok_or_else(|| Error::MalformedResponse("missing monthly stats fields".to_string()))
    }
}

#[async_trait]
impl SyncClient for ServerClient {
    async fn submit_batch(&self, batch: &SyncBatch) -> Result<SyncResponse> {
        let url = self.url(&self.config.sync_path);
        debug!(
            records = batch.len(),
            digest = &batch.digest()[..16],
            "Posting batch to {url}"
        );

        let resp = self
            .client
            .post(&url)
            .header(IDEMPOTENCY_HEADER, batch.digest())
            .json(batch.records())
            .send()
            .await
            .map_err(classify)?;
        read_json(resp).await
    }

    async fn submit_one(&self, record: &AttendanceRecord) -> Result<SyncResponse> {
        let url = self.url(&self.config.submit_path);
        let record = record.clone().offline(false);
        debug!("Posting single record to {url}");

        let resp = self
            .client
            .post(&url)
            .json(&record)
            .send()
            .await
            .map_err(classify)?;
        read_json(resp).await
    }
}

/// Map a `reqwest` failure, singling out timeouts.
fn classify(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::timeout(
            err.url()
                .map_or_else(|| "request".to_string(), ToString::to_string),
        )
    } else {
        Error::Transport(err)
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    let body = resp.text().await.map_err(classify)?;

    if !status.is_success() {
        warn!(status = status.as_u16(), "Server returned error status");
        return Err(Error::ServerStatus {
            status: status.as_u16(),
            body: truncate(&body),
        });
    }
    if status == StatusCode::NO_CONTENT || body.trim().is_empty() {
        return Err(Error::MalformedResponse("empty response body".to_string()));
    }

    serde_json::from_str(&body).map_err(|e| Error::MalformedResponse(e.to_string()))
}

fn truncate(body: &str) -> String {
    body.chars().take(MAX_ERROR_BODY).collect()
}
