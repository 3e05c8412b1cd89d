//! Draining the local queue to the server.
//!
//! [`SyncEngine::drain`] is the only place records leave the local store:
//! it snapshots the queue, sends the snapshot as one batch, and clears
//! exactly that snapshot once the server confirms it. At most one drain runs
//! at a time per database file, whichever engine or process starts it.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::client::SyncClient;
use crate::error::Error;
use crate::network::{NetworkMonitor, NetworkState};
use crate::storage::{LocalStore, SyncBatch};

/// Why a drain did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The network monitor reports `Offline`.
    Offline,
    /// There was nothing pending.
    Empty,
    /// Another drain is already running.
    InFlight,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Offline => write!(f, "offline"),
            Self::Empty => write!(f, "nothing pending"),
            Self::InFlight => write!(f, "another sync is in flight"),
        }
    }
}

/// Why a drain failed. The queue is left unchanged in every case.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SyncFailure {
    /// The request never produced a response.
    #[error("transport failure: {0}")]
    Transport(String),

    /// No response arrived within the sync timeout.
    #[error("sync request timed out")]
    Timeout,

    /// The server answered with a non-success HTTP status.
    #[error("server returned HTTP {0}")]
    Status(u16),

    /// The server answered `success: false`.
    #[error("server rejected batch: {0}")]
    Rejected(String),

    /// The response body could not be understood.
    #[error("malformed server response: {0}")]
    MalformedResponse(String),

    /// The local store could not be read or cleared.
    #[error("local store error: {0}")]
    Storage(String),
}

impl From<Error> for SyncFailure {
    fn from(err: Error) -> Self {
        match err {
            Error::Transport(e) => Self::Transport(e.to_string()),
            Error::Timeout { .. } => Self::Timeout,
            Error::ServerStatus { status, .. } => Self::Status(status),
            Error::ServerRejected { message } => Self::Rejected(message),
            Error::MalformedResponse(message) => Self::MalformedResponse(message),
            other => Self::Storage(other.to_string()),
        }
    }
}

/// Outcome of one drain attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncResult {
    /// The server confirmed the batch and it was removed locally.
    Succeeded {
        /// Records delivered.
        count: usize,
    },
    /// The attempt failed; nothing was removed.
    Failed {
        /// What went wrong.
        error: SyncFailure,
    },
    /// The attempt did nothing.
    Skipped {
        /// Why.
        reason: SkipReason,
    },
}

impl SyncResult {
    fn failed(error: impl Into<SyncFailure>) -> Self {
        Self::Failed {
            error: error.into(),
        }
    }

    fn skipped(reason: SkipReason) -> Self {
        Self::Skipped { reason }
    }

    /// Whether the queue is known to be drained after this attempt.
    #[must_use]
    pub fn queue_drained(&self) -> bool {
        matches!(
            self,
            Self::Succeeded { .. }
                | Self::Skipped {
                    reason: SkipReason::Empty
                }
        )
    }
}

impl std::fmt::Display for SyncResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded { count } => write!(f, "synced {count} record(s)"),
            Self::Failed { error } => write!(f, "failed: {error}"),
            Self::Skipped { reason } => write!(f, "skipped: {reason}"),
        }
    }
}

/// Slack added to the request timeout when sizing the drain lease.
const LEASE_MARGIN: Duration = Duration::from_secs(30);

/// Sends queued records to the server.
///
/// The in-flight guard is the store's drain lease, so concurrent calls to
/// [`drain`] never overlap across clones, separate engines on the same
/// database, or separate processes.
///
/// [`drain`]: SyncEngine::drain
#[derive(Debug, Clone)]
pub struct SyncEngine {
    store: LocalStore,
    client: Arc<dyn SyncClient>,
    network: NetworkMonitor,
    timeout: Duration,
}

impl SyncEngine {
    /// Create an engine. `timeout` bounds the whole server round trip.
    #[must_use]
    pub fn new(
        store: LocalStore,
        client: Arc<dyn SyncClient>,
        network: NetworkMonitor,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            client,
            network,
            timeout,
        }
    }

    /// Returns the local store this engine drains.
    #[must_use]
    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Returns the network monitor gating this engine.
    #[must_use]
    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    /// Whether a drain started in this process holds the database right now.
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.store.is_draining()
    }

    /// Attempt to send everything pending.
    ///
    /// Never returns an error: failures are reported as
    /// [`SyncResult::Failed`] and leave the queue untouched. Records appended
    /// while the request is outstanding stay queued for the next drain.
    pub async fn drain(&self) -> SyncResult {
        let ttl = self.timeout + LEASE_MARGIN;
        let _lease = match self
            .blocking(move |store| store.try_claim_drain(ttl))
            .await
        {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                debug!("Drain already in flight");
                return SyncResult::skipped(SkipReason::InFlight);
            }
            Err(failure) => {
                warn!(error = %failure, "Could not claim drain lease");
                return SyncResult::failed(failure);
            }
        };

        if self.network.current_state() == NetworkState::Offline {
            debug!("Offline; not draining");
            return SyncResult::skipped(SkipReason::Offline);
        }

        let batch = match self.blocking(LocalStore::snapshot).await {
            Ok(batch) => batch,
            Err(failure) => {
                warn!(error = %failure, "Could not read pending records");
                return SyncResult::failed(failure);
            }
        };
        if batch.is_empty() {
            debug!("Nothing pending");
            return SyncResult::skipped(SkipReason::Empty);
        }

        info!(records = batch.len(), "Syncing pending records");

        let response =
            match tokio::time::timeout(self.timeout, self.client.submit_batch(&batch)).await {
                Err(_) => {
                    warn!(
                        timeout_secs = self.timeout.as_secs_f64(),
                        "Sync timed out; records kept"
                    );
                    return SyncResult::failed(SyncFailure::Timeout);
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Sync failed; records kept");
                    return SyncResult::failed(e);
                }
                Ok(Ok(response)) => response,
            };

        if let Err(e) = response.clone().into_result() {
            warn!(error = %e, "Server rejected batch; records kept");
            return SyncResult::failed(e);
        }

        let count = batch.len();
        if let Err(failure) = self.clear(batch).await {
            // Delivered but still queued: the next drain resends the same
            // records under a new digest.
            warn!(error = %failure, "Batch delivered but could not be cleared");
            return SyncResult::failed(failure);
        }

        info!(
            records = count,
            synced = response.synced_count,
            skipped = response.skipped,
            "Sync complete"
        );
        SyncResult::Succeeded { count }
    }

    async fn clear(&self, batch: SyncBatch) -> Result<usize, SyncFailure> {
        self.blocking(move |store| store.clear_batch(&batch)).await
    }

    /// Run a store operation off the async runtime.
    async fn blocking<T, F>(&self, op: F) -> Result<T, SyncFailure>
    where
        T: Send + 'static,
        F: FnOnce(&LocalStore) -> crate::Result<T> + Send + 'static,
    {
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || op(&store)).await {
            Ok(result) => result.map_err(SyncFailure::from),
            Err(join) => Err(SyncFailure::Storage(join.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ServerClient;
    use crate::config::ServerConfig;
    use crate::record::{AttendanceRecord, StudentId};
    use crate::storage::DRAIN_LEASE_KEY;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record(n: i64) -> AttendanceRecord {
        AttendanceRecord::new(
            Some(StudentId::Numeric(n)),
            AttendanceRecord::encode_image("image/png", &n.to_be_bytes()),
            None,
        )
        .unwrap()
        .offline(true)
    }

    fn engine_for(server: &MockServer, timeout: Duration) -> SyncEngine {
        let client = ServerClient::new(ServerConfig {
            base_url: server.uri(),
            request_timeout_secs: 10,
            ..ServerConfig::default()
        })
        .unwrap();
        let network = NetworkMonitor::new();
        network.observe(NetworkState::Online);
        SyncEngine::new(
            LocalStore::open_in_memory().unwrap(),
            Arc::new(client),
            network,
            timeout,
        )
    }

    fn ok_response(count: u64) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .set_body_json(json!({"success": true, "synced_count": count, "skipped": 0}))
    }

    #[tokio::test]
    async fn test_drain_sends_and_clears() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/sync-attendance"))
            .respond_with(ok_response(2))
            .expect(1)
            .mount(&server)
            .await;

        let engine = engine_for(&server, Duration::from_secs(5));
        engine.store().append(&record(1)).unwrap();
        engine.store().append(&record(2)).unwrap();

        assert_eq!(engine.drain().await, SyncResult::Succeeded { count: 2 });
        assert_eq!(engine.store().count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_queue_is_skipped_without_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ok_response(0))
            .expect(0)
            .mount(&server)
            .await;

        let engine = engine_for(&server, Duration::from_secs(5));
        let result = engine.drain().await;
        assert_eq!(
            result,
            SyncResult::Skipped {
                reason: SkipReason::Empty
            }
        );
        assert!(result.queue_drained());
    }

    #[tokio::test]
    async fn test_offline_is_skipped_without_touching_store() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ok_response(1))
            .expect(0)
            .mount(&server)
            .await;

        let engine = engine_for(&server, Duration::from_secs(5));
        engine.network().observe(NetworkState::Offline);
        engine.store().append(&record(1)).unwrap();

        assert_eq!(
            engine.drain().await,
            SyncResult::Skipped {
                reason: SkipReason::Offline
            }
        );
        assert_eq!(engine.store().count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rejection_keeps_records() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"success": false, "error": "db locked"})),
            )
            .mount(&server)
            .await;

        let engine = engine_for(&server, Duration::from_secs(5));
        engine.store().append(&record(1)).unwrap();

        assert_eq!(
            engine.drain().await,
            SyncResult::Failed {
                error: SyncFailure::Rejected("db locked".to_string())
            }
        );
        assert_eq!(engine.store().count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_server_error_status_keeps_records() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let engine = engine_for(&server, Duration::from_secs(5));
        engine.store().append(&record(1)).unwrap();

        assert_eq!(
            engine.drain().await,
            SyncResult::Failed {
                error: SyncFailure::Status(500)
            }
        );
        assert_eq!(engine.store().count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_timeout_keeps_records() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ok_response(1).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let engine = engine_for(&server, Duration::from_millis(200));
        engine.store().append(&record(1)).unwrap();

        assert_eq!(
            engine.drain().await,
            SyncResult::Failed {
                error: SyncFailure::Timeout
            }
        );
        assert_eq!(engine.store().count().unwrap(), 1);
        assert!(!engine.is_in_flight());
    }

    #[tokio::test]
    async fn test_concurrent_drains_send_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ok_response(1).set_delay(Duration::from_millis(300)))
            .expect(1)
            .mount(&server)
            .await;

        let engine = engine_for(&server, Duration::from_secs(5));
        engine.store().append(&record(1)).unwrap();

        let other = engine.clone();
        let (a, b) = tokio::join!(engine.drain(), other.drain());

        let mut results = [a, b];
        results.sort_by_key(|r| matches!(r, SyncResult::Skipped { .. }));
        assert_eq!(results[0], SyncResult::Succeeded { count: 1 });
        assert_eq!(
            results[1],
            SyncResult::Skipped {
                reason: SkipReason::InFlight
            }
        );
    }

    #[tokio::test]
    async fn test_append_during_drain_survives() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ok_response(1).set_delay(Duration::from_millis(400)))
            .mount(&server)
            .await;

        let engine = engine_for(&server, Duration::from_secs(5));
        engine.store().append(&record(1)).unwrap();

        let task = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.drain().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(engine.is_in_flight());
        let late = record(2);
        engine.store().append(&late).unwrap();

        assert_eq!(task.await.unwrap(), SyncResult::Succeeded { count: 1 });

        let remaining = engine.store().read_all().unwrap();
        assert_eq!(remaining, vec![late]);
    }

    #[tokio::test]
    async fn test_engines_sharing_a_database_send_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ok_response(1).set_delay(Duration::from_millis(300)))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("pending.db");
        let engine = |store: LocalStore| {
            let network = NetworkMonitor::new();
            network.observe(NetworkState::Online);
            let client = ServerClient::new(ServerConfig {
                base_url: server.uri(),
                ..ServerConfig::default()
            })
            .unwrap();
            SyncEngine::new(store, Arc::new(client), network, Duration::from_secs(5))
        };
        let first = engine(LocalStore::open(&db_path).unwrap());
        let second = engine(LocalStore::open(&db_path).unwrap());
        first.store().append(&record(1)).unwrap();

        let (a, b) = tokio::join!(first.drain(), second.drain());

        let mut results = [a, b];
        results.sort_by_key(|r| matches!(r, SyncResult::Skipped { .. }));
        assert_eq!(results[0], SyncResult::Succeeded { count: 1 });
        assert_eq!(
            results[1],
            SyncResult::Skipped {
                reason: SkipReason::InFlight
            }
        );
        assert!(!first.is_in_flight());
        assert_eq!(first.store().get_meta(DRAIN_LEASE_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_lease_held_by_another_process_skips() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ok_response(1))
            .expect(0)
            .mount(&server)
            .await;

        let engine = engine_for(&server, Duration::from_secs(5));
        engine.store().append(&record(1)).unwrap();
        let expires = (chrono::Utc::now() + chrono::TimeDelta::minutes(1)).to_rfc3339();
        engine
            .store()
            .set_meta(DRAIN_LEASE_KEY, &format!("4242|{expires}"))
            .unwrap();

        assert_eq!(
            engine.drain().await,
            SyncResult::Skipped {
                reason: SkipReason::InFlight
            }
        );
        assert_eq!(engine.store().count().unwrap(), 1);
    }

    #[test]
    fn test_failure_from_error() {
        assert_eq!(
            SyncFailure::from(Error::timeout("sync")),
            SyncFailure::Timeout
        );
        assert_eq!(
            SyncFailure::from(Error::server_rejected("nope")),
            SyncFailure::Rejected("nope".to_string())
        );
        assert!(matches!(
            SyncFailure::from(Error::internal("x")),
            SyncFailure::Storage(_)
        ));
    }

    #[test]
    fn test_result_display_and_json() {
        let result = SyncResult::Skipped {
            reason: SkipReason::InFlight,
        };
        assert_eq!(result.to_string(), "skipped: another sync is in flight");

        let value = serde_json::to_value(SyncResult::Succeeded { count: 3 }).unwrap();
        assert_eq!(value, json!({"outcome": "succeeded", "count": 3}));

        let value = serde_json::to_value(SyncResult::Failed {
            error: SyncFailure::Status(502),
        })
        .unwrap();
        assert_eq!(
            value,
            json!({"outcome": "failed", "error": {"kind": "status", "detail": 502}})
        );
    }
}
