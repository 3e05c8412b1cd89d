//! Capture-time routing of attendance records.
//!
//! When the device is online a record goes straight to the server; when it
//! is offline the record is queued locally for the sync engine. A record is
//! never both sent and queued.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::client::{ServerClient, SyncClient, SyncResponse};
use crate::error::{Error, Result};
use crate::network::{NetworkMonitor, NetworkState};
use crate::record::{AttendanceRecord, StudentId};
use crate::storage::LocalStore;

/// Where a captured record went.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "route", rename_all = "snake_case")]
pub enum CaptureOutcome {
    /// Sent immediately and accepted by the server.
    Submitted {
        /// The server's answer.
        response: SyncResponse,
    },
    /// Queued locally for a later drain.
    Queued {
        /// Queue position assigned by the store.
        seq: i64,
    },
}

/// Routes captured records by connectivity.
#[derive(Debug, Clone)]
pub struct CaptureAdapter {
    store: Option<LocalStore>,
    client: Arc<dyn SyncClient>,
    network: NetworkMonitor,
}

impl CaptureAdapter {
    /// Create an adapter.
    ///
    /// `store` is `None` when the local store could not be opened; online
    /// capture still works but offline capture is refused.
    #[must_use]
    pub fn new(
        store: Option<LocalStore>,
        client: Arc<dyn SyncClient>,
        network: NetworkMonitor,
    ) -> Self {
        Self {
            store,
            client,
            network,
        }
    }

    /// Whether offline capture is possible.
    #[must_use]
    pub fn can_queue(&self) -> bool {
        self.store.is_some()
    }

    /// Route one record.
    ///
    /// # Errors
    ///
    /// Online: a transport failure or server refusal. Offline:
    /// [`Error::OfflineCaptureDisabled`] without a store, or a failed append.
    /// Either way the record has not been kept and the caller must retry.
    pub async fn record(&self, record: AttendanceRecord) -> Result<CaptureOutcome> {
        match self.network.current_state() {
            NetworkState::Online => {
                let response = self.client.submit_one(&record).await?.into_result()?;
                info!("Attendance submitted");
                Ok(CaptureOutcome::Submitted { response })
            }
            NetworkState::Offline => {
                let Some(store) = self.store.clone() else {
                    warn!("Offline with no local store; record not kept");
                    return Err(Error::OfflineCaptureDisabled);
                };
                let record = record.offline(true);
                let seq = tokio::task::spawn_blocking(move || store.append(&record))
                    .await
                    .map_err(|e| Error::internal(format!("append task failed: {e}")))??;
                info!(seq, "Attendance queued for sync");
                Ok(CaptureOutcome::Queued { seq })
            }
        }
    }
}

/// Look up the signed-in student, treating any failure as unknown.
pub async fn resolve_student_id(client: &ServerClient) -> Option<StudentId> {
    match client.student_id().await {
        Ok(id) => id,
        Err(e) => {
            debug!(error = %e, "Could not resolve student id");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record() -> AttendanceRecord {
        AttendanceRecord::new(
            Some(StudentId::Numeric(42)),
            AttendanceRecord::encode_image("image/jpeg", b"face"),
            None,
        )
        .unwrap()
    }

    fn client_for(server: &MockServer) -> ServerClient {
        ServerClient::new(ServerConfig {
            base_url: server.uri(),
            request_timeout_secs: 2,
            ..ServerConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_online_submits_and_does_not_queue() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/verify-face"))
            .and(body_partial_json(json!({"is_offline": false, "student_id": 42})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .expect(1)
            .mount(&server)
            .await;

        let store = LocalStore::open_in_memory().unwrap();
        let network = NetworkMonitor::new();
        network.observe(NetworkState::Online);
        let adapter =
            CaptureAdapter::new(Some(store.clone()), Arc::new(client_for(&server)), network);

        let outcome = adapter.record(record()).await.unwrap();
        assert!(matches!(outcome, CaptureOutcome::Submitted { .. }));
        assert_eq!(store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_offline_queues_without_sending() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .expect(0)
            .mount(&server)
            .await;

        let store = LocalStore::open_in_memory().unwrap();
        let adapter = CaptureAdapter::new(
            Some(store.clone()),
            Arc::new(client_for(&server)),
            NetworkMonitor::new(),
        );

        let outcome = adapter.record(record()).await.unwrap();
        assert!(matches!(outcome, CaptureOutcome::Queued { .. }));

        let queued = store.read_all().unwrap();
        assert_eq!(queued.len(), 1);
        assert!(queued[0].is_offline);
    }

    #[tokio::test]
    async fn test_online_refusal_is_an_error_and_not_queued() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"success": false, "error": "face not recognised"})),
            )
            .mount(&server)
            .await;

        let store = LocalStore::open_in_memory().unwrap();
        let network = NetworkMonitor::new();
        network.observe(NetworkState::Online);
        let adapter =
            CaptureAdapter::new(Some(store.clone()), Arc::new(client_for(&server)), network);

        let err = adapter.record(record()).await.unwrap_err();
        assert!(err.to_string().contains("face not recognised"));
        assert_eq!(store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_offline_without_store_is_unavailable() {
        let server = MockServer::start().await;
        let adapter =
            CaptureAdapter::new(None, Arc::new(client_for(&server)), NetworkMonitor::new());
        assert!(!adapter.can_queue());

        let err = adapter.record(record()).await.unwrap_err();
        assert!(matches!(err, Error::OfflineCaptureDisabled));
        assert!(err.is_storage_unavailable());
        assert_eq!(
            err.to_string(),
            "offline capture is disabled: the local store could not be opened"
        );
    }

    #[tokio::test]
    async fn test_online_without_store_still_submits() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .expect(1)
            .mount(&server)
            .await;

        let network = NetworkMonitor::new();
        network.observe(NetworkState::Online);
        let adapter = CaptureAdapter::new(None, Arc::new(client_for(&server)), network);
        assert!(adapter.record(record()).await.is_ok());
    }

    #[tokio::test]
    async fn test_resolve_student_id_failure_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/get-student-id"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        assert_eq!(resolve_student_id(&client_for(&server)).await, None);
    }

    #[tokio::test]
    async fn test_resolve_student_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/get-student-id"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"student_id": 7})))
            .mount(&server)
            .await;

        assert_eq!(
            resolve_student_id(&client_for(&server)).await,
            Some(StudentId::Numeric(7))
        );
    }
}
