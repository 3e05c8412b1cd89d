//! Long-running sync service.
//!
//! [`Daemon`] owns one instance of every component, built from a
//! [`Config`]: the local store, the server client, the network monitor with
//! its probe, the sync engine and the background trigger.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::client::ServerClient;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::network::{probe_from_config, ConnectivityProbe, NetworkMonitor, NetworkState};
use crate::storage::LocalStore;
use crate::sync::{SyncEngine, SyncResult};
use crate::trigger::{BackgroundTrigger, DeferredSync, SyncOutcome, TriggerHandle};

/// All sync components wired together.
#[derive(Debug)]
pub struct Daemon {
    engine: SyncEngine,
    client: Arc<ServerClient>,
    deferred: DeferredSync,
    probe: Arc<dyn ConnectivityProbe>,
    poll_interval: Duration,
    trigger: BackgroundTrigger,
}

impl Daemon {
    /// Build every component from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageUnavailable`] if the store cannot be opened,
    /// or an error if the HTTP client or probe cannot be built.
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = LocalStore::open(config.database_path())?;
        let client = Arc::new(ServerClient::new(config.server.clone())?);
        let network = NetworkMonitor::new();
        let engine = SyncEngine::new(
            store.clone(),
            client.clone(),
            network,
            config.request_timeout(),
        );
        let deferred = DeferredSync::new(store, config.sync.sync_tag.clone());
        let trigger = BackgroundTrigger::new(
            engine.clone(),
            deferred.clone(),
            config.periodic_interval(),
        );

        Ok(Self {
            engine,
            client,
            deferred,
            probe: probe_from_config(config)?,
            poll_interval: config.poll_interval(),
            trigger,
        })
    }

    /// Replace the connectivity probe.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// The sync engine.
    #[must_use]
    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    /// The local store.
    #[must_use]
    pub fn store(&self) -> &LocalStore {
        self.engine.store()
    }

    /// The network monitor.
    #[must_use]
    pub fn network(&self) -> &NetworkMonitor {
        self.engine.network()
    }

    /// The server client.
    #[must_use]
    pub fn client(&self) -> &Arc<ServerClient> {
        &self.client
    }

    /// The deferred-sync registration.
    #[must_use]
    pub fn deferred(&self) -> &DeferredSync {
        &self.deferred
    }

    /// A handle for requesting drains while running.
    #[must_use]
    pub fn trigger_handle(&self) -> TriggerHandle {
        self.trigger.handle()
    }

    /// Subscribe to drain outcomes.
    #[must_use]
    pub fn outcomes(&self) -> broadcast::Receiver<SyncOutcome> {
        self.trigger.outcomes()
    }

    /// Probe once and record the result.
    pub async fn probe_once(&self) -> NetworkState {
        let state = self.probe.probe().await;
        self.network().observe(state);
        state
    }

    /// Run the monitor and trigger until `shutdown` flips to `true`.
    ///
    /// # Errors
    ///
    /// Returns an error if a component task panics.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let Self {
            engine,
            probe,
            poll_interval,
            trigger,
            ..
        } = self;

        let network = engine.network().clone();
        network.connect_trigger(trigger.handle());

        info!(
            probe = probe.name(),
            database = %engine.store().path().display(),
            "Sync service started"
        );

        let mut outcomes = trigger.outcomes();
        let reporter = tokio::spawn(async move {
            loop {
                match outcomes.recv().await {
                    Ok(outcome) => report(&outcome),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Outcome reporter lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let monitor = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { network.run(probe, poll_interval, shutdown).await })
        };

        trigger.run(shutdown).await;
        monitor
            .await
            .map_err(|e| Error::internal(format!("network monitor task failed: {e}")))?;
        reporter
            .await
            .map_err(|e| Error::internal(format!("outcome reporter task failed: {e}")))?;

        info!("Sync service stopped");
        Ok(())
    }
}

fn report(outcome: &SyncOutcome) {
    let source = outcome.source;
    match &outcome.result {
        SyncResult::Succeeded { count } => info!(%source, count, "Synced pending records"),
        SyncResult::Failed { error } => warn!(%source, %error, "Sync failed; will retry"),
        SyncResult::Skipped { reason } => debug!(%source, %reason, "Sync skipped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ManualProbe;
    use crate::record::AttendanceRecord;
    use crate::trigger::TriggerSource;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer, dir: &tempfile::TempDir) -> Config {
        let mut config = Config::default();
        config.storage.database_path = Some(dir.path().join("pending.db"));
        config.server.base_url = server.uri();
        config.network.poll_interval_ms = 20;
        config.sync.periodic_interval_secs = 0;
        config
    }

    #[tokio::test]
    async fn test_from_config_opens_store() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let daemon = Daemon::from_config(&config_for(&server, &dir)).unwrap();

        assert!(daemon.store().path().ends_with("pending.db"));
        assert_eq!(daemon.network().current_state(), NetworkState::Offline);
        assert_eq!(daemon.deferred().tag(), "sync-attendance");
    }

    #[tokio::test]
    async fn test_probe_once_updates_monitor() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let probe = ManualProbe::new(NetworkState::Online);
        let daemon = Daemon::from_config(&config_for(&server, &dir))
            .unwrap()
            .with_probe(Arc::new(probe));

        assert_eq!(daemon.probe_once().await, NetworkState::Online);
        assert!(daemon.network().is_online());
    }

    #[tokio::test]
    async fn test_run_drains_when_probe_goes_online() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/sync-attendance"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let probe = ManualProbe::new(NetworkState::Offline);
        let daemon = Daemon::from_config(&config_for(&server, &dir))
            .unwrap()
            .with_probe(Arc::new(probe.clone()));

        let record = AttendanceRecord::new(
            None,
            AttendanceRecord::encode_image("image/jpeg", b"x"),
            None,
        )
        .unwrap()
        .offline(true);
        daemon.store().append(&record).unwrap();

        let store = daemon.store().clone();
        let mut outcomes = daemon.outcomes();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(daemon.run(stop_rx));

        probe.set(NetworkState::Online);
        let outcome = tokio::time::timeout(Duration::from_secs(5), outcomes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.source, TriggerSource::NetworkOnline);
        assert_eq!(outcome.result, SyncResult::Succeeded { count: 1 });
        assert_eq!(store.count().unwrap(), 0);

        stop_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }
}
