//! Connectivity monitoring.
//!
//! [`NetworkMonitor`] keeps the current online/offline classification,
//! publishes one event per transition, and asks the background trigger for a
//! drain each time the device comes back online. Where the classification
//! comes from is pluggable through [`ConnectivityProbe`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::{Config, ProbeKind};
use crate::error::Result;
use crate::trigger::{TriggerHandle, TriggerSource};

/// Capacity of the transition event channel.
const EVENT_CAPACITY: usize = 64;

/// Connectivity classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkState {
    /// The server is believed reachable.
    Online,
    /// The server is believed unreachable.
    Offline,
}

impl std::fmt::Display for NetworkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// A best-effort source of connectivity information.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync + std::fmt::Debug {
    /// The name of this probe (for logging/debugging).
    fn name(&self) -> &'static str;

    /// Classify connectivity right now.
    async fn probe(&self) -> NetworkState;
}

/// Probe that considers the device online when the server answers at all.
///
/// Any HTTP response, including an error status, proves the server is
/// reachable.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    url: String,
    client: reqwest::Client,
}

impl HttpProbe {
    /// Create a probe against the given URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn probe(&self) -> NetworkState {
        match self.client.head(&self.url).send().await {
            Ok(resp) => {
                trace!(status = resp.status().as_u16(), "Probe reached server");
                NetworkState::Online
            }
            Err(e) => {
                trace!(error = %e, "Probe could not reach server");
                NetworkState::Offline
            }
        }
    }
}

/// Probe whose answer is set by the embedding application.
///
/// Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct ManualProbe {
    online: Arc<AtomicBool>,
}

impl ManualProbe {
    /// Create a probe reporting the given initial state.
    #[must_use]
    pub fn new(state: NetworkState) -> Self {
        let probe = Self::default();
        probe.set(state);
        probe
    }

    /// Change the reported state.
    pub fn set(&self, state: NetworkState) {
        self.online
            .store(state == NetworkState::Online, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectivityProbe for ManualProbe {
    fn name(&self) -> &'static str {
        "manual"
    }

    async fn probe(&self) -> NetworkState {
        if self.online.load(Ordering::SeqCst) {
            NetworkState::Online
        } else {
            NetworkState::Offline
        }
    }
}

/// Probe that reports online while any network interface has link.
#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkProbe;

#[cfg(target_os = "linux")]
#[async_trait]
impl ConnectivityProbe for LinkProbe {
    fn name(&self) -> &'static str {
        "link"
    }

    async fn probe(&self) -> NetworkState {
        if rollcall_linux::has_active_link() {
            NetworkState::Online
        } else {
            NetworkState::Offline
        }
    }
}

/// Build the probe selected in the configuration.
///
/// # Errors
///
/// Returns an error if the probe is unsupported on this platform or its
/// HTTP client cannot be built.
pub fn probe_from_config(config: &Config) -> Result<Arc<dyn ConnectivityProbe>> {
    match config.network.probe {
        ProbeKind::Http => Ok(Arc::new(HttpProbe::new(
            config.server.base_url.clone(),
            config.probe_timeout(),
        )?)),
        ProbeKind::Manual => Ok(Arc::new(ManualProbe::new(NetworkState::Online))),
        #[cfg(target_os = "linux")]
        ProbeKind::Link => Ok(Arc::new(LinkProbe)),
        #[cfg(not(target_os = "linux"))]
        ProbeKind::Link => Err(crate::error::Error::ConfigValidation {
            message: "the link probe is only available on Linux".to_string(),
        }),
    }
}

#[derive(Debug)]
struct MonitorInner {
    state: Mutex<NetworkState>,
    events: broadcast::Sender<NetworkState>,
    trigger: Mutex<Option<TriggerHandle>>,
    transitions: AtomicU64,
}

/// Tracks online/offline transitions.
///
/// This is a lightweight, cloneable handle; clones observe and publish the
/// same state. The monitor starts `Offline` so nothing is sent until
/// connectivity has been observed.
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    inner: Arc<MonitorInner>,
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkMonitor {
    /// Create a monitor in the `Offline` state.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(MonitorInner {
                state: Mutex::new(NetworkState::Offline),
                events,
                trigger: Mutex::new(None),
                transitions: AtomicU64::new(0),
            }),
        }
    }

    /// The present classification.
    #[must_use]
    pub fn current_state(&self) -> NetworkState {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the monitor currently reports `Online`.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.current_state() == NetworkState::Online
    }

    /// Number of transitions observed since creation.
    #[must_use]
    pub fn transition_count(&self) -> u64 {
        self.inner.transitions.load(Ordering::SeqCst)
    }

    /// Subscribe to transitions that happen from now on.
    #[must_use]
    pub fn subscribe(&self) -> NetworkEvents {
        NetworkEvents {
            rx: self.inner.events.subscribe(),
            last: None,
        }
    }

    /// Route a drain request to `trigger` on every transition to `Online`.
    pub fn connect_trigger(&self, trigger: TriggerHandle) {
        *self
            .inner
            .trigger
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(trigger);
    }

    /// Record an observation. Returns `true` if it was a transition.
    pub fn observe(&self, observed: NetworkState) -> bool {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *state == observed {
            return false;
        }
        *state = observed;
        self.inner.transitions.fetch_add(1, Ordering::SeqCst);

        // Publish while holding the lock so subscribers see transitions in order.
        let _ = self.inner.events.send(observed);
        info!(state = %observed, "Network state changed");

        if observed == NetworkState::Online {
            let trigger = self
                .inner
                .trigger
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(trigger) = trigger.as_ref() {
                if !trigger.request(TriggerSource::NetworkOnline) {
                    warn!("Background trigger is gone; online drain not requested");
                }
            }
        }
        true
    }

    /// Poll `probe` every `period` until `shutdown` flips to `true`.
    pub async fn run(
        &self,
        probe: Arc<dyn ConnectivityProbe>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!(
            probe = probe.name(),
            interval_ms = period.as_millis(),
            "Starting network monitor"
        );

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let state = probe.probe().await;
                    self.observe(state);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("Network monitor stopped");
    }
}

/// Stream of network transitions for one subscriber.
#[derive(Debug)]
pub struct NetworkEvents {
    rx: broadcast::Receiver<NetworkState>,
    last: Option<NetworkState>,
}

impl NetworkEvents {
    /// Wait for the next transition.
    ///
    /// A subscriber that falls behind loses the oldest transitions; it
    /// resumes from the retained ones and never sees the same state twice in
    /// a row. Returns `None` once every monitor handle has been dropped.
    pub async fn next(&mut self) -> Option<NetworkState> {
        loop {
            match self.rx.recv().await {
                Ok(state) if self.last == Some(state) => {}
                Ok(state) => {
                    self.last = Some(state);
                    return Some(state);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Network event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_network_state_display() {
        assert_eq!(NetworkState::Online.to_string(), "online");
        assert_eq!(NetworkState::Offline.to_string(), "offline");
    }

    #[test]
    fn test_starts_offline() {
        let monitor = NetworkMonitor::new();
        assert_eq!(monitor.current_state(), NetworkState::Offline);
        assert!(!monitor.is_online());
        assert_eq!(monitor.transition_count(), 0);
    }

    #[test]
    fn test_observe_reports_transitions_only() {
        let monitor = NetworkMonitor::new();
        assert!(!monitor.observe(NetworkState::Offline));
        assert!(monitor.observe(NetworkState::Online));
        assert!(!monitor.observe(NetworkState::Online));
        assert!(monitor.observe(NetworkState::Offline));
        assert_eq!(monitor.transition_count(), 2);
    }

    #[test]
    fn test_clones_share_state() {
        let a = NetworkMonitor::new();
        let b = a.clone();
        a.observe(NetworkState::Online);
        assert!(b.is_online());
    }

    #[tokio::test]
    async fn test_events_have_no_consecutive_duplicates() {
        let monitor = NetworkMonitor::new();
        let mut events = monitor.subscribe();

        for state in [
            NetworkState::Online,
            NetworkState::Online,
            NetworkState::Offline,
            NetworkState::Offline,
            NetworkState::Online,
        ] {
            monitor.observe(state);
        }
        drop(monitor);

        let mut seen = Vec::new();
        while let Some(state) = events.next().await {
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                NetworkState::Online,
                NetworkState::Offline,
                NetworkState::Online
            ]
        );
    }

    #[tokio::test]
    async fn test_lagging_subscriber_never_sees_repeats() {
        let monitor = NetworkMonitor::new();
        let mut events = monitor.subscribe();

        monitor.observe(NetworkState::Online);
        assert_eq!(events.next().await, Some(NetworkState::Online));

        // Overflow the buffer so the oldest retained event repeats `Online`.
        let mut state = NetworkState::Online;
        for _ in 0..=EVENT_CAPACITY {
            state = match state {
                NetworkState::Online => NetworkState::Offline,
                NetworkState::Offline => NetworkState::Online,
            };
            monitor.observe(state);
        }
        drop(monitor);

        let mut seen = vec![NetworkState::Online];
        while let Some(next) = events.next().await {
            seen.push(next);
        }
        assert_eq!(seen[1], NetworkState::Offline);
        assert!(seen.windows(2).all(|pair| pair[0] != pair[1]));
        assert_eq!(seen.last(), Some(&state));
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_only_new_events() {
        let monitor = NetworkMonitor::new();
        monitor.observe(NetworkState::Online);

        let mut events = monitor.subscribe();
        monitor.observe(NetworkState::Offline);
        assert_eq!(events.next().await, Some(NetworkState::Offline));
    }

    #[tokio::test]
    async fn test_one_drain_request_per_online_transition() {
        let monitor = NetworkMonitor::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        monitor.connect_trigger(TriggerHandle::from_sender(tx));

        monitor.observe(NetworkState::Online);
        monitor.observe(NetworkState::Online);
        monitor.observe(NetworkState::Offline);
        monitor.observe(NetworkState::Online);
        drop(monitor);

        let mut requests = Vec::new();
        while let Some(source) = rx.recv().await {
            requests.push(source);
        }
        assert_eq!(
            requests,
            vec![TriggerSource::NetworkOnline, TriggerSource::NetworkOnline]
        );
    }

    #[tokio::test]
    async fn test_manual_probe() {
        let probe = ManualProbe::new(NetworkState::Offline);
        assert_eq!(probe.probe().await, NetworkState::Offline);

        let shared = probe.clone();
        shared.set(NetworkState::Online);
        assert_eq!(probe.probe().await, NetworkState::Online);
    }

    #[tokio::test]
    async fn test_http_probe_online_for_any_status() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("HEAD"))
            .respond_with(wiremock::ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let probe = HttpProbe::new(server.uri(), Duration::from_secs(1)).unwrap();
        assert_eq!(probe.probe().await, NetworkState::Online);
    }

    #[tokio::test]
    async fn test_http_probe_offline_when_unreachable() {
        let server = wiremock::MockServer::start().await;
        let uri = server.uri();
        drop(server);

        let probe = HttpProbe::new(uri, Duration::from_millis(500)).unwrap();
        assert_eq!(probe.probe().await, NetworkState::Offline);
    }

    #[tokio::test]
    async fn test_run_follows_probe_until_shutdown() {
        let monitor = NetworkMonitor::new();
        let probe = ManualProbe::new(NetworkState::Online);
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut events = monitor.subscribe();

        let task = {
            let monitor = monitor.clone();
            let probe: Arc<dyn ConnectivityProbe> = Arc::new(probe.clone());
            tokio::spawn(async move {
                monitor
                    .run(probe, Duration::from_millis(10), stop_rx)
                    .await;
            })
        };

        assert_eq!(events.next().await, Some(NetworkState::Online));
        probe.set(NetworkState::Offline);
        assert_eq!(events.next().await, Some(NetworkState::Offline));

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[test]
    fn test_probe_from_config_manual() {
        let mut config = Config::default();
        config.network.probe = ProbeKind::Manual;
        let probe = probe_from_config(&config).unwrap();
        assert_eq!(probe.name(), "manual");
    }

    #[tokio::test]
    async fn test_probe_from_config_http() {
        let probe = probe_from_config(&Config::default()).unwrap();
        assert_eq!(probe.name(), "http");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_probe_from_config_link() {
        let mut config = Config::default();
        config.network.probe = ProbeKind::Link;
        assert_eq!(probe_from_config(&config).unwrap().name(), "link");
    }
}
