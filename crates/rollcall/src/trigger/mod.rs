//! Background sync triggering.
//!
//! [`BackgroundTrigger`] turns network recovery, a periodic timer, deferred
//! requests and explicit requests into calls to [`SyncEngine::drain`], and
//! publishes every outcome. Each drain is spawned on its own task, so a
//! trigger that fires while another drain is running is simply answered
//! with [`SkipReason::InFlight`](crate::sync::SkipReason::InFlight) by the
//! engine.

pub mod deferred;

pub use deferred::DeferredSync;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::sync::{SyncEngine, SyncResult};

/// Capacity of the outcome channel.
const OUTCOME_CAPACITY: usize = 32;

/// What caused a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// The network monitor saw a transition to `Online`.
    NetworkOnline,
    /// The periodic timer fired.
    Periodic,
    /// A durable deferred request was honoured.
    Deferred,
    /// Someone asked explicitly.
    Manual,
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NetworkOnline => write!(f, "network-online"),
            Self::Periodic => write!(f, "periodic"),
            Self::Deferred => write!(f, "deferred"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Result of one triggered drain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    /// What caused the drain.
    pub source: TriggerSource,
    /// What the drain did.
    pub result: SyncResult,
    /// When it finished.
    pub finished_at: DateTime<Utc>,
}

/// Sender side for drain requests.
#[derive(Debug, Clone)]
pub struct TriggerHandle {
    tx: mpsc::UnboundedSender<TriggerSource>,
}

impl TriggerHandle {
    pub(crate) fn from_sender(tx: mpsc::UnboundedSender<TriggerSource>) -> Self {
        Self { tx }
    }

    /// Ask for a drain. Returns `false` if the trigger has stopped.
    pub fn request(&self, source: TriggerSource) -> bool {
        self.tx.send(source).is_ok()
    }
}

/// Fans trigger events into drains.
#[derive(Debug)]
pub struct BackgroundTrigger {
    engine: SyncEngine,
    deferred: DeferredSync,
    periodic: Option<Duration>,
    requests_tx: mpsc::UnboundedSender<TriggerSource>,
    requests_rx: mpsc::UnboundedReceiver<TriggerSource>,
    outcomes: broadcast::Sender<SyncOutcome>,
}

impl BackgroundTrigger {
    /// Create a trigger. `periodic` of `None` disables the timer.
    #[must_use]
    pub fn new(engine: SyncEngine, deferred: DeferredSync, periodic: Option<Duration>) -> Self {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (outcomes, _) = broadcast::channel(OUTCOME_CAPACITY);
        Self {
            engine,
            deferred,
            periodic,
            requests_tx,
            requests_rx,
            outcomes,
        }
    }

    /// A handle for requesting drains, e.g. for the network monitor.
    #[must_use]
    pub fn handle(&self) -> TriggerHandle {
        TriggerHandle::from_sender(self.requests_tx.clone())
    }

    /// Subscribe to drain outcomes.
    #[must_use]
    pub fn outcomes(&self) -> broadcast::Receiver<SyncOutcome> {
        self.outcomes.subscribe()
    }

    /// Run until `shutdown` flips to `true`, then wait for running drains.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let Self {
            engine,
            deferred,
            periodic,
            requests_tx: _requests_tx,
            mut requests_rx,
            outcomes,
        } = self;
        let ctx = DrainContext {
            engine,
            deferred,
            outcomes,
        };

        if let Err(e) = ctx.deferred.ensure_registered() {
            warn!(error = %e, "Could not register deferred sync");
        }

        let mut drains = JoinSet::new();
        match ctx.deferred.is_requested() {
            Ok(true) => {
                info!(tag = ctx.deferred.tag(), "Honouring deferred sync request");
                ctx.spawn(&mut drains, TriggerSource::Deferred);
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Could not read deferred sync request"),
        }

        let mut ticker = periodic.map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });
        let mut user_signal = signal::install();

        debug!(
            periodic_secs = periodic.map(|p| p.as_secs()),
            "Background trigger started"
        );

        loop {
            tokio::select! {
                Some(source) = requests_rx.recv() => {
                    ctx.spawn(&mut drains, source);
                }
                () = next_tick(&mut ticker) => {
                    ctx.spawn(&mut drains, TriggerSource::Periodic);
                }
                () = signal::next(&mut user_signal) => {
                    info!("Deferred sync signalled");
                    ctx.spawn(&mut drains, TriggerSource::Deferred);
                }
                Some(joined) = drains.join_next(), if !drains.is_empty() => {
                    match joined {
                        Ok(true) => ctx.spawn(&mut drains, TriggerSource::Deferred),
                        Ok(false) => {}
                        Err(e) => warn!(error = %e, "Drain task failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        while drains.join_next().await.is_some() {}
        debug!("Background trigger stopped");
    }
}

#[derive(Debug, Clone)]
struct DrainContext {
    engine: SyncEngine,
    deferred: DeferredSync,
    outcomes: broadcast::Sender<SyncOutcome>,
}

impl DrainContext {
    /// Spawn one drain. The task yields `true` when a deferred request is
    /// still outstanding after a drain that emptied the queue.
    fn spawn(&self, drains: &mut JoinSet<bool>, source: TriggerSource) {
        let ctx = self.clone();
        drains.spawn(async move { ctx.drain(source).await });
    }

    async fn drain(self, source: TriggerSource) -> bool {
        self.restore_registration().await;
        let token = self.pending_request().await;
        let result = self.engine.drain().await;

        let mut still_requested = false;
        if result.queue_drained() {
            if let Some(token) = token.clone() {
                let deferred = self.deferred.clone();
                match tokio::task::spawn_blocking(move || deferred.acknowledge(&token)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!(error = %e, "Could not clear deferred sync request"),
                    Err(e) => warn!(error = %e, "Could not clear deferred sync request"),
                }
            }
            // Only a request newer than the one just handled warrants another pass.
            still_requested = matches!(
                self.pending_request().await,
                Some(current) if token.as_deref() != Some(current.as_str())
            );
        }

        debug!(%source, %result, "Triggered drain finished");
        let _ = self.outcomes.send(SyncOutcome {
            source,
            result,
            finished_at: Utc::now(),
        });
        still_requested
    }

    /// Re-register the sync tag if its registration has gone missing.
    async fn restore_registration(&self) {
        let deferred = self.deferred.clone();
        match tokio::task::spawn_blocking(move || deferred.ensure_registered()).await {
            Ok(Ok(true)) => info!(
                tag = self.deferred.tag(),
                "Deferred sync registration restored"
            ),
            Ok(Ok(false)) => {}
            Ok(Err(e)) => warn!(error = %e, "Deferred sync unregistered; running degraded"),
            Err(e) => warn!(error = %e, "Deferred sync unregistered; running degraded"),
        }
    }

    async fn pending_request(&self) -> Option<String> {
        let deferred = self.deferred.clone();
        match tokio::task::spawn_blocking(move || deferred.pending_request()).await {
            Ok(Ok(token)) => token,
            Ok(Err(e)) => {
                warn!(error = %e, "Could not read deferred sync request");
                None
            }
            Err(e) => {
                warn!(error = %e, "Could not read deferred sync request");
                None
            }
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
mod signal {
    use tokio::signal::unix::{signal, Signal, SignalKind};
    use tracing::warn;

    /// Listen for `SIGUSR1`, the out-of-process deferred sync request.
    pub(super) fn install() -> Option<Signal> {
        match signal(SignalKind::user_defined1()) {
            Ok(signal) => Some(signal),
            Err(e) => {
                warn!(error = %e, "Could not listen for SIGUSR1");
                None
            }
        }
    }

    pub(super) async fn next(signal: &mut Option<Signal>) {
        if let Some(signal) = signal {
            if signal.recv().await.is_some() {
                return;
            }
        }
        std::future::pending().await
    }
}

#[cfg(not(unix))]
mod signal {
    pub(super) fn install() -> Option<()> {
        None
    }

    pub(super) async fn next(_signal: &mut Option<()>) {
        std::future::pending().await
    }
}
