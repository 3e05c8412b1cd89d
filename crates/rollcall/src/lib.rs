//! `rollcall` - offline-first attendance capture and sync
//!
//! Attendance records captured while offline are queued in a durable local
//! store and delivered to the server in batches once connectivity returns.
//! Records leave the queue only after the server confirms them.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod capture;
pub mod cli;
pub mod client;
pub mod config;
pub mod daemon;
pub mod error;
pub mod logging;
pub mod network;
pub mod record;
pub mod storage;
pub mod sync;
pub mod trigger;

pub use capture::{CaptureAdapter, CaptureOutcome};
pub use client::{MonthlyStats, ServerClient, SyncClient, SyncResponse};
pub use config::Config;
pub use daemon::Daemon;
pub use error::{Error, Result};
pub use logging::init_logging;
pub use network::{ConnectivityProbe, NetworkMonitor, NetworkState};
pub use record::{AttendanceRecord, Location, StudentId};
pub use storage::{DrainLease, LocalStore, StoreStats, SyncBatch};
pub use sync::{SkipReason, SyncEngine, SyncFailure, SyncResult};
pub use trigger::{BackgroundTrigger, DeferredSync, SyncOutcome, TriggerSource};
