//! `rollcall` - CLI for offline-first attendance capture
//!
//! This binary records attendance, inspects the pending queue, and runs the
//! background sync service.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use rollcall::capture::{resolve_student_id, CaptureAdapter, CaptureOutcome};
use rollcall::cli::{
    Cli, Command, ConfigCommand, MarkCommand, OutputFormat, PendingCommand, SyncCommand,
};
use rollcall::network::probe_from_config;
use rollcall::{
    init_logging, AttendanceRecord, Config, Daemon, DeferredSync, LocalStore, Location,
    NetworkMonitor, NetworkState, ServerClient, StudentId, SyncResult,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbosity());

    let config = Config::load_from(cli.config.clone())?;

    match cli.command {
        Command::Run => handle_run(&config).await,
        Command::Mark(cmd) => handle_mark(&config, cmd).await,
        Command::Sync(cmd) => handle_sync(&config, &cmd).await,
        Command::Pending(cmd) => handle_pending(&config, &cmd),
        Command::Status(cmd) => handle_status(&config, cmd.json).await,
        Command::Config(cmd) => handle_config(&config, cmd),
    }
}

async fn handle_run(config: &Config) -> anyhow::Result<()> {
    let daemon = Daemon::from_config(config)?;
    let (stop_tx, stop_rx) = watch::channel(false);

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Could not listen for Ctrl-C");
            return;
        }
        info!("Shutting down");
        let _ = stop_tx.send(true);
    });

    daemon.run(stop_rx).await?;
    Ok(())
}

async fn handle_mark(config: &Config, cmd: MarkCommand) -> anyhow::Result<()> {
    let bytes = std::fs::read(&cmd.image)
        .with_context(|| format!("failed to read image {}", cmd.image.display()))?;
    let image = AttendanceRecord::encode_image(image_mime(&cmd.image)?, &bytes);
    let location = match (cmd.lat, cmd.lon) {
        (Some(lat), Some(lon)) => Some(Location::new(lat, lon)?),
        _ => None,
    };

    let store = match LocalStore::open(config.database_path()) {
        Ok(store) => Some(store),
        Err(e) if e.is_storage_unavailable() => {
            warn!(error = %e, "Offline capture unavailable");
            None
        }
        Err(e) => return Err(e.into()),
    };

    let client = Arc::new(ServerClient::new(config.server.clone())?);
    let network = NetworkMonitor::new();
    if !cmd.offline {
        let probe = probe_from_config(config)?;
        network.observe(probe.probe().await);
    }

    let student_id = match cmd.student_id.as_deref() {
        Some(raw) => Some(StudentId::parse(raw)),
        None if network.is_online() => resolve_student_id(&client).await,
        None => None,
    };

    let record = AttendanceRecord::new(student_id, image, location)?;
    let adapter = CaptureAdapter::new(store, client, network);
    let outcome = match adapter.record(record).await {
        Ok(outcome) => outcome,
        Err(e) if e.is_transient() => {
            bail!("{e}\nThe record was not kept; retry, or pass --offline to queue it.")
        }
        Err(e) => return Err(e.into()),
    };

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        match outcome {
            CaptureOutcome::Submitted { .. } => println!("Attendance marked."),
            CaptureOutcome::Queued { seq } => {
                println!("Offline: attendance queued (#{seq}); it will sync when back online.");
            }
        }
    }
    Ok(())
}

fn image_mime(path: &Path) -> anyhow::Result<&'static str> {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    Ok(match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => bail!("unsupported image type: {}", path.display()),
    })
}

async fn handle_sync(config: &Config, cmd: &SyncCommand) -> anyhow::Result<()> {
    if cmd.defer {
        let store = LocalStore::open(config.database_path())?;
        let token = DeferredSync::new(store, config.sync.sync_tag.clone()).request()?;
        if cmd.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "deferred": true,
                    "tag": config.sync.sync_tag,
                    "requested_at": token,
                }))?
            );
        } else {
            println!(
                "Deferred sync requested; `rollcall run` honours it at startup or on SIGUSR1."
            );
        }
        return Ok(());
    }

    let daemon = Daemon::from_config(config)?;
    daemon.probe_once().await;
    let result = daemon.engine().drain().await;

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("Sync {result}");
    }
    if let SyncResult::Failed { error } = result {
        bail!("sync failed: {error}");
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct PendingRow {
    timestamp: String,
    student_id: Option<StudentId>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    image_bytes: usize,
}

impl From<&AttendanceRecord> for PendingRow {
    fn from(record: &AttendanceRecord) -> Self {
        Self {
            timestamp: record.timestamp_string(),
            student_id: record.student_id.clone(),
            latitude: record.location.map(|l| l.latitude),
            longitude: record.location.map(|l| l.longitude),
            image_bytes: record.image_len(),
        }
    }
}

fn handle_pending(config: &Config, cmd: &PendingCommand) -> anyhow::Result<()> {
    let store = LocalStore::open(config.database_path())?;
    let records = store.read_all()?;
    let rows: Vec<PendingRow> = records
        .iter()
        .take(cmd.limit.unwrap_or(usize::MAX))
        .map(PendingRow::from)
        .collect();

    match cmd.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        OutputFormat::Plain => {
            for row in &rows {
                println!(
                    "{} student={} location={} image={}B",
                    row.timestamp,
                    display_student(row.student_id.as_ref()),
                    display_location(row.latitude, row.longitude),
                    row.image_bytes
                );
            }
        }
        OutputFormat::Table => {
            println!(
                "{:<26} {:<12} {:<24} {:>10}",
                "TIMESTAMP", "STUDENT", "LOCATION", "IMAGE"
            );
            for row in &rows {
                println!(
                    "{:<26} {:<12} {:<24} {:>10}",
                    row.timestamp,
                    display_student(row.student_id.as_ref()),
                    display_location(row.latitude, row.longitude),
                    row.image_bytes
                );
            }
            println!();
            println!("{} of {} pending record(s)", rows.len(), records.len());
        }
    }
    Ok(())
}

fn display_student(id: Option<&StudentId>) -> String {
    id.map_or_else(|| "-".to_string(), ToString::to_string)
}

fn display_location(lat: Option<f64>, lon: Option<f64>) -> String {
    match (lat, lon) {
        (Some(lat), Some(lon)) => format!("{lat:.5},{lon:.5}"),
        _ => "-".to_string(),
    }
}

async fn handle_status(config: &Config, json: bool) -> anyhow::Result<()> {
    let daemon = Daemon::from_config(config)?;
    let network = daemon.probe_once().await;
    let stats = daemon.store().stats()?;
    let registered = daemon.deferred().is_registered()?;
    let requested = daemon.deferred().is_requested()?;
    let monthly = if network == NetworkState::Online {
        match daemon.client().monthly_stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(error = %e, "Could not fetch monthly stats");
                None
            }
        }
    } else {
        None
    };

    if json {
        let status = serde_json::json!({
            "platform": platform_name(),
            "network": network,
            "server": config.server.base_url,
            "database_path": daemon.store().path(),
            "pending": stats.pending,
            "oldest_pending": stats.oldest_pending,
            "newest_pending": stats.newest_pending,
            "db_size_bytes": stats.db_size_bytes,
            "sync_tag": daemon.deferred().tag(),
            "registered": registered,
            "deferred_requested": requested,
            "monthly": monthly,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("rollcall status");
        println!("---------------");
        println!("Platform:      {}", platform_name());
        println!("Network:       {network}");
        println!("Server:        {}", config.server.base_url);
        println!("Database:      {}", daemon.store().path().display());
        println!("Pending:       {}", stats.pending);
        if let Some(oldest) = stats.oldest_pending {
            println!("Oldest:        {}", oldest.to_rfc3339());
        }
        println!("Sync tag:      {}", daemon.deferred().tag());
        println!(
            "Deferred:      {}",
            match (registered, requested) {
                (_, true) => "requested",
                (true, false) => "registered",
                (false, false) => "not registered",
            }
        );
        match monthly {
            Some(m) => println!(
                "This month:    {}% ({} present, {} absent)",
                m.percentage, m.present_days, m.absent_days
            ),
            None => println!("This month:    unavailable"),
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn platform_name() -> &'static str {
    rollcall_linux::platform_name()
}

#[cfg(not(target_os = "linux"))]
fn platform_name() -> &'static str {
    std::env::consts::OS
}

fn handle_config(config: &Config, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Storage]");
                println!("  Database path:      {}", config.database_path().display());
                println!();
                println!("[Server]");
                println!("  Base URL:           {}", config.server.base_url);
                println!("  Sync endpoint:      {}", config.server.sync_path);
                println!("  Submit endpoint:    {}", config.server.submit_path);
                println!(
                    "  Request timeout:    {}s",
                    config.server.request_timeout_secs
                );
                println!();
                println!("[Network]");
                println!("  Probe:              {:?}", config.network.probe);
                println!("  Poll interval:      {}ms", config.network.poll_interval_ms);
                println!();
                println!("[Sync]");
                match config.periodic_interval() {
                    Some(period) => println!("  Periodic interval:  {}s", period.as_secs()),
                    None => println!("  Periodic interval:  disabled"),
                }
                println!("  Sync tag:           {}", config.sync.sync_tag);
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => {
            let path = file.unwrap_or_else(Config::default_config_path);
            println!("Validating configuration: {}", path.display());
            match Config::load_from(Some(path)) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => bail!("configuration error: {e}"),
            }
        }
    }
    Ok(())
}
