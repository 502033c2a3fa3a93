//! traversal-worker: runs the traversal scheduler over a connector manifest.
//!
//! The manifest is a TOML file with an optional `[scheduler]` table and one
//! `[[connector]]` entry per connector:
//!
//! ```toml
//! [scheduler]
//! worker_threads = 4
//!
//! [[connector]]
//! name = "demo"
//! type = "synthetic"
//! schedule = "demo:600:5000:0-24"
//! params = { total = "10000", page_size = "250" }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use tracing::{info, warn};

use conduit_core::{BatchResult, Config, ConnectorConfig};
use conduit_scheduler::{
    BatchResultRecorder, ChangeDetector, ConnectorManager, ConnectorTypeRegistry, InMemoryStore,
    SchedulerConfig, SchedulerContext, SyntheticType, TraversalScheduler,
};

// ── CLI ─────────────────────────────────────────────────────────────

/// Traversal worker: schedules batched connector traversals.
#[derive(Parser, Debug)]
#[command(name = "traversal-worker", version, about)]
struct Cli {
    /// Path to the connector manifest (defaults to CONDUIT_MANIFEST).
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Run a single scheduling pass, wait for its batches and exit.
    #[arg(long)]
    once: bool,

    /// Log filter directive, e.g. `info,conduit_scheduler=debug`.
    #[arg(long, env = "RUST_LOG")]
    log: Option<String>,
}

// ── Manifest ────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct Manifest {
    #[serde(default)]
    scheduler: SchedulerConfig,
    #[serde(default, rename = "connector")]
    connectors: Vec<ConnectorEntry>,
}

#[derive(Debug, Deserialize)]
struct ConnectorEntry {
    name: String,
    #[serde(rename = "type")]
    connector_type: String,
    schedule: Option<String>,
    #[serde(default)]
    params: BTreeMap<String, String>,
}

impl Manifest {
    fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            warn!(path = %path.display(), "manifest not found, starting with no connectors");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading manifest {}", path.display()))?;
        let manifest: Self =
            toml::from_str(&raw).with_context(|| format!("parsing manifest {}", path.display()))?;
        info!(path = %path.display(), connectors = manifest.connectors.len(), "loaded manifest");
        Ok(manifest)
    }

    /// Env settings win over the manifest's `[scheduler]` table.
    fn apply_overrides(&mut self, config: &Config) {
        let worker = &config.worker;
        if let Some(n) = worker.worker_threads {
            self.scheduler.worker_threads = n as usize;
        }
        if let Some(ms) = worker.pass_interval_ms {
            self.scheduler.pass_interval_ms = ms;
        }
        if let Some(secs) = worker.change_detection_interval_secs {
            self.scheduler.change_detection_interval_secs = secs;
        }
        if let Some(ms) = worker.shutdown_timeout_ms {
            self.scheduler.shutdown_timeout_ms = ms;
        }
    }
}

// ── Result sink ─────────────────────────────────────────────────────

struct LogSink;

impl BatchResultRecorder for LogSink {
    fn record_result(&self, connector: &str, result: &BatchResult) {
        info!(
            connector,
            count = result.count,
            policy = ?result.policy,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "batch finished"
        );
    }
}

fn wait_idle(manager: &ConnectorManager, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if manager.coordinators().iter().all(|c| !c.is_running()) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    conduit_core::config::load_dotenv();
    let cli = Cli::parse();
    let config = Config::from_env();

    let filter = cli.log.as_deref().unwrap_or(&config.logging.filter);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(filter)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    config.log_summary();

    let manifest_path = cli
        .manifest
        .clone()
        .unwrap_or_else(|| config.worker.manifest_path.clone());
    let mut manifest = Manifest::load(&manifest_path)?;
    manifest.apply_overrides(&config);

    let types = ConnectorTypeRegistry::new().with(Arc::new(SyntheticType));
    let store = Arc::new(InMemoryStore::new());
    let ctx = SchedulerContext::new(manifest.scheduler.clone(), store.clone(), types)?;
    let manager = Arc::new(ConnectorManager::new(Arc::clone(&ctx)));

    for entry in &manifest.connectors {
        let connector = ConnectorConfig {
            connector_type: entry.connector_type.clone(),
            params: entry.params.clone(),
        };
        manager
            .set_connector_config(&entry.name, connector)
            .with_context(|| format!("configuring connector {}", entry.name))?;
        if let Some(schedule) = &entry.schedule {
            manager
                .set_connector_schedule(&entry.name, schedule)
                .with_context(|| format!("scheduling connector {}", entry.name))?;
        }
    }

    let detector = Arc::new(ChangeDetector::new(store, manager.clone()));
    detector.detect_changes()?;

    let scheduler = Arc::new(TraversalScheduler::new(manager.clone(), Arc::new(LogSink)));
    info!(
        connectors = manager.connector_names().len(),
        workers = ctx.pool.worker_count(),
        "traversal-worker starting"
    );

    if cli.once {
        let started = scheduler.run_pass();
        info!(started, "single pass submitted");
        if !wait_idle(&manager, ctx.config.shutdown_timeout()) {
            warn!("batches still running after shutdown timeout");
        }
        scheduler.shutdown();
        return Ok(());
    }

    let stop = scheduler.stop_token();
    let detector_thread =
        Arc::clone(&detector).spawn_periodic(ctx.config.change_detection_interval(), stop)?;
    let loop_thread = Arc::clone(&scheduler).spawn()?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    let drained = scheduler.shutdown();
    tokio::task::spawn_blocking(move || {
        let loop_ok = loop_thread.join().is_ok();
        let detector_ok = detector_thread.join().is_ok();
        loop_ok && detector_ok
    })
    .await?
    .then_some(())
    .context("background thread panicked")?;

    if drained {
        info!("traversal-worker exited cleanly");
    } else {
        warn!("traversal-worker exited with batches still running");
    }
    Ok(())
}
