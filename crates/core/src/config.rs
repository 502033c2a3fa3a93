use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u64(profile: &str, key: &str) -> Option<u64> {
    profiled_env_opt(profile, key).and_then(|v| v.parse().ok())
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub worker: WorkerConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `CONDUIT_PROFILE` env var. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("CONDUIT_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            worker: WorkerConfig::from_env_profiled(p),
            logging: LoggingConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  manifest:    {}", self.worker.manifest_path.display());
        tracing::info!(
            "  overrides:   workers={:?}, pass_interval_ms={:?}, detect_interval_secs={:?}",
            self.worker.worker_threads,
            self.worker.pass_interval_ms,
            self.worker.change_detection_interval_secs,
        );
        tracing::info!("  logging:     filter={}", self.logging.filter);
    }
}

// ── Worker ────────────────────────────────────────────────────

/// Process-level settings. The numeric fields are optional overrides that
/// win over whatever the manifest's `[scheduler]` table says.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub manifest_path: PathBuf,
    pub worker_threads: Option<u64>,
    pub pass_interval_ms: Option<u64>,
    pub change_detection_interval_secs: Option<u64>,
    pub shutdown_timeout_ms: Option<u64>,
}

impl WorkerConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            manifest_path: PathBuf::from(profiled_env_or(p, "CONDUIT_MANIFEST", "config/connectors.toml")),
            worker_threads: profiled_env_u64(p, "CONDUIT_WORKERS"),
            pass_interval_ms: profiled_env_u64(p, "CONDUIT_PASS_INTERVAL_MS"),
            change_detection_interval_secs: profiled_env_u64(p, "CONDUIT_DETECT_INTERVAL_SECS"),
            shutdown_timeout_ms: profiled_env_u64(p, "CONDUIT_SHUTDOWN_TIMEOUT_MS"),
        }
    }
}

// ── Logging ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
}

impl LoggingConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            filter: profiled_env_or(p, "CONDUIT_LOG", "info"),
        }
    }
}
