use std::path::PathBuf;
use std::time::Duration;
use warden_core::extractor::DEFAULT_EMBEDDING_DIM;
use warden_core::{PolicyError, StorePolicyTable, DEFAULT_MATCH_THRESHOLD};
use warden_engine::{EngineConfig, DEFAULT_EXPIRING_SOON_HOURS, DEFAULT_RETENTION_DAYS};

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    System,
    Session,
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Base URL of the vision-analysis service.
    pub vision_url: String,
    /// Per-request bound on the vision-analysis call.
    pub vision_timeout: Duration,
    /// Embedding length the vision service must return.
    pub embedding_dim: usize,
    /// Default cosine threshold for a watchlist match.
    pub match_threshold: f32,
    /// Default template retention in days.
    pub retention_days: u32,
    pub sweep_interval: Duration,
    pub expiring_soon_hours: i64,
    /// Keep unmatched identify captures as unidentified templates.
    pub retain_captures: bool,
    /// Optional TOML store-policy file.
    pub policy_path: Option<PathBuf>,
    pub bus: BusKind,
}

impl Config {
    /// Load configuration from `WARDEN_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("warden");

        let db_path = var("WARDEN_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("warden.db"));

        Self {
            db_path,
            vision_url: var("WARDEN_VISION_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8001".to_string()),
            vision_timeout: Duration::from_secs(parsed(&var, "WARDEN_VISION_TIMEOUT_SECS", 10)),
            embedding_dim: parsed(&var, "WARDEN_EMBEDDING_DIM", DEFAULT_EMBEDDING_DIM),
            match_threshold: parsed(&var, "WARDEN_MATCH_THRESHOLD", DEFAULT_MATCH_THRESHOLD),
            retention_days: parsed(&var, "WARDEN_RETENTION_DAYS", DEFAULT_RETENTION_DAYS),
            sweep_interval: Duration::from_secs(parsed(&var, "WARDEN_SWEEP_INTERVAL_SECS", 3600)),
            expiring_soon_hours: parsed(&var, "WARDEN_EXPIRING_SOON_HOURS", DEFAULT_EXPIRING_SOON_HOURS),
            retain_captures: var("WARDEN_RETAIN_CAPTURES")
                .map(|v| v != "0")
                .unwrap_or(false),
            policy_path: var("WARDEN_POLICY_PATH").map(PathBuf::from),
            bus: match var("WARDEN_BUS").as_deref() {
                Some("session") => BusKind::Session,
                _ => BusKind::System,
            },
        }
    }

    /// Load the store policy table, or an empty one when no file is configured.
    pub fn load_policies(&self) -> Result<StorePolicyTable, PolicyError> {
        match &self.policy_path {
            Some(path) => StorePolicyTable::load(path),
            None => Ok(StorePolicyTable::default()),
        }
    }

    pub fn engine_config(&self, policies: &StorePolicyTable) -> EngineConfig {
        EngineConfig {
            default_threshold: self.match_threshold,
            retention_days: self.retention_days,
            retention_overrides: policies.retention_overrides(),
            expiring_soon: chrono::Duration::hours(self.expiring_soon_hours),
            retain_identify_captures: self.retain_captures,
        }
    }
}

fn parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}
