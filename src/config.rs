use std::path::Path;

use serde::Deserialize;

use crate::error::{PipelineError, PipelineResult};

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ClusterlineConfig {
    pub database: DatabaseConfig,
    pub execution: ExecutionConfig,
    pub clustering: ClusteringConfig,
    pub queue: QueueConfig,
    pub providers: ProvidersConfig,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Attempt cap per task. One collaborator invocation per attempt; the
    /// task dead-letters when all attempts are spent.
    pub max_attempts: u32,
    /// Timeout applied to every external collaborator call.
    pub collaborator_timeout_secs: u64,
    /// Base delay for exponential backoff between re-deliveries.
    pub backoff_base_ms: u64,
    /// Upper bound on a single backoff delay.
    pub backoff_cap_ms: u64,
    /// Concurrent message handlers per stage worker.
    pub max_concurrent: u32,
    /// An in-progress claim older than this is presumed orphaned by a
    /// crashed worker and re-queued by the recovery sweep.
    pub stale_claim_secs: i64,
    /// Cadence of the recovery/reconciliation sweep.
    pub sweep_interval_secs: u64,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ClusteringConfig {
    /// Similarity score threshold for cluster membership.
    pub score_threshold: f64,
    /// Retries of the whole assign transaction on write contention.
    pub assign_max_retries: u32,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Base URL for the listing / tagging / look-alike / similarity services.
    pub base_url: String,
    pub api_key: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "clusterline.db".to_string(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            collaborator_timeout_secs: 30,
            backoff_base_ms: 500,
            backoff_cap_ms: 30_000,
            max_concurrent: 4,
            stale_claim_secs: 600,
            sweep_interval_secs: 60,
        }
    }
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            score_threshold: 0.85,
            assign_max_retries: 5,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            api_key: None,
        }
    }
}

/// Load config from a TOML file. A missing file yields the defaults; a file
/// that exists but fails to parse is an error (never silently ignored).
pub fn load(path: &Path) -> PipelineResult<ClusterlineConfig> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ClusterlineConfig::default())
        }
        Err(e) => {
            return Err(PipelineError::Config(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };

    toml::from_str(&contents).map_err(|e| {
        PipelineError::Config(format!("Failed to parse {}: {}", path.display(), e))
    })
}

/// Write a starter config with defaults spelled out, for `init`.
pub fn write_starter(path: &Path) -> PipelineResult<()> {
    let starter = r#"[database]
path = "clusterline.db"

[execution]
max_attempts = 3
collaborator_timeout_secs = 30
backoff_base_ms = 500
backoff_cap_ms = 30000
max_concurrent = 4
stale_claim_secs = 600
sweep_interval_secs = 60

[clustering]
score_threshold = 0.85
assign_max_retries = 5

[queue]
capacity = 1024

[providers]
base_url = "http://127.0.0.1:8080"
"#;

    std::fs::write(path, starter).map_err(|e| {
        PipelineError::Config(format!("Failed to write {}: {}", path.display(), e))
    })
}
