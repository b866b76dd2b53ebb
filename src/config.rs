//! Runtime configuration
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration. Durations are written in humantime form (`"30s"`, `"1m"`).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ParleyError, Result};
use crate::mailbox::BackpressurePolicy;
use crate::message::AgentId;
use crate::recovery::RecoveryPolicy;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParleyConfig {
    pub bus: BusConfig,
    pub storage: StorageConfig,
    pub orchestrator: OrchestratorConfig,
    pub progress: ProgressConfig,
}

/// Message bus settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BusConfig {
    /// Bounded capacity of each subscriber queue
    pub queue_capacity: usize,
    pub backpressure: BackpressurePolicy,
    /// Buffer of the observability event channel
    pub event_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            backpressure: BackpressurePolicy::Block,
            event_capacity: 256,
        }
    }
}

/// Conversation persistence settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Records larger than this are gzip-compressed
    pub compression_threshold_bytes: usize,
    /// Backups kept per conversation
    pub backup_retention: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            compression_threshold_bytes: 64 * 1024,
            backup_retention: 5,
        }
    }
}

/// Workflow engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// Identity the orchestrator publishes and subscribes under
    pub agent_id: AgentId,
    #[serde(with = "humantime_serde")]
    pub task_timeout: Duration,
    /// Slack added to every deadline before a task counts as timed out
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
    #[serde(with = "humantime_serde")]
    pub scan_interval: Duration,
    pub recovery: RecoveryPolicy,
    /// Finished workflows kept for result queries before eviction
    pub archive_limit: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            agent_id: AgentId::from("orchestrator"),
            task_timeout: Duration::from_secs(300),
            grace_period: Duration::from_secs(5),
            scan_interval: Duration::from_secs(1),
            recovery: RecoveryPolicy::default(),
            archive_limit: 256,
        }
    }
}

/// Progress tracking settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProgressConfig {
    /// Percent thresholds that emit a milestone event, ascending
    pub milestones: Vec<u8>,
    /// Silence after which an operation is flagged as stalled
    #[serde(with = "humantime_serde")]
    pub stall_after: Duration,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            milestones: vec![25, 50, 75, 100],
            stall_after: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

impl ParleyConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: ParleyConfig =
            toml::from_str(source).map_err(|e| ParleyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ParleyError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        fn positive(field: &str, value: u128) -> Result<()> {
            if value == 0 {
                return Err(ParleyError::Config(format!("{field} must be > 0")));
            }
            Ok(())
        }

        positive("bus.queue_capacity", self.bus.queue_capacity as u128)?;
        positive("bus.event_capacity", self.bus.event_capacity as u128)?;
        positive(
            "orchestrator.task_timeout",
            self.orchestrator.task_timeout.as_millis(),
        )?;
        positive(
            "orchestrator.scan_interval",
            self.orchestrator.scan_interval.as_millis(),
        )?;
        positive(
            "orchestrator.archive_limit",
            self.orchestrator.archive_limit as u128,
        )?;
        positive(
            "progress.heartbeat_interval",
            self.progress.heartbeat_interval.as_millis(),
        )?;
        positive("progress.stall_after", self.progress.stall_after.as_millis())?;

        if self.orchestrator.agent_id.is_empty() {
            return Err(ParleyError::Config(
                "orchestrator.agent_id must not be empty".to_string(),
            ));
        }

        let milestones = &self.progress.milestones;
        if let Some(bad) = milestones.iter().find(|m| **m == 0 || **m > 100) {
            return Err(ParleyError::Config(format!(
                "progress.milestones: {bad} is outside 1..=100"
            )));
        }
        if milestones.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ParleyError::Config(
                "progress.milestones must be strictly ascending".to_string(),
            ));
        }

        self.orchestrator.recovery.validate()
    }
}
