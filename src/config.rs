use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub scenario: ScenarioConfig,
    pub protocol: ProtocolConfig,
    pub motion: MotionConfig,
    pub logging: LoggingConfig,
}

/// Scenario bootstrap parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Number of agents in the fleet
    pub num_agents: usize,
    /// Number of claimable tasks
    pub num_tasks: usize,
    /// Proportion of agents seeded with the same conflicting task
    pub conflict_ratio: f64,
    /// RNG seed for reproducible scenarios (None = entropy)
    pub seed: Option<u64>,
    /// Fixed per-agent priority weights added on top of distance scores
    pub fixed_weights: Vec<i64>,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            num_agents: 3,
            num_tasks: 3,
            conflict_ratio: 0.8,
            seed: None,
            fixed_weights: vec![0, 2, 5],
        }
    }
}

/// Allocation and assistance protocol parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Maximum allocation rounds before reporting partial success
    pub max_retries: u32,
    /// Priority increment applied to a losing claimant before retry
    pub priority_step: i64,
    /// Claim message time-to-live (ms)
    pub claim_ttl_ms: i64,
    /// Response message time-to-live (ms)
    pub response_ttl_ms: i64,
    /// Assist request time-to-live (ms)
    pub assist_ttl_ms: i64,
    /// Sync-start broadcast time-to-live (ms)
    pub sync_ttl_ms: i64,
    /// Helpers recruited per assisted task before it counts as staffed
    pub max_helpers: usize,
    /// Require all quorum members at the task position before sync fires.
    /// Off by default: members hold position while waiting for sync, so
    /// demanding co-presence first would stall quorums that form en route.
    pub require_copresence: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            priority_step: 5,
            claim_ttl_ms: 5_000,
            response_ttl_ms: 3_000,
            assist_ttl_ms: 5_000,
            sync_ttl_ms: 5_000,
            max_helpers: 2,
            require_copresence: false,
        }
    }
}

/// Motion and stuck-detection parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Distance below which an agent counts as at its target (world units)
    pub reach_threshold: f64,
    /// Maximum pairwise displacement over the window that still counts as stuck
    pub stuck_threshold: f64,
    /// Number of position samples kept for stuck detection
    pub stuck_window: usize,
    /// Maximum step magnitude applied per tick (world units)
    pub max_step: f64,
    /// Wall-clock pacing between simulation ticks (ms)
    pub tick_ms: u64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            reach_threshold: 0.1,
            stuck_threshold: 0.005,
            stuck_window: 10,
            max_step: 0.01,
            tick_ms: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(
                File::from(config_dir.join(
                    std::env::var("TASKMESH_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (TASKMESH_PROTOCOL__MAX_RETRIES, etc.)
            .add_source(
                Environment::with_prefix("TASKMESH")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.protocol.max_retries, 3);
        assert_eq!(cfg.protocol.max_helpers, 2);
        assert!((cfg.motion.reach_threshold - 0.1).abs() < f64::EPSILON);
        assert_eq!(cfg.motion.stuck_window, 10);
    }

    #[test]
    fn load_without_config_dir_uses_defaults() {
        let cfg = AppConfig::load_from("does/not/exist").expect("defaults should apply");
        assert_eq!(cfg.scenario.num_agents, 3);
        assert_eq!(cfg.scenario.fixed_weights, vec![0, 2, 5]);
    }
}
