//! Configuration management for Floo
//!
//! Settings are resolved from three layers:
//! 1. Environment variables (highest priority)
//! 2. Configuration file (TOML format)
//! 3. Default values (lowest priority)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

use floo_common::{Error, Result};

use crate::cache::KvCacheSpec;

/// Transport used to move KV-cache blocks between workers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MigrationBackendKind {
    /// Serialize the staging buffer and return it by value over RPC
    Rpc,
    /// Collective send/recv staged through host memory
    CollectiveCpu,
    /// Collective send/recv staged on device
    CollectiveGpu,
}

impl MigrationBackendKind {
    /// Collective backends share a communication group that must be rebuilt
    /// on any membership change.
    pub fn is_group_kind(&self) -> bool {
        matches!(self, Self::CollectiveCpu | Self::CollectiveGpu)
    }
}

/// How cluster load is aggregated for autoscaling decisions
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScalingPolicy {
    /// Scale on the most loaded instance
    MaxLoad,
    /// Scale on the mean load across the fleet
    AvgLoad,
}

/// Main configuration struct for Floo
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FlooConfig {
    pub manager: ManagerConfig,
    pub migration: MigrationConfig,
    pub cache: KvCacheSpec,
    pub logging: LoggingConfig,
}

/// Cluster manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Seconds between instance-info polls
    pub polling_interval_secs: f64,
    /// Trigger pair migration every this many polls
    pub pair_migration_frequency: u64,
    pub enable_migration: bool,
    /// Dispatch prompts to prefill instances and hand off to decode instances
    pub enable_pd_disagg: bool,
    /// KV usage ratio above which an instance becomes a migration source
    pub migrate_out_threshold: f64,
    pub enable_scaling: bool,
    pub scaling_policy: ScalingPolicy,
    /// Cluster KV usage at or above which a new instance is requested
    pub scale_up_threshold: f64,
    /// Cluster KV usage at or below which a drained instance is retired
    pub scale_down_threshold: f64,
    /// Seconds between autoscaling checks
    pub scaling_interval_secs: f64,
    pub max_instances: usize,
    pub min_instances: usize,
    /// Append per-poll instance snapshots to `<log_filename>_instance.csv`
    pub log_instance_info: bool,
    pub log_filename: String,
    pub disable_log_requests: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            polling_interval_secs: 0.05,
            pair_migration_frequency: 1,
            enable_migration: true,
            enable_pd_disagg: false,
            migrate_out_threshold: 0.3,
            enable_scaling: false,
            scaling_policy: ScalingPolicy::AvgLoad,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.1,
            scaling_interval_secs: 10.0,
            max_instances: 16,
            min_instances: 1,
            log_instance_info: false,
            log_filename: "floo".to_string(),
            disable_log_requests: false,
        }
    }
}

/// Migration transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    pub migration_backend: MigrationBackendKind,
    /// Staging buffer capacity in blocks; capped to the block pool size
    pub migration_buffer_blocks: usize,
    /// Layers staged per transfer batch; capped to the model's layer count
    pub migration_num_layers: usize,
    /// Remaining-block count at or below which a transfer becomes last-stage
    pub migration_last_stage_max_blocks: usize,
    pub migration_backend_init_timeout_secs: f64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            migration_backend: MigrationBackendKind::Rpc,
            migration_buffer_blocks: 32,
            migration_num_layers: 1,
            migration_last_stage_max_blocks: 4,
            migration_backend_init_timeout_secs: 10.0,
        }
    }
}

impl MigrationConfig {
    /// Clamp buffer and layer counts to what the cache actually holds.
    pub fn clamped(&self, spec: &KvCacheSpec) -> MigrationConfig {
        let mut config = self.clone();
        if config.migration_buffer_blocks > spec.num_gpu_blocks {
            warn!(
                migration_buffer_blocks = config.migration_buffer_blocks,
                num_gpu_blocks = spec.num_gpu_blocks,
                "migration_buffer_blocks exceeds block pool, reducing to num_gpu_blocks"
            );
            config.migration_buffer_blocks = spec.num_gpu_blocks;
        }
        if config.migration_num_layers > spec.num_layers {
            config.migration_num_layers = spec.num_layers;
        }
        config
    }

    pub fn init_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.migration_backend_init_timeout_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl FlooConfig {
    /// Load configuration from environment variables and optional config file
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(config_path) = Self::find_config_file() {
            if let Ok(file_config) = Self::load_from_file(&config_path) {
                config = file_config;
            }
        }

        config.apply_env_overrides();
        config
    }

    /// Load configuration from a specific file path
    pub fn load_from_file(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let paths = [
            std::env::var("FLOO_CONFIG").ok().map(PathBuf::from),
            Some(PathBuf::from("/etc/floo/config.toml")),
            Some(PathBuf::from("./floo.toml")),
        ];

        paths.into_iter().flatten().find(|p| p.exists())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(interval) = std::env::var("FLOO_POLLING_INTERVAL") {
            if let Ok(interval) = interval.parse() {
                self.manager.polling_interval_secs = interval;
            }
        }
        if let Ok(enabled) = std::env::var("FLOO_ENABLE_MIGRATION") {
            self.manager.enable_migration = enabled.parse().unwrap_or(true);
        }
        if let Ok(enabled) = std::env::var("FLOO_ENABLE_PD_DISAGG") {
            self.manager.enable_pd_disagg = enabled.parse().unwrap_or(false);
        }
        if let Ok(blocks) = std::env::var("FLOO_MIGRATION_BUFFER_BLOCKS") {
            if let Ok(blocks) = blocks.parse() {
                self.migration.migration_buffer_blocks = blocks;
            }
        }
        if let Ok(level) = std::env::var("FLOO_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.manager.polling_interval_secs <= 0.0 {
            return Err(Error::InvalidConfig(
                "polling_interval must be positive".to_string(),
            ));
        }
        if self.manager.pair_migration_frequency == 0 {
            return Err(Error::InvalidConfig(
                "pair_migration_frequency must be at least 1".to_string(),
            ));
        }
        if self.migration.migration_buffer_blocks == 0 {
            return Err(Error::InvalidConfig(
                "migration_buffer_blocks must be at least 1".to_string(),
            ));
        }
        if self.cache.num_gpu_blocks == 0 || self.cache.block_size == 0 {
            return Err(Error::InvalidConfig(
                "cache must hold at least one non-empty block".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.manager.migrate_out_threshold) {
            return Err(Error::InvalidConfig(
                "migrate_out_threshold must be within [0, 1]".to_string(),
            ));
        }
        if self.manager.enable_scaling {
            if !(0.0..=1.0).contains(&self.manager.scale_up_threshold)
                || !(0.0..=1.0).contains(&self.manager.scale_down_threshold)
                || self.manager.scale_down_threshold >= self.manager.scale_up_threshold
            {
                return Err(Error::InvalidConfig(
                    "scaling thresholds must satisfy 0 <= down < up <= 1".to_string(),
                ));
            }
            if self.manager.min_instances == 0
                || self.manager.min_instances > self.manager.max_instances
            {
                return Err(Error::InvalidConfig(
                    "instance bounds must satisfy 1 <= min <= max".to_string(),
                ));
            }
            if self.manager.scaling_interval_secs <= 0.0 {
                return Err(Error::InvalidConfig(
                    "scaling_interval must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn scaling_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.manager.scaling_interval_secs)
    }

    pub fn polling_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.manager.polling_interval_secs)
    }
}
