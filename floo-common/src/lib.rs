//! Common types shared between the floo cluster manager and instance runtime

use serde::{Deserialize, Serialize};

/// Lifecycle status of a generation request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Queued on an instance, not yet scheduled
    Waiting,
    /// Actively decoding on an instance
    Running,
    /// Was waiting, currently being migrated out
    WaitingMigrating,
    /// Was running, currently being migrated out
    RunningMigrating,
    /// Completed or aborted
    Finished,
}

impl RequestStatus {
    pub fn is_migrating(&self) -> bool {
        matches!(self, Self::WaitingMigrating | Self::RunningMigrating)
    }

    /// The status a migrating request returns to when migration is aborted
    /// or committed.
    pub fn base_status(&self) -> RequestStatus {
        match self {
            Self::WaitingMigrating => Self::Waiting,
            Self::RunningMigrating => Self::Running,
            other => *other,
        }
    }

    /// The transient status a request enters while it is migrated out.
    pub fn migrating_status(&self) -> RequestStatus {
        match self {
            Self::Waiting => Self::WaitingMigrating,
            Self::Running => Self::RunningMigrating,
            other => *other,
        }
    }
}

/// Role of an instance in a prefill/decode disaggregated cluster
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InstanceType {
    Prefill,
    Decode,
    /// Serves both prompt processing and decoding
    Neutral,
}

/// Kind of work an instance performed in its latest step
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InferenceType {
    Prefill,
    Decode,
    Mixed,
    Idle,
}

/// Engine lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Init,
    Running,
    Stopped,
    Crashed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Crashed => write!(f, "crashed"),
        }
    }
}

/// Constraint applied when the pair-picker proposes migration pairs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PairMigrationConstraint {
    /// Any instance may migrate to any other
    NoConstraints,
    /// Prefill instances hand finished prompts to decode instances
    PrefillToDecode,
    /// Load balancing among decode instances
    DecodeToDecode,
}

/// A proposed migration between two instances
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationPair {
    pub src_instance_id: String,
    pub dst_instance_id: String,
    pub constraint: PairMigrationConstraint,
}

/// Per-GPU telemetry rollup attached to instance snapshots.
///
/// Collection itself is external (DCGM-style); these are the fields the
/// manager records per poll.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GpuMetrics {
    pub sm_active: f64,
    pub sm_occupancy: f64,
    pub dram_active: f64,
    pub power_watts: f64,
}

/// Periodic snapshot of one instance, published after each engine step.
///
/// Immutable once published; the manager retains only the latest snapshot
/// per instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub step_id: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub instance_type: InstanceType,
    pub inference_type: InferenceType,
    pub num_running_requests: usize,
    pub num_waiting_requests: usize,
    pub num_killed_requests: usize,
    /// Running requests whose expected-step budget is spent and which wait
    /// on a migration handoff
    pub num_blocking_requests: usize,
    pub num_free_blocks: usize,
    pub num_total_blocks: usize,
    pub kv_usage_ratio: f64,
    /// Blocks held by the most recently scheduled running request
    pub num_blocks_last_running_request: usize,
    /// Blocks needed by the oldest waiting request
    pub num_blocks_first_waiting_request: usize,
    /// Expected-step budget of the oldest waiting request, if any
    pub expected_steps_first_waiting: Option<i64>,
    pub dispatch_load_metric: f64,
    pub migration_load_metric: f64,
    pub gpu_metrics: GpuMetrics,
}

impl InstanceInfo {
    pub fn new(instance_id: impl Into<String>, instance_type: InstanceType) -> Self {
        Self {
            instance_id: instance_id.into(),
            step_id: 0,
            timestamp: chrono::Utc::now(),
            instance_type,
            inference_type: InferenceType::Idle,
            num_running_requests: 0,
            num_waiting_requests: 0,
            num_killed_requests: 0,
            num_blocking_requests: 0,
            num_free_blocks: 0,
            num_total_blocks: 0,
            kv_usage_ratio: 0.0,
            num_blocks_last_running_request: 0,
            num_blocks_first_waiting_request: 0,
            expected_steps_first_waiting: None,
            dispatch_load_metric: 0.0,
            migration_load_metric: 0.0,
            gpu_metrics: GpuMetrics::default(),
        }
    }
}

/// Floo error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Request not found: {0}")]
    RequestNotFound(String),

    #[error("Block transfer failed: {0}")]
    Transport(String),

    #[error("Peer unreachable: {0}")]
    RemoteDead(String),

    #[error("Destination cannot reserve blocks for request {0}")]
    PreAllocInsufficient(String),

    #[error("Collective group init timed out: {0}")]
    GroupInitTimeout(String),

    #[error("Engine crashed: {0}")]
    EngineCrashed(String),

    #[error("Migration aborted: {0}")]
    MigrationAborted(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("System error: {0}")]
    System(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Errors that terminate a single migration without affecting the
    /// instance serving it.
    pub fn is_migration_local(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::PreAllocInsufficient(_)
                | Self::MigrationAborted(_)
                | Self::RequestNotFound(_)
        )
    }
}
