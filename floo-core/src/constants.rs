//! Cluster-wide tuning constants

use std::time::Duration;

/// How often the manager wipes and rebuilds the request -> instance map
pub const CLEAR_REQUEST_INSTANCE_INTERVAL: Duration = Duration::from_secs(1000);

/// Back-off between dispatch retries while the instance pool is empty
pub const NO_INSTANCE_RETRY_GENERATE_INTERVAL: Duration = Duration::from_secs(1);

/// Poll interval while waiting for in-flight migrations to drain before a
/// collective group rebuild
pub const WAIT_ALL_MIGRATIONS_DONE_INTERVAL: Duration = Duration::from_millis(100);

/// Sleep applied by the engine loop when a step produced no outputs
pub const NO_OUTPUTS_STEP_INTERVAL: Duration = Duration::from_millis(10);

/// How often an instance checks its engine for a crashed state
pub const CHECK_ENGINE_STATE_INTERVAL: Duration = Duration::from_secs(1);

/// Deadline for an instance to report ready after creation
pub const INSTANCE_READY_TIMEOUT: Duration = Duration::from_secs(300);

/// Deadline applied to every instance and worker remote call
pub const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Name prefix under which instance actors register, used for discovery
pub const INSTANCE_NAME_PREFIX: &str = "instance_";
