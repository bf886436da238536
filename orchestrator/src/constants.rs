//! Central repository for timeouts, intervals, and limits used by the engine
//!
//! Configuration values in `main.toml` override the defaults below; anything
//! left unset falls back to these.

use std::time::Duration;

/// Remote task polling
pub mod polling {
    use super::Duration;

    /// Interval between two status queries of a remote task
    pub const TASK_POLL_INTERVAL: Duration = Duration::from_millis(900);

    /// Maximum time a single remote task may take before it surfaces as a timeout
    pub const TASK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

    /// Consecutive status-query failures tolerated before the poller gives up
    pub const MAX_CONSECUTIVE_POLL_FAILURES: u32 = 5;
}

/// Concurrency limits
pub mod limits {
    /// Storage rescans allowed in flight per connection
    pub const MAX_SCANS_PER_CONNECTION: usize = 3;

    /// Operations kept in the history before the oldest finished ones are dropped
    pub const MAX_HISTORY_ENTRIES: usize = 500;
}

/// Storage attachment handling
pub mod storage {
    use super::Duration;

    /// How long a host-removal detach waits for every attachment to report detached
    pub const DETACH_WAIT: Duration = Duration::from_secs(2 * 60);

    /// Result recorded when the detach wait runs out
    pub const DETACH_TIMEOUT_RESULT: &str = "detach-timeout";

    /// Result recorded when every attachment detached in time
    pub const DETACHED_RESULT: &str = "detached";

    /// Storage repository types served by the clustering service
    pub const CLUSTERED_SR_TYPES: &[&str] = &["gfs2"];
}

/// Remote method names, which double as RBAC permission names
pub mod methods {
    pub const PIF_RECONFIGURE_IP: &str = "PIF.reconfigure_ip";
    pub const HOST_MANAGEMENT_RECONFIGURE: &str = "host.management_reconfigure";
    pub const POOL_MANAGEMENT_RECONFIGURE: &str = "pool.management_reconfigure";
    pub const PBD_PLUG: &str = "PBD.plug";
    pub const PBD_UNPLUG: &str = "PBD.unplug";
    pub const PBD_GET_CURRENTLY_ATTACHED: &str = "PBD.get_currently_attached";
    pub const CLUSTER_HOST_ENABLE: &str = "Cluster_host.enable";
    pub const CLUSTER_HOST_DISABLE: &str = "Cluster_host.disable";
    pub const SR_SCAN: &str = "SR.scan";
}

/// Metadata written onto remote tasks
pub mod tags {
    /// Key under which an operation stamps its id on the remote tasks it starts
    pub const OPERATION_UUID_KEY: &str = "orchestrator_operation_uuid";
}

/// Cleanup constants
pub mod cleanup {
    /// Hours after which finished operations leave the history
    pub const HISTORY_RETENTION_HOURS: i64 = 24;

    /// Cleanup interval in seconds
    pub const CLEANUP_INTERVAL_SECONDS: u64 = 3600;
}

/// Default service configuration values
pub mod defaults {
    pub const HOST: &str = "0.0.0.0";
    pub const PORT: u16 = 8095;

    /// Default request timeout in seconds for control-plane gateway calls
    pub const GATEWAY_REQUEST_TIMEOUT_SECONDS: u64 = 30;
}
