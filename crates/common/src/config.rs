use serde::{Deserialize, Serialize};

/// Storage-tier (tablet) configuration shared by the connection manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabletConfig {
    /// When set, per-user metric families are reported under a fixed
    /// disabled-label sentinel instead of real usernames.
    #[serde(default)]
    pub skip_user_metrics: bool,
    /// Default transaction timeout applied to dedicated connections, in
    /// milliseconds. `0` disables timeout enforcement.
    #[serde(default = "default_tx_timeout_ms")]
    pub tx_timeout_ms: u64,
    /// Default reserved-connection timeout, in milliseconds. `0` disables
    /// timeout enforcement.
    #[serde(default = "default_reserved_timeout_ms")]
    pub reserved_timeout_ms: u64,
}

fn default_tx_timeout_ms() -> u64 {
    30_000
}

fn default_reserved_timeout_ms() -> u64 {
    30_000
}

impl Default for TabletConfig {
    fn default() -> Self {
        Self {
            skip_user_metrics: false,
            tx_timeout_ms: default_tx_timeout_ms(),
            reserved_timeout_ms: default_reserved_timeout_ms(),
        }
    }
}

/// Routing-tier planner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Prefix used when allocating fresh reserved bind variables.
    #[serde(default = "default_bind_var_prefix")]
    pub bind_var_prefix: String,
}

fn default_bind_var_prefix() -> String {
    "kmx".to_string()
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            bind_var_prefix: default_bind_var_prefix(),
        }
    }
}
