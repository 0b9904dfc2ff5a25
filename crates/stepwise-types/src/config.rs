//! Engine configuration.
//!
//! `EngineConfig` represents the top-level `config.toml` that tunes
//! execution defaults which definitions do not set themselves.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the Stepwise engine.
///
/// Loaded from `~/.stepwise/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Run timeout applied when a definition has no `TimeoutSeconds`.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Concurrency cap for Map states that declare `MaxConcurrency: 0`.
    /// 0 leaves them unbounded.
    #[serde(default)]
    pub max_map_concurrency: u32,

    /// How long to wait for a killed script to be reaped after cancellation.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
}

fn default_timeout_secs() -> u64 {
    3600
}

fn default_kill_grace_ms() -> u64 {
    500
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            max_map_concurrency: 0,
            kill_grace_ms: default_kill_grace_ms(),
        }
    }
}
