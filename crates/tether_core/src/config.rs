//! Runtime configuration
//!
//! Configuration is read once at startup (see [`crate::runtime::init`]) and
//! stays fixed for the life of the process. It can be built in code or parsed
//! from TOML:
//!
//! ```toml
//! usage_errors = "log"
//!
//! [drain]
//! max_tasks = 256
//! max_duration_ms = 4
//!
//! [event_loop]
//! idle_wait_ms = 8
//! ```

use crate::error::{CoreError, Result, UsageErrorPolicy};
use serde::{Deserialize, Serialize};
use std::sync::{LazyLock, OnceLock};
use std::time::Duration;

/// Installed configuration (set once by `runtime::init`)
static CONFIG: OnceLock<CoreConfig> = OnceLock::new();

/// Fallback used until `runtime::init` is called
static DEFAULT_CONFIG: LazyLock<CoreConfig> = LazyLock::new(CoreConfig::default);

/// Top-level configuration for the tether core
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct CoreConfig {
    /// Per-call limits applied by `ThreadHandle::drain`
    #[serde(default)]
    pub drain: DrainBudget,
    /// Settings for `EventLoop` and `WorkerThread`
    #[serde(default)]
    pub event_loop: EventLoopConfig,
    /// Reaction to precondition violations
    #[serde(default)]
    pub usage_errors: UsageErrorPolicy,
}

/// Upper bound on the work a single `drain()` call performs
///
/// Whichever limit is hit first ends the drain; tasks left over stay queued
/// (ahead of anything posted since) for the next call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct DrainBudget {
    /// Maximum number of tasks to run, `None` for no limit
    ///
    /// A missing key means the default of 1024; no limit can only be set
    /// from code via [`DrainBudget::unlimited`].
    #[serde(default = "default_max_tasks")]
    pub max_tasks: Option<usize>,
    /// Wall-clock budget in milliseconds, `None` for no limit
    #[serde(default)]
    pub max_duration_ms: Option<u64>,
}

fn default_max_tasks() -> Option<usize> {
    Some(1024)
}

impl Default for DrainBudget {
    fn default() -> Self {
        Self {
            max_tasks: default_max_tasks(),
            max_duration_ms: None,
        }
    }
}

impl DrainBudget {
    /// No limits: drain everything that was queued when the call started
    pub fn unlimited() -> Self {
        Self {
            max_tasks: None,
            max_duration_ms: None,
        }
    }

    /// Limit by task count only
    pub fn tasks(max_tasks: usize) -> Self {
        Self {
            max_tasks: Some(max_tasks),
            max_duration_ms: None,
        }
    }

    /// Wall-clock budget as a `Duration`
    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_ms.map(Duration::from_millis)
    }
}

/// Event loop settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct EventLoopConfig {
    /// How long an idle loop blocks waiting for new tasks
    #[serde(default = "default_idle_wait_ms")]
    pub idle_wait_ms: u64,
}

fn default_idle_wait_ms() -> u64 {
    16
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            idle_wait_ms: default_idle_wait_ms(),
        }
    }
}

impl EventLoopConfig {
    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }
}

impl CoreConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| CoreError::InvalidConfig(e.to_string()))
    }

    /// Serialize the configuration to TOML text
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| CoreError::InvalidConfig(e.to_string()))
    }
}

/// Install the process-wide configuration
///
/// Returns `false` if a configuration was already installed; the first one
/// wins.
pub(crate) fn install(config: CoreConfig) -> bool {
    CONFIG.set(config).is_ok()
}

/// The active configuration
pub fn current() -> &'static CoreConfig {
    CONFIG.get().unwrap_or(&DEFAULT_CONFIG)
}
