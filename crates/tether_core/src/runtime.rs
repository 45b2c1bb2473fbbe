//! Process-wide entry points
//!
//! Configuration, the "process messages" call for threads that run their
//! own loop, and runtime statistics.

use crate::config::{self, CoreConfig};
use crate::entity;
use crate::error::Result;
use crate::queue::{DrainReport, QueueStats};
use crate::thread::{self, current_thread};

/// Install the process-wide configuration
///
/// Only the first call takes effect; it should happen before any thread
/// touches the core, since threads copy their drain budget on first use.
/// Returns whether this call installed the configuration.
pub fn init(config: CoreConfig) -> bool {
    let installed = config::install(config);
    if installed {
        tracing::debug!(config = ?config::current(), "tether runtime configured");
    } else {
        tracing::debug!("tether runtime already configured; ignoring");
    }
    installed
}

/// Parse `text` as TOML and install it with [`init`]
pub fn init_from_toml(text: &str) -> Result<bool> {
    Ok(init(CoreConfig::from_toml_str(text)?))
}

/// Run the calling thread's queued tasks, bounded by its drain budget
pub fn process_events() -> DrainReport {
    current_thread().drain()
}

/// Statistics about the runtime
#[derive(Debug, Clone)]
pub struct RuntimeStats {
    /// Threads currently registered
    pub threads: usize,
    /// Entities currently alive
    pub entities: usize,
    /// Queue totals for the calling thread
    pub current_queue: QueueStats,
}

/// Get statistics about the runtime
pub fn stats() -> RuntimeStats {
    RuntimeStats {
        threads: thread::registered_thread_count(),
        entities: entity::live_entity_count(),
        current_queue: current_thread().stats(),
    }
}
