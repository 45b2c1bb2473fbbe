//! Error types and reporting
//!
//! Bookkeeping in this crate never fails. Errors only show up in two places:
//!
//! - **Callback errors**: a queued callback panicked while its thread was
//!   draining. The panic is caught at the drain site and handed to the
//!   process-wide reporter (see [`set_error_reporter`]).
//! - **Usage errors**: the caller broke a precondition (drained a queue from
//!   the wrong thread, read a computed value from inside its own evaluation).
//!   These go through [`usage_error`], which panics or logs depending on the
//!   configured [`UsageErrorPolicy`].

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Errors reported by the tether core
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A callback delivered through a message queue panicked
    #[error("Queued callback panicked (signal: {signal}, receiver: {receiver}): {message}")]
    TaskPanicked {
        signal: String,
        receiver: String,
        message: String,
    },

    /// A computed value was read while it was being evaluated
    #[error("Computed value '{computed}' read itself during evaluation")]
    RecursiveRecompute { computed: String },

    /// A thread-affine operation was called from another thread
    #[error("'{operation}' must run on thread '{expected}', called from '{actual}'")]
    WrongThread {
        operation: &'static str,
        expected: String,
        actual: String,
    },

    /// An entity was asked to emit a signal owned by someone else
    #[error("Entity '{entity}' does not own signal '{signal}'")]
    ForeignSignal { entity: String, signal: String },

    /// Configuration could not be parsed
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The OS refused to start a worker thread
    #[error("Failed to spawn thread '{name}': {message}")]
    ThreadSpawn { name: String, message: String },
}

/// Result type for tether operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// What to do when a usage error is detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageErrorPolicy {
    /// Panic at the call site (default for debug builds)
    Panic,
    /// Report the error and carry on (default for release builds)
    Log,
}

impl Default for UsageErrorPolicy {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            UsageErrorPolicy::Panic
        } else {
            UsageErrorPolicy::Log
        }
    }
}

/// Callback invoked for every reported error
pub type ErrorReporter = Arc<dyn Fn(&CoreError) + Send + Sync>;

static REPORTER: RwLock<Option<ErrorReporter>> = parking_lot::const_rwlock(None);

/// Install a process-wide error reporter
///
/// Replaces the default reporter, which logs through `tracing::error!`.
/// The reporter may be called from any thread that drains a message queue.
pub fn set_error_reporter<F>(reporter: F)
where
    F: Fn(&CoreError) + Send + Sync + 'static,
{
    *REPORTER.write() = Some(Arc::new(reporter));
}

/// Restore the default (logging) reporter
pub fn clear_error_reporter() {
    *REPORTER.write() = None;
}

/// Report an error without interrupting the caller
pub fn report(error: &CoreError) {
    // Clone out so a reporter that installs another reporter can't deadlock.
    let reporter = REPORTER.read().clone();
    match reporter {
        Some(reporter) => reporter(error),
        None => tracing::error!("{}", error),
    }
}

/// Handle a precondition violation according to the configured policy
///
/// # Panics
///
/// Panics when the policy is [`UsageErrorPolicy::Panic`].
pub fn usage_error(error: CoreError) {
    match crate::config::current().usage_errors {
        UsageErrorPolicy::Panic => panic!("{}", error),
        UsageErrorPolicy::Log => report(&error),
    }
}

/// Extract a readable message from a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
