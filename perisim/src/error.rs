//! Error types for the simulator core.

use core::fmt;

/// Error types for simulator operations.
///
/// Recoverable conditions (`Busy`, `Timeout`, `NotFound`) are returned to the
/// caller. Fatal conditions inside the trap engine (unknown address, plugin
/// rejection mid-fault) never surface as values; the engine terminates the
/// process with a diagnostic instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimError {
    /// Range overlap, table capacity exceeded, duplicate plugin name, or an
    /// invalid address/signal in a mapping.
    Config,
    /// A plugin rejected an operation the core cannot recover from.
    Protocol,
    /// The target is in a state that forbids the operation.
    Busy,
    /// A blocking wait exceeded its budget.
    Timeout,
    /// Plugin, IRQ handler, or mapping not present.
    NotFound,
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            SimError::Config => "invalid configuration",
            SimError::Protocol => "plugin rejected operation",
            SimError::Busy => "resource busy",
            SimError::Timeout => "operation timed out",
            SimError::NotFound => "not found",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for SimError {}

/// Result alias used throughout the simulator core.
pub type Result<T, E = SimError> = core::result::Result<T, E>;
