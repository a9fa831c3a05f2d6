//! Request/response protocol between the trap engine and peripheral plugins.
//!
//! Every faulted access is turned into one [`SimRequest`], dispatched to the
//! owning plugin, and answered with one [`SimResponse`]. Nothing retains a
//! request past the plugin call.

use std::sync::atomic::{AtomicU32, Ordering};

/// Clock control actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockAction {
    /// Advance the plugin's state by one or more steps.
    Tick,
    Enable,
    Disable,
}

/// Reset line actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetAction {
    /// Drive reset: zero state, stop workers.
    Assert,
    Deassert,
}

/// The operation carried by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimOp {
    RegRead { addr: u32 },
    RegWrite { addr: u32, value: u32 },
    Clock { action: ClockAction, cycles: u32 },
    Reset { action: ResetAction },
    Interrupt { irq: u32 },
}

/// A single routed operation. Constructed per fault (or per host call) and
/// dropped as soon as the response is built.
#[derive(Debug, Clone, Copy)]
pub struct SimRequest<'a> {
    /// Name of the plugin that owns the target.
    pub module: &'a str,
    /// Monotonically increasing id, for log correlation.
    pub id: u32,
    pub op: SimOp,
}

/// Response to a [`SimRequest`].
#[derive(Debug, Clone, Copy)]
pub struct SimResponse {
    /// Echoes the request id.
    pub id: u32,
    /// Read result, or 0 for non-read operations.
    pub value: u32,
    /// 0 on success, -1 on failure.
    pub error: i32,
}

static NEXT_REQUEST_ID: AtomicU32 = AtomicU32::new(1);

/// Allocate the next request id. Ids are unique across the whole simulator.
pub fn next_request_id() -> u32 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

impl<'a> SimRequest<'a> {
    /// Build a request with a fresh id.
    pub fn new(module: &'a str, op: SimOp) -> Self {
        Self {
            module,
            id: next_request_id(),
            op,
        }
    }
}
