//! Hysteresis trigger gate for activity detection.
//!
//! `TriggerGate` decides whether an event of interest (e.g. a vocalization)
//! is currently happening, so the caller can route periods to storage only
//! while the gate is open. It holds no cross-thread state; call it from
//! whichever thread owns the incoming buffer.

pub mod gate;

pub use gate::{count_crossings, TriggerConfig, TriggerGate};

/// Whether the gate currently considers the signal active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// No event in progress; periods can be discarded.
    Closed,
    /// An event is in progress; periods should be recorded.
    Open,
}

impl GateState {
    pub fn is_open(self) -> bool {
        self == GateState::Open
    }
}
