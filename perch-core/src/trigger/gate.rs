//! Threshold-crossing gate with sliding-window hysteresis.
//!
//! ## Algorithm
//!
//! 1. Per incoming buffer, count threshold crossings (upward magnitude
//!    transitions) against the open and close thresholds.
//! 2. Append both counts to fixed-length circular histories, one sized to
//!    the open window and one to the close window.
//! 3. While closed: open when the open window's total reaches
//!    `crossings_per_open_window`.
//! 4. While open: close when the close window's total falls below
//!    `crossings_per_close_window`.
//!
//! A single buffer's crossing count is noisy, so decisions are windowed, and
//! the open/close thresholds and windows are configured separately to give
//! hysteresis at the decision boundary. Both histories are fed on every
//! update, so the inactive window is already primed with real counts when a
//! transition hands the decision over to it.

use tracing::debug;

use super::GateState;

/// Gate parameters. Window lengths are in seconds and converted to buffer
/// counts at construction.
#[derive(Debug, Clone)]
pub struct TriggerConfig {
    /// Amplitude a sample must reach to count as a crossing while closed.
    pub open_threshold: f32,
    /// Amplitude a sample must reach to count as a crossing while open.
    /// Usually below `open_threshold` so a fading signal holds the gate.
    pub close_threshold: f32,
    /// Length of the sliding window consulted while closed, in seconds.
    pub open_window_s: f32,
    /// Length of the sliding window consulted while open, in seconds.
    pub close_window_s: f32,
    /// Crossings the open window must total to open the gate.
    pub crossings_per_open_window: u32,
    /// Crossings the close window must stay at or above to hold the gate
    /// open.
    pub crossings_per_close_window: u32,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            open_threshold: 0.1,
            close_threshold: 0.06,
            open_window_s: 0.1,
            close_window_s: 0.4,
            crossings_per_open_window: 10,
            crossings_per_close_window: 4,
        }
    }
}

/// Count upward threshold crossings in one buffer.
///
/// A crossing is a sample whose magnitude reaches `threshold` when the
/// previous sample's magnitude was below it. The first sample counts if it
/// is already at or above threshold. An all-zero buffer against a nonzero
/// threshold yields 0.
pub fn count_crossings(threshold: f32, buffer: &[f32]) -> u32 {
    let threshold = threshold.abs();
    let mut crossings = 0;
    let mut above = false;
    for &sample in buffer {
        let now_above = sample.abs() >= threshold;
        if now_above && !above {
            crossings += 1;
        }
        above = now_above;
    }
    crossings
}

/// Two-state hysteresis gate over per-buffer crossing counts.
///
/// Mutated only by [`update`](Self::update), once per incoming buffer.
/// Buffers are assumed to arrive at a fixed length matching `buffer_len`;
/// the window sizes are derived from that assumption.
#[derive(Debug, Clone)]
pub struct TriggerGate {
    config: TriggerConfig,
    state: GateState,
    open_history: Vec<u32>,
    close_history: Vec<u32>,
    open_cursor: usize,
    close_cursor: usize,
    samples_processed: u64,
}

impl TriggerGate {
    /// Build a gate for buffers of `buffer_len` samples at `sample_rate` Hz.
    /// Each window spans at least one buffer regardless of configuration.
    pub fn new(config: TriggerConfig, sample_rate: u32, buffer_len: usize) -> Self {
        let open_buffers = buffers_per_window(config.open_window_s, sample_rate, buffer_len);
        let close_buffers = buffers_per_window(config.close_window_s, sample_rate, buffer_len);
        Self {
            config,
            state: GateState::Closed,
            open_history: vec![0; open_buffers],
            close_history: vec![0; close_buffers],
            open_cursor: 0,
            close_cursor: 0,
            samples_processed: 0,
        }
    }

    /// Current state, no side effects.
    pub fn state(&self) -> GateState {
        self.state
    }

    /// Total samples seen since construction or the last [`reset`](Self::reset).
    pub fn samples_processed(&self) -> u64 {
        self.samples_processed
    }

    /// Consume one buffer and return the (possibly updated) state.
    pub fn update(&mut self, buffer: &[f32]) -> GateState {
        self.samples_processed += buffer.len() as u64;

        let open_count = count_crossings(self.config.open_threshold, buffer);
        let close_count = count_crossings(self.config.close_threshold, buffer);
        self.open_history[self.open_cursor] = open_count;
        self.open_cursor = (self.open_cursor + 1) % self.open_history.len();
        self.close_history[self.close_cursor] = close_count;
        self.close_cursor = (self.close_cursor + 1) % self.close_history.len();

        match self.state {
            GateState::Closed => {
                let total: u32 = self.open_history.iter().sum();
                if total >= self.config.crossings_per_open_window {
                    self.state = GateState::Open;
                    debug!(
                        total,
                        at = self.samples_processed,
                        "gate opened"
                    );
                }
            }
            GateState::Open => {
                let total: u32 = self.close_history.iter().sum();
                if total < self.config.crossings_per_close_window {
                    self.state = GateState::Closed;
                    debug!(
                        total,
                        at = self.samples_processed,
                        "gate closed"
                    );
                }
            }
        }
        self.state
    }

    /// Return to the closed state with empty histories.
    pub fn reset(&mut self) {
        self.state = GateState::Closed;
        self.open_history.fill(0);
        self.close_history.fill(0);
        self.open_cursor = 0;
        self.close_cursor = 0;
        self.samples_processed = 0;
    }
}

fn buffers_per_window(window_s: f32, sample_rate: u32, buffer_len: usize) -> usize {
    let samples = (window_s * sample_rate as f32).ceil().max(0.0) as usize;
    samples.div_ceil(buffer_len.max(1)).max(1)
}
