//! Storage sink abstraction and the buffered writer thread.
//!
//! The `StorageSink` trait is the extensibility point: the writer thread
//! drives the drain loop and backpressure accounting, while everything about
//! durable layout (container format, per-channel datasets, annotations)
//! lives behind the trait. Alternate sinks are supplied by implementing the
//! trait, not by subclassing thread management.

pub mod thread;

pub use thread::BufferedWriter;

use crate::buffering::period::PeriodHeader;

/// Destination for drained periods.
///
/// Data is organized as one or more *entries* (logical recording segments),
/// each containing zero or more channels sharing a common start time. All
/// methods are called from the writer thread only, so implementations need
/// no internal locking.
///
/// I/O failures are the sink's own concern: report them through return
/// values or internal state, but expect the writer thread to keep draining
/// regardless — stalling would back the ring up and drop periods at the
/// real-time side instead.
pub trait StorageSink: Send + 'static {
    /// Begin a new entry starting at frame `frame`, closing the previous one
    /// if necessary.
    fn new_entry(&mut self, frame: u64);

    /// Finalize the current entry.
    fn close_entry(&mut self);

    /// True when an entry is open for recording.
    fn ready(&self) -> bool;

    /// True when every channel has received the same amount of data and at
    /// least one full period has been written.
    fn aligned(&self) -> bool;

    /// Record that an overrun occurred, annotating the durable record.
    fn xrun(&mut self);

    /// Write one period. `frames` holds `nchannels` contiguous payloads of
    /// `nbytes` each, exactly as framed in the ring. When `stop` is nonzero
    /// only frames in `[start, stop)` are written (`stop` past the end of
    /// the period is fine). Returns the number of frames written.
    fn write(&mut self, header: &PeriodHeader, frames: &[u8], start: u32, stop: u32) -> u32;

    /// Advisory request to flush buffered data to durable storage. Sinks
    /// must flush on cleanup regardless; this hook lets the writer thread
    /// request one when load is light.
    fn flush(&mut self) {}
}

/// A sink that discards everything. Useful as a base case and in tests and
/// benchmarks where only the buffering path is under measurement.
#[derive(Debug, Default)]
pub struct NullSink {
    entry_open: bool,
    periods: u64,
    xruns: u64,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Periods accepted so far.
    pub fn periods(&self) -> u64 {
        self.periods
    }
}

impl StorageSink for NullSink {
    fn new_entry(&mut self, _frame: u64) {
        self.entry_open = true;
    }

    fn close_entry(&mut self) {
        self.entry_open = false;
    }

    fn ready(&self) -> bool {
        self.entry_open
    }

    fn aligned(&self) -> bool {
        self.periods > 0
    }

    fn xrun(&mut self) {
        self.xruns += 1;
    }

    fn write(&mut self, header: &PeriodHeader, _frames: &[u8], start: u32, stop: u32) -> u32 {
        self.periods += 1;
        let total = header.frames() as u32;
        if stop == 0 {
            total.saturating_sub(start)
        } else {
            stop.min(total).saturating_sub(start)
        }
    }
}
