//! # perch-core
//!
//! Core of a real-time audio recording client: multichannel audio arrives in
//! fixed-size periods from a hard-real-time callback, is buffered lock-free,
//! and is drained by a lower-priority thread into a pluggable storage sink.
//! A hysteresis trigger gate decides when recording-worthy activity is
//! happening.
//!
//! ## Architecture
//!
//! ```text
//! process callback ──► TriggerGate::update (go / no-go)
//!        │
//!        ▼
//! PeriodProducer::reserve + push   (wait-free, never blocks)
//!        │
//!   condvar wake hint
//!        ▼
//! writer thread ──► PeriodConsumer::request + pop ──► StorageSink::write
//! ```
//!
//! The real-time callback is zero-alloc and lock-free. All heap work and I/O
//! happen on the writer thread.

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod buffering;
pub mod error;
pub mod trigger;
pub mod writer;

// Convenience re-exports for downstream crates
pub use buffering::period::{period_ring, PeriodConsumer, PeriodHeader, PeriodProducer};
pub use error::{PerchError, Result};
pub use trigger::{GateState, TriggerConfig, TriggerGate};
pub use writer::{BufferedWriter, NullSink, StorageSink};
