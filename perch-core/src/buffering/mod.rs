//! Lock-free SPSC buffering between the real-time thread and the writer.
//!
//! Two layers:
//!
//! - `ring::RingBuffer` — a generic single-producer/single-consumer ring of
//!   fixed-layout records, wait-free on both sides, with its backing storage
//!   pinned against paging. The only primitive that touches memory shared
//!   between the real-time and writer threads. Crate-internal: its SPSC
//!   discipline is a usage contract the type cannot enforce by itself, so
//!   the only way in from outside is [`period::period_ring`]'s split halves,
//!   which pin each side to one owner.
//! - [`period`] — a framing protocol over a byte ring: a multichannel period
//!   (header + N channel payloads) is reserved, filled one channel at a time,
//!   and made visible to the reader atomically only once complete.
//!
//! The real-time side must never block, allocate, or fault; everything here
//! is O(copied bytes) with no locks and no syscalls after construction.

pub mod period;
#[allow(unsafe_code)]
pub(crate) mod pin;
#[allow(unsafe_code)]
pub(crate) mod ring;
