//! Period framing over a byte ring.
//!
//! A *period* is one real-time callback's worth of multichannel audio:
//! a fixed 16-byte header followed by `nchannels` contiguous payloads of
//! `nbytes` each. Channel counts may differ between periods, so periods are
//! variable-shaped; the framing protocol lets each side work one channel at
//! a time while guaranteeing the reader never sees a half-written period and
//! the writer never reclaims a half-read one:
//!
//! ```text
//! producer: reserve(time, nbytes, nchannels)   header staged in the arena
//!           push(ch 0) … push(ch n-1)          last push publishes atomically
//! consumer: request() -> header                peek, nothing consumed yet
//!           pop(ch 0) … pop(ch n-1)           last pop releases the space
//! ```
//!
//! [`period_ring`] returns the two halves of the protocol; holding a half
//! `&mut` is what enforces the single-producer/single-consumer discipline.
//! Calling a phase out of order is a logic fault reported as a typed error,
//! never silent corruption.

use std::sync::Arc;

use crate::buffering::ring::RingBuffer;
use crate::error::{PerchError, Result};

/// Bytes occupied by an encoded [`PeriodHeader`] in the arena.
pub const HEADER_BYTES: usize = 16;

/// Bytes per sample frame assumed by frame-count helpers (32-bit samples,
/// the audio-server default). Payloads themselves are opaque bytes.
pub const SAMPLE_BYTES: usize = 4;

/// Header describing one multichannel period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodHeader {
    /// Monotonic frame counter at the start of the period.
    pub time: u64,
    /// Payload bytes per channel.
    pub nbytes: u32,
    /// Number of channels in the period.
    pub nchannels: u32,
}

impl PeriodHeader {
    /// Payload bytes across all channels.
    pub fn frame_bytes(&self) -> usize {
        self.nbytes as usize * self.nchannels as usize
    }

    /// Total arena bytes for the period, header included.
    pub fn chunk_bytes(&self) -> usize {
        HEADER_BYTES + self.frame_bytes()
    }

    /// Sample frames per channel, assuming [`SAMPLE_BYTES`]-wide samples.
    pub fn frames(&self) -> u64 {
        (self.nbytes as usize / SAMPLE_BYTES) as u64
    }

    // The encoding is in-memory framing only (native endianness), never
    // written to durable storage.
    fn encode(&self) -> [u8; HEADER_BYTES] {
        let mut raw = [0u8; HEADER_BYTES];
        raw[0..8].copy_from_slice(&self.time.to_ne_bytes());
        raw[8..12].copy_from_slice(&self.nbytes.to_ne_bytes());
        raw[12..16].copy_from_slice(&self.nchannels.to_ne_bytes());
        raw
    }

    fn decode(raw: &[u8; HEADER_BYTES]) -> Self {
        let mut time = [0u8; 8];
        let mut nbytes = [0u8; 4];
        let mut nchannels = [0u8; 4];
        time.copy_from_slice(&raw[0..8]);
        nbytes.copy_from_slice(&raw[8..12]);
        nchannels.copy_from_slice(&raw[12..16]);
        Self {
            time: u64::from_ne_bytes(time),
            nbytes: u32::from_ne_bytes(nbytes),
            nchannels: u32::from_ne_bytes(nchannels),
        }
    }
}

/// Create a matched producer/consumer pair over a shared byte arena with at
/// least `min_bytes` of capacity (rounded up to a power of two).
pub fn period_ring(min_bytes: usize) -> (PeriodProducer, PeriodConsumer) {
    let ring = Arc::new(RingBuffer::<u8>::with_capacity(min_bytes));
    (
        PeriodProducer::new(Arc::clone(&ring)),
        PeriodConsumer::new(ring),
    )
}

struct Reservation {
    header: PeriodHeader,
    remaining: u32,
}

/// Write half of the period protocol — held by the real-time thread.
///
/// All operations are wait-free; a full buffer is reported as `Ok(0)` from
/// [`reserve`](Self::reserve), never by blocking.
pub struct PeriodProducer {
    ring: Arc<RingBuffer<u8>>,
    pending: Option<Reservation>,
}

impl PeriodProducer {
    pub(crate) fn new(ring: Arc<RingBuffer<u8>>) -> Self {
        Self {
            ring,
            pending: None,
        }
    }

    /// Total arena capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Bytes currently writable.
    pub fn write_space(&self) -> usize {
        self.ring.write_space()
    }

    /// Channels still owed on the open reservation (0 when none).
    pub fn pending_channels(&self) -> u32 {
        self.pending.as_ref().map_or(0, |r| r.remaining)
    }

    /// Begin a new period. Stages the header in the arena and records the
    /// number of channel pushes owed.
    ///
    /// Returns `Ok(0)` when fewer than one full period fits — expected
    /// backpressure the caller must check. A nonzero return estimates how
    /// many periods of this shape the buffer can currently hold.
    ///
    /// # Errors
    /// `PerchError::ReservationPending` if the previous reservation has not
    /// been completed; buffer state is untouched.
    pub fn reserve(&mut self, time: u64, nbytes: u32, nchannels: u32) -> Result<usize> {
        if self.pending.is_some() {
            return Err(PerchError::ReservationPending);
        }
        let header = PeriodHeader {
            time,
            nbytes,
            nchannels,
        };
        let chunk = header.chunk_bytes();
        let periods_fit = self.ring.write_space() / chunk;
        if periods_fit == 0 {
            return Ok(0);
        }
        self.ring
            .copy_in_at(self.ring.write_index(), &header.encode());
        if nchannels == 0 {
            // Degenerate header-only period: nothing further owed.
            self.ring.publish(chunk);
        } else {
            self.pending = Some(Reservation {
                header,
                remaining: nchannels,
            });
        }
        Ok(periods_fit)
    }

    /// Copy exactly one channel's payload into the reserved period.
    ///
    /// Channels are filled in order. The final channel's push advances the
    /// ring's write index past the whole period in one step, making header
    /// and all payloads visible to the reader atomically.
    ///
    /// Returns the number of channels still owed after this call.
    ///
    /// # Errors
    /// `PerchError::NoReservation` without an open reservation;
    /// `PerchError::ChannelSizeMismatch` if `channel` is not exactly the
    /// reserved `nbytes` long.
    pub fn push(&mut self, channel: &[u8]) -> Result<u32> {
        let res = self.pending.as_mut().ok_or(PerchError::NoReservation)?;
        let nbytes = res.header.nbytes as usize;
        if channel.len() != nbytes {
            return Err(PerchError::ChannelSizeMismatch {
                expected: nbytes,
                got: channel.len(),
            });
        }
        let filled = (res.header.nchannels - res.remaining) as usize;
        let start = self
            .ring
            .wrap(self.ring.write_index() + HEADER_BYTES + filled * nbytes);
        self.ring.copy_in_at(start, channel);
        res.remaining -= 1;
        if res.remaining == 0 {
            let chunk = res.header.chunk_bytes();
            self.pending = None;
            self.ring.publish(chunk);
            Ok(0)
        } else {
            Ok(res.remaining)
        }
    }
}

impl std::fmt::Debug for PeriodProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodProducer")
            .field("write_space", &self.write_space())
            .field("pending_channels", &self.pending_channels())
            .finish()
    }
}

struct Request {
    header: PeriodHeader,
    remaining: u32,
}

/// Read half of the period protocol — held by the writer thread.
pub struct PeriodConsumer {
    ring: Arc<RingBuffer<u8>>,
    pending: Option<Request>,
}

impl PeriodConsumer {
    pub(crate) fn new(ring: Arc<RingBuffer<u8>>) -> Self {
        Self {
            ring,
            pending: None,
        }
    }

    /// Bytes currently readable.
    pub fn read_space(&self) -> usize {
        self.ring.read_space()
    }

    /// Channels still owed on the open request (0 when none).
    pub fn pending_channels(&self) -> u32 {
        self.pending.as_ref().map_or(0, |r| r.remaining)
    }

    /// Peek the next period's header without consuming anything.
    ///
    /// `Ok(None)` when no complete period is available. A header with zero
    /// channels is consumed immediately (nothing left to pop).
    ///
    /// # Errors
    /// `PerchError::RequestPending` if the previous request has not been
    /// fully popped.
    pub fn request(&mut self) -> Result<Option<PeriodHeader>> {
        if self.pending.is_some() {
            return Err(PerchError::RequestPending);
        }
        if self.ring.read_space() < HEADER_BYTES {
            return Ok(None);
        }
        let mut raw = [0u8; HEADER_BYTES];
        self.ring.copy_out_at(self.ring.read_index(), &mut raw);
        let header = PeriodHeader::decode(&raw);
        if header.nchannels == 0 {
            self.ring.advance(header.chunk_bytes());
        } else {
            self.pending = Some(Request {
                header,
                remaining: header.nchannels,
            });
        }
        Ok(Some(header))
    }

    /// Copy exactly one channel's payload out of the requested period.
    ///
    /// Channels come out in order. The final channel's pop advances the read
    /// index past the whole period, releasing the space back to the producer
    /// in one step. The advance is gated strictly on the read-side counter.
    ///
    /// Returns the number of channels still owed after this call.
    ///
    /// # Errors
    /// `PerchError::NoRequest` without an open request;
    /// `PerchError::ChannelSizeMismatch` if `dest` is not exactly `nbytes`
    /// long.
    pub fn pop(&mut self, dest: &mut [u8]) -> Result<u32> {
        let req = self.pending.as_mut().ok_or(PerchError::NoRequest)?;
        let nbytes = req.header.nbytes as usize;
        if dest.len() != nbytes {
            return Err(PerchError::ChannelSizeMismatch {
                expected: nbytes,
                got: dest.len(),
            });
        }
        let read = (req.header.nchannels - req.remaining) as usize;
        let start = self
            .ring
            .wrap(self.ring.read_index() + HEADER_BYTES + read * nbytes);
        self.ring.copy_out_at(start, dest);
        req.remaining -= 1;
        if req.remaining == 0 {
            let chunk = req.header.chunk_bytes();
            self.pending = None;
            self.ring.advance(chunk);
            Ok(0)
        } else {
            Ok(req.remaining)
        }
    }

    /// Visitor form of [`pop`](Self::pop): hands the next channel's payload
    /// to `visit` as `(channel_index, bytes)` without copying. The visitor
    /// is called twice for the same channel when the payload wraps the arena
    /// end (second call continues where the first left off).
    pub fn pop_with<F>(&mut self, mut visit: F) -> Result<u32>
    where
        F: FnMut(u32, &[u8]),
    {
        let req = self.pending.as_mut().ok_or(PerchError::NoRequest)?;
        let nbytes = req.header.nbytes as usize;
        let index = req.header.nchannels - req.remaining;
        let start = self
            .ring
            .wrap(self.ring.read_index() + HEADER_BYTES + index as usize * nbytes);
        self.ring.view_at(start, nbytes, |run| visit(index, run));
        req.remaining -= 1;
        if req.remaining == 0 {
            let chunk = req.header.chunk_bytes();
            self.pending = None;
            self.ring.advance(chunk);
            Ok(0)
        } else {
            Ok(req.remaining)
        }
    }

    /// Discard the requested period without reading its payloads (used to
    /// drop malformed or stale frames).
    ///
    /// # Errors
    /// `PerchError::NoRequest` if no request is open.
    pub fn skip(&mut self) -> Result<()> {
        let req = self.pending.take().ok_or(PerchError::NoRequest)?;
        self.ring.advance(req.header.chunk_bytes());
        Ok(())
    }
}

impl std::fmt::Debug for PeriodConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodConsumer")
            .field("read_space", &self.read_space())
            .field("pending_channels", &self.pending_channels())
            .finish()
    }
}
