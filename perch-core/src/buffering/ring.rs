//! Generic lock-free single-producer/single-consumer ring buffer.
//!
//! ## Contract
//!
//! Exactly one thread performs write-side calls (`push`, the crate-internal
//! positional writes and `publish`) and exactly one thread performs read-side
//! calls (`pop`, `pop_with`, `advance`, `flush`). The space accessors may be
//! called from either side. All operations are wait-free and bounded, which
//! makes the write side safe inside a hard-real-time callback.
//!
//! ## Layout
//!
//! Capacity is rounded up to a power of two so index arithmetic is a bit
//! mask instead of a modulo. One slot is always left empty to distinguish a
//! full buffer from an empty one, so `read_space() + write_space()` is
//! `capacity - 1` at any quiescent point. Each side owns its index; an index
//! is stored with `Release` ordering only after the covered elements have
//! been copied, and the opposite index is loaded with `Acquire`, so a reader
//! never observes elements before they are fully written.
//!
//! Backing storage is pinned against paging for the buffer's lifetime.

use std::cell::UnsafeCell;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::buffering::pin::PinnedRegion;

/// Fixed-capacity lock-free SPSC ring of fixed-layout records.
///
/// `T` must be trivially copyable (`Copy`); elements are moved by memcpy and
/// never dropped individually.
pub struct RingBuffer<T> {
    // Declared first so the region is unlocked before the storage is freed.
    _pin: PinnedRegion,
    buf: Box<[UnsafeCell<T>]>,
    // Indices are kept masked into [0, capacity). Cache-line padding keeps
    // the producer and consumer from false-sharing a line.
    write_ptr: CachePadded<AtomicUsize>,
    read_ptr: CachePadded<AtomicUsize>,
    mask: usize,
}

// SAFETY: the SPSC protocol partitions the storage between the two threads:
// the producer only writes slots inside its write space, the consumer only
// reads slots inside its read space, and ownership of a slot is transferred
// exclusively through the Release/Acquire index pair.
#[allow(unsafe_code)]
unsafe impl<T: Send> Send for RingBuffer<T> {}
#[allow(unsafe_code)]
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T: Copy + Default> RingBuffer<T> {
    /// Create a ring with room for at least `min_size` elements.
    ///
    /// The actual capacity is the next power of two ≥ `min_size` (minimum 2);
    /// usable space is one less than capacity.
    pub fn with_capacity(min_size: usize) -> Self {
        let capacity = min_size.next_power_of_two().max(2);
        let buf: Box<[UnsafeCell<T>]> = (0..capacity)
            .map(|_| UnsafeCell::new(T::default()))
            .collect();
        let pin = PinnedRegion::acquire(buf.as_ptr() as usize, capacity * mem::size_of::<T>());
        Self {
            _pin: pin,
            buf,
            write_ptr: CachePadded::new(AtomicUsize::new(0)),
            read_ptr: CachePadded::new(AtomicUsize::new(0)),
            mask: capacity - 1,
        }
    }
}

impl<T> RingBuffer<T> {
    /// Total capacity in elements. Usable space is `capacity() - 1`.
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Number of elements available to read. O(1), callable from either side.
    pub fn read_space(&self) -> usize {
        let w = self.write_ptr.load(Ordering::Acquire);
        let r = self.read_ptr.load(Ordering::Acquire);
        w.wrapping_add(self.capacity()).wrapping_sub(r) & self.mask
    }

    /// Number of elements that can be written. O(1), callable from either side.
    pub fn write_space(&self) -> usize {
        let w = self.write_ptr.load(Ordering::Acquire);
        let r = self.read_ptr.load(Ordering::Acquire);
        r.wrapping_add(self.capacity())
            .wrapping_sub(w)
            .wrapping_sub(1)
            & self.mask
    }

    /// Discard up to `count` unread elements without reading them.
    ///
    /// Reader-side only. Returns the number actually discarded. Used to skip
    /// malformed or stale frames.
    pub fn advance(&self, count: usize) -> usize {
        let n = count.min(self.read_space());
        if n == 0 {
            return 0;
        }
        let r = self.read_ptr.load(Ordering::Relaxed);
        self.read_ptr.store((r + n) & self.mask, Ordering::Release);
        n
    }

    /// Discard from the read side until at most `target` elements remain.
    ///
    /// Reader-side only. Bounds the latency of a prebuffer by dropping its
    /// excess backlog; does nothing when the backlog is already ≤ `target`.
    /// The producer may add elements concurrently, in which case the backlog
    /// after the call may exceed `target` again.
    pub fn flush(&self, target: usize) -> usize {
        let backlog = self.read_space();
        if backlog <= target {
            return 0;
        }
        self.advance(backlog - target)
    }

    // ── crate-internal arena access for the period framing layer ──────────

    /// Masked write index. Producer-side only.
    pub(crate) fn write_index(&self) -> usize {
        self.write_ptr.load(Ordering::Relaxed)
    }

    /// Masked read index. Consumer-side only.
    pub(crate) fn read_index(&self) -> usize {
        self.read_ptr.load(Ordering::Relaxed)
    }

    /// Wrap a logical index into the arena.
    pub(crate) fn wrap(&self, index: usize) -> usize {
        index & self.mask
    }

    /// Advance the write index by `count`, publishing everything the producer
    /// placed with `copy_in_at` in one step. Producer-side only; the caller
    /// must have validated that `count` elements fit in the write space.
    pub(crate) fn publish(&self, count: usize) {
        debug_assert!(count <= self.write_space());
        let w = self.write_ptr.load(Ordering::Relaxed);
        self.write_ptr.store((w + count) & self.mask, Ordering::Release);
    }
}

impl<T: Copy> RingBuffer<T> {
    /// Copy as many elements of `src` as fit, returning the number written.
    ///
    /// Producer-side only. A short write is normal backpressure the caller
    /// must check, not a fault. The copy splits into at most two contiguous
    /// runs when it wraps past the end of the arena.
    pub fn push(&self, src: &[T]) -> usize {
        let to_write = src.len().min(self.write_space());
        if to_write == 0 {
            return 0;
        }
        let w = self.write_ptr.load(Ordering::Relaxed);
        let n1 = to_write.min(self.capacity() - w);
        // SAFETY: [w, w + n1) and (on wrap) [0, to_write - n1) lie inside the
        // producer's write space; the consumer cannot read them until the
        // Release store below.
        #[allow(unsafe_code)]
        unsafe {
            self.copy_in_run(w, &src[..n1]);
            if to_write > n1 {
                self.copy_in_run(0, &src[n1..to_write]);
            }
        }
        self.write_ptr
            .store((w + to_write) & self.mask, Ordering::Release);
        to_write
    }

    /// Copy up to `dest.len()` elements out, returning the number read.
    ///
    /// Consumer-side only.
    pub fn pop(&self, dest: &mut [T]) -> usize {
        let to_read = dest.len().min(self.read_space());
        if to_read == 0 {
            return 0;
        }
        let r = self.read_ptr.load(Ordering::Relaxed);
        let n1 = to_read.min(self.capacity() - r);
        // SAFETY: the regions lie inside the consumer's read space; the
        // producer cannot overwrite them until the Release store below.
        #[allow(unsafe_code)]
        unsafe {
            self.copy_out_run(r, &mut dest[..n1]);
            if to_read > n1 {
                self.copy_out_run(0, &mut dest[n1..to_read]);
            }
        }
        self.read_ptr
            .store((r + to_read) & self.mask, Ordering::Release);
        to_read
    }

    /// Visitor form of [`pop`](Self::pop): invokes `visit` with each
    /// contiguous run instead of copying to a destination buffer, so whole
    /// periods can be handed to a sink without a second copy.
    ///
    /// Consumer-side only. Reads up to `count` elements (`usize::MAX` to
    /// drain); the visitor is called once or twice depending on wrap.
    pub fn pop_with<F>(&self, count: usize, mut visit: F) -> usize
    where
        F: FnMut(&[T]),
    {
        let to_read = count.min(self.read_space());
        if to_read == 0 {
            return 0;
        }
        let r = self.read_ptr.load(Ordering::Relaxed);
        let n1 = to_read.min(self.capacity() - r);
        // SAFETY: as in `pop`; the borrows handed to the visitor end before
        // the read index is released.
        #[allow(unsafe_code)]
        unsafe {
            visit(self.run_slice(r, n1));
            if to_read > n1 {
                visit(self.run_slice(0, to_read - n1));
            }
        }
        self.read_ptr
            .store((r + to_read) & self.mask, Ordering::Release);
        to_read
    }

    // ── crate-internal positional access (no index movement) ──────────────

    /// Copy `src` into the arena starting at masked index `start`, wrapping
    /// as needed. Producer-side only; the region must lie inside the current
    /// write space (the framing layer validates this at reservation time).
    pub(crate) fn copy_in_at(&self, start: usize, src: &[T]) {
        debug_assert!(start <= self.mask);
        debug_assert!(src.len() <= self.capacity());
        let n1 = src.len().min(self.capacity() - start);
        // SAFETY: per the documented contract the region is producer-owned
        // and unpublished, so the consumer cannot observe it.
        #[allow(unsafe_code)]
        unsafe {
            self.copy_in_run(start, &src[..n1]);
            if src.len() > n1 {
                self.copy_in_run(0, &src[n1..]);
            }
        }
    }

    /// Copy from the arena starting at masked index `start` into `dest`,
    /// wrapping as needed. Consumer-side only; the region must lie inside the
    /// current read space.
    pub(crate) fn copy_out_at(&self, start: usize, dest: &mut [T]) {
        debug_assert!(start <= self.mask);
        debug_assert!(dest.len() <= self.capacity());
        let n1 = dest.len().min(self.capacity() - start);
        // SAFETY: the region is published and consumer-owned until the read
        // index moves past it.
        #[allow(unsafe_code)]
        unsafe {
            self.copy_out_run(start, &mut dest[..n1]);
            if dest.len() > n1 {
                self.copy_out_run(0, &mut dest[n1..]);
            }
        }
    }

    /// Visit `len` elements starting at masked index `start` without copying
    /// or moving any index; ≤ 2 calls. Consumer-side only, same region
    /// contract as [`copy_out_at`](Self::copy_out_at).
    pub(crate) fn view_at<F>(&self, start: usize, len: usize, mut visit: F)
    where
        F: FnMut(&[T]),
    {
        debug_assert!(start <= self.mask);
        debug_assert!(len <= self.capacity());
        let n1 = len.min(self.capacity() - start);
        // SAFETY: as in `copy_out_at`; the borrows end when `visit` returns.
        #[allow(unsafe_code)]
        unsafe {
            visit(self.run_slice(start, n1));
            if len > n1 {
                visit(self.run_slice(0, len - n1));
            }
        }
    }

    // ── raw run helpers ───────────────────────────────────────────────────

    /// # Safety
    /// `[start, start + src.len())` must lie within the arena and be owned by
    /// the producer (inside write space, unpublished).
    #[allow(unsafe_code)]
    unsafe fn copy_in_run(&self, start: usize, src: &[T]) {
        std::ptr::copy_nonoverlapping(src.as_ptr(), self.buf[start].get(), src.len());
    }

    /// # Safety
    /// `[start, start + dest.len())` must lie within the arena and be owned
    /// by the consumer (inside read space).
    #[allow(unsafe_code)]
    unsafe fn copy_out_run(&self, start: usize, dest: &mut [T]) {
        std::ptr::copy_nonoverlapping(
            self.buf[start].get() as *const T,
            dest.as_mut_ptr(),
            dest.len(),
        );
    }

    /// # Safety
    /// Same region contract as [`copy_out_run`](Self::copy_out_run); the
    /// returned borrow must end before the read index is advanced past it.
    #[allow(unsafe_code)]
    unsafe fn run_slice(&self, start: usize, len: usize) -> &[T] {
        std::slice::from_raw_parts(self.buf[start].get() as *const T, len)
    }
}

impl<T> std::fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("read_space", &self.read_space())
            .field("write_space", &self.write_space())
            .finish()
    }
}
