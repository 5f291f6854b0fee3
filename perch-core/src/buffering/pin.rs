//! RAII guard that pins an allocation against paging.
//!
//! A page fault in the real-time callback is a correctness violation, not a
//! performance problem, so ring-buffer storage is `mlock`ed for its lifetime
//! and unlocked on drop. Pinning is best-effort: `RLIMIT_MEMLOCK` is commonly
//! too small in containers and CI, and running unpinned is degraded but
//! functional, so failure logs a warning instead of refusing to start.

use tracing::debug;
#[cfg(unix)]
use tracing::warn;

/// Keeps a memory region locked in RAM for the guard's lifetime.
///
/// The guard stores the raw address rather than a pointer so it stays `Send`
/// and `Sync` without ceremony; it never dereferences the region.
#[derive(Debug)]
pub(crate) struct PinnedRegion {
    addr: usize,
    len: usize,
    pinned: bool,
}

impl PinnedRegion {
    /// Attempt to pin `len` bytes starting at `addr`.
    #[cfg(unix)]
    pub(crate) fn acquire(addr: usize, len: usize) -> Self {
        if len == 0 {
            return Self {
                addr,
                len,
                pinned: false,
            };
        }
        // SAFETY: the caller owns [addr, addr + len); mlock does not read or
        // write the region, it only adjusts page residency.
        let rc = unsafe { libc::mlock(addr as *const libc::c_void, len) };
        if rc != 0 {
            warn!(
                len,
                error = %std::io::Error::last_os_error(),
                "mlock failed; ring buffer memory is not pinned"
            );
        }
        Self {
            addr,
            len,
            pinned: rc == 0,
        }
    }

    #[cfg(not(unix))]
    pub(crate) fn acquire(addr: usize, len: usize) -> Self {
        debug!(len, "page pinning unavailable on this platform");
        Self {
            addr,
            len,
            pinned: false,
        }
    }

    /// True if the region is actually resident-locked.
    #[cfg(test)]
    pub(crate) fn is_pinned(&self) -> bool {
        self.pinned
    }
}

impl Drop for PinnedRegion {
    fn drop(&mut self) {
        #[cfg(unix)]
        if self.pinned {
            // SAFETY: the region was successfully locked by `acquire` and the
            // owning allocation is still alive (the guard is dropped first).
            let rc = unsafe { libc::munlock(self.addr as *const libc::c_void, self.len) };
            if rc != 0 {
                debug!(
                    error = %std::io::Error::last_os_error(),
                    "munlock failed during teardown"
                );
            }
        }
    }
}
