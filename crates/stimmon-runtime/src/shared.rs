//! Monitored-event tally shared across the fork.
//!
//! The monitor runs in the child, so its event count has to cross the
//! process boundary. An anonymous `MAP_SHARED` page inherited by the child
//! carries the count back, along with a failure code when the role failed;
//! the parent reads both after the join.

use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use stimmon_common::error::{StimMonError, StimMonResult};
use tracing::warn;

/// Why the monitor role failed, as seen by the parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MonitorFault {
    /// The poll buffer could not be allocated.
    Allocation = 1,
    /// A rendezvous gate could not be opened.
    Rendezvous = 2,
    /// The monitor sink could not be written or rewound.
    Sink = 3,
    /// The role panicked.
    Panicked = 4,
}

impl MonitorFault {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Allocation),
            2 => Some(Self::Rendezvous),
            3 => Some(Self::Sink),
            4 => Some(Self::Panicked),
            _ => None,
        }
    }

    /// Short description for the session report.
    #[must_use]
    pub fn describe(self) -> &'static str {
        match self {
            Self::Allocation => "monitor buffer allocation failed",
            Self::Rendezvous => "monitor could not open a rendezvous gate",
            Self::Sink => "monitor sink write failed",
            Self::Panicked => "monitor role panicked",
        }
    }
}

#[repr(C)]
struct Tally {
    monitored: AtomicU64,
    published: AtomicBool,
    fault: AtomicU8,
}

/// Shared page holding the monitor's final event count and failure code.
#[derive(Debug)]
pub struct SharedTally {
    ptr: NonNull<Tally>,
    len: usize,
}

impl SharedTally {
    /// Map a zeroed shared page.
    ///
    /// # Errors
    ///
    /// Returns [`StimMonError::Resource`] if the mapping fails.
    pub fn new() -> StimMonResult<Self> {
        let len = std::mem::size_of::<Tally>();
        let length = NonZeroUsize::new(len)
            .ok_or_else(|| StimMonError::Resource("empty shared tally".into()))?;

        // SAFETY: fresh anonymous mapping, no aliasing with existing memory
        let ptr = unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }
        .map_err(|e| StimMonError::Resource(format!("shared tally mapping: {e}")))?;

        // Zeroed pages are valid atomics
        Ok(Self {
            ptr: ptr.cast::<Tally>(),
            len,
        })
    }

    fn tally(&self) -> &Tally {
        // SAFETY: the mapping lives until drop and is only accessed through atomics
        unsafe {
            self.ptr.as_ref()
        }
    }

    /// Record the final count (monitor side).
    pub fn publish(&self, monitored: u64) {
        let tally = self.tally();
        tally.monitored.store(monitored, Ordering::Relaxed);
        tally.published.store(true, Ordering::Release);
    }

    /// Final count, or `None` if the monitor never published one.
    #[must_use]
    pub fn get(&self) -> Option<u64> {
        let tally = self.tally();
        if tally.published.load(Ordering::Acquire) {
            Some(tally.monitored.load(Ordering::Relaxed))
        } else {
            None
        }
    }

    /// Record why the monitor role failed (monitor side).
    pub fn record_fault(&self, fault: MonitorFault) {
        self.tally().fault.store(fault as u8, Ordering::Release);
    }

    /// Recorded failure, if any.
    #[must_use]
    pub fn fault(&self) -> Option<MonitorFault> {
        MonitorFault::from_code(self.tally().fault.load(Ordering::Acquire))
    }
}

impl Drop for SharedTally {
    fn drop(&mut self) {
        // SAFETY: unmapping the region created in `new`; no references outlive self
        let result = unsafe { munmap(self.ptr.cast::<c_void>(), self.len) };
        if let Err(e) = result {
            warn!(error = %e, "Failed to unmap shared tally");
        }
    }
}
