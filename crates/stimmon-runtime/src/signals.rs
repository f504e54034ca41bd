//! Interrupt handling for both roles.
//!
//! SIGINT, SIGHUP and SIGTERM set a process-wide flag instead of killing
//! the process. Handlers are installed without `SA_RESTART`, so a role
//! blocked in a gate wait or a device call returns with `EINTR`, sees the
//! flag, and unwinds through its normal scoped release path. The flag is
//! per process: after the fork each role observes only its own signals.

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use stimmon_common::error::{StimMonError, StimMonResult};
use tracing::{debug, warn};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static LAST_SIGNAL: AtomicI32 = AtomicI32::new(0);

/// Signals that interrupt a session.
pub const HANDLED_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGHUP, Signal::SIGTERM];

fn record(flag: &AtomicBool, last: &AtomicI32, signum: c_int) {
    last.store(signum, Ordering::Relaxed);
    flag.store(true, Ordering::Release);
}

extern "C" fn on_signal(signum: c_int) {
    // Async-signal-safe: atomics only
    record(&INTERRUPTED, &LAST_SIGNAL, signum);
}

/// Whether an interrupt signal has arrived since the last [`clear`].
#[inline]
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::Acquire)
}

/// Most recent interrupt signal, if any.
pub fn last_signal() -> Option<Signal> {
    match LAST_SIGNAL.load(Ordering::Relaxed) {
        0 => None,
        n => Signal::try_from(n).ok(),
    }
}

/// Reset the flag at the start of a session.
pub fn clear() {
    INTERRUPTED.store(false, Ordering::Release);
    LAST_SIGNAL.store(0, Ordering::Relaxed);
}

/// Error describing the pending interrupt.
pub fn interrupted_error() -> StimMonError {
    StimMonError::Interrupted {
        signal: last_signal().map_or_else(|| "unknown".to_string(), |s| s.as_str().to_string()),
    }
}

/// Fail with [`StimMonError::Interrupted`] if a signal is pending.
///
/// # Errors
///
/// Returns the interrupt error when the flag is set.
pub fn check() -> StimMonResult<()> {
    if interrupted() {
        Err(interrupted_error())
    } else {
        Ok(())
    }
}

/// Installed interrupt handlers; the previous dispositions come back on drop.
#[derive(Debug)]
pub struct InterruptGuard {
    previous: Vec<(Signal, SigAction)>,
}

impl InterruptGuard {
    /// Install handlers for [`HANDLED_SIGNALS`] and clear the flag.
    ///
    /// # Errors
    ///
    /// Returns [`StimMonError::Resource`] if `sigaction` fails. Handlers
    /// installed before the failure are restored.
    pub fn install() -> StimMonResult<Self> {
        clear();
        let action = SigAction::new(
            SigHandler::Handler(on_signal),
            SaFlags::empty(),
            SigSet::empty(),
        );

        let mut guard = Self {
            previous: Vec::with_capacity(HANDLED_SIGNALS.len()),
        };
        for signal in HANDLED_SIGNALS {
            // SAFETY: the handler only touches atomics
            let old = unsafe { sigaction(signal, &action) }.map_err(|e| {
                StimMonError::Resource(format!("failed to install {signal} handler: {e}"))
            })?;
            guard.previous.push((signal, old));
        }

        debug!("Interrupt handlers installed");
        Ok(guard)
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        for (signal, old) in self.previous.drain(..).rev() {
            // SAFETY: restoring a disposition previously returned by sigaction
            if let Err(e) = unsafe { sigaction(signal, &old) } {
                warn!(%signal, error = %e, "Failed to restore signal disposition");
            }
        }
        debug!("Interrupt handlers restored");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sets_flag_and_signal() {
        let flag = AtomicBool::new(false);
        let last = AtomicI32::new(0);

        record(&flag, &last, libc::SIGTERM);
        assert!(flag.load(Ordering::Acquire));
        assert_eq!(last.load(Ordering::Relaxed), libc::SIGTERM);

        record(&flag, &last, libc::SIGHUP);
        assert_eq!(last.load(Ordering::Relaxed), libc::SIGHUP);
    }

    #[test]
    fn test_install_and_restore() {
        let guard = InterruptGuard::install().unwrap();
        assert_eq!(guard.previous.len(), HANDLED_SIGNALS.len());
        assert!(!interrupted());
        drop(guard);
    }

    #[test]
    fn test_error_names_signal() {
        let err = StimMonError::Interrupted {
            signal: Signal::SIGINT.as_str().to_string(),
        };
        assert_eq!(err.to_string(), "interrupted by signal SIGINT");
    }
}
