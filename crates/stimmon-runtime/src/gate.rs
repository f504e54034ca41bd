//! Rendezvous gates between the stimulator and monitor processes.
//!
//! Each gate is a single SysV semaphore preloaded with one unit of
//! "closedness". Waiting blocks until the value reaches zero; opening
//! removes the unit. Keys are derived with `ftok` from a lock file so that
//! both processes (and `ipcs`) can name the same pair.
//!
//! Protocol for one session:
//!
//! ```text
//!  stimulator (parent)              monitor (child)
//!  -------------------              ---------------
//!  wait(stim-ready)  <------------  open(stim-ready)
//!  write events                     poll loop
//!  pad to duration                  ...
//!  wait(close-ready) <------------  open(close-ready)
//!  join + teardown
//! ```
//!
//! Gates are one-shot: a second open is reported and ignored, and a new
//! session must create a fresh pair.

use crate::signals;
#[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
use nix::sys::time::TimeSpec;
use std::ffi::CString;
use std::fs::OpenOptions;
use std::io;
use std::os::raw::c_int;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use stimmon_common::config::RendezvousConfig;
use stimmon_common::error::{StimMonError, StimMonResult};
use stimmon_common::time::Stopwatch;
use tracing::{debug, info, trace, warn};

/// Poll step of a bounded wait where `semtimedop` is unavailable.
#[cfg(not(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64"))))]
const TIMED_WAIT_STEP: Duration = Duration::from_millis(1);

/// Gate name: the stimulator may start.
pub const STIM_READY: &str = "stim-ready";
/// Gate name: the monitor has finished and teardown may begin.
pub const CLOSE_READY: &str = "close-ready";

fn resource_error(what: &str, err: &io::Error) -> StimMonError {
    StimMonError::Resource(format!("{what}: {err}"))
}

/// One side of the gate pair.
///
/// A plain copyable identifier: both processes hold the same id after the
/// fork and ownership of the semaphore stays with [`GatePair`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gate {
    id: c_int,
    name: &'static str,
}

impl Gate {
    /// Gate name used in logs and timeout errors.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    fn semop(&self, op: i16, flags: c_int) -> io::Result<()> {
        #[allow(clippy::cast_possible_truncation)]
        let sem_flg = flags as i16;
        let mut buf = libc::sembuf {
            sem_num: 0,
            sem_op: op,
            sem_flg,
        };
        // SAFETY: one valid sembuf for a single-semaphore set
        let rc = unsafe { libc::semop(self.id, &mut buf, 1) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// Block until the gate is opened.
    ///
    /// With `timeout` absent the wait is unbounded; a crashed peer then
    /// blocks this process indefinitely.
    ///
    /// # Errors
    ///
    /// - [`StimMonError::RendezvousTimeout`] if `timeout` expires
    /// - [`StimMonError::Interrupted`] if an interrupt signal arrives
    /// - [`StimMonError::Resource`] if the semaphore is gone or invalid
    pub fn wait(&self, timeout: Option<Duration>) -> StimMonResult<()> {
        debug!(gate = self.name, ?timeout, "Waiting on gate");
        let result = match timeout {
            None => self.wait_unbounded(),
            Some(limit) => self.wait_bounded(limit),
        };
        result?;
        debug!(gate = self.name, "Gate passed");
        Ok(())
    }

    fn wait_unbounded(&self) -> StimMonResult<()> {
        loop {
            match self.semop(0, 0) {
                Ok(()) => return Ok(()),
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => {
                    signals::check()?;
                    trace!(gate = self.name, "Gate wait restarted after EINTR");
                }
                Err(e) => return Err(resource_error(self.name, &e)),
            }
        }
    }

    fn wait_bounded(&self, limit: Duration) -> StimMonResult<()> {
        let clock = Stopwatch::start();
        loop {
            match self.timed_wait(clock.remaining(limit)) {
                Ok(()) => return Ok(()),
                Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => {}
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => {
                    signals::check()?;
                    trace!(gate = self.name, "Timed gate wait restarted after EINTR");
                }
                Err(e) => return Err(resource_error(self.name, &e)),
            }

            if clock.has_elapsed(limit) {
                warn!(gate = self.name, ?limit, "Rendezvous wait timed out");
                return Err(StimMonError::RendezvousTimeout {
                    gate: self.name.to_string(),
                });
            }
        }
    }

    /// Wait for zero for at most `limit`; `EAGAIN` means the limit passed.
    #[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
    fn timed_wait(&self, limit: Duration) -> io::Result<()> {
        let timeout = TimeSpec::from_duration(limit);
        let mut buf = libc::sembuf {
            sem_num: 0,
            sem_op: 0,
            sem_flg: 0,
        };
        // SAFETY: one valid sembuf and a timespec that outlive the call
        let rc = unsafe {
            libc::syscall(
                libc::SYS_semtimedop,
                self.id,
                &mut buf as *mut libc::sembuf,
                1usize,
                timeout.as_ref() as *const libc::timespec,
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64"))))]
    fn timed_wait(&self, limit: Duration) -> io::Result<()> {
        let result = self.semop(0, libc::IPC_NOWAIT);
        if matches!(&result, Err(e) if e.raw_os_error() == Some(libc::EAGAIN)) {
            std::thread::sleep(limit.min(TIMED_WAIT_STEP));
        }
        result
    }

    /// Open the gate, releasing the peer blocked in [`Gate::wait`].
    ///
    /// Never blocks. Returns false (with a warning) if the gate was already
    /// open.
    ///
    /// # Errors
    ///
    /// Returns [`StimMonError::Resource`] if the semaphore is gone or invalid.
    pub fn open(&self) -> StimMonResult<bool> {
        match self.semop(-1, libc::IPC_NOWAIT) {
            Ok(()) => {
                debug!(gate = self.name, "Gate opened");
                Ok(true)
            }
            Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => {
                warn!(gate = self.name, "Gate already open");
                Ok(false)
            }
            Err(e) => Err(resource_error(self.name, &e)),
        }
    }

    /// Whether the gate has been opened.
    ///
    /// # Errors
    ///
    /// Returns [`StimMonError::Resource`] if the semaphore is gone or invalid.
    pub fn is_open(&self) -> StimMonResult<bool> {
        // SAFETY: GETVAL takes no extra argument
        let value = unsafe { libc::semctl(self.id, 0, libc::GETVAL) };
        if value < 0 {
            return Err(resource_error(self.name, &io::Error::last_os_error()));
        }
        Ok(value == 0)
    }
}

/// The `stim-ready` / `close-ready` pair.
///
/// Created before the fork and removed by the parent after the join.
/// [`GatePair::remove`] is idempotent and also runs on drop.
#[derive(Debug)]
pub struct GatePair {
    stim_ready: Gate,
    close_ready: Gate,
    lock_path: PathBuf,
    removed: bool,
}

fn derive_key(path: &Path, id: char) -> StimMonResult<libc::key_t> {
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        StimMonError::Resource(format!("lock path {} contains a NUL byte", path.display()))
    })?;
    let mut buf = [0u8; 4];
    let proj = id.encode_utf8(&mut buf).as_bytes()[0];

    // SAFETY: c_path is a valid NUL-terminated string
    let key = unsafe { libc::ftok(c_path.as_ptr(), c_int::from(proj)) };
    if key == -1 {
        return Err(resource_error(
            &format!("ftok({}, {id:?})", path.display()),
            &io::Error::last_os_error(),
        ));
    }
    Ok(key)
}

fn create_gate(key: libc::key_t, name: &'static str) -> StimMonResult<Gate> {
    // SAFETY: plain syscall wrapper
    let id = unsafe { libc::semget(key, 1, 0o600 | libc::IPC_CREAT) };
    if id < 0 {
        return Err(resource_error(name, &io::Error::last_os_error()));
    }

    // A key left over from an earlier session is reset to closed
    // SAFETY: SETVAL takes an int argument
    let rc = unsafe { libc::semctl(id, 0, libc::SETVAL, 1) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        remove_semaphore(id, name);
        return Err(resource_error(name, &err));
    }

    Ok(Gate { id, name })
}

fn remove_semaphore(id: c_int, name: &str) {
    // SAFETY: IPC_RMID takes no extra argument
    let rc = unsafe { libc::semctl(id, 0, libc::IPC_RMID) };
    if rc < 0 {
        warn!(gate = name, error = %io::Error::last_os_error(), "Failed to remove gate");
    }
}

impl GatePair {
    /// Create both gates in the closed state.
    ///
    /// The lock file is created if missing.
    ///
    /// # Errors
    ///
    /// Returns [`StimMonError::Resource`] if the lock file, key derivation or
    /// semaphore creation fails. Nothing is left behind on failure.
    pub fn create(config: &RendezvousConfig) -> StimMonResult<Self> {
        let lock_path = config.lock_path.clone();
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&lock_path)
            .map_err(|e| resource_error(&format!("lock file {}", lock_path.display()), &e))?;

        let result = Self::create_keyed(config);
        if result.is_err() {
            let _ = std::fs::remove_file(&lock_path);
        }
        let (stim_ready, close_ready) = result?;

        info!(
            lock_path = %lock_path.display(),
            stim_ready = stim_ready.id,
            close_ready = close_ready.id,
            "Rendezvous gates created"
        );
        Ok(Self {
            stim_ready,
            close_ready,
            lock_path,
            removed: false,
        })
    }

    fn create_keyed(config: &RendezvousConfig) -> StimMonResult<(Gate, Gate)> {
        let stim_key = derive_key(&config.lock_path, config.stim_key_id)?;
        let close_key = derive_key(&config.lock_path, config.close_key_id)?;

        let stim_ready = create_gate(stim_key, STIM_READY)?;
        match create_gate(close_key, CLOSE_READY) {
            Ok(close_ready) => Ok((stim_ready, close_ready)),
            Err(e) => {
                remove_semaphore(stim_ready.id, STIM_READY);
                Err(e)
            }
        }
    }

    /// Gate the stimulator waits on before writing.
    #[must_use]
    pub fn stim_ready(&self) -> Gate {
        self.stim_ready
    }

    /// Gate the stimulator waits on before teardown.
    #[must_use]
    pub fn close_ready(&self) -> Gate {
        self.close_ready
    }

    /// Lock file the keys were derived from.
    #[must_use]
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Remove both semaphores and the lock file.
    ///
    /// Returns true if this call did the removal.
    pub fn remove(&mut self) -> bool {
        if self.removed {
            return false;
        }
        self.removed = true;

        remove_semaphore(self.stim_ready.id, STIM_READY);
        remove_semaphore(self.close_ready.id, CLOSE_READY);
        match std::fs::remove_file(&self.lock_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(lock_path = %self.lock_path.display(), error = %e, "Failed to remove lock file");
            }
        }

        debug!("Rendezvous gates removed");
        true
    }
}

impl Drop for GatePair {
    fn drop(&mut self) {
        self.remove();
    }
}
