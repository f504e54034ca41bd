//! Elapsed-time measurement for the stimulator and monitor roles.
//!
//! Each role owns its own [`Stopwatch`]; the two processes share no clock
//! reference beyond the rendezvous gates.

use nix::time::{clock_gettime, ClockId};
use std::time::Duration;
use tracing::warn;

const MICROS_PER_SEC: i64 = 1_000_000;

/// A clock reading split into whole seconds and microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    secs: i64,
    micros: i64,
}

impl Timestamp {
    /// Build a timestamp from its two components.
    #[must_use]
    pub const fn new(secs: i64, micros: i64) -> Self {
        Self { secs, micros }
    }

    /// Read `CLOCK_MONOTONIC` at microsecond resolution.
    #[must_use]
    pub fn now() -> Option<Self> {
        let ts = clock_gettime(ClockId::CLOCK_MONOTONIC).ok()?;
        Some(Self {
            secs: i64::from(ts.tv_sec()),
            micros: i64::from(ts.tv_nsec()) / 1_000,
        })
    }

    /// Time elapsed from `earlier` to `self`, borrowing a second when the
    /// microsecond component wrapped. Returns zero if `earlier` is later.
    #[must_use]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let mut secs = self.secs - earlier.secs;
        let mut micros = self.micros;
        if micros < earlier.micros {
            micros += MICROS_PER_SEC;
            secs -= 1;
        }
        micros -= earlier.micros;

        if secs < 0 {
            return Duration::ZERO;
        }
        Duration::from_secs(secs.unsigned_abs()) + Duration::from_micros(micros.unsigned_abs())
    }
}

/// Measures time elapsed since [`Stopwatch::start`].
///
/// If the clock cannot be read, `elapsed` reports [`Duration::MAX`] so that
/// every duration-bounded loop terminates.
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    started: Option<Timestamp>,
}

impl Stopwatch {
    /// Record the reference timestamp.
    #[must_use]
    pub fn start() -> Self {
        Self {
            started: Timestamp::now(),
        }
    }

    /// Time elapsed since `start`.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        match (self.started, Timestamp::now()) {
            (Some(start), Some(now)) => now.duration_since(start),
            _ => Duration::MAX,
        }
    }

    /// Elapsed time in seconds.
    #[must_use]
    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed().as_secs_f64()
    }

    /// Whether at least `duration` has elapsed.
    #[must_use]
    pub fn has_elapsed(&self, duration: Duration) -> bool {
        self.elapsed() >= duration
    }

    /// Time left until `duration` has elapsed (zero once it has).
    #[must_use]
    pub fn remaining(&self, duration: Duration) -> Duration {
        duration.saturating_sub(self.elapsed())
    }
}

/// Convert a role duration given in milliseconds.
///
/// Negative or NaN values mean the role does not run and become zero.
#[must_use]
pub fn duration_from_millis(ms: f64) -> Duration {
    if ms.is_nan() || ms <= 0.0 {
        if ms < 0.0 || ms.is_nan() {
            warn!(ms, "Negative duration treated as zero");
        }
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(ms / 1_000.0).unwrap_or(Duration::MAX)
}

/// Stimulus and monitor durations, with the monitor window defaulting to
/// the stimulus window.
#[must_use]
pub fn role_durations(stim_ms: f64, mon_ms: Option<f64>) -> (Duration, Duration) {
    let stim = duration_from_millis(stim_ms);
    let mon = mon_ms.map_or(stim, duration_from_millis);
    (stim, mon)
}
