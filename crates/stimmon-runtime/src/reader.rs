//! Duration-bounded event reader for the monitor endpoint.
//!
//! Polls the monitor into one reusable buffer until the role's stopwatch
//! passes the monitoring duration, appending each event to the sink as
//! `timestamp_us<TAB>address` with the address masked to 16 bits. A failed
//! poll is logged and the loop carries on. On exit the sink is rewound so
//! the caller can replay it from the start. A sink failure ends the loop
//! but keeps the counts gathered up to that point.

use crate::device::{DeviceFault, MonitorDevice, RawMonitorEvent};
use crate::signals;
use serde::Serialize;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::time::Duration;
use stimmon_common::error::{StimMonError, StimMonResult};
use stimmon_common::event::MonitoredEvent;
use stimmon_common::format::write_monitored_event;
use stimmon_common::time::Stopwatch;
use thiserror::Error;
use tracing::{debug, error, trace, warn};

/// Counters from one monitoring run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReadReport {
    /// Events appended to the sink.
    pub events: u64,
    /// Read polls issued.
    pub polls: u64,
    /// Polls that returned a driver error.
    pub failed_polls: u64,
    /// An interrupt signal ended the window early.
    pub interrupted: bool,
}

/// The sink failed; `report` holds what was monitored before the failure.
#[derive(Debug, Error)]
#[error("monitoring stopped after {} events", .report.events)]
pub struct ReadError {
    /// Counters up to the failure.
    pub report: ReadReport,
    /// What went wrong with the sink.
    #[source]
    pub source: StimMonError,
}

/// Polls a [`MonitorDevice`] into a fixed-capacity buffer.
#[derive(Debug)]
pub struct EventReader {
    buffer: Vec<RawMonitorEvent>,
    poll_interval: Duration,
}

fn sink_error(err: &std::io::Error) -> StimMonError {
    StimMonError::Monitoring(format!("failed to write sink: {err}"))
}

/// An empty non-blocking FIFO reports `EAGAIN` rather than zero events.
fn is_empty_fifo(fault: DeviceFault) -> bool {
    matches!(fault, DeviceFault::Os(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK)
}

impl EventReader {
    /// Allocate a poll buffer of `capacity` events.
    ///
    /// # Errors
    ///
    /// Returns [`StimMonError::Monitoring`] if the buffer cannot be allocated.
    pub fn with_capacity(capacity: usize) -> StimMonResult<Self> {
        let mut buffer = Vec::new();
        buffer.try_reserve_exact(capacity).map_err(|e| {
            StimMonError::Monitoring(format!(
                "failed to allocate a {capacity}-event poll buffer: {e}"
            ))
        })?;
        buffer.resize(capacity, RawMonitorEvent::default());
        Ok(Self {
            buffer,
            poll_interval: Duration::ZERO,
        })
    }

    /// Sleep this long after an empty or failed poll. Zero busy-polls.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Poll buffer capacity in events.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Poll until `clock` passes `duration`, appending events to `sink`.
    ///
    /// A zero duration issues no polls. An interrupt signal ends the loop
    /// early with [`ReadReport::interrupted`] set. The sink is rewound
    /// before returning.
    ///
    /// # Errors
    ///
    /// Returns a [`ReadError`] carrying the partial [`ReadReport`] if the
    /// sink cannot be written or rewound.
    pub fn read_for_duration<M, W>(
        &mut self,
        mon: &mut M,
        sink: &mut W,
        clock: &Stopwatch,
        duration: Duration,
    ) -> Result<ReadReport, ReadError>
    where
        M: MonitorDevice + ?Sized,
        W: Write + Seek + ?Sized,
    {
        let mut report = ReadReport::default();
        let failed = |report: ReadReport, source: StimMonError| {
            error!(events = report.events, error = %source, "Monitor sink failed");
            ReadError { report, source }
        };
        let mut out = BufWriter::new(&mut *sink);

        while !clock.has_elapsed(duration) {
            if signals::interrupted() {
                report.interrupted = true;
                break;
            }

            report.polls += 1;
            let idle = match mon.read(&mut self.buffer) {
                Ok(n) => {
                    for raw in &self.buffer[..n] {
                        let event = MonitoredEvent::from_raw(raw.time_us, raw.ae);
                        if let Err(e) = write_monitored_event(&mut out, &event) {
                            return Err(failed(report, sink_error(&e)));
                        }
                        report.events += 1;
                    }
                    if n > 0 {
                        trace!(events = n, total = report.events, "Monitor poll");
                    }
                    n == 0
                }
                Err(fault) if is_empty_fifo(fault) => true,
                Err(fault) => {
                    report.failed_polls += 1;
                    match fault {
                        DeviceFault::Os(_) => {
                            warn!(kind = fault.kind(), error = %fault, "Monitor poll failed");
                        }
                        DeviceFault::Hardware(_) | DeviceFault::Protocol(_) => {
                            error!(kind = fault.kind(), error = %fault, "Monitor poll failed");
                        }
                    }
                    true
                }
            };

            if idle && !self.poll_interval.is_zero() {
                let pause = self.poll_interval.min(clock.remaining(duration));
                if !pause.is_zero() {
                    std::thread::sleep(pause);
                }
            }
        }

        if let Err(e) = out.flush() {
            return Err(failed(report, sink_error(&e)));
        }
        drop(out);
        if let Err(e) = sink.seek(SeekFrom::Start(0)) {
            let source = StimMonError::Monitoring(format!("failed to rewind sink: {e}"));
            return Err(failed(report, source));
        }

        if report.interrupted {
            warn!(events = report.events, "Monitoring interrupted");
        }
        debug!(
            events = report.events,
            polls = report.polls,
            failed_polls = report.failed_polls,
            "Monitoring window closed"
        );
        Ok(report)
    }
}
