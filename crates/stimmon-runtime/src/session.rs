//! Session orchestration: setup, fork, role execution, join, teardown.
//!
//! The parent process runs the stimulator and the forked child runs the
//! monitor. Setup failures abort before the split; after the split the
//! parent always reaps the child and releases gates and device handles
//! exactly once, whatever either role did.
//!
//! # Lifecycle
//!
//! ```text
//! IDLE -> DEVICE_READY -> GATES_READY -> RUNNING -> JOINED -> TORN_DOWN
//!   \__________\______________\_____-> ABORTED
//! ```
//!
//! The child never returns into the caller's control flow: it leaves with
//! `_exit` and a status code that the parent translates back into a
//! monitoring error. Its event count and failure code travel back through
//! a [`SharedTally`].

use crate::device::{AerDriver, DeviceHandles, MonitorDevice, SequencerDevice};
use crate::gate::{Gate, GatePair};
use crate::reader::{EventReader, ReadReport};
use crate::shared::{MonitorFault, SharedTally};
use crate::signals::{self, InterruptGuard};
use crate::writer::EventWriter;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use serde::Serialize;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;
use stimmon_common::config::SessionConfig;
use stimmon_common::error::{StimMonError, StimMonResult};
use stimmon_common::event::StimulusEvent;
use stimmon_common::state::{PhaseTracker, SessionPhase};
use stimmon_common::time::Stopwatch;
use tracing::{debug, error, info, warn};

/// Monitor child exit status: window completed.
const MONITOR_OK: i32 = 0;
/// Monitor child exit status: the role failed.
const MONITOR_FAILED: i32 = 1;
/// Monitor child exit status: an interrupt ended the window.
const MONITOR_INTERRUPTED: i32 = 2;
/// Monitor child exit status: the role panicked.
const MONITOR_PANICKED: i32 = 3;

/// Outcome of one session.
///
/// Role failures are reported here rather than as an `Err` from
/// [`Session::run`]: partial results (events sent, events monitored) are
/// kept alongside the error text.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionReport {
    /// Events passed to the session.
    pub events_requested: usize,
    /// Events fully written to the sequencer.
    pub events_sent: usize,
    /// The sequencer reported would-block before all events were sent.
    pub would_block: bool,
    /// Events recorded by the monitor.
    pub monitored_events: u64,
    /// Stimulation window in seconds.
    pub stim_duration_secs: f64,
    /// Monitoring window in seconds.
    pub mon_duration_secs: f64,
    /// Stimulator time from release to the end of its padding wait.
    pub stim_elapsed_secs: f64,
    /// Stimulator failure, if any.
    pub stimulation_error: Option<String>,
    /// Monitor failure, if any.
    pub monitoring_error: Option<String>,
}

impl SessionReport {
    /// Whether both roles completed without error.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.stimulation_error.is_none() && self.monitoring_error.is_none()
    }

    /// Process exit status: 0 on success, -1 otherwise.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            -1
        }
    }
}

/// What the stimulator role did.
#[derive(Debug, Default)]
struct StimOutcome {
    events_sent: usize,
    would_block: bool,
    elapsed: Duration,
    error: Option<StimMonError>,
    /// The peer cannot be relied on to finish the protocol.
    abandon_peer: bool,
}

impl StimOutcome {
    fn fail(&mut self, err: StimMonError) {
        if matches!(
            err,
            StimMonError::RendezvousTimeout { .. } | StimMonError::Interrupted { .. }
        ) {
            self.abandon_peer = true;
        }
        if self.error.is_none() {
            self.error = Some(err);
        }
    }
}

/// One stimulator/monitor pair bound to a driver.
pub struct Session<D: AerDriver> {
    driver: D,
    config: SessionConfig,
    phase: PhaseTracker,
}

impl<D: AerDriver> Session<D> {
    /// Create an idle session.
    pub fn new(driver: D, config: SessionConfig) -> Self {
        Self {
            driver,
            config,
            phase: PhaseTracker::new(),
        }
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.phase.phase()
    }

    /// Session configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Underlying driver.
    #[must_use]
    pub fn driver(&self) -> &D {
        &self.driver
    }

    fn enter(&mut self, target: SessionPhase) {
        if let Err(e) = self.phase.transition(target) {
            warn!(error = %e, "Unexpected session phase transition");
        }
    }

    fn abort(&mut self, err: StimMonError) -> StimMonError {
        error!(phase = %self.phase.phase(), error = %err, "Session setup failed");
        self.enter(SessionPhase::Aborted);
        err
    }

    /// Stimulate with `events` for `stim_duration` while monitoring into
    /// `sink` for `mon_duration`.
    ///
    /// A zero `stim_duration` sends nothing but still completes the
    /// rendezvous. On return the sink is positioned at its start.
    ///
    /// # Errors
    ///
    /// Setup failures before the split are returned as errors:
    /// [`StimMonError::DeviceInit`], [`StimMonError::Resource`] or
    /// [`StimMonError::Fork`]. Role failures are reported in the
    /// [`SessionReport`].
    pub fn run(
        &mut self,
        events: &[StimulusEvent],
        stim_duration: Duration,
        mon_duration: Duration,
        sink: &mut File,
    ) -> StimMonResult<SessionReport> {
        if self.phase.phase().is_finished() {
            self.enter(SessionPhase::Idle);
        }
        info!(
            events = events.len(),
            stim_ms = stim_duration.as_millis(),
            mon_ms = mon_duration.as_millis(),
            "Starting session"
        );

        let mut handles = match DeviceHandles::open(&self.driver, &self.config.device) {
            Ok(handles) => handles,
            Err(e) => return Err(self.abort(e)),
        };
        self.enter(SessionPhase::DeviceReady);

        let mut gates = match GatePair::create(&self.config.rendezvous) {
            Ok(gates) => gates,
            Err(e) => {
                handles.release();
                return Err(self.abort(e));
            }
        };
        self.enter(SessionPhase::GatesReady);

        let tally = SharedTally::new();
        let guard = if self.config.handle_signals {
            Some(InterruptGuard::install())
        } else {
            None
        }
        .transpose();
        let (tally, _guard) = match (tally, guard) {
            (Ok(tally), Ok(guard)) => (tally, guard),
            (Err(e), _) | (_, Err(e)) => {
                gates.remove();
                handles.release();
                return Err(self.abort(e));
            }
        };

        let (seq, mon) = match handles.split() {
            Ok(split) => split,
            Err(e) => {
                gates.remove();
                return Err(self.abort(e));
            }
        };
        let (stim_ready, close_ready) = (gates.stim_ready(), gates.close_ready());

        // SAFETY: the child only runs the monitor role and leaves with _exit
        let child = match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let status = monitor_child(
                    mon,
                    sink,
                    stim_ready,
                    close_ready,
                    &self.config,
                    mon_duration,
                    &tally,
                );
                unsafe { libc::_exit(status) };
            }
            Ok(ForkResult::Parent { child }) => child,
            Err(e) => {
                gates.remove();
                handles.release();
                return Err(self.abort(StimMonError::Fork(e.to_string())));
            }
        };
        self.enter(SessionPhase::Running);
        debug!(monitor_pid = child.as_raw(), "Monitor process started");

        let writer = EventWriter::new(&self.config.buffers);
        let outcome = stimulate(
            seq,
            &writer,
            stim_ready,
            close_ready,
            &self.config,
            events,
            stim_duration,
        );
        if let Some(e) = &outcome.error {
            error!(error = %e, events_sent = outcome.events_sent, "Stimulation failed");
        }
        if outcome.abandon_peer {
            warn!(monitor_pid = child.as_raw(), "Terminating monitor process");
            if let Err(e) = kill(child, Signal::SIGTERM) {
                warn!(error = %e, "Failed to signal monitor process");
            }
        }

        let monitoring_error = match reap(child) {
            Ok(status) => monitor_status_error(status, tally.fault()),
            Err(e) => Some(e.to_string()),
        };
        self.enter(SessionPhase::Joined);

        gates.remove();
        handles.release();
        self.enter(SessionPhase::TornDown);

        sink.seek(SeekFrom::Start(0))?;

        let report = SessionReport {
            events_requested: events.len(),
            events_sent: outcome.events_sent,
            would_block: outcome.would_block,
            monitored_events: tally.get().unwrap_or(0),
            stim_duration_secs: stim_duration.as_secs_f64(),
            mon_duration_secs: mon_duration.as_secs_f64(),
            stim_elapsed_secs: outcome.elapsed.as_secs_f64(),
            stimulation_error: outcome.error.map(|e| e.to_string()),
            monitoring_error,
        };
        if let Some(e) = &report.monitoring_error {
            error!(error = %e, "Monitoring failed");
        }
        info!(
            events_sent = report.events_sent,
            monitored = report.monitored_events,
            success = report.is_success(),
            "Session complete"
        );
        Ok(report)
    }
}

/// Stimulator role, run in the parent.
fn stimulate<S: SequencerDevice + ?Sized>(
    seq: &mut S,
    writer: &EventWriter,
    stim_ready: Gate,
    close_ready: Gate,
    config: &SessionConfig,
    events: &[StimulusEvent],
    duration: Duration,
) -> StimOutcome {
    let mut outcome = StimOutcome::default();
    let timeout = config.rendezvous.timeout;

    if let Err(e) = stim_ready.wait(timeout) {
        outcome.fail(e);
        return outcome;
    }
    settle_counter(seq, config.device.counter_resets, &mut outcome);

    if duration.is_zero() {
        debug!("Zero stimulation window; nothing to send");
    } else {
        stimulate_window(seq, writer, config, events, duration, &mut outcome);
        if outcome.abandon_peer {
            return outcome;
        }
    }

    if let Err(e) = close_ready.wait(timeout) {
        outcome.fail(e);
    }
    outcome
}

/// The counter only settles after repeated resets.
fn settle_counter<S: SequencerDevice + ?Sized>(
    seq: &mut S,
    resets: u32,
    outcome: &mut StimOutcome,
) {
    for _ in 0..resets {
        if let Err(fault) = seq.reset_counter() {
            outcome.fail(StimMonError::Stimulation(format!(
                "counter reset failed: {fault}"
            )));
            break;
        }
    }
}

fn stimulate_window<S: SequencerDevice + ?Sized>(
    seq: &mut S,
    writer: &EventWriter,
    config: &SessionConfig,
    events: &[StimulusEvent],
    duration: Duration,
    outcome: &mut StimOutcome,
) {
    let clock = Stopwatch::start();
    if outcome.error.is_none() {
        match writer.write_blocking(seq, events) {
            Ok(report) => {
                outcome.events_sent = report.events_written;
                outcome.would_block = report.would_block;
            }
            Err(e) => {
                outcome.events_sent = e.events_written();
                outcome.fail(StimMonError::Stimulation(e.to_string()));
            }
        }
    }

    // The hardware has no "wait until T" primitive; pad out the window
    let granularity = config.timing.stim_wait_granularity;
    while !clock.has_elapsed(duration) {
        if let Err(e) = signals::check() {
            outcome.fail(e);
            break;
        }
        let pause = clock.remaining(duration);
        std::thread::sleep(if granularity.is_zero() {
            pause
        } else {
            pause.min(granularity)
        });
    }
    outcome.elapsed = clock.elapsed();
    debug!(
        elapsed_ms = outcome.elapsed.as_millis(),
        events_sent = outcome.events_sent,
        "Stimulation window closed"
    );
}

/// Why the monitor role stopped, with the events it recorded first.
#[derive(Debug)]
struct RoleFailure {
    fault: MonitorFault,
    events: u64,
    error: StimMonError,
}

impl RoleFailure {
    fn new(fault: MonitorFault, error: StimMonError) -> Self {
        Self {
            fault,
            events: 0,
            error,
        }
    }
}

/// Monitor role, run in the child.
///
/// Both gates are opened on every path once this function starts, so the
/// stimulator is never left waiting on a monitor that failed.
fn monitor_role<M: MonitorDevice + ?Sized>(
    mon: &mut M,
    sink: &mut File,
    stim_ready: Gate,
    close_ready: Gate,
    config: &SessionConfig,
    duration: Duration,
) -> Result<ReadReport, RoleFailure> {
    let clock = Stopwatch::start();
    let mut reader = match EventReader::with_capacity(config.buffers.monitor_buffer_events) {
        Ok(reader) => reader.with_poll_interval(config.timing.poll_interval),
        Err(e) => {
            let _ = stim_ready.open();
            let _ = close_ready.open();
            return Err(RoleFailure::new(MonitorFault::Allocation, e));
        }
    };

    if let Err(e) = stim_ready.open() {
        let _ = close_ready.open();
        return Err(RoleFailure::new(MonitorFault::Rendezvous, e));
    }
    let result = reader.read_for_duration(mon, sink, &clock, duration);
    let closed = close_ready.open();

    match (result, closed) {
        (Err(e), _) => Err(RoleFailure {
            fault: MonitorFault::Sink,
            events: e.report.events,
            error: e.source,
        }),
        (Ok(report), Err(e)) => Err(RoleFailure {
            fault: MonitorFault::Rendezvous,
            events: report.events,
            error: e,
        }),
        (Ok(report), Ok(_)) => Ok(report),
    }
}

/// Chain a panic hook that opens both gates.
///
/// The hook runs before unwinding or aborting, so the stimulator is also
/// released under `panic = "abort"`; it then reaps a SIGABRT.
fn release_gates_on_panic(stim_ready: Gate, close_ready: Gate) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let _ = stim_ready.open();
        let _ = close_ready.open();
        previous(info);
    }));
}

fn monitor_child<M: MonitorDevice + ?Sized>(
    mon: &mut M,
    sink: &mut File,
    stim_ready: Gate,
    close_ready: Gate,
    config: &SessionConfig,
    duration: Duration,
    tally: &SharedTally,
) -> i32 {
    release_gates_on_panic(stim_ready, close_ready);
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        monitor_role(mon, sink, stim_ready, close_ready, config, duration)
    }));

    match outcome {
        Ok(Ok(report)) => {
            tally.publish(report.events);
            if report.interrupted {
                MONITOR_INTERRUPTED
            } else {
                MONITOR_OK
            }
        }
        Ok(Err(failure)) => {
            tally.publish(failure.events);
            tally.record_fault(failure.fault);
            error!(error = %failure.error, events = failure.events, "Monitor role failed");
            MONITOR_FAILED
        }
        Err(_) => {
            tally.record_fault(MonitorFault::Panicked);
            MONITOR_PANICKED
        }
    }
}

fn reap(child: Pid) -> StimMonResult<WaitStatus> {
    loop {
        match waitpid(child, None) {
            Ok(status) => return Ok(status),
            Err(Errno::EINTR) => {}
            Err(e) => {
                return Err(StimMonError::Resource(format!(
                    "failed to reap monitor process {child}: {e}"
                )))
            }
        }
    }
}

fn monitor_status_error(status: WaitStatus, fault: Option<MonitorFault>) -> Option<String> {
    match status {
        WaitStatus::Exited(_, MONITOR_OK) => None,
        WaitStatus::Exited(_, MONITOR_INTERRUPTED) => {
            Some(StimMonError::Monitoring("monitor interrupted by signal".into()).to_string())
        }
        WaitStatus::Exited(_, MONITOR_FAILED) => {
            let reason = fault.map_or("monitor role failed", MonitorFault::describe);
            Some(StimMonError::Monitoring(reason.into()).to_string())
        }
        WaitStatus::Exited(_, MONITOR_PANICKED) => {
            Some(StimMonError::Monitoring("monitor role panicked".into()).to_string())
        }
        WaitStatus::Exited(_, code) => Some(
            StimMonError::Monitoring(format!("monitor exited with status {code}")).to_string(),
        ),
        WaitStatus::Signaled(_, signal, _) => Some(
            StimMonError::Monitoring(format!("monitor killed by {signal}")).to_string(),
        ),
        other => Some(
            StimMonError::Monitoring(format!("unexpected monitor status {other:?}")).to_string(),
        ),
    }
}
