//! Simulated AER driver for testing without hardware.
//!
//! Implements the full driver contract in memory:
//! - configurable words per encoded event, partial writes, and a
//!   would-block point for the sequencer
//! - scripted poll results (including raw error codes) and timed
//!   loop-back replay for the monitor
//! - failure injection at any open/configure step
//!
//! Every call is recorded in a shared [`DeviceLog`] so tests can inspect
//! what the engine did. After a fork each process records into its own
//! copy of the log.

use crate::device::{
    AerDriver, DeviceFault, EncodedBatch, MonitorDevice, RawMonitorEvent, SequencerDevice,
    WriteFault,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use stimmon_common::event::{absolute_times_us, StimulusEvent};
use stimmon_common::time::Stopwatch;
use tracing::trace;

/// Driver step at which a simulated failure is injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    /// Opening the sequencer endpoint.
    OpenSequencer,
    /// Opening the monitor endpoint.
    OpenMonitor,
    /// Setting the monitor counter period.
    SetCounterPeriod,
    /// Enabling monitor time labels.
    SetTimeLabel,
    /// Resetting the monitor FIFO.
    ResetFifo,
    /// Resetting the counter during device configuration.
    ResetCounter,
}

/// Error code used for injected failures (`EIO`).
const INJECTED_FAULT: DeviceFault = DeviceFault::Os(libc::EIO);

#[derive(Debug, Default)]
struct LogState {
    counter_period_us: Option<u32>,
    time_label: bool,
    fifo_resets: u32,
    counter_resets: u32,
    words: Vec<u32>,
    write_calls: usize,
    reads: usize,
    sequencer_closes: u32,
    monitor_closes: u32,
}

/// Shared record of every simulated driver call.
#[derive(Debug, Clone, Default)]
pub struct DeviceLog {
    inner: Arc<Mutex<LogState>>,
}

impl DeviceLog {
    fn state(&self) -> MutexGuard<'_, LogState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Last counter period configured.
    pub fn counter_period_us(&self) -> Option<u32> {
        self.state().counter_period_us
    }

    /// Whether time labels are enabled.
    pub fn time_label(&self) -> bool {
        self.state().time_label
    }

    /// Number of FIFO resets.
    pub fn fifo_resets(&self) -> u32 {
        self.state().fifo_resets
    }

    /// Number of counter resets.
    pub fn counter_resets(&self) -> u32 {
        self.state().counter_resets
    }

    /// All words accepted by the sequencer, in order.
    pub fn words_written(&self) -> Vec<u32> {
        self.state().words.clone()
    }

    /// Number of `write_raw` calls, including rejected ones.
    pub fn write_calls(&self) -> usize {
        self.state().write_calls
    }

    /// Number of monitor polls.
    pub fn reads(&self) -> usize {
        self.state().reads
    }

    /// Number of times the sequencer was closed.
    pub fn sequencer_closes(&self) -> u32 {
        self.state().sequencer_closes
    }

    /// Number of times the monitor was closed.
    pub fn monitor_closes(&self) -> u32 {
        self.state().monitor_closes
    }
}

/// Scripted monitor behaviour.
///
/// Scripted polls are returned first, one per read; afterwards timed events
/// are released once the monitor's clock (started at the first read) passes
/// their timestamp. With both exhausted, reads return nothing.
#[derive(Debug, Clone, Default)]
pub struct MonitorScript {
    polls: VecDeque<Result<Vec<RawMonitorEvent>, i64>>,
    timed: Vec<RawMonitorEvent>,
}

impl MonitorScript {
    /// Empty script: every poll returns no events.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful poll returning `events`.
    #[must_use]
    pub fn poll(mut self, events: Vec<RawMonitorEvent>) -> Self {
        self.polls.push_back(Ok(events));
        self
    }

    /// Queue a failed poll with a raw driver return code.
    #[must_use]
    pub fn fail(mut self, code: i64) -> Self {
        self.polls.push_back(Err(code));
        self
    }

    /// Release `events` as the clock passes each `time_us`.
    #[must_use]
    pub fn timed(mut self, mut events: Vec<RawMonitorEvent>) -> Self {
        events.sort_by_key(|ev| ev.time_us);
        self.timed = events;
        self
    }

    /// Echo a stimulus back as if it had looped through the hardware.
    #[must_use]
    pub fn loopback(events: &[StimulusEvent]) -> Self {
        let timed = absolute_times_us(events)
            .into_iter()
            .zip(events)
            .map(|(time_us, ev)| RawMonitorEvent {
                time_us,
                ae: ev.address,
            })
            .collect();
        Self::new().timed(timed)
    }
}

#[derive(Debug, Clone)]
struct SequencerSettings {
    words_per_event: usize,
    max_words_per_write: Option<usize>,
    would_block_after_words: Option<usize>,
    fault_after_words: Option<usize>,
}

impl Default for SequencerSettings {
    fn default() -> Self {
        Self {
            words_per_event: 2,
            max_words_per_write: None,
            would_block_after_words: None,
            fault_after_words: None,
        }
    }
}

/// In-memory AER driver.
#[derive(Debug, Clone, Default)]
pub struct SimulatedDriver {
    sequencer: SequencerSettings,
    script: MonitorScript,
    fail_at: Option<FailPoint>,
    log: DeviceLog,
}

impl SimulatedDriver {
    /// Driver with two words per event, unlimited writes, and a silent monitor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode each event into `words` device words.
    #[must_use]
    pub fn with_words_per_event(mut self, words: usize) -> Self {
        self.sequencer.words_per_event = words.max(1);
        self
    }

    /// Accept at most `words` per `write_raw` call.
    #[must_use]
    pub fn with_max_words_per_write(mut self, words: usize) -> Self {
        self.sequencer.max_words_per_write = Some(words.max(1));
        self
    }

    /// Report would-block once `words` words in total have been accepted.
    #[must_use]
    pub fn with_would_block_after(mut self, words: usize) -> Self {
        self.sequencer.would_block_after_words = Some(words);
        self
    }

    /// Fail with `EIO` once `words` words in total have been accepted.
    #[must_use]
    pub fn with_write_fault_after(mut self, words: usize) -> Self {
        self.sequencer.fault_after_words = Some(words);
        self
    }

    /// Monitor behaviour.
    #[must_use]
    pub fn with_monitor_script(mut self, script: MonitorScript) -> Self {
        self.script = script;
        self
    }

    /// Inject a failure at `point`.
    #[must_use]
    pub fn fail_at(mut self, point: FailPoint) -> Self {
        self.fail_at = Some(point);
        self
    }

    /// Shared call log.
    #[must_use]
    pub fn log(&self) -> DeviceLog {
        self.log.clone()
    }

    fn check(&self, point: FailPoint) -> Result<(), DeviceFault> {
        if self.fail_at == Some(point) {
            Err(INJECTED_FAULT)
        } else {
            Ok(())
        }
    }
}

impl AerDriver for SimulatedDriver {
    type Sequencer = SimulatedSequencer;
    type Monitor = SimulatedMonitor;

    fn open_sequencer(&self, _index: u32) -> Result<SimulatedSequencer, DeviceFault> {
        self.check(FailPoint::OpenSequencer)?;
        Ok(SimulatedSequencer {
            settings: self.sequencer.clone(),
            fail_reset: self.fail_at == Some(FailPoint::ResetCounter),
            accepted: 0,
            log: self.log.clone(),
        })
    }

    fn open_monitor(&self, _index: u32, nonblocking: bool) -> Result<SimulatedMonitor, DeviceFault> {
        self.check(FailPoint::OpenMonitor)?;
        Ok(SimulatedMonitor {
            script: self.script.clone(),
            timed_cursor: 0,
            clock: None,
            nonblocking,
            fail_at: self.fail_at,
            log: self.log.clone(),
        })
    }
}

/// Simulated sequencer endpoint.
#[derive(Debug)]
pub struct SimulatedSequencer {
    settings: SequencerSettings,
    fail_reset: bool,
    accepted: usize,
    log: DeviceLog,
}

impl SequencerDevice for SimulatedSequencer {
    fn reset_counter(&mut self) -> Result<(), DeviceFault> {
        if self.fail_reset {
            return Err(INJECTED_FAULT);
        }
        self.log.state().counter_resets += 1;
        Ok(())
    }

    fn encode(
        &self,
        events: &[StimulusEvent],
        words: &mut [u32],
        boundaries: &mut Vec<usize>,
    ) -> Result<EncodedBatch, DeviceFault> {
        let per_event = self.settings.words_per_event;
        boundaries.clear();

        let mut used = 0;
        for ev in events {
            if used + per_event > words.len() {
                break;
            }
            let slot = &mut words[used..used + per_event];
            slot.fill(0);
            slot[0] = ev.interval_us;
            if let Some(addr) = slot.get_mut(1) {
                *addr = ev.address;
            }
            used += per_event;
            boundaries.push(used);
        }

        Ok(EncodedBatch {
            words: used,
            events: boundaries.len(),
        })
    }

    fn write_raw(&mut self, words: &[u32]) -> Result<usize, WriteFault> {
        let mut log = self.log.state();
        log.write_calls += 1;

        let mut limit = words.len();
        if let Some(max) = self.settings.max_words_per_write {
            limit = limit.min(max);
        }
        if let Some(stop) = self.settings.fault_after_words {
            if self.accepted >= stop {
                return Err(WriteFault::Fault(DeviceFault::Os(libc::EIO)));
            }
            limit = limit.min(stop - self.accepted);
        }
        if let Some(stop) = self.settings.would_block_after_words {
            if self.accepted >= stop {
                return Err(WriteFault::WouldBlock);
            }
            limit = limit.min(stop - self.accepted);
        }

        log.words.extend_from_slice(&words[..limit]);
        self.accepted += limit;
        trace!(requested = words.len(), accepted = limit, "Simulated raw write");
        Ok(limit)
    }

    fn close(&mut self) -> Result<(), DeviceFault> {
        self.log.state().sequencer_closes += 1;
        Ok(())
    }
}

/// Simulated monitor endpoint.
#[derive(Debug)]
pub struct SimulatedMonitor {
    script: MonitorScript,
    timed_cursor: usize,
    clock: Option<Stopwatch>,
    nonblocking: bool,
    fail_at: Option<FailPoint>,
    log: DeviceLog,
}

impl SimulatedMonitor {
    fn check(&self, point: FailPoint) -> Result<(), DeviceFault> {
        if self.fail_at == Some(point) {
            Err(INJECTED_FAULT)
        } else {
            Ok(())
        }
    }

    fn release_timed(&mut self, buf: &mut [RawMonitorEvent]) -> usize {
        let clock = *self.clock.get_or_insert_with(Stopwatch::start);
        let now_us = u128::from(u32::MAX).min(clock.elapsed().as_micros());

        let mut filled = 0;
        while filled < buf.len() {
            match self.script.timed.get(self.timed_cursor) {
                Some(ev) if u128::from(ev.time_us) <= now_us => {
                    buf[filled] = *ev;
                    filled += 1;
                    self.timed_cursor += 1;
                }
                _ => break,
            }
        }
        filled
    }
}

impl MonitorDevice for SimulatedMonitor {
    fn set_counter_period(&mut self, period_us: u32) -> Result<(), DeviceFault> {
        self.check(FailPoint::SetCounterPeriod)?;
        self.log.state().counter_period_us = Some(period_us);
        Ok(())
    }

    fn set_time_label(&mut self, enabled: bool) -> Result<(), DeviceFault> {
        self.check(FailPoint::SetTimeLabel)?;
        self.log.state().time_label = enabled;
        Ok(())
    }

    fn reset_fifo(&mut self) -> Result<(), DeviceFault> {
        self.check(FailPoint::ResetFifo)?;
        self.log.state().fifo_resets += 1;
        Ok(())
    }

    fn read(&mut self, buf: &mut [RawMonitorEvent]) -> Result<usize, DeviceFault> {
        self.log.state().reads += 1;

        if let Some(poll) = self.script.polls.pop_front() {
            let mut events = poll.map_err(DeviceFault::classify)?;
            let n = events.len().min(buf.len());
            buf[..n].copy_from_slice(&events[..n]);
            if n < events.len() {
                events.drain(..n);
                self.script.polls.push_front(Ok(events));
            }
            return Ok(n);
        }

        let n = self.release_timed(buf);
        if n == 0 && !self.nonblocking {
            // A blocking endpoint would sit in the driver until its timeout
            std::thread::sleep(Duration::from_micros(100));
        }
        Ok(n)
    }

    fn close(&mut self) -> Result<(), DeviceFault> {
        self.log.state().monitor_closes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(time_us: u32, ae: u32) -> RawMonitorEvent {
        RawMonitorEvent { time_us, ae }
    }

    #[test]
    fn test_encode_two_words_per_event() {
        let driver = SimulatedDriver::new();
        let seq = driver.open_sequencer(0).unwrap();
        let events = [StimulusEvent::new(100, 5), StimulusEvent::new(200, 7)];
        let mut words = [0u32; 8];
        let mut bounds = Vec::new();

        let batch = seq.encode(&events, &mut words, &mut bounds).unwrap();
        assert_eq!(batch, EncodedBatch { words: 4, events: 2 });
        assert_eq!(&words[..4], &[100, 5, 200, 7]);
        assert_eq!(bounds, vec![2, 4]);
    }

    #[test]
    fn test_encode_stops_at_capacity() {
        let driver = SimulatedDriver::new().with_words_per_event(3);
        let seq = driver.open_sequencer(0).unwrap();
        let events = [StimulusEvent::new(1, 1); 4];
        let mut words = [0u32; 7];
        let mut bounds = Vec::new();

        let batch = seq.encode(&events, &mut words, &mut bounds).unwrap();
        assert_eq!(batch.events, 2);
        assert_eq!(batch.words, 6);

        let mut tiny = [0u32; 2];
        let batch = seq.encode(&events, &mut tiny, &mut bounds).unwrap();
        assert_eq!(batch.events, 0);
        assert!(bounds.is_empty());
    }

    #[test]
    fn test_partial_writes_and_would_block() {
        let driver = SimulatedDriver::new()
            .with_max_words_per_write(3)
            .with_would_block_after(5);
        let mut seq = driver.open_sequencer(0).unwrap();
        let words = [1u32, 2, 3, 4, 5, 6, 7, 8];

        assert_eq!(seq.write_raw(&words), Ok(3));
        assert_eq!(seq.write_raw(&words[3..]), Ok(2));
        assert_eq!(seq.write_raw(&words[5..]), Err(WriteFault::WouldBlock));
        assert_eq!(driver.log().words_written(), vec![1, 2, 3, 4, 5]);
        assert_eq!(driver.log().write_calls(), 3);
    }

    #[test]
    fn test_write_fault() {
        let driver = SimulatedDriver::new().with_write_fault_after(0);
        let mut seq = driver.open_sequencer(0).unwrap();
        assert_eq!(
            seq.write_raw(&[1, 2]),
            Err(WriteFault::Fault(DeviceFault::Os(libc::EIO)))
        );
    }

    #[test]
    fn test_scripted_polls_split_across_small_buffer() {
        let script = MonitorScript::new()
            .poll(vec![raw(1, 10), raw(2, 11), raw(3, 12)])
            .fail(i64::from(libc::EAGAIN));
        let driver = SimulatedDriver::new().with_monitor_script(script);
        let mut mon = driver.open_monitor(0, true).unwrap();
        let mut buf = [RawMonitorEvent::default(); 2];

        assert_eq!(mon.read(&mut buf), Ok(2));
        assert_eq!(buf[1], raw(2, 11));
        assert_eq!(mon.read(&mut buf), Ok(1));
        assert_eq!(buf[0], raw(3, 12));
        assert_eq!(mon.read(&mut buf), Err(DeviceFault::Os(libc::EAGAIN)));
        assert_eq!(mon.read(&mut buf), Ok(0));
        assert_eq!(driver.log().reads(), 4);
    }

    #[test]
    fn test_loopback_releases_over_time() {
        let events = [StimulusEvent::new(0, 3), StimulusEvent::new(20_000, 4)];
        let driver = SimulatedDriver::new().with_monitor_script(MonitorScript::loopback(&events));
        let mut mon = driver.open_monitor(0, true).unwrap();
        let mut buf = [RawMonitorEvent::default(); 8];

        assert_eq!(mon.read(&mut buf), Ok(1));
        assert_eq!(buf[0], raw(0, 3));

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(mon.read(&mut buf), Ok(1));
        assert_eq!(buf[0], raw(20_000, 4));
        assert_eq!(mon.read(&mut buf), Ok(0));
    }

    #[test]
    fn test_injected_failures() {
        let driver = SimulatedDriver::new().fail_at(FailPoint::OpenSequencer);
        assert!(driver.open_sequencer(0).is_err());

        let driver = SimulatedDriver::new().fail_at(FailPoint::SetTimeLabel);
        let mut mon = driver.open_monitor(0, true).unwrap();
        assert!(mon.set_counter_period(1).is_ok());
        assert_eq!(mon.set_time_label(true), Err(DeviceFault::Os(libc::EIO)));
    }
}
