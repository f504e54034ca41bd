//! End-to-end session acceptance tests.
//!
//! # Acceptance Criteria
//!
//! - A zero stimulation window sends nothing and still completes the
//!   rendezvous without deadlock
//! - The stimulator does not finish before its window has elapsed
//! - The sink is positioned at its start after every session
//! - Monitored addresses are always within `0..=65535`
//! - A monitor that cannot allocate its poll buffer still releases the
//!   stimulator, and the session reports the failure

use super::common::{two_events, Scratch, TWO_EVENTS};
use std::io::{BufReader, Seek};
use std::time::Duration;
use stimmon_common::event::ADDRESS_MASK;
use stimmon_common::format::{read_monitored_events, read_stimulus_file};
use stimmon_common::state::SessionPhase;
use stimmon_runtime::device::RawMonitorEvent;
use stimmon_runtime::session::Session;
use stimmon_runtime::simulated::{MonitorScript, SimulatedDriver};

#[test]
fn test_two_event_file_scenario() {
    let scratch = Scratch::new();
    let input = scratch.stimulus_file(TWO_EVENTS);
    let events = read_stimulus_file(&input).unwrap();
    assert_eq!(events, two_events());

    let driver = SimulatedDriver::new();
    let log = driver.log();
    let mut session = Session::new(driver, scratch.config());
    let mut sink = tempfile::tempfile().unwrap();

    let stim = Duration::from_millis(50);
    let report = session.run(&events, stim, stim, &mut sink).unwrap();

    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.events_sent, 2);
    assert_eq!(log.words_written(), vec![100, 5, 200, 7]);
    assert_eq!(sink.stream_position().unwrap(), 0);
    assert_eq!(session.phase(), SessionPhase::TornDown);
}

#[test]
fn test_zero_stimulation_completes_rendezvous() {
    let scratch = Scratch::new();
    let driver = SimulatedDriver::new();
    let log = driver.log();
    let mut session = Session::new(driver, scratch.config());
    let mut sink = tempfile::tempfile().unwrap();

    let report = session
        .run(&two_events(), Duration::ZERO, Duration::ZERO, &mut sink)
        .unwrap();
    assert!(report.is_success());
    assert_eq!(report.events_sent, 0);
    assert_eq!(report.monitored_events, 0);
    assert_eq!(log.write_calls(), 0);
    assert!(!scratch.lock_path().exists());
}

#[test]
fn test_stimulator_pads_to_window() {
    let scratch = Scratch::new();
    let mut session = Session::new(SimulatedDriver::new(), scratch.config());
    let mut sink = tempfile::tempfile().unwrap();

    let stim = Duration::from_millis(40);
    let report = session
        .run(&two_events(), stim, Duration::from_millis(5), &mut sink)
        .unwrap();
    assert!(report.stim_elapsed_secs >= stim.as_secs_f64());
}

#[test]
fn test_loopback_records_masked_events() {
    let scratch = Scratch::new();
    let events = vec![
        stimmon_common::event::StimulusEvent::new(1_000, 0x0001_0005),
        stimmon_common::event::StimulusEvent::new(1_000, 0xABCD_1234),
    ];
    let driver = SimulatedDriver::new().with_monitor_script(MonitorScript::loopback(&events));
    let mut session = Session::new(driver, scratch.config());
    let mut sink = tempfile::tempfile().unwrap();

    let report = session
        .run(&events, Duration::from_millis(20), Duration::from_millis(40), &mut sink)
        .unwrap();
    assert!(report.is_success());
    assert_eq!(report.monitored_events, 2);

    let recorded = read_monitored_events(BufReader::new(&mut sink)).unwrap();
    assert_eq!(recorded.len(), 2);
    assert_eq!(recorded[0].timestamp_us, 1_000);
    assert_eq!(recorded[0].address, 5);
    assert_eq!(recorded[1].address, 0x1234);
    assert!(recorded.iter().all(|ev| ev.address <= ADDRESS_MASK));
}

#[test]
fn test_transient_poll_errors_do_not_fail_session() {
    let scratch = Scratch::new();
    let script = MonitorScript::new()
        .fail(i64::from(libc::EIO))
        .poll(vec![RawMonitorEvent { time_us: 7, ae: 0xFFFF_FFFF }])
        .fail(0x0009_i64 << 32);
    let mut session = Session::new(
        SimulatedDriver::new().with_monitor_script(script),
        scratch.config(),
    );
    let mut sink = tempfile::tempfile().unwrap();

    let report = session
        .run(&two_events(), Duration::from_millis(10), Duration::from_millis(10), &mut sink)
        .unwrap();
    assert!(report.is_success());
    assert_eq!(report.monitored_events, 1);
}

#[test]
fn test_would_block_is_partial_success() {
    let scratch = Scratch::new();
    let mut session = Session::new(
        SimulatedDriver::new().with_would_block_after(2),
        scratch.config(),
    );
    let mut sink = tempfile::tempfile().unwrap();

    let report = session
        .run(&two_events(), Duration::from_millis(10), Duration::from_millis(10), &mut sink)
        .unwrap();
    assert!(report.is_success());
    assert!(report.would_block);
    assert_eq!(report.events_sent, 1);
}

#[test]
fn test_monitor_allocation_failure_releases_stimulator() {
    let scratch = Scratch::new();
    let mut config = scratch.config();
    config.buffers.monitor_buffer_events = usize::MAX;
    let driver = SimulatedDriver::new();
    let log = driver.log();
    let mut session = Session::new(driver, config);
    let mut sink = tempfile::tempfile().unwrap();

    let report = session
        .run(&two_events(), Duration::from_millis(10), Duration::from_millis(10), &mut sink)
        .unwrap();
    assert!(!report.is_success());
    assert_eq!(report.exit_code(), -1);
    assert!(report
        .monitoring_error
        .as_deref()
        .unwrap()
        .contains("monitor buffer allocation failed"));
    assert!(report.stimulation_error.is_none());
    assert_eq!(report.events_sent, 2);
    assert_eq!(report.monitored_events, 0);
    assert_eq!(log.sequencer_closes(), 1);
    assert_eq!(log.monitor_closes(), 1);
}
