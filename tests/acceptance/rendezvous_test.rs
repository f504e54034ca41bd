//! Rendezvous gate acceptance tests.
//!
//! # Acceptance Criteria
//!
//! - A gate opened in one process releases a waiter in another
//! - Each gate is opened once; a repeated open never blocks
//! - A peer that dies before signalling leaves the waiter blocked: with no
//!   timeout the wait never returns on its own, with a timeout it fails
//!   with a rendezvous timeout

use super::common::{fork_child, wait_child, Scratch};
use std::sync::mpsc;
use std::time::Duration;
use stimmon_common::config::RendezvousConfig;
use stimmon_common::error::StimMonError;
use stimmon_common::time::Stopwatch;
use stimmon_runtime::gate::{GatePair, CLOSE_READY, STIM_READY};

fn gates(scratch: &Scratch) -> GatePair {
    let config = RendezvousConfig {
        lock_path: scratch.lock_path(),
        ..RendezvousConfig::default()
    };
    GatePair::create(&config).expect("create gates")
}

#[test]
fn test_two_process_handshake() {
    let scratch = Scratch::new();
    let pair = gates(&scratch);
    let (stim_ready, close_ready) = (pair.stim_ready(), pair.close_ready());

    let pid = unsafe {
        fork_child(|| {
            std::thread::sleep(Duration::from_millis(20));
            if stim_ready.open() != Ok(true) {
                return 1;
            }
            std::thread::sleep(Duration::from_millis(20));
            if close_ready.open() != Ok(true) {
                return 2;
            }
            0
        })
    };

    let clock = Stopwatch::start();
    stim_ready.wait(None).unwrap();
    close_ready.wait(None).unwrap();
    assert!(clock.has_elapsed(Duration::from_millis(30)));
    assert_eq!(wait_child(pid), 0);

    assert!(stim_ready.is_open().unwrap());
    assert!(close_ready.is_open().unwrap());
}

#[test]
fn test_repeated_open_is_harmless() {
    let scratch = Scratch::new();
    let pair = gates(&scratch);
    let gate = pair.stim_ready();

    let pid = unsafe {
        fork_child(|| match (gate.open(), gate.open()) {
            (Ok(true), Ok(false)) => 0,
            _ => 1,
        })
    };
    assert_eq!(wait_child(pid), 0);
    gate.wait(Some(Duration::from_millis(10))).unwrap();
}

#[test]
fn test_expected_deadlock_is_bounded_by_timeout() {
    let scratch = Scratch::new();
    let pair = gates(&scratch);

    // Monitor dies before reaching the stim-ready open
    let pid = unsafe { fork_child(|| 0) };
    assert_eq!(wait_child(pid), 0);

    let err = pair
        .stim_ready()
        .wait(Some(Duration::from_millis(50)))
        .unwrap_err();
    assert_eq!(
        err,
        StimMonError::RendezvousTimeout {
            gate: STIM_READY.into()
        }
    );
}

#[test]
fn test_expected_deadlock_without_timeout_blocks() {
    let scratch = Scratch::new();
    let pair = gates(&scratch);
    let gate = pair.close_ready();

    let (tx, rx) = mpsc::channel();
    let waiter = std::thread::spawn(move || {
        let result = gate.wait(None);
        let _ = tx.send(());
        result
    });

    // Nobody opens the gate: the waiter stays blocked
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    // Only an explicit open releases it
    pair.close_ready().open().unwrap();
    rx.recv_timeout(Duration::from_secs(5))
        .expect("waiter released after open");
    waiter.join().unwrap().unwrap();
    assert_eq!(pair.close_ready().name(), CLOSE_READY);
}

#[test]
fn test_teardown_removes_lock_file() {
    let scratch = Scratch::new();
    let mut pair = gates(&scratch);
    assert!(scratch.lock_path().exists());
    assert!(pair.remove());
    assert!(!scratch.lock_path().exists());
}
