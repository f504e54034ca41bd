//! Common utilities for acceptance tests.

#![allow(dead_code)] // Not every helper is used by every test module

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use stimmon_common::config::SessionConfig;
use stimmon_common::event::StimulusEvent;
use tempfile::TempDir;

/// Per-test scratch directory holding the gate lock file and inputs.
pub struct Scratch {
    dir: TempDir,
}

impl Scratch {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("create scratch dir"),
        }
    }

    /// Lock path unique to this test, so parallel tests never share gate keys.
    pub fn lock_path(&self) -> PathBuf {
        self.dir.path().join("stimmon.lock")
    }

    /// Session config bound to this scratch directory.
    ///
    /// Signal handlers stay off: the test harness owns the process.
    pub fn config(&self) -> SessionConfig {
        let mut config = SessionConfig::default();
        config.rendezvous.lock_path = self.lock_path();
        config.rendezvous.timeout = Some(Duration::from_secs(10));
        config.timing.stim_wait_granularity = Duration::from_millis(1);
        config.handle_signals = false;
        config
    }

    /// Write a stimulus file with the given content.
    pub fn stimulus_file(&self, content: &str) -> PathBuf {
        let path = self.dir.path().join("stimulus.txt");
        let mut file = std::fs::File::create(&path).expect("create stimulus file");
        file.write_all(content.as_bytes()).expect("write stimulus file");
        path
    }
}

/// The two-event stimulus used throughout the scenarios.
pub const TWO_EVENTS: &str = "100\t5\n200\t7\n";

pub fn two_events() -> Vec<StimulusEvent> {
    vec![StimulusEvent::new(100, 5), StimulusEvent::new(200, 7)]
}

/// Fork a child that runs `body` and exits with its return value.
///
/// # Safety
///
/// The child must only touch state it owns; it never returns.
pub unsafe fn fork_child(body: impl FnOnce() -> i32) -> libc::pid_t {
    let pid = libc::fork();
    assert!(pid >= 0, "fork failed");
    if pid == 0 {
        let code = body();
        libc::_exit(code);
    }
    pid
}

/// Reap `pid` and return its exit code.
pub fn wait_child(pid: libc::pid_t) -> i32 {
    let mut status = 0;
    let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
    assert_eq!(rc, pid, "waitpid failed");
    assert!(libc::WIFEXITED(status), "child did not exit normally");
    libc::WEXITSTATUS(status)
}
