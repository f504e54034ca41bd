use thiserror::Error;

/// Session error types covering setup failures, role failures, and rendezvous faults.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StimMonError {
    /// Opening or configuring the device failed before the process split.
    #[error("device initialization failed: {0}")]
    DeviceInit(String),

    /// Creating an OS-level coordination resource (gates, shared tally) failed.
    #[error("resource error: {0}")]
    Resource(String),

    /// Splitting into stimulator and monitor processes failed.
    #[error("fork failed: {0}")]
    Fork(String),

    /// The stimulator role failed.
    #[error("stimulation failed: {0}")]
    Stimulation(String),

    /// The monitor role failed.
    #[error("monitoring failed: {0}")]
    Monitoring(String),

    /// A bounded rendezvous wait expired before the peer opened the gate.
    #[error("rendezvous timeout waiting for gate '{gate}'")]
    RendezvousTimeout {
        /// Name of the gate that was never opened.
        gate: String,
    },

    /// An interrupt or terminate signal aborted the role.
    #[error("interrupted by signal {signal}")]
    Interrupted {
        /// Signal name (e.g. `SIGINT`).
        signal: String,
    },

    /// I/O operation error.
    #[error("I/O error: {0}")]
    Io(String),

    /// Invalid session phase transition attempted.
    #[error("invalid session transition from {from} to {to}")]
    InvalidPhaseTransition {
        /// Source phase.
        from: String,
        /// Attempted target phase.
        to: String,
    },
}

impl From<std::io::Error> for StimMonError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Convenience type alias for session operations.
pub type StimMonResult<T> = Result<T, StimMonError>;
