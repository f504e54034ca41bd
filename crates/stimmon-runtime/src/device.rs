//! Device driver contract and device handle lifecycle.
//!
//! The AER board exposes two endpoints:
//! - a **sequencer** that accepts a timed sequence of outbound events
//! - a **monitor** that reports inbound events with timestamps
//!
//! The driver itself (register I/O, the kernel module) is an external
//! collaborator; this module defines the contract the engine relies on
//! and the scoped ownership of the two handles.

use std::fmt;
use stimmon_common::config::DeviceConfig;
use stimmon_common::error::{StimMonError, StimMonResult};
use stimmon_common::event::StimulusEvent;
use tracing::{debug, info, warn};

/// Error reported by a driver call.
///
/// Drivers return a single 64-bit code; the two 32-bit halves tell apart
/// OS errors (low half only), hardware errors (high half only), and
/// protocol errors (both halves set).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFault {
    /// OS-level error (`errno`).
    Os(i32),
    /// Board-reported hardware error code.
    Hardware(u32),
    /// Anything else the driver returned.
    Protocol(i64),
}

impl DeviceFault {
    /// Classify a raw non-zero driver return code.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn classify(code: i64) -> Self {
        let bits = code as u64;
        let top = (bits >> 32) as u32;
        let bottom = bits as u32;

        if top == 0 {
            Self::Os(bottom as i32)
        } else if bottom == 0 {
            Self::Hardware(top)
        } else {
            Self::Protocol(code)
        }
    }

    /// Short label for log fields.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Os(_) => "os",
            Self::Hardware(_) => "hardware",
            Self::Protocol(_) => "protocol",
        }
    }
}

impl fmt::Display for DeviceFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Os(errno) => write!(f, "{}", std::io::Error::from_raw_os_error(*errno)),
            Self::Hardware(code) => write!(f, "hardware error {code:04x}"),
            Self::Protocol(code) => write!(f, "protocol error {code}"),
        }
    }
}

impl std::error::Error for DeviceFault {}

/// Outcome of a failed raw write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFault {
    /// Non-blocking endpoint is not ready; not an error as such.
    WouldBlock,
    /// Any other driver error.
    Fault(DeviceFault),
}

impl From<DeviceFault> for WriteFault {
    fn from(fault: DeviceFault) -> Self {
        Self::Fault(fault)
    }
}

/// One event as reported by the monitor endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawMonitorEvent {
    /// Device timestamp in microseconds.
    pub time_us: u32,
    /// Raw address-event word (upper bits carry board flags).
    pub ae: u32,
}

/// Result of preparing one encoding buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodedBatch {
    /// Device words placed in the buffer.
    pub words: usize,
    /// Stimulus events those words represent.
    pub events: usize,
}

/// Sequencer endpoint contract.
pub trait SequencerDevice {
    /// Reset the board's event counter (idempotent).
    fn reset_counter(&mut self) -> Result<(), DeviceFault>;

    /// Encode as many leading `events` as fit into `words`.
    ///
    /// `boundaries` is cleared and receives, for each encoded event, the
    /// word offset just past its last word. Returns zero events when not
    /// even the first event fits.
    fn encode(
        &self,
        events: &[StimulusEvent],
        words: &mut [u32],
        boundaries: &mut Vec<usize>,
    ) -> Result<EncodedBatch, DeviceFault>;

    /// Write raw words; returns how many were accepted, which may be fewer
    /// than requested.
    fn write_raw(&mut self, words: &[u32]) -> Result<usize, WriteFault>;

    /// Close the endpoint.
    fn close(&mut self) -> Result<(), DeviceFault>;
}

/// Monitor endpoint contract.
pub trait MonitorDevice {
    /// Set the counter period (timestamp unit) in microseconds.
    fn set_counter_period(&mut self, period_us: u32) -> Result<(), DeviceFault>;

    /// Enable or disable per-event timestamp labelling.
    fn set_time_label(&mut self, enabled: bool) -> Result<(), DeviceFault>;

    /// Discard anything queued in the monitor FIFO.
    fn reset_fifo(&mut self) -> Result<(), DeviceFault>;

    /// Read up to `buf.len()` events; returns how many were filled.
    fn read(&mut self, buf: &mut [RawMonitorEvent]) -> Result<usize, DeviceFault>;

    /// Close the endpoint.
    fn close(&mut self) -> Result<(), DeviceFault>;
}

/// Driver abstraction that opens the two endpoints.
pub trait AerDriver {
    /// Sequencer handle type.
    type Sequencer: SequencerDevice;
    /// Monitor handle type.
    type Monitor: MonitorDevice;

    /// Open the sequencer endpoint of board `index`.
    fn open_sequencer(&self, index: u32) -> Result<Self::Sequencer, DeviceFault>;

    /// Open the monitor endpoint of board `index`.
    fn open_monitor(&self, index: u32, nonblocking: bool) -> Result<Self::Monitor, DeviceFault>;
}

/// Owned pair of device handles.
///
/// Opened and configured once before the processes split. After the split
/// each role borrows only its own handle through [`DeviceHandles::split`].
/// Handles are closed exactly once by [`DeviceHandles::release`], which
/// also runs on drop.
pub struct DeviceHandles<D: AerDriver> {
    sequencer: Option<D::Sequencer>,
    monitor: Option<D::Monitor>,
}

fn init_error(step: &str, fault: DeviceFault) -> StimMonError {
    StimMonError::DeviceInit(format!("{step}: {fault}"))
}

impl<D: AerDriver> DeviceHandles<D> {
    /// Open both endpoints and run the configuration sequence.
    ///
    /// # Errors
    ///
    /// Returns [`StimMonError::DeviceInit`] naming the failed step. Any
    /// endpoint opened so far is closed before returning.
    pub fn open(driver: &D, config: &DeviceConfig) -> StimMonResult<Self> {
        let mut handles = Self {
            sequencer: None,
            monitor: None,
        };

        handles.sequencer = Some(
            driver
                .open_sequencer(config.sequencer_index)
                .map_err(|e| init_error("open sequencer", e))?,
        );
        handles.monitor = Some(
            driver
                .open_monitor(config.monitor_index, config.monitor_nonblocking)
                .map_err(|e| init_error("open monitor", e))?,
        );

        handles.configure(config)?;

        info!(
            sequencer = config.sequencer_index,
            monitor = config.monitor_index,
            nonblocking = config.monitor_nonblocking,
            "Device endpoints opened and configured"
        );
        Ok(handles)
    }

    fn configure(&mut self, config: &DeviceConfig) -> StimMonResult<()> {
        let (sequencer, monitor) = self.split()?;

        monitor
            .set_counter_period(config.counter_period_us)
            .map_err(|e| init_error("set counter period", e))?;
        monitor
            .set_time_label(config.time_label)
            .map_err(|e| init_error("set time label flag", e))?;
        monitor
            .reset_fifo()
            .map_err(|e| init_error("reset monitor FIFO", e))?;
        sequencer
            .reset_counter()
            .map_err(|e| init_error("reset counter", e))?;

        debug!(
            period_us = config.counter_period_us,
            time_label = config.time_label,
            "Device configuration sequence complete"
        );
        Ok(())
    }

    /// Borrow the sequencer (stimulator) and monitor handles separately.
    ///
    /// # Errors
    ///
    /// Returns [`StimMonError::Resource`] if the handles were already released.
    pub fn split(&mut self) -> StimMonResult<(&mut D::Sequencer, &mut D::Monitor)> {
        match (self.sequencer.as_mut(), self.monitor.as_mut()) {
            (Some(seq), Some(mon)) => Ok((seq, mon)),
            _ => Err(StimMonError::Resource(
                "device handles already released".into(),
            )),
        }
    }

    /// Whether any endpoint is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.sequencer.is_some() || self.monitor.is_some()
    }

    /// Close whichever endpoints are still open. Safe to call repeatedly.
    ///
    /// Returns true if anything was closed by this call.
    pub fn release(&mut self) -> bool {
        let mut closed = false;

        if let Some(mut seq) = self.sequencer.take() {
            if let Err(e) = seq.close() {
                warn!(error = %e, "Failed to close sequencer");
            }
            closed = true;
        }
        if let Some(mut mon) = self.monitor.take() {
            if let Err(e) = mon.close() {
                warn!(error = %e, "Failed to close monitor");
            }
            closed = true;
        }

        if closed {
            debug!("Device handles released");
        }
        closed
    }
}

impl<D: AerDriver> Drop for DeviceHandles<D> {
    fn drop(&mut self) {
        self.release();
    }
}
