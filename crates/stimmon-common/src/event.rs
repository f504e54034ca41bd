//! Address-event data model.
//!
//! A stimulus is a sequence of inter-spike intervals paired with target
//! addresses; a monitored event is a device timestamp paired with the
//! source address reported by the monitor.

use serde::{Deserialize, Serialize};

/// Mask applied to every monitored address.
pub const ADDRESS_MASK: u32 = 0x0000_FFFF;

/// One outbound event for the sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StimulusEvent {
    /// Delay since the previous event in microseconds (ISI).
    pub interval_us: u32,
    /// Hardware target address.
    pub address: u32,
}

impl StimulusEvent {
    /// Create a stimulus event.
    #[must_use]
    pub const fn new(interval_us: u32, address: u32) -> Self {
        Self {
            interval_us,
            address,
        }
    }
}

/// One inbound event recorded from the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MonitoredEvent {
    /// Device timestamp in microseconds.
    pub timestamp_us: u32,
    /// Source address, always within `0..=0xFFFF`.
    pub address: u32,
}

impl MonitoredEvent {
    /// Build a monitored event from a raw device address, applying [`ADDRESS_MASK`].
    #[must_use]
    pub const fn from_raw(timestamp_us: u32, raw_address: u32) -> Self {
        Self {
            timestamp_us,
            address: raw_address & ADDRESS_MASK,
        }
    }
}

/// Absolute device time of each stimulus event, assuming the first interval
/// is measured from a counter reset.
///
/// Saturates rather than wrapping on overflow.
#[must_use]
pub fn absolute_times_us(events: &[StimulusEvent]) -> Vec<u32> {
    events
        .iter()
        .scan(0u32, |t, ev| {
            *t = t.saturating_add(ev.interval_us);
            Some(*t)
        })
        .collect()
}
