//! Buffered event writer for the sequencer endpoint.
//!
//! Events are encoded into a device-native word buffer by the driver, then
//! written with as many partial writes as the device needs. The buffer is
//! sized `max(min_write_words, words_per_event_estimate * N)`; when the
//! estimate is too small the writer simply takes several encode passes.
//!
//! A would-block from a non-blocking endpoint ends the write early without
//! an error. Only events whose words were fully accepted are counted.

use crate::device::{DeviceFault, SequencerDevice, WriteFault};
use serde::Serialize;
use stimmon_common::config::BufferConfig;
use stimmon_common::event::StimulusEvent;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Fatal writer failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WriterError {
    /// The encoding buffer could not be allocated.
    #[error("failed to allocate a {words}-word encoding buffer")]
    BufferAllocation {
        /// Requested size in words.
        words: usize,
    },

    /// Not even one event fits in the encoding buffer.
    #[error("encoding buffer of {words} words cannot hold a single event")]
    EncodingCapacity {
        /// Buffer size in words.
        words: usize,
    },

    /// The driver failed to encode the events.
    #[error("encoding failed: {0}")]
    Encode(DeviceFault),

    /// A raw write failed with something other than would-block.
    #[error("device write failed after {events_written} events: {fault}")]
    Device {
        /// Underlying driver error.
        fault: DeviceFault,
        /// Events fully written before the failure.
        events_written: usize,
    },
}

impl WriterError {
    /// Events fully written before the failure.
    #[must_use]
    pub fn events_written(&self) -> usize {
        match self {
            Self::Device { events_written, .. } => *events_written,
            _ => 0,
        }
    }
}

/// Outcome of a successful (possibly early-terminated) write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteReport {
    /// Events whose words were completely accepted by the device.
    pub events_written: usize,
    /// Device words accepted.
    pub words_written: usize,
    /// The device reported would-block before all events were sent.
    pub would_block: bool,
    /// Size of the encoding buffer in words.
    pub buffer_words: usize,
}

/// Writes stimulus events through a [`SequencerDevice`].
#[derive(Debug, Clone)]
pub struct EventWriter {
    buffers: BufferConfig,
}

impl Default for EventWriter {
    fn default() -> Self {
        Self::new(&BufferConfig::default())
    }
}

/// Events completely contained in the first `words` words.
fn events_within(boundaries: &[usize], words: usize) -> usize {
    boundaries.partition_point(|&end| end <= words)
}

impl EventWriter {
    /// Writer using the given buffer sizing.
    #[must_use]
    pub fn new(buffers: &BufferConfig) -> Self {
        Self {
            buffers: buffers.clone(),
        }
    }

    /// Encoding buffer size in words for `events` events.
    #[must_use]
    pub fn buffer_words(&self, events: usize) -> usize {
        self.buffers.write_buffer_words(events)
    }

    /// Write all `events`, stopping early on would-block.
    ///
    /// # Errors
    ///
    /// Returns a [`WriterError`] on allocation failure, when a single event
    /// does not fit the buffer, or on any device fault other than
    /// would-block.
    pub fn write_blocking<S>(
        &self,
        seq: &mut S,
        events: &[StimulusEvent],
    ) -> Result<WriteReport, WriterError>
    where
        S: SequencerDevice + ?Sized,
    {
        let capacity = self.buffer_words(events.len());
        let mut words: Vec<u32> = Vec::new();
        words
            .try_reserve_exact(capacity)
            .map_err(|_| WriterError::BufferAllocation { words: capacity })?;
        words.resize(capacity, 0);
        let mut boundaries: Vec<usize> = Vec::new();
        boundaries
            .try_reserve(events.len().min(capacity))
            .map_err(|_| WriterError::BufferAllocation { words: capacity })?;

        let mut report = WriteReport {
            buffer_words: capacity,
            ..WriteReport::default()
        };
        let mut remaining = events;

        while !remaining.is_empty() {
            let batch = seq
                .encode(remaining, &mut words, &mut boundaries)
                .map_err(WriterError::Encode)?;
            if batch.events == 0 {
                return Err(WriterError::EncodingCapacity { words: capacity });
            }
            trace!(events = batch.events, words = batch.words, "Encoded batch");

            let mut cursor = 0;
            while cursor < batch.words {
                match seq.write_raw(&words[cursor..batch.words]) {
                    Ok(0) | Err(WriteFault::WouldBlock) => {
                        report.events_written += events_within(&boundaries, cursor);
                        report.words_written += cursor;
                        report.would_block = true;
                        warn!(
                            events_written = report.events_written,
                            requested = events.len(),
                            "Sequencer would block; stopping early"
                        );
                        return Ok(report);
                    }
                    Ok(accepted) => cursor += accepted.min(batch.words - cursor),
                    Err(WriteFault::Fault(fault)) => {
                        let events_written =
                            report.events_written + events_within(&boundaries, cursor);
                        return Err(WriterError::Device {
                            fault,
                            events_written,
                        });
                    }
                }
            }

            report.events_written += batch.events;
            report.words_written += batch.words;
            remaining = &remaining[batch.events..];
        }

        debug!(
            events = report.events_written,
            words = report.words_written,
            buffer_words = capacity,
            "Event write complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::AerDriver;
    use crate::simulated::SimulatedDriver;

    fn events(n: u32) -> Vec<StimulusEvent> {
        (0..n).map(|i| StimulusEvent::new(100, i)).collect()
    }

    #[test]
    fn test_writes_all_events() {
        let driver = SimulatedDriver::new();
        let mut seq = driver.open_sequencer(0).unwrap();

        let report = EventWriter::default()
            .write_blocking(&mut seq, &events(10))
            .unwrap();
        assert_eq!(report.events_written, 10);
        assert_eq!(report.words_written, 20);
        assert!(!report.would_block);
        assert_eq!(report.buffer_words, 128);
        assert_eq!(driver.log().words_written().len(), 20);
    }

    #[test]
    fn test_buffer_scales_with_event_count() {
        let driver = SimulatedDriver::new();
        let mut seq = driver.open_sequencer(0).unwrap();

        let report = EventWriter::default()
            .write_blocking(&mut seq, &events(200))
            .unwrap();
        assert_eq!(report.buffer_words, 400);
        assert_eq!(report.events_written, 200);
    }

    #[test]
    fn test_multiple_encode_passes() {
        let driver = SimulatedDriver::new().with_words_per_event(3);
        let mut seq = driver.open_sequencer(0).unwrap();

        // 100 events * 3 words do not fit the 200-word buffer in one pass
        let report = EventWriter::default()
            .write_blocking(&mut seq, &events(100))
            .unwrap();
        assert_eq!(report.events_written, 100);
        assert_eq!(report.words_written, 300);
    }

    #[test]
    fn test_partial_writes_advance_cursor() {
        let driver = SimulatedDriver::new().with_max_words_per_write(3);
        let mut seq = driver.open_sequencer(0).unwrap();

        let report = EventWriter::default()
            .write_blocking(&mut seq, &events(5))
            .unwrap();
        assert_eq!(report.events_written, 5);
        assert_eq!(driver.log().write_calls(), 4);
        assert_eq!(
            driver.log().words_written(),
            vec![100, 0, 100, 1, 100, 2, 100, 3, 100, 4]
        );
    }

    #[test]
    fn test_would_block_counts_complete_events() {
        // 7 words accepted: events 0..3 complete, event 3 half written
        let driver = SimulatedDriver::new().with_would_block_after(7);
        let mut seq = driver.open_sequencer(0).unwrap();

        let report = EventWriter::default()
            .write_blocking(&mut seq, &events(10))
            .unwrap();
        assert!(report.would_block);
        assert_eq!(report.events_written, 3);
        assert_eq!(report.words_written, 7);
    }

    #[test]
    fn test_would_block_on_first_write() {
        let driver = SimulatedDriver::new().with_would_block_after(0);
        let mut seq = driver.open_sequencer(0).unwrap();

        let report = EventWriter::default()
            .write_blocking(&mut seq, &events(4))
            .unwrap();
        assert!(report.would_block);
        assert_eq!(report.events_written, 0);
        assert_eq!(report.words_written, 0);
    }

    #[test]
    fn test_device_fault_is_fatal() {
        let driver = SimulatedDriver::new().with_write_fault_after(4);
        let mut seq = driver.open_sequencer(0).unwrap();

        let err = EventWriter::default()
            .write_blocking(&mut seq, &events(10))
            .unwrap_err();
        assert_eq!(
            err,
            WriterError::Device {
                fault: DeviceFault::Os(libc::EIO),
                events_written: 2,
            }
        );
        assert_eq!(err.events_written(), 2);
    }

    #[test]
    fn test_event_larger_than_buffer() {
        let driver = SimulatedDriver::new().with_words_per_event(200);
        let mut seq = driver.open_sequencer(0).unwrap();

        let err = EventWriter::default()
            .write_blocking(&mut seq, &events(1))
            .unwrap_err();
        assert_eq!(err, WriterError::EncodingCapacity { words: 128 });
        assert_eq!(driver.log().write_calls(), 0);
    }

    #[test]
    fn test_no_events_no_writes() {
        let driver = SimulatedDriver::new();
        let mut seq = driver.open_sequencer(0).unwrap();

        let report = EventWriter::default().write_blocking(&mut seq, &[]).unwrap();
        assert_eq!(report.events_written, 0);
        assert_eq!(driver.log().write_calls(), 0);
    }

    #[test]
    fn test_events_within() {
        let bounds = [2, 4, 6];
        assert_eq!(events_within(&bounds, 0), 0);
        assert_eq!(events_within(&bounds, 3), 1);
        assert_eq!(events_within(&bounds, 4), 2);
        assert_eq!(events_within(&bounds, 6), 3);
    }
}
