//! Tab-separated text interchange format.
//!
//! Input files carry one stimulus event per line as `interval_us<TAB>address`.
//! Monitor output carries one event per line as `timestamp_us<TAB>address`
//! with the address already masked to 16 bits.

use crate::event::{MonitoredEvent, StimulusEvent};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Errors raised while reading or writing event text.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    /// A line did not hold two unsigned integers.
    #[error("line {line}: expected two unsigned integers, found {content:?}")]
    Malformed {
        /// 1-based line number.
        line: usize,
        /// Offending line content.
        content: String,
    },

    /// The event file could not be opened.
    #[error("failed to open event file {}", path.display())]
    Open {
        /// Path to the event file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Reading or writing the stream failed.
    #[error("event stream I/O failed")]
    Io(#[from] std::io::Error),
}

fn parse_pair(line_no: usize, line: &str) -> Result<Option<(u32, u32)>, FormatError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let malformed = || FormatError::Malformed {
        line: line_no,
        content: trimmed.to_string(),
    };

    let mut fields = trimmed.split_whitespace();
    let first = fields.next().ok_or_else(malformed)?;
    let second = fields.next().ok_or_else(malformed)?;
    if fields.next().is_some() {
        return Err(malformed());
    }

    let first = first.parse::<u32>().map_err(|_| malformed())?;
    let second = second.parse::<u32>().map_err(|_| malformed())?;
    Ok(Some((first, second)))
}

/// Parse stimulus events from a reader. Blank lines are skipped.
///
/// # Errors
///
/// Returns [`FormatError::Malformed`] naming the first bad line.
pub fn parse_stimulus_events<R: BufRead>(reader: R) -> Result<Vec<StimulusEvent>, FormatError> {
    let mut events = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if let Some((interval_us, address)) = parse_pair(idx + 1, &line)? {
            events.push(StimulusEvent::new(interval_us, address));
        }
    }
    Ok(events)
}

/// Read a stimulus event file.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or holds a malformed line.
pub fn read_stimulus_file(path: &Path) -> Result<Vec<StimulusEvent>, FormatError> {
    let file = std::fs::File::open(path).map_err(|e| FormatError::Open {
        path: path.to_path_buf(),
        source: e,
    })?;
    let events = parse_stimulus_events(std::io::BufReader::new(file))?;
    debug!(path = %path.display(), count = events.len(), "Read stimulus events");
    Ok(events)
}

/// Write one monitored event line.
///
/// # Errors
///
/// Propagates write failures from the sink.
pub fn write_monitored_event<W: Write + ?Sized>(
    sink: &mut W,
    event: &MonitoredEvent,
) -> std::io::Result<()> {
    writeln!(sink, "{}\t{}", event.timestamp_us, event.address)
}

/// Read monitored events back from a (rewound) sink.
///
/// # Errors
///
/// Returns [`FormatError::Malformed`] naming the first bad line.
pub fn read_monitored_events<R: BufRead>(reader: R) -> Result<Vec<MonitoredEvent>, FormatError> {
    let mut events = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if let Some((timestamp_us, address)) = parse_pair(idx + 1, &line)? {
            events.push(MonitoredEvent::from_raw(timestamp_us, address));
        }
    }
    Ok(events)
}
