//! Configuration structures for a stimulation/monitoring session.
//!
//! Supports TOML deserialization with defaults matching the PCI-AER
//! board setup used in the lab: 1µs counter period, time-labelled
//! monitor events, a non-blocking monitor endpoint, and an infinite
//! rendezvous wait.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default filesystem path from which the gate keys are derived.
pub const DEFAULT_LOCK_PATH: &str = "/tmp/stimmon_semaphore_lock";

/// Top-level session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Device endpoints and the one-time configuration sequence.
    pub device: DeviceConfig,

    /// Rendezvous gate keys and wait policy.
    pub rendezvous: RendezvousConfig,

    /// Poll and sleep granularity of the duration-bounded loops.
    pub timing: TimingConfig,

    /// Encoding and poll buffer sizes.
    pub buffers: BufferConfig,

    /// Install SIGINT/SIGHUP/SIGTERM handlers for the session's lifetime.
    pub handle_signals: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            rendezvous: RendezvousConfig::default(),
            timing: TimingConfig::default(),
            buffers: BufferConfig::default(),
            handle_signals: true,
        }
    }
}

/// Device endpoint selection and configuration sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Board index of the sequencer endpoint.
    pub sequencer_index: u32,

    /// Board index of the monitor endpoint.
    pub monitor_index: u32,

    /// Open the monitor endpoint in non-blocking mode.
    pub monitor_nonblocking: bool,

    /// Monitor counter period in microseconds (timestamp unit).
    pub counter_period_us: u32,

    /// Label each monitored event with a timestamp.
    pub time_label: bool,

    /// How many times the stimulator resets the counter once released.
    pub counter_resets: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            sequencer_index: 0,
            monitor_index: 0,
            monitor_nonblocking: true,
            counter_period_us: 1,
            time_label: true,
            counter_resets: 3,
        }
    }
}

/// Rendezvous gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    /// Path used to derive the two gate keys. Created if missing and
    /// removed at teardown.
    pub lock_path: PathBuf,

    /// Project id for the `stim-ready` key.
    pub stim_key_id: char,

    /// Project id for the `close-ready` key.
    pub close_key_id: char,

    /// Bound on each gate wait. Absent means wait forever.
    #[serde(
        with = "humantime_serde_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            lock_path: PathBuf::from(DEFAULT_LOCK_PATH),
            stim_key_id: 's',
            close_key_id: 'c',
            timeout: None,
        }
    }
}

/// Loop granularity configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Sleep after an empty or failed monitor poll. Zero busy-polls.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Sleep quantum while the stimulator pads out its duration.
    #[serde(with = "humantime_serde")]
    pub stim_wait_granularity: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_micros(200),
            stim_wait_granularity: Duration::from_millis(10),
        }
    }
}

/// Buffer sizing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Capacity of the monitor poll buffer in events.
    pub monitor_buffer_events: usize,

    /// Lower bound on the sequencer encoding buffer in words.
    pub min_write_words: usize,

    /// Estimated device words per stimulus event.
    pub words_per_event_estimate: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            monitor_buffer_events: 1000,
            min_write_words: 128,
            words_per_event_estimate: 2,
        }
    }
}

impl BufferConfig {
    /// Encoding buffer size for `events` stimulus events:
    /// `max(min_write_words, words_per_event_estimate * events)`.
    #[must_use]
    pub fn write_buffer_words(&self, events: usize) -> usize {
        self.words_per_event_estimate
            .saturating_mul(events)
            .max(self.min_write_words)
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rv = &self.rendezvous;
        if !rv.stim_key_id.is_ascii() || !rv.close_key_id.is_ascii() {
            return Err(ConfigError::Invalid(
                "gate key ids must be ASCII characters".into(),
            ));
        }
        if rv.stim_key_id == rv.close_key_id {
            return Err(ConfigError::Invalid(format!(
                "gate key ids must differ (both are {:?})",
                rv.stim_key_id
            )));
        }
        if rv.lock_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("lock_path must not be empty".into()));
        }
        if self.buffers.monitor_buffer_events == 0 {
            return Err(ConfigError::Invalid(
                "monitor_buffer_events must be at least 1".into(),
            ));
        }
        if self.buffers.min_write_words == 0 {
            return Err(ConfigError::Invalid(
                "min_write_words must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is out of range or inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Same as `humantime_serde`, for optional durations.
mod humantime_serde_opt {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[allow(clippy::ref_option)]
    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?;
        s.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.device.counter_period_us, 1);
        assert!(config.device.monitor_nonblocking);
        assert_eq!(config.buffers.monitor_buffer_events, 1000);
        assert!(config.rendezvous.timeout.is_none());
        assert_eq!(config.rendezvous.lock_path, PathBuf::from(DEFAULT_LOCK_PATH));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            handle_signals = false

            [device]
            counter_resets = 1

            [rendezvous]
            lock_path = "/var/run/stimmon.lock"
            timeout = "2s"

            [timing]
            poll_interval = "1ms"
            stim_wait_granularity = "250us"

            [buffers]
            monitor_buffer_events = 64
        "#;

        let config = SessionConfig::from_toml(toml).unwrap();
        assert!(!config.handle_signals);
        assert_eq!(config.device.counter_resets, 1);
        assert_eq!(config.rendezvous.timeout, Some(Duration::from_secs(2)));
        assert_eq!(config.timing.poll_interval, Duration::from_millis(1));
        assert_eq!(config.timing.stim_wait_granularity, Duration::from_micros(250));
        assert_eq!(config.buffers.monitor_buffer_events, 64);
        // Untouched fields keep their defaults
        assert_eq!(config.buffers.min_write_words, 128);
        assert_eq!(config.rendezvous.stim_key_id, 's');
    }

    #[test]
    fn test_write_buffer_words() {
        let buffers = BufferConfig::default();
        assert_eq!(buffers.write_buffer_words(0), 128);
        assert_eq!(buffers.write_buffer_words(2), 128);
        assert_eq!(buffers.write_buffer_words(64), 128);
        assert_eq!(buffers.write_buffer_words(65), 130);
        assert_eq!(buffers.write_buffer_words(10_000), 20_000);
    }

    #[test]
    fn test_roundtrip_toml() {
        let mut config = SessionConfig::default();
        config.rendezvous.timeout = Some(Duration::from_millis(500));
        let toml = config.to_toml().unwrap();
        let parsed = SessionConfig::from_toml(&toml).unwrap();
        assert_eq!(parsed.rendezvous.timeout, Some(Duration::from_millis(500)));
        assert_eq!(parsed.timing.poll_interval, config.timing.poll_interval);

        let toml = SessionConfig::default().to_toml().unwrap();
        assert!(!toml.contains("timeout"));
        assert!(SessionConfig::from_toml(&toml).unwrap().rendezvous.timeout.is_none());
    }

    #[test]
    fn test_validation_rejects_equal_key_ids() {
        let toml = r#"
            [rendezvous]
            stim_key_id = "x"
            close_key_id = "x"
        "#;
        assert!(matches!(
            SessionConfig::from_toml(toml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_validation_rejects_empty_poll_buffer() {
        let mut config = SessionConfig::default();
        config.buffers.monitor_buffer_events = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_view_of_timing() {
        let json = serde_json::to_value(TimingConfig::default()).unwrap();
        assert_eq!(json["poll_interval"], "200us");
        assert_eq!(json["stim_wait_granularity"], "10ms");
    }
}
