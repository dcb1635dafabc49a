//! Bridge and relay configuration.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::BridgeError;
use crate::resample::ConverterType;

/// Default ring capacity in samples.
pub const DEFAULT_CAPACITY: usize = 4_096;
/// Default fixed output block of the rate converter, in frames.
pub const DEFAULT_CHUNK_FRAMES: usize = 256;

/// Construction parameters for a [`Bridge`](crate::Bridge).
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    /// Producer sample rate in Hertz.
    pub input_sample_rate: f64,
    /// Device sample rate in Hertz; the device default when `None`.
    pub output_sample_rate: Option<u32>,
    /// Ring capacity in samples.
    pub capacity: usize,
    /// Rate converter quality.
    pub converter: ConverterType,
    /// Fixed output block of the rate converter, in frames.
    pub chunk_frames: usize,
}

impl BridgeConfig {
    /// Defaults for a producer running at `input_sample_rate`.
    pub fn new(input_sample_rate: f64) -> Self {
        Self {
            input_sample_rate,
            output_sample_rate: None,
            capacity: DEFAULT_CAPACITY,
            converter: ConverterType::default(),
            chunk_frames: DEFAULT_CHUNK_FRAMES,
        }
    }

    /// Request a specific device rate.
    pub fn with_output_sample_rate(mut self, rate: u32) -> Self {
        self.output_sample_rate = Some(rate);
        self
    }

    /// Override the ring capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Override the converter quality.
    pub fn with_converter(mut self, converter: ConverterType) -> Self {
        self.converter = converter;
        self
    }

    /// Override the converter output block.
    pub fn with_chunk_frames(mut self, chunk_frames: usize) -> Self {
        self.chunk_frames = chunk_frames;
        self
    }

    /// Reject non-positive rates, capacities and chunk sizes.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if !(self.input_sample_rate.is_finite() && self.input_sample_rate > 0.0) {
            return Err(BridgeError::InvalidSampleRate(self.input_sample_rate));
        }
        if self.output_sample_rate == Some(0) {
            return Err(BridgeError::InvalidSampleRate(0.0));
        }
        if self.capacity == 0 {
            return Err(BridgeError::InvalidCapacity(self.capacity));
        }
        if self.chunk_frames == 0 {
            return Err(BridgeError::InvalidChunkFrames(self.chunk_frames));
        }
        Ok(())
    }
}

/// Errors raised while loading a [`RelayConfig`].
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Synthetic producer selection for the relay tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// Zeros paced at the poll interval.
    #[default]
    Silence,
    /// Sine test signal.
    Tone,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Silence => f.write_str("silence"),
            SourceKind::Tone => f.write_str("tone"),
        }
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "silence" => Ok(SourceKind::Silence),
            "tone" => Ok(SourceKind::Tone),
            other => Err(format!("unknown source '{other}', expected silence or tone")),
        }
    }
}

/// Parameters of the relay tool, loadable from TOML.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// Producer sample rate in Hertz.
    pub sample_rate: f64,
    /// Input gain applied by the output processor.
    pub gain: f32,
    /// Output volume applied by the output processor.
    pub volume: f32,
    /// FM carrier frequency in Hertz.
    pub carrier_frequency: f64,
    /// Frequency-modulate onto the carrier instead of passing through.
    pub modulation: bool,
    /// Subtract each polled block's mean before pushing.
    pub highpass: bool,
    /// Producer poll window in milliseconds.
    pub poll_ms: u64,
    /// Ring capacity in samples.
    pub capacity: usize,
    /// Rate converter quality.
    pub converter: ConverterType,
    /// Device sample rate; device default when absent.
    pub output_sample_rate: Option<u32>,
    /// Synthetic producer.
    pub source: SourceKind,
    /// Frequency of the tone producer in Hertz.
    pub tone_frequency: f64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            sample_rate: 3_600.0,
            gain: 1.0,
            volume: 0.1,
            carrier_frequency: 500.0,
            modulation: false,
            highpass: true,
            poll_ms: 50,
            capacity: DEFAULT_CAPACITY,
            converter: ConverterType::default(),
            output_sample_rate: None,
            source: SourceKind::default(),
            tone_frequency: 2.0,
        }
    }
}

impl RelayConfig {
    /// Load and validate a TOML file. Missing keys take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Range-check values that have no meaningful non-positive form.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "sample_rate must be positive, got {}",
                self.sample_rate
            )));
        }
        if self.poll_ms == 0 {
            return Err(ConfigError::Invalid("poll_ms must be positive".into()));
        }
        if self.capacity == 0 {
            return Err(ConfigError::Invalid("capacity must be positive".into()));
        }
        if self.output_sample_rate == Some(0) {
            return Err(ConfigError::Invalid(
                "output_sample_rate must be positive".into(),
            ));
        }
        if !self.carrier_frequency.is_finite() || self.carrier_frequency < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "carrier_frequency must be non-negative, got {}",
                self.carrier_frequency
            )));
        }
        Ok(())
    }

    /// Producer poll window.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }

    /// Bridge parameters derived from this relay configuration.
    pub fn bridge_config(&self) -> BridgeConfig {
        let mut config = BridgeConfig::new(self.sample_rate)
            .with_capacity(self.capacity)
            .with_converter(self.converter);
        config.output_sample_rate = self.output_sample_rate;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_config_validation() {
        assert!(BridgeConfig::new(3_600.0).validate().is_ok());
        assert!(matches!(
            BridgeConfig::new(0.0).validate(),
            Err(BridgeError::InvalidSampleRate(_))
        ));
        assert!(matches!(
            BridgeConfig::new(f64::INFINITY).validate(),
            Err(BridgeError::InvalidSampleRate(_))
        ));
        assert!(matches!(
            BridgeConfig::new(3_600.0).with_capacity(0).validate(),
            Err(BridgeError::InvalidCapacity(0))
        ));
        assert!(matches!(
            BridgeConfig::new(3_600.0).with_output_sample_rate(0).validate(),
            Err(BridgeError::InvalidSampleRate(_))
        ));
        assert!(matches!(
            BridgeConfig::new(3_600.0).with_chunk_frames(0).validate(),
            Err(BridgeError::InvalidChunkFrames(0))
        ));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: RelayConfig = toml::from_str(
            r#"
                sample_rate = 4000.0
                modulation = true
                converter = "linear"
                source = "tone"
            "#,
        )
        .unwrap();
        assert_eq!(config.sample_rate, 4_000.0);
        assert!(config.modulation);
        assert_eq!(config.converter, ConverterType::Linear);
        assert_eq!(config.source, SourceKind::Tone);
        assert_eq!(config.volume, 0.1);
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<RelayConfig>("samplerate = 10").is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = RelayConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn load_validates_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, "poll_ms = 0\n").unwrap();
        assert!(matches!(
            RelayConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));

        std::fs::write(&path, "capacity = 1024\noutput_sample_rate = 44100\n").unwrap();
        let config = RelayConfig::load(&path).unwrap();
        let bridge = config.bridge_config();
        assert_eq!(bridge.capacity, 1_024);
        assert_eq!(bridge.output_sample_rate, Some(44_100));
        assert_eq!(bridge.input_sample_rate, 3_600.0);
    }

    #[test]
    fn source_kind_parses() {
        assert_eq!("Tone".parse::<SourceKind>(), Ok(SourceKind::Tone));
        assert!("noise".parse::<SourceKind>().is_err());
    }
}
