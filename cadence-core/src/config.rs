//! Pipeline configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::format::{AudioTarget, VideoTarget};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// When the producer decides both queues hold enough
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackpressurePolicy {
    /// Wait only while *both* queues are above the high-water mark
    #[default]
    Coarse,
    /// Wait while *either* tracked queue is above the high-water mark
    PerQueue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Queue depth above which the producer throttles itself
    pub high_water_mark: usize,
    pub backpressure: BackpressurePolicy,
    pub video: VideoTarget,
    pub audio: AudioTarget,
    /// Consumer sleep between polls of an empty queue
    pub poll_interval_ms: u64,
    /// Longest single sleep while pacing a video frame
    pub pacing_slice_ms: u64,
    /// Upper bound on how long one frame may be held back
    pub max_wait_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            high_water_mark: 5,
            backpressure: BackpressurePolicy::Coarse,
            video: VideoTarget::default(),
            audio: AudioTarget::default(),
            poll_interval_ms: 5,
            pacing_slice_ms: 10,
            max_wait_ms: 1_000,
        }
    }
}

impl PipelineConfig {
    /// Load a JSON config file; missing fields keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.high_water_mark == 0 {
            return Err(ConfigError::Invalid("high_water_mark must be at least 1".into()));
        }
        if self.video.width == 0 || self.video.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "video target {}x{} has a zero dimension",
                self.video.width, self.video.height
            )));
        }
        if self.audio.rate == 0 {
            return Err(ConfigError::Invalid("audio rate must be non-zero".into()));
        }
        if self.pacing_slice_ms == 0 {
            return Err(ConfigError::Invalid("pacing_slice_ms must be non-zero".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn pacing_slice(&self) -> Duration {
        Duration::from_millis(self.pacing_slice_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{PixelFormat, SampleFormat};
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.high_water_mark, 5);
        assert_eq!(config.backpressure, BackpressurePolicy::Coarse);
        assert_eq!(config.video.width, 640);
        assert_eq!(config.video.height, 360);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "high_water_mark": 8, "backpressure": "per-queue",
                 "video": {{ "width": 320, "height": 180, "pixel_format": "rgb24" }} }}"#
        )
        .unwrap();

        let config = PipelineConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.high_water_mark, 8);
        assert_eq!(config.backpressure, BackpressurePolicy::PerQueue);
        assert_eq!(config.video.pixel_format, PixelFormat::Rgb24);
        assert_eq!(config.audio.sample_format, SampleFormat::S16);
        assert_eq!(config.poll_interval_ms, 5);
    }

    #[test]
    fn test_rejects_zero_high_water_mark() {
        let config = PipelineConfig {
            high_water_mark: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_zero_dimension() {
        let mut config = PipelineConfig::default();
        config.video.height = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            PipelineConfig::from_json_file(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }
}
