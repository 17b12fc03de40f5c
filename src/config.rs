use clap::ValueEnum;
use serde::Deserialize;
use std::path::Path;

use crate::error::ConfigError;
use crate::muxer::VideoTrack;
use crate::sequencer::Timebase;

/// Encoder effort preset handed to the external VP8 encoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    /// Realtime deadline, lowest effort
    Fast,
    /// Balanced effort (default)
    #[default]
    Good,
    /// No deadline, best compression
    Best,
}

impl Quality {
    /// Per-frame encode deadline in microseconds; 0 means unlimited.
    pub fn deadline_us(self) -> u64 {
        match self {
            Quality::Fast => 1,
            Quality::Good => 1_000_000,
            Quality::Best => 0,
        }
    }

    /// Speed/quality trade-off, higher is faster.
    pub fn cpu_used(self) -> u32 {
        match self {
            Quality::Fast => 8,
            Quality::Good => 4,
            Quality::Best => 0,
        }
    }
}

fn default_fps() -> u32 {
    30
}

/// Capture session configuration (TOML)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CaptureConfig {
    /// Encoder preset: fast, good or best (default: good)
    #[serde(default)]
    pub quality: Quality,
    /// Capture rate in frames per second (default: 30)
    #[serde(default = "default_fps")]
    pub fps: u32,
    /// Track width in pixels, already rounded to the encoder's block size
    pub width: Option<u32>,
    /// Track height in pixels, already rounded to the encoder's block size
    pub height: Option<u32>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            quality: Quality::default(),
            fps: default_fps(),
            width: None,
            height: None,
        }
    }
}

impl CaptureConfig {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            fps,
            width: Some(width),
            height: Some(height),
            ..Self::default()
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: CaptureConfig = toml::from_str(content)?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Reject values the muxer cannot describe.
    pub fn validate(&self) -> Result<(), String> {
        if self.fps == 0 {
            return Err("fps must be greater than zero".to_string());
        }
        if self.width == Some(0) || self.height == Some(0) {
            return Err("width and height must be greater than zero".to_string());
        }
        Ok(())
    }

    /// Fill in dimensions the config left unspecified.
    pub fn with_default_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width.get_or_insert(width);
        self.height.get_or_insert(height);
        self
    }

    pub fn frame_duration_ms(&self) -> f64 {
        1000.0 / self.fps as f64
    }

    /// Track description for a session whose encoder stamps frames in `timebase`.
    pub fn video_track(&self, timebase: Timebase) -> Result<VideoTrack, ConfigError> {
        match (self.width, self.height) {
            (Some(width), Some(height)) => {
                Ok(VideoTrack::new(width, height, timebase).frame_rate(self.fps))
            }
            _ => Err(ConfigError::Invalid(
                "width and height are required to describe the video track".to_string(),
            )),
        }
    }

    /// Timebase for encoders that stamp frames with their index.
    pub fn timebase(&self) -> Timebase {
        Timebase::new(1, self.fps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config = CaptureConfig::from_toml_str(
            r#"
            quality = "best"
            fps = 15
            width = 1280
            height = 720
            "#,
        )
        .unwrap();
        assert_eq!(config.quality, Quality::Best);
        assert_eq!(config.fps, 15);
        assert_eq!(config.width, Some(1280));
        assert_eq!(config.height, Some(720));
        assert_eq!(config.timebase(), Timebase::new(1, 15));
    }

    #[test]
    fn test_defaults() {
        let config = CaptureConfig::from_toml_str("").unwrap();
        assert_eq!(config, CaptureConfig::default());
        assert_eq!(config.quality, Quality::Good);
        assert_eq!(config.fps, 30);

        assert!(config.video_track(Timebase::MILLISECONDS).is_err());

        let config = config.with_default_dimensions(640, 480);
        assert_eq!((config.width, config.height), (Some(640), Some(480)));
        let track = config.video_track(Timebase::MILLISECONDS).unwrap();
        assert_eq!((track.width, track.height), (640, 480));
    }

    #[test]
    fn test_rejects_zero_fps() {
        let result = CaptureConfig::from_toml_str("fps = 0");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_unknown_quality() {
        let result = CaptureConfig::from_toml_str(r#"quality = "ultra""#);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_quality_presets() {
        assert_eq!(Quality::Fast.deadline_us(), 1);
        assert_eq!(Quality::Best.deadline_us(), 0);
        assert!(Quality::Fast.cpu_used() > Quality::Good.cpu_used());
        assert!(Quality::Good.cpu_used() > Quality::Best.cpu_used());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = CaptureConfig::load(&dir.path().join("missing.toml"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
