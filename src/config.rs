use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use hls_bus::encoder::{AudioSettings, ConfigOffset, Settings, VideoSettings};
use hls_bus::frame::PixelLayout;
use hls_bus::sequencer::SequencerSettings;
use serde::Deserialize;

pub const CONFIG_ENV: &str = "LIVE_HLS_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub output_dir: PathBuf,
    pub listen: String,
    /// Camera size before rotation; 0x0 records audio only.
    pub width: u32,
    pub height: u32,
    pub rotation: u32,
    /// Chroma order the camera delivers: "nv21" or "nv12".
    pub pixel_format: String,
    pub frame_rate: u32,
    pub video_bitrate: u32,
    pub keyframe_interval_secs: u32,
    pub video_codec: String,
    pub sample_rate: u32,
    pub channels: u8,
    pub audio_bitrate: u32,
    pub segment_duration_secs: u32,
    pub playlist_size: u32,
    pub tick_period_ms: u64,
    pub backlog_bound: usize,
    pub eos_drain_timeout_ms: u64,
    /// Fixed key frame config offset; unset derives it from the frame interval.
    pub config_offset_us: Option<i64>,
    pub forward_config_packets: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("hls"),
            listen: "0.0.0.0:8080".to_string(),
            width: 640,
            height: 480,
            rotation: 0,
            pixel_format: "nv21".to_string(),
            frame_rate: 30,
            video_bitrate: 500_000,
            keyframe_interval_secs: 1,
            video_codec: "libx264".to_string(),
            sample_rate: 44100,
            channels: 1,
            audio_bitrate: 96_000,
            segment_duration_secs: 2,
            playlist_size: 0,
            tick_period_ms: 50,
            backlog_bound: 3,
            eos_drain_timeout_ms: 5000,
            config_offset_us: None,
            forward_config_packets: false,
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("read {}: {}", path.display(), e))?;
        serde_json::from_str(&raw).map_err(|e| anyhow::anyhow!("parse {}: {}", path.display(), e))
    }

    pub fn pixel_layout(&self) -> PixelLayout {
        match self.pixel_format.to_ascii_lowercase().as_str() {
            "nv12" => PixelLayout::Nv12,
            "nv21" => PixelLayout::Nv21,
            other => {
                log::warn!("unknown pixel format {}, assuming nv21", other);
                PixelLayout::Nv21
            }
        }
    }

    pub fn audio_only(&self) -> bool {
        self.width == 0 && self.height == 0
    }

    pub fn encoder_settings(&self) -> Settings {
        Settings {
            video: (!self.audio_only()).then(|| VideoSettings {
                width: self.width,
                height: self.height,
                bitrate: self.video_bitrate,
                frame_rate: self.frame_rate,
                keyframe_interval_secs: self.keyframe_interval_secs,
                codec: Some(self.video_codec.clone()),
            }),
            audio: AudioSettings {
                sample_rate: self.sample_rate,
                channels: self.channels,
                bitrate: self.audio_bitrate,
                ..Default::default()
            },
            eos_drain_timeout: Duration::from_millis(self.eos_drain_timeout_ms),
            config_offset: match self.config_offset_us {
                Some(us) => ConfigOffset::Fixed(us),
                None => ConfigOffset::default(),
            },
            forward_config_packets: self.forward_config_packets,
            ..Default::default()
        }
    }

    pub fn sequencer_settings(&self) -> SequencerSettings {
        SequencerSettings {
            tick_period: Duration::from_millis(self.tick_period_ms),
            backlog_bound: self.backlog_bound,
        }
    }
}

pub fn config() -> &'static AppConfig {
    static CONFIG: LazyLock<AppConfig> = LazyLock::new(|| match std::env::var(CONFIG_ENV) {
        Ok(path) => AppConfig::load(Path::new(&path)).unwrap_or_else(|e| {
            log::error!("{}, using defaults", e);
            AppConfig::default()
        }),
        Err(_) => AppConfig::default(),
    });
    &CONFIG
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("live-hls.json");
        std::fs::write(&path, r#"{"width": 0, "height": 0, "config_offset_us": 500}"#)?;

        let config = AppConfig::load(&path)?;
        assert!(config.audio_only());
        assert_eq!(config.sample_rate, 44100);
        let settings = config.encoder_settings();
        assert!(settings.video.is_none());
        assert_eq!(settings.config_offset, ConfigOffset::Fixed(500));
        assert_eq!(config.sequencer_settings().backlog_bound, 3);
        assert_eq!(config.pixel_layout(), PixelLayout::Nv21);
        Ok(())
    }

    #[test]
    fn test_pixel_format() {
        let config = AppConfig {
            pixel_format: "NV12".to_string(),
            ..Default::default()
        };
        assert_eq!(config.pixel_layout(), PixelLayout::Nv12);
    }

    #[test]
    fn test_bad_config_is_an_error() {
        assert!(AppConfig::load(Path::new("/nonexistent/live-hls.json")).is_err());
    }
}
