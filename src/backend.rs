use hls_bus::codec::EncoderSession;
use hls_bus::controller::{OutputTarget, RecorderBackend};
use hls_bus::encoder::{AudioSettings, Settings, VideoSettings};
use hls_bus::muxer::Muxer;
use hls_bus::sampler::AudioSampler;

use crate::config::AppConfig;
use crate::source::ToneSampler;

/// Wires the compiled-in codec backend and the synthetic microphone into recordings.
pub struct AppBackend {
    segment_duration_secs: u32,
    playlist_size: u32,
}

impl AppBackend {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            segment_duration_secs: config.segment_duration_secs,
            playlist_size: config.playlist_size,
        }
    }
}

#[cfg(feature = "ffmpeg")]
impl RecorderBackend for AppBackend {
    fn video_encoder(&self, settings: &VideoSettings) -> anyhow::Result<Box<dyn EncoderSession>> {
        Ok(Box::new(hls_bus::ffmpeg::VideoEncoder::open(settings)?))
    }

    fn audio_encoder(&self, settings: &AudioSettings) -> anyhow::Result<Box<dyn EncoderSession>> {
        Ok(Box::new(hls_bus::ffmpeg::AudioEncoder::open(settings)?))
    }

    fn audio_sampler(&self, settings: &AudioSettings) -> anyhow::Result<Box<dyn AudioSampler>> {
        Ok(Box::new(ToneSampler::new(settings.sample_rate, settings.channels)))
    }

    fn muxer(&self, target: &OutputTarget, settings: &Settings) -> anyhow::Result<Box<dyn Muxer>> {
        let hls = hls_bus::ffmpeg::HlsSettings {
            segment_duration_secs: self.segment_duration_secs,
            list_size: self.playlist_size,
        };
        Ok(Box::new(hls_bus::ffmpeg::HlsMuxer::new(
            &target.manifest,
            settings.video.as_ref(),
            &settings.audio,
            hls,
        )?))
    }
}

#[cfg(not(feature = "ffmpeg"))]
impl RecorderBackend for AppBackend {
    fn video_encoder(&self, _settings: &VideoSettings) -> anyhow::Result<Box<dyn EncoderSession>> {
        anyhow::bail!("no video encoder compiled in, rebuild with --features ffmpeg")
    }

    fn audio_encoder(&self, _settings: &AudioSettings) -> anyhow::Result<Box<dyn EncoderSession>> {
        anyhow::bail!("no audio encoder compiled in, rebuild with --features ffmpeg")
    }

    fn audio_sampler(&self, settings: &AudioSettings) -> anyhow::Result<Box<dyn AudioSampler>> {
        Ok(Box::new(ToneSampler::new(settings.sample_rate, settings.channels)))
    }

    fn muxer(&self, target: &OutputTarget, _settings: &Settings) -> anyhow::Result<Box<dyn Muxer>> {
        log::debug!(
            "elementary stream output, segments {} s / {} entries ignored",
            self.segment_duration_secs,
            self.playlist_size
        );
        Ok(Box::new(hls_bus::muxer::ElementaryStreamMuxer::new(&target.dir)))
    }
}
