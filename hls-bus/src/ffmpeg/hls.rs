use std::path::Path;

use bytes::{Bytes, BytesMut};
use ffmpeg_next::{Dictionary, Rational, codec::Parameters};

use super::MICROS_TIME_BASE;
use crate::encoder::{AudioSettings, VideoSettings};
use crate::muxer::Muxer;
use crate::packet::{MediaPacket, MediaType};

#[derive(Debug, Clone)]
pub struct HlsSettings {
    /// Target segment length (`hls_time`).
    pub segment_duration_secs: u32,
    /// Entries kept in the manifest (`hls_list_size`); 0 keeps all.
    pub list_size: u32,
}

impl Default for HlsSettings {
    fn default() -> Self {
        Self {
            segment_duration_secs: 2,
            list_size: 0,
        }
    }
}

/// Writes AnnexB H.264 and ADTS AAC packets through FFmpeg's `hls` muxer: a
/// rolling `.m3u8` manifest plus MPEG-TS segments named after it.
pub struct HlsMuxer {
    inner: ffmpeg_next::format::context::Output,
    settings: HlsSettings,
    video_index: Option<usize>,
    audio_index: usize,
    /// Config packet waiting to be prepended to the next key frame.
    pending_config: Option<Bytes>,
    have_written_header: bool,
    have_written_trailer: bool,
}

unsafe impl Send for HlsMuxer {}

impl HlsMuxer {
    pub fn new(
        manifest: &Path,
        video: Option<&VideoSettings>,
        audio: &AudioSettings,
        settings: HlsSettings,
    ) -> anyhow::Result<Self> {
        let mut inner = ffmpeg_next::format::output_as(&manifest, "hls")?;

        let video_index = match video {
            Some(video) => {
                let mut stream = inner.add_stream(ffmpeg_next::encoder::find(
                    ffmpeg_next::codec::Id::H264,
                ))?;
                stream.set_parameters(video_parameters(video));
                stream.set_time_base(MICROS_TIME_BASE);
                Some(stream.index())
            }
            None => None,
        };
        let mut stream = inner.add_stream(ffmpeg_next::encoder::find(ffmpeg_next::codec::Id::AAC))?;
        stream.set_parameters(audio_parameters(audio));
        stream.set_time_base(Rational::new(1, audio.sample_rate as i32));
        let audio_index = stream.index();

        Ok(Self {
            inner,
            settings,
            video_index,
            audio_index,
            pending_config: None,
            have_written_header: false,
            have_written_trailer: false,
        })
    }

    fn stream_index(&self, media: MediaType) -> anyhow::Result<usize> {
        match media {
            MediaType::Video => self
                .video_index
                .ok_or(anyhow::anyhow!("video packet for audio only recording")),
            MediaType::Audio => Ok(self.audio_index),
        }
    }
}

fn video_parameters(video: &VideoSettings) -> Parameters {
    let mut params = Parameters::new();
    unsafe {
        let ptr = params.as_mut_ptr();
        (*ptr).codec_type = ffmpeg_next::media::Type::Video.into();
        (*ptr).codec_id = ffmpeg_next::codec::Id::H264.into();
        (*ptr).width = video.width as i32;
        (*ptr).height = video.height as i32;
        (*ptr).bit_rate = video.bitrate as i64;
    }
    params
}

fn audio_parameters(audio: &AudioSettings) -> Parameters {
    let mut params = Parameters::new();
    unsafe {
        let ptr = params.as_mut_ptr();
        (*ptr).codec_type = ffmpeg_next::media::Type::Audio.into();
        (*ptr).codec_id = ffmpeg_next::codec::Id::AAC.into();
        (*ptr).sample_rate = audio.sample_rate as i32;
        (*ptr).bit_rate = audio.bitrate as i64;
        ffmpeg_next::ffi::av_channel_layout_default(
            &mut (*ptr).ch_layout,
            audio.channels.clamp(1, 2) as i32,
        );
    }
    params
}

impl Muxer for HlsMuxer {
    fn open(&mut self) -> anyhow::Result<()> {
        if self.have_written_header {
            return Ok(());
        }
        let mut opts = Dictionary::new();
        opts.set("hls_time", &self.settings.segment_duration_secs.to_string());
        opts.set("hls_list_size", &self.settings.list_size.to_string());
        self.inner.write_header_with(opts)?;
        self.have_written_header = true;
        log::info!(
            "hls muxer opened, segment {} s, list size {}",
            self.settings.segment_duration_secs,
            self.settings.list_size
        );
        Ok(())
    }

    fn write_packet(&mut self, packet: &MediaPacket) -> anyhow::Result<()> {
        if !self.have_written_header || self.have_written_trailer {
            anyhow::bail!("hls muxer is not open");
        }
        if packet.is_config() {
            // Audio config travels in every ADTS header.
            if packet.media_type == MediaType::Video {
                self.pending_config = Some(packet.data.clone());
            }
            return Ok(());
        }

        let index = self.stream_index(packet.media_type)?;
        let data = match self.pending_config.take() {
            Some(config) if packet.is_key() => {
                let mut joined = BytesMut::with_capacity(config.len() + packet.size());
                joined.extend_from_slice(&config);
                joined.extend_from_slice(&packet.data);
                joined.freeze()
            }
            other => {
                self.pending_config = other;
                packet.data.clone()
            }
        };

        let mut out = ffmpeg_next::Packet::copy(&data);
        out.set_stream(index);
        out.set_pts(Some(packet.pts_us));
        out.set_dts(Some(packet.pts_us));
        out.set_position(-1);
        if packet.is_key() {
            out.set_flags(ffmpeg_next::codec::packet::Flags::KEY);
        }
        let out_time_base = self
            .inner
            .stream(index)
            .map(|s| s.time_base())
            .ok_or(anyhow::anyhow!("stream {} not found", index))?;
        out.rescale_ts(MICROS_TIME_BASE, out_time_base);
        out.write_interleaved(&mut self.inner)?;
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        if self.have_written_header && !self.have_written_trailer {
            self.have_written_trailer = true;
            self.inner.write_trailer()?;
            log::info!("hls muxer finished");
        }
        Ok(())
    }
}
