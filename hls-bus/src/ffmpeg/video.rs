use std::collections::VecDeque;
use std::time::Duration;

use ffmpeg_next::{Dictionary, Rational, format::Pixel};

use super::hw::{find_hw_encoder, is_hw_encoder};
use super::{MICROS_TIME_BASE, extradata, receive_output, set_global_header};
use crate::codec::{EncoderSession, OutputBuffer, OutputStatus};
use crate::encoder::VideoSettings;
use crate::packet::{MediaType, PacketFlags};

/// H.264 session fed with NV12 frames stamped in microseconds.
pub struct VideoEncoder {
    encoder: ffmpeg_next::codec::encoder::Video,
    codec_name: String,
    width: u32,
    height: u32,
    pending: VecDeque<OutputBuffer>,
    next_index: usize,
    last_pts_us: i64,
    eof_sent: bool,
    finished: bool,
}

unsafe impl Send for VideoEncoder {}

impl VideoEncoder {
    pub fn open(settings: &VideoSettings) -> anyhow::Result<Self> {
        let codec = settings
            .codec
            .clone()
            .unwrap_or_else(|| "libx264".to_string());

        // Try hardware encoder first, then fall back to software encoder.
        let (context, selected) = match find_hw_encoder(&codec) {
            Some(hw_codec) => {
                let hw_name = hw_codec.name().to_string();
                log::info!("attempting hardware encoder: {}", hw_name);
                (ffmpeg_next::codec::Context::new_with_codec(hw_codec), hw_name)
            }
            None => {
                log::info!("no hardware encoder found, using software encoder: {}", codec);
                (Self::software_context(&codec)?, codec.clone())
            }
        };

        let (encoder, selected) = match Self::open_context(context, settings) {
            Ok(encoder) => (encoder, selected),
            Err(e) if selected != codec => {
                log::warn!(
                    "hardware encoder {} failed: {}, falling back to {}",
                    selected,
                    e,
                    codec
                );
                let encoder = Self::open_context(Self::software_context(&codec)?, settings)?;
                (encoder, codec.clone())
            }
            Err(e) => return Err(e),
        };
        log::info!(
            "video encoder opened: {} (hardware: {}) {}x{} @ {} fps, gop {}",
            selected,
            is_hw_encoder(&selected),
            settings.width,
            settings.height,
            settings.frame_rate,
            settings.gop_size()
        );

        let mut pending = VecDeque::new();
        match extradata(&encoder) {
            Some(config) => pending.push_back(OutputBuffer::new(0, config, 0, PacketFlags::CONFIG)),
            None => log::warn!("{} produced no extradata, key frames will lack config", selected),
        }
        Ok(Self {
            encoder,
            codec_name: selected,
            width: settings.width,
            height: settings.height,
            next_index: pending.len(),
            pending,
            last_pts_us: 0,
            eof_sent: false,
            finished: false,
        })
    }

    fn software_context(codec: &str) -> anyhow::Result<ffmpeg_next::codec::Context> {
        let sw_codec = ffmpeg_next::encoder::find_by_name(codec)
            .ok_or(anyhow::anyhow!("codec not found: {}", codec))?;
        Ok(ffmpeg_next::codec::Context::new_with_codec(sw_codec))
    }

    fn open_context(
        context: ffmpeg_next::codec::Context,
        settings: &VideoSettings,
    ) -> anyhow::Result<ffmpeg_next::codec::encoder::Video> {
        let mut encoder = context.encoder().video()?;
        encoder.set_width(settings.width);
        encoder.set_height(settings.height);
        encoder.set_format(Pixel::NV12);
        encoder.set_frame_rate(Some(Rational::new(settings.frame_rate as i32, 1)));
        encoder.set_time_base(MICROS_TIME_BASE);
        encoder.set_bit_rate(settings.bitrate as usize);
        encoder.set_gop(settings.gop_size());
        encoder.set_max_b_frames(0);
        set_global_header(&mut encoder);

        let mut opts = Dictionary::new();
        opts.set("preset", "ultrafast");
        opts.set("tune", "zerolatency");
        Ok(encoder.open_with(opts)?)
    }

    fn frame_from_nv12(&self, payload: &[u8]) -> anyhow::Result<ffmpeg_next::frame::Video> {
        let (w, h) = (self.width as usize, self.height as usize);
        if payload.len() < w * h * 3 / 2 {
            anyhow::bail!(
                "nv12 payload of {} bytes is too small for {}x{}",
                payload.len(),
                w,
                h
            );
        }
        let mut frame = ffmpeg_next::frame::Video::new(Pixel::NV12, self.width, self.height);
        let (luma, chroma) = payload.split_at(w * h);
        for (plane, src, rows) in [(0, luma, h), (1, chroma, h / 2)] {
            let stride = frame.stride(plane);
            let dst = frame.data_mut(plane);
            for row in 0..rows {
                dst[row * stride..row * stride + w].copy_from_slice(&src[row * w..row * w + w]);
            }
        }
        Ok(frame)
    }
}

impl EncoderSession for VideoEncoder {
    fn media_type(&self) -> MediaType {
        MediaType::Video
    }

    fn queue_input(&mut self, payload: &[u8], pts_us: i64, end_of_stream: bool) -> anyhow::Result<()> {
        if !payload.is_empty() {
            let mut frame = self.frame_from_nv12(payload)?;
            frame.set_pts(Some(pts_us));
            self.encoder.send_frame(&frame)?;
        }
        if end_of_stream && !self.eof_sent {
            self.eof_sent = true;
            self.encoder.send_eof()?;
        }
        Ok(())
    }

    fn poll_output(&mut self, _timeout: Duration) -> anyhow::Result<OutputStatus> {
        if let Some(buffer) = self.pending.pop_front() {
            return Ok(OutputStatus::Ready(buffer));
        }
        if self.finished {
            return Ok(OutputStatus::TryAgain);
        }
        let index = self.next_index;
        self.next_index += 1;
        receive_output(
            &mut self.encoder,
            index,
            &mut self.last_pts_us,
            &mut self.finished,
            |pts| pts,
        )
    }

    fn release_output(&mut self, _index: usize) -> anyhow::Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        if !self.eof_sent {
            self.eof_sent = true;
            self.encoder.send_eof()?;
        }
        log::info!("video encoder {} stopped", self.codec_name);
        Ok(())
    }
}
