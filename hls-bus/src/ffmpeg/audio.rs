use std::collections::VecDeque;
use std::time::Duration;

use ffmpeg_next::format::{Sample, sample};
use ffmpeg_next::{ChannelLayout, Dictionary, Rational};

use super::{extradata, receive_output, set_global_header};
use crate::codec::{EncoderSession, OutputBuffer, OutputStatus};
use crate::encoder::AudioSettings;
use crate::packet::{MediaType, PacketFlags};

const AAC_FORMAT: Sample = Sample::F32(sample::Type::Planar);

/// AAC-LC session fed with interleaved s16le PCM.
pub struct AudioEncoder {
    encoder: ffmpeg_next::codec::encoder::Audio,
    sample_rate: u32,
    layout: ChannelLayout,
    frame_size: usize,
    /// Planar float samples waiting for a full encoder frame.
    fifo: Vec<VecDeque<f32>>,
    /// Pts of the next encoder frame, in samples.
    next_pts: Option<i64>,
    pending: VecDeque<OutputBuffer>,
    next_index: usize,
    last_pts_us: i64,
    eof_sent: bool,
    finished: bool,
}

unsafe impl Send for AudioEncoder {}

impl AudioEncoder {
    pub fn open(settings: &AudioSettings) -> anyhow::Result<Self> {
        let channels = settings.channels.clamp(1, 2);
        if channels != settings.channels {
            log::warn!("{} audio channels not supported, using {}", settings.channels, channels);
        }
        let layout = if channels == 1 {
            ChannelLayout::MONO
        } else {
            ChannelLayout::STEREO
        };

        let codec = ffmpeg_next::encoder::find(ffmpeg_next::codec::Id::AAC)
            .ok_or(anyhow::anyhow!("aac encoder not found"))?;
        let mut encoder = ffmpeg_next::codec::Context::new_with_codec(codec)
            .encoder()
            .audio()?;
        encoder.set_rate(settings.sample_rate as i32);
        encoder.set_format(AAC_FORMAT);
        encoder.set_bit_rate(settings.bitrate as usize);
        encoder.set_time_base(Rational::new(1, settings.sample_rate as i32));
        unsafe {
            let ctx = encoder.as_mut_ptr();
            ffmpeg_next::ffi::av_channel_layout_default(&mut (*ctx).ch_layout, channels as i32);
        }
        set_global_header(&mut encoder);
        let encoder = encoder.open_with(Dictionary::new())?;

        let frame_size = match encoder.frame_size() {
            0 => settings.samples_per_frame,
            n => n as usize,
        };
        log::info!(
            "audio encoder opened: aac {} Hz x{}, {} bps, {} samples per frame",
            settings.sample_rate,
            channels,
            settings.bitrate,
            frame_size
        );

        let mut pending = VecDeque::new();
        if let Some(config) = extradata(&encoder) {
            pending.push_back(OutputBuffer::new(0, config, 0, PacketFlags::CONFIG));
        }
        Ok(Self {
            encoder,
            sample_rate: settings.sample_rate,
            layout,
            frame_size,
            fifo: vec![VecDeque::new(); channels as usize],
            next_pts: None,
            next_index: pending.len(),
            pending,
            last_pts_us: 0,
            eof_sent: false,
            finished: false,
        })
    }

    fn micros_to_samples(&self, us: i64) -> i64 {
        us * self.sample_rate as i64 / 1_000_000
    }

    fn push_pcm(&mut self, payload: &[u8]) {
        let channels = self.fifo.len();
        for (i, pair) in payload.chunks_exact(2).enumerate() {
            let sample = i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0;
            self.fifo[i % channels].push_back(sample);
        }
    }

    fn buffered(&self) -> usize {
        self.fifo.first().map_or(0, VecDeque::len)
    }

    /// Send every full frame in the fifo; with `flush` also the zero-padded rest.
    fn send_frames(&mut self, flush: bool) -> anyhow::Result<()> {
        while self.buffered() >= self.frame_size || (flush && self.buffered() > 0) {
            let mut frame = ffmpeg_next::frame::Audio::new(AAC_FORMAT, self.frame_size, self.layout);
            frame.set_rate(self.sample_rate);
            let pts = self.next_pts.unwrap_or(0);
            frame.set_pts(Some(pts));

            for (plane, queue) in self.fifo.iter_mut().enumerate() {
                let dst = frame.data_mut(plane);
                for i in 0..self.frame_size {
                    let sample = queue.pop_front().unwrap_or(0.0);
                    dst[i * 4..i * 4 + 4].copy_from_slice(&sample.to_ne_bytes());
                }
            }
            self.encoder.send_frame(&frame)?;
            self.next_pts = Some(pts + self.frame_size as i64);
        }
        Ok(())
    }
}

impl EncoderSession for AudioEncoder {
    fn media_type(&self) -> MediaType {
        MediaType::Audio
    }

    fn queue_input(&mut self, payload: &[u8], pts_us: i64, end_of_stream: bool) -> anyhow::Result<()> {
        if self.next_pts.is_none() {
            self.next_pts = Some(self.micros_to_samples(pts_us));
        }
        self.push_pcm(payload);
        self.send_frames(end_of_stream)?;
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
        let rate = self.sample_rate as i64;
        receive_output(
            &mut self.encoder,
            index,
            &mut self.last_pts_us,
            &mut self.finished,
            |pts| pts * 1_000_000 / rate,
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
        log::info!("audio encoder stopped");
        Ok(())
    }
}
