//! Synthetic camera and microphone used when no capture device is wired in.

use std::f32::consts::TAU;
use std::time::{Duration, Instant};

use hls_bus::frame::{CameraFrame, PixelLayout, Rotation, nv12_size};
use hls_bus::sampler::{AudioSampler, SampleRead};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Moving-bar test pattern at a fixed frame rate.
pub struct SyntheticCamera {
    width: u32,
    height: u32,
    rotation: Rotation,
    layout: PixelLayout,
    frame_rate: u32,
}

impl SyntheticCamera {
    pub fn new(width: u32, height: u32, rotation: Rotation, frame_rate: u32) -> Self {
        Self {
            width,
            height,
            rotation,
            layout: PixelLayout::Nv21,
            frame_rate: frame_rate.max(1),
        }
    }

    pub fn with_layout(mut self, layout: PixelLayout) -> Self {
        self.layout = layout;
        self
    }

    fn frame(&self, index: u64) -> CameraFrame {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut data = vec![0x80u8; nv12_size(self.width, self.height)];
        let bar = (index as usize * 4) % w.max(1);
        for row in data[..w * h].chunks_exact_mut(w) {
            for (x, px) in row.iter_mut().enumerate() {
                *px = if x.abs_diff(bar) < 16 { 235 } else { 16 + (x * 200 / w) as u8 };
            }
        }
        CameraFrame {
            data,
            width: self.width,
            height: self.height,
            rotation: self.rotation,
            layout: self.layout,
        }
    }

    /// Produce frames until cancelled or the receiver goes away.
    pub fn spawn(self, cancel: CancellationToken) -> mpsc::Receiver<CameraFrame> {
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(1) / self.frame_rate);
            let mut index: u64 = 0;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if tx.send(self.frame(index)).await.is_err() {
                            break;
                        }
                        index += 1;
                    }
                }
            }
            log::info!("synthetic camera stopped after {} frames", index);
        });
        rx
    }
}

/// 440 Hz sine, s16le, paced by the wall clock.
pub struct ToneSampler {
    sample_rate: u32,
    channels: usize,
    started: Option<Instant>,
    produced: u64,
}

impl ToneSampler {
    pub fn new(sample_rate: u32, channels: u8) -> Self {
        Self {
            sample_rate,
            channels: channels.max(1) as usize,
            started: None,
            produced: 0,
        }
    }
}

impl AudioSampler for ToneSampler {
    fn start(&mut self) -> anyhow::Result<()> {
        self.started = Some(Instant::now());
        log::info!("tone sampler started at {} Hz", self.sample_rate);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> anyhow::Result<SampleRead> {
        let started = *self.started.get_or_insert_with(Instant::now);
        let frames = buf.len() / (2 * self.channels);
        let due = (started.elapsed().as_secs_f64() * self.sample_rate as f64) as u64;
        if due < self.produced + frames as u64 {
            return Ok(SampleRead::TryAgain);
        }

        for (i, frame) in buf.chunks_exact_mut(2 * self.channels).enumerate() {
            let t = (self.produced + i as u64) as f32 / self.sample_rate as f32;
            let value = ((t * 440.0 * TAU).sin() * 0.25 * i16::MAX as f32) as i16;
            for sample in frame.chunks_exact_mut(2) {
                sample.copy_from_slice(&value.to_le_bytes());
            }
        }
        self.produced += frames as u64;
        Ok(SampleRead::Samples(frames * 2 * self.channels))
    }

    fn stop(&mut self) {
        log::info!("tone sampler stopped after {} samples", self.produced);
    }
}
