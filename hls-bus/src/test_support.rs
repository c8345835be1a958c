//! Scripted sessions, muxers and samplers shared by the module tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use crate::codec::{EncoderSession, OutputBuffer, OutputStatus};
use crate::muxer::Muxer;
use crate::packet::{MediaPacket, MediaType, PacketFlags};
use crate::sampler::{AudioSampler, SampleRead};

#[derive(Default)]
pub struct SessionLog {
    pub inputs: Vec<(usize, i64, bool)>,
    pub released: Vec<usize>,
    pub refreshes: usize,
    pub stopped: bool,
}

/// Encodes by copying: every input becomes one output buffer with the same pts.
pub struct MockSession {
    pub media: MediaType,
    pub config: Option<Bytes>,
    /// Every n-th output (starting with the first) is a key frame. 0 = never.
    pub key_every: u64,
    pub emit_eos: bool,
    /// Output buffer number that comes back without data.
    pub missing_at: Option<usize>,
    /// Input frame number whose output is preceded by a buffer layout change.
    pub buffers_changed_at: Option<u64>,
    pub log: Arc<Mutex<SessionLog>>,
    outputs: VecDeque<OutputStatus>,
    next_index: usize,
    frames: u64,
}

impl MockSession {
    pub fn new(media: MediaType) -> Self {
        Self {
            media,
            config: Some(Bytes::from_static(&[0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68])),
            key_every: 2,
            emit_eos: true,
            missing_at: None,
            buffers_changed_at: None,
            log: Arc::new(Mutex::new(SessionLog::default())),
            outputs: VecDeque::new(),
            next_index: 0,
            frames: 0,
        }
    }

    pub fn audio() -> Self {
        let mut session = Self::new(MediaType::Audio);
        session.config = Some(Bytes::from_static(&[0x12, 0x08]));
        session.key_every = 0;
        session
    }

    fn push(&mut self, data: Option<Bytes>, pts_us: i64, flags: PacketFlags) {
        let index = self.next_index;
        self.next_index += 1;
        let data = if self.missing_at == Some(index) {
            None
        } else {
            data
        };
        self.outputs.push_back(OutputStatus::Ready(OutputBuffer {
            index,
            data,
            pts_us,
            flags,
        }));
    }
}

impl EncoderSession for MockSession {
    fn media_type(&self) -> MediaType {
        self.media
    }

    fn queue_input(&mut self, payload: &[u8], pts_us: i64, end_of_stream: bool) -> anyhow::Result<()> {
        self.log
            .lock()
            .unwrap()
            .inputs
            .push((payload.len(), pts_us, end_of_stream));
        if let Some(config) = self.config.take() {
            self.outputs.push_back(OutputStatus::FormatChanged);
            self.push(Some(config), 0, PacketFlags::CONFIG);
        }
        if !payload.is_empty() {
            let mut flags = PacketFlags::NONE;
            if self.key_every > 0 && self.frames % self.key_every == 0 {
                flags |= PacketFlags::KEY_FRAME;
            }
            if self.buffers_changed_at == Some(self.frames) {
                self.outputs.push_back(OutputStatus::BuffersChanged);
            }
            self.frames += 1;
            self.push(Some(Bytes::copy_from_slice(payload)), pts_us, flags);
        }
        if end_of_stream && self.emit_eos {
            self.push(Some(Bytes::new()), pts_us, PacketFlags::END_OF_STREAM);
        }
        Ok(())
    }

    fn poll_output(&mut self, _timeout: Duration) -> anyhow::Result<OutputStatus> {
        Ok(self.outputs.pop_front().unwrap_or(OutputStatus::TryAgain))
    }

    fn release_output(&mut self, index: usize) -> anyhow::Result<()> {
        self.log.lock().unwrap().released.push(index);
        Ok(())
    }

    fn refresh_output_buffers(&mut self) -> anyhow::Result<()> {
        self.log.lock().unwrap().refreshes += 1;
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.log.lock().unwrap().stopped = true;
        Ok(())
    }
}

#[derive(Default)]
pub struct MuxLog {
    pub opened: u32,
    pub finished: u32,
    pub packets: Vec<MediaPacket>,
}

impl MuxLog {
    pub fn of(&self, media: MediaType) -> Vec<MediaPacket> {
        self.packets
            .iter()
            .filter(|p| p.media_type == media)
            .cloned()
            .collect()
    }
}

#[derive(Clone, Default)]
pub struct RecordingMuxer {
    pub log: Arc<Mutex<MuxLog>>,
}

impl Muxer for RecordingMuxer {
    fn open(&mut self) -> anyhow::Result<()> {
        self.log.lock().unwrap().opened += 1;
        Ok(())
    }

    fn write_packet(&mut self, packet: &MediaPacket) -> anyhow::Result<()> {
        self.log.lock().unwrap().packets.push(packet.clone());
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.log.lock().unwrap().finished += 1;
        Ok(())
    }
}

/// Produces a full buffer of a constant byte every `period`.
pub struct MockSampler {
    pub period: Duration,
    pub reads: Arc<Mutex<u32>>,
    pub stopped: Arc<Mutex<bool>>,
}

impl MockSampler {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            reads: Arc::new(Mutex::new(0)),
            stopped: Arc::new(Mutex::new(false)),
        }
    }
}

impl AudioSampler for MockSampler {
    fn read(&mut self, buf: &mut [u8]) -> anyhow::Result<SampleRead> {
        std::thread::sleep(self.period);
        *self.reads.lock().unwrap() += 1;
        buf.fill(0x11);
        Ok(SampleRead::Samples(buf.len()))
    }

    fn stop(&mut self) {
        *self.stopped.lock().unwrap() = true;
    }
}
