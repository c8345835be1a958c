use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::codec::{EncoderSession, OutputBuffer, OutputStatus};
use crate::error::{PipelineError, PipelineResult};
use crate::frame::PendingFrame;
use crate::muxer::Muxer;
use crate::packet::{MediaPacket, MediaType, PacketFlags};
use crate::packetizer::{
    AdtsConfig, packetize_audio, packetize_ordinary, packetize_video_keyframe,
};

/// Offset between a re-emitted config packet and its key frame when no
/// frame interval has been observed yet.
pub const DEFAULT_CONFIG_OFFSET_US: i64 = 1159;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Draining,
    Stopped,
}

/// How far before a key frame its config packet is stamped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigOffset {
    Fixed(i64),
    /// Half the smallest observed output frame interval, capped at `initial_us`.
    Adaptive { initial_us: i64 },
}

impl Default for ConfigOffset {
    fn default() -> Self {
        ConfigOffset::Adaptive {
            initial_us: DEFAULT_CONFIG_OFFSET_US,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VideoSettings {
    pub width: u32,
    pub height: u32,
    pub bitrate: u32,
    pub frame_rate: u32,
    pub keyframe_interval_secs: u32,
    pub codec: Option<String>,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            bitrate: 500_000,
            frame_rate: 30,
            keyframe_interval_secs: 1,
            codec: Some("libx264".to_string()),
        }
    }
}

impl VideoSettings {
    pub fn gop_size(&self) -> u32 {
        (self.frame_rate * self.keyframe_interval_secs).max(1)
    }
}

#[derive(Debug, Clone)]
pub struct AudioSettings {
    pub sample_rate: u32,
    pub channels: u8,
    pub bitrate: u32,
    pub samples_per_frame: usize,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channels: 1,
            bitrate: 96_000,
            samples_per_frame: 1024,
        }
    }
}

impl AudioSettings {
    pub fn adts(&self) -> AdtsConfig {
        AdtsConfig::for_stream(self.sample_rate, self.channels)
    }

    /// Bytes of s16 PCM per capture read.
    pub fn buffer_bytes(&self) -> usize {
        self.samples_per_frame * self.channels.max(1) as usize * 2
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// `None` records audio only.
    pub video: Option<VideoSettings>,
    pub audio: AudioSettings,
    pub poll_timeout: Duration,
    /// Upper bound for a blocking drain waiting on end of stream.
    pub eos_drain_timeout: Duration,
    pub config_offset: ConfigOffset,
    /// Also hand config buffers to the muxer as CONFIG packets.
    pub forward_config_packets: bool,
    /// Hold audio capture until the first video frame was submitted.
    pub wait_for_video: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            video: Some(VideoSettings::default()),
            audio: AudioSettings::default(),
            poll_timeout: Duration::from_micros(100),
            eos_drain_timeout: Duration::from_secs(5),
            config_offset: ConfigOffset::default(),
            forward_config_packets: false,
            wait_for_video: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    /// The session reached end of stream and was stopped.
    EndOfStream,
    Rejected,
    Failed,
}

struct SessionSlot {
    media: MediaType,
    session: Option<Box<dyn EncoderSession>>,
    state: SessionState,
    config_blob: Option<Bytes>,
    last_input_pts: Option<i64>,
    last_output_pts: Option<i64>,
    min_output_interval: Option<i64>,
    packets_out: u64,
}

impl SessionSlot {
    fn new(media: MediaType, session: Option<Box<dyn EncoderSession>>) -> Self {
        let state = if session.is_some() {
            SessionState::Idle
        } else {
            SessionState::Stopped
        };
        Self {
            media,
            session,
            state,
            config_blob: None,
            last_input_pts: None,
            last_output_pts: None,
            min_output_interval: None,
            packets_out: 0,
        }
    }

    fn accepts_input(&self) -> bool {
        self.session.is_some()
            && matches!(self.state, SessionState::Running | SessionState::Draining)
    }

    /// Strictly increasing input timestamps per session.
    fn next_pts(&mut self, raw_pts: i64) -> i64 {
        let pts = match self.last_input_pts {
            Some(last) if raw_pts <= last => last + 1,
            _ => raw_pts,
        };
        self.last_input_pts = Some(pts);
        pts
    }

    fn observe_output_pts(&mut self, pts: i64) {
        if let Some(last) = self.last_output_pts {
            let gap = pts - last;
            if gap > 0 {
                self.min_output_interval =
                    Some(self.min_output_interval.map_or(gap, |min| min.min(gap)));
            }
        }
        self.last_output_pts = Some(pts);
    }

    fn config_offset(&self, mode: ConfigOffset) -> i64 {
        match mode {
            ConfigOffset::Fixed(us) => us,
            ConfigOffset::Adaptive { initial_us } => match self.min_output_interval {
                Some(gap) => (gap / 2).clamp(1, initial_us.max(1)),
                None => initial_us,
            },
        }
    }

    fn shutdown(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.stop() {
                log::warn!("{} session stop failed: {:#}", self.media, e);
            }
        }
        self.state = SessionState::Stopped;
    }
}

struct PipelineState {
    video: SessionSlot,
    audio: SessionSlot,
    muxer: Box<dyn Muxer>,
    muxer_finalized: bool,
    full_stop: bool,
    first_frame_ready: bool,
}

impl PipelineState {
    fn slot(&self, media: MediaType) -> &SessionSlot {
        match media {
            MediaType::Video => &self.video,
            MediaType::Audio => &self.audio,
        }
    }

    fn slot_mut(&mut self, media: MediaType) -> &mut SessionSlot {
        match media {
            MediaType::Video => &mut self.video,
            MediaType::Audio => &mut self.audio,
        }
    }
}

/// Feeds both encoder sessions, turns their output into muxable packets and
/// finalizes the muxer once both reached end of stream.
///
/// Every submit and drain runs under one mutex, which also guards the muxer,
/// so packets of both media types reach it one at a time.
pub struct EncoderPipeline {
    settings: Settings,
    adts: AdtsConfig,
    started_at: Instant,
    inner: Mutex<PipelineState>,
    finalized: watch::Sender<bool>,
}

impl EncoderPipeline {
    pub fn start(
        settings: Settings,
        video: Option<Box<dyn EncoderSession>>,
        audio: Box<dyn EncoderSession>,
        mut muxer: Box<dyn Muxer>,
    ) -> PipelineResult<Self> {
        muxer.open()?;

        let mut video = SessionSlot::new(MediaType::Video, video);
        let mut audio = SessionSlot::new(MediaType::Audio, Some(audio));
        for slot in [&mut video, &mut audio] {
            if slot.state == SessionState::Idle {
                slot.state = SessionState::Running;
            }
        }
        let video_enabled = video.state == SessionState::Running;
        if !video_enabled {
            log::info!("no video session, recording audio only");
        }

        let (finalized, _) = watch::channel(false);
        log::info!(
            "encoder pipeline started, video: {}, audio: {} Hz x{}",
            video_enabled,
            settings.audio.sample_rate,
            settings.audio.channels
        );
        Ok(Self {
            adts: settings.audio.adts(),
            started_at: Instant::now(),
            inner: Mutex::new(PipelineState {
                video,
                audio,
                muxer,
                muxer_finalized: false,
                full_stop: false,
                first_frame_ready: !(settings.wait_for_video && video_enabled),
            }),
            finalized,
            settings,
        })
    }

    fn lock(&self) -> MutexGuard<'_, PipelineState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Submit one raw buffer stamped with the time elapsed since start.
    pub fn submit(&self, media: MediaType, payload: &[u8], end_of_stream: bool) -> SubmitOutcome {
        self.submit_at(media, payload, Instant::now(), end_of_stream)
    }

    /// Submit one raw buffer stamped with its capture instant.
    pub fn submit_at(
        &self,
        media: MediaType,
        payload: &[u8],
        captured_at: Instant,
        end_of_stream: bool,
    ) -> SubmitOutcome {
        let raw_pts = captured_at
            .saturating_duration_since(self.started_at)
            .as_micros() as i64;
        let mut state = self.lock();
        match self.submit_locked(&mut state, media, payload, raw_pts, end_of_stream) {
            Ok(outcome) => outcome,
            Err(e) => self.fail(&mut state, media, "submit", e),
        }
    }

    /// Pull pending output. With `block_until_eos` keep polling until the
    /// encoder reports end of stream or the drain timeout passes.
    pub fn drain(&self, media: MediaType, block_until_eos: bool) -> SubmitOutcome {
        let mut state = self.lock();
        if state.slot(media).session.is_none() {
            return SubmitOutcome::EndOfStream;
        }
        match self.drain_locked(&mut state, media, block_until_eos) {
            Ok(outcome) => outcome,
            Err(e) => self.fail(&mut state, media, "drain", e),
        }
    }

    fn submit_locked(
        &self,
        state: &mut PipelineState,
        media: MediaType,
        payload: &[u8],
        raw_pts: i64,
        end_of_stream: bool,
    ) -> PipelineResult<SubmitOutcome> {
        let slot = state.slot_mut(media);
        if !slot.accepts_input() {
            let err = PipelineError::SessionNotRunning {
                media,
                state: slot.state,
            };
            log::warn!("{}", err);
            return Ok(SubmitOutcome::Rejected);
        }
        let pts = slot.next_pts(raw_pts);
        let Some(session) = slot.session.as_mut() else {
            return Ok(SubmitOutcome::Rejected);
        };
        session.queue_input(payload, pts, end_of_stream)?;

        if end_of_stream {
            slot.state = SessionState::Draining;
            log::info!("{} end of stream queued at {} us, draining", media, pts);
        }
        if media == MediaType::Video && !state.first_frame_ready {
            state.first_frame_ready = true;
            log::info!("first video frame submitted");
        }
        self.drain_locked(state, media, end_of_stream)
    }

    fn drain_locked(
        &self,
        state: &mut PipelineState,
        media: MediaType,
        block_until_eos: bool,
    ) -> PipelineResult<SubmitOutcome> {
        let deadline = Instant::now() + self.settings.eos_drain_timeout;
        loop {
            let PipelineState {
                video, audio, muxer, ..
            } = &mut *state;
            let slot = match media {
                MediaType::Video => video,
                MediaType::Audio => audio,
            };
            let Some(session) = slot.session.as_mut() else {
                return Ok(SubmitOutcome::EndOfStream);
            };

            match session.poll_output(self.settings.poll_timeout)? {
                OutputStatus::TryAgain => {
                    if !block_until_eos {
                        return Ok(SubmitOutcome::Accepted);
                    }
                    if Instant::now() >= deadline {
                        return Err(PipelineError::EndOfStreamTimeout(media));
                    }
                    log::trace!("{} waiting for end of stream", media);
                    std::thread::sleep(self.settings.poll_timeout);
                }
                OutputStatus::BuffersChanged => {
                    log::debug!("{} output buffers changed", media);
                    session.refresh_output_buffers()?;
                }
                OutputStatus::FormatChanged => {
                    log::info!("{} output format changed", media);
                }
                OutputStatus::Ready(buffer) => {
                    let index = buffer.index;
                    let eos = buffer.flags.is_end_of_stream();
                    let written = self.handle_output(slot, &mut **muxer, buffer);
                    if let Some(session) = slot.session.as_mut() {
                        if let Err(e) = session.release_output(index) {
                            log::warn!("{} release output {} failed: {:#}", media, index, e);
                        }
                    }
                    written?;

                    if eos {
                        if slot.state != SessionState::Draining {
                            log::warn!(
                                "{} encoder reported end of stream while {:?}",
                                media,
                                slot.state
                            );
                        }
                        self.teardown(state, media);
                        return Ok(SubmitOutcome::EndOfStream);
                    }
                }
            }
        }
    }

    fn handle_output(
        &self,
        slot: &mut SessionSlot,
        muxer: &mut dyn Muxer,
        buffer: OutputBuffer,
    ) -> PipelineResult<()> {
        let media = slot.media;
        let data = buffer
            .data
            .ok_or(PipelineError::MissingOutputBuffer {
                media,
                index: buffer.index,
            })?;

        if buffer.flags.is_config() {
            if data.is_empty() {
                log::warn!("{} encoder sent an empty config buffer, ignored", media);
                return Ok(());
            }
            if slot.config_blob.is_none() {
                log::info!("{} codec config captured, {} bytes", media, data.len());
            } else {
                log::debug!("{} codec config replaced, {} bytes", media, data.len());
            }
            slot.config_blob = Some(data.clone());
            if self.settings.forward_config_packets {
                let packet = packetize_ordinary(data, buffer.pts_us, media, PacketFlags::CONFIG);
                muxer.write_packet(&packet)?;
            }
            return Ok(());
        }
        if data.is_empty() {
            return Ok(());
        }

        let flags = buffer.flags.without(PacketFlags::END_OF_STREAM);
        let packets: Vec<MediaPacket> = match media {
            MediaType::Audio => match packetize_audio(&data, buffer.pts_us, flags, self.adts) {
                Ok(packet) => vec![packet],
                Err(e @ PipelineError::AudioFrameTooLarge { .. }) => {
                    log::error!("{}, frame dropped", e);
                    return Ok(());
                }
                Err(e) => return Err(e),
            },
            MediaType::Video if flags.is_key() => {
                let offset = slot.config_offset(self.settings.config_offset);
                match packetize_video_keyframe(
                    slot.config_blob.as_ref(),
                    data,
                    buffer.pts_us,
                    offset,
                ) {
                    Ok(packets) => Vec::from(packets),
                    Err(e @ PipelineError::ConfigNotCaptured(_)) => {
                        log::error!("{}, key frame dropped", e);
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
            }
            MediaType::Video => vec![packetize_ordinary(data, buffer.pts_us, media, flags)],
        };
        if media == MediaType::Video {
            slot.observe_output_pts(buffer.pts_us);
        }

        for packet in &packets {
            log::trace!("{}", packet);
            muxer.write_packet(packet)?;
        }
        slot.packets_out += packets.len() as u64;
        Ok(())
    }

    /// Stop and drop the session; finalize the muxer when it was the last one.
    fn teardown(&self, state: &mut PipelineState, media: MediaType) {
        let slot = state.slot_mut(media);
        slot.shutdown();
        log::info!(
            "{} session stopped after {} packets",
            media,
            slot.packets_out
        );

        if state.video.state == SessionState::Stopped
            && state.audio.state == SessionState::Stopped
            && !state.muxer_finalized
        {
            state.muxer_finalized = true;
            match state.muxer.finish() {
                Ok(()) => log::info!("muxer finalized"),
                Err(e) => log::error!("muxer finish failed: {:#}", e),
            }
            self.finalized.send_replace(true);
        }
    }

    fn fail(
        &self,
        state: &mut PipelineState,
        media: MediaType,
        stage: &str,
        err: PipelineError,
    ) -> SubmitOutcome {
        if err.is_session_fatal() {
            log::error!("{} {} failed: {}, tearing down session", media, stage, err);
            self.teardown(state, media);
        } else {
            log::error!("{} {} failed: {:#}", media, stage, err);
        }
        SubmitOutcome::Failed
    }

    /// Raise the full-stop flag observed by the capture loops.
    pub fn stop(&self) {
        let mut state = self.lock();
        if !state.full_stop {
            state.full_stop = true;
            log::info!("encoder pipeline stopping");
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.lock().full_stop
    }

    pub fn is_finalized(&self) -> bool {
        *self.finalized.borrow()
    }

    pub fn subscribe_finalized(&self) -> watch::Receiver<bool> {
        self.finalized.subscribe()
    }

    /// Wait until the muxer was finalized. Returns false on timeout.
    pub async fn wait_finalized(&self, timeout: Duration) -> bool {
        let mut rx = self.subscribe_finalized();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|done| *done)).await,
            Ok(Ok(_))
        )
    }

    pub fn session_state(&self, media: MediaType) -> SessionState {
        self.lock().slot(media).state
    }

    pub fn first_frame_ready(&self) -> bool {
        self.lock().first_frame_ready
    }
}

pub enum VideoCmd {
    Data(PendingFrame),
    Eof,
}

/// Serializes sequenced frames into the pipeline on a blocking worker.
pub struct VideoEncodeTask {
    tx: SyncSender<VideoCmd>,
    dropped: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl VideoEncodeTask {
    /// Bounded queue: when the encoder is slower than the camera, drop instead of growing.
    const FRAME_QUEUE_BOUND: usize = 128;
    /// Log "queue full" at most every N drops.
    const DROP_LOG_INTERVAL: u64 = 120;

    pub fn start(pipeline: Arc<EncoderPipeline>) -> Self {
        let (tx, rx) = std::sync::mpsc::sync_channel::<VideoCmd>(Self::FRAME_QUEUE_BOUND);
        let worker = tokio::task::spawn_blocking(move || Self::encode_loop(pipeline, rx));
        Self {
            tx,
            dropped: AtomicU64::new(0),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue a frame without blocking. Returns false when it was dropped.
    pub fn send(&self, frame: PendingFrame) -> bool {
        match self.tx.try_send(VideoCmd::Data(frame)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % Self::DROP_LOG_INTERVAL == 1 {
                    log::debug!(
                        "video frame queue full, dropped {} frames (back-pressure)",
                        dropped
                    );
                }
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Submit video end of stream after the queued frames and wait for the worker.
    pub async fn finish(&self) {
        let tx = self.tx.clone();
        let sent = tokio::task::spawn_blocking(move || tx.send(VideoCmd::Eof).is_ok())
            .await
            .unwrap_or(false);
        if !sent {
            log::warn!("video encode task already gone, end of stream not queued");
        }
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                log::error!("video encode task panicked: {}", e);
            }
        }
    }

    /// Runs until end of stream is submitted or every sender is gone.
    fn encode_loop(pipeline: Arc<EncoderPipeline>, rx: Receiver<VideoCmd>) {
        let mut frames: u64 = 0;
        while let Ok(cmd) = rx.recv() {
            match cmd {
                VideoCmd::Data(frame) => {
                    frames += 1;
                    let outcome =
                        pipeline.submit_at(MediaType::Video, &frame.data, frame.captured_at, false);
                    if outcome == SubmitOutcome::Rejected {
                        log::debug!("video frame {} rejected", frame.seq);
                    }
                }
                VideoCmd::Eof => {
                    pipeline.submit_at(MediaType::Video, &[], Instant::now(), true);
                    break;
                }
            }
        }
        log::info!("video encode task finished, {} frames submitted", frames);
    }
}

#[cfg(test)]
#[path = "encoder_test.rs"]
mod encoder_test;
