use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::codec::EncoderSession;
use crate::encoder::{AudioSettings, EncoderPipeline, Settings, VideoEncodeTask, VideoSettings};
use crate::frame::{CameraFrame, PendingFrame};
use crate::muxer::Muxer;
use crate::sampler::{AudioSampler, spawn_audio_loop};
use crate::sequencer::{FrameSequencer, SequencerSettings};

/// Creates the codec sessions, sampler and muxer for each recording.
pub trait RecorderBackend: Send + Sync {
    fn video_encoder(&self, settings: &VideoSettings) -> anyhow::Result<Box<dyn EncoderSession>>;

    fn audio_encoder(&self, settings: &AudioSettings) -> anyhow::Result<Box<dyn EncoderSession>>;

    fn audio_sampler(&self, settings: &AudioSettings) -> anyhow::Result<Box<dyn AudioSampler>>;

    fn muxer(&self, target: &OutputTarget, settings: &Settings) -> anyhow::Result<Box<dyn Muxer>>;
}

/// Where one recording is written.
#[derive(Debug, Clone)]
pub struct OutputTarget {
    pub recording_id: Uuid,
    pub dir: PathBuf,
    /// `<dir>/<unix millis>-<id prefix>.m3u8`; segments are named after it.
    pub manifest: PathBuf,
    pub started: DateTime<Utc>,
}

impl OutputTarget {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let started = Utc::now();
        let recording_id = Uuid::new_v4();
        let dir = dir.as_ref().to_path_buf();
        Self {
            recording_id,
            manifest: dir.join(format!(
                "{}-{:08x}.m3u8",
                started.timestamp_millis(),
                recording_id.as_fields().0
            )),
            dir,
            started,
        }
    }

    /// Manifest name without extension, the prefix of every segment.
    pub fn stem(&self) -> String {
        self.manifest
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

struct Recording {
    target: OutputTarget,
    geometry: (u32, u32),
    pipeline: Arc<EncoderPipeline>,
    video_task: Option<Arc<VideoEncodeTask>>,
    sequencer: Option<FrameSequencer>,
    audio: JoinHandle<()>,
}

/// Start, stop and restart recordings; routes camera frames into the current one.
pub struct PipelineController<B: RecorderBackend> {
    backend: B,
    settings: Settings,
    sequencer_settings: SequencerSettings,
    finalize_timeout: Duration,
    recording: Option<Recording>,
}

impl<B: RecorderBackend> PipelineController<B> {
    pub fn new(backend: B, settings: Settings, sequencer_settings: SequencerSettings) -> Self {
        Self {
            backend,
            finalize_timeout: settings.eos_drain_timeout * 2,
            settings,
            sequencer_settings,
            recording: None,
        }
    }

    pub fn with_finalize_timeout(mut self, timeout: Duration) -> Self {
        self.finalize_timeout = timeout;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    pub fn target(&self) -> Option<&OutputTarget> {
        self.recording.as_ref().map(|r| &r.target)
    }

    /// Frame size of the current recording; (0, 0) when audio only.
    pub fn geometry(&self) -> Option<(u32, u32)> {
        self.recording.as_ref().map(|r| r.geometry)
    }

    /// Start a recording into `output_dir`. Zero width and height record audio only.
    pub async fn start(
        &mut self,
        output_dir: impl AsRef<Path>,
        video_width: u32,
        video_height: u32,
    ) -> anyhow::Result<OutputTarget> {
        if self.recording.is_some() {
            anyhow::bail!("recording already running");
        }
        let output_dir = output_dir.as_ref();
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|e| anyhow::anyhow!("create {}: {}", output_dir.display(), e))?;
        let target = OutputTarget::new(output_dir);

        let mut settings = self.settings.clone();
        settings.video = if video_width == 0 && video_height == 0 {
            None
        } else {
            Some(VideoSettings {
                width: video_width,
                height: video_height,
                ..settings.video.clone().unwrap_or_default()
            })
        };

        let video = match &settings.video {
            Some(video) => Some(self.backend.video_encoder(video)?),
            None => None,
        };
        let audio = self.backend.audio_encoder(&settings.audio)?;
        let sampler = self.backend.audio_sampler(&settings.audio)?;
        let muxer = self.backend.muxer(&target, &settings)?;
        let has_video = video.is_some();
        let pipeline = Arc::new(EncoderPipeline::start(settings, video, audio, muxer)?);

        let (video_task, sequencer) = if has_video {
            let task = Arc::new(VideoEncodeTask::start(pipeline.clone()));
            let sink = task.clone();
            let sequencer = FrameSequencer::start(
                self.sequencer_settings.clone(),
                Arc::new(move |frame: PendingFrame| {
                    sink.send(frame);
                }),
            );
            (Some(task), Some(sequencer))
        } else {
            (None, None)
        };
        let audio = spawn_audio_loop(pipeline.clone(), sampler);

        log::info!(
            "recording {} started: {} ({}x{})",
            target.recording_id,
            target.manifest.display(),
            video_width,
            video_height
        );
        self.recording = Some(Recording {
            target: target.clone(),
            geometry: (video_width, video_height),
            pipeline,
            video_task,
            sequencer,
            audio,
        });
        Ok(target)
    }

    /// Hand a camera frame to the current recording. A frame whose rotated size
    /// differs from the recording's restarts it with the new size first.
    /// Returns the frame's sequence number, or `None` when it was not accepted.
    pub async fn push_frame(&mut self, frame: CameraFrame) -> anyhow::Result<Option<u64>> {
        if let Err(e) = frame.validate() {
            log::warn!("{}: {}, frame dropped", frame, e);
            return Ok(None);
        }
        let size = frame.output_size();
        let Some(recording) = &self.recording else {
            log::debug!("not recording, frame dropped");
            return Ok(None);
        };
        if recording.sequencer.is_none() {
            log::trace!("audio only recording, frame dropped");
            return Ok(None);
        }
        if recording.geometry != size {
            let dir = recording.target.dir.clone();
            log::info!(
                "frame size changed {:?} -> {:?}, restarting recording",
                recording.geometry,
                size
            );
            self.stop().await?;
            self.start(dir, size.0, size.1).await?;
        }

        Ok(self
            .recording
            .as_ref()
            .and_then(|r| r.sequencer.as_ref())
            .map(|sequencer| sequencer.add_frame(frame)))
    }

    /// Drain both sessions to end of stream and wait for the muxer to finalize.
    pub async fn stop(&mut self) -> anyhow::Result<Option<OutputTarget>> {
        let Some(recording) = self.recording.take() else {
            return Ok(None);
        };
        let Recording {
            target,
            pipeline,
            video_task,
            sequencer,
            audio,
            ..
        } = recording;

        if let Some(sequencer) = sequencer {
            sequencer.shutdown().await;
        }
        if let Some(task) = &video_task {
            task.finish().await;
        }
        pipeline.stop();
        if let Err(e) = audio.await {
            log::error!("audio capture loop panicked: {}", e);
        }

        if pipeline.wait_finalized(self.finalize_timeout).await {
            log::info!(
                "recording {} stopped: {}",
                target.recording_id,
                target.manifest.display()
            );
        } else {
            log::warn!(
                "recording {} not finalized within {:?}",
                target.recording_id,
                self.finalize_timeout
            );
        }
        Ok(Some(target))
    }
}

#[cfg(test)]
#[path = "controller_test.rs"]
mod controller_test;
