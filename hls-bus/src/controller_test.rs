use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::*;
use crate::frame::Rotation;
use crate::packet::MediaType;
use crate::test_support::{MockSampler, MockSession, MuxLog, RecordingMuxer};

#[derive(Default)]
struct MockBackend {
    muxers: Arc<Mutex<Vec<(PathBuf, Arc<Mutex<MuxLog>>)>>>,
    video_sizes: Arc<Mutex<Vec<(u32, u32)>>>,
}

impl RecorderBackend for MockBackend {
    fn video_encoder(&self, settings: &VideoSettings) -> anyhow::Result<Box<dyn EncoderSession>> {
        self.video_sizes
            .lock()
            .unwrap()
            .push((settings.width, settings.height));
        Ok(Box::new(MockSession::new(MediaType::Video)))
    }

    fn audio_encoder(&self, _settings: &AudioSettings) -> anyhow::Result<Box<dyn EncoderSession>> {
        Ok(Box::new(MockSession::audio()))
    }

    fn audio_sampler(&self, _settings: &AudioSettings) -> anyhow::Result<Box<dyn AudioSampler>> {
        Ok(Box::new(MockSampler::new(Duration::from_millis(5))))
    }

    fn muxer(&self, target: &OutputTarget, _settings: &Settings) -> anyhow::Result<Box<dyn Muxer>> {
        let muxer = RecordingMuxer::default();
        self.muxers
            .lock()
            .unwrap()
            .push((target.manifest.clone(), muxer.log.clone()));
        Ok(Box::new(muxer))
    }
}

fn controller() -> PipelineController<MockBackend> {
    PipelineController::new(
        MockBackend::default(),
        Settings {
            eos_drain_timeout: Duration::from_millis(500),
            ..Default::default()
        },
        SequencerSettings {
            tick_period: Duration::from_millis(5),
            backlog_bound: 3,
        },
    )
}

fn frame(width: u32, height: u32, rotation: Rotation) -> CameraFrame {
    CameraFrame::nv21(
        vec![0x80; (width * height * 3 / 2) as usize],
        width,
        height,
        rotation,
    )
}

#[tokio::test]
async fn test_record_and_stop() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut controller = controller();
    let target = controller.start(dir.path(), 8, 4).await?;
    assert!(controller.is_recording());
    assert_eq!(controller.geometry(), Some((8, 4)));
    assert_eq!(target.dir, dir.path());
    assert_eq!(target.manifest.extension().and_then(|e| e.to_str()), Some("m3u8"));
    assert!(!target.stem().is_empty());
    assert!(controller.start(dir.path(), 8, 4).await.is_err());

    for i in 0..5 {
        assert_eq!(controller.push_frame(frame(8, 4, Rotation::Deg0)).await?, Some(i));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stopped = controller.stop().await?;
    assert_eq!(stopped.map(|t| t.recording_id), Some(target.recording_id));
    assert!(!controller.is_recording());
    assert!(controller.stop().await?.is_none());

    let muxers = controller.backend().muxers.lock().unwrap().clone();
    assert_eq!(muxers.len(), 1);
    let log = muxers[0].1.lock().unwrap();
    assert_eq!(log.opened, 1);
    assert_eq!(log.finished, 1);
    assert!(!log.of(MediaType::Video).is_empty());
    assert!(!log.of(MediaType::Audio).is_empty());
    assert!(log.of(MediaType::Video)[0].is_config());
    Ok(())
}

#[tokio::test]
async fn test_geometry_change_restarts_recording() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut controller = controller();
    controller.start(dir.path(), 8, 4).await?;
    controller.push_frame(frame(8, 4, Rotation::Deg0)).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Same sensor size, rotated: the encoder now sees 4x8.
    let seq = controller.push_frame(frame(8, 4, Rotation::Deg90)).await?;
    assert_eq!(seq, Some(0));
    assert_eq!(controller.geometry(), Some((4, 8)));
    tokio::time::sleep(Duration::from_millis(50)).await;
    controller.stop().await?;

    assert_eq!(
        controller.backend().video_sizes.lock().unwrap().clone(),
        vec![(8, 4), (4, 8)]
    );
    let muxers = controller.backend().muxers.lock().unwrap().clone();
    assert_eq!(muxers.len(), 2);
    for (_, log) in &muxers {
        let log = log.lock().unwrap();
        assert_eq!(log.finished, 1);
        assert!(!log.of(MediaType::Video).is_empty());
    }
    Ok(())
}

#[tokio::test]
async fn test_invalid_frame_keeps_recording() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut controller = controller();
    controller.start(dir.path(), 8, 4).await?;
    assert_eq!(controller.push_frame(frame(8, 4, Rotation::Deg0)).await?, Some(0));

    let empty = CameraFrame::nv21(Vec::new(), 0, 0, Rotation::Deg0);
    assert_eq!(controller.push_frame(empty).await?, None);
    let short = CameraFrame::nv21(vec![0x80; 10], 4, 8, Rotation::Deg0);
    assert_eq!(controller.push_frame(short).await?, None);
    assert_eq!(controller.geometry(), Some((8, 4)));

    assert_eq!(controller.push_frame(frame(8, 4, Rotation::Deg0)).await?, Some(1));
    tokio::time::sleep(Duration::from_millis(50)).await;
    controller.stop().await?;

    assert_eq!(
        controller.backend().video_sizes.lock().unwrap().clone(),
        vec![(8, 4)]
    );
    assert_eq!(controller.backend().muxers.lock().unwrap().len(), 1);
    Ok(())
}

#[test]
fn test_output_targets_do_not_collide() {
    let dir = std::env::temp_dir();
    let a = OutputTarget::new(&dir);
    let b = OutputTarget::new(&dir);
    assert_ne!(a.manifest, b.manifest);
    assert_eq!(a.manifest.parent(), Some(dir.as_path()));
    assert!(a.stem().contains('-'));
}

#[tokio::test]
async fn test_audio_only_recording() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut controller = controller();
    controller.start(dir.path(), 0, 0).await?;
    assert_eq!(controller.push_frame(frame(8, 4, Rotation::Deg0)).await?, None);
    tokio::time::sleep(Duration::from_millis(50)).await;
    controller.stop().await?;

    assert!(controller.backend().video_sizes.lock().unwrap().is_empty());
    let muxers = controller.backend().muxers.lock().unwrap().clone();
    let log = muxers[0].1.lock().unwrap();
    assert_eq!(log.finished, 1);
    assert!(log.of(MediaType::Video).is_empty());
    assert!(!log.of(MediaType::Audio).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_frames_dropped_when_idle() -> anyhow::Result<()> {
    let mut controller = controller();
    assert_eq!(controller.push_frame(frame(8, 4, Rotation::Deg0)).await?, None);
    assert!(controller.target().is_none());
    Ok(())
}
