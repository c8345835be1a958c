use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::encoder::{EncoderPipeline, SubmitOutcome};
use crate::packet::MediaType;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleRead {
    /// Number of bytes written into the buffer.
    Samples(usize),
    /// Nothing captured yet.
    TryAgain,
}

/// Microphone boundary: s16 little-endian PCM.
pub trait AudioSampler: Send {
    fn start(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> anyhow::Result<SampleRead>;

    fn stop(&mut self) {}
}

const FIRST_FRAME_WAIT: Duration = Duration::from_millis(10);
const TRY_AGAIN_WAIT: Duration = Duration::from_millis(1);

/// Run the capture loop on the blocking pool until the pipeline's full-stop
/// flag is raised, then submit the last buffer with end of stream.
pub fn spawn_audio_loop(
    pipeline: Arc<EncoderPipeline>,
    sampler: Box<dyn AudioSampler>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || audio_loop(pipeline, sampler))
}

fn audio_loop(pipeline: Arc<EncoderPipeline>, mut sampler: Box<dyn AudioSampler>) {
    let mut buf = vec![0u8; pipeline.settings().audio.buffer_bytes()];
    if let Err(e) = sampler.start() {
        log::error!("audio sampler start failed: {:#}", e);
    }
    log::info!("audio capture loop started, {} byte buffers", buf.len());

    let mut submitted: u64 = 0;
    while !pipeline.is_stopping() {
        if !pipeline.first_frame_ready() {
            std::thread::sleep(FIRST_FRAME_WAIT);
            continue;
        }
        match sampler.read(&mut buf) {
            Ok(SampleRead::Samples(0)) | Ok(SampleRead::TryAgain) => {
                log::trace!("audio sampler has no data");
                std::thread::sleep(TRY_AGAIN_WAIT);
            }
            Ok(SampleRead::Samples(n)) => {
                let n = n.min(buf.len());
                if pipeline.submit(MediaType::Audio, &buf[..n], false) == SubmitOutcome::Rejected {
                    log::warn!("audio session no longer accepts input, leaving capture loop");
                    break;
                }
                submitted += 1;
            }
            Err(e) => {
                log::warn!("audio read failed: {:#}", e);
                std::thread::sleep(TRY_AGAIN_WAIT);
            }
        }
    }

    sampler.stop();
    let last = match sampler.read(&mut buf) {
        Ok(SampleRead::Samples(n)) => n.min(buf.len()),
        Ok(SampleRead::TryAgain) => 0,
        Err(e) => {
            log::debug!("final audio read failed: {:#}", e);
            0
        }
    };
    let outcome = pipeline.submit(MediaType::Audio, &buf[..last], true);
    log::info!(
        "audio capture loop finished, {} buffers submitted, end of stream: {:?}",
        submitted,
        outcome
    );
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::encoder::{SessionState, Settings};
    use crate::test_support::{MockSampler, MockSession, RecordingMuxer};

    #[tokio::test]
    async fn test_audio_loop_submits_until_stop() -> anyhow::Result<()> {
        let muxer = RecordingMuxer::default();
        let mux = muxer.log.clone();
        let settings = Settings {
            video: None,
            ..Default::default()
        };
        let pipeline = Arc::new(EncoderPipeline::start(
            settings,
            None,
            Box::new(MockSession::audio()),
            Box::new(muxer),
        )?);
        let sampler = MockSampler::new(Duration::from_millis(2));
        let stopped = sampler.stopped.clone();

        let handle = spawn_audio_loop(pipeline.clone(), Box::new(sampler));
        tokio::time::sleep(Duration::from_millis(50)).await;
        pipeline.stop();
        handle.await?;

        assert!(*stopped.lock().unwrap());
        assert_eq!(pipeline.session_state(MediaType::Audio), SessionState::Stopped);
        assert!(pipeline.is_finalized());
        let packets = mux.lock().unwrap().of(MediaType::Audio);
        assert!(packets.len() >= 2);
        // 1024 mono samples per read.
        assert!(packets.iter().all(|p| p.size() == 2048 + 7));
        Ok(())
    }

    #[tokio::test]
    async fn test_audio_waits_for_first_video_frame() -> anyhow::Result<()> {
        let pipeline = Arc::new(EncoderPipeline::start(
            Settings::default(),
            Some(Box::new(MockSession::new(MediaType::Video))),
            Box::new(MockSession::audio()),
            Box::new(RecordingMuxer::default()),
        )?);
        let sampler = MockSampler::new(Duration::from_millis(1));
        let reads: Arc<Mutex<u32>> = sampler.reads.clone();

        let handle = spawn_audio_loop(pipeline.clone(), Box::new(sampler));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(*reads.lock().unwrap(), 0);

        pipeline.submit(MediaType::Video, &[0x65], false);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(*reads.lock().unwrap() > 0);

        pipeline.stop();
        handle.await?;
        assert_eq!(pipeline.session_state(MediaType::Audio), SessionState::Stopped);
        assert!(!pipeline.is_finalized());
        Ok(())
    }
}
