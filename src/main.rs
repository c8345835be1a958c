use std::time::Duration;

use hls_bus::controller::{OutputTarget, PipelineController};
use hls_bus::frame::{CameraFrame, Rotation};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod api;
mod backend;
mod config;
mod observer;
mod source;

use backend::AppBackend;
use observer::SegmentObserver;
use source::SyntheticCamera;

const OBSERVER_PERIOD: Duration = Duration::from_millis(500);

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("hls_bus", log::LevelFilter::Debug)
        .filter_module("live_hls", log::LevelFilter::Debug)
        .init();
}

fn watch_target(target: &OutputTarget, cancel: &CancellationToken) -> CancellationToken {
    let token = cancel.child_token();
    let events = SegmentObserver::new(&target.manifest).spawn(OBSERVER_PERIOD, token.clone());
    observer::log_events(events.subscribe());
    token
}

async fn next_frame(camera: &mut Option<mpsc::Receiver<CameraFrame>>) -> Option<CameraFrame> {
    match camera {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[tokio::main]
async fn main() -> ! {
    init_logging();
    hls_bus::init().unwrap_or_else(|e| {
        log::error!("codec backend init failed: {}", e);
        std::process::exit(1);
    });
    let config = config::config();

    let cancel = CancellationToken::new();
    api::start_api_server(config.listen.clone(), config.output_dir.clone(), cancel.clone());

    let rotation = Rotation::try_from(config.rotation).unwrap_or_else(|e| {
        log::warn!("{}, not rotating", e);
        Rotation::Deg0
    });
    let (width, height) = if config.audio_only() {
        (0, 0)
    } else if rotation.swaps_axes() {
        (config.height, config.width)
    } else {
        (config.width, config.height)
    };

    let mut controller = PipelineController::new(
        AppBackend::new(config),
        config.encoder_settings(),
        config.sequencer_settings(),
    );
    let target = match controller.start(&config.output_dir, width, height).await {
        Ok(target) => target,
        Err(e) => {
            log::error!("failed to start recording: {:#}", e);
            cancel.cancel();
            std::process::exit(1);
        }
    };
    let mut recording_id = target.recording_id;
    let mut observer = watch_target(&target, &cancel);

    let mut camera = (!config.audio_only()).then(|| {
        SyntheticCamera::new(config.width, config.height, rotation, config.frame_rate)
            .with_layout(config.pixel_layout())
            .spawn(cancel.child_token())
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            },
            Some(frame) = next_frame(&mut camera) => {
                if let Err(e) = controller.push_frame(frame).await {
                    log::error!("recording restart failed: {:#}", e);
                    cancel.cancel();
                    continue;
                }
                if let Some(target) = controller.target() {
                    if target.recording_id != recording_id {
                        recording_id = target.recording_id;
                        observer.cancel();
                        observer = watch_target(target, &cancel);
                    }
                }
            },
        }
    }

    match controller.stop().await {
        Ok(Some(target)) => log::info!("recording saved to {}", target.dir.display()),
        Ok(None) => {}
        Err(e) => log::error!("stopping recording failed: {:#}", e),
    }
    observer.cancel();
    tokio::time::sleep(Duration::from_millis(100)).await;
    std::process::exit(0);
}
