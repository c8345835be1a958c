/// Registers FFmpeg components. Call once at startup before opening encoders
/// or the HLS muxer.
#[cfg(feature = "ffmpeg")]
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))
}

/// Nothing to register without the FFmpeg backend.
#[cfg(not(feature = "ffmpeg"))]
pub fn init() -> anyhow::Result<()> {
    Ok(())
}

pub mod codec;
pub mod controller;
pub mod encoder;
pub mod error;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod frame;
pub mod muxer;
pub mod packet;
pub mod packetizer;
pub mod sampler;
pub mod sequencer;

#[cfg(test)]
mod test_support;

pub use controller::{OutputTarget, PipelineController, RecorderBackend};
pub use encoder::{EncoderPipeline, Settings, SubmitOutcome};
pub use error::{PipelineError, PipelineResult};
pub use packet::{MediaPacket, MediaType, PacketFlags};
