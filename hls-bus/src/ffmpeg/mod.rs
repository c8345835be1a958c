//! FFmpeg-backed encoder sessions and HLS muxer.

use bytes::Bytes;

use crate::codec::{OutputBuffer, OutputStatus};
use crate::packet::PacketFlags;

pub mod audio;
pub mod hls;
pub mod hw;
pub mod video;

pub use audio::AudioEncoder;
pub use hls::{HlsMuxer, HlsSettings};
pub use video::VideoEncoder;

pub const MICROS_TIME_BASE: ffmpeg_next::Rational = ffmpeg_next::Rational(1, 1_000_000);

/// Reads extradata from an opened codec context via the raw AVCodecContext pointer.
/// Returns None if extradata is null or empty.
fn extradata(context: &ffmpeg_next::codec::Context) -> Option<Bytes> {
    unsafe {
        let ctx = context.as_ptr();
        let ptr = (*ctx).extradata;
        let size = (*ctx).extradata_size;
        if ptr.is_null() || size <= 0 {
            return None;
        }
        Some(Bytes::copy_from_slice(std::slice::from_raw_parts(
            ptr,
            size as usize,
        )))
    }
}

/// Ask for SPS/PPS (or AudioSpecificConfig) as extradata instead of in-band.
fn set_global_header(context: &mut ffmpeg_next::codec::Context) {
    unsafe {
        (*context.as_mut_ptr()).flags |= ffmpeg_next::ffi::AV_CODEC_FLAG_GLOBAL_HEADER as i32;
    }
}

/// One `receive_packet` turned into a poll result. `to_micros` maps the packet
/// pts from the encoder time base to microseconds.
fn receive_output(
    encoder: &mut ffmpeg_next::codec::encoder::Encoder,
    index: usize,
    last_pts_us: &mut i64,
    finished: &mut bool,
    to_micros: impl Fn(i64) -> i64,
) -> anyhow::Result<OutputStatus> {
    let mut packet = ffmpeg_next::codec::packet::Packet::empty();
    match encoder.receive_packet(&mut packet) {
        Ok(()) => {
            let pts_us = packet.pts().map(&to_micros).unwrap_or(*last_pts_us);
            *last_pts_us = pts_us;
            let flags = if packet.is_key() {
                PacketFlags::KEY_FRAME
            } else {
                PacketFlags::NONE
            };
            Ok(OutputStatus::Ready(OutputBuffer {
                index,
                data: packet.data().map(Bytes::copy_from_slice),
                pts_us,
                flags,
            }))
        }
        Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
            Ok(OutputStatus::TryAgain)
        }
        Err(ffmpeg_next::Error::Eof) => {
            *finished = true;
            Ok(OutputStatus::Ready(OutputBuffer::end_of_stream(
                index,
                *last_pts_us,
            )))
        }
        Err(err) => Err(err.into()),
    }
}
