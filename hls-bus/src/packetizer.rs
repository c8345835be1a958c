use bytes::{Bytes, BytesMut};

use crate::error::{PipelineError, PipelineResult};
use crate::packet::{MediaPacket, MediaType, PacketFlags};

/// ADTS header length (no CRC).
pub const ADTS_HEADER_LEN: usize = 7;

/// Largest frame length the header can carry: 13 length bits plus the
/// overflow bits below the channel configuration in byte 3.
pub const ADTS_MAX_FRAME_LEN: usize = (0x3F << 11) | 0x7FF;

/// MPEG-4 sampling frequency table, indexed by the ADTS sampling_frequency_index.
const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// Fields of the fixed ADTS header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdtsConfig {
    /// MPEG-4 audio object type (2 = AAC-LC).
    pub profile: u8,
    pub sample_rate_index: u8,
    pub channel_config: u8,
}

impl Default for AdtsConfig {
    /// AAC-LC, 44.1kHz, mono.
    fn default() -> Self {
        Self {
            profile: 2,
            sample_rate_index: 4,
            channel_config: 1,
        }
    }
}

impl AdtsConfig {
    /// Derive the header fields for an AAC-LC stream. Unknown rates fall back to 44.1kHz.
    pub fn for_stream(sample_rate: u32, channels: u8) -> Self {
        let sample_rate_index = SAMPLE_RATES
            .iter()
            .position(|rate| *rate == sample_rate)
            .unwrap_or_else(|| {
                log::warn!("no ADTS index for sample rate {}, using 44100", sample_rate);
                4
            }) as u8;
        Self {
            profile: 2,
            sample_rate_index,
            channel_config: channels.min(7),
        }
    }
}

/// Build the 7-byte ADTS header for a frame of `frame_len` bytes (header included).
///
/// `frame_len >> 11` is written unmasked into byte 3, so lengths past 8191
/// spill into the bits above the 13-bit field instead of wrapping.
///
/// See http://wiki.multimedia.cx/index.php?title=ADTS
pub fn adts_header(config: AdtsConfig, frame_len: usize) -> PipelineResult<[u8; ADTS_HEADER_LEN]> {
    if frame_len > ADTS_MAX_FRAME_LEN {
        return Err(PipelineError::AudioFrameTooLarge { len: frame_len });
    }
    let profile = config.profile.saturating_sub(1) & 0x3;
    let freq = config.sample_rate_index & 0xF;
    let chan = config.channel_config & 0x7;
    let len = frame_len as u32;

    Ok([
        // syncword
        0xFF,
        // syncword, MPEG-2, layer 0, protection absent
        0xF9,
        (profile << 6) | (freq << 2) | (chan >> 2),
        ((chan & 0x3) << 6) | (len >> 11) as u8,
        ((len & 0x7FF) >> 3) as u8,
        // low length bits, buffer fullness 0x7FF (high bits)
        (((len & 0x7) as u8) << 5) | 0x1F,
        // buffer fullness (low bits), one raw data block
        0xFC,
    ])
}

/// Read the frame length back out of an ADTS header, overflow bits included.
pub fn adts_frame_length(header: &[u8]) -> Option<usize> {
    if header.len() < ADTS_HEADER_LEN || header[0] != 0xFF || header[1] & 0xF0 != 0xF0 {
        return None;
    }
    let len = ((header[3] as usize & 0x3F) << 11)
        | ((header[4] as usize) << 3)
        | ((header[5] as usize) >> 5);
    Some(len)
}

/// Prefix one raw AAC frame with a fresh ADTS header.
pub fn packetize_audio(
    payload: &[u8],
    pts_us: i64,
    flags: PacketFlags,
    config: AdtsConfig,
) -> PipelineResult<MediaPacket> {
    let frame_len = payload.len() + ADTS_HEADER_LEN;
    let header = adts_header(config, frame_len)?;
    let mut out = BytesMut::with_capacity(frame_len);
    out.extend_from_slice(&header);
    out.extend_from_slice(payload);
    Ok(MediaPacket::new(MediaType::Audio, out.freeze(), flags, pts_us))
}

/// Emit the captured config blob as its own packet just before the key frame,
/// then the key frame itself.
pub fn packetize_video_keyframe(
    config_blob: Option<&Bytes>,
    payload: Bytes,
    pts_us: i64,
    config_offset_us: i64,
) -> PipelineResult<[MediaPacket; 2]> {
    let config = config_blob.ok_or(PipelineError::ConfigNotCaptured(MediaType::Video))?;
    Ok([
        MediaPacket::new(
            MediaType::Video,
            config.clone(),
            PacketFlags::CONFIG | PacketFlags::KEY_FRAME,
            pts_us - config_offset_us,
        ),
        MediaPacket::new(MediaType::Video, payload, PacketFlags::KEY_FRAME, pts_us),
    ])
}

/// Passthrough wrap, no header.
pub fn packetize_ordinary(
    payload: Bytes,
    pts_us: i64,
    media_type: MediaType,
    flags: PacketFlags,
) -> MediaPacket {
    MediaPacket::new(media_type, payload, flags, pts_us)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adts_header_fixed_fields() {
        let header = adts_header(AdtsConfig::default(), 2055).unwrap();
        assert_eq!(header[0], 0xFF);
        assert_eq!(header[1], 0xF9);
        // profile LC (1), index 4, channel high bit 0
        assert_eq!(header[2], 0x50);
        // channel low bits 01
        assert_eq!(header[3] & 0xC0, 0x40);
        assert_eq!(header[6], 0xFC);
        assert_eq!(adts_frame_length(&header), Some(2055));
    }

    #[test]
    fn test_packetize_audio_length_field() {
        let config = AdtsConfig::default();
        for size in 0..=8192 {
            let payload = vec![0xAB; size];
            let packet = packetize_audio(&payload, 0, PacketFlags::NONE, config).unwrap();
            assert_eq!(packet.size(), size + ADTS_HEADER_LEN);
            assert_eq!(&packet.data[..2], &[0xFF, 0xF9]);
            assert_eq!(adts_frame_length(&packet.data), Some(size + ADTS_HEADER_LEN));
            assert_eq!(&packet.data[ADTS_HEADER_LEN..], &payload[..]);
        }
    }

    #[test]
    fn test_adts_length_overflow_bits() {
        // 8199 >> 11 == 4 lands above the two regular high bits
        let header = adts_header(AdtsConfig::default(), 8199).unwrap();
        assert_eq!(header[3], 0x40 | 0x04);
        assert_eq!(adts_frame_length(&header), Some(8199));

        let max = adts_header(AdtsConfig::default(), ADTS_MAX_FRAME_LEN).unwrap();
        assert_eq!(max[3] & 0xC0, 0x40);
        assert_eq!(adts_frame_length(&max), Some(ADTS_MAX_FRAME_LEN));
    }

    #[test]
    fn test_packetize_audio_too_large() {
        let payload = vec![0u8; ADTS_MAX_FRAME_LEN];
        let err = packetize_audio(&payload, 0, PacketFlags::NONE, AdtsConfig::default());
        assert!(matches!(
            err,
            Err(PipelineError::AudioFrameTooLarge { len }) if len == ADTS_MAX_FRAME_LEN + ADTS_HEADER_LEN
        ));
    }

    #[test]
    fn test_adts_config_for_stream() {
        let config = AdtsConfig::for_stream(48000, 2);
        assert_eq!(config.sample_rate_index, 3);
        assert_eq!(config.channel_config, 2);
        assert_eq!(AdtsConfig::for_stream(44100, 1), AdtsConfig::default());
        assert_eq!(AdtsConfig::for_stream(12345, 1).sample_rate_index, 4);
    }

    #[test]
    fn test_keyframe_config_prefix() {
        let config = Bytes::from_static(&[0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68]);
        for (pts, frame) in [(40_000i64, &[0x65u8, 1][..]), (1_040_000, &[0x65, 2][..])] {
            let packets = packetize_video_keyframe(
                Some(&config),
                Bytes::copy_from_slice(frame),
                pts,
                1159,
            )
            .unwrap();
            assert_eq!(packets.len(), 2);
            assert_eq!(packets[0].data, config);
            assert!(packets[0].is_config());
            assert_eq!(packets[0].pts_us, pts - 1159);
            assert_eq!(packets[1].pts_us, pts);
            assert!(packets[1].is_key());
            assert!(!packets[1].is_config());
            assert_eq!(&packets[1].data[..], frame);
        }
    }

    #[test]
    fn test_keyframe_without_config() {
        let err = packetize_video_keyframe(None, Bytes::from_static(&[0x65]), 0, 1159);
        assert!(matches!(
            err,
            Err(PipelineError::ConfigNotCaptured(MediaType::Video))
        ));
    }

    #[test]
    fn test_packetize_ordinary() {
        let packet = packetize_ordinary(
            Bytes::from_static(&[1, 2, 3]),
            99,
            MediaType::Video,
            PacketFlags::NONE,
        );
        assert_eq!(packet.size(), 3);
        assert_eq!(packet.pts_us, 99);
        assert_eq!(packet.media_type, MediaType::Video);
    }
}
