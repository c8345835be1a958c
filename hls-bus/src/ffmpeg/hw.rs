//! Hardware-accelerated encoder discovery.
//!
//! Finds a hardware H.264/HEVC encoder (NVENC/VAAPI/QSV/V4L2M2M/VideoToolbox/MediaCodec)
//! for a software codec name, with the caller falling back to the software codec.

/// Hardware encoder names to try, in order, for a software codec name.
pub fn hw_encoder_names(codec_name: &str) -> &'static [&'static str] {
    match codec_name {
        "libx264" | "h264" => &[
            "h264_nvenc",
            "h264_vaapi",
            "h264_qsv",
            "h264_v4l2m2m",
            "h264_videotoolbox",
            "h264_mediacodec",
        ],
        "libx265" | "hevc" | "h265" => &[
            "hevc_nvenc",
            "hevc_vaapi",
            "hevc_qsv",
            "hevc_v4l2m2m",
            "hevc_videotoolbox",
            "hevc_mediacodec",
        ],
        _ => &[],
    }
}

/// Try to find a hardware-accelerated encoder for the given software codec name.
/// Returns the first available hardware encoder, or None if none is found.
pub fn find_hw_encoder(codec_name: &str) -> Option<ffmpeg_next::Codec> {
    for name in hw_encoder_names(codec_name) {
        if let Some(codec) = ffmpeg_next::encoder::find_by_name(name) {
            log::info!("found hardware encoder: {}", name);
            return Some(codec);
        }
    }
    None
}

pub fn is_hw_encoder(codec_name: &str) -> bool {
    ["nvenc", "vaapi", "qsv", "v4l2m2m", "videotoolbox", "mediacodec"]
        .iter()
        .any(|hw| codec_name.contains(hw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hw_encoder_names() {
        assert_eq!(hw_encoder_names("libx264")[0], "h264_nvenc");
        assert!(hw_encoder_names("h264").contains(&"h264_mediacodec"));
        assert!(hw_encoder_names("aac").is_empty());
        assert!(is_hw_encoder("h264_videotoolbox"));
        assert!(!is_hw_encoder("libx264"));
    }
}
