use std::fmt::{Display, Formatter};
use std::time::Instant;

use bytes::Bytes;

use crate::error::{PipelineError, PipelineResult};

/// Clockwise rotation the camera reports for a frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn degrees(&self) -> u32 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    /// Width and height swap for quarter turns.
    pub fn swaps_axes(&self) -> bool {
        matches!(self, Rotation::Deg90 | Rotation::Deg270)
    }
}

impl TryFrom<u32> for Rotation {
    type Error = PipelineError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Rotation::Deg0),
            90 => Ok(Rotation::Deg90),
            180 => Ok(Rotation::Deg180),
            270 => Ok(Rotation::Deg270),
            other => Err(PipelineError::InvalidFrame(format!(
                "unsupported rotation {}",
                other
            ))),
        }
    }
}

/// Chroma byte order of a 4:2:0 semi-planar buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PixelLayout {
    /// V before U, the usual camera preview layout.
    #[default]
    Nv21,
    Nv12,
}

/// A raw frame as it arrives from the camera, before any transform.
#[derive(Clone)]
pub struct CameraFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub rotation: Rotation,
    pub layout: PixelLayout,
}

impl CameraFrame {
    pub fn nv21(data: Vec<u8>, width: u32, height: u32, rotation: Rotation) -> Self {
        Self {
            data,
            width,
            height,
            rotation,
            layout: PixelLayout::Nv21,
        }
    }

    /// Even, non-zero dimensions and a buffer holding at least one full frame.
    pub fn validate(&self) -> PipelineResult<()> {
        validate(&self.data, self.width, self.height)
    }

    /// Frame size after rotation, which is what the encoder sees.
    pub fn output_size(&self) -> (u32, u32) {
        if self.rotation.swaps_axes() {
            (self.height, self.width)
        } else {
            (self.width, self.height)
        }
    }
}

impl Display for CameraFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CameraFrame {}x{} {:?} rotation {}",
            self.width,
            self.height,
            self.layout,
            self.rotation.degrees()
        )
    }
}

/// A transformed frame waiting for in-order delivery to the video encoder.
#[derive(Clone, Debug)]
pub struct PendingFrame {
    pub seq: u64,
    pub captured_at: Instant,
    pub width: u32,
    pub height: u32,
    /// NV12, `width * height * 3 / 2` bytes.
    pub data: Bytes,
}

pub fn nv12_size(width: u32, height: u32) -> usize {
    width as usize * height as usize * 3 / 2
}

/// Swap the interleaved chroma bytes in place (NV21 <-> NV12).
pub fn swap_uv(data: &mut [u8], width: u32, height: u32) {
    let luma = width as usize * height as usize;
    let end = nv12_size(width, height).min(data.len());
    if luma >= end {
        return;
    }
    for pair in data[luma..end].chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
}

fn rotate_plane(
    src: &[u8],
    dst: &mut [u8],
    width: usize,
    height: usize,
    elem: usize,
    rotation: Rotation,
) {
    for y in 0..height {
        for x in 0..width {
            let target = match rotation {
                Rotation::Deg0 => y * width + x,
                Rotation::Deg90 => x * height + (height - 1 - y),
                Rotation::Deg180 => (height - 1 - y) * width + (width - 1 - x),
                Rotation::Deg270 => (width - 1 - x) * height + y,
            };
            let from = (y * width + x) * elem;
            let to = target * elem;
            dst[to..to + elem].copy_from_slice(&src[from..from + elem]);
        }
    }
}

/// Rotate an NV12 (or NV21) buffer clockwise. Returns the rotated buffer and its size.
pub fn rotate_nv12(
    data: &[u8],
    width: u32,
    height: u32,
    rotation: Rotation,
) -> PipelineResult<(Vec<u8>, u32, u32)> {
    validate(data, width, height)?;
    let size = nv12_size(width, height);
    if rotation == Rotation::Deg0 {
        return Ok((data[..size].to_vec(), width, height));
    }

    let (w, h) = (width as usize, height as usize);
    let luma = w * h;
    let mut out = vec![0u8; size];
    let (out_luma, out_chroma) = out.split_at_mut(luma);
    rotate_plane(&data[..luma], out_luma, w, h, 1, rotation);
    rotate_plane(&data[luma..size], out_chroma, w / 2, h / 2, 2, rotation);

    let (out_w, out_h) = if rotation.swaps_axes() {
        (height, width)
    } else {
        (width, height)
    };
    Ok((out, out_w, out_h))
}

fn validate(data: &[u8], width: u32, height: u32) -> PipelineResult<()> {
    if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
        return Err(PipelineError::InvalidFrame(format!(
            "invalid frame size {}x{}",
            width, height
        )));
    }
    let need = nv12_size(width, height);
    if data.len() < need {
        return Err(PipelineError::InvalidFrame(format!(
            "frame buffer too small: {} < {}",
            data.len(),
            need
        )));
    }
    Ok(())
}

/// Chroma correction plus rotation; runs on a transform worker.
pub fn transform(frame: CameraFrame, seq: u64, captured_at: Instant) -> PipelineResult<PendingFrame> {
    let CameraFrame {
        mut data,
        width,
        height,
        rotation,
        layout,
    } = frame;
    validate(&data, width, height)?;
    if layout == PixelLayout::Nv21 {
        swap_uv(&mut data, width, height);
    }
    let (data, width, height) = if rotation == Rotation::Deg0 {
        data.truncate(nv12_size(width, height));
        (data, width, height)
    } else {
        rotate_nv12(&data, width, height, rotation)?
    };
    Ok(PendingFrame {
        seq,
        captured_at,
        width,
        height,
        data: Bytes::from(data),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(width: u32, height: u32) -> Vec<u8> {
        (0..nv12_size(width, height)).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_rotation_from_degrees() {
        assert_eq!(Rotation::try_from(270).unwrap(), Rotation::Deg270);
        assert!(Rotation::try_from(45).is_err());
    }

    #[test]
    fn test_rotate_90_small() {
        // 4x2 luma, one row of two chroma pairs
        let data: Vec<u8> = (0..12).collect();
        let (out, w, h) = rotate_nv12(&data, 4, 2, Rotation::Deg90).unwrap();
        assert_eq!((w, h), (2, 4));
        assert_eq!(&out[..8], &[4, 0, 5, 1, 6, 2, 7, 3]);
        assert_eq!(&out[8..], &[8, 9, 10, 11]);
    }

    #[test]
    fn test_rotate_180_small() {
        let data: Vec<u8> = (0..12).collect();
        let (out, w, h) = rotate_nv12(&data, 4, 2, Rotation::Deg180).unwrap();
        assert_eq!((w, h), (4, 2));
        assert_eq!(&out[..8], &[7, 6, 5, 4, 3, 2, 1, 0]);
        assert_eq!(&out[8..], &[10, 11, 8, 9]);
    }

    #[test]
    fn test_four_quarter_turns_identity() {
        let original = pattern(8, 4);
        let (mut data, mut w, mut h) = (original.clone(), 8, 4);
        for _ in 0..4 {
            let (out, nw, nh) = rotate_nv12(&data, w, h, Rotation::Deg90).unwrap();
            data = out;
            w = nw;
            h = nh;
        }
        assert_eq!((w, h), (8, 4));
        assert_eq!(data, original);

        let (once, _, _) = rotate_nv12(&original, 8, 4, Rotation::Deg270).unwrap();
        let (thrice, _, _) = {
            let (a, aw, ah) = rotate_nv12(&original, 8, 4, Rotation::Deg90).unwrap();
            let (b, bw, bh) = rotate_nv12(&a, aw, ah, Rotation::Deg90).unwrap();
            rotate_nv12(&b, bw, bh, Rotation::Deg90).unwrap()
        };
        assert_eq!(once, thrice);
    }

    #[test]
    fn test_transform_swaps_chroma() {
        let mut data = vec![0u8; 6];
        data[4] = 1; // V
        data[5] = 2; // U
        let frame = CameraFrame::nv21(data, 2, 2, Rotation::Deg0);
        let pending = transform(frame, 7, Instant::now()).unwrap();
        assert_eq!(pending.seq, 7);
        assert_eq!(&pending.data[4..], &[2, 1]);
    }

    #[test]
    fn test_transform_rejects_bad_input() {
        let frame = CameraFrame::nv21(vec![0; 5], 2, 2, Rotation::Deg0);
        assert!(matches!(
            transform(frame, 0, Instant::now()),
            Err(PipelineError::InvalidFrame(_))
        ));
        let frame = CameraFrame::nv21(vec![0; 100], 3, 2, Rotation::Deg90);
        assert!(transform(frame, 0, Instant::now()).is_err());
    }

    #[test]
    fn test_output_size() {
        let frame = CameraFrame::nv21(Vec::new(), 640, 480, Rotation::Deg90);
        assert_eq!(frame.output_size(), (480, 640));
    }
}
