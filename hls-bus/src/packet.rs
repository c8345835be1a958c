use std::fmt::{Display, Formatter};
use std::ops::{BitOr, BitOrAssign};

use bytes::Bytes;

/// Media type tag carried by every session, packet and pipeline call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MediaType {
    Video = 0,
    Audio = 1,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Video => "video",
            MediaType::Audio => "audio",
        }
    }
}

impl Display for MediaType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Buffer/packet flags shared by encoder output buffers and muxer packets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PacketFlags(u32);

impl PacketFlags {
    pub const NONE: PacketFlags = PacketFlags(0);
    pub const KEY_FRAME: PacketFlags = PacketFlags(1);
    pub const CONFIG: PacketFlags = PacketFlags(1 << 1);
    pub const END_OF_STREAM: PacketFlags = PacketFlags(1 << 2);

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_key(&self) -> bool {
        self.contains(Self::KEY_FRAME)
    }

    pub fn is_config(&self) -> bool {
        self.contains(Self::CONFIG)
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.contains(Self::END_OF_STREAM)
    }

    pub fn without(self, other: PacketFlags) -> PacketFlags {
        PacketFlags(self.0 & !other.0)
    }
}

impl BitOr for PacketFlags {
    type Output = PacketFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        PacketFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for PacketFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// A ready-to-write payload for the muxer boundary.
///
/// The packet owns exactly its payload, so the boundary's offset is always zero
/// and its size is `data.len()`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaPacket {
    pub media_type: MediaType,
    pub data: Bytes,
    pub flags: PacketFlags,
    /// Microseconds since pipeline start.
    pub pts_us: i64,
}

impl MediaPacket {
    pub fn new(media_type: MediaType, data: Bytes, flags: PacketFlags, pts_us: i64) -> Self {
        Self {
            media_type,
            data,
            flags,
            pts_us,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_key(&self) -> bool {
        self.flags.is_key()
    }

    pub fn is_config(&self) -> bool {
        self.flags.is_config()
    }
}

impl Display for MediaPacket {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "MediaPacket {}: size: {}, pts_us: {}, flags: {:#x}",
            self.media_type,
            self.size(),
            self.pts_us,
            self.flags.bits()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_combine() {
        let flags = PacketFlags::KEY_FRAME | PacketFlags::CONFIG;
        assert!(flags.is_key());
        assert!(flags.is_config());
        assert!(!flags.is_end_of_stream());
        assert_eq!(flags.without(PacketFlags::CONFIG), PacketFlags::KEY_FRAME);
        assert!(PacketFlags::NONE.contains(PacketFlags::NONE));
    }

    #[test]
    fn test_media_type_tags() {
        assert_eq!(MediaType::Video as u8, 0);
        assert_eq!(MediaType::Audio as u8, 1);
        assert_eq!(MediaType::Audio.to_string(), "audio");
    }
}
