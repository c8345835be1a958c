use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use crate::packet::{MediaPacket, MediaType};

/// Container writer boundary. Opened once at pipeline start, finished exactly once
/// after both sessions reached end of stream.
pub trait Muxer: Send {
    fn open(&mut self) -> anyhow::Result<()>;

    fn write_packet(&mut self, packet: &MediaPacket) -> anyhow::Result<()>;

    fn finish(&mut self) -> anyhow::Result<()>;
}

/// Writes the packetized streams as raw elementary streams: `video.h264` (AnnexB
/// with config before every key frame) and `audio.aac` (ADTS). Both are playable
/// on their own because the packetizer makes every key frame and audio frame
/// self-contained.
pub struct ElementaryStreamMuxer {
    dir: PathBuf,
    video: Option<BufWriter<File>>,
    audio: Option<BufWriter<File>>,
    have_opened: bool,
    have_finished: bool,
    packets_written: u64,
}

impl ElementaryStreamMuxer {
    pub const VIDEO_FILE: &'static str = "video.h264";
    pub const AUDIO_FILE: &'static str = "audio.aac";

    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            video: None,
            audio: None,
            have_opened: false,
            have_finished: false,
            packets_written: 0,
        }
    }

    pub fn packets_written(&self) -> u64 {
        self.packets_written
    }

    fn create(&self, name: &str) -> anyhow::Result<BufWriter<File>> {
        let path = self.dir.join(name);
        let file = File::create(&path)
            .map_err(|e| anyhow::anyhow!("create {}: {}", path.display(), e))?;
        Ok(BufWriter::new(file))
    }
}

impl Muxer for ElementaryStreamMuxer {
    fn open(&mut self) -> anyhow::Result<()> {
        if self.have_opened {
            anyhow::bail!("elementary stream muxer already opened");
        }
        std::fs::create_dir_all(&self.dir)?;
        self.video = Some(self.create(Self::VIDEO_FILE)?);
        self.audio = Some(self.create(Self::AUDIO_FILE)?);
        self.have_opened = true;
        log::info!("elementary stream muxer opened in {}", self.dir.display());
        Ok(())
    }

    fn write_packet(&mut self, packet: &MediaPacket) -> anyhow::Result<()> {
        if self.have_finished {
            anyhow::bail!("write after finish");
        }
        // Audio config is carried by every ADTS header already.
        if packet.media_type == MediaType::Audio && packet.is_config() {
            return Ok(());
        }
        let writer = match packet.media_type {
            MediaType::Video => self.video.as_mut(),
            MediaType::Audio => self.audio.as_mut(),
        }
        .ok_or(anyhow::anyhow!("muxer not opened"))?;
        writer.write_all(&packet.data)?;
        self.packets_written += 1;
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        if self.have_opened && !self.have_finished {
            self.have_finished = true;
            for writer in [self.video.as_mut(), self.audio.as_mut()].into_iter().flatten() {
                writer.flush()?;
            }
            log::info!(
                "elementary stream muxer finished, {} packets",
                self.packets_written
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::packet::PacketFlags;

    #[test]
    fn test_elementary_stream_files() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut muxer = ElementaryStreamMuxer::new(dir.path());
        muxer.open()?;
        muxer.write_packet(&MediaPacket::new(
            MediaType::Video,
            Bytes::from_static(&[0, 0, 0, 1, 0x67]),
            PacketFlags::CONFIG,
            0,
        ))?;
        muxer.write_packet(&MediaPacket::new(
            MediaType::Video,
            Bytes::from_static(&[0, 0, 0, 1, 0x65]),
            PacketFlags::KEY_FRAME,
            10,
        ))?;
        muxer.write_packet(&MediaPacket::new(
            MediaType::Audio,
            Bytes::from_static(&[0x12, 0x08]),
            PacketFlags::CONFIG,
            0,
        ))?;
        muxer.write_packet(&MediaPacket::new(
            MediaType::Audio,
            Bytes::from_static(&[0xFF, 0xF9, 1]),
            PacketFlags::NONE,
            5,
        ))?;
        muxer.finish()?;
        muxer.finish()?;

        let video = std::fs::read(dir.path().join(ElementaryStreamMuxer::VIDEO_FILE))?;
        let audio = std::fs::read(dir.path().join(ElementaryStreamMuxer::AUDIO_FILE))?;
        assert_eq!(video, vec![0, 0, 0, 1, 0x67, 0, 0, 0, 1, 0x65]);
        assert_eq!(audio, vec![0xFF, 0xF9, 1]);
        assert_eq!(muxer.packets_written(), 3);
        assert!(muxer.write_packet(&MediaPacket::new(
            MediaType::Audio,
            Bytes::new(),
            PacketFlags::NONE,
            6,
        ))
        .is_err());
        Ok(())
    }
}
