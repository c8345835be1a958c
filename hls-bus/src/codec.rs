//! Encoder session boundary.
//!
//! A hardware (or software) codec binding exposes separate input and output
//! queues. The pipeline only needs four capabilities from it: queue input,
//! poll output, release an output buffer, and stop.

use std::time::Duration;

use bytes::Bytes;

use crate::packet::{MediaType, PacketFlags};

/// One dequeued encoder output buffer.
#[derive(Clone, Debug)]
pub struct OutputBuffer {
    /// Backend buffer slot, handed back through `release_output`.
    pub index: usize,
    /// `None` when the backend reported a slot it has no buffer for.
    pub data: Option<Bytes>,
    pub pts_us: i64,
    pub flags: PacketFlags,
}

impl OutputBuffer {
    pub fn new(index: usize, data: Bytes, pts_us: i64, flags: PacketFlags) -> Self {
        Self {
            index,
            data: Some(data),
            pts_us,
            flags,
        }
    }

    pub fn end_of_stream(index: usize, pts_us: i64) -> Self {
        Self::new(index, Bytes::new(), pts_us, PacketFlags::END_OF_STREAM)
    }
}

/// Result of one output poll.
#[derive(Clone, Debug)]
pub enum OutputStatus {
    /// No output available within the poll timeout.
    TryAgain,
    /// The backend replaced its output buffer set.
    BuffersChanged,
    /// The backend reported a new output format.
    FormatChanged,
    Ready(OutputBuffer),
}

pub trait EncoderSession: Send {
    fn media_type(&self) -> MediaType;

    /// Queue one raw input buffer. An empty payload is allowed together with
    /// `end_of_stream`.
    fn queue_input(&mut self, payload: &[u8], pts_us: i64, end_of_stream: bool)
    -> anyhow::Result<()>;

    fn poll_output(&mut self, timeout: Duration) -> anyhow::Result<OutputStatus>;

    fn release_output(&mut self, index: usize) -> anyhow::Result<()>;

    /// Refresh cached output buffer references after `OutputStatus::BuffersChanged`.
    fn refresh_output_buffers(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Stop the codec and release its resources.
    fn stop(&mut self) -> anyhow::Result<()>;
}
