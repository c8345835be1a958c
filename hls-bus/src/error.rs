//! Pipeline error types (thiserror-based).

use thiserror::Error;

use crate::{encoder::SessionState, packet::MediaType};

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// A key frame arrived before the encoder emitted its config blob.
    #[error("{0} key frame before codec config was captured")]
    ConfigNotCaptured(MediaType),

    #[error("audio frame of {len} bytes does not fit the ADTS length bits")]
    AudioFrameTooLarge { len: usize },

    #[error("{media} encoder returned output buffer {index} without data")]
    MissingOutputBuffer { media: MediaType, index: usize },

    #[error("{media} session is {state:?}, input rejected")]
    SessionNotRunning { media: MediaType, state: SessionState },

    #[error("{0} encoder did not reach end of stream in time")]
    EndOfStreamTimeout(MediaType),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl PipelineError {
    /// Errors after which the session cannot continue and must be torn down.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::MissingOutputBuffer { .. } | PipelineError::EndOfStreamTimeout(_)
        )
    }
}
