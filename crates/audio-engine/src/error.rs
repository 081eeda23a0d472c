//! Error taxonomy for the engine internals.
//!
//! None of these cross the public sound/manager surface: callers get null
//! sounds, `false`, or silence, and the error is logged instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AudioError {
    /// A device or a source could not be opened.
    #[error("cannot open {what}: {reason}")]
    Open { what: String, reason: String },

    /// Only mono and stereo sources can be played.
    #[error("unsupported channel layout: {channels} channels (only mono and stereo)")]
    Format { channels: u16 },

    /// The mixer ran out of buffers or voices.
    #[error("hardware {0} exhausted")]
    Allocation(&'static str),

    /// A voice handed back a buffer the sound never queued.
    #[error("corruption in stream queue: {0}")]
    StreamCorruption(String),

    /// The output device or its context could not be created.
    #[error("audio device lost: {0}")]
    DeviceLoss(String),

    /// The mixer was asked to do something its state does not allow.
    #[error("invalid mixer operation: {0}")]
    InvalidOperation(String),

    /// A buffer cannot be deleted while a voice still holds it.
    #[error("buffer {0} is still queued on a voice")]
    BufferBusy(u32),

    #[error("decode error: {0}")]
    Decode(#[from] symphonia::core::errors::Error),
}

impl AudioError {
    pub(crate) fn open(what: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        AudioError::Open {
            what: what.into(),
            reason: reason.to_string(),
        }
    }
}

pub type AudioResult<T> = std::result::Result<T, AudioError>;
