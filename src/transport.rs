//! Voice transport boundary.
//!
//! The actual voice-channel client (join, leave, frame delivery) lives
//! outside this crate; everything here talks to it through `VoiceTransport`.

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::ChatId;

/// One fixed-duration chunk of interleaved s16le PCM.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub pcm: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("voice channel unavailable: {0}")]
    Unavailable(String),

    #[error("frame delivery failed: {0}")]
    Delivery(String),
}

/// Voice-channel client seam.
///
/// `push_frame` is allowed to apply backpressure by suspending until the
/// channel can accept the frame; callers rely on that for pacing.
#[async_trait]
pub trait VoiceTransport: Send + Sync {
    async fn join(&self, chat_id: ChatId) -> Result<(), TransportError>;

    async fn leave(&self, chat_id: ChatId) -> Result<(), TransportError>;

    async fn push_frame(&self, chat_id: ChatId, frame: AudioFrame) -> Result<(), TransportError>;
}

/// Transport that accepts everything and discards the audio.
///
/// Used by the local console runner and anywhere playback plumbing is
/// exercised without a live voice channel.
pub struct NullTransport;

#[async_trait]
impl VoiceTransport for NullTransport {
    async fn join(&self, chat_id: ChatId) -> Result<(), TransportError> {
        debug!(chat_id, "null transport join");
        Ok(())
    }

    async fn leave(&self, chat_id: ChatId) -> Result<(), TransportError> {
        debug!(chat_id, "null transport leave");
        Ok(())
    }

    async fn push_frame(&self, _chat_id: ChatId, _frame: AudioFrame) -> Result<(), TransportError> {
        Ok(())
    }
}
