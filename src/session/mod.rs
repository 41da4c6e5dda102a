//! Per-chat playback sessions.
//!
//! A session is an actor task owning one chat's queue, playback state, and
//! supervisor handle. All mutations go through its command channel, so the
//! single-active-playback invariant holds by construction.

pub mod actor;
pub mod handle;
pub mod registry;

pub use actor::{EnqueueOutcome, SessionCommand};
pub use handle::SessionHandle;
pub use registry::SessionRegistry;

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use ulid::Ulid;

use crate::ChatId;
use crate::resolver::ResolvedTrack;

// ============================================================================
// State
// ============================================================================

/// Playback state of one chat's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Playing,
    Paused,
    /// Transitional: a stop was requested and termination is being confirmed.
    Stopping,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Playing => write!(f, "playing"),
            SessionState::Paused => write!(f, "paused"),
            SessionState::Stopping => write!(f, "stopping"),
        }
    }
}

// ============================================================================
// Queue
// ============================================================================

/// One queued track.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: String,
    pub track: ResolvedTrack,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(track: ResolvedTrack) -> Self {
        Self {
            id: Ulid::new().to_string().to_lowercase(),
            track,
            enqueued_at: Utc::now(),
        }
    }
}

/// Point-in-time view of a session, for queue listings.
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub state: SessionState,
    pub now_playing: Option<String>,
    pub upcoming: Vec<String>,
}

// ============================================================================
// Events
// ============================================================================

/// Notifications emitted by session actors for the messaging client to relay.
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    NowPlaying {
        chat_id: ChatId,
        title: String,
        requested_by: String,
    },
    TrackFinished {
        chat_id: ChatId,
        title: String,
    },
    TrackFailed {
        chat_id: ChatId,
        title: String,
        reason: String,
    },
    QueueDrained {
        chat_id: ChatId,
    },
    VoiceJoinFailed {
        chat_id: ChatId,
        reason: String,
    },
    /// The transcoder ignored the stop request past the grace period and was
    /// force-killed at the OS level.
    StopEscalated {
        chat_id: ChatId,
        title: String,
    },
}

// ============================================================================
// Errors and settings
// ============================================================================

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("nothing is playing")]
    NotPlaying,

    #[error("the queue is empty")]
    QueueEmpty,

    #[error("operation not valid while {state}")]
    InvalidTransition { state: SessionState },

    #[error("session is closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// How long an idle session stays joined to the voice channel before
    /// leaving.
    pub idle_grace: Duration,
    /// Idle age after which the registry may retire the session entirely.
    pub idle_timeout: Duration,
    /// Interval of the registry's idle sweep.
    pub sweep_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_grace: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

// ============================================================================
// Test doubles
// ============================================================================
