//! Cadenza - voice-chat media playback controller.
//!
//! Users issue a play command with either a direct stream URL or a free-text
//! search query, and audio is mixed into a live voice channel. The crate owns
//! one playback session per chat: a FIFO queue of resolved tracks, a
//! supervised external transcode process per playing track, and the state
//! machine tying them together.
//!
//! The messaging platform client, the search provider backend, and the voice
//! transport are external collaborators consumed through traits and channels.

pub mod config;
pub mod dispatcher;
pub mod resolver;
pub mod session;
pub mod supervisor;
pub mod transport;

/// Messaging-platform chat identifier.
pub type ChatId = i64;

pub use dispatcher::{Dispatcher, Reply};
pub use session::SessionRegistry;
