//! Command dispatcher: inbound user commands into session operations.
//!
//! Play input is fully resolved before any session state is touched, so a
//! resolution failure never leaves a session half-updated. When no direct
//! stream can be resolved the reply carries a manual-open link instead of an
//! error.

use std::time::Duration;

use tracing::{debug, warn};

use crate::ChatId;
use crate::resolver::{PlayRequest, ResolveError, ResolvedTrack, Resolver};
use crate::session::registry::SessionRegistry;
use crate::session::{EnqueueOutcome, SessionError};

const RESOLVE_ATTEMPTS: usize = 2;
const RESOLVE_BACKOFF: Duration = Duration::from_millis(500);

/// What the messaging client should present in response to a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Track accepted; `position` is None when playback starts immediately.
    Accepted {
        title: String,
        position: Option<usize>,
    },
    /// No direct stream could be resolved; offer the link to open manually.
    ManualOpen { link: String, note: String },
    Skipped,
    Paused,
    Resumed,
    Stopped,
    Queue {
        now_playing: Option<String>,
        upcoming: Vec<String>,
    },
    Rejected { reason: String },
}

pub struct Dispatcher {
    registry: SessionRegistry,
    resolver: Resolver,
}

impl Dispatcher {
    pub fn new(registry: SessionRegistry, resolver: Resolver) -> Self {
        Self { registry, resolver }
    }

    pub async fn handle_play(&self, chat_id: ChatId, requester: &str, raw_input: &str) -> Reply {
        let request = match PlayRequest::classify(chat_id, requester, raw_input) {
            Ok(request) => request,
            Err(e) => return Reply::Rejected { reason: e.to_string() },
        };
        let track = match self.resolve_with_retry(&request).await {
            Ok(track) => track,
            Err(ResolveError::NeedsManualOpen { link }) => {
                return Reply::ManualOpen {
                    link,
                    note: "no direct stream available; open the link to listen".to_string(),
                };
            }
            Err(ResolveError::ProviderUnavailable(reason)) if !self.resolver.has_provider() => {
                // No search credentials is a normal deployment; hand back a
                // search link instead of an error.
                debug!(chat_id, %reason, "search provider not configured");
                return Reply::ManualOpen {
                    link: search_link(&request.raw_input),
                    note: "search is not configured; open the search page instead".to_string(),
                };
            }
            Err(e) => return Reply::Rejected { reason: e.to_string() },
        };

        let title = track.title.clone();
        match self.registry.get_or_create(chat_id).enqueue(track).await {
            Ok(EnqueueOutcome::Started) => Reply::Accepted {
                title,
                position: None,
            },
            Ok(EnqueueOutcome::Queued { position }) => Reply::Accepted {
                title,
                position: Some(position),
            },
            Ok(EnqueueOutcome::Dropped) => Reply::Rejected {
                reason: format!("failed to start '{title}'"),
            },
            Err(e) => Reply::Rejected { reason: e.to_string() },
        }
    }

    /// One bounded retry for transient provider failures. Resolution errors
    /// that cannot change on retry are returned immediately.
    async fn resolve_with_retry(
        &self,
        request: &PlayRequest,
    ) -> Result<ResolvedTrack, ResolveError> {
        let mut attempt = 1;
        loop {
            match self.resolver.resolve(request).await {
                Err(ResolveError::ProviderUnavailable(reason))
                    if self.resolver.has_provider() && attempt < RESOLVE_ATTEMPTS =>
                {
                    warn!(attempt, %reason, "provider call failed, retrying");
                    tokio::time::sleep(RESOLVE_BACKOFF).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    pub async fn handle_skip(&self, chat_id: ChatId) -> Reply {
        let Some(session) = self.registry.get(chat_id) else {
            return Reply::Rejected {
                reason: SessionError::NotPlaying.to_string(),
            };
        };
        match session.skip().await {
            Ok(()) => Reply::Skipped,
            Err(e) => Reply::Rejected { reason: e.to_string() },
        }
    }

    pub async fn handle_pause(&self, chat_id: ChatId) -> Reply {
        let Some(session) = self.registry.get(chat_id) else {
            return Reply::Rejected {
                reason: SessionError::NotPlaying.to_string(),
            };
        };
        match session.pause().await {
            Ok(()) => Reply::Paused,
            Err(e) => Reply::Rejected { reason: e.to_string() },
        }
    }

    pub async fn handle_resume(&self, chat_id: ChatId) -> Reply {
        let Some(session) = self.registry.get(chat_id) else {
            return Reply::Rejected {
                reason: SessionError::NotPlaying.to_string(),
            };
        };
        match session.resume().await {
            Ok(()) => Reply::Resumed,
            Err(e) => Reply::Rejected { reason: e.to_string() },
        }
    }

    /// Stop is idempotent: with no session there is nothing to do, which is
    /// still a successful stop.
    pub async fn handle_stop(&self, chat_id: ChatId) -> Reply {
        let Some(session) = self.registry.get(chat_id) else {
            return Reply::Stopped;
        };
        match session.stop_all().await {
            Ok(()) => Reply::Stopped,
            Err(e) => Reply::Rejected { reason: e.to_string() },
        }
    }

    pub async fn handle_queue(&self, chat_id: ChatId) -> Reply {
        let Some(session) = self.registry.get(chat_id) else {
            return Reply::Rejected {
                reason: SessionError::QueueEmpty.to_string(),
            };
        };
        match session.snapshot().await {
            Ok(snapshot) if snapshot.now_playing.is_none() && snapshot.upcoming.is_empty() => {
                Reply::Rejected {
                    reason: SessionError::QueueEmpty.to_string(),
                }
            }
            Ok(snapshot) => Reply::Queue {
                now_playing: snapshot.now_playing,
                upcoming: snapshot.upcoming,
            },
            Err(e) => Reply::Rejected { reason: e.to_string() },
        }
    }
}

fn search_link(query: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
    format!("https://www.youtube.com/results?search_query={encoded}")
}
