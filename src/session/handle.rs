//! Cloneable handle to a session actor.
//!
//! Every method sends a command with a oneshot reply. A closed channel in
//! either direction means the actor is gone and maps to `SessionError::Closed`.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use super::actor::{EnqueueOutcome, SessionCommand};
use super::{QueueSnapshot, SessionError};
use crate::ChatId;
use crate::resolver::ResolvedTrack;

#[derive(Clone)]
pub struct SessionHandle {
    command_tx: mpsc::Sender<SessionCommand>,
    chat_id: ChatId,
}

impl SessionHandle {
    pub(crate) fn new(command_tx: mpsc::Sender<SessionCommand>, chat_id: ChatId) -> Self {
        Self { command_tx, chat_id }
    }

    pub fn chat_id(&self) -> ChatId {
        self.chat_id
    }

    pub async fn enqueue(&self, track: ResolvedTrack) -> Result<EnqueueOutcome, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(SessionCommand::Enqueue {
                track,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SessionError::Closed)?;
        reply_rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn skip(&self) -> Result<(), SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(SessionCommand::Skip { reply: reply_tx })
            .await
            .map_err(|_| SessionError::Closed)?;
        reply_rx.await.map_err(|_| SessionError::Closed)?
    }

    pub async fn pause(&self) -> Result<(), SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(SessionCommand::Pause { reply: reply_tx })
            .await
            .map_err(|_| SessionError::Closed)?;
        reply_rx.await.map_err(|_| SessionError::Closed)?
    }

    pub async fn resume(&self) -> Result<(), SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(SessionCommand::Resume { reply: reply_tx })
            .await
            .map_err(|_| SessionError::Closed)?;
        reply_rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Stop playback, clear the queue, leave the channel. Idempotent.
    pub async fn stop_all(&self) -> Result<(), SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(SessionCommand::StopAll { reply: reply_tx })
            .await
            .map_err(|_| SessionError::Closed)?;
        reply_rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(SessionCommand::Snapshot { reply: reply_tx })
            .await
            .map_err(|_| SessionError::Closed)?;
        reply_rx.await.map_err(|_| SessionError::Closed)
    }

    pub(crate) async fn retire_if_idle(&self, idle_for: Duration) -> Result<bool, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(SessionCommand::RetireIfIdle {
                idle_for,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SessionError::Closed)?;
        reply_rx.await.map_err(|_| SessionError::Closed)
    }

    pub(crate) async fn disconnect(&self) -> Result<(), SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(SessionCommand::Disconnect { reply: reply_tx })
            .await
            .map_err(|_| SessionError::Closed)?;
        reply_rx.await.map_err(|_| SessionError::Closed)
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("chat_id", &self.chat_id)
            .finish()
    }
}
