//! Process-wide chat-to-session mapping.
//!
//! `DashMap` keyed by chat id; actor task handles are kept so shutdown can
//! wait for every session to tear down its child process and leave its
//! channel.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::actor::SessionActor;
use super::handle::SessionHandle;
use super::{PlayerEvent, SessionSettings};
use crate::ChatId;
use crate::supervisor::Transcoder;
use crate::transport::VoiceTransport;

#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<ChatId, SessionHandle>>,
    task_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
    transport: Arc<dyn VoiceTransport>,
    transcoder: Arc<dyn Transcoder>,
    settings: SessionSettings,
    events_tx: mpsc::Sender<PlayerEvent>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SessionRegistry {
    pub fn new(
        transport: Arc<dyn VoiceTransport>,
        transcoder: Arc<dyn Transcoder>,
        settings: SessionSettings,
        events_tx: mpsc::Sender<PlayerEvent>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            sessions: Arc::new(DashMap::new()),
            task_handles: Arc::new(Mutex::new(Vec::new())),
            transport,
            transcoder,
            settings,
            events_tx,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    /// Get the chat's session, spawning an actor if none exists.
    pub fn get_or_create(&self, chat_id: ChatId) -> SessionHandle {
        if let Some(handle) = self.sessions.get(&chat_id) {
            return handle.clone();
        }
        // entry() keeps concurrent creators from racing two actors for one chat
        let entry = self.sessions.entry(chat_id).or_insert_with(|| {
            debug!(chat_id, "creating session");
            let (command_tx, task) = SessionActor::spawn(
                chat_id,
                self.transport.clone(),
                self.transcoder.clone(),
                self.settings.clone(),
                self.events_tx.clone(),
                self.shutdown_rx.clone(),
            );
            lock_handles(&self.task_handles).push(task);
            SessionHandle::new(command_tx, chat_id)
        });
        entry.clone()
    }

    /// Get the chat's session without creating one.
    pub fn get(&self, chat_id: ChatId) -> Option<SessionHandle> {
        self.sessions.get(&chat_id).map(|handle| handle.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Retire the session if its actor confirms it has been idle past the
    /// configured timeout. The check runs inside the actor, so it cannot race
    /// a concurrent enqueue.
    pub async fn remove_if_idle(&self, chat_id: ChatId) -> bool {
        let Some(handle) = self.get(chat_id) else {
            return false;
        };
        match handle.retire_if_idle(self.settings.idle_timeout).await {
            Ok(true) => {
                self.sessions.remove(&chat_id);
                debug!(chat_id, "idle session retired");
                true
            }
            Ok(false) => false,
            // actor already gone; drop the stale entry
            Err(_) => {
                self.sessions.remove(&chat_id);
                true
            }
        }
    }

    /// Voice connection externally torn down: stop the session and drop it.
    pub async fn disconnect(&self, chat_id: ChatId) -> bool {
        let Some((_, handle)) = self.sessions.remove(&chat_id) else {
            return false;
        };
        info!(chat_id, "voice disconnected, retiring session");
        let _ = handle.disconnect().await;
        true
    }

    /// One pass over all sessions, retiring the ones idle past the timeout.
    pub async fn sweep_idle(&self) -> usize {
        let chat_ids: Vec<ChatId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        let mut retired = 0;
        for chat_id in chat_ids {
            if self.remove_if_idle(chat_id).await {
                retired += 1;
            }
        }
        if retired > 0 {
            info!(retired, "idle session sweep complete");
        }
        retired
    }

    /// Periodic idle sweep. Aborted by the caller on shutdown.
    pub fn spawn_sweep_task(&self) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(registry.settings.sweep_interval);
            // the first tick fires immediately; skip it
            interval.tick().await;
            loop {
                interval.tick().await;
                registry.sweep_idle().await;
            }
        })
    }

    /// Broadcast shutdown and wait for every actor to finish teardown.
    pub async fn shutdown(&self) {
        info!(sessions = self.sessions.len(), "shutting down session registry");
        if self.shutdown_tx.send(true).is_err() {
            debug!("no sessions listening for shutdown");
        }
        let tasks = std::mem::take(&mut *lock_handles(&self.task_handles));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = ?e, "session actor panicked during shutdown");
            }
        }
        self.sessions.clear();
        info!("session registry shutdown complete");
    }
}

fn lock_handles(
    handles: &Mutex<Vec<JoinHandle<()>>>,
) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
    match handles.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
