//! Session actor: the task that owns one chat's playback.
//!
//! The actor exclusively owns the queue, the playing entry, and the
//! supervisor handle. Its select loop also watches the running pipeline's
//! exit and the leave deadline, so track advancement and channel departure
//! are serialized with commands.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    PlayerEvent, QueueEntry, QueueSnapshot, SessionError, SessionSettings, SessionState,
};
use crate::ChatId;
use crate::resolver::ResolvedTrack;
use crate::supervisor::{ExitOutcome, SupervisorError, SupervisorHandle, Transcoder};
use crate::transport::VoiceTransport;

const CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// Commands
// ============================================================================

/// Commands accepted by a session actor. Every request replies via oneshot.
pub enum SessionCommand {
    Enqueue {
        track: ResolvedTrack,
        reply: oneshot::Sender<EnqueueOutcome>,
    },
    Skip {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Pause {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Resume {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    /// Stop playback, clear the queue, leave the channel.
    StopAll {
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<QueueSnapshot>,
    },
    /// Retire the actor if it has been idle for at least `idle_for`.
    RetireIfIdle {
        idle_for: Duration,
        reply: oneshot::Sender<bool>,
    },
    /// Voice connection externally torn down: stop everything and retire.
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Playback of this entry started.
    Started,
    /// Appended behind the current track; 1-based position in the queue.
    Queued { position: usize },
    /// The entry could not be started and was dropped; a TrackFailed or
    /// VoiceJoinFailed event carries the reason.
    Dropped,
}

enum Flow {
    Continue,
    Retire,
}

// ============================================================================
// Actor
// ============================================================================

pub struct SessionActor {
    chat_id: ChatId,
    state: SessionState,
    queue: VecDeque<QueueEntry>,
    now_playing: Option<QueueEntry>,
    supervisor: Option<SupervisorHandle>,
    joined: bool,
    leave_deadline: Option<Instant>,
    last_activity_at: DateTime<Utc>,
    transport: Arc<dyn VoiceTransport>,
    transcoder: Arc<dyn Transcoder>,
    settings: SessionSettings,
    events_tx: mpsc::Sender<PlayerEvent>,
    command_rx: mpsc::Receiver<SessionCommand>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SessionActor {
    pub fn spawn(
        chat_id: ChatId,
        transport: Arc<dyn VoiceTransport>,
        transcoder: Arc<dyn Transcoder>,
        settings: SessionSettings,
        events_tx: mpsc::Sender<PlayerEvent>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> (mpsc::Sender<SessionCommand>, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let actor = Self {
            chat_id,
            state: SessionState::Idle,
            queue: VecDeque::new(),
            now_playing: None,
            supervisor: None,
            joined: false,
            leave_deadline: None,
            last_activity_at: Utc::now(),
            transport,
            transcoder,
            settings,
            events_tx,
            command_rx,
            shutdown_rx,
        };
        let task = tokio::spawn(actor.run());
        (command_tx, task)
    }

    async fn run(mut self) {
        debug!(chat_id = self.chat_id, "session actor started");
        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    // a dropped sender means the registry is gone: shut down
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }
                command = self.command_rx.recv() => {
                    match command {
                        Some(command) => {
                            if matches!(self.handle_command(command).await, Flow::Retire) {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                outcome = wait_playback(self.supervisor.as_mut()) => {
                    self.on_playback_ended(outcome).await;
                }
                _ = sleep_until_opt(self.leave_deadline) => {
                    debug!(chat_id = self.chat_id, "idle grace elapsed, leaving channel");
                    self.leave_channel().await;
                }
            }
        }
        self.stop_everything().await;
        debug!(chat_id = self.chat_id, "session actor stopped");
    }

    async fn handle_command(&mut self, command: SessionCommand) -> Flow {
        match command {
            SessionCommand::Enqueue { track, reply } => {
                self.touch();
                let entry = QueueEntry::new(track);
                let entry_id = entry.id.clone();
                let was_idle = self.state == SessionState::Idle;
                self.queue.push_back(entry);
                if was_idle {
                    self.advance().await;
                }
                // outcome reflects the post-advance state
                let outcome = if self
                    .now_playing
                    .as_ref()
                    .is_some_and(|current| current.id == entry_id)
                {
                    EnqueueOutcome::Started
                } else if let Some(index) =
                    self.queue.iter().position(|queued| queued.id == entry_id)
                {
                    EnqueueOutcome::Queued {
                        position: index + 1,
                    }
                } else {
                    EnqueueOutcome::Dropped
                };
                let _ = reply.send(outcome);
                Flow::Continue
            }
            SessionCommand::Skip { reply } => {
                self.touch();
                let result = self.skip().await;
                let _ = reply.send(result);
                Flow::Continue
            }
            SessionCommand::Pause { reply } => {
                self.touch();
                let _ = reply.send(self.pause());
                Flow::Continue
            }
            SessionCommand::Resume { reply } => {
                self.touch();
                let _ = reply.send(self.resume());
                Flow::Continue
            }
            SessionCommand::StopAll { reply } => {
                self.touch();
                self.stop_everything().await;
                let _ = reply.send(());
                Flow::Continue
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
                Flow::Continue
            }
            SessionCommand::RetireIfIdle { idle_for, reply } => {
                let idle_age = (Utc::now() - self.last_activity_at)
                    .to_std()
                    .unwrap_or_default();
                let retire = self.state == SessionState::Idle && idle_age >= idle_for;
                let _ = reply.send(retire);
                if retire { Flow::Retire } else { Flow::Continue }
            }
            SessionCommand::Disconnect { reply } => {
                self.stop_everything().await;
                let _ = reply.send(());
                Flow::Retire
            }
        }
    }

    /// Pop queue entries until one starts playing or the queue drains.
    async fn advance(&mut self) {
        while let Some(entry) = self.queue.pop_front() {
            if !self.joined {
                if let Err(e) = self.transport.join(self.chat_id).await {
                    warn!(chat_id = self.chat_id, error = %e, "voice join failed");
                    self.emit(PlayerEvent::VoiceJoinFailed {
                        chat_id: self.chat_id,
                        reason: e.to_string(),
                    })
                    .await;
                    // Entry is dropped; the next play command retries the join.
                    self.go_idle();
                    return;
                }
                self.joined = true;
            }
            match self.transcoder.start(self.chat_id, &entry.track).await {
                Ok(handle) => {
                    info!(chat_id = self.chat_id, title = %entry.track.title, "now playing");
                    self.emit(PlayerEvent::NowPlaying {
                        chat_id: self.chat_id,
                        title: entry.track.title.clone(),
                        requested_by: entry.track.origin.requester.clone(),
                    })
                    .await;
                    self.now_playing = Some(entry);
                    self.supervisor = Some(handle);
                    self.state = SessionState::Playing;
                    self.leave_deadline = None;
                    return;
                }
                Err(e) => {
                    warn!(
                        chat_id = self.chat_id,
                        title = %entry.track.title,
                        error = %e,
                        "transcoder startup failed, advancing"
                    );
                    self.emit(PlayerEvent::TrackFailed {
                        chat_id: self.chat_id,
                        title: entry.track.title.clone(),
                        reason: e.to_string(),
                    })
                    .await;
                }
            }
        }
        self.emit(PlayerEvent::QueueDrained {
            chat_id: self.chat_id,
        })
        .await;
        self.go_idle();
    }

    async fn on_playback_ended(&mut self, outcome: ExitOutcome) {
        self.supervisor = None;
        let title = self
            .now_playing
            .take()
            .map(|entry| entry.track.title)
            .unwrap_or_default();
        self.touch();
        match outcome {
            ExitOutcome::Completed => {
                debug!(chat_id = self.chat_id, %title, "track finished");
                self.emit(PlayerEvent::TrackFinished {
                    chat_id: self.chat_id,
                    title,
                })
                .await;
            }
            ExitOutcome::Failed { exit_code, detail } => {
                let reason = SupervisorError::StreamFailed { exit_code, detail }.to_string();
                warn!(chat_id = self.chat_id, %title, %reason, "stream failed, advancing");
                self.emit(PlayerEvent::TrackFailed {
                    chat_id: self.chat_id,
                    title,
                    reason,
                })
                .await;
            }
            ExitOutcome::Stopped => {
                debug!(chat_id = self.chat_id, %title, "playback stopped");
            }
        }
        self.state = SessionState::Idle;
        self.advance().await;
    }

    async fn skip(&mut self) -> Result<(), SessionError> {
        if !matches!(self.state, SessionState::Playing | SessionState::Paused) {
            return Err(SessionError::NotPlaying);
        }
        self.stop_current().await;
        self.state = SessionState::Idle;
        self.advance().await;
        Ok(())
    }

    /// Stop the active supervisor and wait for confirmed termination.
    async fn stop_current(&mut self) {
        let Some(handle) = self.supervisor.take() else {
            return;
        };
        self.state = SessionState::Stopping;
        let title = self
            .now_playing
            .take()
            .map(|entry| entry.track.title)
            .unwrap_or_default();
        if let Err(e) = handle.stop().await {
            warn!(chat_id = self.chat_id, %title, error = %e, "stop escalated past grace period");
            self.emit(PlayerEvent::StopEscalated {
                chat_id: self.chat_id,
                title,
            })
            .await;
        }
    }

    fn pause(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Playing => {
                if let Some(handle) = &self.supervisor {
                    handle.set_paused(true);
                }
                self.state = SessionState::Paused;
                Ok(())
            }
            SessionState::Idle => Err(SessionError::NotPlaying),
            state => Err(SessionError::InvalidTransition { state }),
        }
    }

    fn resume(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Paused => {
                if let Some(handle) = &self.supervisor {
                    handle.set_paused(false);
                }
                self.state = SessionState::Playing;
                Ok(())
            }
            SessionState::Idle => Err(SessionError::NotPlaying),
            state => Err(SessionError::InvalidTransition { state }),
        }
    }

    async fn stop_everything(&mut self) {
        self.queue.clear();
        self.stop_current().await;
        self.now_playing = None;
        self.state = SessionState::Idle;
        // explicit stop leaves the channel immediately, no grace
        self.leave_channel().await;
    }

    async fn leave_channel(&mut self) {
        self.leave_deadline = None;
        if self.joined {
            if let Err(e) = self.transport.leave(self.chat_id).await {
                warn!(chat_id = self.chat_id, error = %e, "voice leave failed");
            }
            self.joined = false;
        }
    }

    fn go_idle(&mut self) {
        self.state = SessionState::Idle;
        self.now_playing = None;
        self.supervisor = None;
        if self.joined {
            self.leave_deadline = Some(Instant::now() + self.settings.idle_grace);
        }
    }

    fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            state: self.state,
            now_playing: self
                .now_playing
                .as_ref()
                .map(|entry| entry.track.title.clone()),
            upcoming: self
                .queue
                .iter()
                .map(|entry| entry.track.title.clone())
                .collect(),
        }
    }

    fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    async fn emit(&self, event: PlayerEvent) {
        let _ = self.events_tx.send(event).await;
    }
}

/// Pending when no pipeline is running, so the select loop can always poll it.
async fn wait_playback(supervisor: Option<&mut SupervisorHandle>) -> ExitOutcome {
    match supervisor {
        Some(handle) => handle.wait().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::{FakeTranscoder, RecordingTransport, TransportCall, direct_track};

    struct Harness {
        command_tx: mpsc::Sender<SessionCommand>,
        transport: Arc<RecordingTransport>,
        transcoder: Arc<FakeTranscoder>,
        events_rx: mpsc::Receiver<PlayerEvent>,
        _shutdown_tx: watch::Sender<bool>,
    }

    fn spawn_actor(settings: SessionSettings) -> Harness {
        let transport = Arc::new(RecordingTransport::default());
        let transcoder = Arc::new(FakeTranscoder::default());
        let (events_tx, events_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (command_tx, _task) = SessionActor::spawn(
            7,
            transport.clone(),
            transcoder.clone(),
            settings,
            events_tx,
            shutdown_rx,
        );
        Harness {
            command_tx,
            transport,
            transcoder,
            events_rx,
            _shutdown_tx: shutdown_tx,
        }
    }

    async fn enqueue(harness: &Harness, url: &str) -> EnqueueOutcome {
        let (reply_tx, reply_rx) = oneshot::channel();
        harness
            .command_tx
            .send(SessionCommand::Enqueue {
                track: direct_track(7, url),
                reply: reply_tx,
            })
            .await
            .unwrap();
        reply_rx.await.unwrap()
    }

    async fn snapshot(harness: &Harness) -> QueueSnapshot {
        let (reply_tx, reply_rx) = oneshot::channel();
        harness
            .command_tx
            .send(SessionCommand::Snapshot { reply: reply_tx })
            .await
            .unwrap();
        reply_rx.await.unwrap()
    }

    #[tokio::test]
    async fn enqueue_starts_then_queues_in_order() {
        let harness = spawn_actor(SessionSettings::default());
        assert_eq!(
            enqueue(&harness, "https://cdn.example/a.mp3").await,
            EnqueueOutcome::Started
        );
        assert_eq!(
            enqueue(&harness, "https://cdn.example/b.mp3").await,
            EnqueueOutcome::Queued { position: 1 }
        );
        assert_eq!(
            enqueue(&harness, "https://cdn.example/c.mp3").await,
            EnqueueOutcome::Queued { position: 2 }
        );

        let snap = snapshot(&harness).await;
        assert_eq!(snap.state, SessionState::Playing);
        assert_eq!(snap.now_playing.as_deref(), Some("https://cdn.example/a.mp3"));
        assert_eq!(
            snap.upcoming,
            vec!["https://cdn.example/b.mp3", "https://cdn.example/c.mp3"]
        );
        assert_eq!(
            harness.transport.calls(),
            vec![TransportCall::Join(7)],
            "one join for the whole session"
        );
    }

    #[tokio::test]
    async fn skip_with_nothing_playing_is_rejected() {
        let harness = spawn_actor(SessionSettings::default());
        let (reply_tx, reply_rx) = oneshot::channel();
        harness
            .command_tx
            .send(SessionCommand::Skip { reply: reply_tx })
            .await
            .unwrap();
        assert!(matches!(
            reply_rx.await.unwrap(),
            Err(SessionError::NotPlaying)
        ));
    }

    #[tokio::test]
    async fn pause_resume_transitions() {
        let mut harness = spawn_actor(SessionSettings::default());
        enqueue(&harness, "https://cdn.example/a.mp3").await;

        let (reply_tx, reply_rx) = oneshot::channel();
        harness
            .command_tx
            .send(SessionCommand::Pause { reply: reply_tx })
            .await
            .unwrap();
        assert!(reply_rx.await.unwrap().is_ok());
        assert_eq!(snapshot(&harness).await.state, SessionState::Paused);

        // pausing again is an invalid transition
        let (reply_tx, reply_rx) = oneshot::channel();
        harness
            .command_tx
            .send(SessionCommand::Pause { reply: reply_tx })
            .await
            .unwrap();
        assert!(matches!(
            reply_rx.await.unwrap(),
            Err(SessionError::InvalidTransition {
                state: SessionState::Paused
            })
        ));

        let (reply_tx, reply_rx) = oneshot::channel();
        harness
            .command_tx
            .send(SessionCommand::Resume { reply: reply_tx })
            .await
            .unwrap();
        assert!(reply_rx.await.unwrap().is_ok());
        assert_eq!(snapshot(&harness).await.state, SessionState::Playing);
        harness.events_rx.close();
    }

    #[tokio::test]
    async fn startup_failure_advances_to_next_track() {
        let mut harness = spawn_actor(SessionSettings::default());
        *harness.transcoder.fail_starts.lock().unwrap() = 1;
        enqueue(&harness, "https://cdn.example/bad.mp3").await;
        enqueue(&harness, "https://cdn.example/good.mp3").await;

        // first enqueue failed startup and went idle, second started playback
        let snap = snapshot(&harness).await;
        assert_eq!(snap.state, SessionState::Playing);
        assert_eq!(
            snap.now_playing.as_deref(),
            Some("https://cdn.example/good.mp3")
        );
        assert_eq!(
            harness.transcoder.started_titles(),
            vec!["https://cdn.example/good.mp3"]
        );

        let event = harness.events_rx.recv().await.unwrap();
        assert!(matches!(event, PlayerEvent::TrackFailed { ref title, .. }
            if title == "https://cdn.example/bad.mp3"));
    }

    #[tokio::test]
    async fn join_failure_drops_entry_and_stays_idle() {
        let mut harness = spawn_actor(SessionSettings::default());
        *harness.transport.fail_join.lock().unwrap() = true;
        assert_eq!(
            enqueue(&harness, "https://cdn.example/a.mp3").await,
            EnqueueOutcome::Dropped
        );

        let snap = snapshot(&harness).await;
        assert_eq!(snap.state, SessionState::Idle);
        assert!(snap.now_playing.is_none());
        assert!(snap.upcoming.is_empty());
        assert!(harness.transcoder.started_titles().is_empty());

        let event = harness.events_rx.recv().await.unwrap();
        assert!(matches!(event, PlayerEvent::VoiceJoinFailed { chat_id: 7, .. }));

        // join works again: the next play retries
        *harness.transport.fail_join.lock().unwrap() = false;
        assert_eq!(
            enqueue(&harness, "https://cdn.example/b.mp3").await,
            EnqueueOutcome::Started
        );
        assert_eq!(snapshot(&harness).await.state, SessionState::Playing);
    }

    #[tokio::test]
    async fn enqueue_reports_drop_when_startup_fails() {
        let mut harness = spawn_actor(SessionSettings::default());
        *harness.transcoder.fail_starts.lock().unwrap() = 1;
        assert_eq!(
            enqueue(&harness, "https://cdn.example/bad.mp3").await,
            EnqueueOutcome::Dropped
        );
        assert_eq!(snapshot(&harness).await.state, SessionState::Idle);

        let event = harness.events_rx.recv().await.unwrap();
        assert!(matches!(event, PlayerEvent::TrackFailed { ref title, .. }
            if title == "https://cdn.example/bad.mp3"));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_escalation_forces_idle_and_reports() {
        let mut harness = spawn_actor(SessionSettings::default());
        *harness.transcoder.stuck_stops.lock().unwrap() = true;
        enqueue(&harness, "https://cdn.example/stuck.mp3").await;

        let began = Instant::now();
        let (reply_tx, reply_rx) = oneshot::channel();
        harness
            .command_tx
            .send(SessionCommand::Skip { reply: reply_tx })
            .await
            .unwrap();
        assert!(reply_rx.await.unwrap().is_ok(), "skip still succeeds");
        // fake grace is 1s plus the 2s kill margin
        assert!(began.elapsed() <= Duration::from_secs(4));

        assert_eq!(snapshot(&harness).await.state, SessionState::Idle);

        let mut escalated = false;
        while let Ok(event) = harness.events_rx.try_recv() {
            if matches!(event, PlayerEvent::StopEscalated { chat_id: 7, .. }) {
                escalated = true;
            }
        }
        assert!(escalated, "a stuck pipeline reports the escalation");
    }

    #[tokio::test]
    async fn retire_if_idle_respects_state_and_age() {
        let harness = spawn_actor(SessionSettings::default());
        enqueue(&harness, "https://cdn.example/a.mp3").await;

        // playing sessions never retire
        let (reply_tx, reply_rx) = oneshot::channel();
        harness
            .command_tx
            .send(SessionCommand::RetireIfIdle {
                idle_for: Duration::ZERO,
                reply: reply_tx,
            })
            .await
            .unwrap();
        assert!(!reply_rx.await.unwrap());

        // a fresh idle session is younger than a long idle_for
        let (reply_tx, reply_rx) = oneshot::channel();
        harness
            .command_tx
            .send(SessionCommand::StopAll { reply: reply_tx })
            .await
            .unwrap();
        reply_rx.await.unwrap();
        let (reply_tx, reply_rx) = oneshot::channel();
        harness
            .command_tx
            .send(SessionCommand::RetireIfIdle {
                idle_for: Duration::from_secs(600),
                reply: reply_tx,
            })
            .await
            .unwrap();
        assert!(!reply_rx.await.unwrap());
    }
}
