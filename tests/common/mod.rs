//! Shared test doubles: a recording voice transport and a scriptable
//! transcoder whose playbacks the test ends on demand.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};

use cadenza::ChatId;
use cadenza::resolver::{PlayRequest, ResolvedTrack, SourceKind};
use cadenza::supervisor::{ExitOutcome, SupervisorError, SupervisorHandle, Transcoder};
use cadenza::transport::{AudioFrame, TransportError, VoiceTransport};

pub fn direct_track(chat_id: ChatId, url: &str) -> ResolvedTrack {
    ResolvedTrack {
        title: url.to_string(),
        stream_url: url.to_string(),
        duration_hint: None,
        source_kind: SourceKind::DirectStream,
        origin: PlayRequest::classify(chat_id, "tester", url).unwrap(),
    }
}

/// Poll `condition` until it holds or two seconds elapse.
pub async fn wait_for(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within deadline"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// RecordingTransport
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Join(ChatId),
    Leave(ChatId),
}

#[derive(Default)]
pub struct RecordingTransport {
    calls: Mutex<Vec<TransportCall>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl VoiceTransport for RecordingTransport {
    async fn join(&self, chat_id: ChatId) -> Result<(), TransportError> {
        self.calls.lock().unwrap().push(TransportCall::Join(chat_id));
        Ok(())
    }

    async fn leave(&self, chat_id: ChatId) -> Result<(), TransportError> {
        self.calls.lock().unwrap().push(TransportCall::Leave(chat_id));
        Ok(())
    }

    async fn push_frame(&self, _chat_id: ChatId, _frame: AudioFrame) -> Result<(), TransportError> {
        Ok(())
    }
}

// ============================================================================
// FakeTranscoder
// ============================================================================

/// Each `start` records the track title and parks a sender the test can use
/// to end that playback with a chosen outcome. The spawned task speaks the
/// same channel protocol as the real pump: an explicit stop wins over the
/// scripted end.
#[derive(Default)]
pub struct FakeTranscoder {
    started: Mutex<Vec<String>>,
    pending: Mutex<Vec<oneshot::Sender<ExitOutcome>>>,
}

impl FakeTranscoder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn started_titles(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn started_count(&self) -> usize {
        self.started.lock().unwrap().len()
    }

    /// End the oldest still-running playback with `outcome`. Returns false
    /// when that playback was already stopped.
    pub fn finish_next(&self, outcome: ExitOutcome) -> bool {
        let mut pending = self.pending.lock().unwrap();
        if pending.is_empty() {
            return false;
        }
        pending.remove(0).send(outcome).is_ok()
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn start(
        &self,
        _chat_id: ChatId,
        track: &ResolvedTrack,
    ) -> Result<SupervisorHandle, SupervisorError> {
        let (stop_tx, stop_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (pause_tx, pause_rx) = watch::channel(false);
        let (end_tx, end_rx) = oneshot::channel::<ExitOutcome>();
        tokio::spawn(async move {
            let _gate = pause_rx;
            tokio::select! {
                _ = stop_rx => {
                    let _ = exit_tx.send(ExitOutcome::Stopped);
                }
                end = end_rx => {
                    let _ = exit_tx.send(end.unwrap_or(ExitOutcome::Completed));
                }
            }
        });
        self.started.lock().unwrap().push(track.title.clone());
        self.pending.lock().unwrap().push(end_tx);
        Ok(SupervisorHandle::new(
            stop_tx,
            exit_rx,
            pause_tx,
            Duration::from_secs(1),
        ))
    }
}
