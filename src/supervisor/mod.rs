//! Transcode process supervision.
//!
//! Each playing track gets one external ffmpeg process decoding the source
//! stream to raw PCM, plus a pump task that frames the PCM and pushes it into
//! the voice transport. The pump owns the child process end to end: it is the
//! only place the process is killed and reaped, and it reports the exit
//! outcome exactly once through the handle.

mod pump;

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{oneshot, watch};

use crate::ChatId;
use crate::resolver::ResolvedTrack;
use crate::transport::VoiceTransport;

// ============================================================================
// Settings
// ============================================================================

/// Tunables for the transcode pipeline.
#[derive(Debug, Clone)]
pub struct TranscoderSettings {
    pub ffmpeg_path: String,
    pub sample_rate: u32,
    pub channels: u8,
    pub frame_ms: u32,
    /// SIGTERM-to-SIGKILL window when stopping a child.
    pub stop_grace: Duration,
    /// How long a fresh pipeline may take to produce its first frame.
    pub startup_timeout: Duration,
    /// Frames buffered while paused before the pipe is allowed to stall.
    pub pause_buffer_frames: usize,
}

impl TranscoderSettings {
    /// Bytes per PCM frame: s16le samples, interleaved channels.
    pub fn frame_bytes(&self) -> usize {
        (self.sample_rate as usize / 1000) * self.frame_ms as usize * self.channels as usize * 2
    }
}

impl Default for TranscoderSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            sample_rate: 48_000,
            channels: 2,
            frame_ms: 20,
            stop_grace: Duration::from_secs(3),
            startup_timeout: Duration::from_secs(10),
            pause_buffer_frames: 250,
        }
    }
}

// ============================================================================
// Errors and outcomes
// ============================================================================

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("transcoder failed to start: {0}")]
    StartupFailed(String),

    #[error("stream failed (exit {exit_code}): {detail}")]
    StreamFailed { exit_code: i32, detail: String },

    #[error("transcoder did not terminate within the grace period")]
    KillTimeout,
}

/// How a playback pipeline ended. Reported exactly once per pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Source drained and the child exited cleanly.
    Completed,
    /// Child exited nonzero or the pipeline broke midstream.
    Failed { exit_code: i32, detail: String },
    /// Terminated on request.
    Stopped,
}

// ============================================================================
// SupervisorHandle
// ============================================================================

/// Caller-side handle to one running pipeline.
///
/// The exit outcome is consumed exactly once, either by `wait` (the session
/// actor's select loop) or by `stop`.
pub struct SupervisorHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    exit_rx: oneshot::Receiver<ExitOutcome>,
    pause_tx: watch::Sender<bool>,
    stop_grace: Duration,
}

impl SupervisorHandle {
    /// Assemble a handle from pipeline channel ends. Alternative `Transcoder`
    /// implementations use this to speak the same protocol as the pump.
    pub fn new(
        stop_tx: oneshot::Sender<()>,
        exit_rx: oneshot::Receiver<ExitOutcome>,
        pause_tx: watch::Sender<bool>,
        stop_grace: Duration,
    ) -> Self {
        Self {
            stop_tx: Some(stop_tx),
            exit_rx,
            pause_tx,
            stop_grace,
        }
    }

    /// Gate frame delivery. Decoding continues into a bounded buffer; once
    /// that fills, pipe backpressure stalls the child.
    pub fn set_paused(&self, paused: bool) {
        let _ = self.pause_tx.send(paused);
    }

    /// Wait for the pipeline to end on its own.
    pub async fn wait(&mut self) -> ExitOutcome {
        match (&mut self.exit_rx).await {
            Ok(outcome) => outcome,
            Err(_) => ExitOutcome::Failed {
                exit_code: -1,
                detail: "playback pipeline task dropped".to_string(),
            },
        }
    }

    /// Terminate the child and wait for a confirmed reap.
    ///
    /// The pump escalates SIGTERM to SIGKILL after `stop_grace`; if even that
    /// is not confirmed within a bounded margin, `KillTimeout` is returned
    /// and the caller must treat the process as leaked.
    pub async fn stop(mut self) -> Result<ExitOutcome, SupervisorError> {
        if let Some(stop_tx) = self.stop_tx.take() {
            // Send failure means the pump already finished; the outcome is
            // sitting in exit_rx.
            let _ = stop_tx.send(());
        }
        let deadline = self.stop_grace + Duration::from_secs(2);
        match tokio::time::timeout(deadline, &mut self.exit_rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            // Pump gone without reporting; the child was reaped on its way out.
            Ok(Err(_)) => Ok(ExitOutcome::Stopped),
            Err(_) => Err(SupervisorError::KillTimeout),
        }
    }
}

impl std::fmt::Debug for SupervisorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorHandle")
            .field("stopped", &self.stop_tx.is_none())
            .finish()
    }
}

// ============================================================================
// Transcoder seam
// ============================================================================

/// Starts a playback pipeline for a resolved track.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn start(
        &self,
        chat_id: ChatId,
        track: &ResolvedTrack,
    ) -> Result<SupervisorHandle, SupervisorError>;
}

/// The production transcoder: ffmpeg decoding the stream URL to s16le PCM on
/// stdout.
pub struct FfmpegTranscoder {
    settings: TranscoderSettings,
    transport: Arc<dyn VoiceTransport>,
}

impl FfmpegTranscoder {
    pub fn new(settings: TranscoderSettings, transport: Arc<dyn VoiceTransport>) -> Self {
        Self {
            settings,
            transport,
        }
    }

    fn build_command(&self, stream_url: &str) -> Command {
        let mut cmd = Command::new(&self.settings.ffmpeg_path);
        cmd.args(["-hide_banner", "-loglevel", "error", "-re", "-i"])
            .arg(stream_url)
            .args(["-vn", "-f", "s16le"])
            .args(["-ar", &self.settings.sample_rate.to_string()])
            .args(["-ac", &self.settings.channels.to_string()])
            .arg("pipe:1");
        cmd
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn start(
        &self,
        chat_id: ChatId,
        track: &ResolvedTrack,
    ) -> Result<SupervisorHandle, SupervisorError> {
        let cmd = self.build_command(&track.stream_url);
        spawn_supervised(cmd, chat_id, self.transport.clone(), &self.settings).await
    }
}

// ============================================================================
// Pipeline spawn
// ============================================================================

/// Spawn a child command and the pump task supervising it.
///
/// Startup is confirmed by the first full PCM frame: until one arrives
/// (bounded by `startup_timeout`), the pipeline is not considered healthy
/// and any exit is a `StartupFailed`.
pub(crate) async fn spawn_supervised(
    mut cmd: Command,
    chat_id: ChatId,
    transport: Arc<dyn VoiceTransport>,
    settings: &TranscoderSettings,
) -> Result<SupervisorHandle, SupervisorError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // Children must not outlive the controller, even on a hard crash.
    #[cfg(target_os = "linux")]
    unsafe {
        cmd.pre_exec(|| {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| SupervisorError::StartupFailed(e.to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SupervisorError::StartupFailed("child stdout not captured".to_string()))?;
    let stderr = child.stderr.take();

    let (stop_tx, stop_rx) = oneshot::channel();
    let (exit_tx, exit_rx) = oneshot::channel();
    let (pause_tx, pause_rx) = watch::channel(false);
    let (startup_tx, startup_rx) = oneshot::channel();

    let pump = pump::Pump {
        chat_id,
        transport,
        frame_bytes: settings.frame_bytes(),
        pause_buffer_cap: settings.pause_buffer_frames,
        stop_grace: settings.stop_grace,
    };
    tokio::spawn(pump.run(child, stdout, stderr, startup_tx, exit_tx, stop_rx, pause_rx));

    match tokio::time::timeout(settings.startup_timeout, startup_rx).await {
        Ok(Ok(Ok(()))) => Ok(SupervisorHandle::new(
            stop_tx,
            exit_rx,
            pause_tx,
            settings.stop_grace,
        )),
        Ok(Ok(Err(detail))) => Err(SupervisorError::StartupFailed(detail)),
        Ok(Err(_)) => Err(SupervisorError::StartupFailed(
            "playback pipeline task dropped".to_string(),
        )),
        Err(_) => {
            // No frame within the startup window; the pump kills the child.
            let _ = stop_tx.send(());
            Err(SupervisorError::StartupFailed(format!(
                "no audio within {:?}",
                settings.startup_timeout
            )))
        }
    }
}
