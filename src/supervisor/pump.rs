//! PCM pump task: child stdout into fixed-size frames into the transport.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::ExitOutcome;
use crate::ChatId;
use crate::transport::{AudioFrame, VoiceTransport};

/// Lines of child stderr kept for failure diagnostics.
const STDERR_TAIL_LINES: usize = 8;

pub(crate) struct Pump {
    pub chat_id: ChatId,
    pub transport: Arc<dyn VoiceTransport>,
    pub frame_bytes: usize,
    pub pause_buffer_cap: usize,
    pub stop_grace: Duration,
}

/// Why the delivery loop ended. Killing and reaping happen after the loop so
/// the stderr tail is consumed in exactly one place.
enum PumpEnd {
    Stopped,
    TransportClosed(String),
    ReadError(String),
    SourceDone,
}

impl Pump {
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn run(
        self,
        mut child: Child,
        stdout: ChildStdout,
        stderr: Option<ChildStderr>,
        startup_tx: oneshot::Sender<Result<(), String>>,
        exit_tx: oneshot::Sender<ExitOutcome>,
        mut stop_rx: oneshot::Receiver<()>,
        mut pause_rx: watch::Receiver<bool>,
    ) {
        let tail_task = stderr.map(|s| tokio::spawn(collect_stderr_tail(s)));
        let mut reader = BufReader::new(stdout);
        let mut pending: Vec<u8> = Vec::with_capacity(self.frame_bytes);

        // Startup: the pipeline is healthy once the first full frame arrives.
        let got_first = tokio::select! {
            res = fill_frame(&mut reader, &mut pending, self.frame_bytes) => res,
            _ = &mut stop_rx => {
                graceful_kill(&mut child, self.stop_grace).await;
                let _ = exit_tx.send(ExitOutcome::Stopped);
                return;
            }
        };
        match got_first {
            Ok(true) => {}
            Ok(false) => {
                let code = reap(&mut child).await;
                let tail = take_tail(tail_task).await;
                let _ = startup_tx.send(Err(format!(
                    "exited with code {code} before producing audio: {tail}"
                )));
                return;
            }
            Err(e) => {
                graceful_kill(&mut child, self.stop_grace).await;
                let tail = take_tail(tail_task).await;
                let _ = startup_tx.send(Err(format!("stdout read failed: {e}: {tail}")));
                return;
            }
        }
        let first = std::mem::replace(&mut pending, Vec::with_capacity(self.frame_bytes));
        if startup_tx.send(Ok(())).is_err() {
            // Caller gave up on startup; nothing is listening anymore.
            graceful_kill(&mut child, self.stop_grace).await;
            return;
        }

        let mut buffer: VecDeque<AudioFrame> = VecDeque::new();
        buffer.push_back(AudioFrame { pcm: first });
        let mut source_done = false;

        let end = loop {
            if *pause_rx.borrow() {
                if source_done || buffer.len() >= self.pause_buffer_cap {
                    // Buffer full: stop reading and let the pipe stall the child.
                    tokio::select! {
                        _ = &mut stop_rx => break PumpEnd::Stopped,
                        changed = pause_rx.changed() => {
                            if changed.is_err() {
                                break PumpEnd::Stopped;
                            }
                        }
                    }
                } else {
                    // Delivery is gated but decoding continues into the
                    // bounded buffer so resume is instantaneous.
                    tokio::select! {
                        _ = &mut stop_rx => break PumpEnd::Stopped,
                        changed = pause_rx.changed() => {
                            if changed.is_err() {
                                break PumpEnd::Stopped;
                            }
                        }
                        res = fill_frame(&mut reader, &mut pending, self.frame_bytes) => {
                            match res {
                                Ok(true) => {
                                    let pcm = std::mem::replace(
                                        &mut pending,
                                        Vec::with_capacity(self.frame_bytes),
                                    );
                                    buffer.push_back(AudioFrame { pcm });
                                }
                                // trailing partial frame is dropped
                                Ok(false) => source_done = true,
                                Err(e) => break PumpEnd::ReadError(e.to_string()),
                            }
                        }
                    }
                }
            } else if let Some(frame) = buffer.pop_front() {
                tokio::select! {
                    _ = &mut stop_rx => break PumpEnd::Stopped,
                    res = self.transport.push_frame(self.chat_id, frame) => {
                        if let Err(e) = res {
                            break PumpEnd::TransportClosed(e.to_string());
                        }
                    }
                }
            } else if source_done {
                break PumpEnd::SourceDone;
            } else {
                tokio::select! {
                    _ = &mut stop_rx => break PumpEnd::Stopped,
                    changed = pause_rx.changed() => {
                        if changed.is_err() {
                            break PumpEnd::Stopped;
                        }
                    }
                    res = fill_frame(&mut reader, &mut pending, self.frame_bytes) => {
                        match res {
                            Ok(true) => {
                                let pcm = std::mem::replace(
                                    &mut pending,
                                    Vec::with_capacity(self.frame_bytes),
                                );
                                buffer.push_back(AudioFrame { pcm });
                            }
                            Ok(false) => source_done = true,
                            Err(e) => break PumpEnd::ReadError(e.to_string()),
                        }
                    }
                }
            }
        };

        let outcome = match end {
            PumpEnd::Stopped => {
                graceful_kill(&mut child, self.stop_grace).await;
                ExitOutcome::Stopped
            }
            PumpEnd::TransportClosed(detail) => {
                warn!(chat_id = self.chat_id, %detail, "transport rejected frame, stopping pipeline");
                graceful_kill(&mut child, self.stop_grace).await;
                ExitOutcome::Failed {
                    exit_code: -1,
                    detail: format!("transport: {detail}"),
                }
            }
            PumpEnd::ReadError(detail) => {
                graceful_kill(&mut child, self.stop_grace).await;
                let tail = take_tail(tail_task).await;
                ExitOutcome::Failed {
                    exit_code: -1,
                    detail: format!("stdout read failed: {detail}: {tail}"),
                }
            }
            PumpEnd::SourceDone => {
                let code = reap(&mut child).await;
                if code == 0 {
                    ExitOutcome::Completed
                } else {
                    let tail = take_tail(tail_task).await;
                    ExitOutcome::Failed {
                        exit_code: code,
                        detail: tail,
                    }
                }
            }
        };
        let _ = exit_tx.send(outcome);
    }
}

/// Append reads into `frame` until it holds `frame_bytes`. Returns
/// `Ok(false)` on EOF. Cancel-safe: progress persists in `frame`.
async fn fill_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    frame: &mut Vec<u8>,
    frame_bytes: usize,
) -> std::io::Result<bool> {
    let mut chunk = [0u8; 4096];
    while frame.len() < frame_bytes {
        let want = (frame_bytes - frame.len()).min(chunk.len());
        let n = reader.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Ok(false);
        }
        frame.extend_from_slice(&chunk[..n]);
    }
    Ok(true)
}

/// SIGTERM, bounded wait, SIGKILL, reap.
pub(crate) async fn graceful_kill(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        // SAFETY: the pid comes from a live Child handle.
        #[cfg(unix)]
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }

        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        debug!(pid, "child ignored SIGTERM, sending SIGKILL");
    }

    let _ = child.kill().await;
    let _ = child.wait().await;
}

async fn reap(child: &mut Child) -> i32 {
    match child.wait().await {
        Ok(status) => status.code().unwrap_or(-1),
        Err(_) => -1,
    }
}

async fn collect_stderr_tail(stderr: ChildStderr) -> String {
    let mut lines = BufReader::new(stderr).lines();
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into_iter().collect::<Vec<_>>().join("\n")
}

/// Resolves once the child's stderr hits EOF, so call only after the child
/// is dead.
async fn take_tail(tail_task: Option<JoinHandle<String>>) -> String {
    match tail_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fill_frame_assembles_across_short_reads() {
        let data: Vec<u8> = (0..100u8).collect();
        let mut reader = std::io::Cursor::new(data.clone());
        let mut frame = Vec::new();
        assert!(fill_frame(&mut reader, &mut frame, 64).await.unwrap());
        assert_eq!(frame, &data[..64]);

        frame.clear();
        // only 36 bytes left: partial frame, EOF
        assert!(!fill_frame(&mut reader, &mut frame, 64).await.unwrap());
        assert_eq!(frame.len(), 36);
    }

    #[tokio::test]
    async fn fill_frame_reports_eof_on_empty_input() {
        let mut reader = std::io::Cursor::new(Vec::<u8>::new());
        let mut frame = Vec::new();
        assert!(!fill_frame(&mut reader, &mut frame, 64).await.unwrap());
        assert!(frame.is_empty());
    }
}
