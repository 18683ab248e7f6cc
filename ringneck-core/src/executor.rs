//! Child execution — spawn, pump, capture.
//!
//! The executor proxies the child's stdout and stderr to the client
//! while appending the very same frames to an in-memory staging buffer.
//! Whatever the client saw live is exactly what a later replay will
//! stream: nothing is reordered, coalesced or dropped between capture
//! and replay.

use std::process::Stdio;
use std::time::Duration;

use bytes::Bytes;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::RingneckError;
use crate::frame::{CHUNK_SIZE, Frame};
use crate::ipc::FrameSender;

/// How long a cancelled child gets to honor SIGTERM before SIGKILL.
const KILL_GRACE: Duration = Duration::from_millis(200);

/// The captured frames of one completed execution.
#[derive(Debug)]
pub struct CapturedRun {
    /// Ordered frames, ending with the single EXIT frame.
    pub frames: Vec<Frame>,
    /// The child's exit status byte.
    pub status: u8,
}

/// Run `argv`, streaming frames to `sink` and capturing them.
///
/// `stdin_rx` carries stdin chunks from the client; an empty chunk
/// closes the child's stdin. Chunks are always forwarded to the child;
/// `record_stdin` additionally echoes them to the client and into the
/// capture so a replay can reproduce the interleaving.
///
/// Cancelling `cancel` kills the child's process group and discards the
/// staging buffer.
pub async fn run_command(
    argv: &[String],
    record_stdin: bool,
    sink: FrameSender,
    stdin_rx: &mut mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) -> Result<CapturedRun, RingneckError> {
    let (program, args) = argv
        .split_first()
        .ok_or(RingneckError::ProtocolViolation("empty argv"))?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| RingneckError::Spawn {
            command: program.clone(),
            source: e,
        })?;

    let stdin_pipe = child
        .stdin
        .take()
        .ok_or(RingneckError::Other("child stdin pipe missing".into()))?;
    let mut stdout_pipe = child
        .stdout
        .take()
        .ok_or(RingneckError::Other("child stdout pipe missing".into()))?;
    let mut stderr_pipe = child
        .stderr
        .take()
        .ok_or(RingneckError::Other("child stderr pipe missing".into()))?;

    // Writes to the child's stdin happen on their own task so a child
    // that stalls reading stdin can never block the output pumps.
    let (pipe_tx, pipe_rx) = mpsc::unbounded_channel::<Bytes>();
    let stdin_writer = tokio::spawn(feed_child_stdin(stdin_pipe, pipe_rx));

    let mut staging: Vec<Frame> = Vec::new();
    let mut out_buf = vec![0u8; CHUNK_SIZE];
    let mut err_buf = vec![0u8; CHUNK_SIZE];
    let mut stdout_done = false;
    let mut stderr_done = false;
    let mut client_stdin_open = true;

    while !(stdout_done && stderr_done) {
        tokio::select! {
            _ = cancel.cancelled() => {
                kill_child(&mut child).await;
                stdin_writer.abort();
                return Err(RingneckError::Cancelled);
            }

            read = stdout_pipe.read(&mut out_buf), if !stdout_done => match read {
                Ok(0) => stdout_done = true,
                Ok(n) => {
                    let frame = Frame::stdout(Bytes::copy_from_slice(&out_buf[..n]));
                    if sink.send(frame.clone()).await.is_err() {
                        kill_child(&mut child).await;
                        stdin_writer.abort();
                        return Err(RingneckError::Cancelled);
                    }
                    staging.push(frame);
                }
                Err(e) => {
                    stdin_writer.abort();
                    return Err(e.into());
                }
            },

            read = stderr_pipe.read(&mut err_buf), if !stderr_done => match read {
                Ok(0) => stderr_done = true,
                Ok(n) => {
                    let frame = Frame::stderr(Bytes::copy_from_slice(&err_buf[..n]));
                    if sink.send(frame.clone()).await.is_err() {
                        kill_child(&mut child).await;
                        stdin_writer.abort();
                        return Err(RingneckError::Cancelled);
                    }
                    staging.push(frame);
                }
                Err(e) => {
                    stdin_writer.abort();
                    return Err(e.into());
                }
            },

            chunk = stdin_rx.recv(), if client_stdin_open => match chunk {
                Some(bytes) if bytes.is_empty() => {
                    client_stdin_open = false;
                    let _ = pipe_tx.send(Bytes::new());
                }
                Some(bytes) => {
                    let _ = pipe_tx.send(bytes.clone());
                    if record_stdin {
                        let frame = Frame::stdin(bytes);
                        if sink.send(frame.clone()).await.is_err() {
                            kill_child(&mut child).await;
                            stdin_writer.abort();
                            return Err(RingneckError::Cancelled);
                        }
                        staging.push(frame);
                    }
                }
                None => client_stdin_open = false,
            },
        }
    }

    drop(pipe_tx);

    let status = match wait_or_cancel(&mut child, &cancel).await {
        Some(status) => status?,
        None => {
            kill_child(&mut child).await;
            stdin_writer.abort();
            return Err(RingneckError::Cancelled);
        }
    };
    stdin_writer.abort();

    let status_byte = status.code().map_or(1, |c| (c & 0xff) as u8);
    debug!(status = status_byte, "child exited");

    // The terminal frame is staged here but sent by the session once
    // the run is committed, so a client that has seen EXIT can rely on
    // the cache and history already holding the run.
    staging.push(Frame::exit(status_byte));

    Ok(CapturedRun {
        frames: staging,
        status: status_byte,
    })
}

/// Drain stdin chunks into the child. An empty chunk, channel closure
/// or write failure each close the pipe, which the child sees as EOF.
async fn feed_child_stdin(pipe: ChildStdin, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    let mut pipe = Some(pipe);
    while let Some(chunk) = rx.recv().await {
        if chunk.is_empty() {
            pipe = None;
            continue;
        }
        if let Some(w) = pipe.as_mut() {
            if w.write_all(&chunk).await.is_err() {
                // Child stopped reading; keep draining so the queue
                // never backs up into the session.
                pipe = None;
            }
        }
    }
}

/// Wait for the child; `None` means the session was cancelled first.
async fn wait_or_cancel(
    child: &mut Child,
    cancel: &CancellationToken,
) -> Option<std::io::Result<std::process::ExitStatus>> {
    tokio::select! {
        status = child.wait() => Some(status),
        _ = cancel.cancelled() => None,
    }
}

/// SIGTERM the child's process group, then SIGKILL after a short grace.
async fn kill_child(child: &mut Child) {
    let Some(pid) = child.id() else {
        // Already reaped.
        return;
    };
    let pgid = Pid::from_raw(pid as i32);
    if let Err(e) = killpg(pgid, Signal::SIGTERM) {
        warn!(pid, error = %e, "failed to signal child");
    }
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        let _ = killpg(pgid, Signal::SIGKILL);
        let _ = child.wait().await;
    }
}
