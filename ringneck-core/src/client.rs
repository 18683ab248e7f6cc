//! Client side — send one invocation, relay stdio, report the status.
//!
//! The client never touches the cache. It forwards its stdin as STDIN
//! frames, renders inbound frames onto its own stdout/stderr according
//! to the stream selection, and exits with the status byte carried by
//! the terminal EXIT frame.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::RingneckError;
use crate::frame::{CHUNK_SIZE, Frame, FrameKind};
use crate::invocation::{Request, StreamSelection};
use crate::ipc::Channel;

/// Longest total wait for an autostarted supervisor to come up.
const AUTOSTART_DEADLINE: Duration = Duration::from_secs(3);

/// Connect to the supervisor, launching one if nothing answers.
///
/// The probe-then-spawn-then-probe loop is race-free: if several
/// clients spawn supervisors at once, the losers fail to bind and exit
/// while every client's connect retry lands on the winner.
pub async fn connect_or_autostart(socket: &Path) -> Result<Channel, RingneckError> {
    if let Ok(chan) = Channel::connect(socket).await {
        return Ok(chan);
    }

    spawn_supervisor()?;
    debug!(socket = %socket.display(), "supervisor autostarted, probing");

    let deadline = tokio::time::Instant::now() + AUTOSTART_DEADLINE;
    let mut delay = Duration::from_millis(10);
    loop {
        tokio::time::sleep(delay).await;
        match Channel::connect(socket).await {
            Ok(chan) => return Ok(chan),
            Err(_) if tokio::time::Instant::now() < deadline => {
                delay = (delay * 2).min(Duration::from_millis(500));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Launch the supervisor binary, detached from this terminal.
fn spawn_supervisor() -> Result<(), RingneckError> {
    use std::os::unix::process::CommandExt;

    let sibling = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("ringneck-supervisor")));
    let program = match sibling {
        Some(path) if path.exists() => path,
        _ => PathBuf::from("ringneck-supervisor"),
    };

    std::process::Command::new(program)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .process_group(0)
        .spawn()?;
    Ok(())
}

/// Drive one session to completion and return the exit status byte.
///
/// `forward_stdin` should be set for run and replay sessions; meta
/// operations never read local stdin.
pub async fn run_session<R, W, E>(
    mut chan: Channel,
    request: Request,
    selection: StreamSelection,
    forward_stdin: bool,
    stdin: R,
    stdout: &mut W,
    stderr: &mut E,
) -> Result<u8, RingneckError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    chan.send(request.into_frame()?).await?;

    let stdin_pump = forward_stdin.then(|| {
        let sender = chan.sender();
        tokio::spawn(async move {
            let mut stdin = stdin;
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                match stdin.read(&mut buf).await {
                    Ok(0) | Err(_) => {
                        let _ = sender.send(Frame::stdin_eof()).await;
                        break;
                    }
                    Ok(n) => {
                        let chunk = Bytes::copy_from_slice(&buf[..n]);
                        if sender.send(Frame::stdin(chunk)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    });

    // Once the local stdout consumer goes away we stop writing but
    // keep draining, so the supervisor still finishes and commits the
    // run. The next identical invocation then replays the full output.
    let mut stdout_open = true;
    let mut stderr_open = true;

    let result = loop {
        let Some(frame) = chan.recv().await else {
            break Err(RingneckError::ProtocolViolation(
                "connection closed before exit frame",
            ));
        };
        match frame.kind() {
            FrameKind::Stdout if selection.shows(FrameKind::Stdout) => {
                forward(stdout, &mut stdout_open, frame.payload()).await;
            }
            FrameKind::Stderr if selection.shows(FrameKind::Stderr) => {
                forward(stderr, &mut stderr_open, frame.payload()).await;
            }
            FrameKind::Stdin if selection.shows(FrameKind::Stdin) => {
                forward(stdout, &mut stdout_open, frame.payload()).await;
            }
            FrameKind::Exit => match frame.exit_status() {
                Some(status) => break Ok(status),
                None => break Err(RingneckError::ProtocolViolation("empty exit frame")),
            },
            _ => {}
        }
    };

    if let Some(pump) = stdin_pump {
        pump.abort();
    }
    let _ = stdout.flush().await;
    let _ = stderr.flush().await;
    result
}

/// Write `bytes` unless the sink already failed; on failure (broken
/// pipe included) stop writing for the rest of the session.
async fn forward<W: AsyncWrite + Unpin>(sink: &mut W, open: &mut bool, bytes: &[u8]) {
    if !*open || bytes.is_empty() {
        return;
    }
    if let Err(e) = sink.write_all(bytes).await {
        debug!(error = %e, "local stream closed, draining rest of session");
        *open = false;
    }
}
