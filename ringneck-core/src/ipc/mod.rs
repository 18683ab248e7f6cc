//! IPC endpoint — a lossless duplex frame channel over a Unix socket.
//!
//! `Channel` splits the framed stream into two background tasks
//! communicating over mpsc channels, which avoids holding a borrow of
//! the socket across await points and gives natural back-pressure. The
//! writer task doubles as the keep-alive ticker: whenever the outbound
//! queue is idle it emits a KEEP_ALIVE frame, so a peer stuck waiting
//! can still detect that this side died.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::codec::FrameCodec;
use crate::error::RingneckError;
use crate::frame::Frame;

/// Name of the supervisor's socket inside the runtime directory.
pub const SOCKET_FILE: &str = "supervisor.sock";

/// How often an idle writer emits a keep-alive.
const KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(1);

/// Sender half of a channel, cheaply cloneable for spawned tasks.
pub type FrameSender = mpsc::Sender<Frame>;

/// Receiver half of a channel.
pub type FrameReceiver = mpsc::Receiver<Frame>;

/// Per-user runtime directory holding the supervisor socket.
pub fn runtime_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("RINGNECK_RUNTIME_DIR") {
        return PathBuf::from(dir);
    }
    if let Some(dir) = std::env::var_os("XDG_RUNTIME_DIR") {
        return PathBuf::from(dir).join("ringneck");
    }
    let uid = nix::unistd::Uid::current().as_raw();
    PathBuf::from(format!("/tmp/ringneck-{uid}"))
}

/// Default socket path for this user.
pub fn socket_path() -> PathBuf {
    runtime_dir().join(SOCKET_FILE)
}

/// Create the runtime directory, private to the current user.
pub fn ensure_runtime_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::create_dir_all(dir)?;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
}

/// A managed frame channel to a single peer.
#[derive(Debug)]
pub struct Channel {
    /// Feed frames to the background writer.
    tx: mpsc::Sender<Frame>,
    /// Frames from the background reader.
    rx: mpsc::Receiver<Frame>,
}

impl Channel {
    /// Wrap an already-connected stream.
    pub fn new(stream: UnixStream) -> Self {
        let (mut net_writer, mut net_reader) = Framed::new(stream, FrameCodec).split();

        // User -> network
        let (user_tx, mut network_rx) = mpsc::channel::<Frame>(128);
        // Network -> user
        let (network_tx, user_rx) = mpsc::channel::<Frame>(128);

        // Writer task. Ends when every user-side sender is gone, which
        // closes our write half and lets the peer observe EOF.
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(KEEP_ALIVE_PERIOD);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    maybe = network_rx.recv() => match maybe {
                        Some(frame) => {
                            if let Err(e) = net_writer.send(frame).await {
                                debug!(error = %e, "channel write failed");
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = tick.tick() => {
                        if net_writer.send(Frame::keep_alive()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // Reader task. KEEP_ALIVE never surfaces here; the codec
        // swallows it.
        tokio::spawn(async move {
            while let Some(result) = net_reader.next().await {
                match result {
                    Ok(frame) => {
                        if network_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "channel read failed");
                        break;
                    }
                }
            }
        });

        Self {
            tx: user_tx,
            rx: user_rx,
        }
    }

    /// Connect to a supervisor socket.
    pub async fn connect(path: &Path) -> std::io::Result<Self> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self::new(stream))
    }

    /// Send a frame to the peer.
    pub async fn send(&self, frame: Frame) -> Result<(), RingneckError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| RingneckError::ChannelClosed)
    }

    /// Next frame from the peer, or `None` once it closed or failed.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Cloneable sender handle for spawned tasks.
    pub fn sender(&self) -> FrameSender {
        self.tx.clone()
    }

    /// Tear the channel into independent halves.
    pub fn split(self) -> (FrameSender, FrameReceiver) {
        (self.tx, self.rx)
    }
}
