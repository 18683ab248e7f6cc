//! The long-lived supervisor: owns the cache, spawns children, serves
//! client sessions over the Unix socket.
//!
//! Sessions are independent tasks on the runtime; per-session failures
//! are logged and never take the supervisor down. Concurrent requests
//! for the same key are single-flighted: the first session executes,
//! later ones wait on the per-key lock and then replay the committed
//! run, so every client observes the same frame stream.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RingneckError;
use crate::executor;
use crate::frame::{Frame, FrameKind};
use crate::invocation::Request;
use crate::ipc::{Channel, FrameReceiver, FrameSender};
use crate::key::CacheKey;
use crate::store::Store;

pub struct Supervisor {
    store: Store,
    flights: Mutex<HashMap<CacheKey, Arc<Mutex<()>>>>,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            flights: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that, once cancelled, stops the accept loop.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept sessions until shutdown, then drain the in-flight ones.
    pub async fn serve(self: Arc<Self>, listener: UnixListener) -> Result<(), RingneckError> {
        let mut sessions: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let supervisor = Arc::clone(&self);
                        sessions.spawn(async move {
                            if let Err(e) = supervisor.handle_session(stream).await {
                                warn!(error = %e, "session failed");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }
        info!(in_flight = sessions.len(), "shutting down");
        while sessions.join_next().await.is_some() {}
        Ok(())
    }

    async fn handle_session(&self, stream: UnixStream) -> Result<(), RingneckError> {
        let mut chan = Channel::new(stream);
        let first = chan
            .recv()
            .await
            .ok_or(RingneckError::ProtocolViolation(
                "connection closed before invocation",
            ))?;
        let request = Request::from_frame(&first)?;
        debug!(?request, "session opened");

        match request {
            Request::Run {
                argv,
                force,
                record_stdin,
            } => self.handle_run(chan, argv, force, record_stdin).await,
            Request::Replay { key } => self.handle_replay(chan, &key).await,
            Request::History => self.handle_history(chan).await,
            Request::Forget => {
                self.store.forget().await?;
                chan.send(Frame::exit(0)).await
            }
            Request::Shutdown => {
                chan.send(Frame::exit(0)).await?;
                info!("shutdown requested");
                self.shutdown.cancel();
                Ok(())
            }
        }
    }

    // ── Run ──────────────────────────────────────────────────────

    async fn handle_run(
        &self,
        chan: Channel,
        argv: Vec<String>,
        force: bool,
        record_stdin: bool,
    ) -> Result<(), RingneckError> {
        if argv.is_empty() {
            return Err(RingneckError::ProtocolViolation("empty argv"));
        }
        let key = CacheKey::for_argv(&argv);

        let flight = self.flight_lock(key).await;
        let guard = flight.lock().await;

        let result = if force {
            self.execute(chan, key, &argv, record_stdin).await
        } else {
            match self.store.get(key).await {
                Ok(Some(frames)) => {
                    debug!(key = %key, "cache hit");
                    let (sink, _rx) = chan.split();
                    replay_frames(&sink, frames).await
                }
                Ok(None) => self.execute(chan, key, &argv, record_stdin).await,
                Err(e) => Err(e),
            }
        };

        drop(guard);
        self.release_flight(key).await;
        result
    }

    async fn execute(
        &self,
        chan: Channel,
        key: CacheKey,
        argv: &[String],
        record_stdin: bool,
    ) -> Result<(), RingneckError> {
        debug!(key = %key, ?argv, "executing");
        let (sink, from_client) = chan.split();
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Bytes>(16);
        let cancel = CancellationToken::new();
        let pump = tokio::spawn(pump_client(from_client, stdin_tx, cancel.clone()));

        let result =
            executor::run_command(argv, record_stdin, sink.clone(), &mut stdin_rx, cancel).await;
        pump.abort();

        match result {
            Ok(run) => {
                // The client saw every output frame live; a failed
                // commit only costs us the cache entry and its history
                // line, so the child's status still goes out.
                if let Err(e) = self.commit(key, argv, &run.frames).await {
                    warn!(key = %key, error = %e, "commit failed");
                }
                sink.send(Frame::exit(run.status)).await?;
                Ok(())
            }
            Err(RingneckError::Spawn { command, source }) => {
                let message = format!("ringneck: failed to spawn {command}: {source}\n");
                sink.send(Frame::stderr(message.into_bytes())).await?;
                sink.send(Frame::exit(1)).await?;
                Ok(())
            }
            Err(RingneckError::Cancelled) => {
                info!(key = %key, "client went away, child killed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn commit(
        &self,
        key: CacheKey,
        argv: &[String],
        frames: &[Frame],
    ) -> Result<(), RingneckError> {
        self.store.put(key, frames).await?;
        self.store.put_history(key, argv).await
    }

    // ── Replay ───────────────────────────────────────────────────

    async fn handle_replay(&self, chan: Channel, key_text: &str) -> Result<(), RingneckError> {
        let (sink, _rx) = chan.split();
        let stored = match CacheKey::parse(key_text) {
            Ok(key) => self.store.get(key).await?,
            Err(_) => None,
        };
        match stored {
            Some(frames) => replay_frames(&sink, frames).await,
            None => {
                sink.send(Frame::stderr(Bytes::from_static(b"Invalid key")))
                    .await?;
                sink.send(Frame::exit(1)).await?;
                Ok(())
            }
        }
    }

    // ── History ──────────────────────────────────────────────────

    async fn handle_history(&self, chan: Channel) -> Result<(), RingneckError> {
        let entries = self.store.list_history().await?;
        let mut listing = String::new();
        for entry in &entries {
            listing.push_str(&entry.key);
            listing.push_str("  ");
            listing.push_str(&entry.command_line);
            listing.push('\n');
        }
        if !listing.is_empty() {
            // A long history can exceed one frame's worth of payload.
            for frame in Frame::chunked(FrameKind::Stdout, Bytes::from(listing.into_bytes())) {
                chan.send(frame).await?;
            }
        }
        chan.send(Frame::exit(0)).await
    }

    // ── Single-flight bookkeeping ────────────────────────────────

    async fn flight_lock(&self, key: CacheKey) -> Arc<Mutex<()>> {
        let mut flights = self.flights.lock().await;
        Arc::clone(flights.entry(key).or_default())
    }

    async fn release_flight(&self, key: CacheKey) {
        let mut flights = self.flights.lock().await;
        if let Some(lock) = flights.get(&key) {
            // Two strong refs mean only the map and we hold it.
            if Arc::strong_count(lock) <= 2 {
                flights.remove(&key);
            }
        }
    }
}

/// Stream a stored run back to the client verbatim.
async fn replay_frames(sink: &FrameSender, frames: Vec<Frame>) -> Result<(), RingneckError> {
    for frame in frames {
        sink.send(frame).await?;
    }
    Ok(())
}

/// Feed client STDIN frames to the executor; a disconnect before the
/// EXIT frame cancels the run.
async fn pump_client(
    mut from_client: FrameReceiver,
    stdin_tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) {
    loop {
        match from_client.recv().await {
            Some(frame) if frame.kind() == FrameKind::Stdin => {
                if stdin_tx.send(frame.into_payload()).await.is_err() {
                    break;
                }
            }
            Some(_) => {}
            None => {
                cancel.cancel();
                break;
            }
        }
    }
}

/// Bind the supervisor socket, handling stale files from crashed
/// supervisors and losing gracefully when another one is alive.
pub async fn bind_socket(path: &Path) -> Result<UnixListener, RingneckError> {
    match UnixListener::bind(path) {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            if UnixStream::connect(path).await.is_ok() {
                return Err(RingneckError::AlreadyRunning);
            }
            tokio::fs::remove_file(path).await?;
            Ok(UnixListener::bind(path)?)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn bind_replaces_stale_socket() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sup.sock");
        let first = bind_socket(&path).await.unwrap();
        drop(first);
        // The socket file lingers after the listener is gone.
        assert!(path.exists());
        let second = bind_socket(&path).await.unwrap();
        drop(second);
    }

    #[tokio::test]
    async fn bind_detects_live_supervisor() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sup.sock");
        let _alive = bind_socket(&path).await.unwrap();
        let err = bind_socket(&path).await.unwrap_err();
        assert!(matches!(err, RingneckError::AlreadyRunning));
    }

    #[tokio::test]
    async fn flight_locks_are_reclaimed() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("cache")).await.unwrap();
        let supervisor = Supervisor::new(store);
        let key = CacheKey::for_argv(&["sample"]);

        let lock = supervisor.flight_lock(key).await;
        assert_eq!(supervisor.flights.lock().await.len(), 1);
        drop(lock);
        supervisor.release_flight(key).await;
        assert!(supervisor.flights.lock().await.is_empty());
    }
}
