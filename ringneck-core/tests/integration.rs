//! Integration tests — full client/supervisor sessions over a real
//! Unix socket, with the cache rooted in a per-test temp directory.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinHandle;

use ringneck_core::supervisor::bind_socket;
use ringneck_core::{
    CacheKey, Channel, Frame, FrameKind, Request, Store, StreamSelection, Supervisor, client,
};

const TIMEOUT: Duration = Duration::from_secs(10);

// ── Helpers ──────────────────────────────────────────────────────

struct Harness {
    _dir: TempDir,
    socket: PathBuf,
    serve_task: JoinHandle<()>,
}

async fn start_supervisor() -> Harness {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("supervisor.sock");
    let store = Store::open(dir.path().join("cache")).await.unwrap();
    let supervisor = Arc::new(Supervisor::new(store));
    let listener = bind_socket(&socket).await.unwrap();
    let serve_task = tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        async move {
            supervisor.serve(listener).await.unwrap();
        }
    });
    Harness {
        _dir: dir,
        socket,
        serve_task,
    }
}

fn run_request(argv: &[&str]) -> Request {
    Request::Run {
        argv: argv.iter().map(|a| a.to_string()).collect(),
        force: false,
        record_stdin: false,
    }
}

fn sh(script: &str) -> Vec<&str> {
    vec!["sh", "-c", script]
}

fn both_outputs() -> StreamSelection {
    StreamSelection::from_flags(false, false, false)
}

impl Harness {
    async fn connect(&self) -> Channel {
        Channel::connect(&self.socket).await.unwrap()
    }

    /// Raw session: send the request plus optional stdin and collect
    /// every frame through the terminal EXIT.
    async fn session_frames(&self, request: Request, stdin: &[u8]) -> Vec<Frame> {
        let mut chan = self.connect().await;
        chan.send(request.into_frame().unwrap()).await.unwrap();
        if !stdin.is_empty() {
            chan.send(Frame::stdin(stdin.to_vec())).await.unwrap();
        }
        chan.send(Frame::stdin_eof()).await.unwrap();

        let mut frames = Vec::new();
        loop {
            let frame = tokio::time::timeout(TIMEOUT, chan.recv())
                .await
                .expect("session timed out")
                .expect("session closed before exit frame");
            let done = frame.kind() == FrameKind::Exit;
            frames.push(frame);
            if done {
                break;
            }
        }
        frames
    }

    /// Client-level session: returns (stdout, stderr, status).
    async fn run_client(
        &self,
        request: Request,
        selection: StreamSelection,
        stdin: Vec<u8>,
    ) -> (Vec<u8>, Vec<u8>, u8) {
        let chan = self.connect().await;
        let forward_stdin = matches!(request, Request::Run { .. } | Request::Replay { .. });
        let mut out = Vec::new();
        let mut err = Vec::new();
        let status = tokio::time::timeout(
            TIMEOUT,
            client::run_session(
                chan,
                request,
                selection,
                forward_stdin,
                std::io::Cursor::new(stdin),
                &mut out,
                &mut err,
            ),
        )
        .await
        .expect("session timed out")
        .unwrap();
        (out, err, status)
    }

    async fn run(&self, argv: &[&str]) -> (String, String, u8) {
        let (out, err, status) = self
            .run_client(run_request(argv), both_outputs(), Vec::new())
            .await;
        (
            String::from_utf8(out).unwrap(),
            String::from_utf8(err).unwrap(),
            status,
        )
    }

    async fn history(&self) -> String {
        let (out, _, status) = self
            .run_client(Request::History, both_outputs(), Vec::new())
            .await;
        assert_eq!(status, 0);
        String::from_utf8(out).unwrap()
    }
}

// ── Cache semantics ──────────────────────────────────────────────

#[tokio::test]
async fn second_invocation_replays_the_first() {
    let h = start_supervisor().await;
    // The shell's own pid: two real executions could not agree.
    let argv = sh("echo $$");
    let (first, _, status) = h.run(&argv).await;
    assert_eq!(status, 0);
    assert!(!first.is_empty());
    let (second, _, status) = h.run(&argv).await;
    assert_eq!(status, 0);
    assert_eq!(first, second);
}

#[tokio::test]
async fn force_reexecutes_and_overwrites() {
    let h = start_supervisor().await;
    let argv = sh("echo $$");
    let (first, _, _) = h.run(&argv).await;

    let forced = Request::Run {
        argv: argv.iter().map(|a| a.to_string()).collect(),
        force: true,
        record_stdin: false,
    };
    let (second, _, status) = h.run_client(forced, both_outputs(), Vec::new()).await;
    let second = String::from_utf8(second).unwrap();
    assert_eq!(status, 0);
    assert_ne!(first, second);

    // A plain run now replays the forced result.
    let (third, _, _) = h.run(&argv).await;
    assert_eq!(second, third);
}

#[tokio::test]
async fn nonzero_exit_is_cached_and_replayed() {
    let h = start_supervisor().await;
    let argv = sh("printf out; printf err 1>&2; exit 7");

    let (out, err, status) = h.run(&argv).await;
    assert_eq!((out.as_str(), err.as_str(), status), ("out", "err", 7));

    let history_after_first = h.history().await;
    let (out, err, status) = h.run(&argv).await;
    assert_eq!((out.as_str(), err.as_str(), status), ("out", "err", 7));

    // The replay did not grow the history.
    assert_eq!(h.history().await, history_after_first);
}

#[tokio::test]
async fn replay_streams_identical_frames() {
    let h = start_supervisor().await;
    // Sleeps give the pipes time to deliver each write separately, so
    // the capture holds a genuine stdout/stderr interleaving.
    let argv = sh("echo o1; sleep 0.05; echo e1 1>&2; sleep 0.05; echo o2");

    let miss = h.session_frames(run_request(&argv), b"").await;
    let hit = h.session_frames(run_request(&argv), b"").await;
    assert_eq!(miss, hit);

    // Exactly one EXIT frame, last in the stream.
    assert_eq!(miss.last().unwrap().exit_status(), Some(0));
    assert_eq!(
        miss.iter().filter(|f| f.kind() == FrameKind::Exit).count(),
        1
    );

    let stdout: Vec<u8> = miss
        .iter()
        .filter(|f| f.kind() == FrameKind::Stdout)
        .flat_map(|f| f.payload().to_vec())
        .collect();
    let stderr: Vec<u8> = miss
        .iter()
        .filter(|f| f.kind() == FrameKind::Stderr)
        .flat_map(|f| f.payload().to_vec())
        .collect();
    assert_eq!(stdout, b"o1\no2\n");
    assert_eq!(stderr, b"e1\n");
}

#[tokio::test]
async fn long_output_replays_byte_identical() {
    let h = start_supervisor().await;
    let argv = ["seq", "1", "50000"];
    let expected: String = (1..=50000).map(|i| format!("{i}\n")).collect();

    let (first, _, status) = h.run(&argv).await;
    assert_eq!(status, 0);
    assert_eq!(first, expected);
    let (second, _, _) = h.run(&argv).await;
    assert_eq!(second, expected);
}

// ── Keys ─────────────────────────────────────────────────────────

#[tokio::test]
async fn key_lookup_replays_the_run() {
    let h = start_supervisor().await;
    let (expected, _, _) = h.run(&["pwd"]).await;

    let key = CacheKey::for_argv(&["pwd"]).to_hex();
    assert_eq!(key, "2a0a3031d9c37d89ab8184bd7e79a82c");

    let (out, err, status) = h
        .run_client(Request::Replay { key }, both_outputs(), Vec::new())
        .await;
    assert_eq!(status, 0);
    assert!(err.is_empty());
    assert_eq!(String::from_utf8(out).unwrap(), expected);
}

#[tokio::test]
async fn invalid_key_fails_with_exact_message() {
    let h = start_supervisor().await;
    h.run(&["pwd"]).await;

    for key in ["666", "ffffffffffffffffffffffffffffffff"] {
        let (out, err, status) = h
            .run_client(
                Request::Replay { key: key.into() },
                both_outputs(),
                Vec::new(),
            )
            .await;
        assert_eq!(status, 1);
        assert!(out.is_empty());
        assert_eq!(err, b"Invalid key");
    }
}

// ── History & forget ─────────────────────────────────────────────

#[tokio::test]
async fn history_keeps_insertion_order_and_is_idempotent() {
    let h = start_supervisor().await;
    assert_eq!(h.history().await, "");

    h.run(&sh("echo alpha")).await;
    h.run(&sh("echo beta")).await;

    let history = h.history().await;
    let lines: Vec<&str> = history.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("echo alpha"));
    assert!(lines[1].contains("echo beta"));

    // Cache hits add nothing.
    h.run(&sh("echo alpha")).await;
    assert_eq!(h.history().await, history);
}

#[tokio::test]
async fn forget_empties_history_and_invalidates_keys() {
    let h = start_supervisor().await;
    h.run(&["pwd"]).await;
    assert!(!h.history().await.is_empty());

    let (_, _, status) = h.run_client(Request::Forget, both_outputs(), Vec::new()).await;
    assert_eq!(status, 0);

    assert_eq!(h.history().await, "");
    let key = CacheKey::for_argv(&["pwd"]).to_hex();
    let (_, err, status) = h
        .run_client(Request::Replay { key }, both_outputs(), Vec::new())
        .await;
    assert_eq!(status, 1);
    assert_eq!(err, b"Invalid key");
}

#[tokio::test]
async fn spawn_failure_is_not_recorded() {
    let h = start_supervisor().await;
    let argv = ["definitely-not-a-real-binary-4a7f"];

    for _ in 0..2 {
        let (out, err, status) = h.run(&argv).await;
        assert_eq!(status, 1);
        assert!(out.is_empty());
        assert!(err.contains("failed to spawn"));
    }
    assert_eq!(h.history().await, "");
}

// ── Stdin ────────────────────────────────────────────────────────

#[tokio::test]
async fn stdin_is_forwarded_without_recording() {
    let h = start_supervisor().await;
    let (out, _, status) = h
        .run_client(run_request(&["cat"]), both_outputs(), b"1".to_vec())
        .await;
    assert_eq!(status, 0);
    assert_eq!(out, b"1");

    // The replay reproduces cat's output without touching stdin again.
    let (out, _, _) = h
        .run_client(run_request(&["cat"]), both_outputs(), b"different".to_vec())
        .await;
    assert_eq!(out, b"1");
}

#[tokio::test]
async fn recorded_stdin_is_mirrored_on_replay() {
    let h = start_supervisor().await;
    let request = Request::Run {
        argv: vec!["tr".into(), "1".into(), "a".into()],
        force: false,
        record_stdin: true,
    };

    let miss = h.session_frames(request.clone(), b"1").await;
    let key = CacheKey::for_argv(&["tr", "1", "a"]).to_hex();
    let hit = h
        .session_frames(Request::Replay { key: key.clone() }, b"")
        .await;
    assert_eq!(miss, hit);

    // Stdin-only narrowing shows the recorded input; stdout-only shows
    // the child's answer.
    let stdin_only = StreamSelection::from_flags(false, false, true);
    let (out, _, _) = h
        .run_client(
            Request::Replay { key: key.clone() },
            stdin_only,
            Vec::new(),
        )
        .await;
    assert_eq!(out, b"1");

    let stdout_only = StreamSelection::from_flags(true, false, false);
    let (out, _, _) = h
        .run_client(Request::Replay { key }, stdout_only, Vec::new())
        .await;
    assert_eq!(out, b"a");
}

// ── Broken pipe ──────────────────────────────────────────────────

/// A stdout whose consumer is gone: every write fails with EPIPE.
struct ClosedPipe;

impl tokio::io::AsyncWrite for ClosedPipe {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        _buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::task::Poll::Ready(Err(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "consumer closed",
        )))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}

#[tokio::test]
async fn broken_pipe_still_commits_the_full_run() {
    let h = start_supervisor().await;
    let argv = ["seq", "1", "5000"];

    let chan = h.connect().await;
    let mut broken = ClosedPipe;
    let mut err = Vec::new();
    let status = tokio::time::timeout(
        TIMEOUT,
        client::run_session(
            chan,
            run_request(&argv),
            both_outputs(),
            true,
            std::io::Cursor::new(Vec::new()),
            &mut broken,
            &mut err,
        ),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(status, 0);

    // The run finished and committed; the replay has everything.
    let expected: String = (1..=5000).map(|i| format!("{i}\n")).collect();
    let (out, _, _) = h.run(&argv).await;
    assert_eq!(out, expected);
}

// ── Cancellation ─────────────────────────────────────────────────

#[tokio::test]
async fn client_disconnect_kills_the_child() {
    let h = start_supervisor().await;
    let marker = format!("ringneck-cancel-{}", std::process::id());
    // Two commands keep sh from exec'ing the sleep, so the marker stays
    // visible in the shell's own command line for pgrep.
    let script = format!("sleep 30; echo {marker}");

    let chan = h.connect().await;
    chan.send(run_request(&sh(&script)).into_frame().unwrap())
        .await
        .unwrap();
    // Give the supervisor time to spawn the child, then vanish.
    tokio::time::sleep(Duration::from_millis(300)).await;
    drop(chan);
    tokio::time::sleep(Duration::from_millis(800)).await;

    if let Ok(survivors) = std::process::Command::new("pgrep")
        .args(["-f", &marker])
        .output()
    {
        assert!(
            !survivors.status.success(),
            "child survived the disconnect: {}",
            String::from_utf8_lossy(&survivors.stdout)
        );
    }
    assert_eq!(h.history().await, "");
}

// ── Single-flight ────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_identical_runs_share_one_execution() {
    let h = Arc::new(start_supervisor().await);
    let argv = sh("sleep 0.3; echo $$");

    let first = tokio::spawn({
        let h = Arc::clone(&h);
        let argv: Vec<String> = argv.iter().map(|a| a.to_string()).collect();
        async move {
            let req = Request::Run {
                argv,
                force: false,
                record_stdin: false,
            };
            h.run_client(req, both_outputs(), Vec::new()).await
        }
    });
    // Let the first session grab the flight lock before racing it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = tokio::spawn({
        let h = Arc::clone(&h);
        let argv: Vec<String> = argv.iter().map(|a| a.to_string()).collect();
        async move {
            let req = Request::Run {
                argv,
                force: false,
                record_stdin: false,
            };
            h.run_client(req, both_outputs(), Vec::new()).await
        }
    });

    let (out_a, _, status_a) = first.await.unwrap();
    let (out_b, _, status_b) = second.await.unwrap();
    assert_eq!(status_a, 0);
    assert_eq!(status_b, 0);
    assert_eq!(out_a, out_b);

    let history = h.history().await;
    assert_eq!(history.lines().count(), 1);
}

// ── Shutdown ─────────────────────────────────────────────────────

#[tokio::test]
async fn shutdown_finishes_cleanly() {
    let h = start_supervisor().await;
    h.run(&sh("echo before")).await;

    let (_, _, status) = h
        .run_client(Request::Shutdown, both_outputs(), Vec::new())
        .await;
    assert_eq!(status, 0);

    tokio::time::timeout(TIMEOUT, h.serve_task)
        .await
        .expect("supervisor did not stop")
        .unwrap();
}
