//! Supervisor daemon — binds the per-user socket and serves sessions
//! until asked to shut down.

use std::sync::Arc;

use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ringneck_core::supervisor::bind_socket;
use ringneck_core::{RingneckError, Store, Supervisor, ipc, store};

fn init_logging() {
    let filter = EnvFilter::try_from_env("RINGNECK_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    init_logging();
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let runtime_dir = ipc::runtime_dir();
    if let Err(e) = ipc::ensure_runtime_dir(&runtime_dir) {
        error!(dir = %runtime_dir.display(), error = %e, "cannot create runtime dir");
        return 1;
    }
    let socket = runtime_dir.join(ipc::SOCKET_FILE);

    let cache_dir = store::default_cache_dir();
    let store = match Store::open(&cache_dir).await {
        Ok(store) => store,
        Err(e) => {
            error!(dir = %cache_dir.display(), error = %e, "cannot open cache");
            return 1;
        }
    };

    let listener = match bind_socket(&socket).await {
        Ok(listener) => listener,
        Err(RingneckError::AlreadyRunning) => {
            info!(socket = %socket.display(), "another supervisor is already running");
            return 0;
        }
        Err(e) => {
            error!(socket = %socket.display(), error = %e, "cannot bind socket");
            return 1;
        }
    };
    info!(
        socket = %socket.display(),
        cache = %cache_dir.display(),
        "supervisor listening"
    );

    let supervisor = Arc::new(Supervisor::new(store));
    let shutdown = supervisor.shutdown_token();
    tokio::spawn(async move {
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => return,
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
        info!("signal received, shutting down");
        shutdown.cancel();
    });

    let code = match supervisor.serve(listener).await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "supervisor failed");
            1
        }
    };
    let _ = std::fs::remove_file(&socket);
    code
}
