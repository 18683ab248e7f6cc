//! # ringneck-core
//!
//! Core library for the ringneck memoizing command runner.
//!
//! This crate contains:
//! - **Frames**: `Frame`, `FrameKind` — the tagged, length-prefixed
//!   units multiplexing stdin/stdout/stderr/exit over one socket
//! - **Codec**: `FrameCodec` for framed socket I/O via `tokio_util`
//! - **IPC**: `Channel` — managed duplex frame channel with keep-alive
//! - **Invocation**: `Request` payloads and the `StreamSelection` set
//! - **Keys**: `CacheKey` — MD5 content fingerprint of an argv vector
//! - **Store**: content-addressed run cache plus the history log
//! - **Executor**: child spawning, live mirroring and capture
//! - **Supervisor**: session dispatch, single-flight, graceful shutdown
//! - **Client**: stdio relay and supervisor autostart
//! - **Error**: `RingneckError` — typed, `thiserror`-based hierarchy

pub mod client;
pub mod codec;
pub mod error;
pub mod executor;
pub mod frame;
pub mod invocation;
pub mod ipc;
pub mod key;
pub mod store;
pub mod supervisor;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use codec::FrameCodec;
pub use error::RingneckError;
pub use executor::CapturedRun;
pub use frame::{CHUNK_SIZE, Frame, FrameKind, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use invocation::{Request, StreamSelection};
pub use ipc::{Channel, FrameReceiver, FrameSender};
pub use key::CacheKey;
pub use store::{HistoryEntry, Store};
pub use supervisor::Supervisor;
