//! Invocation payloads — what a client asks the supervisor to do.
//!
//! # Wire protocol
//!
//! ```text
//! Client ──[INVOKE]──────────────────────────► Supervisor
//!   Payload: Request (bincode)
//!
//! Client ──[STDIN]───────────────────────────► Supervisor   (repeated)
//!   Payload: raw stdin bytes; empty payload = end of stdin
//!
//! Supervisor ──[STDOUT | STDERR | STDIN]─────► Client       (repeated)
//!   Payload: captured or replayed stream bytes
//!
//! Supervisor ──[EXIT]────────────────────────► Client       (terminal)
//!   Payload: one status byte
//! ```
//!
//! Output is streamed chunk by chunk so the client renders partial
//! results immediately, and so a replay is byte-identical to the live
//! run it was captured from.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::RingneckError;
use crate::frame::{Frame, FrameKind};

/// Request payload carried by the INVOKE frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Request {
    /// Run `argv`, consulting the cache unless `force` is set.
    Run {
        argv: Vec<String>,
        force: bool,
        record_stdin: bool,
    },
    /// Replay the run stored under a user-supplied hex key.
    ///
    /// The key is sent as raw text; the supervisor parses it so that a
    /// malformed key and an absent key fail the same way.
    Replay { key: String },
    /// Return the history log, one STDOUT line per committed run.
    History,
    /// Drop every stored run and clear the history log.
    Forget,
    /// Finish in-flight sessions, then terminate the supervisor.
    Shutdown,
}

impl Request {
    pub fn to_bytes(&self) -> Result<Vec<u8>, RingneckError> {
        bincode::serialize(self).map_err(|e| RingneckError::Encoding(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RingneckError> {
        bincode::deserialize(bytes).map_err(|e| RingneckError::Encoding(e.to_string()))
    }

    /// Build the INVOKE frame carrying this request.
    pub fn into_frame(self) -> Result<Frame, RingneckError> {
        Ok(Frame::invoke(self.to_bytes()?))
    }

    /// Parse a request out of a session's first frame.
    pub fn from_frame(frame: &Frame) -> Result<Self, RingneckError> {
        if frame.kind() != FrameKind::Invoke {
            return Err(RingneckError::ProtocolViolation(
                "session must open with an invocation frame",
            ));
        }
        Self::from_bytes(frame.payload())
    }
}

bitflags! {
    /// Which streams the client renders locally.
    ///
    /// Naming any stream on the command line replaces the default
    /// {stdout, stderr} set with exactly the named streams. Selected
    /// STDIN frames are mirrored to the client's stdout.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StreamSelection: u8 {
        const STDOUT = 1 << 0;
        const STDERR = 1 << 1;
        const STDIN = 1 << 2;
    }
}

impl StreamSelection {
    /// Resolve the `--stdout` / `--stderr` / `--stdin` flag set.
    pub fn from_flags(stdout: bool, stderr: bool, stdin: bool) -> Self {
        let mut sel = StreamSelection::empty();
        if stdout {
            sel |= StreamSelection::STDOUT;
        }
        if stderr {
            sel |= StreamSelection::STDERR;
        }
        if stdin {
            sel |= StreamSelection::STDIN;
        }
        if sel.is_empty() {
            StreamSelection::STDOUT | StreamSelection::STDERR
        } else {
            sel
        }
    }

    /// Whether frames of `kind` should be rendered.
    pub fn shows(self, kind: FrameKind) -> bool {
        match kind {
            FrameKind::Stdout => self.contains(StreamSelection::STDOUT),
            FrameKind::Stderr => self.contains(StreamSelection::STDERR),
            FrameKind::Stdin => self.contains(StreamSelection::STDIN),
            _ => false,
        }
    }
}
