//! Content-addressed store of captured runs plus the history log.
//!
//! Layout under the store root:
//!
//! ```text
//! runs/<hex-key>   concatenated wire frames, identical to what the
//!                  client saw during capture
//! history          append-only lines: <hex-key>\t<command>\t<rfc3339>
//! ```
//!
//! A run is committed by writing a temporary sibling and renaming it
//! over the final name, so a reader can never observe a partial run.
//! The history line is appended only after the rename succeeds: a run
//! may briefly exist without its history line, never the reverse.

use std::path::{Path, PathBuf};

use bytes::BytesMut;
use chrono::{SecondsFormat, Utc};
use tokio::io::AsyncWriteExt;
use tokio_util::codec::Decoder;
use tracing::debug;

use crate::codec::FrameCodec;
use crate::error::RingneckError;
use crate::frame::Frame;
use crate::key::CacheKey;

const RUNS_DIR: &str = "runs";
const HISTORY_FILE: &str = "history";

/// One committed line of the history log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub key: String,
    pub command_line: String,
    pub created_at: String,
}

/// Persistent store owned exclusively by the supervisor.
#[derive(Debug)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, RingneckError> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join(RUNS_DIR)).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_path(&self, key: CacheKey) -> PathBuf {
        self.root.join(RUNS_DIR).join(key.to_hex())
    }

    fn tmp_path(&self, key: CacheKey) -> PathBuf {
        self.root.join(RUNS_DIR).join(format!(".tmp-{}", key.to_hex()))
    }

    fn history_path(&self) -> PathBuf {
        self.root.join(HISTORY_FILE)
    }

    // ── Runs ─────────────────────────────────────────────────────

    /// Fetch the frames of a stored run. A missing key is not an error.
    pub async fn get(&self, key: CacheKey) -> Result<Option<Vec<Frame>>, RingneckError> {
        match tokio::fs::read(self.run_path(key)).await {
            Ok(bytes) => Ok(Some(decode_frames(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Commit a captured run. Overwrites any prior run under the same
    /// key; last writer wins.
    pub async fn put(&self, key: CacheKey, frames: &[Frame]) -> Result<(), RingneckError> {
        let bytes = encode_frames(frames)?;
        let tmp = self.tmp_path(key);
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_data().await?;
        drop(file);
        tokio::fs::rename(&tmp, self.run_path(key)).await?;
        debug!(key = %key, bytes = bytes.len(), "run committed");
        Ok(())
    }

    // ── History ──────────────────────────────────────────────────

    /// Append one history record. Call only after a successful `put`.
    pub async fn put_history(&self, key: CacheKey, argv: &[String]) -> Result<(), RingneckError> {
        // The log is line- and tab-oriented; scrub separators out of
        // the display form.
        let command_line = argv.join(" ").replace(['\n', '\t'], " ");
        let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let line = format!("{}\t{}\t{}\n", key.to_hex(), command_line, created_at);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.history_path())
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// All history records in insertion order.
    pub async fn list_history(&self) -> Result<Vec<HistoryEntry>, RingneckError> {
        let text = match tokio::fs::read_to_string(self.history_path()).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for line in text.lines() {
            let mut fields = line.splitn(3, '\t');
            let (Some(key), Some(command_line)) = (fields.next(), fields.next()) else {
                continue;
            };
            entries.push(HistoryEntry {
                key: key.to_string(),
                command_line: command_line.to_string(),
                created_at: fields.next().unwrap_or_default().to_string(),
            });
        }
        Ok(entries)
    }

    // ── Forget ───────────────────────────────────────────────────

    /// Drop every run and clear the history log.
    ///
    /// History goes first and the runs directory is swapped out by
    /// rename, so a concurrent reader can see a run without a history
    /// line but never a history line without its run.
    pub async fn forget(&self) -> Result<(), RingneckError> {
        tokio::fs::write(self.history_path(), b"").await?;

        let runs = self.root.join(RUNS_DIR);
        let doomed = self.root.join("runs.gone");
        let _ = tokio::fs::remove_dir_all(&doomed).await;
        match tokio::fs::rename(&runs, &doomed).await {
            Ok(()) => {
                tokio::fs::create_dir_all(&runs).await?;
                let _ = tokio::fs::remove_dir_all(&doomed).await;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(&runs).await?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

/// Resolve the cache directory for a live supervisor.
pub fn default_cache_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("RINGNECK_CACHE_DIR") {
        return PathBuf::from(dir);
    }
    if let Some(dir) = std::env::var_os("XDG_CACHE_HOME") {
        return PathBuf::from(dir).join("ringneck");
    }
    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home).join(".cache").join("ringneck");
    }
    let uid = nix::unistd::Uid::current().as_raw();
    PathBuf::from(format!("/tmp/ringneck-{uid}")).join("cache")
}

/// Serialize frames exactly as they travel on the wire.
pub fn encode_frames(frames: &[Frame]) -> Result<BytesMut, RingneckError> {
    let mut buf = BytesMut::with_capacity(frames.iter().map(Frame::encoded_len).sum());
    for frame in frames {
        frame.encode_into(&mut buf)?;
    }
    Ok(buf)
}

/// Decode a complete byte buffer into frames, rejecting trailing junk.
pub fn decode_frames(bytes: &[u8]) -> Result<Vec<Frame>, RingneckError> {
    let mut codec = FrameCodec;
    let mut buf = BytesMut::from(bytes);
    let mut frames = Vec::new();
    while let Some(frame) = codec.decode(&mut buf)? {
        frames.push(frame);
    }
    while let Some(frame) = codec.decode_eof(&mut buf)? {
        frames.push(frame);
    }
    Ok(frames)
}
