//! Append-only model snapshots keyed by cumulative training frames.
//!
//! Layout: one directory per [`CheckpointScope`] under the store root, holding
//! files named by the zero-padded 9-digit frame count:
//!
//! ```text
//! checkpoint/nfsp_rainbow_pong_v2_none_50000000_7/
//!     000500000.ckpt
//!     001000000.ckpt
//! ```
//!
//! Presence of files is the only signal used to find the resume point, so a
//! scope directory must contain checkpoints and nothing else.

use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tw_types::{PreconditionError, TwResult};

pub const CHECKPOINT_EXTENSION: &str = "ckpt";
const FRAME_DIGITS: usize = 9;

/// Identity of one resumable training run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointScope {
    pub trainer_kind: String,
    pub env_id: String,
    pub buffer_size: Option<u64>,
    pub frame_budget: u64,
    pub seed: u64,
}

impl CheckpointScope {
    /// Directory name for this scope.
    pub fn dir_name(&self) -> String {
        let buffer = self
            .buffer_size
            .map(|size| size.to_string())
            .unwrap_or_else(|| "none".to_string());
        format!(
            "{}_{}_{}_{}_{}",
            self.trainer_kind, self.env_id, buffer, self.frame_budget, self.seed
        )
    }
}

impl std::fmt::Display for CheckpointScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.dir_name())
    }
}

/// File name for a frame count, e.g. `000000500.ckpt`.
pub fn checkpoint_file_name(frame: u64) -> String {
    format!("{frame:0width$}.{CHECKPOINT_EXTENSION}", width = FRAME_DIGITS)
}

/// Parse a checkpoint file name back into its frame count.
///
/// Only exact `NNNNNNNNN.ckpt` names are accepted.
pub fn parse_checkpoint_file_name(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(CHECKPOINT_EXTENSION)?.strip_suffix('.')?;
    if stem.len() != FRAME_DIGITS || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Filesystem-backed checkpoint store.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new<P: AsRef<Path>>(root: P) -> TwResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scope_dir(&self, scope: &CheckpointScope) -> PathBuf {
        self.root.join(scope.dir_name())
    }

    fn checkpoint_path(&self, scope: &CheckpointScope, frame: u64) -> PathBuf {
        self.scope_dir(scope).join(checkpoint_file_name(frame))
    }

    /// All frame keys present for the scope, ascending.
    ///
    /// A missing scope directory means no checkpoints yet. Any entry that is
    /// not a well-formed checkpoint file fails the scan.
    pub fn frames(&self, scope: &CheckpointScope) -> TwResult<Vec<u64>> {
        let dir = self.scope_dir(scope);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut frames = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let frame = name
                .to_str()
                .and_then(parse_checkpoint_file_name)
                .filter(|_| entry.path().is_file())
                .ok_or_else(|| PreconditionError::MalformedCheckpointDir {
                    scope: scope.dir_name(),
                    entry: name.to_string_lossy().into_owned(),
                })?;
            frames.push(frame);
        }
        frames.sort_unstable();
        Ok(frames)
    }

    /// Highest frame key present for the scope.
    pub fn latest(&self, scope: &CheckpointScope) -> TwResult<Option<u64>> {
        Ok(self.frames(scope)?.last().copied())
    }

    /// Write a new snapshot. Existing keys are never overwritten.
    pub fn save(&self, scope: &CheckpointScope, frame: u64, state: &[u8]) -> TwResult<()> {
        std::fs::create_dir_all(self.scope_dir(scope))?;
        let path = self.checkpoint_path(scope, frame);

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(PreconditionError::CheckpointExists {
                    scope: scope.dir_name(),
                    frame,
                }
                .into());
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(state)?;
        file.sync_all()?;

        debug!(scope = %scope, frame, bytes = state.len(), "saved checkpoint");
        Ok(())
    }

    pub fn load(&self, scope: &CheckpointScope, frame: u64) -> TwResult<Vec<u8>> {
        let path = self.checkpoint_path(scope, frame);
        match std::fs::read(&path) {
            Ok(state) => {
                info!(scope = %scope, frame, "loaded checkpoint");
                Ok(state)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(PreconditionError::CheckpointNotFound {
                scope: scope.dir_name(),
                frame,
            }
            .into()),
            Err(e) => Err(e.into()),
        }
    }
}
