//! Atomic checkpoint storage.
//!
//! One `execution.json` per project under the store root. Writes go to a
//! temporary sibling, are fsynced, then renamed over the target, so readers
//! (and the next process) only ever observe a complete document.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::records::ExecutionState;

/// Errors from checkpoint persistence.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// No checkpoint exists for the project -- a fresh run, not a failure.
    #[error("no checkpoint found for project {0:?}")]
    NotFound(String),

    #[error("checkpoint I/O failed at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file exists but is not a valid checkpoint. Never silently
    /// truncated -- the operator must decide what to do with it.
    #[error("checkpoint at {path} is corrupt: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize checkpoint")]
    Serialize(#[source] serde_json::Error),

    #[error("background write task failed")]
    Join(#[from] tokio::task::JoinError),
}

/// Filesystem layout and atomic-write discipline for checkpoints.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path of a project's checkpoint file.
    pub fn checkpoint_path(&self, project_id: &str) -> PathBuf {
        self.root.join(project_id).join("execution.json")
    }

    /// Whether a checkpoint file is present for the project.
    pub fn exists(&self, project_id: &str) -> bool {
        self.checkpoint_path(project_id).is_file()
    }

    /// Serialize and atomically persist the state.
    pub async fn save(&self, state: &ExecutionState) -> Result<(), StateError> {
        let mut state = state.clone();
        state.updated_at = Some(chrono::Utc::now());
        let bytes = serde_json::to_vec_pretty(&state).map_err(StateError::Serialize)?;
        let path = self.checkpoint_path(&state.project_id);

        tokio::task::spawn_blocking(move || atomic_write(&path, &bytes)).await??;
        Ok(())
    }

    /// Load a project's checkpoint. Counters are recomputed on the way in.
    pub async fn load(&self, project_id: &str) -> Result<ExecutionState, StateError> {
        let path = self.checkpoint_path(project_id);
        let project = project_id.to_string();

        let contents = tokio::task::spawn_blocking({
            let path = path.clone();
            move || std::fs::read_to_string(&path)
        })
        .await?
        .map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                StateError::NotFound(project)
            } else {
                StateError::Io {
                    path: path.clone(),
                    source,
                }
            }
        })?;

        let mut state: ExecutionState =
            serde_json::from_str(&contents).map_err(|source| StateError::Parse {
                path: path.clone(),
                source,
            })?;
        state.recount();
        Ok(state)
    }
}

/// Write bytes to `path` via a temporary file in the same directory:
/// write, fsync, rename. The target is always either the previous snapshot
/// or the new one.
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), StateError> {
    let io_err = |source| StateError::Io {
        path: path.to_path_buf(),
        source,
    };

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(io_err)?;

    let tmp_path = path.with_extension(format!("json.tmp.{}", std::process::id()));
    let result = (|| {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, path)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }
    result.map_err(io_err)
}
