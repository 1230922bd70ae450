//! Execution state persistence -- the single on-disk record of everything
//! that happened and everything still to do.
//!
//! One pretty-printed JSON checkpoint per project. Every task completion
//! and blocker transition is flushed atomically (tmp file + fsync + rename)
//! before being acknowledged, so a crash at any point leaves either the
//! prior consistent snapshot or the new one -- never a partial file.

pub mod handle;
pub mod records;
pub mod recovery;
pub mod store;

pub use handle::StateHandle;
pub use records::{
    BlockerRecord, ExecutionState, ServiceRecord, StageKind, StageRecord, TaskRecord, TaskStatus,
};
pub use recovery::recover;
pub use store::{CheckpointStore, StateError};
