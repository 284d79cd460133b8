#![warn(missing_docs)]

//! Silt metadata subsystem: commit objects, the commit log store, snapshots
//! and patches, and the journaled pool/branch registries.

pub mod actions;
pub mod entries;
pub mod error;
pub mod journal;
pub mod object;
pub mod patch;
pub mod registry;
pub mod snapshot;
pub mod store;

pub use actions::{Action, CommitHeader};
pub use entries::{BranchConfig, PoolConfig, DEFAULT_THRESHOLD, MAIN_BRANCH};
pub use error::{MetaError, MetaResult};
pub use journal::{Position, Queue, MAX_COMMIT_RETRIES};
pub use object::{CommitObject, DEFAULT_AUTHOR};
pub use patch::Patch;
pub use registry::{Entry, Registry, Update, SNAPSHOT_INTERVAL};
pub use snapshot::{Snapshot, View};
pub use store::{CommitLogReader, CommitStore};
