#![warn(missing_docs)]

//! Silt lake: scan planning and the lake façade with its local driver,
//! remote adapter and HTTP service.

pub mod api;
pub mod branch;
pub mod error;
pub mod events;
pub mod filter;
pub mod meta;
pub mod planner;
pub mod pool;
pub mod puller;
pub mod query;
pub mod remote;
pub mod root;
pub mod scanner;
pub mod service;

pub use api::{Lake, LocalLake};
pub use branch::{Branch, CommitMessage};
pub use error::{LakeError, LakeResult};
pub use events::{Event, EventBus, EventDetail, EventKind, EventStream};
pub use filter::{Filter, KeyRange, MatchAll};
pub use planner::{partitions, Lister, Partition, Slicer};
pub use pool::Pool;
pub use puller::{collect, Batch, Progress, ProgressMeter, Puller, VecPuller};
pub use query::{Head, LakeMeta, PoolMeta, Source};
pub use remote::RemoteLake;
pub use root::Root;
pub use scanner::{SequenceScanner, DEFAULT_BATCH_SIZE};
pub use service::{router, serve, status_of};
