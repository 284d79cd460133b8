#![warn(missing_docs)]

//! Silt management: the compaction planner, the branch monitor that drives
//! it, and the `silt` command-line driver.

pub mod cli;
pub mod compactor;
pub mod config;
pub mod error;
pub mod monitor;

pub use compactor::{
    compact_branch, plan_runs, Candidate, CompactionPlan, CycleReport, Policy, Run, RunBuilder,
};
pub use config::{ManageConfig, PoolOverride};
pub use error::{MgmtError, MgmtResult};
pub use monitor::{Monitor, MonitorStats};
