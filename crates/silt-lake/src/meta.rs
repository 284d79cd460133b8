//! Rows for metadata queries.

use silt_meta::{BranchConfig, CommitStore, PoolConfig, View};
use silt_storage::{DataObject, Id, Layout, Span, Value};

use crate::error::LakeResult;
use crate::planner;

/// Row describing a pool.
pub fn pool_row(config: &PoolConfig) -> Value {
    Value::record([
        ("name", Value::from(config.name.as_str())),
        ("id", Value::from(config.id.to_string())),
        ("layout", Value::from(config.layout.to_string())),
        ("seek_stride", Value::from(config.seek_stride)),
        ("threshold", Value::from(config.threshold)),
        ("created", Value::Int(config.created)),
    ])
}

/// Row describing a branch of `pool`.
pub fn branch_row(pool: &PoolConfig, branch: &BranchConfig) -> Value {
    Value::record([
        ("pool", Value::from(pool.name.as_str())),
        ("branch", Value::from(branch.name.as_str())),
        ("commit", Value::from(branch.commit.to_string())),
    ])
}

/// Row describing a data object.
pub fn object_row(object: &DataObject) -> Value {
    Value::record([
        ("id", Value::from(object.id.to_string())),
        ("min", object.min.clone()),
        ("max", object.max.clone()),
        ("count", Value::from(object.count)),
        ("size", Value::from(object.size)),
        ("created", object.created.map_or(Value::Null, Value::Int)),
    ])
}

/// Objects of `view` in pool-key order.
pub fn objects(view: &dyn View, layout: &Layout) -> Vec<Value> {
    view.select_sorted(layout).iter().map(object_row).collect()
}

/// Vector ids of `view`.
pub fn vectors(view: &dyn View) -> Vec<Value> {
    view.vector_ids()
        .into_iter()
        .map(|id| Value::record([("id", Value::from(id.to_string()))]))
        .collect()
}

/// Partitions of `view` within `span`.
pub fn partitions(view: &dyn View, layout: &Layout, span: Option<&Span>) -> Vec<Value> {
    planner::partitions(view, layout, span)
        .iter()
        .map(|p| p.to_record())
        .collect()
}

/// Every action from `tip` back to the root commit, newest commit first.
pub async fn log(commits: &CommitStore, tip: Id) -> LakeResult<Vec<Value>> {
    let mut rows = Vec::new();
    let mut reader = commits.open_commit_log(tip, Id::nil()).await?;
    while let Some(commit) = reader.next().await? {
        rows.extend(commit.actions().iter().map(|a| a.to_record()));
    }
    Ok(rows)
}
