//! Query sources.
//!
//! ```text
//! source := ":pools" | ":branches"
//!         | [pool]["@" branch][":" meta] [ "range" lo hi ]
//! meta   := "branches" | "objects" | "vectors" | "partitions" | "log"
//! ```
//!
//! A missing pool or branch is taken from the head, `pool[@branch]`; a
//! branch missing from both is `main`.

use std::fmt;
use std::str::FromStr;

use silt_meta::MAIN_BRANCH;
use silt_storage::Value;

use crate::error::{LakeError, LakeResult};
use crate::filter::KeyRange;

/// Lake-wide metadata tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LakeMeta {
    /// Every pool.
    Pools,
    /// Every branch of every pool.
    Branches,
}

/// Per-pool metadata tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMeta {
    /// The pool's branches.
    Branches,
    /// Data objects visible at the branch tip, in key order.
    Objects,
    /// Vector ids visible at the branch tip.
    Vectors,
    /// Scan partitions at the branch tip.
    Partitions,
    /// Commit actions from the tip back to the root.
    Log,
}

impl PoolMeta {
    /// True if the table is read at a branch tip.
    pub fn needs_branch(&self) -> bool {
        !matches!(self, PoolMeta::Branches)
    }
}

impl FromStr for PoolMeta {
    type Err = LakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "branches" => Ok(PoolMeta::Branches),
            "objects" => Ok(PoolMeta::Objects),
            "vectors" => Ok(PoolMeta::Vectors),
            "partitions" => Ok(PoolMeta::Partitions),
            "log" => Ok(PoolMeta::Log),
            other => Err(LakeError::Query(format!("unknown metadata {:?}", other))),
        }
    }
}

impl fmt::Display for PoolMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PoolMeta::Branches => "branches",
            PoolMeta::Objects => "objects",
            PoolMeta::Vectors => "vectors",
            PoolMeta::Partitions => "partitions",
            PoolMeta::Log => "log",
        })
    }
}

/// A parsed query source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// Lake-wide metadata.
    Lake(LakeMeta),
    /// Data or metadata of one pool.
    Pool {
        /// Pool name or id.
        pool: String,
        /// Branch name.
        branch: String,
        /// Metadata table, or `None` for the pool's data.
        meta: Option<PoolMeta>,
        /// Key range narrowing the scan.
        range: Option<KeyRange>,
    },
}

/// Pool and branch a query falls back on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Head {
    /// Default pool.
    pub pool: Option<String>,
    /// Default branch.
    pub branch: Option<String>,
}

impl Head {
    /// Parse `pool[@branch]`. Empty text is an empty head.
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if text.is_empty() {
            return Self::default();
        }
        match text.split_once('@') {
            Some((pool, branch)) => Self {
                pool: non_empty(pool),
                branch: non_empty(branch),
            },
            None => Self {
                pool: Some(text.to_string()),
                branch: None,
            },
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Parse `text` against `head`.
pub fn parse(text: &str, head: &Head) -> LakeResult<Source> {
    let mut words = text.split_whitespace();
    let first = words.next();
    let (target, range_word) = match first {
        Some("range") => (None, Some("range")),
        other => (other, words.next()),
    };
    let range = match range_word {
        None => None,
        Some("range") => {
            let lo = words
                .next()
                .ok_or_else(|| LakeError::Query("range needs two bounds".into()))?;
            let hi = words
                .next()
                .ok_or_else(|| LakeError::Query("range needs two bounds".into()))?;
            Some(KeyRange::new(Value::parse_literal(lo), Value::parse_literal(hi)))
        }
        Some(other) => return Err(LakeError::Query(format!("unexpected {:?}", other))),
    };
    if let Some(extra) = words.next() {
        return Err(LakeError::Query(format!("unexpected {:?}", extra)));
    }

    let target = target.unwrap_or("");
    match target {
        ":pools" | ":branches" if range.is_some() => {
            return Err(LakeError::Query(format!("{} takes no range", target)))
        }
        ":pools" => return Ok(Source::Lake(LakeMeta::Pools)),
        ":branches" => return Ok(Source::Lake(LakeMeta::Branches)),
        _ => {}
    }

    let (path, meta) = match target.split_once(':') {
        Some((path, meta)) => (path, Some(meta.parse::<PoolMeta>()?)),
        None => (target, None),
    };
    let (pool, branch) = match path.split_once('@') {
        Some((pool, branch)) => (non_empty(pool), non_empty(branch)),
        None => (non_empty(path), None),
    };
    if meta == Some(PoolMeta::Branches) && branch.is_some() {
        return Err(LakeError::Query(format!(
            "{:?}: branches are listed per pool",
            target
        )));
    }
    if range.is_some() && matches!(meta, Some(m) if m != PoolMeta::Partitions) {
        return Err(LakeError::Query(format!("{:?} takes no range", target)));
    }
    let pool = pool
        .or_else(|| head.pool.clone())
        .ok_or_else(|| LakeError::Query(format!("{:?}: no pool named and no head", text)))?;
    let branch = branch
        .or_else(|| head.branch.clone())
        .unwrap_or_else(|| MAIN_BRANCH.to_string());
    Ok(Source::Pool {
        pool,
        branch,
        meta,
        range,
    })
}
