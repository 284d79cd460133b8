//! Compaction planning and the compaction cycle.
//!
//! A cycle reads a branch's object listing, groups the objects into runs and
//! rewrites every qualifying run into a single object. Objects left alone in
//! their run can instead be given a vector blob.

use std::collections::HashSet;
use std::time::Duration;

use silt_lake::{collect, CommitMessage, Lake, LakeError, LakeResult};
use silt_meta::PoolConfig;
use silt_storage::{compare_objects, DataObject, ErrorKind, Id, Layout, Span, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Author recorded on commits made by the compactor.
pub const COMPACTOR_AUTHOR: &str = "silt-manage";

/// What a cycle may do to a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    /// Minimum age before an object may be rewritten.
    pub cold_threshold: Duration,
    /// Build vector blobs for objects left alone in their run.
    pub vectors: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            cold_threshold: Duration::from_secs(300),
            vectors: false,
        }
    }
}

/// An object considered for compaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// The object.
    pub object: DataObject,
    /// True if the object already has a vector blob.
    pub vector: bool,
}

/// Objects grouped for rewriting into one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Run {
    /// Span of the object that started the run.
    pub anchor: Span,
    /// Total size of the members.
    pub size: u64,
    /// Members in pool-key order.
    pub objects: Vec<Candidate>,
}

impl Run {
    fn new(first: Candidate) -> Self {
        Self {
            anchor: first.object.span(),
            size: first.object.size,
            objects: vec![first],
        }
    }

    /// Member ids.
    pub fn ids(&self) -> Vec<Id> {
        self.objects.iter().map(|c| c.object.id).collect()
    }

    /// True if any two members share a key.
    ///
    /// Members are in pool-key order, so it is enough to test each one
    /// against the union of the ones before it.
    pub fn overlapping(&self, layout: &Layout) -> bool {
        let mut iter = self.objects.iter();
        let Some(first) = iter.next() else {
            return false;
        };
        let mut seen = first.object.span();
        for c in iter {
            let span = c.object.span();
            if span.overlaps(layout, &seen) {
                return true;
            }
            seen.extend(layout, &span);
        }
        false
    }
}

/// Groups objects, fed in pool-key order, into runs.
///
/// An object joins the current run if it overlaps the span of the run's
/// first object, or if the run would stay below the threshold with it.
pub struct RunBuilder {
    layout: Layout,
    threshold: u64,
    current: Option<Run>,
}

impl RunBuilder {
    /// Builder for a pool with `layout` and object size `threshold`.
    pub fn new(layout: Layout, threshold: u64) -> Self {
        Self {
            layout,
            threshold,
            current: None,
        }
    }

    /// Add the next object; returns the run it closed, if any.
    pub fn push(&mut self, candidate: Candidate) -> Option<Run> {
        match self.current.as_mut() {
            Some(run)
                if candidate.object.span().overlaps(&self.layout, &run.anchor)
                    || run.size.saturating_add(candidate.object.size) < self.threshold =>
            {
                run.size = run.size.saturating_add(candidate.object.size);
                run.objects.push(candidate);
                None
            }
            _ => self.current.replace(Run::new(candidate)),
        }
    }

    /// Close the last run.
    pub fn finish(&mut self) -> Option<Run> {
        self.current.take()
    }
}

/// Work found by one planning pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionPlan {
    /// Runs to rewrite, each with two or more objects.
    pub runs: Vec<Run>,
    /// Objects alone in their run that should get a vector blob.
    pub vectorize: Vec<Id>,
    /// Earliest time, in Unix milliseconds, at which a hot object turns cold.
    pub next_cold: Option<i64>,
}

/// Plan a cycle over `objects` as of `now_ms`.
///
/// A run is rewritten when every member is cold and its members either
/// overlap or together reach half the threshold.
pub fn plan_runs(
    mut objects: Vec<Candidate>,
    layout: &Layout,
    threshold: u64,
    policy: &Policy,
    now_ms: i64,
) -> CompactionPlan {
    objects.sort_by(|a, b| compare_objects(layout, &a.object, &b.object));
    let cold_ms = i64::try_from(policy.cold_threshold.as_millis()).unwrap_or(i64::MAX);
    let mut plan = CompactionPlan::default();

    let mut builder = RunBuilder::new(layout.clone(), threshold);
    let mut emitted = Vec::new();
    for c in objects {
        emitted.extend(builder.push(c));
    }
    emitted.extend(builder.finish());

    for run in emitted {
        let mut cold = true;
        for c in &run.objects {
            let turns_cold = c.object.age_origin_ms().saturating_add(cold_ms);
            if turns_cold > now_ms {
                cold = false;
                plan.next_cold = Some(plan.next_cold.map_or(turns_cold, |t| t.min(turns_cold)));
            }
        }
        if !cold {
            continue;
        }
        match run.objects.len() {
            0 => {}
            1 => {
                let only = &run.objects[0];
                if policy.vectors && !only.vector {
                    plan.vectorize.push(only.object.id);
                }
            }
            _ => {
                if run.overlapping(layout) || run.size >= threshold / 2 {
                    plan.runs.push(run);
                }
            }
        }
    }
    plan
}

/// Outcome of one cycle on one branch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Runs that qualified for rewriting.
    pub runs_found: usize,
    /// Objects rewritten.
    pub objects_compacted: usize,
    /// Vector blobs added.
    pub vectors_added: usize,
    /// When the next object turns cold, in Unix milliseconds.
    pub next_cold: Option<i64>,
}

fn object_from_row(row: &Value) -> LakeResult<DataObject> {
    let id = row
        .path("id")
        .as_str()
        .ok_or_else(|| LakeError::Invalid("object row without id".into()))?
        .parse()?;
    let uint = |field: &str| {
        row.path(field)
            .as_int()
            .and_then(|v| u64::try_from(v).ok())
            .ok_or_else(|| LakeError::Invalid(format!("object row without {}", field)))
    };
    Ok(DataObject {
        id,
        min: row.path("min").clone(),
        max: row.path("max").clone(),
        count: uint("count")?,
        size: uint("size")?,
        created: row.path("created").as_int(),
    })
}

async fn candidates(
    lake: &dyn Lake,
    head: &str,
    cancel: &CancellationToken,
) -> LakeResult<Vec<Candidate>> {
    let mut scan = lake.query(head, ":vectors", cancel).await?;
    let vectors: HashSet<Id> = collect(scan.as_mut())
        .await?
        .iter()
        .filter_map(|row| row.path("id").as_str().and_then(|s| s.parse().ok()))
        .collect();

    let mut scan = lake.query(head, ":objects", cancel).await?;
    collect(scan.as_mut())
        .await?
        .iter()
        .map(|row| {
            let object = object_from_row(row)?;
            let vector = vectors.contains(&object.id);
            Ok(Candidate { object, vector })
        })
        .collect()
}

fn benign(err: &LakeError) -> bool {
    matches!(err.kind(), ErrorKind::Conflict | ErrorKind::NotFound)
}

/// Run one compaction cycle on `branch` of `pool`.
///
/// A run whose objects changed underneath the cycle is skipped; the next
/// cycle will see the new state.
pub async fn compact_branch(
    lake: &dyn Lake,
    pool: &PoolConfig,
    branch: &str,
    policy: &Policy,
    cancel: &CancellationToken,
) -> LakeResult<CycleReport> {
    let head = format!("{}@{}", pool.id, branch);
    let objects = candidates(lake, &head, cancel).await?;
    let now = chrono::Utc::now().timestamp_millis();
    let plan = plan_runs(objects, &pool.layout, pool.threshold, policy, now);
    debug!(pool = %pool.name, branch, runs = plan.runs.len(), "compaction plan ready");

    let mut report = CycleReport {
        runs_found: plan.runs.len(),
        next_cold: plan.next_cold,
        ..CycleReport::default()
    };
    for run in &plan.runs {
        if cancel.is_cancelled() {
            return Err(LakeError::Cancelled);
        }
        let ids = run.ids();
        let msg = CommitMessage::new(format!("compacted {} objects", ids.len()))
            .with_author(COMPACTOR_AUTHOR);
        match lake
            .compact(pool.id, branch, &ids, policy.vectors, &msg, cancel)
            .await
        {
            Ok(commit) => {
                debug!(pool = %pool.name, branch, %commit, objects = ids.len(), "run compacted");
                report.objects_compacted += ids.len();
            }
            Err(e) if benign(&e) => {
                warn!(pool = %pool.name, branch, error = %e, "run changed during compaction, skipped");
            }
            Err(e) => return Err(e),
        }
    }

    if !plan.vectorize.is_empty() {
        let msg = CommitMessage::new(format!("vectorized {} objects", plan.vectorize.len()))
            .with_author(COMPACTOR_AUTHOR);
        match lake
            .add_vectors(pool.id, branch, &plan.vectorize, &msg, cancel)
            .await
        {
            Ok(_) => report.vectors_added = plan.vectorize.len(),
            Err(e) if benign(&e) => {
                warn!(pool = %pool.name, branch, error = %e, "objects changed during vectorization, skipped");
            }
            Err(e) => return Err(e),
        }
    }

    info!(
        pool = %pool.name,
        branch,
        runs_found = report.runs_found,
        objects_compacted = report.objects_compacted,
        vectors_added = report.vectors_added,
        "compaction cycle finished"
    );
    Ok(report)
}
