//! Branch operations. Every write builds a patch against the branch tip and
//! publishes it with a compare-and-swap on the branch registry entry.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use silt_meta::{MetaError, Patch, View, DEFAULT_AUTHOR, MAX_COMMIT_RETRIES};
use silt_storage::{read_object, DataObject, Id, ObjectWriter, Value, VectorObject};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{LakeError, LakeResult};
use crate::filter::{Filter, MatchAll};
use crate::planner::Lister;
use crate::pool::Pool;
use crate::puller::{collect, Puller};
use crate::scanner::SequenceScanner;

/// Author and message recorded in a commit header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitMessage {
    /// Free-form author.
    pub author: String,
    /// Commit message.
    pub message: String,
}

impl CommitMessage {
    /// Message attributed to the default author.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            author: DEFAULT_AUTHOR.to_string(),
            message: message.into(),
        }
    }

    /// Replace the author.
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }
}

impl Default for CommitMessage {
    fn default() -> Self {
        Self::new("")
    }
}

/// Handle on one branch of an open pool.
#[derive(Clone)]
pub struct Branch {
    pool: Arc<Pool>,
    name: String,
}

impl Branch {
    /// Open branch `name`; `NotFound` if it does not exist.
    pub async fn open(pool: Arc<Pool>, name: &str) -> LakeResult<Self> {
        pool.lookup_branch(name).await?;
        Ok(Self {
            pool,
            name: name.to_string(),
        })
    }

    /// Branch name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning pool.
    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Current tip; nil for a branch with no commits.
    pub async fn tip(&self) -> LakeResult<Id> {
        Ok(self.pool.lookup_branch(&self.name).await?.commit)
    }

    /// Tip and the snapshot at it.
    pub async fn snapshot(&self) -> LakeResult<(Id, Arc<dyn View>)> {
        let tip = self.tip().await?;
        Ok((tip, self.pool.snapshot(tip).await?))
    }

    /// Publish `patch`, built against `parent`, as the new tip.
    ///
    /// When another writer moves the tip first, the patch is replayed on the
    /// new tip and retried. A concurrent commit that deleted an object this
    /// patch also deletes, or any other replay failure, is a `Conflict`.
    pub async fn commit_patch(
        &self,
        mut patch: Patch,
        mut parent: Id,
        msg: &CommitMessage,
    ) -> LakeResult<Id> {
        let commits = self.pool.commits();
        for retries in 0..MAX_COMMIT_RETRIES as u8 {
            let commit = patch.new_commit(parent, retries, &msg.author, &msg.message)?;
            let id = commit.id();
            commits.put(commit).await?;
            match self.pool.update_branch(&self.name, id, parent).await {
                Ok(()) => {
                    info!(
                        pool = %self.pool.id(),
                        branch = %self.name,
                        commit = %id,
                        parent = %parent,
                        retries,
                        "branch committed"
                    );
                    return Ok(id);
                }
                Err(LakeError::Meta(MetaError::Constraint(_))) => {
                    self.discard(id).await;
                    let tip = self.tip().await?;
                    debug!(branch = %self.name, stale = %parent, tip = %tip, "tip moved, rebasing");
                    let concurrent = commits.patch_of_path(parent, tip).await?;
                    let overlap = patch.overlapping_deletes(&concurrent);
                    if !overlap.is_empty() {
                        return Err(LakeError::conflict(format!(
                            "objects {} deleted by a concurrent commit",
                            join_ids(&overlap)
                        )));
                    }
                    let base = self.pool.snapshot(tip).await?;
                    patch = patch.rebase(base).map_err(|e| match e {
                        MetaError::WriteConflict(msg) => LakeError::conflict(msg),
                        other => other.into(),
                    })?;
                    parent = tip;
                }
                Err(e) => {
                    self.discard(id).await;
                    return Err(e);
                }
            }
        }
        Err(LakeError::conflict(format!(
            "branch {:?}: gave up after {} attempts",
            self.name, MAX_COMMIT_RETRIES
        )))
    }

    async fn discard(&self, commit: Id) {
        if let Err(e) = self.pool.commits().remove(commit).await {
            warn!(commit = %commit, error = %e, "failed to remove orphaned commit");
        }
    }

    /// Write sorted `records` as data objects. With `split`, a new object
    /// starts whenever the current one reaches the pool threshold.
    async fn write_objects(
        &self,
        records: &[Value],
        split: bool,
        cancel: &CancellationToken,
    ) -> LakeResult<Vec<DataObject>> {
        let pool = &self.pool;
        let mut objects = Vec::new();
        let mut writer: Option<ObjectWriter> = None;
        for record in records {
            if cancel.is_cancelled() {
                if let Some(w) = writer.as_mut() {
                    w.abort();
                }
                return Err(LakeError::Cancelled);
            }
            let w = writer.get_or_insert_with(|| {
                ObjectWriter::new(
                    pool.store().clone(),
                    pool.data_dir().clone(),
                    pool.layout().clone(),
                    pool.seek_stride(),
                )
            });
            w.write(record)?;
            if split && w.bytes_written() >= pool.threshold() {
                if let Some(full) = writer.take() {
                    objects.push(full.close().await?);
                }
            }
        }
        if let Some(last) = writer.take() {
            objects.push(last.close().await?);
        }
        Ok(objects)
    }

    /// Load every value `input` produces as new data objects in one commit.
    pub async fn load(
        &self,
        input: &mut dyn Puller,
        msg: &CommitMessage,
        cancel: &CancellationToken,
    ) -> LakeResult<Id> {
        let mut records = collect(input).await?;
        if records.is_empty() {
            return Err(MetaError::EmptyTransaction.into());
        }
        let layout = self.pool.layout().clone();
        records.sort_by(|a, b| layout.compare_records(a, b));
        let (tip, base) = self.snapshot().await?;
        let objects = self.write_objects(&records, true, cancel).await?;
        debug!(branch = %self.name, records = records.len(), objects = objects.len(), "load written");
        let mut patch = Patch::new(base);
        for object in objects {
            patch.add_object(object)?;
        }
        self.commit_patch(patch, tip, msg).await
    }

    /// Delete objects by id. `NotFound` if any is not in the tip.
    pub async fn delete(&self, ids: &[Id], msg: &CommitMessage) -> LakeResult<Id> {
        let (tip, base) = self.snapshot().await?;
        let mut patch = Patch::new(base);
        for id in ids {
            if !patch.exists(*id) {
                return Err(LakeError::not_found(format!("object {}", id)));
            }
            patch.delete_object(*id)?;
        }
        self.commit_patch(patch, tip, msg).await
    }

    /// Delete every record matching `filter`. Each object holding a match
    /// is replaced by an object of its survivors, if any.
    pub async fn delete_where(
        &self,
        filter: &dyn Filter,
        msg: &CommitMessage,
        cancel: &CancellationToken,
    ) -> LakeResult<Id> {
        let (tip, base) = self.snapshot().await?;
        let pool = &self.pool;
        let layout = pool.layout().clone();
        let span = filter.span(&layout);
        let mut patch = Patch::new(base.clone());
        for object in Lister::new(&*base, &layout, span.as_ref()) {
            if cancel.is_cancelled() {
                return Err(LakeError::Cancelled);
            }
            let records = read_object(pool.store().clone(), pool.data_dir(), &object, &layout).await?;
            let survivors: Vec<Value> = records
                .into_iter()
                .filter(|r| !filter.matches(&layout, r))
                .collect();
            if survivors.len() as u64 == object.count {
                continue;
            }
            patch.delete_object(object.id)?;
            for rewritten in self.write_objects(&survivors, false, cancel).await? {
                patch.add_object(rewritten)?;
            }
        }
        self.commit_patch(patch, tip, msg).await
    }

    /// Commit the inverse of `commit` on top of the tip.
    pub async fn revert(&self, commit: Id, msg: &CommitMessage) -> LakeResult<Id> {
        let patch = self.pool.commits().patch_of_commit(commit).await?;
        let (tip, base) = self.snapshot().await?;
        let undo = patch.undo(base)?;
        self.commit_patch(undo, tip, msg).await
    }

    /// Rewrite `ids` as one object holding all their records in key order,
    /// optionally with a vector blob.
    pub async fn compact(
        &self,
        ids: &[Id],
        write_vectors: bool,
        msg: &CommitMessage,
        cancel: &CancellationToken,
    ) -> LakeResult<Id> {
        if ids.is_empty() {
            return Err(LakeError::Invalid("compact needs at least one object".into()));
        }
        let (tip, base) = self.snapshot().await?;
        let pool = &self.pool;
        let mut run = silt_meta::Snapshot::new();
        for id in ids {
            let object = base
                .lookup(*id)
                .ok_or_else(|| LakeError::not_found(format!("object {}", id)))?;
            run.add_object(object)?;
        }
        let mut scanner = SequenceScanner::new(
            pool.store().clone(),
            pool.data_dir().clone(),
            pool.layout().clone(),
            &run,
            Arc::new(MatchAll),
            cancel.clone(),
        );
        let records = collect(&mut scanner).await?;
        let mut patch = Patch::new(base);
        for id in ids {
            patch.delete_object(*id)?;
        }
        for object in self.write_objects(&records, false, cancel).await? {
            let id = object.id;
            patch.add_object(object)?;
            if write_vectors {
                VectorObject::from_records(&records)
                    .write(pool.store().as_ref(), pool.data_dir(), id)
                    .await?;
                patch.add_vector(id)?;
            }
        }
        debug!(branch = %self.name, inputs = ids.len(), records = records.len(), "compaction written");
        self.commit_patch(patch, tip, msg).await
    }

    /// Build vector blobs for `ids`.
    pub async fn add_vectors(
        &self,
        ids: &[Id],
        msg: &CommitMessage,
        cancel: &CancellationToken,
    ) -> LakeResult<Id> {
        let (tip, base) = self.snapshot().await?;
        let pool = &self.pool;
        let mut patch = Patch::new(base.clone());
        for id in ids {
            if cancel.is_cancelled() {
                return Err(LakeError::Cancelled);
            }
            let object = base
                .lookup(*id)
                .ok_or_else(|| LakeError::not_found(format!("object {}", id)))?;
            patch.add_vector(*id)?;
            let records = read_object(pool.store().clone(), pool.data_dir(), &object, pool.layout()).await?;
            VectorObject::from_records(&records)
                .write(pool.store().as_ref(), pool.data_dir(), *id)
                .await?;
        }
        self.commit_patch(patch, tip, msg).await
    }

    /// Drop the vector marks of `ids`.
    pub async fn delete_vectors(&self, ids: &[Id], msg: &CommitMessage) -> LakeResult<Id> {
        let (tip, base) = self.snapshot().await?;
        let mut patch = Patch::new(base);
        for id in ids {
            patch.delete_vector(*id)?;
        }
        self.commit_patch(patch, tip, msg).await
    }

    /// Apply this branch's changes since it diverged from `target` onto
    /// `target`'s tip.
    pub async fn merge_into(&self, target: &Branch, msg: &CommitMessage) -> LakeResult<Id> {
        let commits = self.pool.commits();
        let ours = self.tip().await?;
        let theirs = target.tip().await?;
        let ancestor = commits.common_ancestor(ours, theirs).await?;
        let changes = commits.patch_of_path(ancestor, ours).await?;
        if changes.is_empty() {
            return Err(MetaError::EmptyTransaction.into());
        }
        let concurrent = commits.patch_of_path(ancestor, theirs).await?;
        let overlap = changes.overlapping_deletes(&concurrent);
        if !overlap.is_empty() {
            return Err(LakeError::conflict(format!(
                "objects {} deleted on both branches",
                join_ids(&overlap)
            )));
        }
        let base = self.pool.snapshot(theirs).await?;
        let patch = changes.rebase(base).map_err(|e| match e {
            MetaError::WriteConflict(msg) => LakeError::conflict(msg),
            other => other.into(),
        })?;
        info!(from = %self.name, into = %target.name, ancestor = %ancestor, "merging branch");
        target.commit_patch(patch, theirs, msg).await
    }
}

fn join_ids(ids: &[Id]) -> String {
    ids.iter().map(Id::to_string).collect::<Vec<_>>().join(", ")
}
