//! Commit log store: commit blobs, parent chains and cached snapshots.
//!
//! Each commit lives in its own blob `<id>.bin` under the pool's commit
//! directory. Materialized snapshots are cached in memory and persisted as
//! `<id>.snap.bin` sidecars; the sidecar is only an accelerator.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use silt_storage::{Id, SharedStore, StorageUri, BLOB_EXT};
use tracing::{debug, trace, warn};

use crate::error::{MetaError, MetaResult};
use crate::object::CommitObject;
use crate::patch::Patch;
use crate::snapshot::{Snapshot, View};

/// Commit store for one pool.
pub struct CommitStore {
    store: SharedStore,
    dir: StorageUri,
    commits: DashMap<Id, Arc<CommitObject>>,
    snapshots: DashMap<Id, Arc<Snapshot>>,
    paths: DashMap<Id, Arc<Vec<Id>>>,
}

impl CommitStore {
    /// Commit store over `dir`.
    pub fn new(store: SharedStore, dir: StorageUri) -> Self {
        Self {
            store,
            dir,
            commits: DashMap::new(),
            snapshots: DashMap::new(),
            paths: DashMap::new(),
        }
    }

    /// Directory holding the commit blobs.
    pub fn dir(&self) -> &StorageUri {
        &self.dir
    }

    fn commit_uri(&self, id: Id) -> StorageUri {
        self.dir.join(&format!("{}.{}", id, BLOB_EXT))
    }

    fn snapshot_uri(&self, id: Id) -> StorageUri {
        self.dir.join(&format!("{}.snap.{}", id, BLOB_EXT))
    }

    /// Write a commit blob. Commits with no state-changing actions are
    /// rejected with `EmptyTransaction`.
    pub async fn put(&self, commit: CommitObject) -> MetaResult<Arc<CommitObject>> {
        if commit.is_empty() {
            return Err(MetaError::EmptyTransaction);
        }
        let id = commit.id();
        let data = commit.serialize()?;
        self.store.put(&self.commit_uri(id), data).await?;
        debug!(
            commit = %id,
            parent = %commit.parent(),
            actions = commit.actions().len() - 1,
            "commit object written"
        );
        let commit = Arc::new(commit);
        self.commits.insert(id, commit.clone());
        Ok(commit)
    }

    /// Fetch and decode a commit.
    pub async fn get(&self, id: Id) -> MetaResult<Arc<CommitObject>> {
        if let Some(commit) = self.commits.get(&id) {
            return Ok(commit.clone());
        }
        let data = match self.store.get(&self.commit_uri(id)).await {
            Ok(data) => data,
            Err(e) if e.is_not_found() => {
                return Err(MetaError::NotFound(format!("commit {}", id)))
            }
            Err(e) => return Err(e.into()),
        };
        let commit = Arc::new(CommitObject::deserialize(&data)?);
        if commit.id() != id {
            return Err(MetaError::BadCommitObject(format!(
                "blob for {} holds commit {}",
                id,
                commit.id()
            )));
        }
        self.commits.insert(id, commit.clone());
        Ok(commit)
    }

    /// Delete a commit blob and its snapshot sidecar and drop cached state.
    ///
    /// Only for garbage collection driven by a reachability analysis.
    pub async fn remove(&self, id: Id) -> MetaResult<()> {
        self.store.delete(&self.commit_uri(id)).await?;
        self.store.delete(&self.snapshot_uri(id)).await?;
        self.commits.remove(&id);
        self.snapshots.remove(&id);
        self.paths.remove(&id);
        debug!(commit = %id, "commit object removed");
        Ok(())
    }

    /// Materialize the snapshot at `tip`.
    pub async fn snapshot(&self, tip: Id) -> MetaResult<Arc<Snapshot>> {
        if tip.is_nil() {
            return Ok(Arc::new(Snapshot::new()));
        }
        if let Some(snap) = self.snapshots.get(&tip) {
            return Ok(snap.clone());
        }
        if let Some(snap) = self.load_sidecar(tip).await {
            let snap = Arc::new(snap);
            self.snapshots.insert(tip, snap.clone());
            return Ok(snap);
        }

        let mut chain = Vec::new();
        let mut at = tip;
        let mut snap = loop {
            if at.is_nil() {
                break Snapshot::new();
            }
            if let Some(base) = self.snapshots.get(&at) {
                break Snapshot::clone(&base);
            }
            let commit = self.get(at).await?;
            at = commit.parent();
            chain.push(commit);
        };
        for commit in chain.iter().rev() {
            for action in commit.actions() {
                snap.play(action)?;
            }
        }
        trace!(commit = %tip, replayed = chain.len(), objects = snap.len(), "snapshot materialized");

        match snap.serialize() {
            Ok(data) => {
                if let Err(e) = self.store.put(&self.snapshot_uri(tip), data).await {
                    warn!(commit = %tip, error = %e, "failed to persist snapshot");
                }
            }
            Err(e) => warn!(commit = %tip, error = %e, "failed to encode snapshot"),
        }
        let snap = Arc::new(snap);
        self.snapshots.insert(tip, snap.clone());
        Ok(snap)
    }

    async fn load_sidecar(&self, tip: Id) -> Option<Snapshot> {
        match self.store.get(&self.snapshot_uri(tip)).await {
            Ok(data) => match Snapshot::deserialize(&data) {
                Ok(snap) => Some(snap),
                Err(e) => {
                    warn!(commit = %tip, error = %e, "ignoring unreadable snapshot sidecar");
                    None
                }
            },
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                warn!(commit = %tip, error = %e, "snapshot sidecar read failed");
                None
            }
        }
    }

    /// Ancestor chain of `tip`, leaf to root.
    pub async fn path(&self, tip: Id) -> MetaResult<Arc<Vec<Id>>> {
        if tip.is_nil() {
            return Ok(Arc::new(Vec::new()));
        }
        if let Some(path) = self.paths.get(&tip) {
            return Ok(path.clone());
        }
        let mut ids = Vec::new();
        let mut at = tip;
        while !at.is_nil() {
            if let Some(rest) = self.paths.get(&at) {
                ids.extend(rest.iter().copied());
                break;
            }
            ids.push(at);
            at = self.get(at).await?.parent();
        }
        let path = Arc::new(ids);
        self.paths.insert(tip, path.clone());
        Ok(path)
    }

    /// Chain from `from` down to, but excluding, `to`. A nil `to` yields the
    /// whole chain.
    pub async fn path_range(&self, from: Id, to: Id) -> MetaResult<Vec<Id>> {
        let path = self.path(from).await?;
        if to.is_nil() {
            return Ok(path.to_vec());
        }
        match path.iter().position(|id| *id == to) {
            Some(end) => Ok(path[..end].to_vec()),
            None => Err(MetaError::NotFound(format!(
                "commit {} in history of {}",
                to, from
            ))),
        }
    }

    /// Stream decoded commits from `from` toward the root, stopping before
    /// `to`.
    pub async fn open_commit_log(&self, from: Id, to: Id) -> MetaResult<CommitLogReader<'_>> {
        let ids = self.path_range(from, to).await?;
        Ok(CommitLogReader {
            commits: self,
            ids: ids.into_iter(),
        })
    }

    /// The patch commit `id` applied to its parent's snapshot.
    pub async fn patch_of_commit(&self, id: Id) -> MetaResult<Patch> {
        let commit = self.get(id).await?;
        let base: Arc<dyn View> = self.snapshot(commit.parent()).await?;
        let mut patch = Patch::new(base);
        for action in commit.actions() {
            patch.play(action)?;
        }
        Ok(patch)
    }

    /// Accumulated patch of every commit after `ancestor` up to `tip`,
    /// layered on the snapshot at `ancestor`.
    pub async fn patch_of_path(&self, ancestor: Id, tip: Id) -> MetaResult<Patch> {
        let ids = self.path_range(tip, ancestor).await?;
        let base: Arc<dyn View> = self.snapshot(ancestor).await?;
        let mut patch = Patch::new(base);
        for id in ids.iter().rev() {
            let commit = self.get(*id).await?;
            for action in commit.actions() {
                patch.play(action)?;
            }
        }
        Ok(patch)
    }

    /// First commit shared by the histories of `a` and `b`; nil when the
    /// histories never meet.
    pub async fn common_ancestor(&self, a: Id, b: Id) -> MetaResult<Id> {
        let left: HashSet<Id> = self.path(a).await?.iter().copied().collect();
        let right = self.path(b).await?;
        Ok(right
            .iter()
            .find(|id| left.contains(id))
            .copied()
            .unwrap_or_else(Id::nil))
    }
}

/// Leaf-to-root iterator over decoded commits.
pub struct CommitLogReader<'a> {
    commits: &'a CommitStore,
    ids: std::vec::IntoIter<Id>,
}

impl CommitLogReader<'_> {
    /// Next commit, or `None` at the end of the range.
    pub async fn next(&mut self) -> MetaResult<Option<Arc<CommitObject>>> {
        match self.ids.next() {
            Some(id) => Ok(Some(self.commits.get(id).await?)),
            None => Ok(None),
        }
    }
}
