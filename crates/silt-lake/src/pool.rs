//! A pool's storage: commit log, branch registry and data objects.

use std::collections::BTreeSet;
use std::sync::Arc;

use silt_meta::{Action, BranchConfig, CommitStore, PoolConfig, Registry, View, MAIN_BRANCH};
use silt_storage::{DataObject, Id, Layout, SharedStore, StorageUri};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{LakeError, LakeResult};

/// Directory names under a pool's root.
const COMMITS_DIR: &str = "commits";
const DATA_DIR: &str = "data";
const BRANCHES_DIR: &str = "branches";

/// Open pool. The pool's name lives in the lake's pool registry and may
/// change; everything held here is fixed at creation.
pub struct Pool {
    id: Id,
    layout: Layout,
    seek_stride: u64,
    threshold: u64,
    store: SharedStore,
    data_dir: StorageUri,
    commits: CommitStore,
    branches: Registry<BranchConfig>,
}

impl Pool {
    /// Open the pool described by `config` beneath the lake `root`.
    pub fn open(store: SharedStore, root: &StorageUri, config: &PoolConfig) -> Self {
        let dir = root.join(&config.id.to_string());
        Self {
            id: config.id,
            layout: config.layout.clone(),
            seek_stride: config.seek_stride,
            threshold: config.threshold,
            data_dir: dir.join(DATA_DIR),
            commits: CommitStore::new(store.clone(), dir.join(COMMITS_DIR)),
            branches: Registry::new(store.clone(), dir.join(BRANCHES_DIR)),
            store,
        }
    }

    /// Pool id.
    pub fn id(&self) -> Id {
        self.id
    }

    /// Sort key layout.
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Seek stride for new objects.
    pub fn seek_stride(&self) -> u64 {
        self.seek_stride
    }

    /// Object size threshold.
    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Object store.
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Directory of data-object blobs.
    pub fn data_dir(&self) -> &StorageUri {
        &self.data_dir
    }

    /// Commit log.
    pub fn commits(&self) -> &CommitStore {
        &self.commits
    }

    /// Create the default branch with no commits.
    pub async fn init(&self) -> LakeResult<()> {
        self.branches.insert(BranchConfig::new(MAIN_BRANCH, Id::nil())).await?;
        Ok(())
    }

    /// Branch by name.
    pub async fn lookup_branch(&self, name: &str) -> LakeResult<BranchConfig> {
        self.branches
            .lookup(name)
            .await?
            .ok_or_else(|| LakeError::not_found(format!("branch {:?}", name)))
    }

    /// Every branch in name order.
    pub async fn list_branches(&self) -> LakeResult<Vec<BranchConfig>> {
        Ok(self.branches.all().await?)
    }

    /// Create branch `name` at commit `at`; `at` must exist in this pool.
    pub async fn create_branch(&self, name: &str, at: Id) -> LakeResult<BranchConfig> {
        validate_name("branch", name)?;
        if !at.is_nil() {
            self.commits.get(at).await?;
        }
        let branch = BranchConfig::new(name, at);
        self.branches.insert(branch.clone()).await?;
        info!(pool = %self.id, branch = name, commit = %at, "branch created");
        Ok(branch)
    }

    /// Remove branch `name`. The default branch stays while another branch
    /// shares history with it.
    pub async fn remove_branch(&self, name: &str) -> LakeResult<()> {
        let branch = self.lookup_branch(name).await?;
        if name == MAIN_BRANCH && !branch.commit.is_nil() {
            for other in self.list_branches().await? {
                if other.name == name || other.commit.is_nil() {
                    continue;
                }
                let ancestor = self.commits.common_ancestor(other.commit, branch.commit).await?;
                if !ancestor.is_nil() {
                    return Err(LakeError::Meta(silt_meta::MetaError::Constraint(format!(
                        "branch {:?} starts from {:?}",
                        other.name, name
                    ))));
                }
            }
        }
        let tip = branch.commit;
        self.branches.delete(name, |b| b.commit == tip).await?;
        info!(pool = %self.id, branch = name, "branch removed");
        Ok(())
    }

    /// Move branch `name` from `parent` to `commit`; `Constraint` if the
    /// tip is no longer `parent`.
    pub async fn update_branch(&self, name: &str, commit: Id, parent: Id) -> LakeResult<()> {
        self.branches
            .update(BranchConfig::new(name, commit), |b| b.commit == parent)
            .await?;
        Ok(())
    }

    /// Data-object ids referenced by any commit reachable from any branch.
    pub async fn reachable_objects(&self) -> LakeResult<BTreeSet<Id>> {
        let mut seen = BTreeSet::new();
        let mut reachable = BTreeSet::new();
        for branch in self.list_branches().await? {
            for commit_id in self.commits.path(branch.commit).await?.iter() {
                if !seen.insert(*commit_id) {
                    continue;
                }
                let commit = self.commits.get(*commit_id).await?;
                for action in commit.actions() {
                    match action {
                        Action::Add { object, .. } => {
                            reachable.insert(object.id);
                        }
                        Action::Delete { id, .. }
                        | Action::AddVector { id, .. }
                        | Action::DeleteVector { id, .. } => {
                            reachable.insert(*id);
                        }
                        Action::Commit(_) | Action::AddIndex { .. } => {}
                    }
                }
            }
        }
        Ok(reachable)
    }

    /// Remove data objects no branch can reach. Returns the ids found; with
    /// `dryrun` nothing is deleted.
    pub async fn vacuum(&self, dryrun: bool, cancel: &CancellationToken) -> LakeResult<Vec<Id>> {
        let reachable = self.reachable_objects().await?;
        let mut found = BTreeSet::new();
        for uri in self.store.list(&self.data_dir).await? {
            if let Some(id) = DataObject::id_from_blob_name(uri.name()) {
                if !reachable.contains(&id) {
                    found.insert(id);
                }
            }
        }
        if !dryrun {
            for id in &found {
                if cancel.is_cancelled() {
                    return Err(LakeError::Cancelled);
                }
                DataObject::remove(self.store.as_ref(), &self.data_dir, *id).await?;
            }
        }
        debug!(pool = %self.id, unreachable = found.len(), dryrun, "vacuum finished");
        Ok(found.into_iter().collect())
    }

    /// Snapshot at `tip`.
    pub async fn snapshot(&self, tip: Id) -> LakeResult<Arc<dyn View>> {
        Ok(self.commits.snapshot(tip).await?)
    }
}

/// Reject names the query grammar cannot address.
pub fn validate_name(what: &str, name: &str) -> LakeResult<()> {
    if name.is_empty() {
        return Err(LakeError::Invalid(format!("{} name is empty", what)));
    }
    if name
        .chars()
        .any(|c| c.is_whitespace() || c == '@' || c == ':' || c == '/')
    {
        return Err(LakeError::Invalid(format!(
            "{} name {:?} contains whitespace, '@', ':' or '/'",
            what, name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use silt_meta::{CommitObject, DEFAULT_AUTHOR};
    use silt_storage::{ErrorKind, MemoryStore, Value};

    fn pool() -> Pool {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let root = StorageUri::parse("mem://lake").unwrap();
        Pool::open(store, &root, &PoolConfig::new("p", Layout::asc("k"), 0, 0))
    }

    async fn commit_add(pool: &Pool, parent: Id) -> Id {
        let mut c = CommitObject::new(parent, 0, DEFAULT_AUTHOR, "add");
        c.append_add(&DataObject {
            id: Id::new(),
            min: Value::Int(0),
            max: Value::Int(1),
            count: 2,
            size: 10,
            created: None,
        });
        pool.commits().put(c).await.unwrap().id()
    }

    #[tokio::test]
    async fn test_branch_lifecycle() {
        let p = pool();
        p.init().await.unwrap();
        assert!(p.lookup_branch(MAIN_BRANCH).await.unwrap().commit.is_nil());
        let err = p.create_branch("dev", Id::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let c1 = commit_add(&p, Id::nil()).await;
        p.update_branch(MAIN_BRANCH, c1, Id::nil()).await.unwrap();
        let stale = p.update_branch(MAIN_BRANCH, c1, Id::nil()).await.unwrap_err();
        assert_eq!(stale.kind(), ErrorKind::Constraint);

        p.create_branch("dev", c1).await.unwrap();
        let err = p.remove_branch(MAIN_BRANCH).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Constraint);
        p.remove_branch("dev").await.unwrap();
        p.remove_branch(MAIN_BRANCH).await.unwrap();
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("pool", "logs").is_ok());
        assert!(validate_name("pool", "").is_err());
        assert!(validate_name("pool", "a@b").is_err());
        assert!(validate_name("branch", "x y").is_err());
    }
}
