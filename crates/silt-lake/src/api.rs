//! The lake façade and its in-process driver.

use std::sync::Arc;

use async_trait::async_trait;
use silt_meta::{BranchConfig, PoolConfig};
use silt_storage::{Id, Layout, SharedStore, StorageUri};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::branch::{Branch, CommitMessage};
use crate::error::LakeResult;
use crate::events::{Event, EventBus, EventKind, EventStream};
use crate::filter::{Filter, KeyRange, MatchAll};
use crate::meta;
use crate::puller::{Puller, VecPuller};
use crate::query::{self, Head, LakeMeta, PoolMeta, Source};
use crate::root::Root;
use crate::scanner::{SequenceScanner, DEFAULT_BATCH_SIZE};

/// Every operation a lake client can perform, local or remote.
#[async_trait]
pub trait Lake: Send + Sync {
    /// Create a pool with its `main` branch. Zero stride or threshold
    /// selects the default.
    async fn create_pool(
        &self,
        name: &str,
        layout: Layout,
        seek_stride: u64,
        threshold: u64,
    ) -> LakeResult<PoolConfig>;

    /// Remove a pool and all of its data.
    async fn remove_pool(&self, pool: Id) -> LakeResult<()>;

    /// Rename a pool.
    async fn rename_pool(&self, pool: Id, name: &str) -> LakeResult<()>;

    /// Id of the pool named `name` (an id string is also accepted).
    async fn id_of(&self, name: &str) -> LakeResult<Id>;

    /// Configuration of a pool.
    async fn pool_config(&self, pool: Id) -> LakeResult<PoolConfig>;

    /// Every pool.
    async fn list_pools(&self) -> LakeResult<Vec<PoolConfig>>;

    /// Create branch `name` at commit `at` (nil for an empty branch).
    async fn create_branch(&self, pool: Id, name: &str, at: Id) -> LakeResult<BranchConfig>;

    /// Remove a branch.
    async fn remove_branch(&self, pool: Id, name: &str) -> LakeResult<()>;

    /// Merge `child` into `parent`; returns the new parent tip.
    async fn merge_branch(
        &self,
        pool: Id,
        child: &str,
        parent: &str,
        msg: &CommitMessage,
    ) -> LakeResult<Id>;

    /// Tip of a branch.
    async fn tip(&self, pool: Id, branch: &str) -> LakeResult<Id>;

    /// Load the values `input` produces.
    async fn load(
        &self,
        pool: Id,
        branch: &str,
        input: &mut dyn Puller,
        msg: &CommitMessage,
        cancel: &CancellationToken,
    ) -> LakeResult<Id>;

    /// Delete objects by id.
    async fn delete(&self, pool: Id, branch: &str, ids: &[Id], msg: &CommitMessage) -> LakeResult<Id>;

    /// Delete the records whose key lies in `range`.
    async fn delete_where(
        &self,
        pool: Id,
        branch: &str,
        range: &KeyRange,
        msg: &CommitMessage,
        cancel: &CancellationToken,
    ) -> LakeResult<Id>;

    /// Undo a commit on top of the branch tip.
    async fn revert(&self, pool: Id, branch: &str, commit: Id, msg: &CommitMessage) -> LakeResult<Id>;

    /// Merge objects into one.
    async fn compact(
        &self,
        pool: Id,
        branch: &str,
        ids: &[Id],
        write_vectors: bool,
        msg: &CommitMessage,
        cancel: &CancellationToken,
    ) -> LakeResult<Id>;

    /// Build vector blobs for objects.
    async fn add_vectors(
        &self,
        pool: Id,
        branch: &str,
        ids: &[Id],
        msg: &CommitMessage,
        cancel: &CancellationToken,
    ) -> LakeResult<Id>;

    /// Drop vector marks from objects.
    async fn delete_vectors(
        &self,
        pool: Id,
        branch: &str,
        ids: &[Id],
        msg: &CommitMessage,
    ) -> LakeResult<Id>;

    /// Find, and unless `dryrun` delete, data objects no branch reaches.
    async fn vacuum(
        &self,
        pool: Id,
        branch: &str,
        dryrun: bool,
        cancel: &CancellationToken,
    ) -> LakeResult<Vec<Id>>;

    /// Open a scan of `source`, resolved against `head` (`pool[@branch]`).
    async fn query(
        &self,
        head: &str,
        source: &str,
        cancel: &CancellationToken,
    ) -> LakeResult<Box<dyn Puller>>;

    /// Stream of lake events from now on.
    async fn subscribe_events(&self) -> LakeResult<EventStream>;
}

/// Lake driven in-process against an object store.
pub struct LocalLake {
    root: Root,
    events: EventBus,
}

impl LocalLake {
    /// Open the lake at `uri`.
    pub fn open(uri: &str) -> LakeResult<Self> {
        Ok(Self {
            root: Root::open(uri)?,
            events: EventBus::new(),
        })
    }

    /// Lake rooted at `uri` on `store`.
    pub fn with_store(store: SharedStore, uri: StorageUri) -> Self {
        Self {
            root: Root::with_store(store, uri),
            events: EventBus::new(),
        }
    }

    /// Pool registry and storage.
    pub fn root(&self) -> &Root {
        &self.root
    }

    /// In-process event bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Open a branch handle.
    pub async fn branch(&self, pool: Id, name: &str) -> LakeResult<Branch> {
        let pool = self.root.open_pool(pool).await?;
        Branch::open(pool, name).await
    }

    fn committed(&self, pool: Id, branch: &str, commit: LakeResult<Id>) -> LakeResult<Id> {
        let commit = commit?;
        self.events
            .publish(Event::branch(EventKind::BranchCommit, pool, branch, Some(commit)));
        Ok(commit)
    }

    async fn open_source(&self, source: Source, cancel: &CancellationToken) -> LakeResult<Box<dyn Puller>> {
        let rows = match source {
            Source::Lake(LakeMeta::Pools) => self
                .root
                .list_pools()
                .await?
                .iter()
                .map(meta::pool_row)
                .collect(),
            Source::Lake(LakeMeta::Branches) => {
                let mut rows = Vec::new();
                for config in self.root.list_pools().await? {
                    let pool = self.root.open_pool(config.id).await?;
                    for branch in pool.list_branches().await? {
                        rows.push(meta::branch_row(&config, &branch));
                    }
                }
                rows
            }
            Source::Pool {
                pool,
                branch,
                meta: pool_meta,
                range,
            } => {
                let config = self.root.lookup_pool(&pool).await?;
                let pool = self.root.open_pool(config.id).await?;
                if pool_meta == Some(PoolMeta::Branches) {
                    pool.list_branches()
                        .await?
                        .iter()
                        .map(|b| meta::branch_row(&config, b))
                        .collect()
                } else {
                    let tip = pool.lookup_branch(&branch).await?.commit;
                    let view = pool.snapshot(tip).await?;
                    let layout = pool.layout();
                    match pool_meta {
                        None => {
                            let filter: Arc<dyn Filter> = match range {
                                Some(range) => Arc::new(range),
                                None => Arc::new(MatchAll),
                            };
                            debug!(pool = %config.name, branch = %branch, tip = %tip, "opening scan");
                            return Ok(Box::new(SequenceScanner::new(
                                pool.store().clone(),
                                pool.data_dir().clone(),
                                layout.clone(),
                                &*view,
                                filter,
                                cancel.clone(),
                            )));
                        }
                        Some(PoolMeta::Objects) => meta::objects(&*view, layout),
                        Some(PoolMeta::Vectors) => meta::vectors(&*view),
                        Some(PoolMeta::Partitions) => {
                            let span = range.and_then(|r| r.span(layout));
                            meta::partitions(&*view, layout, span.as_ref())
                        }
                        Some(PoolMeta::Log) => meta::log(pool.commits(), tip).await?,
                        Some(PoolMeta::Branches) => Vec::new(),
                    }
                }
            }
        };
        Ok(Box::new(VecPuller::new(rows, DEFAULT_BATCH_SIZE)))
    }
}

#[async_trait]
impl Lake for LocalLake {
    async fn create_pool(
        &self,
        name: &str,
        layout: Layout,
        seek_stride: u64,
        threshold: u64,
    ) -> LakeResult<PoolConfig> {
        let config = self.root.create_pool(name, layout, seek_stride, threshold).await?;
        self.events.publish(Event::pool(EventKind::PoolNew, config.id));
        Ok(config)
    }

    async fn remove_pool(&self, pool: Id) -> LakeResult<()> {
        self.root.remove_pool(pool).await?;
        self.events.publish(Event::pool(EventKind::PoolDelete, pool));
        Ok(())
    }

    async fn rename_pool(&self, pool: Id, name: &str) -> LakeResult<()> {
        self.root.rename_pool(pool, name).await?;
        self.events.publish(Event::pool(EventKind::PoolUpdate, pool));
        Ok(())
    }

    async fn id_of(&self, name: &str) -> LakeResult<Id> {
        Ok(self.root.lookup_pool(name).await?.id)
    }

    async fn pool_config(&self, pool: Id) -> LakeResult<PoolConfig> {
        self.root.pool_config(pool).await
    }

    async fn list_pools(&self) -> LakeResult<Vec<PoolConfig>> {
        self.root.list_pools().await
    }

    async fn create_branch(&self, pool: Id, name: &str, at: Id) -> LakeResult<BranchConfig> {
        let branch = self.root.open_pool(pool).await?.create_branch(name, at).await?;
        self.events
            .publish(Event::branch(EventKind::BranchUpdate, pool, name, Some(at)));
        Ok(branch)
    }

    async fn remove_branch(&self, pool: Id, name: &str) -> LakeResult<()> {
        self.root.open_pool(pool).await?.remove_branch(name).await?;
        self.events
            .publish(Event::branch(EventKind::BranchDelete, pool, name, None));
        Ok(())
    }

    async fn merge_branch(
        &self,
        pool: Id,
        child: &str,
        parent: &str,
        msg: &CommitMessage,
    ) -> LakeResult<Id> {
        let from = self.branch(pool, child).await?;
        let into = self.branch(pool, parent).await?;
        self.committed(pool, parent, from.merge_into(&into, msg).await)
    }

    async fn tip(&self, pool: Id, branch: &str) -> LakeResult<Id> {
        self.branch(pool, branch).await?.tip().await
    }

    async fn load(
        &self,
        pool: Id,
        branch: &str,
        input: &mut dyn Puller,
        msg: &CommitMessage,
        cancel: &CancellationToken,
    ) -> LakeResult<Id> {
        let b = self.branch(pool, branch).await?;
        self.committed(pool, branch, b.load(input, msg, cancel).await)
    }

    async fn delete(&self, pool: Id, branch: &str, ids: &[Id], msg: &CommitMessage) -> LakeResult<Id> {
        let b = self.branch(pool, branch).await?;
        self.committed(pool, branch, b.delete(ids, msg).await)
    }

    async fn delete_where(
        &self,
        pool: Id,
        branch: &str,
        range: &KeyRange,
        msg: &CommitMessage,
        cancel: &CancellationToken,
    ) -> LakeResult<Id> {
        let b = self.branch(pool, branch).await?;
        self.committed(pool, branch, b.delete_where(range, msg, cancel).await)
    }

    async fn revert(&self, pool: Id, branch: &str, commit: Id, msg: &CommitMessage) -> LakeResult<Id> {
        let b = self.branch(pool, branch).await?;
        self.committed(pool, branch, b.revert(commit, msg).await)
    }

    async fn compact(
        &self,
        pool: Id,
        branch: &str,
        ids: &[Id],
        write_vectors: bool,
        msg: &CommitMessage,
        cancel: &CancellationToken,
    ) -> LakeResult<Id> {
        let b = self.branch(pool, branch).await?;
        self.committed(pool, branch, b.compact(ids, write_vectors, msg, cancel).await)
    }

    async fn add_vectors(
        &self,
        pool: Id,
        branch: &str,
        ids: &[Id],
        msg: &CommitMessage,
        cancel: &CancellationToken,
    ) -> LakeResult<Id> {
        let b = self.branch(pool, branch).await?;
        self.committed(pool, branch, b.add_vectors(ids, msg, cancel).await)
    }

    async fn delete_vectors(
        &self,
        pool: Id,
        branch: &str,
        ids: &[Id],
        msg: &CommitMessage,
    ) -> LakeResult<Id> {
        let b = self.branch(pool, branch).await?;
        self.committed(pool, branch, b.delete_vectors(ids, msg).await)
    }

    async fn vacuum(
        &self,
        pool: Id,
        branch: &str,
        dryrun: bool,
        cancel: &CancellationToken,
    ) -> LakeResult<Vec<Id>> {
        let b = self.branch(pool, branch).await?;
        b.pool().vacuum(dryrun, cancel).await
    }

    async fn query(
        &self,
        head: &str,
        source: &str,
        cancel: &CancellationToken,
    ) -> LakeResult<Box<dyn Puller>> {
        let source = query::parse(source, &Head::parse(head))?;
        self.open_source(source, cancel).await
    }

    async fn subscribe_events(&self) -> LakeResult<EventStream> {
        Ok(self.events.subscribe())
    }
}
