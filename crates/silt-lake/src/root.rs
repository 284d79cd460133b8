//! Lake root: the pool registry and the cache of open pools.

use std::sync::Arc;

use dashmap::DashMap;
use silt_meta::{PoolConfig, Registry};
use silt_storage::{open_store, Id, Layout, SharedStore, StorageUri};
use tracing::info;

use crate::error::{LakeError, LakeResult};
use crate::pool::{validate_name, Pool};

const POOLS_DIR: &str = "pools";

/// Root of a lake on an object store.
pub struct Root {
    store: SharedStore,
    uri: StorageUri,
    pools: Registry<PoolConfig>,
    open: DashMap<Id, Arc<Pool>>,
}

impl Root {
    /// Open the lake at `uri`, picking the store from its scheme.
    pub fn open(uri: &str) -> LakeResult<Self> {
        let uri = StorageUri::parse(uri)?;
        let store = open_store(&uri)?;
        Ok(Self::with_store(store, uri))
    }

    /// Lake rooted at `uri` on an existing store.
    pub fn with_store(store: SharedStore, uri: StorageUri) -> Self {
        Self {
            pools: Registry::new(store.clone(), uri.join(POOLS_DIR)),
            store,
            uri,
            open: DashMap::new(),
        }
    }

    /// Root location.
    pub fn uri(&self) -> &StorageUri {
        &self.uri
    }

    /// Create a pool and its default branch.
    pub async fn create_pool(
        &self,
        name: &str,
        layout: Layout,
        seek_stride: u64,
        threshold: u64,
    ) -> LakeResult<PoolConfig> {
        validate_name("pool", name)?;
        let config = PoolConfig::new(name, layout, seek_stride, threshold);
        self.pools.insert(config.clone()).await?;
        let pool = self.pool(&config);
        pool.init().await?;
        info!(pool = name, id = %config.id, layout = %config.layout, "pool created");
        Ok(config)
    }

    /// Pool by name, or by id when no pool has that name.
    pub async fn lookup_pool(&self, name_or_id: &str) -> LakeResult<PoolConfig> {
        if let Some(config) = self.pools.lookup(name_or_id).await? {
            return Ok(config);
        }
        if let Ok(id) = name_or_id.parse::<Id>() {
            if let Some(config) = self.pools.find(move |p| p.id == id).await? {
                return Ok(config);
            }
        }
        Err(LakeError::not_found(format!("pool {:?}", name_or_id)))
    }

    /// Pool by id.
    pub async fn pool_config(&self, id: Id) -> LakeResult<PoolConfig> {
        self.pools
            .find(move |p| p.id == id)
            .await?
            .ok_or_else(|| LakeError::not_found(format!("pool {}", id)))
    }

    /// Every pool in name order.
    pub async fn list_pools(&self) -> LakeResult<Vec<PoolConfig>> {
        Ok(self.pools.all().await?)
    }

    fn pool(&self, config: &PoolConfig) -> Arc<Pool> {
        self.open
            .entry(config.id)
            .or_insert_with(|| Arc::new(Pool::open(self.store.clone(), &self.uri, config)))
            .clone()
    }

    /// Open pool `id`.
    pub async fn open_pool(&self, id: Id) -> LakeResult<Arc<Pool>> {
        if let Some(pool) = self.open.get(&id) {
            return Ok(pool.clone());
        }
        let config = self.pool_config(id).await?;
        Ok(self.pool(&config))
    }

    /// Remove pool `id` and everything stored under it.
    pub async fn remove_pool(&self, id: Id) -> LakeResult<PoolConfig> {
        let config = self.pool_config(id).await?;
        let removed = self.pools.delete(&config.name, move |p| p.id == id).await?;
        self.open.remove(&id);
        let dir = self.uri.join(&id.to_string());
        self.store.delete_by_prefix(&dir).await?;
        info!(pool = %removed.name, id = %id, "pool removed");
        Ok(removed)
    }

    /// Rename pool `id`.
    pub async fn rename_pool(&self, id: Id, new_name: &str) -> LakeResult<()> {
        validate_name("pool", new_name)?;
        let config = self.pool_config(id).await?;
        self.pools
            .rename(&config.name, new_name, move |p| p.id == id)
            .await?;
        info!(id = %id, from = %config.name, to = new_name, "pool renamed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silt_meta::MAIN_BRANCH;
    use silt_storage::{ErrorKind, MemoryStore};

    fn root() -> Root {
        Root::with_store(
            Arc::new(MemoryStore::new()),
            StorageUri::parse("mem://lake").unwrap(),
        )
    }

    #[tokio::test]
    async fn test_pool_lifecycle() {
        let r = root();
        let cfg = r.create_pool("logs", Layout::asc("ts"), 0, 0).await.unwrap();
        let dup = r.create_pool("logs", Layout::asc("ts"), 0, 0).await.unwrap_err();
        assert_eq!(dup.kind(), ErrorKind::Exists);

        assert_eq!(r.lookup_pool("logs").await.unwrap().id, cfg.id);
        assert_eq!(r.lookup_pool(&cfg.id.to_string()).await.unwrap().name, "logs");
        let pool = r.open_pool(cfg.id).await.unwrap();
        assert!(pool.lookup_branch(MAIN_BRANCH).await.is_ok());

        r.rename_pool(cfg.id, "events").await.unwrap();
        assert_eq!(r.lookup_pool("events").await.unwrap().id, cfg.id);
        assert_eq!(r.lookup_pool("logs").await.unwrap_err().kind(), ErrorKind::NotFound);

        r.remove_pool(cfg.id).await.unwrap();
        assert!(r.list_pools().await.unwrap().is_empty());
        assert_eq!(r.open_pool(cfg.id).await.err().unwrap().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_rejects_bad_names() {
        let r = root();
        let err = r.create_pool("a:b", Layout::asc("ts"), 0, 0).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
    }
}
