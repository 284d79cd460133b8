//! Drives compaction across a lake.
//!
//! `update` runs one cycle on every pool and returns. `run` keeps one worker
//! per pool alive, cycling on the configured interval and whenever the
//! maintained branch receives a commit.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use silt_lake::{Event, EventKind, Lake, LakeError, LakeResult};
use silt_meta::PoolConfig;
use silt_storage::{ErrorKind, Id};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::compactor::{compact_branch, CycleReport, Policy};
use crate::config::ManageConfig;
use crate::error::MgmtResult;

/// Counters across every worker of a monitor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorStats {
    /// Cycles finished, successful or not.
    pub cycles: u64,
    /// Cycles that ended in an error.
    pub failed_cycles: u64,
    /// Runs found.
    pub runs_found: u64,
    /// Objects rewritten.
    pub objects_compacted: u64,
    /// Vector blobs added.
    pub vectors_added: u64,
}

impl MonitorStats {
    fn record(&mut self, report: &CycleReport) {
        self.cycles += 1;
        self.runs_found += report.runs_found as u64;
        self.objects_compacted += report.objects_compacted as u64;
        self.vectors_added += report.vectors_added as u64;
    }
}

const NO_DEADLINE: i64 = i64::MAX;
const MIN_WAIT: Duration = Duration::from_secs(1);

/// Compaction worker for one branch.
struct BranchWorker {
    lake: Arc<dyn Lake>,
    pool: PoolConfig,
    branch: String,
    policy: Policy,
    interval: Duration,
    cancel: CancellationToken,
    running: AtomicBool,
    pending: AtomicBool,
    next_cold: AtomicI64,
    stats: Arc<watch::Sender<MonitorStats>>,
}

impl BranchWorker {
    fn new(
        lake: Arc<dyn Lake>,
        pool: PoolConfig,
        config: &ManageConfig,
        cancel: CancellationToken,
        stats: Arc<watch::Sender<MonitorStats>>,
    ) -> Self {
        Self {
            branch: config.branch(&pool.name).to_string(),
            policy: config.policy(&pool.name),
            interval: config.interval(&pool.name),
            lake,
            pool,
            cancel,
            running: AtomicBool::new(false),
            pending: AtomicBool::new(false),
            next_cold: AtomicI64::new(NO_DEADLINE),
            stats,
        }
    }

    /// Request a cycle. A request made while a cycle runs is folded into a
    /// single follow-up cycle.
    fn trigger(self: &Arc<Self>) {
        if self.cancel.is_cancelled() {
            return;
        }
        if self.running.swap(true, Ordering::AcqRel) {
            self.pending.store(true, Ordering::Release);
            return;
        }
        let worker = self.clone();
        tokio::spawn(async move { worker.drain().await });
    }

    async fn drain(self: Arc<Self>) {
        loop {
            self.cycle().await;
            if self.cancel.is_cancelled() {
                self.running.store(false, Ordering::Release);
                return;
            }
            if self.pending.swap(false, Ordering::AcqRel) {
                continue;
            }
            self.running.store(false, Ordering::Release);
            // A trigger between the swap and the store saw `running` and
            // only set `pending`.
            if !self.pending.swap(false, Ordering::AcqRel) || self.running.swap(true, Ordering::AcqRel) {
                return;
            }
        }
    }

    async fn cycle(&self) {
        let cancel = self.cancel.child_token();
        match compact_branch(self.lake.as_ref(), &self.pool, &self.branch, &self.policy, &cancel).await {
            Ok(report) => {
                self.next_cold
                    .store(report.next_cold.unwrap_or(NO_DEADLINE), Ordering::Release);
                self.stats.send_modify(|s| s.record(&report));
            }
            Err(e) if e.kind() == ErrorKind::Cancelled => {
                debug!(pool = %self.pool.name, branch = %self.branch, "compaction cycle cancelled");
            }
            Err(e) => {
                if e.is_connection_refused() {
                    warn!(pool = %self.pool.name, branch = %self.branch, error = %e, "lake unreachable, cycle skipped");
                } else {
                    error!(pool = %self.pool.name, branch = %self.branch, error = %e, "compaction cycle failed");
                }
                self.stats.send_modify(|s| {
                    s.cycles += 1;
                    s.failed_cycles += 1;
                });
            }
        }
    }

    /// Time until the next scheduled cycle.
    fn wait(&self) -> Duration {
        let next_cold = self.next_cold.load(Ordering::Acquire);
        if next_cold == NO_DEADLINE {
            return self.interval;
        }
        let now = chrono::Utc::now().timestamp_millis();
        let until = Duration::from_millis(u64::try_from(next_cold.saturating_sub(now)).unwrap_or(0));
        until.clamp(MIN_WAIT, self.interval.max(MIN_WAIT))
    }

    async fn tick(self: Arc<Self>) {
        self.trigger();
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.wait()) => self.trigger(),
            }
        }
        debug!(pool = %self.pool.name, branch = %self.branch, "worker stopped");
    }
}

/// Compaction driver for every pool of a lake.
pub struct Monitor {
    lake: Arc<dyn Lake>,
    config: Arc<ManageConfig>,
    workers: DashMap<Id, Arc<BranchWorker>>,
    stats: Arc<watch::Sender<MonitorStats>>,
}

impl Monitor {
    /// Monitor for `lake` with settings from `config`.
    pub fn new(lake: Arc<dyn Lake>, config: ManageConfig) -> Self {
        let (tx, _) = watch::channel(MonitorStats::default());
        Self {
            lake,
            config: Arc::new(config),
            workers: DashMap::new(),
            stats: Arc::new(tx),
        }
    }

    /// Watch the counters.
    pub fn stats(&self) -> watch::Receiver<MonitorStats> {
        self.stats.subscribe()
    }

    /// Run one cycle on the maintained branch of every pool.
    pub async fn update(&self, cancel: &CancellationToken) -> MgmtResult<Vec<(String, CycleReport)>> {
        let mut reports = Vec::new();
        for pool in self.lake.list_pools().await? {
            if cancel.is_cancelled() {
                return Err(LakeError::Cancelled.into());
            }
            let branch = self.config.branch(&pool.name);
            let policy = self.config.policy(&pool.name);
            let report = compact_branch(self.lake.as_ref(), &pool, branch, &policy, cancel).await?;
            self.stats.send_modify(|s| s.record(&report));
            reports.push((pool.name.clone(), report));
        }
        Ok(reports)
    }

    /// Keep every pool compacted until `cancel` fires or the event stream
    /// ends. A refused connection is retried after the reconnect delay.
    pub async fn run(&self, cancel: &CancellationToken) -> MgmtResult<()> {
        loop {
            match self.session(cancel).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_connection_refused() => {
                    let delay = self.config.reconnect_delay();
                    warn!(error = %e, delay_secs = delay.as_secs(), "lake refused connection, retrying");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn session(&self, cancel: &CancellationToken) -> LakeResult<()> {
        let session = cancel.child_token();
        let _guard = session.clone().drop_guard();
        let result = self.watch(&session).await;
        self.workers.clear();
        result
    }

    async fn watch(&self, session: &CancellationToken) -> LakeResult<()> {
        // Subscribe first so a pool created while listing is not missed.
        let mut events = self.lake.subscribe_events().await?;
        for pool in self.lake.list_pools().await? {
            self.start(pool, session);
        }
        info!(pools = self.workers.len(), "monitor started");

        loop {
            let next = tokio::select! {
                biased;
                _ = session.cancelled() => return Ok(()),
                next = events.next() => next,
            };
            match next {
                None => {
                    info!("event stream ended");
                    return Ok(());
                }
                Some(Err(e)) => return Err(e),
                Some(Ok(event)) => self.handle(event, session).await?,
            }
        }
    }

    async fn handle(&self, event: Event, session: &CancellationToken) -> LakeResult<()> {
        let pool_id = event.detail.pool_id;
        match event.kind {
            EventKind::PoolNew => match self.lake.pool_config(pool_id).await {
                Ok(pool) => self.start(pool, session),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!(pool = %pool_id, "new pool already gone");
                }
                Err(e) => return Err(e),
            },
            EventKind::PoolDelete => {
                if let Some((_, worker)) = self.workers.remove(&pool_id) {
                    info!(pool = %worker.pool.name, "pool removed, stopping worker");
                    worker.cancel.cancel();
                }
            }
            EventKind::BranchCommit => {
                if let Some(worker) = self.workers.get(&pool_id) {
                    if event.detail.branch.as_deref() == Some(worker.branch.as_str()) {
                        worker.trigger();
                    }
                }
            }
            EventKind::PoolUpdate | EventKind::BranchUpdate | EventKind::BranchDelete => {}
        }
        Ok(())
    }

    fn start(&self, pool: PoolConfig, session: &CancellationToken) {
        if let dashmap::mapref::entry::Entry::Vacant(slot) = self.workers.entry(pool.id) {
            let worker = Arc::new(BranchWorker::new(
                self.lake.clone(),
                pool,
                &self.config,
                session.child_token(),
                self.stats.clone(),
            ));
            debug!(pool = %worker.pool.name, branch = %worker.branch, "worker started");
            slot.insert(worker.clone());
            tokio::spawn(worker.tick());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silt_lake::LocalLake;
    use silt_storage::{MemoryStore, StorageUri};

    async fn worker() -> (Arc<BranchWorker>, watch::Receiver<MonitorStats>) {
        let lake = LocalLake::with_store(
            Arc::new(MemoryStore::new()),
            StorageUri::parse("mem://lake").unwrap(),
        );
        let pool = lake
            .create_pool("logs", "ts".parse().unwrap(), 0, 0)
            .await
            .unwrap();
        let (tx, rx) = watch::channel(MonitorStats::default());
        let worker = BranchWorker::new(
            Arc::new(lake),
            pool,
            &ManageConfig::default(),
            CancellationToken::new(),
            Arc::new(tx),
        );
        (Arc::new(worker), rx)
    }

    #[tokio::test]
    async fn test_triggers_coalesce_while_running() {
        let (worker, mut stats) = worker().await;
        worker.trigger();
        worker.trigger();
        worker.trigger();
        stats.wait_for(|s| s.cycles >= 2).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stats.borrow().cycles, 2);
        assert!(!worker.running.load(Ordering::Acquire));

        worker.trigger();
        stats.wait_for(|s| s.cycles >= 3).await.unwrap();
        assert_eq!(stats.borrow().failed_cycles, 0);
    }

    #[tokio::test]
    async fn test_cancelled_worker_ignores_triggers() {
        let (worker, stats) = worker().await;
        worker.cancel.cancel();
        worker.trigger();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(stats.borrow().cycles, 0);
    }

    #[tokio::test]
    async fn test_wait_tracks_next_cold() {
        let (worker, _stats) = worker().await;
        assert_eq!(worker.wait(), worker.interval);
        let soon = chrono::Utc::now().timestamp_millis() + 3_000;
        worker.next_cold.store(soon, Ordering::Release);
        let wait = worker.wait();
        assert!(wait <= Duration::from_secs(3) && wait >= MIN_WAIT);
        worker.next_cold.store(0, Ordering::Release);
        assert_eq!(worker.wait(), MIN_WAIT);
    }
}
