//! Pull-based value streams and scan progress.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use silt_storage::Value;

use crate::error::LakeResult;

/// A batch of values.
pub type Batch = Vec<Value>;

/// A pull-based stream of value batches.
///
/// `pull(false)` returns the next non-empty batch, or `None` at the end.
/// `pull(true)` tells the producer the consumer is finished; it must release
/// its resources and return `None`.
#[async_trait]
pub trait Puller: Send {
    /// Next batch.
    async fn pull(&mut self, done: bool) -> LakeResult<Option<Batch>>;

    /// Progress so far.
    fn progress(&self) -> Progress {
        Progress::default()
    }
}

/// Scan statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Data objects opened.
    pub objects_read: u64,
    /// Bytes fetched from the object store.
    pub bytes_read: u64,
    /// Records decoded.
    pub records_read: u64,
    /// Records emitted after filtering.
    pub records_matched: u64,
}

impl Progress {
    /// Fold `other` into `self`.
    pub fn add(&mut self, other: &Progress) {
        self.objects_read += other.objects_read;
        self.bytes_read += other.bytes_read;
        self.records_read += other.records_read;
        self.records_matched += other.records_matched;
    }
}

/// Shared progress counters; [`ProgressMeter::get`] returns a copy.
#[derive(Debug, Clone, Default)]
pub struct ProgressMeter(Arc<Mutex<Progress>>);

impl ProgressMeter {
    /// Zeroed meter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` to the counters.
    pub fn add(&self, delta: &Progress) {
        self.0.lock().add(delta);
    }

    /// Copy of the counters.
    pub fn get(&self) -> Progress {
        *self.0.lock()
    }
}

/// Puller over values already in memory.
pub struct VecPuller {
    batches: VecDeque<Batch>,
    progress: Progress,
}

impl VecPuller {
    /// Pull `values` in batches of at most `batch_size`.
    pub fn new(values: Vec<Value>, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        let mut batches = VecDeque::new();
        let mut iter = values.into_iter().peekable();
        while iter.peek().is_some() {
            batches.push_back(iter.by_ref().take(batch_size).collect());
        }
        Self {
            batches,
            progress: Progress::default(),
        }
    }

    /// Attach progress reported by the producer of the values.
    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }
}

#[async_trait]
impl Puller for VecPuller {
    async fn pull(&mut self, done: bool) -> LakeResult<Option<Batch>> {
        if done {
            self.batches.clear();
            return Ok(None);
        }
        Ok(self.batches.pop_front())
    }

    fn progress(&self) -> Progress {
        self.progress
    }
}

/// Drain a puller into a vector.
pub async fn collect(puller: &mut dyn Puller) -> LakeResult<Vec<Value>> {
    let mut out = Vec::new();
    while let Some(batch) = puller.pull(false).await? {
        out.extend(batch);
    }
    Ok(out)
}
