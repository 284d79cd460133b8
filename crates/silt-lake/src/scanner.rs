//! Sequence scanner: reads partitions in pool-key order and merges the
//! objects inside each partition.
//!
//! Partitions are produced by a background task running the lister and
//! slicer and handed over through a bounded channel. The scanner opens the
//! readers of one partition at a time and releases them before moving on,
//! on `done`, on error and on cancellation.

use std::cmp::Ordering;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use silt_meta::View;
use silt_storage::{Layout, ObjectReader, SharedStore, Span, StorageResult, StorageUri, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{LakeError, LakeResult};
use crate::filter::Filter;
use crate::planner::{Lister, Partition, Slicer};
use crate::puller::{Batch, Progress, ProgressMeter, Puller};

/// Values per batch unless configured otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 1024;

/// Partitions buffered between the slicer and the scanner.
const PARTITION_QUEUE: usize = 4;

async fn guarded<T, F>(cancel: &CancellationToken, fut: F) -> LakeResult<T>
where
    F: Future<Output = StorageResult<T>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(LakeError::Cancelled),
        result = fut => Ok(result?),
    }
}

/// K-way merge over the readers of one partition. Each reader keeps its
/// next value buffered so exhaustion is known as soon as the last value is
/// taken.
struct Merge {
    readers: Vec<ObjectReader>,
    heads: Vec<Option<Value>>,
}

impl Merge {
    async fn open(readers: Vec<ObjectReader>, cancel: &CancellationToken) -> LakeResult<Self> {
        let mut merge = Merge {
            heads: Vec::with_capacity(readers.len()),
            readers,
        };
        for i in 0..merge.readers.len() {
            let head = guarded(cancel, merge.readers[i].read()).await?;
            if head.is_none() {
                merge.readers[i].close();
            }
            merge.heads.push(head);
        }
        Ok(merge)
    }

    fn exhausted(&self) -> bool {
        self.heads.iter().all(Option::is_none)
    }

    async fn next(&mut self, layout: &Layout, cancel: &CancellationToken) -> LakeResult<Option<Value>> {
        let pick = if self.heads.len() == 1 {
            if self.heads[0].is_some() {
                Some(0)
            } else {
                None
            }
        } else {
            let mut best: Option<usize> = None;
            for (i, head) in self.heads.iter().enumerate() {
                let Some(v) = head else { continue };
                best = match best {
                    Some(b) => match self.heads[b].as_ref() {
                        Some(bv) if layout.compare_records(v, bv) == Ordering::Less => Some(i),
                        _ => Some(b),
                    },
                    None => Some(i),
                };
            }
            best
        };
        let Some(i) = pick else { return Ok(None) };
        let value = self.heads[i].take();
        let next = guarded(cancel, self.readers[i].read()).await?;
        if next.is_none() {
            self.readers[i].close();
        }
        self.heads[i] = next;
        Ok(value)
    }

    fn open_readers(&self) -> usize {
        self.readers.iter().filter(|r| !r.is_closed()).count()
    }

    fn bytes_read(&self) -> u64 {
        self.readers.iter().map(|r| r.bytes_read()).sum()
    }

    fn close(&mut self) {
        for reader in &mut self.readers {
            reader.close();
        }
        for head in &mut self.heads {
            *head = None;
        }
    }
}

struct PartitionScan {
    span: Span,
    merge: Merge,
    progress: Progress,
}

impl PartitionScan {
    /// Fill one batch. Returns the batch and whether the partition is done.
    async fn fill(
        &mut self,
        layout: &Layout,
        filter: &dyn Filter,
        batch_size: usize,
        cancel: &CancellationToken,
    ) -> LakeResult<(Batch, bool)> {
        let mut batch = Vec::new();
        while batch.len() < batch_size {
            let Some(value) = self.merge.next(layout, cancel).await? else {
                break;
            };
            self.progress.records_read += 1;
            if self.span.contains(layout, layout.key_of(&value)) && filter.matches(layout, &value) {
                self.progress.records_matched += 1;
                batch.push(value);
            }
        }
        Ok((batch, self.merge.exhausted()))
    }
}

/// Scanner over one snapshot of a pool.
pub struct SequenceScanner {
    store: SharedStore,
    dir: StorageUri,
    layout: Layout,
    filter: Arc<dyn Filter>,
    narrow: Option<Span>,
    batch_size: usize,
    cancel: CancellationToken,
    partitions: mpsc::Receiver<Partition>,
    producer: JoinHandle<()>,
    current: Option<PartitionScan>,
    meter: ProgressMeter,
    failed: Option<Arc<LakeError>>,
    finished: bool,
}

impl SequenceScanner {
    /// Scan the objects of `view` under `layout`, reading data blobs from
    /// `dir`. Must be called inside a tokio runtime.
    pub fn new(
        store: SharedStore,
        dir: StorageUri,
        layout: Layout,
        view: &dyn View,
        filter: Arc<dyn Filter>,
        cancel: CancellationToken,
    ) -> Self {
        let narrow = filter.span(&layout);
        let slicer = Slicer::new(Lister::new(view, &layout, narrow.as_ref()), layout.clone());
        let (tx, rx) = mpsc::channel(PARTITION_QUEUE);
        let producer_cancel = cancel.child_token();
        let producer = tokio::spawn(async move {
            for partition in slicer {
                tokio::select! {
                    biased;
                    () = producer_cancel.cancelled() => break,
                    sent = tx.send(partition) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Self {
            store,
            dir,
            layout,
            filter,
            narrow,
            batch_size: DEFAULT_BATCH_SIZE,
            cancel,
            partitions: rx,
            producer,
            current: None,
            meter: ProgressMeter::new(),
            failed: None,
            finished: false,
        }
    }

    /// Set the maximum batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Data-object readers currently open.
    pub fn open_readers(&self) -> usize {
        self.current.as_ref().map_or(0, |p| p.merge.open_readers())
    }

    async fn open_partition(&self, partition: Partition) -> LakeResult<PartitionScan> {
        let mut readers = Vec::with_capacity(partition.objects.len());
        for object in &partition.objects {
            let reader = guarded(
                &self.cancel,
                ObjectReader::open(
                    self.store.clone(),
                    &self.dir,
                    object,
                    &self.layout,
                    self.narrow.as_ref(),
                    None,
                ),
            )
            .await;
            match reader {
                Ok(reader) => readers.push(reader),
                Err(e) => {
                    for r in &mut readers {
                        r.close();
                    }
                    return Err(e);
                }
            }
        }
        trace!(span = %partition.span, objects = readers.len(), "partition opened");
        let progress = Progress {
            objects_read: readers.len() as u64,
            ..Progress::default()
        };
        let merge = Merge::open(readers, &self.cancel).await?;
        Ok(PartitionScan {
            span: partition.span,
            merge,
            progress,
        })
    }

    fn release(&mut self) {
        if let Some(mut scan) = self.current.take() {
            scan.merge.close();
        }
        self.partitions.close();
        self.producer.abort();
    }

    fn fail(&mut self, err: LakeError) -> LakeResult<Option<Batch>> {
        self.release();
        debug!(error = %err, "scan stopped");
        let err = Arc::new(err);
        self.failed = Some(err.clone());
        Err(LakeError::Shared(err))
    }
}

#[async_trait]
impl Puller for SequenceScanner {
    async fn pull(&mut self, done: bool) -> LakeResult<Option<Batch>> {
        if let Some(err) = &self.failed {
            return Err(LakeError::Shared(err.clone()));
        }
        if done || self.finished {
            self.release();
            self.finished = true;
            return Ok(None);
        }
        if self.cancel.is_cancelled() {
            return self.fail(LakeError::Cancelled);
        }
        loop {
            if self.current.is_none() {
                let next = tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => None,
                    p = self.partitions.recv() => Some(p),
                };
                match next {
                    None => return self.fail(LakeError::Cancelled),
                    Some(None) => {
                        self.release();
                        self.finished = true;
                        return Ok(None);
                    }
                    Some(Some(partition)) => match self.open_partition(partition).await {
                        Ok(scan) => self.current = Some(scan),
                        Err(e) => return self.fail(e),
                    },
                }
            }
            let filled = match self.current.as_mut() {
                Some(scan) => {
                    scan.fill(&self.layout, self.filter.as_ref(), self.batch_size, &self.cancel)
                        .await
                }
                None => continue,
            };
            let (batch, exhausted) = match filled {
                Ok(filled) => filled,
                Err(e) => return self.fail(e),
            };
            if exhausted {
                if let Some(mut scan) = self.current.take() {
                    scan.progress.bytes_read = scan.merge.bytes_read();
                    scan.merge.close();
                    self.meter.add(&scan.progress);
                }
            }
            if !batch.is_empty() {
                return Ok(Some(batch));
            }
        }
    }

    fn progress(&self) -> Progress {
        self.meter.get()
    }
}

impl Drop for SequenceScanner {
    fn drop(&mut self) {
        self.release();
    }
}
