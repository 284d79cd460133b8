//! Streaming writer for data objects.

use std::cmp::Ordering;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::{StorageError, StorageResult};
use crate::frame::encode_frame;
use crate::id::Id;
use crate::layout::{Layout, Span};
use crate::object::DataObject;
use crate::seek::{SeekEntry, SeekIndex};
use crate::store::SharedStore;
use crate::uri::StorageUri;
use crate::value::Value;

/// Default number of encoded bytes per seek section.
pub const DEFAULT_SEEK_STRIDE: u64 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Open,
    Closed,
    Aborted,
}

impl WriterState {
    fn name(&self) -> &'static str {
        match self {
            WriterState::Open => "open",
            WriterState::Closed => "closed",
            WriterState::Aborted => "aborted",
        }
    }
}

/// Writes one data object from values arriving in pool-key order.
///
/// Nothing becomes visible in the store until [`ObjectWriter::close`],
/// which puts the sequence blob and then the seek index, each atomically.
pub struct ObjectWriter {
    store: SharedStore,
    dir: StorageUri,
    layout: Layout,
    stride: u64,
    id: Id,
    buf: Vec<u8>,
    entries: Vec<SeekEntry>,
    span: Option<Span>,
    section: Option<Span>,
    section_bytes: u64,
    last: Option<Value>,
    count: u64,
    state: WriterState,
}

impl ObjectWriter {
    /// Start a new object under `dir`.
    pub fn new(store: SharedStore, dir: StorageUri, layout: Layout, stride: u64) -> Self {
        Self {
            store,
            dir,
            layout,
            stride: stride.max(1),
            id: Id::new(),
            buf: Vec::new(),
            entries: Vec::new(),
            span: None,
            section: None,
            section_bytes: 0,
            last: None,
            count: 0,
            state: WriterState::Open,
        }
    }

    /// Id the object will be stored under.
    pub fn id(&self) -> Id {
        self.id
    }

    /// Encoded bytes buffered so far.
    pub fn bytes_written(&self) -> u64 {
        self.buf.len() as u64
    }

    /// Records written so far.
    pub fn records_written(&self) -> u64 {
        self.count
    }

    fn check_open(&self) -> StorageResult<()> {
        if self.state != WriterState::Open {
            return Err(StorageError::WriterState {
                id: self.id.to_string(),
                state: self.state.name(),
            });
        }
        Ok(())
    }

    /// Append one record. Keys must not go backwards in layout order.
    pub fn write(&mut self, record: &Value) -> StorageResult<()> {
        self.check_open()?;
        let key = self.layout.key_of(record).clone();
        if let Some(last) = &self.last {
            if self.layout.compare_keys(last, &key) == Ordering::Greater {
                return Err(StorageError::OutOfOrder {
                    reason: format!("key {} after {} in {}", key, last, self.id),
                });
            }
        }
        let n = encode_frame(&mut self.buf, record)? as u64;
        let point = Span::point(key.clone());
        match &mut self.section {
            Some(s) => s.extend(&self.layout, &point),
            None => self.section = Some(point.clone()),
        }
        match &mut self.span {
            Some(s) => s.extend(&self.layout, &point),
            None => self.span = Some(point),
        }
        self.last = Some(key);
        self.count += 1;
        self.section_bytes += n;
        if self.section_bytes >= self.stride {
            self.end_section();
        }
        Ok(())
    }

    fn end_section(&mut self) {
        if let Some(section) = self.section.take() {
            self.entries.push(SeekEntry {
                min: section.lo,
                max: section.hi,
                count: self.count,
                offset: self.buf.len() as u64,
            });
        }
        self.section_bytes = 0;
    }

    /// Finish the object: write the closing seek entry and persist both
    /// blobs. Returns the object's metadata.
    pub async fn close(mut self) -> StorageResult<DataObject> {
        self.check_open()?;
        let closing = match self.section.take() {
            Some(section) => section,
            None => match &self.last {
                Some(last) => Span::point(last.clone()),
                None => Span::point(Value::Null),
            },
        };
        self.entries.push(SeekEntry {
            min: closing.lo,
            max: closing.hi,
            count: self.count,
            offset: self.buf.len() as u64,
        });
        self.state = WriterState::Closed;

        let span = self.span.take().unwrap_or_else(|| Span::point(Value::Null));
        let object = DataObject {
            id: self.id,
            min: span.lo,
            max: span.hi,
            count: self.count,
            size: self.buf.len() as u64,
            created: None,
        };
        let seq_uri = DataObject::sequence_uri(&self.dir, self.id);
        let seek_uri = DataObject::seek_uri(&self.dir, self.id);
        let seek = SeekIndex::new(std::mem::take(&mut self.entries)).encode()?;
        let data = Bytes::from(std::mem::take(&mut self.buf));
        self.store.put(&seq_uri, data).await?;
        if let Err(e) = self.store.put(&seek_uri, seek).await {
            warn!(object = %self.id, error = %e, "seek index put failed, removing sequence blob");
            if let Err(cleanup) = self.store.delete(&seq_uri).await {
                warn!(object = %self.id, error = %cleanup, "failed to remove orphaned sequence blob");
            }
            return Err(e);
        }
        debug!(
            object = %object.id,
            count = object.count,
            size = object.size,
            "closed data object"
        );
        Ok(object)
    }

    /// Discard everything written so far. Safe to call more than once.
    pub fn abort(&mut self) {
        if self.state == WriterState::Open {
            debug!(object = %self.id, records = self.count, "aborting data object");
        }
        self.buf.clear();
        self.entries.clear();
        self.section = None;
        self.span = None;
        self.state = WriterState::Aborted;
    }
}
