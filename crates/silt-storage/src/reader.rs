//! Ranged readers over data objects.

use std::ops::Range;

use bytes::Bytes;
use tracing::trace;

use crate::error::StorageResult;
use crate::frame::FrameDecoder;
use crate::layout::{Layout, Span};
use crate::object::DataObject;
use crate::seek::SeekIndex;
use crate::store::SharedStore;
use crate::uri::StorageUri;
use crate::value::Value;

/// Sectioned reader over a byte interval of one object's sequence blob.
///
/// The interval is fetched with a single positional read on first use and
/// decoded frame by frame.
pub struct ObjectReader {
    store: SharedStore,
    uri: StorageUri,
    range: Option<Range<u64>>,
    data: Option<Bytes>,
    pos: usize,
    bytes_read: u64,
    records_read: u64,
    closed: bool,
}

impl ObjectReader {
    /// Open a reader narrowed by the object's seek index.
    ///
    /// With neither `span` nor `counts` the reader covers the whole object.
    pub async fn open(
        store: SharedStore,
        dir: &StorageUri,
        object: &DataObject,
        layout: &Layout,
        span: Option<&Span>,
        counts: Option<Range<u64>>,
    ) -> StorageResult<Self> {
        let range = if span.is_none() && counts.is_none() {
            Some(0..object.size)
        } else {
            let seek = SeekIndex::load(store.as_ref(), &DataObject::seek_uri(dir, object.id)).await?;
            seek.lookup(layout, span, counts)
        };
        trace!(object = %object.id, range = ?range, "opened object reader");
        Ok(Self {
            store,
            uri: DataObject::sequence_uri(dir, object.id),
            range,
            data: None,
            pos: 0,
            bytes_read: 0,
            records_read: 0,
            closed: false,
        })
    }

    /// Byte interval this reader covers, if any.
    pub fn range(&self) -> Option<&Range<u64>> {
        self.range.as_ref()
    }

    /// Next record, or `None` at the end of the interval.
    pub async fn read(&mut self) -> StorageResult<Option<Value>> {
        if self.closed {
            return Ok(None);
        }
        let range = match &self.range {
            Some(r) if r.end > r.start => r.clone(),
            _ => return Ok(None),
        };
        if self.data.is_none() {
            let data = self
                .store
                .get_range(&self.uri, range.start, range.end - range.start)
                .await?;
            self.bytes_read += data.len() as u64;
            self.data = Some(data);
        }
        let data = match &self.data {
            Some(d) => d,
            None => return Ok(None),
        };
        let mut decoder = FrameDecoder::new(&data[self.pos..]);
        let item = decoder.next_item::<Value>()?;
        self.pos += decoder.position();
        if item.is_some() {
            self.records_read += 1;
        }
        Ok(item)
    }

    /// Read up to `max` records.
    pub async fn read_batch(&mut self, max: usize) -> StorageResult<Vec<Value>> {
        let mut out = Vec::with_capacity(max.min(1024));
        while out.len() < max {
            match self.read().await? {
                Some(v) => out.push(v),
                None => break,
            }
        }
        Ok(out)
    }

    /// Release the buffered interval. Further reads return end-of-stream.
    pub fn close(&mut self) {
        self.data = None;
        self.closed = true;
    }

    /// True once closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Bytes fetched from the store.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Records decoded.
    pub fn records_read(&self) -> u64 {
        self.records_read
    }
}

/// Read every record of an object.
pub async fn read_object(
    store: SharedStore,
    dir: &StorageUri,
    object: &DataObject,
    layout: &Layout,
) -> StorageResult<Vec<Value>> {
    let mut reader = ObjectReader::open(store, dir, object, layout, None, None).await?;
    let mut out = Vec::with_capacity(object.count as usize);
    while let Some(v) = reader.read().await? {
        out.push(v);
    }
    reader.close();
    Ok(out)
}
