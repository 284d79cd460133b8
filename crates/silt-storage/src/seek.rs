//! Seek index: coarse sections of a data object for ranged reads.
//!
//! Entry `i` describes the section ending at `entries[i].offset`, which
//! starts where entry `i - 1` ended (or at zero). `count` is the cumulative
//! record count at the end of the section.

use std::ops::Range;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::StorageResult;
use crate::frame::{decode_frames, encode_frames};
use crate::layout::{Layout, Span};
use crate::store::ObjectStore;
use crate::uri::StorageUri;
use crate::value::Value;

/// One section of a data object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeekEntry {
    /// Smallest key in the section.
    pub min: Value,
    /// Largest key in the section.
    pub max: Value,
    /// Records written up to the end of the section.
    pub count: u64,
    /// Byte offset of the end of the section.
    pub offset: u64,
}

/// Ordered seek entries of one object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeekIndex {
    entries: Vec<SeekEntry>,
}

impl SeekIndex {
    /// Wrap entries produced by a writer.
    pub fn new(entries: Vec<SeekEntry>) -> Self {
        Self { entries }
    }

    /// The entries.
    pub fn entries(&self) -> &[SeekEntry] {
        &self.entries
    }

    /// Number of entries, including the closing entry.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize for storage.
    pub fn encode(&self) -> StorageResult<Bytes> {
        Ok(Bytes::from(encode_frames(&self.entries)?))
    }

    /// Read a stored index.
    pub async fn load(store: &dyn ObjectStore, uri: &StorageUri) -> StorageResult<Self> {
        let data = store.get(uri).await?;
        Ok(Self::new(decode_frames(&data)?))
    }

    /// Smallest byte interval whose sections cover `span` and, if given,
    /// overlap the half-open record-count interval `counts`.
    ///
    /// Without either filter the whole object is returned. `None` means no
    /// section can hold a matching record.
    pub fn lookup(
        &self,
        layout: &Layout,
        span: Option<&Span>,
        counts: Option<Range<u64>>,
    ) -> Option<Range<u64>> {
        let mut start = None;
        let mut end = 0;
        let mut prev_offset = 0;
        let mut prev_count = 0;
        for entry in &self.entries {
            let section = Span {
                lo: entry.min.clone(),
                hi: entry.max.clone(),
            };
            let key_ok = span.map_or(true, |s| s.overlaps(layout, &section));
            let count_ok = counts
                .as_ref()
                .map_or(true, |c| prev_count < c.end && c.start < entry.count);
            if key_ok && count_ok && entry.offset > prev_offset {
                start.get_or_insert(prev_offset);
                end = entry.offset;
            }
            prev_offset = entry.offset;
            prev_count = entry.count;
        }
        start.map(|s| s..end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(min: i64, max: i64, count: u64, offset: u64) -> SeekEntry {
        SeekEntry {
            min: Value::Int(min),
            max: Value::Int(max),
            count,
            offset,
        }
    }

    fn index() -> SeekIndex {
        SeekIndex::new(vec![
            entry(0, 9, 10, 100),
            entry(10, 19, 20, 200),
            entry(20, 29, 30, 300),
            entry(29, 29, 30, 300),
        ])
    }

    #[test]
    fn test_lookup_whole_object() {
        let l = Layout::asc("k");
        assert_eq!(index().lookup(&l, None, None), Some(0..300));
    }

    #[test]
    fn test_lookup_key_span() {
        let l = Layout::asc("k");
        let span = Span {
            lo: Value::Int(12),
            hi: Value::Int(22),
        };
        assert_eq!(index().lookup(&l, Some(&span), None), Some(100..300));
        let miss = Span::point(Value::Int(99));
        assert_eq!(index().lookup(&l, Some(&miss), None), None);
    }

    #[test]
    fn test_lookup_count_span() {
        let l = Layout::asc("k");
        assert_eq!(index().lookup(&l, None, Some(10..20)), Some(100..200));
        assert_eq!(index().lookup(&l, None, Some(5..11)), Some(0..200));
    }

    #[test]
    fn test_empty_index() {
        let l = Layout::asc("k");
        assert_eq!(SeekIndex::default().lookup(&l, None, None), None);
    }
}
