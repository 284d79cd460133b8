//! Data object metadata and blob naming.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StorageResult;
use crate::id::Id;
use crate::layout::{Layout, SortOrder, Span};
use crate::store::ObjectStore;
use crate::uri::StorageUri;
use crate::value::Value;

/// File extension of every blob the lake writes.
pub const BLOB_EXT: &str = "bin";

/// Metadata of one immutable data object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataObject {
    /// Unique id; also names the object's blobs.
    pub id: Id,
    /// Smallest pool key in the object (low end of its span).
    pub min: Value,
    /// Largest pool key in the object (high end of its span).
    pub max: Value,
    /// Number of records.
    pub count: u64,
    /// Size of the sequence blob in bytes.
    pub size: u64,
    /// Unix milliseconds of the commit that added the object, when recorded.
    #[serde(default)]
    pub created: Option<i64>,
}

impl DataObject {
    /// Key span of the object.
    pub fn span(&self) -> Span {
        Span {
            lo: self.min.clone(),
            hi: self.max.clone(),
        }
    }

    /// Reference time used to judge the object's age: the recorded commit
    /// time, or the time embedded in the id for objects without one.
    pub fn age_origin_ms(&self) -> i64 {
        self.created
            .unwrap_or_else(|| i64::try_from(self.id.timestamp_ms()).unwrap_or(i64::MAX))
    }

    /// Sequence blob location.
    pub fn sequence_uri(dir: &StorageUri, id: Id) -> StorageUri {
        dir.join(&format!("{}.{}", id, BLOB_EXT))
    }

    /// Seek index blob location.
    pub fn seek_uri(dir: &StorageUri, id: Id) -> StorageUri {
        dir.join(&format!("{}-seek.{}", id, BLOB_EXT))
    }

    /// Vector blob location.
    pub fn vector_uri(dir: &StorageUri, id: Id) -> StorageUri {
        dir.join(&format!("{}-vector.{}", id, BLOB_EXT))
    }

    /// Recover the object id from any of its blob names.
    pub fn id_from_blob_name(name: &str) -> Option<Id> {
        let stem = name.strip_suffix(&format!(".{}", BLOB_EXT))?;
        let stem = stem
            .strip_suffix("-seek")
            .or_else(|| stem.strip_suffix("-vector"))
            .unwrap_or(stem);
        stem.parse().ok()
    }

    /// Delete every blob of object `id`, ignoring missing ones.
    pub async fn remove(store: &dyn ObjectStore, dir: &StorageUri, id: Id) -> StorageResult<()> {
        for uri in [
            Self::sequence_uri(dir, id),
            Self::seek_uri(dir, id),
            Self::vector_uri(dir, id),
        ] {
            store.delete(&uri).await?;
        }
        debug!(object = %id, "removed data object blobs");
        Ok(())
    }
}

impl fmt::Display for DataObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} records in {} bytes [{},{}]",
            self.id, self.count, self.size, self.min, self.max
        )
    }
}

/// Total order of objects in pool-key order.
///
/// Ascending pools order by `min`, then `max`, then `count`, then id.
/// Descending pools order by `max`, then `min`, then `count`, then id, all
/// reversed.
pub fn compare_objects(layout: &Layout, a: &DataObject, b: &DataObject) -> Ordering {
    match layout.order {
        SortOrder::Asc => layout
            .value_cmp(&a.min, &b.min)
            .then_with(|| layout.value_cmp(&a.max, &b.max))
            .then_with(|| a.count.cmp(&b.count))
            .then_with(|| a.id.cmp(&b.id)),
        SortOrder::Desc => layout
            .value_cmp(&b.max, &a.max)
            .then_with(|| layout.value_cmp(&b.min, &a.min))
            .then_with(|| b.count.cmp(&a.count))
            .then_with(|| b.id.cmp(&a.id)),
    }
}

/// Sort objects in place by [`compare_objects`].
pub fn sort_objects(layout: &Layout, objects: &mut [DataObject]) {
    objects.sort_by(|a, b| compare_objects(layout, a, b));
}
