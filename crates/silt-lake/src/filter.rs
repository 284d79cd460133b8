//! Pushdown filters consumed by the planner.
//!
//! The query language is not part of the lake core; scans only need to know
//! the key range a filter can match and whether a single record passes.

use serde::{Deserialize, Serialize};
use silt_storage::{Layout, Span, Value};

/// Filter applied during a scan.
pub trait Filter: Send + Sync {
    /// Pool-key span outside of which no record can match, if known.
    fn span(&self, layout: &Layout) -> Option<Span>;
    /// True if `record` passes.
    fn matches(&self, layout: &Layout, record: &Value) -> bool;
}

/// Passes every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchAll;

impl Filter for MatchAll {
    fn span(&self, _layout: &Layout) -> Option<Span> {
        None
    }

    fn matches(&self, _layout: &Layout, _record: &Value) -> bool {
        true
    }
}

/// Records whose pool key lies in `[lo, hi]`. The bounds may be given in
/// either order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    /// One end of the range.
    pub lo: Value,
    /// The other end of the range.
    pub hi: Value,
}

impl KeyRange {
    /// Range between `lo` and `hi` inclusive.
    pub fn new(lo: impl Into<Value>, hi: impl Into<Value>) -> Self {
        Self {
            lo: lo.into(),
            hi: hi.into(),
        }
    }
}

impl Filter for KeyRange {
    fn span(&self, layout: &Layout) -> Option<Span> {
        Some(Span::new(layout, self.lo.clone(), self.hi.clone()))
    }

    fn matches(&self, layout: &Layout, record: &Value) -> bool {
        Span::new(layout, self.lo.clone(), self.hi.clone()).contains(layout, layout.key_of(record))
    }
}
