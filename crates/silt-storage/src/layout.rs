//! Pool sort layouts and key spans.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::value::Value;

/// Sort direction of a pool key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Smallest key first.
    #[default]
    Asc,
    /// Largest key first.
    Desc,
}

/// Where nulls land in the emitted order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Nulls {
    /// Nulls are emitted before every other key (nulls-min for ascending).
    First,
    /// Nulls are emitted after every other key (nulls-max for ascending).
    #[default]
    Last,
}

/// Sort-key layout of a pool: key path, direction and null placement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Layout {
    /// Dotted path of the pool key inside each record.
    pub key: String,
    /// Direction.
    pub order: SortOrder,
    /// Null placement.
    #[serde(default)]
    pub nulls: Nulls,
}

impl Layout {
    /// Layout with nulls emitted last.
    pub fn new(key: impl Into<String>, order: SortOrder) -> Self {
        Self {
            key: key.into(),
            order,
            nulls: Nulls::Last,
        }
    }

    /// Ascending layout on `key`.
    pub fn asc(key: impl Into<String>) -> Self {
        Self::new(key, SortOrder::Asc)
    }

    /// Descending layout on `key`.
    pub fn desc(key: impl Into<String>) -> Self {
        Self::new(key, SortOrder::Desc)
    }

    /// The pool key of a record.
    pub fn key_of<'a>(&self, record: &'a Value) -> &'a Value {
        record.path(&self.key)
    }

    fn null_is_low(&self) -> bool {
        matches!(
            (self.order, self.nulls),
            (SortOrder::Asc, Nulls::First) | (SortOrder::Desc, Nulls::Last)
        )
    }

    /// Direction-free key order: the order in which spans are expressed.
    /// Nulls sit at the low or high end so that the emitted order places
    /// them where the layout asks.
    pub fn value_cmp(&self, a: &Value, b: &Value) -> Ordering {
        match (a.is_null(), b.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => {
                if self.null_is_low() {
                    Ordering::Less
                } else {
                    Ordering::Greater
                }
            }
            (false, true) => {
                if self.null_is_low() {
                    Ordering::Greater
                } else {
                    Ordering::Less
                }
            }
            (false, false) => a.cmp(b),
        }
    }

    /// Key comparator in emitted order.
    pub fn compare_keys(&self, a: &Value, b: &Value) -> Ordering {
        match self.order {
            SortOrder::Asc => self.value_cmp(a, b),
            SortOrder::Desc => self.value_cmp(b, a),
        }
    }

    /// Record comparator in emitted order.
    pub fn compare_records(&self, a: &Value, b: &Value) -> Ordering {
        self.compare_keys(self.key_of(a), self.key_of(b))
    }
}

impl Default for Layout {
    fn default() -> Self {
        Layout::asc("ts")
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let order = match self.order {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        };
        write!(f, "{}:{}", self.key, order)?;
        if self.nulls == Nulls::First {
            f.write_str(":nullsfirst")?;
        }
        Ok(())
    }
}

impl FromStr for Layout {
    type Err = StorageError;

    /// Parse `key[:asc|:desc][:nullsfirst|:nullslast]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let key = parts.next().unwrap_or_default().trim();
        if key.is_empty() {
            return Err(StorageError::InvalidLayout(format!("empty key in {:?}", s)));
        }
        let mut layout = Layout::asc(key);
        for part in parts {
            match part.trim().to_ascii_lowercase().as_str() {
                "asc" => layout.order = SortOrder::Asc,
                "desc" => layout.order = SortOrder::Desc,
                "nullsfirst" => layout.nulls = Nulls::First,
                "nullslast" => layout.nulls = Nulls::Last,
                other => {
                    return Err(StorageError::InvalidLayout(format!(
                        "unknown option {:?}",
                        other
                    )))
                }
            }
        }
        Ok(layout)
    }
}

/// Closed key interval `[lo, hi]` under a layout's `value_cmp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    /// Low end.
    pub lo: Value,
    /// High end.
    pub hi: Value,
}

impl Span {
    /// Span over two keys given in any order.
    pub fn new(layout: &Layout, a: Value, b: Value) -> Self {
        if layout.value_cmp(&a, &b) == Ordering::Greater {
            Span { lo: b, hi: a }
        } else {
            Span { lo: a, hi: b }
        }
    }

    /// Degenerate span holding one key.
    pub fn point(key: Value) -> Self {
        Span {
            lo: key.clone(),
            hi: key,
        }
    }

    /// True if the intervals share at least one key.
    pub fn overlaps(&self, layout: &Layout, other: &Span) -> bool {
        layout.value_cmp(&self.lo, &other.hi) != Ordering::Greater
            && layout.value_cmp(&other.lo, &self.hi) != Ordering::Greater
    }

    /// True if `key` lies inside the interval.
    pub fn contains(&self, layout: &Layout, key: &Value) -> bool {
        layout.value_cmp(&self.lo, key) != Ordering::Greater
            && layout.value_cmp(key, &self.hi) != Ordering::Greater
    }

    /// Grow to cover `other`.
    pub fn extend(&mut self, layout: &Layout, other: &Span) {
        if layout.value_cmp(&other.lo, &self.lo) == Ordering::Less {
            self.lo = other.lo.clone();
        }
        if layout.value_cmp(&other.hi, &self.hi) == Ordering::Greater {
            self.hi = other.hi.clone();
        }
    }

    /// Grow to cover `key`.
    pub fn extend_key(&mut self, layout: &Layout, key: &Value) {
        if layout.value_cmp(key, &self.lo) == Ordering::Less {
            self.lo = key.clone();
        }
        if layout.value_cmp(key, &self.hi) == Ordering::Greater {
            self.hi = key.clone();
        }
    }

    /// Smallest span covering both.
    pub fn union(&self, layout: &Layout, other: &Span) -> Span {
        let mut out = self.clone();
        out.extend(layout, other);
        out
    }

    /// The end of the interval that comes first in emitted order.
    pub fn first(&self, layout: &Layout) -> &Value {
        match layout.order {
            SortOrder::Asc => &self.lo,
            SortOrder::Desc => &self.hi,
        }
    }

    /// The end of the interval that comes last in emitted order.
    pub fn last(&self, layout: &Layout) -> &Value {
        match layout.order {
            SortOrder::Asc => &self.hi,
            SortOrder::Desc => &self.lo,
        }
    }

    /// True if `next` begins strictly after this span ends in emitted order.
    pub fn is_before(&self, layout: &Layout, next: &Span) -> bool {
        layout.compare_keys(self.last(layout), next.first(layout)) == Ordering::Less
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.lo, self.hi)
    }
}
