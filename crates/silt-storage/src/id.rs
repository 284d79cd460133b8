//! K-sortable unique ids for pools, commits and data objects.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::StorageError;

/// A time-ordered unique identifier.
///
/// Ids generated later sort after ids generated earlier (at millisecond
/// granularity), and the creation time can be recovered from the id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(Ulid);

impl Id {
    /// Generate a fresh id stamped with the current time.
    pub fn new() -> Self {
        Id(Ulid::new())
    }

    /// The all-zero id, used as "no parent".
    pub const fn nil() -> Self {
        Id(Ulid::nil())
    }

    /// Build an id from an explicit millisecond timestamp and random part.
    pub fn from_parts(timestamp_ms: u64, random: u128) -> Self {
        Id(Ulid::from_parts(timestamp_ms, random))
    }

    /// True for the nil id.
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// Unix milliseconds embedded in the id.
    pub fn timestamp_ms(&self) -> u64 {
        self.0.timestamp_ms()
    }
}

impl Default for Id {
    fn default() -> Self {
        Id::nil()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.0)
    }
}

impl FromStr for Id {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s)
            .map(Id)
            .map_err(|_| StorageError::InvalidId(s.to_string()))
    }
}
