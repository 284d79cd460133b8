//! Hierarchical storage URIs (`scheme://authority/path`).

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// Scheme of local filesystem URIs.
pub const FILE_SCHEME: &str = "file";
/// Scheme of the in-memory object backend.
pub const MEM_SCHEME: &str = "mem";

/// A parsed storage location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorageUri {
    scheme: String,
    authority: String,
    path: String,
}

impl StorageUri {
    /// Parse `scheme://authority/path`, or a bare absolute path as `file`.
    pub fn parse(s: &str) -> StorageResult<Self> {
        if s.starts_with('/') {
            return Ok(Self {
                scheme: FILE_SCHEME.to_string(),
                authority: String::new(),
                path: normalize(s),
            });
        }
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| StorageError::InvalidUri(s.to_string()))?;
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(StorageError::InvalidUri(s.to_string()));
        }
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, ""),
        };
        if scheme == FILE_SCHEME && !authority.is_empty() && authority != "localhost" {
            return Err(StorageError::InvalidUri(s.to_string()));
        }
        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            authority: if scheme == FILE_SCHEME {
                String::new()
            } else {
                authority.to_string()
            },
            path: normalize(path),
        })
    }

    /// The URI scheme.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The authority (bucket or host) part; empty for `file`.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// The path part, always starting with `/` unless empty.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Append a path element with `/` separation.
    pub fn join(&self, name: &str) -> Self {
        let name = name.trim_matches('/');
        let mut path = self.path.trim_end_matches('/').to_string();
        path.push('/');
        path.push_str(name);
        Self {
            scheme: self.scheme.clone(),
            authority: self.authority.clone(),
            path,
        }
    }

    /// The last path element.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or_default()
    }

    /// True if this URI names something strictly beneath `prefix`.
    pub fn is_under(&self, prefix: &StorageUri) -> bool {
        let mut dir = prefix.to_string();
        if !dir.ends_with('/') {
            dir.push('/');
        }
        self.to_string().starts_with(&dir)
    }

    /// Local filesystem path for `file` URIs.
    pub fn to_file_path(&self) -> Option<PathBuf> {
        (self.scheme == FILE_SCHEME).then(|| PathBuf::from(&self.path))
    }
}

fn normalize(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for seg in path.split('/').filter(|s| !s.is_empty()) {
        out.push('/');
        out.push_str(seg);
    }
    out
}

impl fmt::Display for StorageUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.authority, self.path)
    }
}

impl FromStr for StorageUri {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StorageUri::parse(s)
    }
}

impl TryFrom<String> for StorageUri {
    type Error = StorageError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        StorageUri::parse(&s)
    }
}

impl From<StorageUri> for String {
    fn from(uri: StorageUri) -> Self {
        uri.to_string()
    }
}
