//! Commit actions: the tagged records stored in a commit object.

use serde::{Deserialize, Serialize};
use silt_storage::{DataObject, Id, Value};

/// Header of every commit object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitHeader {
    /// Commit id.
    pub id: Id,
    /// Parent commit id; nil for a root commit.
    pub parent: Id,
    /// Number of times the writer rebuilt this commit after losing a race.
    pub retries: u8,
    /// Free-form author string.
    pub author: String,
    /// Unix milliseconds when the commit was built.
    pub date: i64,
    /// Commit message.
    pub message: String,
}

/// One record of a commit object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Commit header; always first.
    Commit(CommitHeader),
    /// Add a data object.
    Add {
        /// Owning commit.
        commit: Id,
        /// The object's metadata.
        object: DataObject,
    },
    /// Delete a data object.
    Delete {
        /// Owning commit.
        commit: Id,
        /// Object id.
        id: Id,
    },
    /// Mark an object's vector blob as present.
    AddVector {
        /// Owning commit.
        commit: Id,
        /// Object id.
        id: Id,
    },
    /// Mark an object's vector blob as gone.
    DeleteVector {
        /// Owning commit.
        commit: Id,
        /// Object id.
        id: Id,
    },
    /// Search index built for an object. Decoded so that commit logs written
    /// by an indexing lake stay readable; silt never writes one and
    /// snapshots ignore it.
    AddIndex {
        /// Owning commit.
        commit: Id,
        /// Index rule name.
        rule: String,
        /// Object id.
        id: Id,
    },
}

impl Action {
    /// Id of the commit the action belongs to.
    pub fn commit_id(&self) -> Id {
        match self {
            Action::Commit(h) => h.id,
            Action::Add { commit, .. }
            | Action::Delete { commit, .. }
            | Action::AddVector { commit, .. }
            | Action::DeleteVector { commit, .. }
            | Action::AddIndex { commit, .. } => *commit,
        }
    }

    /// Short kind name.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Commit(_) => "commit",
            Action::Add { .. } => "add",
            Action::Delete { .. } => "delete",
            Action::AddVector { .. } => "add_vector",
            Action::DeleteVector { .. } => "delete_vector",
            Action::AddIndex { .. } => "add_index",
        }
    }

    /// Render as a metadata row for log queries.
    pub fn to_record(&self) -> Value {
        let kind = ("kind", Value::from(self.kind()));
        match self {
            Action::Commit(h) => Value::record([
                kind,
                ("id", Value::from(h.id.to_string())),
                ("parent", Value::from(h.parent.to_string())),
                ("retries", Value::Int(i64::from(h.retries))),
                ("author", Value::from(h.author.clone())),
                ("date", Value::Int(h.date)),
                ("message", Value::from(h.message.clone())),
            ]),
            Action::Add { commit, object } => Value::record([
                kind,
                ("commit", Value::from(commit.to_string())),
                ("id", Value::from(object.id.to_string())),
                ("min", object.min.clone()),
                ("max", object.max.clone()),
                ("count", Value::from(object.count)),
                ("size", Value::from(object.size)),
            ]),
            Action::Delete { commit, id }
            | Action::AddVector { commit, id }
            | Action::DeleteVector { commit, id } => Value::record([
                kind,
                ("commit", Value::from(commit.to_string())),
                ("id", Value::from(id.to_string())),
            ]),
            Action::AddIndex { commit, rule, id } => Value::record([
                kind,
                ("commit", Value::from(commit.to_string())),
                ("rule", Value::from(rule.clone())),
                ("id", Value::from(id.to_string())),
            ]),
        }
    }
}
