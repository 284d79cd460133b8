//! Commit objects and their blob encoding.
//!
//! A commit blob is a sequence of frames (see `silt_storage::frame`), one
//! per action, header first.

use bytes::Bytes;
use silt_storage::{encode_frame, DataObject, FrameDecoder, Id, StorageError};

use crate::actions::{Action, CommitHeader};
use crate::error::{MetaError, MetaResult};

/// Default author recorded on commits.
pub const DEFAULT_AUTHOR: &str = "silt";

/// An ordered action list headed by a [`CommitHeader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitObject {
    header: CommitHeader,
    actions: Vec<Action>,
}

impl CommitObject {
    /// Start a commit on top of `parent` stamped with the current time.
    pub fn new(parent: Id, retries: u8, author: &str, message: &str) -> Self {
        Self::with_header(CommitHeader {
            id: Id::new(),
            parent,
            retries,
            author: author.to_string(),
            date: chrono::Utc::now().timestamp_millis(),
            message: message.to_string(),
        })
    }

    /// Start a commit with an explicit header.
    pub fn with_header(header: CommitHeader) -> Self {
        Self {
            actions: vec![Action::Commit(header.clone())],
            header,
        }
    }

    /// The header.
    pub fn header(&self) -> &CommitHeader {
        &self.header
    }

    /// Commit id.
    pub fn id(&self) -> Id {
        self.header.id
    }

    /// Parent commit id.
    pub fn parent(&self) -> Id {
        self.header.parent
    }

    /// All actions, header first.
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// True if nothing beyond the header was recorded.
    pub fn is_empty(&self) -> bool {
        self.actions.len() <= 1
    }

    /// Record an object addition, stamping the object with the commit time.
    pub fn append_add(&mut self, object: &DataObject) {
        let mut object = object.clone();
        object.created = Some(self.header.date);
        self.actions.push(Action::Add {
            commit: self.header.id,
            object,
        });
    }

    /// Record an object addition keeping the object's existing timestamps.
    pub fn append_readd(&mut self, object: &DataObject) {
        self.actions.push(Action::Add {
            commit: self.header.id,
            object: object.clone(),
        });
    }

    /// Record an object deletion.
    pub fn append_delete(&mut self, id: Id) {
        self.actions.push(Action::Delete {
            commit: self.header.id,
            id,
        });
    }

    /// Record a vector addition.
    pub fn append_add_vector(&mut self, id: Id) {
        self.actions.push(Action::AddVector {
            commit: self.header.id,
            id,
        });
    }

    /// Record a vector deletion.
    pub fn append_delete_vector(&mut self, id: Id) {
        self.actions.push(Action::DeleteVector {
            commit: self.header.id,
            id,
        });
    }

    /// Encode as a commit blob.
    pub fn serialize(&self) -> MetaResult<Bytes> {
        let mut buf = Vec::new();
        for action in &self.actions {
            encode_frame(&mut buf, action)?;
        }
        Ok(Bytes::from(buf))
    }

    /// Decode a commit blob.
    pub fn deserialize(data: &[u8]) -> MetaResult<Self> {
        let mut decoder = FrameDecoder::new(data);
        let mut actions = Vec::new();
        loop {
            match decoder.next_item::<Action>() {
                Ok(Some(action)) => actions.push(action),
                Ok(None) => break,
                Err(StorageError::Serialization { reason }) => {
                    return Err(MetaError::BadCommitObject(reason))
                }
                Err(e) => return Err(e.into()),
            }
        }
        let header = match actions.first() {
            Some(Action::Commit(h)) => h.clone(),
            Some(other) => {
                return Err(MetaError::BadCommitObject(format!(
                    "first action is {}, not commit",
                    other.kind()
                )))
            }
            None => return Err(MetaError::BadCommitObject("no actions".to_string())),
        };
        Ok(Self { header, actions })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silt_storage::{encode_frames, Value};

    fn object() -> DataObject {
        DataObject {
            id: Id::new(),
            min: Value::Int(0),
            max: Value::Int(9),
            count: 10,
            size: 100,
            created: None,
        }
    }

    #[test]
    fn test_add_stamps_commit_time() {
        let mut c = CommitObject::new(Id::nil(), 0, DEFAULT_AUTHOR, "load");
        c.append_add(&object());
        match &c.actions()[1] {
            Action::Add { object, commit } => {
                assert_eq!(object.created, Some(c.header().date));
                assert_eq!(*commit, c.id());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_blob_decodes_to_same_actions() {
        let mut c = CommitObject::new(Id::new(), 1, "bob", "compact");
        c.append_delete(Id::new());
        c.append_add(&object());
        c.append_add_vector(Id::new());
        let back = CommitObject::deserialize(&c.serialize().unwrap()).unwrap();
        assert_eq!(back, c);
        assert_eq!(back.header().retries, 1);
    }

    #[test]
    fn test_first_action_must_be_commit() {
        let bad = encode_frames(&[Action::Delete {
            commit: Id::new(),
            id: Id::new(),
        }])
        .unwrap();
        let err = CommitObject::deserialize(&bad).unwrap_err();
        assert!(matches!(err, MetaError::BadCommitObject(_)));
    }

    #[test]
    fn test_truncated_blob_is_bad_commit() {
        let c = CommitObject::new(Id::nil(), 0, DEFAULT_AUTHOR, "x");
        let blob = c.serialize().unwrap();
        let err = CommitObject::deserialize(&blob[..blob.len() - 3]).unwrap_err();
        assert!(matches!(err, MetaError::BadCommitObject(_)));
        assert!(matches!(
            CommitObject::deserialize(&[]),
            Err(MetaError::BadCommitObject(_))
        ));
    }

    #[test]
    fn test_empty() {
        let mut c = CommitObject::new(Id::nil(), 0, DEFAULT_AUTHOR, "x");
        assert!(c.is_empty());
        c.append_delete(Id::new());
        assert!(!c.is_empty());
    }
}
