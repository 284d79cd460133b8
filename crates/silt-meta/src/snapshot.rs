//! Point-in-time snapshots of a pool: visible data objects and vectors.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use silt_storage::{sort_objects, DataObject, Id, Layout};
use tracing::trace;

use crate::actions::Action;
use crate::error::{MetaError, MetaResult};

/// Read access shared by snapshots and patches.
pub trait View: Send + Sync {
    /// Look up a visible object.
    fn lookup(&self, id: Id) -> Option<DataObject>;
    /// True if object `id` is visible and has a vector.
    fn has_vector(&self, id: Id) -> bool;
    /// Every visible object, in id order.
    fn select_all(&self) -> Vec<DataObject>;
    /// Every visible vector id, in id order.
    fn vector_ids(&self) -> Vec<Id>;

    /// True if object `id` is visible.
    fn exists(&self, id: Id) -> bool {
        self.lookup(id).is_some()
    }

    /// Every visible object in pool-key order.
    fn select_sorted(&self, layout: &Layout) -> Vec<DataObject> {
        let mut objects = self.select_all();
        sort_objects(layout, &mut objects);
        objects
    }
}

/// Materialized set of data objects and vector ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    objects: BTreeMap<Id, DataObject>,
    vectors: BTreeSet<Id>,
}

impl Snapshot {
    /// Empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of visible objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// True if no objects are visible.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Add an object; `WriteConflict` if its id is present.
    pub fn add_object(&mut self, object: DataObject) -> MetaResult<()> {
        if self.objects.contains_key(&object.id) {
            return Err(MetaError::WriteConflict(format!(
                "add of object {} already in snapshot",
                object.id
            )));
        }
        self.objects.insert(object.id, object);
        Ok(())
    }

    /// Remove an object and any vector it had; `WriteConflict` if absent.
    pub fn delete_object(&mut self, id: Id) -> MetaResult<DataObject> {
        let object = self.objects.remove(&id).ok_or_else(|| {
            MetaError::WriteConflict(format!("delete of object {} not in snapshot", id))
        })?;
        self.vectors.remove(&id);
        Ok(object)
    }

    /// Mark an object's vector present.
    pub fn add_vector(&mut self, id: Id) -> MetaResult<()> {
        if !self.objects.contains_key(&id) {
            return Err(MetaError::WriteConflict(format!(
                "vector for object {} not in snapshot",
                id
            )));
        }
        if !self.vectors.insert(id) {
            return Err(MetaError::WriteConflict(format!(
                "vector for object {} already in snapshot",
                id
            )));
        }
        Ok(())
    }

    /// Mark an object's vector absent.
    pub fn delete_vector(&mut self, id: Id) -> MetaResult<()> {
        if !self.vectors.remove(&id) {
            return Err(MetaError::WriteConflict(format!(
                "delete of vector {} not in snapshot",
                id
            )));
        }
        Ok(())
    }

    /// Apply one action.
    pub fn play(&mut self, action: &Action) -> MetaResult<()> {
        match action {
            Action::Commit(_) => Ok(()),
            Action::Add { object, .. } => self.add_object(object.clone()),
            Action::Delete { id, .. } => self.delete_object(*id).map(|_| ()),
            Action::AddVector { id, .. } => self.add_vector(*id),
            Action::DeleteVector { id, .. } => self.delete_vector(*id),
            Action::AddIndex { id, rule, .. } => {
                trace!(object = %id, rule = %rule, "index action has no snapshot effect");
                Ok(())
            }
        }
    }

    /// Encode as a snapshot sidecar blob.
    pub fn serialize(&self) -> MetaResult<Bytes> {
        let data = bincode::serialize(self).map_err(silt_storage::StorageError::from)?;
        Ok(Bytes::from(data))
    }

    /// Decode a snapshot sidecar blob.
    pub fn deserialize(data: &[u8]) -> MetaResult<Self> {
        Ok(bincode::deserialize(data).map_err(silt_storage::StorageError::from)?)
    }
}

impl View for Snapshot {
    fn lookup(&self, id: Id) -> Option<DataObject> {
        self.objects.get(&id).cloned()
    }

    fn has_vector(&self, id: Id) -> bool {
        self.vectors.contains(&id)
    }

    fn select_all(&self) -> Vec<DataObject> {
        self.objects.values().cloned().collect()
    }

    fn vector_ids(&self) -> Vec<Id> {
        self.vectors.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silt_storage::Value;

    fn obj(min: i64, max: i64) -> DataObject {
        DataObject {
            id: Id::new(),
            min: Value::Int(min),
            max: Value::Int(max),
            count: 1,
            size: 10,
            created: None,
        }
    }

    #[test]
    fn test_add_existing_conflicts() {
        let mut s = Snapshot::new();
        let o = obj(0, 1);
        s.add_object(o.clone()).unwrap();
        assert!(matches!(s.add_object(o), Err(MetaError::WriteConflict(_))));
    }

    #[test]
    fn test_delete_absent_conflicts() {
        let mut s = Snapshot::new();
        assert!(matches!(
            s.delete_object(Id::new()),
            Err(MetaError::WriteConflict(_))
        ));
    }

    #[test]
    fn test_vector_requires_object() {
        let mut s = Snapshot::new();
        let o = obj(0, 1);
        assert!(s.add_vector(o.id).is_err());
        s.add_object(o.clone()).unwrap();
        s.add_vector(o.id).unwrap();
        assert!(s.add_vector(o.id).is_err());
        assert!(s.has_vector(o.id));
        s.delete_object(o.id).unwrap();
        assert!(!s.has_vector(o.id));
        assert!(s.delete_vector(o.id).is_err());
    }

    #[test]
    fn test_select_sorted() {
        let mut s = Snapshot::new();
        for (lo, hi) in [(10, 20), (5, 7), (15, 25), (0, 3)] {
            s.add_object(obj(lo, hi)).unwrap();
        }
        let mins: Vec<i64> = s
            .select_sorted(&Layout::asc("k"))
            .iter()
            .map(|o| o.min.as_int().unwrap())
            .collect();
        assert_eq!(mins, vec![0, 5, 10, 15]);
    }

    #[test]
    fn test_index_action_leaves_snapshot_unchanged() {
        let mut s = Snapshot::new();
        let o = obj(1, 2);
        s.add_object(o.clone()).unwrap();
        let before = s.clone();
        s.play(&Action::AddIndex {
            commit: Id::new(),
            rule: "field:ts".into(),
            id: o.id,
        })
        .unwrap();
        assert_eq!(s, before);
    }

    #[test]
    fn test_sidecar_encoding() {
        let mut s = Snapshot::new();
        let o = obj(1, 2);
        s.add_object(o.clone()).unwrap();
        s.add_vector(o.id).unwrap();
        let back = Snapshot::deserialize(&s.serialize().unwrap()).unwrap();
        assert_eq!(back, s);
    }
}
