//! Patches: copy-on-write deltas over a base view.
//!
//! A patch never mutates its base. It records objects and vectors added or
//! removed relative to the base and answers [`View`] queries as if those
//! changes had been applied. A patch can itself be wrapped by another patch.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use silt_storage::{DataObject, Id};

use crate::actions::Action;
use crate::error::{MetaError, MetaResult};
use crate::object::CommitObject;
use crate::snapshot::View;

/// Delta against a base view.
#[derive(Clone)]
pub struct Patch {
    base: Arc<dyn View>,
    added: BTreeMap<Id, DataObject>,
    deleted: BTreeSet<Id>,
    added_vectors: BTreeSet<Id>,
    deleted_vectors: BTreeSet<Id>,
}

impl fmt::Debug for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Patch")
            .field("added", &self.added.keys().collect::<Vec<_>>())
            .field("deleted", &self.deleted)
            .field("added_vectors", &self.added_vectors)
            .field("deleted_vectors", &self.deleted_vectors)
            .finish()
    }
}

impl Patch {
    /// Empty patch over `base`.
    pub fn new(base: Arc<dyn View>) -> Self {
        Self {
            base,
            added: BTreeMap::new(),
            deleted: BTreeSet::new(),
            added_vectors: BTreeSet::new(),
            deleted_vectors: BTreeSet::new(),
        }
    }

    /// The view this patch is layered on.
    pub fn base(&self) -> &Arc<dyn View> {
        &self.base
    }

    /// Objects added by the patch, in id order.
    pub fn added(&self) -> impl Iterator<Item = &DataObject> {
        self.added.values()
    }

    /// Base objects removed by the patch.
    pub fn deleted(&self) -> &BTreeSet<Id> {
        &self.deleted
    }

    /// Vectors added by the patch.
    pub fn added_vectors(&self) -> &BTreeSet<Id> {
        &self.added_vectors
    }

    /// Base vectors removed by the patch.
    pub fn deleted_vectors(&self) -> &BTreeSet<Id> {
        &self.deleted_vectors
    }

    /// True if the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.deleted.is_empty()
            && self.added_vectors.is_empty()
            && self.deleted_vectors.is_empty()
    }

    /// Add an object; `WriteConflict` if it is already visible.
    pub fn add_object(&mut self, object: DataObject) -> MetaResult<()> {
        let id = object.id;
        if self.exists(id) {
            return Err(MetaError::WriteConflict(format!(
                "add of object {} already visible",
                id
            )));
        }
        if self.deleted.remove(&id) && self.base.exists(id) {
            return Ok(());
        }
        self.added.insert(id, object);
        Ok(())
    }

    /// Remove a visible object, and its vector if it has one.
    pub fn delete_object(&mut self, id: Id) -> MetaResult<()> {
        if self.added.remove(&id).is_some() {
            self.added_vectors.remove(&id);
            return Ok(());
        }
        if self.deleted.contains(&id) || !self.base.exists(id) {
            return Err(MetaError::WriteConflict(format!(
                "delete of object {} not visible",
                id
            )));
        }
        if self.base.has_vector(id) && !self.added_vectors.remove(&id) {
            self.deleted_vectors.insert(id);
        }
        self.deleted.insert(id);
        Ok(())
    }

    /// Mark a visible object's vector present.
    pub fn add_vector(&mut self, id: Id) -> MetaResult<()> {
        if !self.exists(id) {
            return Err(MetaError::WriteConflict(format!(
                "vector for object {} not visible",
                id
            )));
        }
        if self.has_vector(id) {
            return Err(MetaError::WriteConflict(format!(
                "vector for object {} already present",
                id
            )));
        }
        if !self.deleted_vectors.remove(&id) {
            self.added_vectors.insert(id);
        }
        Ok(())
    }

    /// Mark a visible vector absent.
    pub fn delete_vector(&mut self, id: Id) -> MetaResult<()> {
        if self.added_vectors.remove(&id) {
            return Ok(());
        }
        if !self.has_vector(id) {
            return Err(MetaError::WriteConflict(format!(
                "delete of vector {} not present",
                id
            )));
        }
        self.deleted_vectors.insert(id);
        Ok(())
    }

    /// Apply one commit action to the patch.
    pub fn play(&mut self, action: &Action) -> MetaResult<()> {
        match action {
            Action::Commit(_) | Action::AddIndex { .. } => Ok(()),
            Action::Add { object, .. } => self.add_object(object.clone()),
            Action::Delete { id, .. } => self.delete_object(*id),
            Action::AddVector { id, .. } => self.add_vector(*id),
            Action::DeleteVector { id, .. } => self.delete_vector(*id),
        }
    }

    /// Ids deleted by both this patch and `other`.
    pub fn overlapping_deletes(&self, other: &Patch) -> Vec<Id> {
        self.deleted.intersection(&other.deleted).copied().collect()
    }

    /// Replay this patch's delta on top of a different base.
    ///
    /// Fails with `WriteConflict` when the new base no longer holds an object
    /// the patch deletes or already holds one it adds.
    pub fn rebase(&self, base: Arc<dyn View>) -> MetaResult<Patch> {
        let mut patch = Patch::new(base);
        for id in &self.deleted_vectors {
            if !self.deleted.contains(id) {
                patch.delete_vector(*id)?;
            }
        }
        for id in &self.deleted {
            patch.delete_object(*id)?;
        }
        for object in self.added.values() {
            patch.add_object(object.clone())?;
        }
        for id in &self.added_vectors {
            patch.add_vector(*id)?;
        }
        Ok(patch)
    }

    /// Serialize the delta as a commit on top of `parent`.
    ///
    /// Objects that already carry a commit time keep it; fresh objects are
    /// stamped with this commit's time. Fails with `EmptyTransaction` if the
    /// patch changes nothing.
    pub fn new_commit(
        &self,
        parent: Id,
        retries: u8,
        author: &str,
        message: &str,
    ) -> MetaResult<CommitObject> {
        if self.is_empty() {
            return Err(MetaError::EmptyTransaction);
        }
        let mut commit = CommitObject::new(parent, retries, author, message);
        for id in &self.deleted_vectors {
            commit.append_delete_vector(*id);
        }
        for id in &self.deleted {
            commit.append_delete(*id);
        }
        for object in self.added.values() {
            if object.created.is_some() {
                commit.append_readd(object);
            } else {
                commit.append_add(object);
            }
        }
        for id in &self.added_vectors {
            commit.append_add_vector(*id);
        }
        Ok(commit)
    }

    /// Build the inverse of this patch against `tip`.
    ///
    /// Objects the patch added that are still at `tip` are deleted; objects
    /// it deleted that are absent from `tip` are restored with their original
    /// metadata. Vectors follow the same rule. Fails with `EmptyTransaction`
    /// when nothing the patch did is still visible at `tip`.
    pub fn undo(&self, tip: Arc<dyn View>) -> MetaResult<Patch> {
        let mut undo = Patch::new(tip.clone());
        for id in &self.added_vectors {
            if tip.has_vector(*id) {
                undo.delete_vector(*id)?;
            }
        }
        for id in self.added.keys() {
            if tip.exists(*id) {
                undo.delete_object(*id)?;
            }
        }
        for id in &self.deleted {
            if tip.exists(*id) {
                continue;
            }
            let object = self.base.lookup(*id).ok_or_else(|| {
                MetaError::NotFound(format!("object {} in patch base", id))
            })?;
            undo.add_object(object)?;
        }
        for id in &self.deleted_vectors {
            if undo.exists(*id) && !undo.has_vector(*id) {
                undo.add_vector(*id)?;
            }
        }
        if undo.is_empty() {
            return Err(MetaError::EmptyTransaction);
        }
        Ok(undo)
    }
}

impl View for Patch {
    fn lookup(&self, id: Id) -> Option<DataObject> {
        if let Some(object) = self.added.get(&id) {
            return Some(object.clone());
        }
        if self.deleted.contains(&id) {
            return None;
        }
        self.base.lookup(id)
    }

    fn has_vector(&self, id: Id) -> bool {
        if self.added_vectors.contains(&id) {
            return true;
        }
        if self.deleted_vectors.contains(&id) || self.deleted.contains(&id) {
            return false;
        }
        !self.added.contains_key(&id) && self.base.has_vector(id)
    }

    fn select_all(&self) -> Vec<DataObject> {
        let mut objects: BTreeMap<Id, DataObject> = self
            .base
            .select_all()
            .into_iter()
            .filter(|o| !self.deleted.contains(&o.id))
            .map(|o| (o.id, o))
            .collect();
        for (id, object) in &self.added {
            objects.insert(*id, object.clone());
        }
        objects.into_values().collect()
    }

    fn vector_ids(&self) -> Vec<Id> {
        let mut ids: BTreeSet<Id> = self
            .base
            .vector_ids()
            .into_iter()
            .filter(|id| self.has_vector(*id))
            .collect();
        ids.extend(self.added_vectors.iter().copied());
        ids.into_iter().collect()
    }
}
