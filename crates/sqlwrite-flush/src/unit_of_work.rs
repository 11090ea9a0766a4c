//! Unit of Work: the managed objects a flush writes.
//!
//! The Unit of Work owns every managed object of one persistence context
//! with O(1) lookup by [`ObjectId`]. It hands the objects to the
//! [`Flusher`](crate::Flusher) in tracking order and receives generated keys,
//! versions and flushed bits back.
//!
//! # Example
//!
//! ```ignore
//! let mut uow = UnitOfWork::new();
//! let team = uow.track_new(team_class, vec![Value::Null], vec![Value::from("Avengers").into()]);
//! let hero = uow.track_new(hero_class, vec![Value::Null], vec![
//!     Value::from("Thor").into(),
//!     FieldValue::Ref(Some(team)),
//! ]);
//!
//! let report = flusher.flush(&cx, &conn, &mut uow).await?;
//! ```

use sqlwrite_core::{
    ClassId, Error, FieldValue, ManagedObject, ObjectId, ObjectState, Value,
};
use std::collections::HashMap;

/// Error type for Unit of Work operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UowError {
    /// The object is not tracked by this unit of work.
    NotTracked {
        /// The object id.
        id: ObjectId,
    },
    /// An object with the same id was already tracked.
    AlreadyTracked {
        /// The object id.
        id: ObjectId,
    },
    /// The field index is out of range for the object's class.
    NoSuchField {
        /// The object id.
        id: ObjectId,
        /// Flattened field index.
        field: usize,
    },
}

impl std::fmt::Display for UowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UowError::NotTracked { id } => write!(f, "{} is not tracked", id),
            UowError::AlreadyTracked { id } => write!(f, "{} is already tracked", id),
            UowError::NoSuchField { id, field } => {
                write!(f, "{} has no field at index {}", id, field)
            }
        }
    }
}

impl std::error::Error for UowError {}

impl From<UowError> for Error {
    fn from(e: UowError) -> Self {
        Error::Custom(e.to_string())
    }
}

/// Tracks the managed objects of one persistence context.
#[derive(Debug, Default)]
pub struct UnitOfWork {
    objects: Vec<ManagedObject>,
    index: HashMap<ObjectId, usize>,
    next_id: u64,
}

impl UnitOfWork {
    /// Create a new empty Unit of Work.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&mut self) -> ObjectId {
        self.next_id += 1;
        ObjectId::new(self.next_id)
    }

    /// Track a new object; it will be INSERTed during flush.
    pub fn track_new(&mut self, class: ClassId, key: Vec<Value>, values: Vec<FieldValue>) -> ObjectId {
        let id = self.allocate_id();
        self.push(ManagedObject::new(id, class, ObjectState::New, key, values));
        id
    }

    /// Track an object loaded from the store.
    pub fn track_persistent(
        &mut self,
        class: ClassId,
        key: Vec<Value>,
        values: Vec<FieldValue>,
        version: Option<i64>,
    ) -> ObjectId {
        let id = self.allocate_id();
        let mut object = ManagedObject::new(id, class, ObjectState::Persistent, key, values);
        object.set_version(version);
        self.push(object);
        id
    }

    /// Track a pre-built object under its own id.
    pub fn track(&mut self, object: ManagedObject) -> Result<ObjectId, UowError> {
        let id = object.id();
        if self.index.contains_key(&id) {
            return Err(UowError::AlreadyTracked { id });
        }
        self.next_id = self.next_id.max(id.raw());
        self.push(object);
        Ok(id)
    }

    fn push(&mut self, object: ManagedObject) {
        self.index.insert(object.id(), self.objects.len());
        self.objects.push(object);
    }

    pub fn get(&self, id: ObjectId) -> Option<&ManagedObject> {
        self.index.get(&id).map(|i| &self.objects[*i])
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut ManagedObject> {
        self.index.get(&id).map(|i| &mut self.objects[*i])
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.index.contains_key(&id)
    }

    /// Assign a field value and mark it dirty.
    pub fn mark_dirty(
        &mut self,
        id: ObjectId,
        field: usize,
        value: impl Into<FieldValue>,
    ) -> Result<(), UowError> {
        let object = self.get_mut(id).ok_or(UowError::NotTracked { id })?;
        if field >= object.values().len() {
            return Err(UowError::NoSuchField { id, field });
        }
        object.set_value(field, value.into());
        Ok(())
    }

    /// Schedule an object for deletion. New objects are simply forgotten.
    pub fn mark_deleted(&mut self, id: ObjectId) -> Result<(), UowError> {
        let object = self.get(id).ok_or(UowError::NotTracked { id })?;
        if object.state() == ObjectState::New {
            self.forget(id);
            return Ok(());
        }
        if let Some(object) = self.get_mut(id) {
            object.mark_deleted();
        }
        Ok(())
    }

    fn forget(&mut self, id: ObjectId) {
        self.objects.retain(|o| o.id() != id);
        self.reindex();
    }

    fn reindex(&mut self) {
        self.index = self
            .objects
            .iter()
            .enumerate()
            .map(|(i, o)| (o.id(), i))
            .collect();
    }

    /// Objects in tracking order.
    pub fn objects(&self) -> impl Iterator<Item = &ManagedObject> {
        self.objects.iter()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Drop objects removed by a previous flush.
    pub fn clear_removed(&mut self) {
        let before = self.objects.len();
        self.objects.retain(|o| o.state() != ObjectState::Removed);
        if self.objects.len() != before {
            self.reindex();
        }
    }

    /// Check if there are any pending changes.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.pending_counts().is_empty()
    }

    /// Get the count of pending operations.
    #[must_use]
    pub fn pending_counts(&self) -> PendingCounts {
        let mut counts = PendingCounts::default();
        for object in &self.objects {
            match object.state() {
                ObjectState::New => counts.new += 1,
                ObjectState::Deleted => counts.deleted += 1,
                ObjectState::Persistent | ObjectState::Dirty
                    if !object.unflushed_dirty_fields().is_empty() =>
                {
                    counts.dirty += 1;
                }
                _ => {}
            }
        }
        counts
    }
}

/// Count of pending operations by type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    /// Objects pending INSERT.
    pub new: usize,
    /// Objects pending UPDATE.
    pub dirty: usize,
    /// Objects pending DELETE.
    pub deleted: usize,
}

impl PendingCounts {
    /// Total number of pending operations.
    #[must_use]
    pub fn total(&self) -> usize {
        self.new + self.dirty + self.deleted
    }

    /// Check if there are no pending operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.new == 0 && self.dirty == 0 && self.deleted == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class() -> ClassId {
        ClassId::new(0)
    }

    #[test]
    fn test_track_and_lookup() {
        let mut uow = UnitOfWork::new();
        let a = uow.track_new(class(), vec![Value::Null], vec![Value::from("a").into()]);
        let b = uow.track_persistent(class(), vec![Value::BigInt(5)], vec![Value::from("b").into()], Some(2));

        assert_ne!(a, b);
        assert_eq!(uow.get(a).unwrap().state(), ObjectState::New);
        assert_eq!(uow.get(b).unwrap().version(), Some(2));
        assert_eq!(uow.objects().map(|o| o.id()).collect::<Vec<_>>(), vec![a, b]);
    }

    #[test]
    fn test_track_rejects_duplicates() {
        let mut uow = UnitOfWork::new();
        let object = ManagedObject::new(ObjectId::new(10), class(), ObjectState::Persistent, vec![Value::BigInt(1)], vec![]);
        uow.track(object.clone()).unwrap();
        assert_eq!(
            uow.track(object),
            Err(UowError::AlreadyTracked { id: ObjectId::new(10) })
        );
        let next = uow.track_new(class(), vec![Value::Null], vec![]);
        assert_eq!(next, ObjectId::new(11));
    }

    #[test]
    fn test_pending_counts() {
        let mut uow = UnitOfWork::new();
        uow.track_new(class(), vec![Value::Null], vec![Value::from("a").into()]);
        let dirty = uow.track_persistent(class(), vec![Value::BigInt(1)], vec![Value::from("b").into()], None);
        let gone = uow.track_persistent(class(), vec![Value::BigInt(2)], vec![Value::from("c").into()], None);
        let clean = uow.track_persistent(class(), vec![Value::BigInt(3)], vec![Value::from("d").into()], None);

        uow.mark_dirty(dirty, 0, Value::from("b2")).unwrap();
        uow.mark_deleted(gone).unwrap();

        let counts = uow.pending_counts();
        assert_eq!(counts, PendingCounts { new: 1, dirty: 1, deleted: 1 });
        assert_eq!(counts.total(), 3);
        assert!(uow.has_changes());
        assert_eq!(uow.get(clean).unwrap().state(), ObjectState::Persistent);
    }

    #[test]
    fn test_mark_dirty_errors() {
        let mut uow = UnitOfWork::new();
        let id = uow.track_persistent(class(), vec![Value::BigInt(1)], vec![Value::from("a").into()], None);
        assert_eq!(
            uow.mark_dirty(id, 4, Value::Int(1)),
            Err(UowError::NoSuchField { id, field: 4 })
        );
        let missing = ObjectId::new(99);
        assert_eq!(
            uow.mark_deleted(missing),
            Err(UowError::NotTracked { id: missing })
        );
    }

    #[test]
    fn test_deleting_new_object_forgets_it() {
        let mut uow = UnitOfWork::new();
        let a = uow.track_new(class(), vec![Value::Null], vec![]);
        let b = uow.track_new(class(), vec![Value::Null], vec![]);
        uow.mark_deleted(a).unwrap();
        assert!(!uow.contains(a));
        assert!(uow.get(b).is_some());
        assert_eq!(uow.len(), 1);
    }

    #[test]
    fn test_clear_removed() {
        let mut uow = UnitOfWork::new();
        let a = uow.track_persistent(class(), vec![Value::BigInt(1)], vec![], None);
        let b = uow.track_persistent(class(), vec![Value::BigInt(2)], vec![], None);
        uow.mark_deleted(a).unwrap();
        uow.get_mut(a).unwrap().mark_flushed();
        uow.clear_removed();
        assert!(!uow.contains(a));
        assert!(uow.get(b).is_some());
    }
}
