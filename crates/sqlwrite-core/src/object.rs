//! Managed objects and their per-field dirty bits.
//!
//! A [`ManagedObject`] is the engine's view of one entity instance: which
//! class it is, the identity key, the current field values and which fields
//! changed since it was last written.

use crate::mapping::ClassId;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identity of a managed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(u64);

impl ObjectId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "object#{}", self.0)
    }
}

/// Lifecycle state relative to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectState {
    /// Not yet in the store; flushes as INSERT.
    New,
    /// In the store and unchanged since the last flush.
    Persistent,
    /// In the store with modified fields; flushes as UPDATE.
    Dirty,
    /// In the store and scheduled for removal; flushes as DELETE.
    Deleted,
    /// Removed by a previous flush.
    Removed,
}

/// Optimistic-lock request attached to an otherwise clean object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LockIntent {
    #[default]
    None,
    /// Write `version + 1` even though no field changed.
    Increment,
    /// Verify the stored version without writing.
    Check,
}

/// Value held by a mapped field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Column-backed value.
    Value(Value),
    /// Reference to another managed object (relation fields).
    Ref(Option<ObjectId>),
}

impl FieldValue {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            FieldValue::Value(v) => Some(v),
            FieldValue::Ref(_) => None,
        }
    }

    pub fn as_ref_target(&self) -> Option<Option<ObjectId>> {
        match self {
            FieldValue::Ref(target) => Some(*target),
            FieldValue::Value(_) => None,
        }
    }
}

impl From<Value> for FieldValue {
    fn from(v: Value) -> Self {
        FieldValue::Value(v)
    }
}

/// Fixed-size bitset over an object's flattened field indexes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSet {
    words: Vec<u64>,
    len: usize,
}

impl FieldSet {
    /// A set with room for `len` fields, none set.
    pub fn empty(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    /// A set with every one of `len` fields set.
    pub fn all(len: usize) -> Self {
        let mut set = Self::empty(len);
        for i in 0..len {
            set.set(i);
        }
        set
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn set(&mut self, index: usize) {
        if index < self.len {
            self.words[index / 64] |= 1 << (index % 64);
        }
    }

    pub fn clear(&mut self, index: usize) {
        if index < self.len {
            self.words[index / 64] &= !(1 << (index % 64));
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        index < self.len && self.words[index / 64] & (1 << (index % 64)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Indexes in `self` that are not in `other`.
    pub fn difference(&self, other: &FieldSet) -> Vec<usize> {
        (0..self.len)
            .filter(|i| self.contains(*i) && !other.contains(*i))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|i| self.contains(*i))
    }

    pub fn union_with(&mut self, other: &FieldSet) {
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w |= *o;
        }
    }
}

/// One entity instance as seen by the flush engine.
#[derive(Debug, Clone)]
pub struct ManagedObject {
    id: ObjectId,
    class: ClassId,
    state: ObjectState,
    /// Identity key, positionally aligned with every hierarchy table's primary key.
    key: Vec<Value>,
    values: Vec<FieldValue>,
    dirty: FieldSet,
    flushed: FieldSet,
    version: Option<i64>,
    lock: LockIntent,
    indicators_dirty: bool,
}

impl ManagedObject {
    /// Build an object. `values` holds one entry per flattened field.
    pub fn new(
        id: ObjectId,
        class: ClassId,
        state: ObjectState,
        key: Vec<Value>,
        values: Vec<FieldValue>,
    ) -> Self {
        let field_count = values.len();
        let dirty = if state == ObjectState::New {
            FieldSet::all(field_count)
        } else {
            FieldSet::empty(field_count)
        };
        Self {
            id,
            class,
            state,
            key,
            values,
            dirty,
            flushed: FieldSet::empty(field_count),
            version: None,
            lock: LockIntent::None,
            indicators_dirty: false,
        }
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_lock(mut self, lock: LockIntent) -> Self {
        self.lock = lock;
        self
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn class(&self) -> ClassId {
        self.class
    }

    pub fn state(&self) -> ObjectState {
        self.state
    }

    pub fn key(&self) -> &[Value] {
        &self.key
    }

    /// Whether every identity key component is known.
    pub fn key_assigned(&self) -> bool {
        !self.key.is_empty() && self.key.iter().all(|v| !v.is_null())
    }

    pub fn set_key_component(&mut self, index: usize, value: Value) {
        if let Some(slot) = self.key.get_mut(index) {
            *slot = value;
        }
    }

    pub fn value(&self, field: usize) -> Option<&FieldValue> {
        self.values.get(field)
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    /// Assign a field and mark it dirty.
    pub fn set_value(&mut self, field: usize, value: FieldValue) {
        if let Some(slot) = self.values.get_mut(field) {
            *slot = value;
            self.dirty.set(field);
            self.flushed.clear(field);
            if self.state == ObjectState::Persistent {
                self.state = ObjectState::Dirty;
            }
        }
    }

    /// Store a value without touching dirty bits (generated values read back).
    pub fn load_value(&mut self, field: usize, value: FieldValue) {
        if let Some(slot) = self.values.get_mut(field) {
            *slot = value;
        }
    }

    pub fn dirty(&self) -> &FieldSet {
        &self.dirty
    }

    pub fn flushed(&self) -> &FieldSet {
        &self.flushed
    }

    /// Fields whose dirty bit is set and that were not written yet.
    pub fn unflushed_dirty_fields(&self) -> Vec<usize> {
        self.dirty.difference(&self.flushed)
    }

    pub fn version(&self) -> Option<i64> {
        self.version
    }

    pub fn set_version(&mut self, version: Option<i64>) {
        self.version = version;
    }

    /// Version the next write will store.
    pub fn next_version(&self) -> i64 {
        self.version.map_or(1, |v| v + 1)
    }

    pub fn lock(&self) -> LockIntent {
        self.lock
    }

    pub fn set_lock(&mut self, lock: LockIntent) {
        self.lock = lock;
    }

    pub fn indicators_dirty(&self) -> bool {
        self.indicators_dirty
    }

    /// Request a discriminator (and version) rewrite without field changes.
    pub fn mark_indicators_dirty(&mut self) {
        self.indicators_dirty = true;
    }

    /// Schedule for removal.
    pub fn mark_deleted(&mut self) {
        if matches!(self.state, ObjectState::Persistent | ObjectState::Dirty) {
            self.state = ObjectState::Deleted;
        }
    }

    /// Record that every pending change reached the store.
    pub fn mark_flushed(&mut self) {
        match self.state {
            ObjectState::New => {
                self.flushed = FieldSet::all(self.values.len());
                self.state = ObjectState::Persistent;
            }
            ObjectState::Dirty | ObjectState::Persistent => {
                self.flushed.union_with(&self.dirty);
            }
            ObjectState::Deleted => self.state = ObjectState::Removed,
            ObjectState::Removed => {}
        }
        self.lock = LockIntent::None;
        self.indicators_dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(state: ObjectState) -> ManagedObject {
        ManagedObject::new(
            ObjectId::new(1),
            ClassId(0),
            state,
            vec![Value::BigInt(1)],
            vec![
                FieldValue::Value(Value::from("a")),
                FieldValue::Value(Value::from("b")),
                FieldValue::Ref(None),
            ],
        )
    }

    #[test]
    fn test_field_set_ops() {
        let mut set = FieldSet::empty(70);
        set.set(3);
        set.set(65);
        assert!(set.contains(3));
        assert!(set.contains(65));
        assert!(!set.contains(4));
        assert!(!set.contains(500));

        let mut other = FieldSet::empty(70);
        other.set(3);
        assert_eq!(set.difference(&other), vec![65]);

        set.clear(65);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![3]);
        assert!(FieldSet::empty(10).is_empty());
        assert_eq!(FieldSet::all(3).iter().count(), 3);
    }

    #[test]
    fn test_new_object_is_fully_dirty() {
        let o = obj(ObjectState::New);
        assert_eq!(o.unflushed_dirty_fields(), vec![0, 1, 2]);
    }

    #[test]
    fn test_set_value_transitions_to_dirty() {
        let mut o = obj(ObjectState::Persistent);
        assert!(o.unflushed_dirty_fields().is_empty());
        o.set_value(1, FieldValue::Value(Value::from("c")));
        assert_eq!(o.state(), ObjectState::Dirty);
        assert_eq!(o.unflushed_dirty_fields(), vec![1]);

        o.mark_flushed();
        assert!(o.unflushed_dirty_fields().is_empty());
        assert!(o.dirty().contains(1));
    }

    #[test]
    fn test_mark_flushed_transitions() {
        let mut o = obj(ObjectState::New);
        o.mark_flushed();
        assert_eq!(o.state(), ObjectState::Persistent);

        let mut d = obj(ObjectState::Persistent);
        d.mark_deleted();
        assert_eq!(d.state(), ObjectState::Deleted);
        d.mark_flushed();
        assert_eq!(d.state(), ObjectState::Removed);
    }

    #[test]
    fn test_key_assignment() {
        let mut o = ManagedObject::new(
            ObjectId::new(2),
            ClassId(0),
            ObjectState::New,
            vec![Value::Null],
            vec![],
        );
        assert!(!o.key_assigned());
        o.set_key_component(0, Value::BigInt(9));
        assert!(o.key_assigned());
        assert_eq!(o.next_version(), 1);
        assert_eq!(o.with_version(3).next_version(), 4);
    }
}
