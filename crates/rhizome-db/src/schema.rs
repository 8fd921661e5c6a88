//! Attribute schema and attribute handles.
//!
//! An attribute is itself an entity: its [`Eid`] identifies it and its
//! [`Schema`] describes how values are stored. The schema travels with the
//! handle so novelty and index code can be cardinality-aware without a
//! lookup, and it is also written into the database as an ordinary datom so
//! the schema stays queryable as data.

use std::fmt;
use std::marker::PhantomData;

use bitflags::bitflags;

use crate::eid::Eid;
use crate::value::{ObjectRef, Value};

/// How many values an entity may hold for an attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Cardinality {
    One,
    Many,
}

/// Which value index is maintained for an attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Indexing {
    None,
    Indexed,
    Unique,
}

bitflags! {
    /// Packed schema of an attribute.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Schema: u32 {
        const MANY = 1;
        const INDEXED = 1 << 1;
        const UNIQUE = 1 << 2;
        const REQUIRED = 1 << 3;
        /// Deleting the owner deletes the referenced entity.
        const CASCADE_DELETE = 1 << 4;
        /// Deleting the referenced entity deletes the owner.
        const CASCADE_DELETE_BY = 1 << 5;
        /// Values are [`Value::Ref`].
        const REF = 1 << 6;
    }
}

impl Schema {
    /// Single-valued attribute with no flags.
    #[must_use]
    pub const fn one() -> Self {
        Self::empty()
    }

    /// Multi-valued attribute with no flags.
    #[must_use]
    pub const fn many() -> Self {
        Self::MANY
    }

    #[must_use]
    pub const fn indexed(self) -> Self {
        self.union(Self::INDEXED)
    }

    #[must_use]
    pub const fn unique(self) -> Self {
        self.union(Self::UNIQUE)
    }

    #[must_use]
    pub const fn required(self) -> Self {
        self.union(Self::REQUIRED)
    }

    /// Values reference other entities.
    #[must_use]
    pub const fn reference(self) -> Self {
        self.union(Self::REF)
    }

    /// Implies [`Schema::reference`].
    #[must_use]
    pub const fn cascade_delete(self) -> Self {
        self.union(Self::CASCADE_DELETE).union(Self::REF)
    }

    /// Implies [`Schema::reference`].
    #[must_use]
    pub const fn cascade_delete_by(self) -> Self {
        self.union(Self::CASCADE_DELETE_BY).union(Self::REF)
    }

    #[must_use]
    pub const fn cardinality(self) -> Cardinality {
        if self.contains(Self::MANY) {
            Cardinality::Many
        } else {
            Cardinality::One
        }
    }

    #[must_use]
    pub const fn indexing(self) -> Indexing {
        if self.contains(Self::UNIQUE) {
            Indexing::Unique
        } else if self.contains(Self::INDEXED) {
            Indexing::Indexed
        } else {
            Indexing::None
        }
    }

    #[must_use]
    pub const fn is_many(self) -> bool {
        self.contains(Self::MANY)
    }

    #[must_use]
    pub const fn is_required(self) -> bool {
        self.contains(Self::REQUIRED)
    }

    #[must_use]
    pub const fn is_ref(self) -> bool {
        self.contains(Self::REF)
    }

    #[must_use]
    pub const fn is_cascade_delete(self) -> bool {
        self.contains(Self::CASCADE_DELETE)
    }

    #[must_use]
    pub const fn is_cascade_delete_by(self) -> bool {
        self.contains(Self::CASCADE_DELETE_BY)
    }

    /// Whether a value index (AVE) is kept for this attribute.
    #[must_use]
    pub const fn has_value_index(self) -> bool {
        self.intersects(Self::INDEXED.union(Self::UNIQUE).union(Self::REF))
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Schema({:?}, {:?}", self.cardinality(), self.indexing())?;
        if self.is_ref() {
            f.write_str(", ref")?;
        }
        if self.is_required() {
            f.write_str(", required")?;
        }
        if self.is_cascade_delete() {
            f.write_str(", cascade")?;
        }
        if self.is_cascade_delete_by() {
            f.write_str(", cascade-by")?;
        }
        f.write_str(")")
    }
}

/// Untyped attribute handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Attribute {
    eid: Eid,
    schema: Schema,
}

impl Attribute {
    #[must_use]
    pub const fn new(eid: Eid, schema: Schema) -> Self {
        Self { eid, schema }
    }

    #[must_use]
    pub const fn eid(self) -> Eid {
        self.eid
    }

    #[must_use]
    pub const fn schema(self) -> Schema {
        self.schema
    }

    /// Check that `value` has the shape this attribute stores.
    #[must_use]
    pub const fn accepts(self, value: &Value) -> bool {
        matches!(value, Value::Ref(_)) == self.schema.is_ref()
    }
}

impl fmt::Debug for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Attribute({})", self.eid)
    }
}

/// Rust types that can be stored under a typed attribute.
pub trait AttrValue: Sized {
    fn into_value(self) -> Value;
    fn from_value(value: &Value) -> Option<Self>;
}

impl AttrValue for bool {
    fn into_value(self) -> Value {
        Value::Bool(self)
    }
    fn from_value(value: &Value) -> Option<Self> {
        value.as_bool()
    }
}

impl AttrValue for i64 {
    fn into_value(self) -> Value {
        Value::Int(self)
    }
    fn from_value(value: &Value) -> Option<Self> {
        value.as_int()
    }
}

impl AttrValue for f64 {
    fn into_value(self) -> Value {
        Value::Double(self)
    }
    fn from_value(value: &Value) -> Option<Self> {
        value.as_double()
    }
}

impl AttrValue for String {
    fn into_value(self) -> Value {
        Value::from(self)
    }
    fn from_value(value: &Value) -> Option<Self> {
        value.as_str().map(str::to_owned)
    }
}

impl AttrValue for Eid {
    fn into_value(self) -> Value {
        Value::Ref(self)
    }
    fn from_value(value: &Value) -> Option<Self> {
        value.as_ref_eid()
    }
}

impl AttrValue for ObjectRef {
    fn into_value(self) -> Value {
        Value::Object(self)
    }
    fn from_value(value: &Value) -> Option<Self> {
        value.as_object().cloned()
    }
}

/// Typed attribute handle.
pub struct Attr<T> {
    attribute: Attribute,
    _marker: PhantomData<fn() -> T>,
}

impl<T: AttrValue> Attr<T> {
    #[must_use]
    pub const fn new(attribute: Attribute) -> Self {
        Self {
            attribute,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub const fn attribute(&self) -> Attribute {
        self.attribute
    }

    #[must_use]
    pub fn value(&self, value: T) -> Value {
        value.into_value()
    }

    #[must_use]
    pub fn decode(&self, value: &Value) -> Option<T> {
        T::from_value(value)
    }
}

impl<T> Clone for Attr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Attr<T> {}

impl<T> fmt::Debug for Attr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Attr<{}>({})",
            std::any::type_name::<T>(),
            self.attribute.eid
        )
    }
}

impl<T> From<Attr<T>> for Attribute {
    fn from(attr: Attr<T>) -> Self {
        attr.attribute
    }
}
