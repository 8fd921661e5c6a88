//! Transaction meta: typed values attached to one transaction.
//!
//! Code running inside a transaction can stash values here by type; the map
//! comes back out in `Change::meta` once the transaction commits.

use std::any::{Any, TypeId};
use std::fmt;

use crate::FxHashMap;

/// Map from a type to the single value of that type.
#[derive(Default)]
pub struct Meta {
    entries: FxHashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Meta {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the previous value of the same type.
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.entries
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast().ok().map(|b| *b))
    }

    #[must_use]
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.entries.get(&TypeId::of::<T>())?.downcast_ref()
    }

    pub fn get_mut<T: Send + Sync + 'static>(&mut self) -> Option<&mut T> {
        self.entries.get_mut(&TypeId::of::<T>())?.downcast_mut()
    }

    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.entries
            .remove(&TypeId::of::<T>())
            .and_then(|old| old.downcast().ok().map(|b| *b))
    }

    #[must_use]
    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Meta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Meta")
            .field("len", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Author(&'static str);

    #[test]
    fn test_insert_get_replace() {
        let mut meta = Meta::new();
        assert!(meta.insert(Author("a")).is_none());
        assert_eq!(meta.get::<Author>(), Some(&Author("a")));
        assert_eq!(meta.insert(Author("b")), Some(Author("a")));
        assert_eq!(meta.len(), 1);
    }

    #[test]
    fn test_types_do_not_collide() {
        let mut meta = Meta::new();
        meta.insert(1u32);
        meta.insert(2u64);
        assert_eq!(meta.get::<u32>(), Some(&1));
        assert_eq!(meta.get::<u64>(), Some(&2));
        assert_eq!(meta.remove::<u32>(), Some(1));
        assert!(!meta.contains::<u32>());
        assert!(meta.contains::<u64>());
    }
}
