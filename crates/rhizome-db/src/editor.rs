//! Editor tokens and transient sets.
//!
//! An [`Editor`] marks one edit session. A [`TransientSet`] remembers which
//! editor last produced it: edits presented with that same editor mutate the
//! set in place, edits with any other editor copy it first. Everyone else
//! holding the old value keeps seeing it unchanged.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::FxHashSet;

static NEXT_EDITOR: AtomicU64 = AtomicU64::new(1);

/// Identity of one edit session. Not a lock.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Editor(u64);

impl Editor {
    /// Start a new edit session.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(NEXT_EDITOR.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for Editor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Editor({})", self.0)
    }
}

/// A set that batches edits made under one [`Editor`].
pub struct TransientSet<V> {
    items: Arc<FxHashSet<V>>,
    owner: Option<Editor>,
}

impl<V: Eq + Hash + Clone> TransientSet<V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: Arc::new(FxHashSet::default()),
            owner: None,
        }
    }

    /// Mutable access for `editor`, copying unless `editor` already owns the set.
    pub fn edit(&mut self, editor: Editor) -> &mut FxHashSet<V> {
        if self.owner != Some(editor) {
            self.items = Arc::new((*self.items).clone());
            self.owner = Some(editor);
        }
        // A clone taken while owned still shares the Arc; make_mut copies then.
        Arc::make_mut(&mut self.items)
    }

    pub fn insert(&mut self, editor: Editor, value: V) -> bool {
        self.edit(editor).insert(value)
    }

    pub fn remove(&mut self, editor: Editor, value: &V) -> bool {
        if !self.items.contains(value) {
            return false;
        }
        self.edit(editor).remove(value)
    }

    /// Detach from the current editor; the next edit copies.
    #[must_use]
    pub fn persistent(mut self) -> Self {
        self.owner = None;
        self
    }

    #[must_use]
    pub fn contains(&self, value: &V) -> bool {
        self.items.contains(value)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &V> + '_ {
        self.items.iter()
    }

    /// Whether both handles share the same storage.
    #[must_use]
    pub fn shares_storage(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.items, &other.items)
    }
}

impl<V: Eq + Hash + Clone> Default for TransientSet<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Clone for TransientSet<V> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
            owner: None,
        }
    }
}

impl<V: Eq + Hash> PartialEq for TransientSet<V> {
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items
    }
}

impl<V: Eq + Hash> Eq for TransientSet<V> {}

impl<V: fmt::Debug> fmt::Debug for TransientSet<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.items.iter()).finish()
    }
}
