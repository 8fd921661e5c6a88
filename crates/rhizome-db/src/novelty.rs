//! Novelty: the delta between two snapshots.
//!
//! Assertions and retractions are kept in two maps keyed by
//! `(eid, attribute, tx)`. A `One` attribute holds a single value per key, a
//! `Many` attribute a [`TransientSet`]. Asserting a fact that is listed as
//! retracted (or the reverse) removes the listed record instead of stacking
//! both, so a fact asserted and retracted inside one transaction leaves no
//! trace.

use std::fmt;
use std::ops::Neg;
use std::sync::Arc;

use crate::FxHashMap;
use crate::datom::Datom;
use crate::editor::{Editor, TransientSet};
use crate::eid::{Eid, Tx};
use crate::schema::{Attribute, Cardinality};
use crate::value::Value;

/// Key of a novelty record.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NoveltyKey {
    pub eid: Eid,
    pub attr: Attribute,
    pub tx: Tx,
}

impl NoveltyKey {
    fn of(datom: &Datom) -> Self {
        Self {
            eid: datom.eid,
            attr: datom.attr,
            tx: datom.tx,
        }
    }
}

/// Cardinality-aware value of a novelty record.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum NoveltyValue {
    One(Value),
    Many(TransientSet<Value>),
}

impl NoveltyValue {
    fn len(&self) -> usize {
        match self {
            Self::One(_) => 1,
            Self::Many(set) => set.len(),
        }
    }

    fn values(&self) -> Box<dyn Iterator<Item = &Value> + '_> {
        match self {
            Self::One(value) => Box::new(std::iter::once(value)),
            Self::Many(set) => Box::new(set.iter()),
        }
    }

    fn contains(&self, value: &Value) -> bool {
        match self {
            Self::One(v) => v == value,
            Self::Many(set) => set.contains(value),
        }
    }
}

type Records = FxHashMap<NoveltyKey, NoveltyValue>;

/// Assert/retract delta with cancellation.
#[derive(Clone)]
pub struct Novelty {
    assertions: Arc<Records>,
    retractions: Arc<Records>,
    owner: Option<Editor>,
}

impl Novelty {
    #[must_use]
    pub fn new() -> Self {
        Self {
            assertions: Arc::default(),
            retractions: Arc::default(),
            owner: None,
        }
    }

    /// Record `datom`, cancelling against an opposite record if there is one.
    pub fn add(&mut self, editor: Editor, datom: Datom) {
        let key = NoveltyKey::of(&datom);
        let (same, opposite) = self.edit(editor, datom.added);
        if !remove_value(opposite, editor, &key, &datom.value) {
            insert_value(same, editor, key, datom.value);
        }
    }

    /// Add every datom of `other`.
    pub fn merge(&mut self, editor: Editor, other: &Novelty) {
        for datom in other.datoms() {
            self.add(editor, datom);
        }
    }

    /// Swap assertions and retractions.
    #[must_use]
    pub fn reverse(&self) -> Self {
        Self {
            assertions: Arc::clone(&self.retractions),
            retractions: Arc::clone(&self.assertions),
            owner: None,
        }
    }

    /// Detach from the current editor; later edits copy.
    #[must_use]
    pub fn persistent(mut self) -> Self {
        self.owner = None;
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.assertions.is_empty() && self.retractions.is_empty()
    }

    /// Number of datoms, counting every member of `Many` records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.assertions.values().map(NoveltyValue::len).sum::<usize>()
            + self.retractions.values().map(NoveltyValue::len).sum::<usize>()
    }

    /// Whether exactly this datom (direction included) is recorded.
    #[must_use]
    pub fn contains(&self, datom: &Datom) -> bool {
        let records = if datom.added {
            &self.assertions
        } else {
            &self.retractions
        };
        records
            .get(&NoveltyKey::of(datom))
            .is_some_and(|v| v.contains(&datom.value))
    }

    pub fn assertions(&self) -> impl Iterator<Item = Datom> + '_ {
        expand_records(&self.assertions, true)
    }

    pub fn retractions(&self) -> impl Iterator<Item = Datom> + '_ {
        expand_records(&self.retractions, false)
    }

    /// Every recorded datom, assertions first.
    pub fn datoms(&self) -> impl Iterator<Item = Datom> + '_ {
        self.assertions().chain(self.retractions())
    }

    /// Returns `(same, opposite)` record maps for a datom direction.
    fn edit(&mut self, editor: Editor, added: bool) -> (&mut Records, &mut Records) {
        if self.owner != Some(editor) {
            self.assertions = Arc::new((*self.assertions).clone());
            self.retractions = Arc::new((*self.retractions).clone());
            self.owner = Some(editor);
        }
        let assertions = Arc::make_mut(&mut self.assertions);
        let retractions = Arc::make_mut(&mut self.retractions);
        if added {
            (assertions, retractions)
        } else {
            (retractions, assertions)
        }
    }
}

fn expand_records(records: &Records, added: bool) -> impl Iterator<Item = Datom> + '_ {
    records.iter().flat_map(move |(key, value)| {
        value.values().map(move |v| Datom {
            eid: key.eid,
            attr: key.attr,
            value: v.clone(),
            tx: key.tx,
            added,
        })
    })
}

/// Remove `value` under `key`; drops the record once it is empty.
fn remove_value(records: &mut Records, editor: Editor, key: &NoveltyKey, value: &Value) -> bool {
    let Some(record) = records.get_mut(key) else {
        return false;
    };
    match record {
        NoveltyValue::One(v) => {
            if v != value {
                return false;
            }
            records.remove(key);
            true
        }
        NoveltyValue::Many(set) => {
            if !set.remove(editor, value) {
                return false;
            }
            if set.is_empty() {
                records.remove(key);
            }
            true
        }
    }
}

fn insert_value(records: &mut Records, editor: Editor, key: NoveltyKey, value: Value) {
    match records.get_mut(&key) {
        None => {
            let record = match key.attr.schema().cardinality() {
                Cardinality::One => NoveltyValue::One(value),
                Cardinality::Many => {
                    let mut set = TransientSet::new();
                    set.insert(editor, value);
                    NoveltyValue::Many(set)
                }
            };
            records.insert(key, record);
        }
        Some(record) => match record {
            NoveltyValue::Many(set) => {
                set.insert(editor, value);
            }
            NoveltyValue::One(existing) => {
                // Two distinct `One` facts can share a key only through
                // `AssertWithTx`; keep both rather than drop one.
                if *existing == value {
                    return;
                }
                let mut set = TransientSet::new();
                set.insert(editor, existing.clone());
                set.insert(editor, value);
                *record = NoveltyValue::Many(set);
            }
        },
    }
}

impl Default for Novelty {
    fn default() -> Self {
        Self::new()
    }
}

impl Neg for Novelty {
    type Output = Novelty;

    fn neg(self) -> Novelty {
        self.reverse()
    }
}

impl Neg for &Novelty {
    type Output = Novelty;

    fn neg(self) -> Novelty {
        self.reverse()
    }
}

impl PartialEq for Novelty {
    fn eq(&self, other: &Self) -> bool {
        self.assertions == other.assertions && self.retractions == other.retractions
    }
}

impl Eq for Novelty {}

impl fmt::Debug for Novelty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.datoms()).finish()
    }
}
