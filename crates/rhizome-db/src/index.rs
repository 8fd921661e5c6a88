//! Partitioned persistent datom index.
//!
//! Each partition is an `Arc`'d bundle of four access paths:
//!
//! ```text
//! rows     eid  -> attribute -> One(value, tx) | Many(value -> tx)   (EAV)
//! columns  attribute -> {eid}                                       (AE)
//! values   attribute -> value -> {eid}   indexed/unique/ref attrs   (AVE)
//! refs     target -> {(eid, attribute)}  ref attrs, by source part  (VAE)
//! ```
//!
//! Cloning an [`Index`] clones one `Arc` per partition. Writes go through
//! `Arc::make_mut` at partition and then row granularity, so a published
//! index is never touched and unchanged partitions and rows stay shared
//! between snapshots.

use std::sync::Arc;

use crate::datom::Datom;
use crate::eid::{Eid, MAX_LOCAL, PARTITION_COUNT, Part, Tx, check_part};
use crate::error::{DbError, DbResult};
use crate::query::{IndexQuery, Q};
use crate::schema::Attribute;
use crate::value::Value;
use crate::{FxHashMap, FxHashSet};

/// Values stored for one `(eid, attribute)`.
#[derive(Clone, Debug)]
enum Values {
    One(Value, Tx),
    Many(FxHashMap<Value, Tx>),
}

impl Values {
    fn get(&self, value: &Value) -> Option<Tx> {
        match self {
            Self::One(v, tx) => (v == value).then_some(*tx),
            Self::Many(values) => values.get(value).copied(),
        }
    }

    fn iter(&self) -> Box<dyn Iterator<Item = (&Value, Tx)> + '_> {
        match self {
            Self::One(v, tx) => Box::new(std::iter::once((v, *tx))),
            Self::Many(values) => Box::new(values.iter().map(|(v, tx)| (v, *tx))),
        }
    }
}

type Row = FxHashMap<Attribute, Values>;

#[derive(Clone, Default)]
struct Partition {
    next_local: u32,
    rows: FxHashMap<Eid, Arc<Row>>,
    columns: FxHashMap<Attribute, Arc<FxHashSet<Eid>>>,
    values: FxHashMap<Attribute, Arc<FxHashMap<Value, FxHashSet<Eid>>>>,
    refs: FxHashMap<Eid, Arc<FxHashSet<(Eid, Attribute)>>>,
}

impl Partition {
    fn index_value(&mut self, eid: Eid, attr: Attribute, value: &Value) {
        if attr.schema().has_value_index() {
            Arc::make_mut(self.values.entry(attr).or_default())
                .entry(value.clone())
                .or_default()
                .insert(eid);
        }
        if let Value::Ref(target) = value {
            Arc::make_mut(self.refs.entry(*target).or_default()).insert((eid, attr));
        }
    }

    fn unindex_value(&mut self, eid: Eid, attr: Attribute, value: &Value) {
        if attr.schema().has_value_index() {
            if let Some(by_value) = self.values.get_mut(&attr) {
                let by_value = Arc::make_mut(by_value);
                if let Some(eids) = by_value.get_mut(value) {
                    eids.remove(&eid);
                    if eids.is_empty() {
                        by_value.remove(value);
                    }
                }
                if by_value.is_empty() {
                    self.values.remove(&attr);
                }
            }
        }
        if let Value::Ref(target) = value {
            if let Some(sources) = self.refs.get_mut(target) {
                let sources = Arc::make_mut(sources);
                sources.remove(&(eid, attr));
                if sources.is_empty() {
                    self.refs.remove(target);
                }
            }
        }
    }

    fn add_to_column(&mut self, eid: Eid, attr: Attribute) {
        Arc::make_mut(self.columns.entry(attr).or_default()).insert(eid);
    }

    fn remove_from_column(&mut self, eid: Eid, attr: Attribute) {
        if let Some(eids) = self.columns.get_mut(&attr) {
            let eids = Arc::make_mut(eids);
            eids.remove(&eid);
            if eids.is_empty() {
                self.columns.remove(&attr);
            }
        }
    }

    fn row_datoms(&self, eid: Eid, out: &mut Vec<Datom>) {
        if let Some(row) = self.rows.get(&eid) {
            for (attr, values) in row.iter() {
                push_values(eid, *attr, values, out);
            }
        }
    }

    fn attr_datoms(&self, eid: Eid, attr: Attribute, out: &mut Vec<Datom>) {
        if let Some(values) = self.rows.get(&eid).and_then(|row| row.get(&attr)) {
            push_values(eid, attr, values, out);
        }
    }

    fn lookup(&self, eid: Eid, attr: Attribute, value: &Value) -> Option<Tx> {
        self.rows.get(&eid)?.get(&attr)?.get(value)
    }

    fn datom_count(&self) -> usize {
        self.rows
            .values()
            .flat_map(|row| row.values())
            .map(|values| match values {
                Values::One(..) => 1,
                Values::Many(values) => values.len(),
            })
            .sum()
    }
}

fn push_values(eid: Eid, attr: Attribute, values: &Values, out: &mut Vec<Datom>) {
    out.extend(
        values
            .iter()
            .map(|(value, tx)| Datom::assertion(eid, attr, value.clone(), tx)),
    );
}

/// Outcome of inserting a fact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inserted {
    /// The fact is new.
    Added,
    /// The identical fact was already present with this tx.
    Present(Tx),
    /// A `One` attribute held another value, which was replaced.
    Replaced(Value, Tx),
}

/// Immutable-once-published, structurally shared datom store.
#[derive(Clone)]
pub struct Index {
    parts: [Arc<Partition>; PARTITION_COUNT],
}

impl Default for Index {
    fn default() -> Self {
        Self::new()
    }
}

impl Index {
    /// An index with every partition empty.
    #[must_use]
    pub fn new() -> Self {
        Self {
            parts: std::array::from_fn(|_| Arc::new(Partition::default())),
        }
    }

    fn part(&self, eid: Eid) -> Option<&Partition> {
        self.parts.get(eid.part() as usize).map(Arc::as_ref)
    }

    fn part_mut(&mut self, eid: Eid) -> DbResult<&mut Partition> {
        let slot = check_part(eid.part())? as usize;
        Ok(Arc::make_mut(&mut self.parts[slot]))
    }

    /// Identity comparison: true when every partition is shared.
    #[must_use]
    pub fn same(&self, other: &Self) -> bool {
        self.parts
            .iter()
            .zip(other.parts.iter())
            .all(|(a, b)| Arc::ptr_eq(a, b))
    }

    /// Whether partition `part` is shared with `other`.
    #[must_use]
    pub fn shares_partition(&self, other: &Self, part: Part) -> bool {
        match (self.parts.get(part as usize), other.parts.get(part as usize)) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Allocate a fresh eid in `part`.
    pub fn allocate(&mut self, part: Part) -> DbResult<Eid> {
        let slot = check_part(part)? as usize;
        let partition = Arc::make_mut(&mut self.parts[slot]);
        if partition.next_local >= MAX_LOCAL {
            return Err(DbError::PartitionExhausted(part));
        }
        partition.next_local += 1;
        Ok(Eid::new(part, partition.next_local))
    }

    /// Make sure later allocations never hand out `eid`.
    pub fn reserve(&mut self, eid: Eid) -> DbResult<()> {
        let partition = self.part_mut(eid)?;
        partition.next_local = partition.next_local.max(eid.local());
        Ok(())
    }

    /// Whether the entity has any fact.
    #[must_use]
    pub fn exists(&self, eid: Eid) -> bool {
        self.part(eid).is_some_and(|p| p.rows.contains_key(&eid))
    }

    /// Tx of the fact, if present.
    #[must_use]
    pub fn lookup(&self, eid: Eid, attr: Attribute, value: &Value) -> Option<Tx> {
        self.part(eid)?.lookup(eid, attr, value)
    }

    /// Current values of `(eid, attr)`.
    #[must_use]
    pub fn values(&self, eid: Eid, attr: Attribute) -> Vec<(Value, Tx)> {
        self.part(eid)
            .and_then(|p| p.rows.get(&eid))
            .and_then(|row| row.get(&attr))
            .map(|values| values.iter().map(|(v, tx)| (v.clone(), tx)).collect())
            .unwrap_or_default()
    }

    /// Insert a fact. `One` attributes replace their previous value.
    pub fn insert(
        &mut self,
        eid: Eid,
        attr: Attribute,
        value: Value,
        tx: Tx,
    ) -> DbResult<Inserted> {
        if let Some(present) = self.lookup(eid, attr, &value) {
            return Ok(Inserted::Present(present));
        }

        let partition = self.part_mut(eid)?;
        let row = Arc::make_mut(partition.rows.entry(eid).or_default());
        let replaced = if attr.schema().is_many() {
            match row
                .entry(attr)
                .or_insert_with(|| Values::Many(FxHashMap::default()))
            {
                Values::Many(values) => {
                    values.insert(value.clone(), tx);
                    None
                }
                one @ Values::One(..) => {
                    let previous = std::mem::replace(one, Values::One(value.clone(), tx));
                    match previous {
                        Values::One(old, old_tx) => Some((old, old_tx)),
                        Values::Many(_) => None,
                    }
                }
            }
        } else {
            match row.insert(attr, Values::One(value.clone(), tx)) {
                Some(Values::One(old, old_tx)) => Some((old, old_tx)),
                _ => None,
            }
        };

        if let Some((old, _)) = &replaced {
            partition.unindex_value(eid, attr, old);
        }
        partition.add_to_column(eid, attr);
        partition.index_value(eid, attr, &value);

        Ok(match replaced {
            Some((old, old_tx)) => Inserted::Replaced(old, old_tx),
            None => Inserted::Added,
        })
    }

    /// Remove a fact, returning the tx it was asserted in.
    pub fn remove(&mut self, eid: Eid, attr: Attribute, value: &Value) -> Option<Tx> {
        let tx = self.lookup(eid, attr, value)?;

        let partition = self.part_mut(eid).ok()?;
        let row_slot = partition.rows.get_mut(&eid)?;
        let row = Arc::make_mut(row_slot);
        let attr_gone = match row.get_mut(&attr)? {
            Values::One(..) => true,
            Values::Many(values) => {
                values.remove(value);
                values.is_empty()
            }
        };
        if attr_gone {
            row.remove(&attr);
        }
        let row_gone = row.is_empty();
        if row_gone {
            partition.rows.remove(&eid);
        }
        if attr_gone {
            partition.remove_from_column(eid, attr);
        }
        partition.unindex_value(eid, attr, value);
        Some(tx)
    }

    /// Keep only the listed partitions; the rest become empty.
    #[must_use]
    pub fn select(&self, parts: &[Part]) -> Self {
        Self {
            parts: std::array::from_fn(|i| {
                if parts.iter().any(|p| *p as usize == i) {
                    Arc::clone(&self.parts[i])
                } else {
                    Arc::new(Partition::default())
                }
            }),
        }
    }

    /// Replace partition `part` with the one from `other`.
    pub fn with_partition_from(&self, other: &Self, part: Part) -> DbResult<Self> {
        let slot = check_part(part)? as usize;
        let mut merged = self.clone();
        merged.parts[slot] = Arc::clone(&other.parts[slot]);
        Ok(merged)
    }

    /// Total number of facts.
    #[must_use]
    pub fn datom_count(&self) -> usize {
        self.parts.iter().map(|p| p.datom_count()).sum()
    }

    /// Answer a primitive query.
    #[must_use]
    pub fn query(&self, query: &IndexQuery) -> Vec<Datom> {
        let mut out = Vec::new();
        match query {
            IndexQuery::Entity { eid } => {
                if let Some(partition) = self.part(*eid) {
                    partition.row_datoms(*eid, &mut out);
                }
            }
            IndexQuery::GetOne { eid, attr } | IndexQuery::GetMany { eid, attr } => {
                if let Some(partition) = self.part(*eid) {
                    partition.attr_datoms(*eid, *attr, &mut out);
                }
            }
            IndexQuery::LookupUnique { attr, value } | IndexQuery::LookupMany { attr, value } => {
                self.lookup_value(*attr, value, &mut out);
            }
            IndexQuery::Column { attr } => {
                for partition in &self.parts {
                    if let Some(eids) = partition.columns.get(attr) {
                        for eid in eids.iter() {
                            partition.attr_datoms(*eid, *attr, &mut out);
                        }
                    }
                }
            }
            IndexQuery::RefsTo { eid: target } => {
                let value = Value::Ref(*target);
                for partition in &self.parts {
                    if let Some(sources) = partition.refs.get(target) {
                        for (eid, attr) in sources.iter() {
                            if let Some(tx) = partition.lookup(*eid, *attr, &value) {
                                out.push(Datom::assertion(*eid, *attr, value.clone(), tx));
                            }
                        }
                    }
                }
            }
            IndexQuery::Contains { eid, attr, value } => {
                if let Some(tx) = self.lookup(*eid, *attr, value) {
                    out.push(Datom::assertion(*eid, *attr, value.clone(), tx));
                }
            }
            IndexQuery::All => {
                for partition in &self.parts {
                    for eid in partition.rows.keys() {
                        partition.row_datoms(*eid, &mut out);
                    }
                }
            }
        }
        out
    }

    fn lookup_value(&self, attr: Attribute, value: &Value, out: &mut Vec<Datom>) {
        for partition in &self.parts {
            if attr.schema().has_value_index() {
                let Some(eids) = partition.values.get(&attr).and_then(|v| v.get(value)) else {
                    continue;
                };
                for eid in eids {
                    if let Some(tx) = partition.lookup(*eid, attr, value) {
                        out.push(Datom::assertion(*eid, attr, value.clone(), tx));
                    }
                }
            } else if let Some(eids) = partition.columns.get(&attr) {
                for eid in eids.iter() {
                    if let Some(tx) = partition.lookup(*eid, attr, value) {
                        out.push(Datom::assertion(*eid, attr, value.clone(), tx));
                    }
                }
            }
        }
    }
}

impl Q for Index {
    fn query(&self, query: &IndexQuery) -> Arc<[Datom]> {
        Index::query(self, query).into()
    }
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("datoms", &self.datom_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eid::COMMON_PART;
    use crate::schema::Schema;

    fn attr(id: u32, schema: Schema) -> Attribute {
        Attribute::new(Eid::new(0, 100 + id), schema)
    }

    #[test]
    fn test_one_attribute_replaces() {
        let mut index = Index::new();
        let e = index.allocate(COMMON_PART).unwrap();
        let name = attr(1, Schema::one());

        assert_eq!(
            index.insert(e, name, "a".into(), Tx::from_raw(1)).unwrap(),
            Inserted::Added
        );
        assert_eq!(
            index.insert(e, name, "a".into(), Tx::from_raw(2)).unwrap(),
            Inserted::Present(Tx::from_raw(1))
        );
        assert_eq!(
            index.insert(e, name, "b".into(), Tx::from_raw(3)).unwrap(),
            Inserted::Replaced("a".into(), Tx::from_raw(1))
        );
        assert_eq!(index.values(e, name), vec![("b".into(), Tx::from_raw(3))]);
    }

    #[test]
    fn test_many_attribute_accumulates() {
        let mut index = Index::new();
        let e = index.allocate(COMMON_PART).unwrap();
        let tags = attr(2, Schema::many());
        index.insert(e, tags, "x".into(), Tx::from_raw(1)).unwrap();
        index.insert(e, tags, "y".into(), Tx::from_raw(1)).unwrap();
        assert_eq!(index.values(e, tags).len(), 2);
        assert_eq!(index.remove(e, tags, &"x".into()), Some(Tx::from_raw(1)));
        assert_eq!(index.remove(e, tags, &"x".into()), None);
        assert_eq!(index.values(e, tags).len(), 1);
    }

    #[test]
    fn test_remove_last_fact_drops_entity() {
        let mut index = Index::new();
        let e = index.allocate(COMMON_PART).unwrap();
        let name = attr(1, Schema::one().indexed());
        index.insert(e, name, "a".into(), Tx::from_raw(1)).unwrap();
        assert!(index.exists(e));
        index.remove(e, name, &"a".into());
        assert!(!index.exists(e));
        assert!(index.query(&IndexQuery::Column { attr: name }).is_empty());
        assert!(
            index
                .query(&IndexQuery::LookupMany {
                    attr: name,
                    value: "a".into()
                })
                .is_empty()
        );
    }

    #[test]
    fn test_refs_to_spans_partitions() {
        let mut index = Index::new();
        let target = index.allocate(COMMON_PART).unwrap();
        let source = index.allocate(3).unwrap();
        let owner = attr(3, Schema::one().reference());
        let name = attr(4, Schema::one());
        index.insert(target, name, "t".into(), Tx::from_raw(1)).unwrap();
        index.insert(source, owner, Value::Ref(target), Tx::from_raw(1)).unwrap();

        let refs = index.query(&IndexQuery::RefsTo { eid: target });
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].eid, source);
        assert_eq!(refs[0].attr, owner);
    }

    #[test]
    fn test_lookup_without_value_index_scans_column() {
        let mut index = Index::new();
        let a = index.allocate(COMMON_PART).unwrap();
        let b = index.allocate(COMMON_PART).unwrap();
        let color = attr(5, Schema::one());
        index.insert(a, color, "red".into(), Tx::from_raw(1)).unwrap();
        index.insert(b, color, "blue".into(), Tx::from_raw(1)).unwrap();

        let found = index.query(&IndexQuery::LookupMany {
            attr: color,
            value: "red".into(),
        });
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].eid, a);
    }

    #[test]
    fn test_clone_is_structurally_shared() {
        let mut index = Index::new();
        let e = index.allocate(COMMON_PART).unwrap();
        let name = attr(1, Schema::one());
        index.insert(e, name, "a".into(), Tx::from_raw(1)).unwrap();

        let snapshot = index.clone();
        assert!(snapshot.same(&index));

        index.insert(e, name, "b".into(), Tx::from_raw(2)).unwrap();
        assert!(!snapshot.same(&index));
        assert!(snapshot.shares_partition(&index, 3));
        assert_eq!(snapshot.values(e, name), vec![("a".into(), Tx::from_raw(1))]);
    }

    #[test]
    fn test_select_and_merge_partitions() {
        let mut index = Index::new();
        let common = index.allocate(COMMON_PART).unwrap();
        let other = index.allocate(2).unwrap();
        let name = attr(1, Schema::one());
        index.insert(common, name, "c".into(), Tx::from_raw(1)).unwrap();
        index.insert(other, name, "o".into(), Tx::from_raw(1)).unwrap();

        let only_common = index.select(&[COMMON_PART]);
        assert!(only_common.exists(common));
        assert!(!only_common.exists(other));

        let merged = only_common.with_partition_from(&index, 2).unwrap();
        assert!(merged.exists(other));
        assert_eq!(merged.datom_count(), 2);
    }

    #[test]
    fn test_allocate_respects_reserve() {
        let mut index = Index::new();
        index.reserve(Eid::new(COMMON_PART, 10)).unwrap();
        assert_eq!(index.allocate(COMMON_PART).unwrap(), Eid::new(COMMON_PART, 11));
        assert_eq!(index.allocate(2).unwrap(), Eid::new(2, 1));
    }

    #[test]
    fn test_partitions_past_max_are_empty_or_rejected() {
        let mut index = Index::new();
        let stray = Eid::new(7, 1);
        let name = attr(1, Schema::one());

        assert!(!index.exists(stray));
        assert_eq!(index.lookup(stray, name, &"a".into()), None);
        assert!(index.values(stray, name).is_empty());
        assert!(index.query(&IndexQuery::Entity { eid: stray }).is_empty());
        assert!(
            index
                .query(&IndexQuery::GetOne {
                    eid: stray,
                    attr: name
                })
                .is_empty()
        );
        assert_eq!(index.remove(stray, name, &"a".into()), None);

        assert!(matches!(
            index.insert(stray, name, "a".into(), Tx::from_raw(1)),
            Err(DbError::InvalidPartition(7))
        ));
        assert!(matches!(index.allocate(9), Err(DbError::InvalidPartition(9))));
        assert!(matches!(
            index.with_partition_from(&Index::new(), 9),
            Err(DbError::InvalidPartition(9))
        ));
        assert!(!index.shares_partition(&index.clone(), 9));
        assert!(index.shares_partition(&index.clone(), COMMON_PART));
    }

    #[test]
    fn test_exhausted_partition_stops_allocating() {
        let mut index = Index::new();
        index.reserve(Eid::new(COMMON_PART, MAX_LOCAL - 1)).unwrap();
        assert_eq!(
            index.allocate(COMMON_PART).unwrap(),
            Eid::new(COMMON_PART, MAX_LOCAL)
        );
        assert!(matches!(
            index.allocate(COMMON_PART),
            Err(DbError::PartitionExhausted(COMMON_PART))
        ));
        assert_eq!(index.allocate(2).unwrap(), Eid::new(2, 1));
    }
}
