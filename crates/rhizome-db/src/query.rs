//! Primitive index queries and pattern routing.
//!
//! Every read bottoms out in one [`IndexQuery`]. A [`Pattern`] with some of
//! its `e`, `a`, `v` coordinates bound compiles to exactly one of them, and
//! each query has a wildcard [`PatternKey`] whose hash is the unit of cache
//! invalidation.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use rustc_hash::FxHasher;
use smallvec::SmallVec;

use crate::datom::Datom;
use crate::eid::Eid;
use crate::entity::{self, EntityType};
use crate::error::DbResult;
use crate::schema::{Attr, AttrValue, Attribute, Indexing};
use crate::value::Value;

/// The closed set of primitive lookups the index answers.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum IndexQuery {
    /// Every fact of one entity.
    Entity { eid: Eid },
    /// The value of a `One` attribute.
    GetOne { eid: Eid, attr: Attribute },
    /// The values of a `Many` attribute.
    GetMany { eid: Eid, attr: Attribute },
    /// The entity holding a unique value.
    LookupUnique { attr: Attribute, value: Value },
    /// Every entity holding a value.
    LookupMany { attr: Attribute, value: Value },
    /// Every fact of an attribute.
    Column { attr: Attribute },
    /// Every ref-typed fact pointing at `eid`.
    RefsTo { eid: Eid },
    /// One exact fact.
    Contains {
        eid: Eid,
        attr: Attribute,
        value: Value,
    },
    /// Every fact.
    All,
}

impl IndexQuery {
    /// Wildcard pattern this query reads.
    #[must_use]
    pub fn pattern(&self) -> PatternKey {
        match self {
            Self::Entity { eid } => PatternKey::new(Some(*eid), None, None),
            Self::GetOne { eid, attr } | Self::GetMany { eid, attr } => {
                PatternKey::new(Some(*eid), Some(*attr), None)
            }
            Self::LookupUnique { attr, value } | Self::LookupMany { attr, value } => {
                PatternKey::new(None, Some(*attr), Some(value.clone()))
            }
            Self::Column { attr } => PatternKey::new(None, Some(*attr), None),
            Self::RefsTo { eid } => PatternKey::new(None, None, Some(Value::Ref(*eid))),
            Self::Contains { eid, attr, value } => {
                PatternKey::new(Some(*eid), Some(*attr), Some(value.clone()))
            }
            Self::All => PatternKey::default(),
        }
    }

    #[must_use]
    pub fn pattern_hash(&self) -> u64 {
        self.pattern().pattern_hash()
    }
}

/// `(e?, a?, v?)` with unbound coordinates as wildcards.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct PatternKey {
    pub e: Option<Eid>,
    pub a: Option<Attribute>,
    pub v: Option<Value>,
}

impl PatternKey {
    #[must_use]
    pub const fn new(e: Option<Eid>, a: Option<Attribute>, v: Option<Value>) -> Self {
        Self { e, a, v }
    }

    #[must_use]
    pub fn pattern_hash(&self) -> u64 {
        let mut hasher = FxHasher::default();
        self.hash(&mut hasher);
        hasher.finish()
    }

    /// Every pattern whose results can change when `datom` is added or
    /// removed.
    #[must_use]
    pub fn touched_by(datom: &Datom) -> SmallVec<[Self; 7]> {
        let e = Some(datom.eid);
        let a = Some(datom.attr);
        let v = Some(datom.value.clone());
        let mut keys = SmallVec::new();
        keys.push(Self::new(e, None, None));
        keys.push(Self::new(e, a, None));
        keys.push(Self::new(e, a, v.clone()));
        keys.push(Self::new(None, a, None));
        keys.push(Self::new(None, a, v.clone()));
        if datom.attr.schema().is_ref() {
            keys.push(Self::new(None, None, v));
        }
        keys.push(Self::default());
        keys
    }
}

/// A partially bound triple.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct Pattern {
    pub e: Option<Eid>,
    pub a: Option<Attribute>,
    pub v: Option<Value>,
}

impl Pattern {
    #[must_use]
    pub const fn new(e: Option<Eid>, a: Option<Attribute>, v: Option<Value>) -> Self {
        Self { e, a, v }
    }

    /// The single index query that covers this pattern.
    ///
    /// The result may hold more than the pattern asks for (`e, v` reads the
    /// whole entity); filter it with [`Pattern::matches`].
    #[must_use]
    pub fn index_query(&self) -> IndexQuery {
        match (&self.e, &self.a, &self.v) {
            (Some(eid), Some(attr), Some(value)) => IndexQuery::Contains {
                eid: *eid,
                attr: *attr,
                value: value.clone(),
            },
            (Some(eid), Some(attr), None) => {
                if attr.schema().is_many() {
                    IndexQuery::GetMany {
                        eid: *eid,
                        attr: *attr,
                    }
                } else {
                    IndexQuery::GetOne {
                        eid: *eid,
                        attr: *attr,
                    }
                }
            }
            (Some(eid), None, _) => IndexQuery::Entity { eid: *eid },
            (None, Some(attr), Some(value)) => match attr.schema().indexing() {
                Indexing::Unique => IndexQuery::LookupUnique {
                    attr: *attr,
                    value: value.clone(),
                },
                Indexing::Indexed | Indexing::None => IndexQuery::LookupMany {
                    attr: *attr,
                    value: value.clone(),
                },
            },
            (None, Some(attr), None) => IndexQuery::Column { attr: *attr },
            (None, None, Some(Value::Ref(eid))) => IndexQuery::RefsTo { eid: *eid },
            (None, None, _) => IndexQuery::All,
        }
    }

    #[must_use]
    pub fn matches(&self, datom: &Datom) -> bool {
        self.e.is_none_or(|e| e == datom.eid)
            && self.a.is_none_or(|a| a == datom.attr)
            && self.v.as_ref().is_none_or(|v| *v == datom.value)
    }
}

/// A read-only view of the database.
pub trait Q {
    fn query(&self, query: &IndexQuery) -> Arc<[Datom]>;
}

impl<T: Q + ?Sized> Q for &T {
    fn query(&self, query: &IndexQuery) -> Arc<[Datom]> {
        (**self).query(query)
    }
}

impl<T: Q + ?Sized> Q for std::rc::Rc<T> {
    fn query(&self, query: &IndexQuery) -> Arc<[Datom]> {
        (**self).query(query)
    }
}

/// Convenience reads over any [`Q`].
pub trait QueryExt: Q {
    fn entity(&self, eid: Eid) -> Arc<[Datom]> {
        self.query(&IndexQuery::Entity { eid })
    }

    fn get_one(&self, eid: Eid, attr: Attribute) -> Option<Value> {
        self.query(&IndexQuery::GetOne { eid, attr })
            .first()
            .map(|d| d.value.clone())
    }

    fn get_many(&self, eid: Eid, attr: Attribute) -> Vec<Value> {
        self.query(&IndexQuery::GetMany { eid, attr })
            .iter()
            .map(|d| d.value.clone())
            .collect()
    }

    fn lookup_unique(&self, attr: Attribute, value: Value) -> Option<Eid> {
        self.query(&IndexQuery::LookupUnique { attr, value })
            .first()
            .map(|d| d.eid)
    }

    fn lookup_many(&self, attr: Attribute, value: Value) -> Vec<Eid> {
        self.query(&IndexQuery::LookupMany { attr, value })
            .iter()
            .map(|d| d.eid)
            .collect()
    }

    fn column(&self, attr: Attribute) -> Arc<[Datom]> {
        self.query(&IndexQuery::Column { attr })
    }

    fn refs_to(&self, eid: Eid) -> Arc<[Datom]> {
        self.query(&IndexQuery::RefsTo { eid })
    }

    fn contains(&self, eid: Eid, attr: Attribute, value: Value) -> bool {
        !self
            .query(&IndexQuery::Contains { eid, attr, value })
            .is_empty()
    }

    fn exists(&self, eid: Eid) -> bool {
        !self.entity(eid).is_empty()
    }

    /// Match a partially bound triple.
    fn q(&self, e: Option<Eid>, a: Option<Attribute>, v: Option<Value>) -> Vec<Datom> {
        let pattern = Pattern::new(e, a, v);
        self.query(&pattern.index_query())
            .iter()
            .filter(|d| pattern.matches(d))
            .cloned()
            .collect()
    }

    /// Typed read of a `One` attribute.
    fn get<T: AttrValue>(&self, eid: Eid, attr: Attr<T>) -> Option<T> {
        self.get_one(eid, attr.attribute())
            .and_then(|v| attr.decode(&v))
    }

    /// Typed read of every value of an attribute.
    fn get_all<T: AttrValue>(&self, eid: Eid, attr: Attr<T>) -> Vec<T> {
        self.query(&IndexQuery::GetMany {
            eid,
            attr: attr.attribute(),
        })
        .iter()
        .filter_map(|d| attr.decode(&d.value))
        .collect()
    }

    /// Resolve an attribute by ident.
    fn attribute(&self, ident: &str) -> DbResult<Attribute> {
        entity::attribute_by_ident(self.as_dyn(), ident)
    }

    /// Resolve a registered entity type by ident.
    fn entity_type(&self, ident: &str) -> DbResult<EntityType> {
        EntityType::by_ident(self.as_dyn(), ident)
    }

    /// The object attached to an entity, if it is a `T`.
    fn entity_object<T: Send + Sync + 'static>(&self, eid: Eid) -> Option<Arc<T>> {
        self.get_one(eid, entity::ENTITY_OBJECT.attribute())?
            .as_object()?
            .downcast::<T>()
    }

    #[doc(hidden)]
    fn as_dyn(&self) -> &dyn Q;
}

impl<T: Q> QueryExt for T {
    fn as_dyn(&self) -> &dyn Q {
        self
    }
}

impl QueryExt for dyn Q + '_ {
    fn as_dyn(&self) -> &dyn Q {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eid::{COMMON_PART, SCHEMA_PART, Tx};
    use crate::schema::Schema;

    fn attr(id: u32, schema: Schema) -> Attribute {
        Attribute::new(Eid::new(SCHEMA_PART, 200 + id), schema)
    }

    #[test]
    fn test_pattern_dispatch() {
        let e = Eid::new(COMMON_PART, 1);
        let one = attr(1, Schema::one());
        let many = attr(2, Schema::many());
        let unique = attr(3, Schema::one().unique());
        let v = Value::from("x");

        assert_eq!(
            Pattern::new(Some(e), None, None).index_query(),
            IndexQuery::Entity { eid: e }
        );
        assert_eq!(
            Pattern::new(Some(e), Some(one), None).index_query(),
            IndexQuery::GetOne { eid: e, attr: one }
        );
        assert_eq!(
            Pattern::new(Some(e), Some(many), None).index_query(),
            IndexQuery::GetMany { eid: e, attr: many }
        );
        assert_eq!(
            Pattern::new(None, Some(unique), Some(v.clone())).index_query(),
            IndexQuery::LookupUnique {
                attr: unique,
                value: v.clone()
            }
        );
        assert_eq!(
            Pattern::new(None, Some(one), Some(v.clone())).index_query(),
            IndexQuery::LookupMany {
                attr: one,
                value: v.clone()
            }
        );
        assert_eq!(
            Pattern::new(None, Some(one), None).index_query(),
            IndexQuery::Column { attr: one }
        );
        assert_eq!(
            Pattern::new(None, None, Some(Value::Ref(e))).index_query(),
            IndexQuery::RefsTo { eid: e }
        );
        assert_eq!(
            Pattern::new(Some(e), None, Some(v.clone())).index_query(),
            IndexQuery::Entity { eid: e }
        );
        assert_eq!(Pattern::new(None, None, Some(v)).index_query(), IndexQuery::All);
        assert_eq!(Pattern::default().index_query(), IndexQuery::All);
    }

    #[test]
    fn test_pattern_matches_filters_over_read() {
        let e = Eid::new(COMMON_PART, 1);
        let name = attr(1, Schema::one());
        let datom = Datom::assertion(e, name, "a".into(), Tx::from_raw(1));
        assert!(Pattern::new(Some(e), None, Some("a".into())).matches(&datom));
        assert!(!Pattern::new(Some(e), None, Some("b".into())).matches(&datom));
    }

    #[test]
    fn test_every_query_pattern_is_touched_by_matching_datom() {
        let e = Eid::new(COMMON_PART, 1);
        let target = Eid::new(COMMON_PART, 2);
        let owner = attr(4, Schema::one().reference());
        let datom = Datom::assertion(e, owner, Value::Ref(target), Tx::from_raw(1));
        let touched: Vec<u64> = PatternKey::touched_by(&datom)
            .iter()
            .map(PatternKey::pattern_hash)
            .collect();
        assert_eq!(touched.len(), 7);

        let queries = [
            IndexQuery::Entity { eid: e },
            IndexQuery::GetOne { eid: e, attr: owner },
            IndexQuery::LookupMany {
                attr: owner,
                value: Value::Ref(target),
            },
            IndexQuery::Column { attr: owner },
            IndexQuery::RefsTo { eid: target },
            IndexQuery::Contains {
                eid: e,
                attr: owner,
                value: Value::Ref(target),
            },
            IndexQuery::All,
        ];
        for query in queries {
            assert!(touched.contains(&query.pattern_hash()), "{query:?}");
        }
        assert!(!touched.contains(&IndexQuery::Entity { eid: target }.pattern_hash()));
    }

    #[test]
    fn test_non_ref_datom_does_not_touch_refs_to() {
        let e = Eid::new(COMMON_PART, 1);
        let count = attr(5, Schema::one());
        let datom = Datom::assertion(e, count, Value::Int(3), Tx::from_raw(1));
        assert_eq!(PatternKey::touched_by(&datom).len(), 6);
    }
}
