//! Per-snapshot query cache.
//!
//! A [`QueryCache`] memoizes results against exactly one `Db`. Every entry
//! remembers the pattern hashes it read; when a transaction produces the next
//! snapshot, [`QueryCache::revise`] carries over only the entries whose
//! patterns the novelty did not touch. Entries are therefore never stale for
//! the snapshot that owns them.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHasher;
use smallvec::SmallVec;
use tracing::trace;

use crate::config::DbConfig;
use crate::datom::Datom;
use crate::novelty::Novelty;
use crate::query::{IndexQuery, PatternKey, Q};
use crate::{FxHashMap, FxHashSet};

/// A composite read whose result is worth caching.
///
/// `compute` may only read through the view it is given, so the cache can
/// record which patterns the result depends on.
pub trait CachedQuery: Clone + Hash + Eq + Send + Sync + 'static {
    type Output: Clone + Send + Sync + 'static;

    fn compute(&self, q: &dyn Q) -> Self::Output;
}

type Patterns = SmallVec<[u64; 4]>;

struct Composite {
    key: Arc<dyn Any + Send + Sync>,
    value: Arc<dyn Any + Send + Sync>,
    patterns: Patterns,
}

impl Clone for Composite {
    fn clone(&self) -> Self {
        Self {
            key: Arc::clone(&self.key),
            value: Arc::clone(&self.value),
            patterns: self.patterns.clone(),
        }
    }
}

#[derive(Default, Clone)]
struct Entries {
    primitives: FxHashMap<IndexQuery, Arc<[Datom]>>,
    composites: FxHashMap<(TypeId, u64), Vec<Composite>>,
    len: usize,
}

struct Inner {
    entries: RwLock<Entries>,
    config: DbConfig,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Hit and miss counters of one cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Memoized query results of one snapshot. Cheap to clone.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<Inner>,
}

impl QueryCache {
    #[must_use]
    pub fn new(config: DbConfig) -> Self {
        Self::with_entries(config, Entries::default())
    }

    fn with_entries(config: DbConfig, entries: Entries) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(entries),
                config,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    fn enabled(&self) -> bool {
        self.inner.config.query_cache
    }

    fn hit(&self) {
        self.inner.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.inner.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Cached result of a primitive query, computing it on a miss.
    pub fn primitive(
        &self,
        query: &IndexQuery,
        compute: impl FnOnce() -> Arc<[Datom]>,
    ) -> Arc<[Datom]> {
        if !self.enabled() || matches!(query, IndexQuery::All) {
            return compute();
        }
        if let Some(found) = self.inner.entries.read().primitives.get(query) {
            self.hit();
            return Arc::clone(found);
        }
        self.miss();
        let result = compute();
        let mut entries = self.inner.entries.write();
        if entries.len < self.inner.config.cache_capacity
            && !entries.primitives.contains_key(query)
        {
            entries.primitives.insert(query.clone(), Arc::clone(&result));
            entries.len += 1;
        }
        result
    }

    /// Cached result of a composite query computed against `view`.
    pub fn composite<C: CachedQuery>(&self, query: &C, view: &dyn Q) -> C::Output {
        if !self.enabled() {
            return query.compute(view);
        }
        let slot = (TypeId::of::<C>(), hash_of(query));
        if let Some(found) = self.find_composite(&slot, query) {
            self.hit();
            return found;
        }
        self.miss();

        let tracking = Tracking {
            view,
            patterns: RefCell::default(),
        };
        let output = query.compute(&tracking);
        let mut patterns = tracking.patterns.into_inner();
        patterns.sort_unstable();
        patterns.dedup();

        let mut entries = self.inner.entries.write();
        if entries.len < self.inner.config.cache_capacity {
            entries.composites.entry(slot).or_default().push(Composite {
                key: Arc::new(query.clone()),
                value: Arc::new(output.clone()),
                patterns,
            });
            entries.len += 1;
        }
        output
    }

    fn find_composite<C: CachedQuery>(&self, slot: &(TypeId, u64), query: &C) -> Option<C::Output> {
        let entries = self.inner.entries.read();
        entries
            .composites
            .get(slot)?
            .iter()
            .find(|c| c.key.downcast_ref::<C>() == Some(query))
            .and_then(|c| c.value.downcast_ref::<C::Output>().cloned())
    }

    /// The cache for the snapshot `novelty` leads to.
    #[must_use]
    pub fn revise(&self, novelty: &Novelty) -> Self {
        if novelty.is_empty() {
            return self.clone();
        }
        let touched: FxHashSet<u64> = novelty
            .datoms()
            .flat_map(|d| PatternKey::touched_by(&d))
            .map(|key| key.pattern_hash())
            .collect();

        let entries = self.inner.entries.read();
        let mut kept = Entries::default();
        for (query, result) in &entries.primitives {
            if !touched.contains(&query.pattern_hash()) {
                kept.primitives.insert(query.clone(), Arc::clone(result));
            }
        }
        for (slot, composites) in &entries.composites {
            let survivors: Vec<Composite> = composites
                .iter()
                .filter(|c| c.patterns.iter().all(|p| !touched.contains(p)))
                .cloned()
                .collect();
            if !survivors.is_empty() {
                kept.composites.insert(*slot, survivors);
            }
        }
        kept.len = kept.primitives.len() + kept.composites.values().map(Vec::len).sum::<usize>();
        trace!(
            before = entries.len,
            after = kept.len,
            touched = touched.len(),
            "revised query cache"
        );
        drop(entries);
        Self::with_entries(self.inner.config, kept)
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            entries: self.inner.entries.read().len,
        }
    }
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn hash_of<T: Hash>(value: &T) -> u64 {
    let mut hasher = FxHasher::default();
    value.hash(&mut hasher);
    hasher.finish()
}

/// View that records the pattern of every query it answers.
struct Tracking<'a> {
    view: &'a dyn Q,
    patterns: RefCell<Patterns>,
}

impl Q for Tracking<'_> {
    fn query(&self, query: &IndexQuery) -> Arc<[Datom]> {
        self.patterns.borrow_mut().push(query.pattern_hash());
        self.view.query(query)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::editor::Editor;
    use crate::eid::{COMMON_PART, Eid, SCHEMA_PART, Tx};
    use crate::index::Index;
    use crate::query::QueryExt;
    use crate::schema::{Attribute, Schema};
    use crate::value::Value;

    fn attr(id: u32) -> Attribute {
        Attribute::new(Eid::new(SCHEMA_PART, 400 + id), Schema::one().indexed())
    }

    #[derive(Clone, PartialEq, Eq, Hash)]
    struct Holders(Attribute, Value);

    impl CachedQuery for Holders {
        type Output = usize;

        fn compute(&self, q: &dyn Q) -> usize {
            q.lookup_many(self.0, self.1.clone()).len()
        }
    }

    fn novelty_of(datom: Datom) -> Novelty {
        let mut novelty = Novelty::new();
        novelty.add(Editor::new(), datom);
        novelty.persistent()
    }

    #[test]
    fn test_primitive_computes_once() {
        let cache = QueryCache::new(DbConfig::default());
        let query = IndexQuery::Entity {
            eid: Eid::new(COMMON_PART, 1),
        };
        let calls = Cell::new(0);
        for _ in 0..3 {
            cache.primitive(&query, || {
                calls.set(calls.get() + 1);
                Arc::from(Vec::new())
            });
        }
        assert_eq!(calls.get(), 1);
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 2,
                misses: 1,
                entries: 1,
            }
        );
    }

    #[test]
    fn test_full_scans_are_not_cached() {
        let cache = QueryCache::new(DbConfig::default());
        cache.primitive(&IndexQuery::All, || Arc::from(Vec::new()));
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[test]
    fn test_revise_drops_only_touched_entries() {
        let name = attr(1);
        let ada = Eid::new(COMMON_PART, 1);
        let bob = Eid::new(COMMON_PART, 2);
        let cache = QueryCache::new(DbConfig::default());
        for eid in [ada, bob] {
            cache.primitive(&IndexQuery::Entity { eid }, || Arc::from(Vec::new()));
        }

        let revised = cache.revise(&novelty_of(Datom::assertion(
            ada,
            name,
            "Ada".into(),
            Tx::from_raw(1),
        )));
        assert_eq!(revised.stats().entries, 1);
        assert_eq!(revised.stats().hits, 0);
        assert_eq!(cache.stats().entries, 2);
    }

    #[test]
    fn test_composite_tracks_patterns_it_read() {
        let name = attr(1);
        let other = attr(2);
        let mut index = Index::new();
        let ada = index.allocate(COMMON_PART).unwrap();
        index.insert(ada, name, "Ada".into(), Tx::from_raw(1)).unwrap();

        let cache = QueryCache::new(DbConfig::default());
        let query = Holders(name, "Ada".into());
        assert_eq!(cache.composite(&query, &index), 1);
        assert_eq!(cache.composite(&query, &index), 1);
        assert_eq!(cache.stats().hits, 1);

        let unrelated = cache.revise(&novelty_of(Datom::assertion(
            ada,
            other,
            "x".into(),
            Tx::from_raw(2),
        )));
        assert_eq!(unrelated.stats().entries, 1);

        let related = cache.revise(&novelty_of(Datom::assertion(
            Eid::new(COMMON_PART, 2),
            name,
            "Ada".into(),
            Tx::from_raw(2),
        )));
        assert_eq!(related.stats().entries, 0);
    }
}
