//! Immutable snapshots and transactions.

use std::rc::Rc;
use std::sync::{Arc, LazyLock};

use tracing::debug;

use crate::cache::{CacheStats, CachedQuery, QueryCache};
use crate::config::DbConfig;
use crate::context::DbContext;
use crate::datom::Datom;
use crate::eid::{Part, Tx, check_part};
use crate::entity;
use crate::error::{DbError, DbResult};
use crate::index::Index;
use crate::meta::Meta;
use crate::mutation::{ExecutingEffects, Mut, MutableDb, collecting_novelty};
use crate::novelty::Novelty;
use crate::query::{IndexQuery, Q};

static EMPTY: LazyLock<Db> = LazyLock::new(|| Db::with_config(DbConfig::from_env()));

/// An immutable snapshot.
///
/// Cloning is cheap and snapshots may be shared across threads. Two
/// snapshots are equal when they share the same index, which is the case
/// for a snapshot and its clones and after a transaction that changed
/// nothing.
#[derive(Clone)]
pub struct Db {
    index: Index,
    cache: QueryCache,
    config: DbConfig,
}

impl Db {
    /// The bootstrapped snapshot holding only the meta schema.
    #[must_use]
    pub fn empty() -> Self {
        EMPTY.clone()
    }

    /// A fresh bootstrapped snapshot with its own cache settings.
    #[must_use]
    pub fn with_config(config: DbConfig) -> Self {
        let mut index = Index::new();
        entity::bootstrap(&mut index);
        Self {
            index,
            cache: QueryCache::new(config),
            config,
        }
    }

    #[must_use]
    pub const fn index(&self) -> &Index {
        &self.index
    }

    #[must_use]
    pub const fn config(&self) -> DbConfig {
        self.config
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    #[must_use]
    pub fn datom_count(&self) -> usize {
        self.index.datom_count()
    }

    /// Run a composite query through this snapshot's cache.
    pub fn cached<C: CachedQuery>(&self, query: &C) -> C::Output {
        self.cache.composite(query, self)
    }

    /// Bind a read-only context over this snapshot while `f` runs.
    pub fn read<R>(&self, f: impl FnOnce(&DbContext) -> R) -> R {
        DbContext::over_query(Rc::new(self.clone())).bind(f)
    }

    /// A snapshot holding only the given partitions.
    ///
    /// References into dropped partitions are kept as they are.
    #[must_use]
    pub fn select_partitions(&self, parts: &[Part]) -> Self {
        Self {
            index: self.index.select(parts),
            cache: QueryCache::new(self.config),
            config: self.config,
        }
    }

    /// This snapshot with partition `part` taken from `other`.
    pub fn with_partition_from(&self, other: &Self, part: Part) -> DbResult<Self> {
        Ok(Self {
            index: self.index.with_partition_from(&other.index, part)?,
            cache: QueryCache::new(self.config),
            config: self.config,
        })
    }

    /// Run a transaction.
    ///
    /// `body` runs with a writable context bound; instructions it issues are
    /// applied immediately and their effects run after their ops commit. On
    /// success the result carries the new snapshot, everything the
    /// transaction changed and whatever `body` returned. On error nothing is
    /// published. Either way the context is poisoned afterwards, so handles
    /// that escaped `body` fail instead of writing into a finished
    /// transaction.
    pub fn change<R>(
        &self,
        default_part: Part,
        body: impl FnOnce(&DbContext) -> DbResult<R>,
    ) -> DbResult<Change<R>> {
        check_part(default_part)?;
        let base = Rc::new(MutableDb::new(self.clone(), default_part));
        let tx = base.tx();
        let (collector, collected) = collecting_novelty(base.clone());
        let ctx = DbContext::over_mutable(ExecutingEffects::new(collector));

        let result = ctx.bind(body);
        ctx.poison(DbError::TransactionClosed);
        let index = base.freeze();
        let value = result?;

        let novelty = collected.take().persistent();
        let db_after = Self {
            index,
            cache: self.cache.revise(&novelty),
            config: self.config,
        };
        debug!(tx = ?tx, datoms = novelty.len(), "committed");

        Ok(Change {
            db_before: self.clone(),
            db_after,
            novelty,
            meta: base.take_meta(),
            tx,
            value,
        })
    }
}

impl Q for Db {
    fn query(&self, query: &IndexQuery) -> Arc<[Datom]> {
        self.cache
            .primitive(query, || Q::query(&self.index, query))
    }
}

impl PartialEq for Db {
    fn eq(&self, other: &Self) -> bool {
        self.index.same(&other.index)
    }
}

impl Eq for Db {}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("datoms", &self.index.datom_count())
            .field("cache", &self.cache)
            .finish()
    }
}

/// Outcome of [`Db::change`].
#[derive(Debug)]
pub struct Change<R> {
    pub db_before: Db,
    pub db_after: Db,
    pub novelty: Novelty,
    pub meta: Meta,
    pub tx: Tx,
    pub value: R,
}

impl<R> Change<R> {
    /// Every datom the transaction asserted or retracted.
    pub fn datoms(&self) -> impl Iterator<Item = Datom> + '_ {
        self.novelty.datoms()
    }
}
