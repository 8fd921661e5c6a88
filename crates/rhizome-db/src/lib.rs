#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_fields_in_debug)]

//! Rhizome DB - embedded transactional entity-attribute-value database.
//!
//! Facts are [`Datom`]s: `(entity, attribute, value, tx, added)`. A [`Db`] is
//! an immutable snapshot of them, cheap to clone and safe to share between
//! threads. Writing happens inside [`Db::change`], which forks the snapshot,
//! runs a closure against a thread-bound [`DbContext`] and returns the next
//! snapshot together with the [`Novelty`] that separates the two.
//!
//! # Key Concepts
//!
//! - **Eid**: entity id; the top 4 bits name the partition
//! - **Attribute**: an entity carrying a [`Schema`] (cardinality, indexing,
//!   required, cascade flags)
//! - **Instruction**: a high-level write, expanded against the current view
//!   into primitive [`Op`]s and deferred effects
//! - **Novelty**: assertions and retractions of a transaction, where an
//!   assertion and a retraction of the same fact cancel out
//! - **Entity types**: registered as data, so the schema can be queried like
//!   anything else
//!
//! # Example
//!
//! ```ignore
//! let change = Db::empty().change(COMMON_PART, |ctx| {
//!     let person = ctx.register(
//!         EntityTypeDef::new("Person")
//!             .attribute(AttributeDef::new("name", Schema::one().required())),
//!     )?;
//!     person.new(ctx, [("name", Value::from("Ada"))])
//! })?;
//!
//! let ada = change.value;
//! let name = change.db_after.attribute("Person.name")?;
//! assert_eq!(change.db_after.get_one(ada, name), Some(Value::from("Ada")));
//! ```

pub mod cache;
pub mod cascade;
pub mod config;
pub mod context;
pub mod datom;
pub mod db;
pub mod editor;
pub mod eid;
pub mod entity;
pub mod error;
pub mod index;
pub mod instruction;
pub mod meta;
pub mod mutation;
pub mod novelty;
pub mod query;
pub mod schema;
pub mod value;

pub use cache::{CacheStats, CachedQuery, QueryCache};
pub use config::DbConfig;
pub use context::{DbContext, with_db, with_mutable};
pub use datom::Datom;
pub use db::{Change, Db};
pub use editor::{Editor, TransientSet};
pub use eid::{COMMON_PART, Eid, MAX_PART, PARTITION_COUNT, Part, SCHEMA_PART, Seed, Tx};
pub use entity::{AttributeDef, DefaultValue, EntityFactory, EntityType, EntityTypeDef};
pub use error::{DbError, DbResult};
pub use index::Index;
pub use instruction::{Expansion, Instruction, InstructionEffect, Op};
pub use meta::Meta;
pub use mutation::{Mut, MutableDb};
pub use novelty::Novelty;
pub use query::{IndexQuery, Pattern, PatternKey, Q, QueryExt};
pub use schema::{Attr, AttrValue, Attribute, Cardinality, Indexing, Schema};
pub use value::{ObjectRef, Value};

pub(crate) type FxHashMap<K, V> = hashbrown::HashMap<K, V, rustc_hash::FxBuildHasher>;
pub(crate) type FxHashSet<V> = hashbrown::HashSet<V, rustc_hash::FxBuildHasher>;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        Attr, Attribute, COMMON_PART, Datom, Db, DbContext, DbError, DbResult, Eid, EntityType,
        EntityTypeDef, AttributeDef, Instruction, Novelty, Q, QueryExt, Schema, Value,
    };
}
