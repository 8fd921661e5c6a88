//! The mutable side of a transaction.
//!
//! [`MutableDb`] owns the working index of one transaction and is the only
//! place ops are applied. Everything else in this module is a decorator: it
//! holds the next [`Mut`] in the chain, forwards every call to it and changes
//! one aspect on the way through.
//!
//! ```text
//! ExecutingEffects -> ProcessingNovelty -> MutableDb
//! ```
//!
//! Transactions are single-threaded. All methods take `&self`; state that
//! changes lives behind `Cell`/`RefCell`.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use tracing::{trace, warn};

use crate::context::DbContext;
use crate::datom::Datom;
use crate::db::Db;
use crate::editor::Editor;
use crate::eid::{Eid, Part, Tx};
use crate::error::{DbError, DbResult};
use crate::index::{Index, Inserted};
use crate::instruction::{Expansion, Instruction, InstructionEffect, Op};
use crate::meta::Meta;
use crate::novelty::Novelty;
use crate::query::{IndexQuery, Q};
use crate::schema::{Attribute, Indexing};
use crate::value::Value;

/// A writable view of the database.
pub trait Mut: Q {
    /// Partition new entities land in unless told otherwise.
    fn default_part(&self) -> Part;

    /// Tx stamped on every fact asserted through this view.
    fn tx(&self) -> Tx;

    fn new_eid(&self, part: Part) -> DbResult<Eid>;

    /// Expand an instruction against the current state. Does not write.
    fn expand(&self, instruction: &Instruction) -> DbResult<Expansion>;

    /// Apply an expansion atomically and return the novelty it produced.
    fn mutate(&self, expansion: Expansion) -> DbResult<Novelty>;

    fn meta(&self) -> &RefCell<Meta>;

    fn as_q(&self) -> &dyn Q;
}

enum Undo {
    Insert {
        eid: Eid,
        attr: Attribute,
        value: Value,
    },
    Remove {
        eid: Eid,
        attr: Attribute,
        value: Value,
        tx: Tx,
    },
}

/// Working copy of a [`Db`] for one transaction.
pub struct MutableDb {
    db_before: Db,
    index: RefCell<Index>,
    default_part: Part,
    tx: Tx,
    editor: Editor,
    meta: RefCell<Meta>,
    closed: Cell<bool>,
}

impl MutableDb {
    #[must_use]
    pub fn new(db_before: Db, default_part: Part) -> Self {
        let index = db_before.index().clone();
        Self {
            db_before,
            index: RefCell::new(index),
            default_part,
            tx: Tx::next(),
            editor: Editor::new(),
            meta: RefCell::new(Meta::new()),
            closed: Cell::new(false),
        }
    }

    #[must_use]
    pub const fn db_before(&self) -> &Db {
        &self.db_before
    }

    /// Close the transaction and hand out its final index.
    pub fn freeze(&self) -> Index {
        self.closed.set(true);
        self.index.borrow().clone()
    }

    /// Take the meta collected during the transaction.
    pub fn take_meta(&self) -> Meta {
        self.meta.take()
    }

    fn ensure_open(&self) -> DbResult<()> {
        if self.closed.get() {
            Err(DbError::TransactionClosed)
        } else {
            Ok(())
        }
    }

    fn check_unique(index: &Index, eid: Eid, attr: Attribute, value: &Value) -> DbResult<()> {
        if attr.schema().indexing() != Indexing::Unique {
            return Ok(());
        }
        let holders = index.query(&IndexQuery::LookupUnique {
            attr,
            value: value.clone(),
        });
        match holders.iter().find(|d| d.eid != eid) {
            Some(holder) => Err(DbError::validation(format!(
                "unique attribute {attr:?} already holds {value:?} on {}",
                holder.eid
            ))),
            None => Ok(()),
        }
    }

    fn assert(
        &self,
        index: &mut Index,
        undo: &mut Vec<Undo>,
        novelty: &mut Novelty,
        (eid, attr, value, tx): (Eid, Attribute, Value, Tx),
    ) -> DbResult<()> {
        if !attr.accepts(&value) {
            return Err(DbError::validation(format!(
                "attribute {attr:?} cannot hold {} value {value:?}",
                value.kind()
            )));
        }
        Self::check_unique(index, eid, attr, &value)?;

        match index.insert(eid, attr, value.clone(), tx)? {
            Inserted::Present(_) => {}
            Inserted::Added => {
                undo.push(Undo::Insert {
                    eid,
                    attr,
                    value: value.clone(),
                });
                novelty.add(self.editor, Datom::assertion(eid, attr, value, tx));
            }
            Inserted::Replaced(old, old_tx) => {
                undo.push(Undo::Remove {
                    eid,
                    attr,
                    value: old.clone(),
                    tx: old_tx,
                });
                undo.push(Undo::Insert {
                    eid,
                    attr,
                    value: value.clone(),
                });
                novelty.add(self.editor, Datom::retraction(eid, attr, old, old_tx));
                novelty.add(self.editor, Datom::assertion(eid, attr, value, tx));
            }
        }
        Ok(())
    }

    fn apply(
        &self,
        index: &mut Index,
        undo: &mut Vec<Undo>,
        novelty: &mut Novelty,
        op: Op,
    ) -> DbResult<()> {
        match op {
            Op::Assert { eid, attr, value } => {
                self.assert(index, undo, novelty, (eid, attr, value, self.tx))
            }
            Op::AssertWithTx {
                eid,
                attr,
                value,
                tx,
            } => self.assert(index, undo, novelty, (eid, attr, value, tx)),
            Op::Retract { eid, attr, value } => {
                if let Some(tx) = index.remove(eid, attr, &value) {
                    undo.push(Undo::Remove {
                        eid,
                        attr,
                        value: value.clone(),
                        tx,
                    });
                    novelty.add(self.editor, Datom::retraction(eid, attr, value, tx));
                }
                Ok(())
            }
        }
    }

    fn rollback(index: &mut Index, undo: Vec<Undo>) {
        for step in undo.into_iter().rev() {
            match step {
                Undo::Insert { eid, attr, value } => {
                    index.remove(eid, attr, &value);
                }
                Undo::Remove {
                    eid,
                    attr,
                    value,
                    tx,
                } => {
                    // Restores a fact the index held before, so its partition is valid.
                    index.insert(eid, attr, value, tx).ok();
                }
            }
        }
    }
}

impl Q for MutableDb {
    fn query(&self, query: &IndexQuery) -> Arc<[Datom]> {
        Q::query(&*self.index.borrow(), query)
    }
}

impl Mut for MutableDb {
    fn default_part(&self) -> Part {
        self.default_part
    }

    fn tx(&self) -> Tx {
        self.tx
    }

    fn new_eid(&self, part: Part) -> DbResult<Eid> {
        self.ensure_open()?;
        self.index.borrow_mut().allocate(part)
    }

    fn expand(&self, instruction: &Instruction) -> DbResult<Expansion> {
        self.ensure_open()?;
        instruction.expand(self)
    }

    fn mutate(&self, expansion: Expansion) -> DbResult<Novelty> {
        self.ensure_open()?;
        if !expansion.effects.is_empty() {
            warn!(
                effects = expansion.effects.len(),
                "effects reached the base transaction with nothing to run them; dropped"
            );
        }

        let op_count = expansion.ops.len();
        let mut index = self.index.borrow_mut();
        let mut undo = Vec::with_capacity(op_count);
        let mut novelty = Novelty::new();
        for op in expansion.ops {
            if let Err(err) = self.apply(&mut index, &mut undo, &mut novelty, op) {
                trace!(tx = ?self.tx, applied = undo.len(), %err, "mutate rolled back");
                Self::rollback(&mut index, undo);
                return Err(err);
            }
        }
        trace!(tx = ?self.tx, ops = op_count, datoms = novelty.len(), "mutate");
        Ok(novelty.persistent())
    }

    fn meta(&self) -> &RefCell<Meta> {
        &self.meta
    }

    fn as_q(&self) -> &dyn Q {
        self
    }
}

/// Implements `Q` and the pass-through half of `Mut` for a decorator; the
/// body supplies `default_part`, `expand` and `mutate`.
macro_rules! forward_mut {
    ($ty:ty { $($body:tt)* }) => {
        impl Q for $ty {
            fn query(&self, query: &IndexQuery) -> Arc<[Datom]> {
                self.inner.query(query)
            }
        }

        impl Mut for $ty {
            $($body)*

            fn tx(&self) -> Tx {
                self.inner.tx()
            }

            fn new_eid(&self, part: Part) -> DbResult<Eid> {
                self.inner.new_eid(part)
            }

            fn meta(&self) -> &RefCell<Meta> {
                self.inner.meta()
            }

            fn as_q(&self) -> &dyn Q {
                self
            }
        }
    };
}

/// Runs the effects of every expansion after its ops commit.
///
/// Each effect runs in a fresh context over the mutable view of the context
/// bound on this thread, provided it writes the same transaction; decorators
/// installed there with [`DbContext::alter`] therefore see what the effect
/// does. Otherwise the effect runs over this decorator. Instructions the
/// effect issues have their own effects executed too. The effect's novelty
/// is merged into the novelty returned to the caller, and the context is
/// poisoned once the effect returns.
pub struct ExecutingEffects {
    inner: Rc<dyn Mut>,
    this: Weak<ExecutingEffects>,
}

impl ExecutingEffects {
    pub fn new(inner: Rc<dyn Mut>) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            inner,
            this: this.clone(),
        })
    }

    fn effect_chain(&self) -> DbResult<Rc<dyn Mut>> {
        let own: Rc<dyn Mut> = self.this.upgrade().ok_or(DbError::TransactionClosed)?;
        let live = DbContext::current()
            .and_then(|ctx| ctx.mutable())
            .ok()
            .filter(|m| m.tx() == own.tx());
        Ok(live.unwrap_or(own))
    }

    fn run_effect(&self, chain: &Rc<dyn Mut>, effect: &InstructionEffect) -> DbResult<Novelty> {
        let (collector, collected) = collecting_novelty(Rc::clone(chain));
        let ctx = DbContext::over_mutable(collector);
        trace!(origin = ?effect.origin, "running effect");
        let result = ctx.bind(|ctx| effect.run(ctx));
        ctx.poison(DbError::TransactionClosed);
        result?;
        Ok(collected.take())
    }
}

forward_mut!(ExecutingEffects {
    fn default_part(&self) -> Part {
        self.inner.default_part()
    }

    fn expand(&self, instruction: &Instruction) -> DbResult<Expansion> {
        self.inner.expand(instruction)
    }

    fn mutate(&self, expansion: Expansion) -> DbResult<Novelty> {
        let Expansion { ops, effects } = expansion;
        let mut novelty = self.inner.mutate(Expansion::ops(ops))?;
        if effects.is_empty() {
            return Ok(novelty);
        }

        let chain = self.effect_chain()?;
        let editor = Editor::new();
        for effect in &effects {
            let produced = self.run_effect(&chain, effect)?;
            novelty.merge(editor, &produced);
        }
        Ok(novelty.persistent())
    }
});

/// Hands every novelty returned by the inner chain to a callback.
pub struct ProcessingNovelty {
    inner: Rc<dyn Mut>,
    sink: Box<dyn Fn(Tx, &Novelty)>,
}

impl ProcessingNovelty {
    pub fn new(inner: Rc<dyn Mut>, sink: impl Fn(Tx, &Novelty) + 'static) -> Self {
        Self {
            inner,
            sink: Box::new(sink),
        }
    }
}

forward_mut!(ProcessingNovelty {
    fn default_part(&self) -> Part {
        self.inner.default_part()
    }

    fn expand(&self, instruction: &Instruction) -> DbResult<Expansion> {
        self.inner.expand(instruction)
    }

    fn mutate(&self, expansion: Expansion) -> DbResult<Novelty> {
        let novelty = self.inner.mutate(expansion)?;
        (self.sink)(self.inner.tx(), &novelty);
        Ok(novelty)
    }
});

/// Wrap `inner` so that all novelty passing through is merged into the
/// returned cell.
pub fn collecting_novelty(inner: Rc<dyn Mut>) -> (Rc<ProcessingNovelty>, Rc<RefCell<Novelty>>) {
    let collected = Rc::new(RefCell::new(Novelty::new()));
    let sink = Rc::clone(&collected);
    let editor = Editor::new();
    let processing = ProcessingNovelty::new(inner, move |_, novelty| {
        sink.borrow_mut().merge(editor, novelty);
    });
    (Rc::new(processing), collected)
}

/// Diverts effects to a callback instead of running them.
pub struct DelayingEffects {
    inner: Rc<dyn Mut>,
    sink: Box<dyn Fn(Vec<InstructionEffect>)>,
}

impl DelayingEffects {
    pub fn new(inner: Rc<dyn Mut>, sink: impl Fn(Vec<InstructionEffect>) + 'static) -> Self {
        Self {
            inner,
            sink: Box::new(sink),
        }
    }
}

forward_mut!(DelayingEffects {
    fn default_part(&self) -> Part {
        self.inner.default_part()
    }

    fn expand(&self, instruction: &Instruction) -> DbResult<Expansion> {
        self.inner.expand(instruction)
    }

    fn mutate(&self, expansion: Expansion) -> DbResult<Novelty> {
        let Expansion { ops, effects } = expansion;
        if !effects.is_empty() {
            (self.sink)(effects);
        }
        self.inner.mutate(Expansion::ops(ops))
    }
});

/// Overrides the default partition.
pub struct WithDefaultPart {
    inner: Rc<dyn Mut>,
    part: Part,
}

impl WithDefaultPart {
    pub fn new(inner: Rc<dyn Mut>, part: Part) -> Self {
        Self { inner, part }
    }
}

forward_mut!(WithDefaultPart {
    fn default_part(&self) -> Part {
        self.part
    }

    fn expand(&self, instruction: &Instruction) -> DbResult<Expansion> {
        self.inner.expand(instruction)
    }

    fn mutate(&self, expansion: Expansion) -> DbResult<Novelty> {
        self.inner.mutate(expansion)
    }
});

/// Records every instruction expanded through it.
pub struct CollectingInstructions {
    inner: Rc<dyn Mut>,
    sink: Box<dyn Fn(&Instruction)>,
}

impl CollectingInstructions {
    pub fn new(inner: Rc<dyn Mut>, sink: impl Fn(&Instruction) + 'static) -> Self {
        Self {
            inner,
            sink: Box::new(sink),
        }
    }
}

forward_mut!(CollectingInstructions {
    fn default_part(&self) -> Part {
        self.inner.default_part()
    }

    fn expand(&self, instruction: &Instruction) -> DbResult<Expansion> {
        (self.sink)(instruction);
        self.inner.expand(instruction)
    }

    fn mutate(&self, expansion: Expansion) -> DbResult<Novelty> {
        self.inner.mutate(expansion)
    }
});

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eid::COMMON_PART;
    use crate::entity::ENTITY_TYPE_IDENT;
    use crate::query::QueryExt;
    use crate::schema::Schema;

    fn fresh() -> Rc<MutableDb> {
        Rc::new(MutableDb::new(Db::empty(), COMMON_PART))
    }

    fn name_attr() -> Attribute {
        Attribute::new(Eid::new(0, 500), Schema::one())
    }

    #[test]
    fn test_one_cardinality_assert_replaces() {
        let db = fresh();
        let e = db.new_eid(COMMON_PART).unwrap();
        let name = name_attr();
        db.mutate(Expansion::ops(vec![Op::Assert {
            eid: e,
            attr: name,
            value: "a".into(),
        }]))
        .unwrap();

        let novelty = db
            .mutate(Expansion::ops(vec![Op::Assert {
                eid: e,
                attr: name,
                value: "b".into(),
            }]))
            .unwrap();
        assert_eq!(novelty.assertions().count(), 1);
        assert_eq!(novelty.retractions().count(), 1);
        assert_eq!(db.get_one(e, name), Some("b".into()));
    }

    #[test]
    fn test_retracting_absent_fact_is_silent() {
        let db = fresh();
        let novelty = db
            .mutate(Expansion::ops(vec![Op::Retract {
                eid: Eid::new(COMMON_PART, 77),
                attr: name_attr(),
                value: "x".into(),
            }]))
            .unwrap();
        assert!(novelty.is_empty());
    }

    #[test]
    fn test_failed_mutate_rolls_back() {
        let db = fresh();
        let e = db.new_eid(COMMON_PART).unwrap();
        let name = name_attr();
        let result = db.mutate(Expansion::ops(vec![
            Op::Assert {
                eid: e,
                attr: name,
                value: "kept out".into(),
            },
            // Collides with the bootstrap ident of the EntityType type.
            Op::Assert {
                eid: e,
                attr: ENTITY_TYPE_IDENT.attribute(),
                value: "EntityType".into(),
            },
        ]));
        assert!(matches!(result, Err(DbError::TxValidation { .. })));
        assert!(!db.exists(e));
    }

    #[test]
    fn test_value_kind_is_validated() {
        let db = fresh();
        let e = db.new_eid(COMMON_PART).unwrap();
        let result = db.mutate(Expansion::ops(vec![Op::Assert {
            eid: e,
            attr: name_attr(),
            value: Value::Ref(e),
        }]));
        assert!(matches!(result, Err(DbError::TxValidation { .. })));
    }

    #[test]
    fn test_frozen_db_rejects_writes() {
        let db = fresh();
        let index = db.freeze();
        assert!(index.same(db.db_before().index()));
        assert!(matches!(
            db.new_eid(COMMON_PART),
            Err(DbError::TransactionClosed)
        ));
        assert!(matches!(
            db.mutate(Expansion::default()),
            Err(DbError::TransactionClosed)
        ));
    }

    #[test]
    fn test_collecting_novelty_sees_every_mutate() {
        let base = fresh();
        let (collector, collected) = collecting_novelty(base.clone());
        let e = collector.new_eid(COMMON_PART).unwrap();
        for value in ["a", "b"] {
            collector
                .mutate(Expansion::ops(vec![Op::Assert {
                    eid: e,
                    attr: name_attr(),
                    value: value.into(),
                }]))
                .unwrap();
        }
        // "a" was asserted and replaced inside the same tx: it cancels out.
        let collected = collected.borrow();
        assert_eq!(collected.len(), 1);
        assert!(collected.contains(&Datom::assertion(e, name_attr(), "b".into(), base.tx())));
    }

    #[test]
    fn test_with_default_part_overrides() {
        let base = fresh();
        let scoped = WithDefaultPart::new(base, 3);
        assert_eq!(scoped.default_part(), 3);
    }
}
