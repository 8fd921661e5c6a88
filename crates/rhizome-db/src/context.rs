//! Thread-bound database context.
//!
//! A [`DbContext`] is a shared handle to the view code is currently working
//! against: a read-only [`Q`], a writable [`Mut`], or a poisoned marker left
//! behind once a transaction has ended. One context at a time is *current*
//! on each thread; [`DbContext::bind`] makes a context current for the
//! duration of a closure and [`DbContext::alter`] swaps what a context points
//! at. Both restore the previous state on every exit path, panics included.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use crate::cascade;
use crate::datom::Datom;
use crate::eid::{Eid, Part, Seed, check_part};
use crate::entity::{self, EntityType, EntityTypeDef};
use crate::error::{DbError, DbResult};
use crate::instruction::{Expansion, Instruction, InstructionEffect};
use crate::mutation::{CollectingInstructions, DelayingEffects, Mut, WithDefaultPart};
use crate::novelty::Novelty;
use crate::query::{IndexQuery, Q};
use crate::schema::Attribute;
use crate::value::Value;

#[derive(Clone)]
enum State {
    Query(Rc<dyn Q>),
    Mutable(Rc<dyn Mut>),
    Poisoned(Arc<DbError>),
}

thread_local! {
    static CURRENT: RefCell<Option<DbContext>> = const { RefCell::new(None) };
}

/// Restores the previously current context on drop.
struct BindGuard(Option<DbContext>);

impl Drop for BindGuard {
    fn drop(&mut self) {
        let previous = self.0.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

/// Restores the previous implementation on drop, unless the context was
/// poisoned meanwhile.
struct AlterGuard<'a> {
    ctx: &'a DbContext,
    previous: Option<State>,
}

impl Drop for AlterGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.ctx.state.borrow_mut();
        if matches!(*state, State::Poisoned(_)) {
            return;
        }
        if let Some(previous) = self.previous.take() {
            *state = previous;
        }
    }
}

/// Shared handle to the view code runs against.
#[derive(Clone)]
pub struct DbContext {
    state: Rc<RefCell<State>>,
}

impl DbContext {
    fn from_state(state: State) -> Self {
        Self {
            state: Rc::new(RefCell::new(state)),
        }
    }

    /// A read-only context.
    pub fn over_query(q: Rc<dyn Q>) -> Self {
        Self::from_state(State::Query(q))
    }

    /// A writable context.
    pub fn over_mutable(m: Rc<dyn Mut>) -> Self {
        Self::from_state(State::Mutable(m))
    }

    /// The context bound on this thread.
    pub fn current() -> DbResult<Self> {
        CURRENT
            .with(|current| current.borrow().clone())
            .ok_or(DbError::OutOfDbContext)
    }

    /// Make this context current while `f` runs.
    pub fn bind<R>(&self, f: impl FnOnce(&Self) -> R) -> R {
        let previous = CURRENT.with(|current| current.replace(Some(self.clone())));
        let _guard = BindGuard(previous);
        f(self)
    }

    /// Point this context at `implementation` while `f` runs.
    ///
    /// Every clone of the context sees the swap.
    pub fn alter<R>(&self, implementation: Rc<dyn Mut>, f: impl FnOnce(&Self) -> R) -> R {
        let previous = self.state.replace(State::Mutable(implementation));
        let _guard = AlterGuard {
            ctx: self,
            previous: Some(previous),
        };
        f(self)
    }

    fn state(&self) -> DbResult<State> {
        let state = self.state.borrow().clone();
        match state {
            State::Poisoned(cause) => Err(DbError::Poisoned(cause)),
            live => Ok(live),
        }
    }

    /// Run `f` against the current read view.
    pub fn read<R>(&self, f: impl FnOnce(&dyn Q) -> R) -> DbResult<R> {
        match self.state()? {
            State::Query(q) => Ok(f(&*q)),
            State::Mutable(m) => Ok(f(m.as_q())),
            State::Poisoned(cause) => Err(DbError::Poisoned(cause)),
        }
    }

    pub fn query(&self, query: &IndexQuery) -> DbResult<Arc<[Datom]>> {
        self.read(|q| q.query(query))
    }

    /// The writable view, if this context has one.
    pub fn mutable(&self) -> DbResult<Rc<dyn Mut>> {
        match self.state()? {
            State::Mutable(m) => Ok(m),
            State::Query(_) => Err(DbError::OutOfMutableDbContext),
            State::Poisoned(cause) => Err(DbError::Poisoned(cause)),
        }
    }

    /// Expand and apply one instruction.
    pub fn execute(&self, instruction: &Instruction) -> DbResult<Novelty> {
        let m = self.mutable()?;
        let expansion = m.expand(instruction)?;
        m.mutate(expansion)
    }

    /// Run effects that were held back by [`DbContext::delaying_effects`].
    pub fn run_effects(&self, effects: Vec<InstructionEffect>) -> DbResult<Novelty> {
        self.mutable()?.mutate(Expansion {
            ops: Vec::new(),
            effects,
        })
    }

    /// Make every later use of this context fail with `cause`.
    pub fn poison(&self, cause: DbError) {
        *self.state.borrow_mut() = State::Poisoned(Arc::new(cause));
    }

    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        matches!(*self.state.borrow(), State::Poisoned(_))
    }

    /// Create an entity of `entity_type` in the default partition.
    pub fn new_entity(
        &self,
        entity_type: Eid,
        attributes: Vec<(Attribute, Value)>,
    ) -> DbResult<Eid> {
        let m = self.mutable()?;
        let eid = m.new_eid(m.default_part())?;
        self.execute(&Instruction::CreateEntity {
            eid,
            entity_type,
            attributes,
            seed: Seed::next(),
        })?;
        Ok(eid)
    }

    pub fn add(&self, eid: Eid, attr: Attribute, value: impl Into<Value>) -> DbResult<Novelty> {
        self.execute(&Instruction::Add {
            eid,
            attr,
            value: value.into(),
        })
    }

    pub fn remove(&self, eid: Eid, attr: Attribute, value: impl Into<Value>) -> DbResult<Novelty> {
        self.execute(&Instruction::Remove {
            eid,
            attr,
            value: value.into(),
        })
    }

    pub fn retract_attribute(&self, eid: Eid, attr: Attribute) -> DbResult<Novelty> {
        self.execute(&Instruction::RetractAttribute { eid, attr })
    }

    /// Delete an entity and everything cascading from it.
    pub fn delete(&self, eid: Eid) -> DbResult<Novelty> {
        let instruction = self.read(|q| cascade::entities_to_retract(q, eid))??;
        self.execute(&instruction)
    }

    /// Register an entity type, or return the one already registered.
    pub fn register(&self, def: EntityTypeDef) -> DbResult<EntityType> {
        entity::register(self, def)
    }

    /// Run `f` once the current instruction's ops have committed.
    pub fn effect(
        &self,
        name: &'static str,
        f: impl Fn(&Self) -> DbResult<()> + 'static,
    ) -> DbResult<Novelty> {
        self.execute(&Instruction::effect(name, f))
    }

    /// Attach a typed value to the running transaction.
    pub fn set_meta<T: Any + Send + Sync>(&self, value: T) -> DbResult<Option<T>> {
        Ok(self.mutable()?.meta().borrow_mut().insert(value))
    }

    /// A copy of the transaction meta value of type `T`.
    pub fn get_meta<T: Any + Send + Sync + Clone>(&self) -> DbResult<Option<T>> {
        Ok(self.mutable()?.meta().borrow().get::<T>().cloned())
    }

    /// Run `f` with new entities landing in `part`.
    pub fn with_default_part<R>(
        &self,
        part: Part,
        f: impl FnOnce(&Self) -> DbResult<R>,
    ) -> DbResult<R> {
        check_part(part)?;
        let inner = self.mutable()?;
        self.alter(Rc::new(WithDefaultPart::new(inner, part)), f)
    }

    /// Run `f` and return every instruction it expanded.
    pub fn collecting_instructions<R>(
        &self,
        f: impl FnOnce(&Self) -> DbResult<R>,
    ) -> DbResult<(R, Vec<Instruction>)> {
        let inner = self.mutable()?;
        let collected = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&collected);
        let collecting = CollectingInstructions::new(inner, move |instruction| {
            sink.borrow_mut().push(instruction.clone());
        });
        let value = self.alter(Rc::new(collecting), f)?;
        Ok((value, collected.take()))
    }

    /// Run `f`, holding back every effect it schedules.
    pub fn delaying_effects<R>(
        &self,
        f: impl FnOnce(&Self) -> DbResult<R>,
    ) -> DbResult<(R, Vec<InstructionEffect>)> {
        let inner = self.mutable()?;
        let delayed = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&delayed);
        let delaying = DelayingEffects::new(inner, move |effects| {
            sink.borrow_mut().extend(effects);
        });
        let value = self.alter(Rc::new(delaying), f)?;
        Ok((value, delayed.take()))
    }
}

impl std::fmt::Debug for DbContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &*self.state.borrow() {
            State::Query(_) => "query",
            State::Mutable(_) => "mutable",
            State::Poisoned(_) => "poisoned",
        };
        write!(f, "DbContext({kind})")
    }
}

/// Read through the context bound on this thread.
pub fn with_db<R>(f: impl FnOnce(&dyn Q) -> R) -> DbResult<R> {
    DbContext::current()?.read(f)
}

/// Run `f` with the context bound on this thread, which must be writable.
pub fn with_mutable<R>(f: impl FnOnce(&DbContext) -> DbResult<R>) -> DbResult<R> {
    let ctx = DbContext::current()?;
    ctx.mutable()?;
    f(&ctx)
}
