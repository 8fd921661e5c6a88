//! Instructions and their expansion into ops.
//!
//! An [`Instruction`] is a high-level write. Expanding it reads the current
//! view and produces an [`Expansion`]: the primitive [`Op`]s to apply plus
//! effects to run once those ops are committed. Expansion never writes.

use std::fmt;
use std::rc::Rc;

use crate::cascade;
use crate::context::DbContext;
use crate::eid::{Eid, Seed, Tx};
use crate::entity::{self, ENTITY_OBJECT, ENTITY_TYPES};
use crate::error::{DbError, DbResult};
use crate::query::{Q, QueryExt};
use crate::schema::Attribute;
use crate::value::Value;

/// A primitive write.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Op {
    Assert {
        eid: Eid,
        attr: Attribute,
        value: Value,
    },
    Retract {
        eid: Eid,
        attr: Attribute,
        value: Value,
    },
    /// Assert keeping a given tx. Only for rewrites that change how a fact
    /// is represented, not what it says.
    AssertWithTx {
        eid: Eid,
        attr: Attribute,
        value: Value,
        tx: Tx,
    },
}

impl Op {
    #[must_use]
    pub const fn eid(&self) -> Eid {
        match self {
            Self::Assert { eid, .. } | Self::Retract { eid, .. } | Self::AssertWithTx { eid, .. } => {
                *eid
            }
        }
    }
}

/// Callback run after the ops of its instruction commit.
pub type EffectFn = Rc<dyn Fn(&DbContext) -> DbResult<()>>;

/// A named deferred callback carried by [`Instruction::Effect`].
#[derive(Clone)]
pub struct EffectInstruction {
    name: &'static str,
    effect: EffectFn,
}

impl EffectInstruction {
    pub fn new(name: &'static str, effect: impl Fn(&DbContext) -> DbResult<()> + 'static) -> Self {
        Self {
            name,
            effect: Rc::new(effect),
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for EffectInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Effect({})", self.name)
    }
}

/// An effect together with the instruction that scheduled it.
#[derive(Clone)]
pub struct InstructionEffect {
    pub origin: Instruction,
    pub effect: EffectFn,
}

impl InstructionEffect {
    pub fn run(&self, ctx: &DbContext) -> DbResult<()> {
        (self.effect)(ctx)
    }
}

impl fmt::Debug for InstructionEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstructionEffect")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// Ops and effects produced by expanding instructions.
#[derive(Default, Debug)]
pub struct Expansion {
    pub ops: Vec<Op>,
    pub effects: Vec<InstructionEffect>,
}

impl Expansion {
    #[must_use]
    pub const fn ops(ops: Vec<Op>) -> Self {
        Self {
            ops,
            effects: Vec::new(),
        }
    }

    pub fn extend(&mut self, other: Self) {
        self.ops.extend(other.ops);
        self.effects.extend(other.effects);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.effects.is_empty()
    }
}

/// High-level write.
#[derive(Clone, Debug)]
pub enum Instruction {
    /// Create an entity of a registered type.
    CreateEntity {
        eid: Eid,
        entity_type: Eid,
        attributes: Vec<(Attribute, Value)>,
        seed: Seed,
    },
    /// Assert one fact on an existing entity.
    Add {
        eid: Eid,
        attr: Attribute,
        value: Value,
    },
    /// Retract one fact, if present.
    Remove {
        eid: Eid,
        attr: Attribute,
        value: Value,
    },
    /// Retract every value of an attribute.
    RetractAttribute { eid: Eid, attr: Attribute },
    /// Cascade-retract entities, staying inside their partition.
    RetractEntityInPartition { eids: Vec<Eid>, seed: Seed },
    /// Children expanded against one view and applied together.
    AtomicComposite {
        instructions: Vec<Instruction>,
        seed: Seed,
    },
    /// Attach an object to every entity of a type that lacks one.
    ReifyEntities { entity_type: Eid },
    /// Run a callback after commit.
    Effect(EffectInstruction),
}

impl Instruction {
    /// Correlation seed, for instructions that carry one.
    #[must_use]
    pub const fn seed(&self) -> Option<Seed> {
        match self {
            Self::CreateEntity { seed, .. }
            | Self::RetractEntityInPartition { seed, .. }
            | Self::AtomicComposite { seed, .. } => Some(*seed),
            _ => None,
        }
    }

    /// Effect scheduling `f` after commit.
    pub fn effect(name: &'static str, f: impl Fn(&DbContext) -> DbResult<()> + 'static) -> Self {
        Self::Effect(EffectInstruction::new(name, f))
    }

    /// Expand against `q`. Reads only.
    pub fn expand(&self, q: &dyn Q) -> DbResult<Expansion> {
        match self {
            Self::CreateEntity {
                eid,
                entity_type,
                attributes,
                ..
            } => expand_create(q, *eid, *entity_type, attributes),
            Self::Add { eid, attr, value } => {
                if !q.exists(*eid) {
                    return Err(DbError::EntityDoesNotExist(*eid));
                }
                check_value(*attr, value)?;
                if let Value::Ref(target) = value {
                    if !q.exists(*target) {
                        return Err(DbError::EntityDoesNotExist(*target));
                    }
                }
                Ok(Expansion::ops(vec![Op::Assert {
                    eid: *eid,
                    attr: *attr,
                    value: value.clone(),
                }]))
            }
            Self::Remove { eid, attr, value } => {
                if !q.contains(*eid, *attr, value.clone()) {
                    return Ok(Expansion::default());
                }
                if attr.schema().is_required() && q.get_many(*eid, *attr).len() <= 1 {
                    return Err(DbError::validation(format!(
                        "cannot remove the last value of required attribute {} on {eid}",
                        attr_name(q, *attr)
                    )));
                }
                Ok(Expansion::ops(vec![Op::Retract {
                    eid: *eid,
                    attr: *attr,
                    value: value.clone(),
                }]))
            }
            Self::RetractAttribute { eid, attr } => {
                if attr.schema().is_required() {
                    return Err(DbError::validation(format!(
                        "cannot retract required attribute {} on {eid}",
                        attr_name(q, *attr)
                    )));
                }
                let ops = q
                    .get_many(*eid, *attr)
                    .into_iter()
                    .map(|value| Op::Retract {
                        eid: *eid,
                        attr: *attr,
                        value,
                    })
                    .collect();
                Ok(Expansion::ops(ops))
            }
            Self::RetractEntityInPartition { eids, .. } => {
                let doomed = cascade::reachable(q, eids, true);
                Ok(Expansion::ops(cascade::retract_ops(q, &doomed)))
            }
            Self::AtomicComposite { instructions, .. } => {
                let mut expansion = Expansion::default();
                for instruction in instructions {
                    expansion.extend(instruction.expand(q)?);
                }
                Ok(expansion)
            }
            Self::ReifyEntities { entity_type } => {
                let Some(factory) = entity::factory_of(q, *entity_type) else {
                    return Ok(Expansion::default());
                };
                let ops = q
                    .lookup_many(ENTITY_TYPES.attribute(), Value::Ref(*entity_type))
                    .into_iter()
                    .filter(|eid| q.get_one(*eid, ENTITY_OBJECT.attribute()).is_none())
                    .map(|eid| Op::Assert {
                        eid,
                        attr: ENTITY_OBJECT.attribute(),
                        value: Value::Object(factory.create(eid)),
                    })
                    .collect();
                Ok(Expansion::ops(ops))
            }
            Self::Effect(effect) => Ok(Expansion {
                ops: Vec::new(),
                effects: vec![InstructionEffect {
                    origin: self.clone(),
                    effect: Rc::clone(&effect.effect),
                }],
            }),
        }
    }
}

fn expand_create(
    q: &dyn Q,
    eid: Eid,
    entity_type: Eid,
    attributes: &[(Attribute, Value)],
) -> DbResult<Expansion> {
    let info = entity::type_info(q, entity_type)?;
    let mut ops = vec![Op::Assert {
        eid,
        attr: ENTITY_TYPES.attribute(),
        value: Value::Ref(entity_type),
    }];

    let supplies_object = attributes
        .iter()
        .any(|(attr, _)| *attr == ENTITY_OBJECT.attribute());
    if !supplies_object {
        if let Some(factory) = &info.factory {
            ops.push(Op::Assert {
                eid,
                attr: ENTITY_OBJECT.attribute(),
                value: Value::Object(factory.create(eid)),
            });
        }
    }

    for (attr, value) in attributes {
        check_value(*attr, value)?;
        ops.push(Op::Assert {
            eid,
            attr: *attr,
            value: value.clone(),
        });
    }

    for declared in &info.attributes {
        if attributes.iter().any(|(attr, _)| *attr == declared.attribute) {
            continue;
        }
        if let Some(default) = &declared.default {
            ops.push(Op::Assert {
                eid,
                attr: declared.attribute,
                value: default.value(eid),
            });
        } else if declared.attribute.schema().is_required() {
            return Err(DbError::validation(format!(
                "required attribute {} of {} has no value and no default",
                declared.ident, info.ident
            )));
        }
    }

    Ok(Expansion::ops(ops))
}

fn check_value(attr: Attribute, value: &Value) -> DbResult<()> {
    if attr.accepts(value) {
        return Ok(());
    }
    let expected = if attr.schema().is_ref() { "a ref" } else { "a non-ref" };
    Err(DbError::validation(format!(
        "attribute {attr:?} expects {expected} value, got {}",
        value.kind()
    )))
}

fn attr_name(q: &dyn Q, attr: Attribute) -> String {
    entity::attribute_ident(q, attr.eid()).unwrap_or_else(|| format!("{attr:?}"))
}
