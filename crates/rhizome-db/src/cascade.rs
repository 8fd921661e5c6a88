//! Cascade deletion.
//!
//! Deleting an entity also deletes
//! * entities it points to through a `cascade_delete` attribute, and
//! * entities pointing to it through a `cascade_delete_by` or `required`
//!   attribute,
//!
//! transitively. Every fact of a deleted entity is retracted, together with
//! every reference to it that survives.

use std::collections::BTreeMap;

use tracing::debug;

use crate::FxHashSet;
use crate::eid::{Eid, Part, Seed};
use crate::error::{DbError, DbResult};
use crate::instruction::{Instruction, Op};
use crate::query::{Q, QueryExt};
use crate::value::Value;

/// Entities deleted along with `roots`, roots included, in visit order.
///
/// With `same_partition` the walk never leaves the partitions of the roots.
pub fn reachable(q: &dyn Q, roots: &[Eid], same_partition: bool) -> Vec<Eid> {
    let parts: FxHashSet<Part> = roots.iter().map(|eid| eid.part()).collect();
    let in_scope = |eid: Eid| !same_partition || parts.contains(&eid.part());

    let mut visited = FxHashSet::default();
    let mut order = Vec::new();
    let mut stack: Vec<Eid> = roots.iter().rev().copied().collect();

    while let Some(eid) = stack.pop() {
        if !visited.insert(eid) {
            continue;
        }
        order.push(eid);

        for datom in q.entity(eid).iter() {
            if !datom.attr.schema().is_cascade_delete() {
                continue;
            }
            if let Value::Ref(target) = datom.value {
                if in_scope(target) && !visited.contains(&target) {
                    stack.push(target);
                }
            }
        }

        for datom in q.refs_to(eid).iter() {
            let schema = datom.attr.schema();
            if !(schema.is_cascade_delete_by() || schema.is_required()) {
                continue;
            }
            if in_scope(datom.eid) && !visited.contains(&datom.eid) {
                stack.push(datom.eid);
            }
        }
    }

    order
}

/// Retract every fact of `eids` and every reference to them.
pub fn retract_ops(q: &dyn Q, eids: &[Eid]) -> Vec<Op> {
    let doomed: FxHashSet<Eid> = eids.iter().copied().collect();
    let mut ops = Vec::new();

    for eid in eids {
        ops.extend(q.entity(*eid).iter().map(|d| Op::Retract {
            eid: d.eid,
            attr: d.attr,
            value: d.value.clone(),
        }));
        ops.extend(
            q.refs_to(*eid)
                .iter()
                .filter(|d| !doomed.contains(&d.eid))
                .map(|d| Op::Retract {
                    eid: d.eid,
                    attr: d.attr,
                    value: d.value.clone(),
                }),
        );
    }

    ops
}

/// The instruction that deletes `eid` and everything cascading from it.
///
/// Entities are grouped by partition; more than one partition yields an
/// [`Instruction::AtomicComposite`] so the whole deletion commits at once.
pub fn entities_to_retract(q: &dyn Q, eid: Eid) -> DbResult<Instruction> {
    if !q.exists(eid) {
        return Err(DbError::EntityDoesNotExist(eid));
    }

    let doomed = reachable(q, &[eid], false);
    let mut by_part: BTreeMap<Part, Vec<Eid>> = BTreeMap::new();
    for doomed_eid in &doomed {
        by_part.entry(doomed_eid.part()).or_default().push(*doomed_eid);
    }
    debug!(
        root = %eid,
        entities = doomed.len(),
        partitions = by_part.len(),
        "cascade delete"
    );

    let seed = Seed::next();
    let mut instructions: Vec<Instruction> = by_part
        .into_values()
        .map(|eids| Instruction::RetractEntityInPartition { eids, seed })
        .collect();

    if instructions.len() == 1 {
        if let Some(single) = instructions.pop() {
            return Ok(single);
        }
    }
    Ok(Instruction::AtomicComposite { instructions, seed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datom::Datom;
    use crate::eid::{COMMON_PART, SCHEMA_PART, Tx};
    use crate::index::Index;
    use crate::schema::{Attribute, Schema};

    fn attr(id: u32, schema: Schema) -> Attribute {
        Attribute::new(Eid::new(SCHEMA_PART, 300 + id), schema)
    }

    struct Fixture {
        index: Index,
        name: Attribute,
        child: Attribute,
        owner: Attribute,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                index: Index::new(),
                name: attr(1, Schema::one()),
                child: attr(2, Schema::many().cascade_delete()),
                owner: attr(3, Schema::one().reference().required()),
            }
        }

        fn entity(&mut self, part: Part, label: &str) -> Eid {
            let eid = self.index.allocate(part).unwrap();
            self.index.insert(eid, self.name, label.into(), Tx::from_raw(1)).unwrap();
            eid
        }

        fn link(&mut self, from: Eid, attr: Attribute, to: Eid) {
            self.index.insert(from, attr, Value::Ref(to), Tx::from_raw(1)).unwrap();
        }
    }

    fn sorted(mut eids: Vec<Eid>) -> Vec<Eid> {
        eids.sort();
        eids
    }

    #[test]
    fn test_forward_and_required_edges() {
        // A -cascade-> B, C -required-> B
        let mut f = Fixture::new();
        let a = f.entity(COMMON_PART, "a");
        let b = f.entity(COMMON_PART, "b");
        let c = f.entity(COMMON_PART, "c");
        f.link(a, f.child, b);
        f.link(c, f.owner, b);

        assert_eq!(sorted(reachable(&f.index, &[a], false)), vec![a, b, c]);
        assert_eq!(sorted(reachable(&f.index, &[b], false)), vec![b, c]);
        assert_eq!(reachable(&f.index, &[c], false), vec![c]);
    }

    #[test]
    fn test_cycles_terminate() {
        let mut f = Fixture::new();
        let a = f.entity(COMMON_PART, "a");
        let b = f.entity(COMMON_PART, "b");
        f.link(a, f.child, b);
        f.link(b, f.child, a);
        assert_eq!(sorted(reachable(&f.index, &[a], false)), vec![a, b]);
    }

    #[test]
    fn test_same_partition_stops_at_boundary() {
        let mut f = Fixture::new();
        let a = f.entity(COMMON_PART, "a");
        let remote = f.entity(3, "remote");
        f.link(a, f.child, remote);
        assert_eq!(reachable(&f.index, &[a], true), vec![a]);
        assert_eq!(sorted(reachable(&f.index, &[a], false)), vec![a, remote]);
    }

    #[test]
    fn test_retract_ops_cover_incoming_refs() {
        let mut f = Fixture::new();
        let plain = attr(4, Schema::one().reference());
        let a = f.entity(COMMON_PART, "a");
        let b = f.entity(COMMON_PART, "b");
        f.link(b, plain, a);

        let ops = retract_ops(&f.index, &[a]);
        assert!(ops.contains(&Op::Retract {
            eid: a,
            attr: f.name,
            value: "a".into()
        }));
        assert!(ops.contains(&Op::Retract {
            eid: b,
            attr: plain,
            value: Value::Ref(a)
        }));
        assert_eq!(ops.len(), 2);
    }

    #[test]
    fn test_entities_to_retract_groups_partitions() {
        let mut f = Fixture::new();
        let a = f.entity(COMMON_PART, "a");
        let b = f.entity(2, "b");
        let c = f.entity(3, "c");
        f.link(a, f.child, b);
        f.link(a, f.child, c);

        let Ok(Instruction::AtomicComposite { instructions, seed }) =
            entities_to_retract(&f.index, a)
        else {
            panic!("expected a composite");
        };
        let parts: Vec<Vec<Eid>> = instructions
            .iter()
            .map(|i| match i {
                Instruction::RetractEntityInPartition { eids, seed: s } => {
                    assert_eq!(*s, seed);
                    eids.clone()
                }
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(parts, vec![vec![a], vec![b], vec![c]]);
    }

    #[test]
    fn test_entities_to_retract_single_partition() {
        let mut f = Fixture::new();
        let a = f.entity(COMMON_PART, "a");
        assert!(matches!(
            entities_to_retract(&f.index, a),
            Ok(Instruction::RetractEntityInPartition { .. })
        ));
        assert!(matches!(
            entities_to_retract(&f.index, Eid::new(COMMON_PART, 99)),
            Err(DbError::EntityDoesNotExist(_))
        ));
    }

    #[test]
    fn test_retract_ops_skip_doomed_sources() {
        let mut f = Fixture::new();
        let a = f.entity(COMMON_PART, "a");
        let b = f.entity(COMMON_PART, "b");
        f.link(a, f.child, b);
        let ops = retract_ops(&f.index, &[a, b]);
        let link = Datom::assertion(a, f.child, Value::Ref(b), Tx::from_raw(1));
        let link_retractions = ops
            .iter()
            .filter(|op| {
                **op == Op::Retract {
                    eid: link.eid,
                    attr: link.attr,
                    value: link.value.clone(),
                }
            })
            .count();
        assert_eq!(link_retractions, 1);
    }
}
