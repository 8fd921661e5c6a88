//! Integration tests for cascading deletes.

mod common;

use common::{Fixture, setup};
use rhizome_db::prelude::*;

/// Document `a` owns part `b` through a cascading attribute; note `c`
/// requires `b`.
fn document_part_note(fx: &Fixture) -> (Db, Eid, Eid, Eid) {
    let change = fx
        .db
        .change(COMMON_PART, |ctx| {
            let b = fx.part.new(ctx, [("text", Value::from("body"))])?;
            let a = fx.document.new(
                ctx,
                [("title", Value::from("doc")), ("parts", Value::Ref(b))],
            )?;
            let c = fx.note.new(ctx, [("part", Value::Ref(b))])?;
            Ok((a, b, c))
        })
        .unwrap();
    let (a, b, c) = change.value;
    (change.db_after, a, b, c)
}

// ============================================================================
// Cascade Rules
// ============================================================================

#[test]
fn test_delete_follows_cascade_and_required_refs() {
    let fx = setup();
    let (db, a, b, c) = document_part_note(&fx);

    let change = db.change(COMMON_PART, |ctx| ctx.delete(a)).unwrap();

    for eid in [a, b, c] {
        assert!(!change.db_after.exists(eid), "{eid} should be gone");
    }
    assert!(change.novelty.assertions().next().is_none());
    assert!(fx.note.all(&change.db_after).is_empty());
}

#[test]
fn test_delete_of_owned_entity_keeps_owner() {
    let fx = setup();
    let (db, a, b, c) = document_part_note(&fx);

    let change = db.change(COMMON_PART, |ctx| ctx.delete(b)).unwrap();
    let after = &change.db_after;

    assert!(after.exists(a));
    assert!(!after.exists(b));
    assert!(!after.exists(c));
    assert!(after.get_many(a, fx.parts()).is_empty());
    assert!(after.refs_to(b).is_empty());
}

#[test]
fn test_delete_retracts_plain_references() {
    let fx = setup();
    let friend = Fixture::attr(&fx.person, "friend");

    let change = fx
        .db
        .change(COMMON_PART, |ctx| {
            let ada = fx.person.new(ctx, [("name", Value::from("Ada"))])?;
            let bob = fx.person.new(
                ctx,
                [("name", Value::from("Bob")), ("friend", Value::Ref(ada))],
            )?;
            ctx.delete(ada)?;
            Ok((ada, bob))
        })
        .unwrap();

    let (ada, bob) = change.value;
    assert!(!change.db_after.exists(ada));
    assert!(change.db_after.exists(bob));
    assert_eq!(change.db_after.get_one(bob, friend), None);
}

#[test]
fn test_delete_missing_entity_fails() {
    let fx = setup();
    let ghost = Eid::new(COMMON_PART, 4_242);
    let result = fx.db.change(COMMON_PART, |ctx| ctx.delete(ghost));
    assert!(matches!(result, Err(DbError::EntityDoesNotExist(e)) if e == ghost));
}

#[test]
fn test_cascade_cycle_terminates() {
    let fx = setup();
    let parts = fx.parts();

    // Two documents that own each other.
    let change = fx
        .db
        .change(COMMON_PART, |ctx| {
            let x = fx.document.new(ctx, [("title", Value::from("x"))])?;
            let y = fx.document.new(
                ctx,
                [("title", Value::from("y")), ("parts", Value::Ref(x))],
            )?;
            ctx.add(x, parts, Value::Ref(y))?;
            ctx.delete(x)?;
            Ok((x, y))
        })
        .unwrap();

    let (x, y) = change.value;
    assert!(!change.db_after.exists(x));
    assert!(!change.db_after.exists(y));
}

// ============================================================================
// Partitions
// ============================================================================

#[test]
fn test_cross_partition_delete_is_one_composite() {
    let fx = setup();

    let setup_change = fx
        .db
        .change(COMMON_PART, |ctx| {
            let p2 = ctx.with_default_part(2, |ctx| {
                fx.part.new(ctx, [("text", Value::from("two"))])
            })?;
            let p3 = ctx.with_default_part(3, |ctx| {
                fx.part.new(ctx, [("text", Value::from("three"))])
            })?;
            let doc = fx.document.new(
                ctx,
                [
                    ("title", Value::from("spread")),
                    ("parts", Value::Ref(p2)),
                    ("parts", Value::Ref(p3)),
                ],
            )?;
            Ok((doc, p2, p3))
        })
        .unwrap();
    let (doc, p2, p3) = setup_change.value;

    let change = setup_change
        .db_after
        .change(COMMON_PART, |ctx| {
            let (_, instructions) = ctx.collecting_instructions(|ctx| ctx.delete(doc))?;
            Ok(instructions)
        })
        .unwrap();

    let [Instruction::AtomicComposite { instructions, seed }] = change.value.as_slice() else {
        panic!("expected a single composite, got {:?}", change.value);
    };
    assert_eq!(instructions.len(), 3);
    for child in instructions {
        assert!(matches!(child, Instruction::RetractEntityInPartition { .. }));
        assert_eq!(child.seed(), Some(*seed));
    }
    for eid in [doc, p2, p3] {
        assert!(!change.db_after.exists(eid));
    }
}

#[test]
fn test_retract_in_partition_stays_in_partition() {
    let fx = setup();

    let setup_change = fx
        .db
        .change(COMMON_PART, |ctx| {
            let far = ctx.with_default_part(2, |ctx| {
                fx.part.new(ctx, [("text", Value::from("far"))])
            })?;
            let doc = fx.document.new(
                ctx,
                [("title", Value::from("near")), ("parts", Value::Ref(far))],
            )?;
            Ok((doc, far))
        })
        .unwrap();
    let (doc, far) = setup_change.value;

    let change = setup_change
        .db_after
        .change(COMMON_PART, |ctx| {
            ctx.execute(&Instruction::RetractEntityInPartition {
                eids: vec![doc],
                seed: rhizome_db::Seed::next(),
            })
        })
        .unwrap();

    assert!(!change.db_after.exists(doc));
    assert!(change.db_after.exists(far));
}
