//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use rhizome_db::entity::DefaultValue;
use rhizome_db::prelude::*;
use rhizome_db::DbConfig;
use tracing_subscriber::EnvFilter;

/// Install a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A snapshot with a small schema registered:
///
/// ```text
/// Person   name (required, indexed), email (unique), tags (many), friend (ref)
/// Document title, parts (many, cascade delete)
/// Part     text, weight (required, defaults to 1)
/// Note     part (required ref), text
/// ```
pub struct Fixture {
    pub db: Db,
    pub person: EntityType,
    pub document: EntityType,
    pub part: EntityType,
    pub note: EntityType,
}

impl Fixture {
    /// # Panics
    /// If `ty` does not declare `ident`.
    pub fn attr(ty: &EntityType, ident: &str) -> Attribute {
        ty.attr(ident).expect("attribute is registered")
    }

    pub fn name(&self) -> Attribute {
        Self::attr(&self.person, "name")
    }

    pub fn email(&self) -> Attribute {
        Self::attr(&self.person, "email")
    }

    pub fn tags(&self) -> Attribute {
        Self::attr(&self.person, "tags")
    }

    pub fn parts(&self) -> Attribute {
        Self::attr(&self.document, "parts")
    }
}

/// # Panics
/// If registration fails.
pub fn setup() -> Fixture {
    setup_with(DbConfig::default())
}

/// # Panics
/// If registration fails.
pub fn setup_with(config: DbConfig) -> Fixture {
    init_tracing();
    let change = Db::with_config(config)
        .change(COMMON_PART, |ctx| {
            let person = ctx.register(
                EntityTypeDef::new("Person")
                    .attribute(AttributeDef::new("name", Schema::one().required().indexed()))
                    .attribute(AttributeDef::new("email", Schema::one().unique()))
                    .attribute(AttributeDef::new("tags", Schema::many()))
                    .attribute(AttributeDef::new("friend", Schema::one().reference())),
            )?;
            let document = ctx.register(
                EntityTypeDef::new("Document")
                    .attribute(AttributeDef::new("title", Schema::one()))
                    .attribute(AttributeDef::new("parts", Schema::many().cascade_delete())),
            )?;
            let part = ctx.register(
                EntityTypeDef::new("Part")
                    .attribute(AttributeDef::new("text", Schema::one()))
                    .attribute(
                        AttributeDef::new("weight", Schema::one().required())
                            .with_default(DefaultValue::constant(1i64)),
                    ),
            )?;
            let note = ctx.register(
                EntityTypeDef::new("Note")
                    .attribute(AttributeDef::new("part", Schema::one().reference().required()))
                    .attribute(AttributeDef::new("text", Schema::one())),
            )?;
            Ok((person, document, part, note))
        })
        .expect("schema registers");

    let (person, document, part, note) = change.value;
    Fixture {
        db: change.db_after,
        person,
        document,
        part,
        note,
    }
}
