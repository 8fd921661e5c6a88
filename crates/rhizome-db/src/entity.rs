//! Self-describing schema.
//!
//! Entity types and attributes are entities themselves, described by three
//! meta types that live at fixed eids in the schema partition:
//!
//! | type              | attributes                                         |
//! |-------------------|----------------------------------------------------|
//! | `EntityType`      | `ident` (unique), `attributes` (many refs), `factory` |
//! | `Entity` (mixin)  | `type` (many refs, indexed), `object`              |
//! | `EntityAttribute` | `ident` (unique), `schema` (required), `default`   |
//!
//! The meta types describe themselves with the same datoms, so the empty
//! snapshot is already a well-formed database.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::context::DbContext;
use crate::eid::{Eid, SCHEMA_PART, Seed, Tx};
use crate::error::{DbError, DbResult};
use crate::index::Index;
use crate::instruction::Instruction;
use crate::query::{Q, QueryExt};
use crate::schema::{Attr, AttrValue, Attribute, Schema};
use crate::value::{ObjectRef, Value};

const fn meta_attr<T: AttrValue>(local: u32, schema: Schema) -> Attr<T> {
    Attr::new(Attribute::new(Eid::new(SCHEMA_PART, local), schema))
}

/// The type of entity types.
pub const ENTITY_TYPE: Eid = Eid::new(SCHEMA_PART, 1);
pub const ENTITY_TYPE_IDENT: Attr<String> = meta_attr(2, Schema::one().unique());
pub const ENTITY_TYPE_ATTRIBUTES: Attr<Eid> = meta_attr(3, Schema::many().reference());
pub const ENTITY_TYPE_FACTORY: Attr<ObjectRef> = meta_attr(4, Schema::one());

/// Mixin carried by every entity.
pub const ENTITY: Eid = Eid::new(SCHEMA_PART, 5);
/// Types an entity is an instance of.
pub const ENTITY_TYPES: Attr<Eid> = meta_attr(6, Schema::many().reference().indexed());
/// In-memory object attached to an entity.
pub const ENTITY_OBJECT: Attr<ObjectRef> = meta_attr(7, Schema::one());

/// The type of attributes.
pub const ENTITY_ATTRIBUTE: Eid = Eid::new(SCHEMA_PART, 8);
pub const ATTRIBUTE_IDENT: Attr<String> = meta_attr(9, Schema::one().unique());
pub const ATTRIBUTE_SCHEMA: Attr<i64> = meta_attr(10, Schema::one().required());
pub const ATTRIBUTE_DEFAULT: Attr<ObjectRef> = meta_attr(11, Schema::one());

const LAST_META_EID: Eid = Eid::new(SCHEMA_PART, 11);

/// Builds the object attached to each new entity of a type.
#[derive(Clone)]
pub struct EntityFactory(Arc<dyn Fn(Eid) -> ObjectRef + Send + Sync>);

impl EntityFactory {
    pub fn new<T: Send + Sync + 'static>(f: impl Fn(Eid) -> T + Send + Sync + 'static) -> Self {
        Self(Arc::new(move |eid| ObjectRef::new(f(eid))))
    }

    #[must_use]
    pub fn create(&self, eid: Eid) -> ObjectRef {
        (self.0)(eid)
    }
}

impl fmt::Debug for EntityFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EntityFactory")
    }
}

/// Provides the value of an attribute left out at creation.
#[derive(Clone)]
pub struct DefaultValue(Arc<dyn Fn(Eid) -> Value + Send + Sync>);

impl DefaultValue {
    pub fn new(f: impl Fn(Eid) -> Value + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// The same value for every entity.
    pub fn constant(value: impl Into<Value>) -> Self {
        let value = value.into();
        Self::new(move |_| value.clone())
    }

    #[must_use]
    pub fn value(&self, eid: Eid) -> Value {
        (self.0)(eid)
    }
}

impl fmt::Debug for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DefaultValue")
    }
}

/// Declaration of one attribute of an entity type.
#[derive(Clone, Debug)]
pub struct AttributeDef {
    pub ident: String,
    pub schema: Schema,
    pub default: Option<DefaultValue>,
}

impl AttributeDef {
    pub fn new(ident: impl Into<String>, schema: Schema) -> Self {
        Self {
            ident: ident.into(),
            schema,
            default: None,
        }
    }

    #[must_use]
    pub fn with_default(mut self, default: DefaultValue) -> Self {
        self.default = Some(default);
        self
    }
}

/// Declaration of an entity type.
#[derive(Clone, Debug)]
pub struct EntityTypeDef {
    pub ident: String,
    pub attributes: Vec<AttributeDef>,
    pub factory: Option<EntityFactory>,
}

impl EntityTypeDef {
    pub fn new(ident: impl Into<String>) -> Self {
        Self {
            ident: ident.into(),
            attributes: Vec::new(),
            factory: None,
        }
    }

    #[must_use]
    pub fn attribute(mut self, attribute: AttributeDef) -> Self {
        self.attributes.push(attribute);
        self
    }

    #[must_use]
    pub fn factory(mut self, factory: EntityFactory) -> Self {
        self.factory = Some(factory);
        self
    }
}

/// What creating an entity needs to know about one attribute of its type.
#[derive(Clone, Debug)]
pub(crate) struct AttributeInfo {
    pub attribute: Attribute,
    pub ident: String,
    pub default: Option<DefaultValue>,
}

#[derive(Clone, Debug)]
pub(crate) struct TypeInfo {
    pub ident: String,
    pub attributes: Vec<AttributeInfo>,
    pub factory: Option<EntityFactory>,
}

/// Attribute handle rebuilt from its schema datoms.
pub fn attribute_by_eid(q: &dyn Q, eid: Eid) -> DbResult<Attribute> {
    let bits = q
        .get(eid, ATTRIBUTE_SCHEMA)
        .ok_or_else(|| DbError::unknown_attribute(eid.to_string()))?;
    Ok(Attribute::new(eid, Schema::from_bits_truncate(bits as u32)))
}

pub fn attribute_by_ident(q: &dyn Q, ident: &str) -> DbResult<Attribute> {
    let eid = q
        .lookup_unique(ATTRIBUTE_IDENT.attribute(), Value::from(ident))
        .ok_or_else(|| DbError::unknown_attribute(ident))?;
    attribute_by_eid(q, eid)
}

pub fn attribute_ident(q: &dyn Q, eid: Eid) -> Option<String> {
    q.get(eid, ATTRIBUTE_IDENT)
}

pub(crate) fn factory_of(q: &dyn Q, entity_type: Eid) -> Option<EntityFactory> {
    q.get(entity_type, ENTITY_TYPE_FACTORY)?
        .downcast_ref::<EntityFactory>()
        .cloned()
}

fn default_of(q: &dyn Q, attr: Eid) -> Option<DefaultValue> {
    q.get(attr, ATTRIBUTE_DEFAULT)?
        .downcast_ref::<DefaultValue>()
        .cloned()
}

pub(crate) fn type_info(q: &dyn Q, entity_type: Eid) -> DbResult<TypeInfo> {
    let ident = q
        .get(entity_type, ENTITY_TYPE_IDENT)
        .ok_or_else(|| DbError::unknown_entity_type(entity_type.to_string()))?;
    let mut attributes = Vec::new();
    for attr in q.get_all(entity_type, ENTITY_TYPE_ATTRIBUTES) {
        attributes.push(AttributeInfo {
            attribute: attribute_by_eid(q, attr)?,
            ident: attribute_ident(q, attr).unwrap_or_else(|| attr.to_string()),
            default: default_of(q, attr),
        });
    }
    attributes.sort_by_key(|a| a.attribute.eid());
    Ok(TypeInfo {
        ident,
        attributes,
        factory: factory_of(q, entity_type),
    })
}

/// Strict read: the entity must exist and hold a value for `attr`.
pub fn get_required(q: &dyn Q, eid: Eid, attr: Attribute) -> DbResult<Value> {
    if !q.exists(eid) {
        return Err(DbError::EntityDoesNotExist(eid));
    }
    q.get_one(eid, attr).ok_or_else(|| {
        let name = attribute_ident(q, attr.eid()).unwrap_or_else(|| attr.eid().to_string());
        DbError::not_initialized(eid, name)
    })
}

/// Handle to a registered entity type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityType {
    eid: Eid,
    ident: Arc<str>,
    attributes: Arc<[(String, Attribute)]>,
}

impl EntityType {
    pub fn load(q: &dyn Q, eid: Eid) -> DbResult<Self> {
        let info = type_info(q, eid)?;
        Ok(Self {
            eid,
            ident: Arc::from(info.ident),
            attributes: info
                .attributes
                .into_iter()
                .map(|a| (a.ident, a.attribute))
                .collect(),
        })
    }

    pub fn by_ident(q: &dyn Q, ident: &str) -> DbResult<Self> {
        let eid = q
            .lookup_unique(ENTITY_TYPE_IDENT.attribute(), Value::from(ident))
            .ok_or_else(|| DbError::unknown_entity_type(ident))?;
        Self::load(q, eid)
    }

    #[must_use]
    pub const fn eid(&self) -> Eid {
        self.eid
    }

    #[must_use]
    pub fn ident(&self) -> &str {
        &self.ident
    }

    /// Attribute by its short (`name`) or qualified (`Person.name`) ident.
    pub fn attr(&self, ident: &str) -> DbResult<Attribute> {
        let qualified = qualify(&self.ident, ident);
        self.attributes
            .iter()
            .find(|(name, _)| *name == ident || *name == qualified)
            .map(|(_, attr)| *attr)
            .ok_or_else(|| DbError::unknown_attribute(qualified))
    }

    /// Every attribute declared by this type.
    pub fn attributes(&self) -> impl Iterator<Item = Attribute> + '_ {
        self.attributes.iter().map(|(_, attr)| *attr)
    }

    /// Create an instance from `(short ident, value)` pairs.
    #[allow(clippy::new_ret_no_self)]
    pub fn new<'a>(
        &self,
        ctx: &DbContext,
        values: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> DbResult<Eid> {
        let attributes = values
            .into_iter()
            .map(|(ident, value)| Ok((self.attr(ident)?, value)))
            .collect::<DbResult<Vec<_>>>()?;
        ctx.new_entity(self.eid, attributes)
    }

    /// Every entity of this type.
    pub fn all(&self, q: &dyn Q) -> Vec<Eid> {
        let mut eids = q.lookup_many(ENTITY_TYPES.attribute(), Value::Ref(self.eid));
        eids.sort();
        eids
    }

    /// The only entity of this type.
    pub fn single(&self, q: &dyn Q) -> DbResult<Eid> {
        match self.all(q).as_slice() {
            [only] => Ok(*only),
            many => Err(DbError::not_single(&*self.ident, many.len())),
        }
    }
}

fn qualify(type_ident: &str, attr_ident: &str) -> String {
    if attr_ident.contains('.') {
        attr_ident.to_owned()
    } else {
        format!("{type_ident}.{attr_ident}")
    }
}

/// Register `def`, or return the type already registered under its ident.
pub fn register(ctx: &DbContext, def: EntityTypeDef) -> DbResult<EntityType> {
    let existing = ctx.read(|q| {
        q.lookup_unique(ENTITY_TYPE_IDENT.attribute(), Value::from(def.ident.as_str()))
    })?;
    if let Some(eid) = existing {
        return attach_factory(ctx, eid, def.factory);
    }

    let m = ctx.mutable()?;
    let seed = Seed::next();
    let mut instructions = Vec::new();
    let mut attribute_refs = Vec::new();
    for attribute in &def.attributes {
        let ident = qualify(&def.ident, &attribute.ident);
        let known = ctx.read(|q| {
            q.lookup_unique(ATTRIBUTE_IDENT.attribute(), Value::from(ident.as_str()))
        })?;
        if let Some(eid) = known {
            attribute_refs.push((ENTITY_TYPE_ATTRIBUTES.attribute(), Value::Ref(eid)));
            continue;
        }
        let eid = m.new_eid(SCHEMA_PART)?;
        let mut values = vec![
            (ATTRIBUTE_IDENT.attribute(), Value::from(ident)),
            (
                ATTRIBUTE_SCHEMA.attribute(),
                Value::Int(i64::from(attribute.schema.bits())),
            ),
        ];
        if let Some(default) = &attribute.default {
            values.push((
                ATTRIBUTE_DEFAULT.attribute(),
                Value::object(default.clone()),
            ));
        }
        instructions.push(Instruction::CreateEntity {
            eid,
            entity_type: ENTITY_ATTRIBUTE,
            attributes: values,
            seed,
        });
        attribute_refs.push((ENTITY_TYPE_ATTRIBUTES.attribute(), Value::Ref(eid)));
    }

    let type_eid = m.new_eid(SCHEMA_PART)?;
    let mut values = vec![(
        ENTITY_TYPE_IDENT.attribute(),
        Value::from(def.ident.as_str()),
    )];
    values.extend(attribute_refs);
    if let Some(factory) = def.factory {
        values.push((ENTITY_TYPE_FACTORY.attribute(), Value::object(factory)));
    }
    instructions.push(Instruction::CreateEntity {
        eid: type_eid,
        entity_type: ENTITY_TYPE,
        attributes: values,
        seed,
    });

    ctx.execute(&Instruction::AtomicComposite { instructions, seed })?;
    debug!(
        ident = %def.ident,
        eid = %type_eid,
        attributes = def.attributes.len(),
        "registered entity type"
    );
    ctx.read(|q| EntityType::load(q, type_eid))?
}

fn attach_factory(
    ctx: &DbContext,
    eid: Eid,
    factory: Option<EntityFactory>,
) -> DbResult<EntityType> {
    let has_factory = ctx.read(|q| factory_of(q, eid).is_some())?;
    if let (Some(factory), false) = (factory, has_factory) {
        ctx.execute(&Instruction::Add {
            eid,
            attr: ENTITY_TYPE_FACTORY.attribute(),
            value: Value::object(factory),
        })?;
        ctx.execute(&Instruction::ReifyEntities { entity_type: eid })?;
        debug!(eid = %eid, "attached factory to registered entity type");
    }
    ctx.read(|q| EntityType::load(q, eid))?
}

/// Write the meta schema into an empty index.
pub(crate) fn bootstrap(index: &mut Index) {
    let meta_types: [(Eid, &str, &[Attribute]); 3] = [
        (
            ENTITY_TYPE,
            "EntityType",
            &[
                ENTITY_TYPE_IDENT.attribute(),
                ENTITY_TYPE_ATTRIBUTES.attribute(),
                ENTITY_TYPE_FACTORY.attribute(),
            ],
        ),
        (
            ENTITY,
            "Entity",
            &[ENTITY_TYPES.attribute(), ENTITY_OBJECT.attribute()],
        ),
        (
            ENTITY_ATTRIBUTE,
            "EntityAttribute",
            &[
                ATTRIBUTE_IDENT.attribute(),
                ATTRIBUTE_SCHEMA.attribute(),
                ATTRIBUTE_DEFAULT.attribute(),
            ],
        ),
    ];
    let idents: [(Attribute, &str); 8] = [
        (ENTITY_TYPE_IDENT.attribute(), "EntityType.ident"),
        (ENTITY_TYPE_ATTRIBUTES.attribute(), "EntityType.attributes"),
        (ENTITY_TYPE_FACTORY.attribute(), "EntityType.factory"),
        (ENTITY_TYPES.attribute(), "Entity.type"),
        (ENTITY_OBJECT.attribute(), "Entity.object"),
        (ATTRIBUTE_IDENT.attribute(), "EntityAttribute.ident"),
        (ATTRIBUTE_SCHEMA.attribute(), "EntityAttribute.schema"),
        (ATTRIBUTE_DEFAULT.attribute(), "EntityAttribute.default"),
    ];

    let tx = Tx::BOOTSTRAP;
    // Every bootstrap eid lives in the schema partition.
    let mut put = |eid: Eid, attr: Attribute, value: Value| {
        index.insert(eid, attr, value, tx).ok();
    };

    for (type_eid, ident, attributes) in meta_types {
        put(type_eid, ENTITY_TYPES.attribute(), Value::Ref(ENTITY_TYPE));
        put(type_eid, ENTITY_TYPE_IDENT.attribute(), Value::from(ident));
        for attr in attributes {
            put(type_eid, ENTITY_TYPE_ATTRIBUTES.attribute(), Value::Ref(attr.eid()));
        }
    }
    for (attr, ident) in idents {
        put(attr.eid(), ENTITY_TYPES.attribute(), Value::Ref(ENTITY_ATTRIBUTE));
        put(attr.eid(), ATTRIBUTE_IDENT.attribute(), Value::from(ident));
        put(
            attr.eid(),
            ATTRIBUTE_SCHEMA.attribute(),
            Value::Int(i64::from(attr.schema().bits())),
        );
    }
    index.reserve(LAST_META_EID).ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bootstrapped() -> Index {
        let mut index = Index::new();
        bootstrap(&mut index);
        index
    }

    #[test]
    fn test_meta_schema_describes_itself() {
        let index = bootstrapped();
        let meta = EntityType::by_ident(&index, "EntityType").unwrap();
        assert_eq!(meta.eid(), ENTITY_TYPE);
        assert_eq!(meta.attr("ident").unwrap(), ENTITY_TYPE_IDENT.attribute());
        assert_eq!(
            meta.all(&index),
            vec![ENTITY_TYPE, ENTITY, ENTITY_ATTRIBUTE]
        );
    }

    #[test]
    fn test_attribute_schema_roundtrips_through_data() {
        let index = bootstrapped();
        assert_eq!(
            attribute_by_ident(&index, "Entity.type").unwrap(),
            ENTITY_TYPES.attribute()
        );
        assert_eq!(
            attribute_by_eid(&index, ATTRIBUTE_SCHEMA.attribute().eid())
                .unwrap()
                .schema(),
            Schema::one().required()
        );
        assert!(matches!(
            attribute_by_ident(&index, "Nope.nothing"),
            Err(DbError::UnknownAttribute { .. })
        ));
    }

    #[test]
    fn test_allocation_skips_meta_eids() {
        let mut index = bootstrapped();
        assert_eq!(index.allocate(SCHEMA_PART).unwrap(), Eid::new(SCHEMA_PART, 12));
    }

    #[test]
    fn test_get_required() {
        let index = bootstrapped();
        assert_eq!(
            get_required(&index, ENTITY_TYPE, ENTITY_TYPE_IDENT.attribute()).unwrap(),
            Value::from("EntityType")
        );
        assert!(matches!(
            get_required(&index, ENTITY_TYPE, ENTITY_OBJECT.attribute()),
            Err(DbError::EntityAttributeIsNotInitialized { .. })
        ));
        assert!(matches!(
            get_required(&index, Eid::new(1, 1), ENTITY_OBJECT.attribute()),
            Err(DbError::EntityDoesNotExist(_))
        ));
    }

    #[test]
    fn test_single_counts() {
        let index = bootstrapped();
        let attribute_type = EntityType::load(&index, ENTITY_ATTRIBUTE).unwrap();
        assert!(matches!(
            attribute_type.single(&index),
            Err(DbError::NotSingle { count: 8, .. })
        ));
    }
}
