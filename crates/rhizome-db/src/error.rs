//! Database error types.

use std::sync::Arc;

use thiserror::Error;

use crate::eid::{Eid, Part};

/// Errors raised by reads, instruction expansion and mutation.
///
/// None of these are recoverable inside the transaction that raised them:
/// `Db::change` returns the error and publishes nothing.
#[derive(Debug, Clone, Error)]
pub enum DbError {
    /// A read was attempted with no context bound on this thread.
    #[error("no database context is bound")]
    OutOfDbContext,

    /// A write was attempted through a read-only context.
    #[error("the bound database context is read-only")]
    OutOfMutableDbContext,

    /// The entity has no facts in the current view.
    #[error("entity does not exist: {0:?}")]
    EntityDoesNotExist(Eid),

    /// No entity type is registered under this ident or eid.
    #[error("unknown entity type: {name}")]
    UnknownEntityType { name: String },

    /// No attribute is registered under this ident.
    #[error("unknown attribute: {name}")]
    UnknownAttribute { name: String },

    /// A schema constraint rejected the write.
    #[error("transaction validation failed: {message}")]
    TxValidation { message: String },

    /// A strict read found no value for an attribute of an existing entity.
    #[error("attribute {attr} is not initialized on {eid:?}")]
    EntityAttributeIsNotInitialized { eid: Eid, attr: String },

    /// `EntityType::single` found zero or several entities.
    #[error("expected a single entity of type {entity_type}, found {count}")]
    NotSingle { entity_type: String, count: usize },

    /// The context was used after its transaction ended.
    #[error("database context is poisoned: {0}")]
    Poisoned(Arc<DbError>),

    /// The partition number is above `MAX_PART`.
    #[error("partition {0} is out of range")]
    InvalidPartition(Part),

    /// Every local id of the partition has been handed out.
    #[error("partition {0} has no free entity ids left")]
    PartitionExhausted(Part),

    /// The transaction this handle belonged to has already finished.
    #[error("transaction is closed")]
    TransactionClosed,
}

impl DbError {
    pub fn unknown_entity_type(name: impl Into<String>) -> Self {
        Self::UnknownEntityType { name: name.into() }
    }

    pub fn unknown_attribute(name: impl Into<String>) -> Self {
        Self::UnknownAttribute { name: name.into() }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::TxValidation {
            message: message.into(),
        }
    }

    pub fn not_initialized(eid: Eid, attr: impl Into<String>) -> Self {
        Self::EntityAttributeIsNotInitialized {
            eid,
            attr: attr.into(),
        }
    }

    pub fn not_single(entity_type: impl Into<String>, count: usize) -> Self {
        Self::NotSingle {
            entity_type: entity_type.into(),
            count,
        }
    }

    /// Returns the original cause if this error came from a poisoned context.
    #[must_use]
    pub fn poison_cause(&self) -> Option<&DbError> {
        match self {
            Self::Poisoned(cause) => Some(cause),
            _ => None,
        }
    }
}

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;
