//! The datom, the atomic fact.

use std::fmt;

use crate::eid::{Eid, Tx};
use crate::schema::Attribute;
use crate::value::Value;

/// `(eid, attr, value, tx, added)`.
///
/// `added = true` is an assertion, `false` a retraction. A retraction carries
/// the tx of the fact it retracts, so retracting a fact asserted earlier in
/// the same transaction names exactly that assertion.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Datom {
    pub eid: Eid,
    pub attr: Attribute,
    pub value: Value,
    pub tx: Tx,
    pub added: bool,
}

impl Datom {
    #[must_use]
    pub const fn assertion(eid: Eid, attr: Attribute, value: Value, tx: Tx) -> Self {
        Self {
            eid,
            attr,
            value,
            tx,
            added: true,
        }
    }

    #[must_use]
    pub const fn retraction(eid: Eid, attr: Attribute, value: Value, tx: Tx) -> Self {
        Self {
            eid,
            attr,
            value,
            tx,
            added: false,
        }
    }

    /// Same fact with the opposite direction.
    #[must_use]
    pub fn flipped(&self) -> Self {
        Self {
            added: !self.added,
            ..self.clone()
        }
    }
}

impl fmt::Debug for Datom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} {} {:?} {:?} {:?}]",
            if self.added { "+" } else { "-" },
            self.eid,
            self.attr,
            self.value,
            self.tx
        )
    }
}
