//! Entity identifiers, partitions and transaction markers.
//!
//! An [`Eid`] is a 32-bit integer whose top 4 bits name the partition the
//! entity lives in. Partitions are coarse shards of the id space: they can be
//! selected, copied and merged independently, and partition 0 is reserved for
//! schema entities.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{DbError, DbResult};

/// Partition number stored in the top bits of an [`Eid`].
pub type Part = u8;

/// Partition holding entity types and attributes.
pub const SCHEMA_PART: Part = 0;

/// Default partition for user entities.
pub const COMMON_PART: Part = 1;

/// Highest valid partition.
pub const MAX_PART: Part = 4;

/// Number of partitions every index carries.
pub const PARTITION_COUNT: usize = MAX_PART as usize + 1;

const PART_SHIFT: u32 = 28;
const LOCAL_MASK: u32 = (1 << PART_SHIFT) - 1;

/// Highest partition-local number an allocation may hand out.
pub const MAX_LOCAL: u32 = LOCAL_MASK;

/// Returns `part` if indexes carry it.
pub fn check_part(part: Part) -> DbResult<Part> {
    if part <= MAX_PART {
        Ok(part)
    } else {
        Err(DbError::InvalidPartition(part))
    }
}

/// Entity identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Eid(u32);

impl Eid {
    /// Build an eid from a partition and a partition-local number.
    #[must_use]
    pub const fn new(part: Part, local: u32) -> Self {
        Self(((part as u32) << PART_SHIFT) | (local & LOCAL_MASK))
    }

    /// Create from the raw 32-bit value.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw 32-bit value.
    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// The partition this entity lives in.
    #[must_use]
    pub const fn part(self) -> Part {
        partition(self)
    }

    /// The id without its partition bits.
    #[must_use]
    pub const fn local(self) -> u32 {
        self.0 & LOCAL_MASK
    }
}

impl fmt::Debug for Eid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Eid({}:{})", self.part(), self.local())
    }
}

impl fmt::Display for Eid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.part(), self.local())
    }
}

/// Partition of an entity.
#[must_use]
pub const fn partition(eid: Eid) -> Part {
    (eid.0 >> PART_SHIFT) as Part
}

/// Move an entity id into another partition, keeping its local bits.
#[must_use]
pub const fn with_part(eid: Eid, part: Part) -> Eid {
    Eid::new(part, eid.0)
}

/// Transaction marker stamped on every datom.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Tx(u64);

static NEXT_TX: AtomicU64 = AtomicU64::new(1);

impl Tx {
    /// Marker for the facts of the bootstrap schema.
    pub const BOOTSTRAP: Tx = Tx(0);

    /// Allocate a fresh transaction marker.
    pub fn next() -> Self {
        Self(NEXT_TX.fetch_add(1, Ordering::Relaxed))
    }

    /// Create from a raw value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw value.
    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Tx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx{}", self.0)
    }
}

/// Correlates the instructions of one logical operation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Seed(u64);

static NEXT_SEED: AtomicU64 = AtomicU64::new(1);

impl Seed {
    /// Allocate a fresh seed.
    pub fn next() -> Self {
        Self(NEXT_SEED.fetch_add(1, Ordering::Relaxed))
    }

    /// Create from a raw value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw value.
    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}
