//! Domain identifiers (strongly-typed IDs).
//!
//! Two families share the phantom-marker trick:
//! - [`Seq<T>`]: monotonically increasing `u64` counters (`DeliveryId`, `SequenceNr`).
//!   Ordering matters for these, and the ledger replays them in order.
//! - [`Id<T>`]: ULID-backed opaque identifiers (`RequesterId`). They are minted
//!   without coordination and only need to be unique.
//!
//! `T` is a zero-sized marker, so a `DeliveryId` can never be passed where a
//! `SequenceNr` is expected even though both are a `u64` underneath.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// Marker trait providing the display prefix of an identifier family.
pub trait IdMarker: Send + Sync + 'static {
    /// Prefix used by `Display` (e.g. `"delivery-"`).
    fn prefix() -> &'static str;
}

/// Counter-backed identifier.
///
/// Serialized as the bare integer so ledger lines stay readable.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Seq<T: IdMarker> {
    value: u64,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Seq<T> {
    pub const fn new(value: u64) -> Self {
        Self {
            value,
            _marker: PhantomData,
        }
    }

    /// The first value handed out by a fresh counter.
    pub const fn first() -> Self {
        Self::new(1)
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    /// Successor of this value.
    pub fn next(&self) -> Self {
        Self::new(self.value + 1)
    }
}

impl<T: IdMarker> fmt::Display for Seq<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.value)
    }
}

/// ULID-backed identifier.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

// ========================================
// Markers
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Delivery {}

impl IdMarker for Delivery {
    fn prefix() -> &'static str {
        "delivery-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Sequence {}

impl IdMarker for Sequence {
    fn prefix() -> &'static str {
        "seq-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Requester {}

impl IdMarker for Requester {
    fn prefix() -> &'static str {
        "requester-"
    }
}

// ========================================
// Aliases
// ========================================

/// Identifier of one logical submission. Redelivery reuses it.
pub type DeliveryId = Seq<Delivery>;

/// Position of an entry in the delivery ledger.
pub type SequenceNr = Seq<Sequence>;

/// Reference to whoever submitted a task and awaits its response.
pub type RequesterId = Id<Requester>;
