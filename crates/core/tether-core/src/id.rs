//! Type-safe identifiers.
//!
//! These newtypes keep interrupt line numbers and event sequence numbers
//! apart from each other and from ordinary counters at compile time.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Interrupt line number.
///
/// Identifies one line on the interrupt dispatcher. Whether a given number is
/// valid depends on how many lines the dispatcher was configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct IrqNumber(u32);

impl IrqNumber {
    /// Creates a new `IrqNumber`.
    pub const fn new(val: u32) -> Self {
        Self(val)
    }

    /// Returns the raw `u32` value.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for IrqNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "irq{}", self.0)
    }
}

impl From<u32> for IrqNumber {
    fn from(val: u32) -> Self {
        Self(val)
    }
}

/// Sequence number stamped on each delivered interrupt event.
///
/// Strictly increasing per dispatcher, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct EventSeq(u64);

impl EventSeq {
    /// Creates a new `EventSeq`.
    pub const fn new(val: u64) -> Self {
        Self(val)
    }

    /// Returns the raw `u64` value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EventSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
