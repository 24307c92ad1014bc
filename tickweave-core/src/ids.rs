//! Type-safe identifiers.
//!
//! Newtypes over `u64` so ids never get mixed up at compile time. Ids are
//! handed out sequentially, never randomly, so two runs from the same state
//! produce the same ids in the same order.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to define a newtype ID wrapper around a sequential u64
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw value
            #[inline]
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            /// Get the raw value
            #[inline]
            pub const fn raw(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", $prefix, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let s = s.strip_prefix($prefix).unwrap_or(s);
                Ok(Self(s.parse()?))
            }
        }
    };
}

define_id!(
    /// Unique identifier for a simulated entity
    EntityId,
    "e"
);

define_id!(
    /// Unique identifier for a faction
    FactionId,
    "f"
);

define_id!(
    /// Unique identifier for a monitored resource
    ResourceId,
    "r"
);

define_id!(
    /// Unique identifier for a narrative request
    RequestId,
    "q"
);

/// Hands out ids in strictly increasing order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdAllocator {
    next: u64,
}

impl IdAllocator {
    /// Take the next raw id.
    pub fn allocate(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }

    /// Peek at the next raw id without consuming it.
    pub fn peek(&self) -> u64 {
        self.next
    }
}
