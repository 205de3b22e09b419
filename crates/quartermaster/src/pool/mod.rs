//! Named pools of integer values.
//!
//! A pool is defined once by a [`PoolConfig`] and then allocated from and
//! released to by name. The three strategies differ only in how a free value
//! is found:
//!
//! - `sequential`: the pool document carries the sorted free set; an
//!   allocation atomically removes its head.
//! - `insert_probe`: an allocation is a record in the `allocations`
//!   collection; random candidates are claimed with a unique insert.
//! - `chunk`: an insert-probe pool over chunk indices, each index standing
//!   for a contiguous block of the range.

mod chunk;
mod descriptor;
mod probe;
mod sequential;

pub use chunk::*;
pub use descriptor::*;

pub(crate) use descriptor::range_len;

use serde::{Deserialize, Serialize};

/// The outcome of a generic [`Allocator::allocate`](crate::Allocator::allocate).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Allocation {
    /// A single value, from a sequential or insert-probe pool.
    Id(i64),
    /// A block of values, from a chunk pool.
    Chunk(Chunk),
}

impl Allocation {
    /// The value to pass back to [`Allocator::release`](crate::Allocator::release):
    /// the id itself, or the chunk index.
    pub const fn release_key(&self) -> i64 {
        match self {
            Self::Id(id) => *id,
            Self::Chunk(chunk) => chunk.id,
        }
    }

    pub const fn as_id(&self) -> Option<i64> {
        match self {
            Self::Id(id) => Some(*id),
            Self::Chunk(_) => None,
        }
    }

    pub const fn as_chunk(&self) -> Option<&Chunk> {
        match self {
            Self::Chunk(chunk) => Some(chunk),
            Self::Id(_) => None,
        }
    }
}
