//! The document store seam.
//!
//! Pool state never lives in process memory. Every pool, allocation record
//! and counter is a document in one of three collections, and every mutation
//! that affects uniqueness is a single atomic operation of a
//! [`DocumentStore`].
//!
//! - [`MemoryStore`] keeps the collections in process and serialises its own
//!   operations. Clones share state, so several allocators over clones of one
//!   store behave like several service instances over one database.
//! - `MongoStore` (feature `mongodb`) maps the same operations onto MongoDB
//!   single-document updates.

mod connect;
mod error;
mod interface;
mod memory;
#[cfg(feature = "mongodb")]
mod mongo;

pub use connect::*;
pub use error::*;
pub use interface::*;
pub use memory::*;
#[cfg_attr(docsrs, doc(cfg(feature = "mongodb")))]
#[cfg(feature = "mongodb")]
pub use mongo::*;

use serde_json::Value;

/// A stored document, or a filter selecting one by field equality.
pub type Document = serde_json::Map<String, Value>;

/// Pool descriptors, one per pool; sequential pools also carry their free set.
pub const POOLS: &str = "pools";

/// Allocation records of probe and chunk pools, unique on `(pool, value)`.
pub const ALLOCATIONS: &str = "allocations";

/// Identity counters, one per counter name.
pub const COUNTERS: &str = "counters";

/// Converts a `json!` object literal into a [`Document`].
///
/// Anything other than an object yields an empty document.
pub(crate) fn document(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}
