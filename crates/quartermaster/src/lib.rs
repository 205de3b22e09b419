#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod allocator;
mod counter;
mod error;
mod ipv4;
mod pool;
mod rand;
mod resource;
pub mod store;
#[cfg(test)]
mod testing;

pub use crate::allocator::*;
pub use crate::error::*;
pub use crate::ipv4::*;
pub use crate::pool::*;
pub use crate::rand::*;
