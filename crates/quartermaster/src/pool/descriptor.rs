use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// How a pool hands out its values.
///
/// Stored as a tagged object (`{"kind": "insert_probe", "retry_limit": 5}`),
/// which is also the JSON accepted by the HTTP surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PoolStrategy {
    /// A sorted free set in the pool document; smallest value first.
    Sequential,
    /// Random candidates claimed with a unique insert, up to `retry_limit`
    /// attempts per allocation.
    InsertProbe { retry_limit: u32 },
    /// Fixed-size chunks of the range, claimed like an insert-probe pool over
    /// chunk indices.
    Chunk { retry_limit: u32, chunk_size: u64 },
}

impl PoolStrategy {
    /// The tag used in stored documents and error messages.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::InsertProbe { .. } => "insert_probe",
            Self::Chunk { .. } => "chunk",
        }
    }
}

/// The strategies available to pools that hand out single values, such as
/// IPv4 and integer resource pools.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValueStrategy {
    Sequential,
    InsertProbe { retry_limit: u32 },
}

impl From<ValueStrategy> for PoolStrategy {
    fn from(strategy: ValueStrategy) -> Self {
        match strategy {
            ValueStrategy::Sequential => Self::Sequential,
            ValueStrategy::InsertProbe { retry_limit } => Self::InsertProbe { retry_limit },
        }
    }
}

/// The settings of one pool.
///
/// # Example
/// ```
/// use quartermaster::{PoolConfig, PoolStrategy};
///
/// let config = PoolConfig::chunk(0, 99, 5, 10);
/// assert_eq!(config.strategy, PoolStrategy::Chunk { retry_limit: 5, chunk_size: 10 });
/// assert_eq!(config.chunk_count(), Some(10));
/// assert!(config.validate().is_ok());
///
/// assert!(PoolConfig::sequential(10, 1).validate().is_err());
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Lowest value of the range, inclusive.
    pub min: i64,
    /// Highest value of the range, inclusive.
    pub max: i64,
    pub strategy: PoolStrategy,
}

impl PoolConfig {
    pub const fn sequential(min: i64, max: i64) -> Self {
        Self {
            min,
            max,
            strategy: PoolStrategy::Sequential,
        }
    }

    pub const fn insert_probe(min: i64, max: i64, retry_limit: u32) -> Self {
        Self {
            min,
            max,
            strategy: PoolStrategy::InsertProbe { retry_limit },
        }
    }

    pub const fn chunk(min: i64, max: i64, retry_limit: u32, chunk_size: u64) -> Self {
        Self {
            min,
            max,
            strategy: PoolStrategy::Chunk {
                retry_limit,
                chunk_size,
            },
        }
    }

    /// Number of values in `min..=max`, or zero when the bounds are inverted.
    pub fn len(&self) -> u128 {
        range_len(self.min, self.max)
    }

    /// Returns `true` when the bounds are inverted.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// For chunk pools, the number of chunks the range splits into. The last
    /// chunk may be shorter than `chunk_size`.
    pub fn chunk_count(&self) -> Option<u64> {
        match self.strategy {
            PoolStrategy::Chunk { chunk_size, .. } if chunk_size > 0 => {
                u64::try_from(self.len().div_ceil(u128::from(chunk_size))).ok()
            }
            _ => None,
        }
    }

    /// Checks the invariants every pool must satisfy.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] when `min > max`, the range holds more than
    /// `i64::MAX` values, or the retry budget or chunk size is zero.
    pub fn validate(&self) -> Result<()> {
        if self.min > self.max {
            return Err(Error::configuration(format!(
                "min ({}) must not exceed max ({})",
                self.min, self.max
            )));
        }
        if self.len() > i64::MAX as u128 {
            return Err(Error::configuration(format!(
                "range {}..={} holds more than {} values",
                self.min,
                self.max,
                i64::MAX
            )));
        }
        match self.strategy {
            PoolStrategy::Sequential => {}
            PoolStrategy::InsertProbe { retry_limit } => check_retry_limit(retry_limit)?,
            PoolStrategy::Chunk {
                retry_limit,
                chunk_size,
            } => {
                check_retry_limit(retry_limit)?;
                if chunk_size == 0 {
                    return Err(Error::configuration("chunk_size must be positive"));
                }
            }
        }
        Ok(())
    }
}

fn check_retry_limit(retry_limit: u32) -> Result<()> {
    if retry_limit == 0 {
        return Err(Error::configuration("retry_limit must be positive"));
    }
    Ok(())
}

pub(crate) fn range_len(min: i64, max: i64) -> u128 {
    if min > max {
        0
    } else {
        (i128::from(max) - i128::from(min) + 1) as u128
    }
}

/// A pool as recorded in the `pools` collection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolDescriptor {
    #[serde(rename = "_id")]
    pub name: String,
    pub min: i64,
    pub max: i64,
    pub strategy: PoolStrategy,
}

impl PoolDescriptor {
    pub fn new(name: impl Into<String>, config: &PoolConfig) -> Self {
        Self {
            name: name.into(),
            min: config.min,
            max: config.max,
            strategy: config.strategy,
        }
    }

    pub const fn config(&self) -> PoolConfig {
        PoolConfig {
            min: self.min,
            max: self.max,
            strategy: self.strategy,
        }
    }

    pub const fn contains(&self, value: i64) -> bool {
        self.min <= value && value <= self.max
    }
}
