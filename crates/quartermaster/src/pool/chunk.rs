use core::ops::RangeInclusive;

use serde::{Deserialize, Serialize};
#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::{
    Allocator, CandidateSource, PoolConfig, PoolStrategy, Result,
    allocator::{expect_kind, kind_mismatch},
    store::DocumentStore,
};

/// A contiguous block of values claimed from a chunk pool.
///
/// The holder owns every value in `lower..=upper` and can hand them out
/// locally without touching the store. Only the chunk as a whole is tracked.
///
/// ```
/// use quartermaster::Chunk;
///
/// let chunk = Chunk { id: 2, lower: 20, upper: 29 };
/// assert_eq!(chunk.len(), 10);
/// assert!(chunk.contains(25));
/// assert_eq!(chunk.into_iter().take(3).collect::<Vec<_>>(), vec![20, 21, 22]);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Chunk {
    /// Index of the chunk within its pool, starting at zero.
    pub id: i64,
    pub lower: i64,
    pub upper: i64,
}

impl Chunk {
    /// The chunk with index `id` of a pool over `min..=max`.
    pub(crate) fn nth(id: i64, min: i64, max: i64, chunk_size: u64) -> Self {
        // Bounds were validated at initialize time, so the offset stays
        // within `min..=max` for every valid index.
        let offset = i128::from(id) * i128::from(chunk_size);
        let lower = (i128::from(min) + offset) as i64;
        let upper = (i128::from(lower) + i128::from(chunk_size) - 1).min(i128::from(max)) as i64;
        Self { id, lower, upper }
    }

    pub const fn contains(&self, value: i64) -> bool {
        self.lower <= value && value <= self.upper
    }

    /// Number of values in the chunk.
    pub fn len(&self) -> u64 {
        super::range_len(self.lower, self.upper) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.lower > self.upper
    }

    pub fn iter(&self) -> RangeInclusive<i64> {
        self.lower..=self.upper
    }
}

impl IntoIterator for Chunk {
    type Item = i64;
    type IntoIter = RangeInclusive<i64>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl IntoIterator for &Chunk {
    type Item = i64;
    type IntoIter = RangeInclusive<i64>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<S, R> Allocator<S, R>
where
    S: DocumentStore,
    R: CandidateSource,
{
    /// Defines a chunk pool splitting `min..=max` into chunks of
    /// `chunk_size` values.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self), err))]
    pub async fn initialize_chunk_pool(
        &self,
        name: &str,
        min: i64,
        max: i64,
        retry_limit: u32,
        chunk_size: u64,
    ) -> Result<()> {
        let config = PoolConfig::chunk(min, max, retry_limit, chunk_size);
        self.bounded(self.create(name, &config)).await
    }

    /// Claims a random free chunk of pool `name`.
    ///
    /// Fails like [`get_id_from_insert_pool`](Self::get_id_from_insert_pool),
    /// with the retry budget spent over chunk indices.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self), err))]
    pub async fn get_chunk_from_pool(&self, name: &str) -> Result<Chunk> {
        self.bounded(async {
            let descriptor = self.load(name).await?;
            match descriptor.strategy {
                PoolStrategy::Chunk { retry_limit, .. } => {
                    self.claim_chunk(&descriptor, retry_limit).await
                }
                _ => Err(kind_mismatch(&descriptor, "chunk")),
            }
        })
        .await
    }

    /// Returns chunk `chunk_id` to pool `name`. Unclaimed chunks are ignored.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self), err))]
    pub async fn release_chunk_to_pool(&self, name: &str, chunk_id: i64) -> Result<()> {
        self.bounded(async {
            let descriptor = self.load(name).await?;
            expect_kind(&descriptor, "chunk")?;
            self.unclaim(name, chunk_id).await.map(|_| ())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_chunk_is_short() {
        assert_eq!(Chunk::nth(0, 0, 95, 10), Chunk { id: 0, lower: 0, upper: 9 });
        assert_eq!(Chunk::nth(9, 0, 95, 10), Chunk { id: 9, lower: 90, upper: 95 });
        assert_eq!(Chunk::nth(9, 0, 95, 10).len(), 6);
    }

    #[test]
    fn offsets_from_min() {
        let chunk = Chunk::nth(3, 100, 1_000, 25);
        assert_eq!((chunk.lower, chunk.upper), (175, 199));
        assert!(chunk.contains(175) && chunk.contains(199));
        assert!(!chunk.contains(200));
        assert_eq!((&chunk).into_iter().count(), 25);
    }

    #[test]
    fn near_the_top_of_the_domain() {
        let chunk = Chunk::nth(1, i64::MAX - 14, i64::MAX, 10);
        assert_eq!(chunk.lower, i64::MAX - 4);
        assert_eq!(chunk.upper, i64::MAX);
        assert_eq!(chunk.len(), 5);
        assert!(!chunk.is_empty());
    }
}
