#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::{
    Allocator, CandidateSource, Error, PoolConfig, PoolDescriptor, PoolStrategy, Result,
    ValueStrategy, allocator::kind_mismatch, store::DocumentStore,
};

/// Named integer resources (VLAN ids, tunnel keys, port numbers, ...) backed
/// by a sequential or insert-probe pool.
impl<S, R> Allocator<S, R>
where
    S: DocumentStore,
    R: CandidateSource,
{
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self), err))]
    pub async fn initialize_resource_pool(
        &self,
        name: &str,
        min: i64,
        max: i64,
        strategy: ValueStrategy,
    ) -> Result<()> {
        let config = PoolConfig {
            min,
            max,
            strategy: strategy.into(),
        };
        self.bounded(self.create(name, &config)).await
    }

    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self), err))]
    pub async fn allocate_one(&self, name: &str) -> Result<i64> {
        let values = self.allocate_many(name, 1).await?;
        values.first().copied().ok_or_else(|| Error::exhausted(name))
    }

    /// Allocates `n` distinct values, all or nothing. See
    /// [`ip_address_alloc_many`](Self::ip_address_alloc_many).
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self), err))]
    pub async fn allocate_many(&self, name: &str, n: usize) -> Result<Vec<i64>> {
        let deadline = self.deadline();
        let descriptor = self
            .until(deadline, self.resource_descriptor(name))
            .await?;
        self.allocate_values(&descriptor, n, deadline).await
    }

    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self), err))]
    pub async fn release_one(&self, name: &str, id: i64) -> Result<()> {
        self.bounded(async {
            let descriptor = self.resource_descriptor(name).await?;
            self.release_value(&descriptor, id).await
        })
        .await
    }

    async fn resource_descriptor(&self, name: &str) -> Result<PoolDescriptor> {
        let descriptor = self.load(name).await?;
        match descriptor.strategy {
            PoolStrategy::Chunk { .. } => {
                Err(kind_mismatch(&descriptor, "sequential or insert_probe"))
            }
            _ => Ok(descriptor),
        }
    }
}
