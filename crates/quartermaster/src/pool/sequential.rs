use serde_json::json;
#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::{
    Allocator, CandidateSource, Error, PoolConfig, PoolDescriptor, Result,
    allocator::expect_kind,
    store::{Document, DocumentStore, InsertSorted, POOLS, TakeOutcome, document},
};

const FREE: &str = "free";

/// Matches pool `name` only while it is a sequential pool.
fn sequential_filter(name: &str) -> Document {
    document(json!({ "_id": name, "strategy": { "kind": "sequential" } }))
}

impl<S, R> Allocator<S, R>
where
    S: DocumentStore,
    R: CandidateSource,
{
    /// Defines a sequential pool over `min..=max` with every value free.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self), err))]
    pub async fn initialize_pool(&self, name: &str, min: i64, max: i64) -> Result<()> {
        self.bounded(self.create(name, &PoolConfig::sequential(min, max)))
            .await
    }

    /// Allocates the smallest free id of sequential pool `name`.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolExhausted`] when every id is allocated.
    /// - [`Error::PoolNotFound`] if the pool does not exist.
    /// - [`Error::Configuration`] if the pool is not sequential.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self), err))]
    pub async fn get_id_from_pool(&self, name: &str) -> Result<i64> {
        self.bounded(self.take_one(name)).await
    }

    /// Returns `id` to sequential pool `name`. Ids outside the pool's range
    /// and ids that are already free are ignored.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self), err))]
    pub async fn release_id_to_pool(&self, name: &str, id: i64) -> Result<()> {
        self.bounded(async {
            let descriptor = self.load(name).await?;
            expect_kind(&descriptor, "sequential")?;
            self.return_id(&descriptor, id).await
        })
        .await
    }

    pub(crate) async fn take_one(&self, name: &str) -> Result<i64> {
        self.take_ids(name, 1)
            .await?
            .first()
            .copied()
            .ok_or_else(|| Error::exhausted(name))
    }

    /// Removes the `n` smallest free ids in one atomic update, or none.
    pub(crate) async fn take_ids(&self, name: &str, n: usize) -> Result<Vec<i64>> {
        match self
            .store
            .take_front(POOLS, &sequential_filter(name), FREE, n)
            .await?
        {
            TakeOutcome::Taken(ids) => Ok(ids),
            TakeOutcome::Insufficient { available } => {
                #[cfg(feature = "tracing")]
                tracing::debug!(pool = name, requested = n, available, "free set too small");
                #[cfg(not(feature = "tracing"))]
                let _ = available;
                Err(Error::exhausted(name))
            }
            TakeOutcome::Missing => Err(self.not_sequential(name).await),
        }
    }

    pub(crate) async fn return_id(&self, descriptor: &PoolDescriptor, id: i64) -> Result<()> {
        if !descriptor.contains(id) {
            #[cfg(feature = "tracing")]
            tracing::debug!(pool = %descriptor.name, id, "ignoring release of out-of-range id");
            return Ok(());
        }
        match self
            .store
            .insert_sorted(POOLS, &sequential_filter(&descriptor.name), FREE, id)
            .await?
        {
            InsertSorted::Inserted | InsertSorted::AlreadyPresent => Ok(()),
            InsertSorted::Missing => Err(Error::not_found(&descriptor.name)),
        }
    }

    /// Explains why the sequential filter matched nothing.
    async fn not_sequential(&self, name: &str) -> Error {
        match self.load(name).await {
            Ok(descriptor) => match expect_kind(&descriptor, "sequential") {
                Err(err) => err,
                // Deleted and recreated between the two calls.
                Ok(()) => Error::not_found(name),
            },
            Err(err) => err,
        }
    }
}
