use core::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;
use tokio::time::{Instant, sleep};
#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::{
    Allocator, CandidateSource, Error, PoolConfig, PoolDescriptor, PoolStrategy, Result,
    allocator::{expect_kind, kind_mismatch},
    store::{ALLOCATIONS, Document, DocumentStore, InsertOutcome, document},
};

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}

fn record(pool: &str, value: i64) -> Document {
    document(json!({ "pool": pool, "value": value, "acquired_at": unix_millis() }))
}

fn record_key(pool: &str, value: i64) -> Document {
    document(json!({ "pool": pool, "value": value }))
}

impl<S, R> Allocator<S, R>
where
    S: DocumentStore,
    R: CandidateSource,
{
    /// Defines an insert-probe pool over `min..=max`.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self), err))]
    pub async fn initialize_insert_pool(
        &self,
        name: &str,
        min: i64,
        max: i64,
        retry_limit: u32,
    ) -> Result<()> {
        self.bounded(self.create(name, &PoolConfig::insert_probe(min, max, retry_limit)))
            .await
    }

    /// Claims a random free id of insert-probe pool `name`.
    ///
    /// Each attempt draws an independent candidate and tries to insert its
    /// allocation record. A collision moves on to the next attempt.
    ///
    /// # Errors
    ///
    /// - [`Error::RetriesExhausted`] after `retry_limit` collisions. The pool
    ///   may still have free ids.
    /// - [`Error::PoolNotFound`] or [`Error::Configuration`] when `name` is
    ///   not an insert-probe pool.
    /// - [`Error::Store`] as soon as any store call fails.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self), err))]
    pub async fn get_id_from_insert_pool(&self, name: &str) -> Result<i64> {
        self.bounded(async {
            let descriptor = self.load(name).await?;
            match descriptor.strategy {
                PoolStrategy::InsertProbe { retry_limit } => {
                    self.probe_claim(name, descriptor.min, descriptor.max, retry_limit)
                        .await
                }
                _ => Err(kind_mismatch(&descriptor, "insert_probe")),
            }
        })
        .await
    }

    /// Deletes the allocation record of `id`. Unknown ids are ignored.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self), err))]
    pub async fn release_id_to_insert_pool(&self, name: &str, id: i64) -> Result<()> {
        self.bounded(async {
            let descriptor = self.load(name).await?;
            expect_kind(&descriptor, "insert_probe")?;
            self.unclaim(name, id).await.map(|_| ())
        })
        .await
    }

    /// Claims one value in `low..=high` for `pool` with at most
    /// `retry_limit` attempts.
    pub(crate) async fn probe_claim(
        &self,
        pool: &str,
        low: i64,
        high: i64,
        retry_limit: u32,
    ) -> Result<i64> {
        for attempt in 1..=retry_limit {
            let candidate = self.rand.candidate(low, high);
            match self
                .store
                .insert_unique(ALLOCATIONS, &record(pool, candidate))
                .await?
            {
                InsertOutcome::Inserted => return Ok(candidate),
                InsertOutcome::Duplicate => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(pool, candidate, attempt, "candidate taken");
                    if attempt < retry_limit {
                        self.jitter().await;
                    }
                }
            }
        }
        Err(Error::RetriesExhausted {
            pool: pool.to_owned(),
            attempts: retry_limit,
        })
    }

    /// Claims `n` values one by one, each claim bounded by `deadline`. If any
    /// claim fails or the deadline passes, the values claimed so far are
    /// released before the error is returned.
    ///
    /// The release runs past the deadline. A claim cut off in flight may
    /// still land in the store; that single record is left behind.
    pub(crate) async fn probe_claim_many(
        &self,
        descriptor: &PoolDescriptor,
        retry_limit: u32,
        n: usize,
        deadline: Option<Instant>,
    ) -> Result<Vec<i64>> {
        let mut claimed = Vec::with_capacity(n);
        for _ in 0..n {
            let claim =
                self.probe_claim(&descriptor.name, descriptor.min, descriptor.max, retry_limit);
            match self.until(deadline, claim).await {
                Ok(value) => claimed.push(value),
                Err(err) => {
                    // A failed rollback leaves claims behind; report that
                    // instead of the first failure.
                    for value in &claimed {
                        self.unclaim(&descriptor.name, *value).await?;
                    }
                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        pool = %descriptor.name,
                        rolled_back = claimed.len(),
                        "bulk allocation failed"
                    );
                    return Err(err);
                }
            }
        }
        claimed.sort_unstable();
        Ok(claimed)
    }

    /// Deletes the allocation record of `value`; `false` if there was none.
    pub(crate) async fn unclaim(&self, pool: &str, value: i64) -> Result<bool> {
        Ok(self
            .store
            .delete_one(ALLOCATIONS, &record_key(pool, value))
            .await?)
    }

    async fn jitter(&self) {
        let Some(max) = self.config.probe_jitter else {
            return;
        };
        let ceiling = i64::try_from(max.as_micros()).unwrap_or(i64::MAX);
        if ceiling > 0 {
            let micros = self.rand.candidate(0, ceiling);
            sleep(Duration::from_micros(micros.unsigned_abs())).await;
        }
    }
}
