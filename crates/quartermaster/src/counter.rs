use serde_json::{Value, json};
#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::{
    Allocator, CandidateSource, Error, Result,
    store::{COUNTERS, Document, DocumentStore, document},
};

const COUNT: &str = "count";

fn counter_filter(pool: &str) -> Document {
    document(json!({ "_id": pool }))
}

impl<S, R> Allocator<S, R>
where
    S: DocumentStore,
    R: CandidateSource,
{
    /// Returns the next value of counter `pool`: `1` on first use, then
    /// `2`, `3` and so on. Values are never reused.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self), err))]
    pub async fn get_unique_identity(&self, pool: &str) -> Result<i64> {
        self.bounded(async {
            Ok(self
                .store
                .increment(COUNTERS, &counter_filter(pool), COUNT, 1)
                .await?)
        })
        .await
    }

    /// Returns the next value of counter `pool` bounded to `min..=max`,
    /// starting at `min`.
    ///
    /// The bounds are recorded on first use. The counter does not wrap.
    ///
    /// # Errors
    ///
    /// - [`Error::Configuration`] when `min > max`, or when the counter
    ///   exists with other bounds (or none).
    /// - [`Error::PoolExhausted`] once all of `min..=max` was handed out.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self), err))]
    pub async fn get_unique_identity_within_range(
        &self,
        pool: &str,
        min: i64,
        max: i64,
    ) -> Result<i64> {
        if min > max {
            return Err(Error::configuration(format!(
                "min ({min}) must not exceed max ({max})"
            )));
        }
        self.bounded(async {
            let filter = counter_filter(pool);
            let bounds = document(json!({ "min": min, "max": max, "count": 0 }));
            if self
                .store
                .put_one_not_update(COUNTERS, &filter, &bounds)
                .await?
            {
                self.check_bounds(pool, min, max).await?;
            }

            let count = self.store.increment(COUNTERS, &filter, COUNT, 1).await?;
            let value = i128::from(min) + i128::from(count) - 1;
            if value > i128::from(max) {
                return Err(Error::exhausted(pool));
            }
            // `value` lies in `min..=max` here.
            Ok(value as i64)
        })
        .await
    }

    /// Removes counter `pool`. Returns `false` when it did not exist.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self), err))]
    pub async fn delete_counter(&self, pool: &str) -> Result<bool> {
        self.bounded(async {
            Ok(self
                .store
                .delete_one(COUNTERS, &counter_filter(pool))
                .await?)
        })
        .await
    }

    async fn check_bounds(&self, pool: &str, min: i64, max: i64) -> Result<()> {
        let existing = self
            .store
            .get_one(COUNTERS, &counter_filter(pool))
            .await?
            .unwrap_or_default();
        let recorded = (
            existing.get("min").and_then(Value::as_i64),
            existing.get("max").and_then(Value::as_i64),
        );
        match recorded {
            (Some(lo), Some(hi)) if (lo, hi) == (min, max) => Ok(()),
            (Some(lo), Some(hi)) => Err(Error::configuration(format!(
                "counter `{pool}` is bounded to {lo}..={hi}, not {min}..={max}"
            ))),
            _ => Err(Error::configuration(format!(
                "counter `{pool}` exists without bounds"
            ))),
        }
    }
}
