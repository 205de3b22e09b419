use core::{future::Future, time::Duration};

use tokio::time::{Instant, sleep, timeout_at};

use crate::store::{StoreError, StoreResult};

/// How long to keep trying to reach the store at startup.
///
/// The defaults poll every 2 seconds and give up after 3 minutes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectPolicy {
    /// Pause between two connection attempts.
    pub poll_interval: Duration,
    /// Overall budget, measured from the first attempt.
    pub deadline: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            deadline: Duration::from_secs(180),
        }
    }
}

/// Calls `connect` until it yields a store handle or the policy's deadline
/// passes.
///
/// The handle is returned to the caller, who owns it and passes it to an
/// [`Allocator`](crate::Allocator). Nothing is kept in global state.
///
/// # Errors
///
/// [`StoreError::Unavailable`] naming the number of attempts and the last
/// failure once another attempt would start past the deadline. An attempt
/// still pending at the deadline is abandoned.
pub async fn connect_with_retry<S, F, Fut>(policy: ConnectPolicy, mut connect: F) -> StoreResult<S>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<S>>,
{
    let started = Instant::now();
    let give_up_at = started + policy.deadline;
    let mut attempts: u32 = 0;

    loop {
        attempts = attempts.saturating_add(1);
        let last = match timeout_at(give_up_at, connect()).await {
            Ok(Ok(store)) => {
                #[cfg(feature = "tracing")]
                tracing::info!(attempts, "connected to store");
                return Ok(store);
            }
            Ok(Err(err)) => err,
            Err(_) => {
                return Err(StoreError::Unavailable {
                    context: format!(
                        "gave up after {attempts} attempts: attempt still pending after {:?}",
                        policy.deadline
                    ),
                });
            }
        };

        if started.elapsed() + policy.poll_interval >= policy.deadline {
            return Err(StoreError::Unavailable {
                context: format!("gave up after {attempts} attempts: {last}"),
            });
        }

        #[cfg(feature = "tracing")]
        tracing::warn!(attempts, error = %last, "store not reachable yet, retrying");
        sleep(policy.poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use portable_atomic::{AtomicU32, Ordering};

    fn down() -> StoreError {
        StoreError::Unavailable {
            context: "connection refused".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_the_store_answers() {
        let calls = AtomicU32::new(0);
        let store = connect_with_retry(ConnectPolicy::default(), || {
            let call = calls.fetch_add(1, Ordering::Relaxed);
            async move {
                if call < 3 {
                    Err(down())
                } else {
                    Ok(MemoryStore::new())
                }
            }
        })
        .await;

        assert!(store.is_ok());
        assert_eq!(calls.load(Ordering::Relaxed), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_at_the_deadline() {
        let policy = ConnectPolicy {
            poll_interval: Duration::from_secs(2),
            deadline: Duration::from_secs(10),
        };
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let err = connect_with_retry::<MemoryStore, _, _>(policy, || {
            calls.fetch_add(1, Ordering::Relaxed);
            async { Err(down()) }
        })
        .await
        .unwrap_err();

        // Attempts at t = 0, 2, 4, 6, 8; a sixth would start at t = 10.
        assert_eq!(calls.load(Ordering::Relaxed), 5);
        assert!(started.elapsed() <= policy.deadline);
        match err {
            StoreError::Unavailable { context } => {
                assert!(context.starts_with("gave up after 5 attempts"));
                assert!(context.contains("connection refused"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn a_hanging_attempt_is_cut_off_at_the_deadline() {
        let policy = ConnectPolicy {
            poll_interval: Duration::from_secs(2),
            deadline: Duration::from_secs(10),
        };
        let started = Instant::now();

        let err = connect_with_retry::<MemoryStore, _, _>(policy, || {
            core::future::pending::<StoreResult<MemoryStore>>()
        })
        .await
        .unwrap_err();

        let elapsed = started.elapsed();
        assert!(elapsed >= policy.deadline && elapsed < policy.deadline + policy.poll_interval);
        match err {
            StoreError::Unavailable { context } => {
                assert!(context.starts_with("gave up after 1 attempts"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
