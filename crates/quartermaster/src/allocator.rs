use core::{future::Future, time::Duration};

use serde_json::{Value, json};
use tokio::time::{Instant, timeout_at};
#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::{
    Allocation, CandidateSource, Chunk, Error, PoolConfig, PoolDescriptor, PoolStrategy, Result,
    ThreadRandom,
    store::{ALLOCATIONS, Document, DocumentStore, POOLS, StoreError, document},
};

/// Default cap on the number of values a sequential pool may hold.
pub const DEFAULT_MAX_FREE_SET_LEN: u64 = 1 << 20;

/// Tunables of an [`Allocator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Deadline applied to every public operation. `None` waits forever.
    pub call_timeout: Option<Duration>,
    /// Upper bound of a random pause between two probe attempts that
    /// collided. `None` retries immediately.
    pub probe_jitter: Option<Duration>,
    /// Largest sequential pool accepted by initialize. The whole free set is
    /// stored in one document, so this bounds the document size.
    pub max_free_set_len: u64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            call_timeout: None,
            probe_jitter: None,
            max_free_set_len: DEFAULT_MAX_FREE_SET_LEN,
        }
    }
}

/// Allocates values from named pools kept in a [`DocumentStore`].
///
/// The allocator holds no pool state of its own: the store handle, the
/// candidate source and its configuration are all it owns. Any number of
/// allocators, in any number of processes, may serve the same pools as long
/// as they share the store.
///
/// Every public operation completes within
/// [`AllocatorConfig::call_timeout`] when one is set, or fails with
/// [`Error::DeadlineExceeded`].
///
/// # Example
/// ```
/// use quartermaster::{Allocation, Allocator, PoolConfig, store::MemoryStore};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> quartermaster::Result<()> {
/// let allocator = Allocator::new(MemoryStore::new());
/// allocator.initialize("vlan", &PoolConfig::sequential(100, 102)).await?;
///
/// assert_eq!(allocator.allocate("vlan").await?, Allocation::Id(100));
/// assert_eq!(allocator.allocate("vlan").await?, Allocation::Id(101));
/// allocator.release("vlan", 100).await?;
/// assert_eq!(allocator.allocate("vlan").await?, Allocation::Id(100));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Allocator<S, R = ThreadRandom> {
    pub(crate) store: S,
    pub(crate) rand: R,
    pub(crate) config: AllocatorConfig,
}

impl<S> Allocator<S>
where
    S: DocumentStore,
{
    /// Creates an allocator with the default configuration, drawing probe
    /// candidates from [`ThreadRandom`].
    pub fn new(store: S) -> Self {
        Self::with_config(store, AllocatorConfig::default())
    }

    pub fn with_config(store: S, config: AllocatorConfig) -> Self {
        Self::with_rand(store, ThreadRandom, config)
    }
}

impl<S, R> Allocator<S, R>
where
    S: DocumentStore,
    R: CandidateSource,
{
    /// Creates an allocator with a custom [`CandidateSource`].
    pub fn with_rand(store: S, rand: R, config: AllocatorConfig) -> Self {
        Self {
            store,
            rand,
            config,
        }
    }

    /// Returns the allocator with every operation bounded by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = Some(timeout);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Runs `op` under the configured call timeout.
    ///
    /// On expiry the in-flight store call (and any retry loop) is dropped.
    pub(crate) async fn bounded<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        self.until(self.deadline(), op).await
    }

    /// The instant by which a call starting now must complete.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.config
            .call_timeout
            .map(|timeout| Instant::now() + timeout)
    }

    /// Runs `op` until `deadline`, dropping it on expiry.
    pub(crate) async fn until<T>(
        &self,
        deadline: Option<Instant>,
        op: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match deadline {
            Some(at) => timeout_at(at, op).await.map_err(|_| Error::DeadlineExceeded {
                timeout: self.config.call_timeout.unwrap_or_default(),
            })?,
            None => op.await,
        }
    }

    /// Defines pool `name`.
    ///
    /// Initializing an existing pool with the identical configuration does
    /// nothing; in particular a sequential pool's free set is not reset. To
    /// start over, [`delete_pool`](Self::delete_pool) first.
    ///
    /// # Errors
    ///
    /// - [`Error::Configuration`] for an invalid configuration, for a
    ///   sequential pool larger than [`AllocatorConfig::max_free_set_len`],
    ///   or when the pool exists with a different configuration.
    /// - [`Error::Store`] when the store fails.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self), err))]
    pub async fn initialize(&self, name: &str, config: &PoolConfig) -> Result<()> {
        self.bounded(self.create(name, config)).await
    }

    /// Allocates one value (or one chunk) from pool `name`.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolNotFound`] if the pool was never initialized.
    /// - [`Error::PoolExhausted`] when a sequential pool has no free value.
    /// - [`Error::RetriesExhausted`] when a probe or chunk pool spent its
    ///   retry budget.
    /// - [`Error::Store`] when the store fails.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self), err))]
    pub async fn allocate(&self, name: &str) -> Result<Allocation> {
        self.bounded(async {
            let descriptor = self.load(name).await?;
            match descriptor.strategy {
                PoolStrategy::Sequential => self.take_one(name).await.map(Allocation::Id),
                PoolStrategy::InsertProbe { retry_limit } => self
                    .probe_claim(name, descriptor.min, descriptor.max, retry_limit)
                    .await
                    .map(Allocation::Id),
                PoolStrategy::Chunk { retry_limit, .. } => self
                    .claim_chunk(&descriptor, retry_limit)
                    .await
                    .map(Allocation::Chunk),
            }
        })
        .await
    }

    /// Returns `value` to pool `name`: an id for sequential and insert-probe
    /// pools, a chunk index for chunk pools.
    ///
    /// Releasing a value that is not allocated does nothing.
    ///
    /// # Errors
    ///
    /// [`Error::PoolNotFound`] if the pool does not exist, or
    /// [`Error::Store`] when the store fails.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self), err))]
    pub async fn release(&self, name: &str, value: i64) -> Result<()> {
        self.bounded(async {
            let descriptor = self.load(name).await?;
            self.release_value(&descriptor, value).await
        })
        .await
    }

    /// Returns the stored definition of pool `name`.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self), err))]
    pub async fn describe_pool(&self, name: &str) -> Result<PoolDescriptor> {
        self.bounded(self.load(name)).await
    }

    /// Removes pool `name` with all of its allocation records.
    ///
    /// The descriptor goes first, so no new allocation can start once this
    /// returns. Returns `false` when the pool did not exist.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self), err))]
    pub async fn delete_pool(&self, name: &str) -> Result<bool> {
        self.bounded(async {
            let existed = self.store.delete_one(POOLS, &pool_filter(name)).await?;
            let records = self
                .store
                .delete_many(ALLOCATIONS, &document(json!({ "pool": name })))
                .await?;
            #[cfg(feature = "tracing")]
            tracing::debug!(existed, records, "pool deleted");
            #[cfg(not(feature = "tracing"))]
            let _ = records;
            Ok(existed)
        })
        .await
    }

    /// Number of free values of sequential pool `name`.
    ///
    /// This is a snapshot for diagnostics; concurrent callers may change it
    /// before the result is used.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self), err))]
    pub async fn free_count(&self, name: &str) -> Result<u64> {
        self.bounded(async {
            let doc = self
                .store
                .get_one(POOLS, &pool_filter(name))
                .await?
                .ok_or_else(|| Error::not_found(name))?;
            let descriptor = parse_descriptor(doc.clone())?;
            expect_kind(&descriptor, "sequential")?;
            let free = doc.get("free").and_then(Value::as_array).map_or(0, Vec::len);
            Ok(free as u64)
        })
        .await
    }

    /// Loads the descriptor of pool `name`.
    pub(crate) async fn load(&self, name: &str) -> Result<PoolDescriptor> {
        let doc = self
            .store
            .get_one(POOLS, &pool_filter(name))
            .await?
            .ok_or_else(|| Error::not_found(name))?;
        parse_descriptor(doc)
    }

    /// Validates `config` and records it under `name` unless a pool of that
    /// name exists already.
    pub(crate) async fn create(&self, name: &str, config: &PoolConfig) -> Result<()> {
        config.validate()?;
        let descriptor = PoolDescriptor::new(name, config);
        let mut data = document(serde_json::to_value(&descriptor).map_err(StoreError::from)?);

        match config.strategy {
            PoolStrategy::Sequential => {
                let len = config.len();
                if len > u128::from(self.config.max_free_set_len) {
                    return Err(Error::configuration(format!(
                        "sequential pool of {len} values exceeds the limit of {}",
                        self.config.max_free_set_len
                    )));
                }
                let free: Vec<Value> = (config.min..=config.max).map(Value::from).collect();
                data.insert("free".to_owned(), Value::Array(free));
            }
            PoolStrategy::InsertProbe { .. } | PoolStrategy::Chunk { .. } => {
                self.store
                    .create_index(ALLOCATIONS, &["pool", "value"])
                    .await?;
            }
        }

        let existed = self
            .store
            .put_one_not_update(POOLS, &pool_filter(name), &data)
            .await?;
        if !existed {
            #[cfg(feature = "tracing")]
            tracing::info!(pool = name, kind = config.strategy.kind(), "pool created");
            return Ok(());
        }

        let current = self.load(name).await?;
        if current.config() == *config {
            Ok(())
        } else {
            Err(Error::configuration(format!(
                "pool `{name}` already exists with {:?}, cannot redefine it as {config:?}",
                current.config()
            )))
        }
    }

    /// Releases `value` to the pool described by `descriptor`.
    pub(crate) async fn release_value(&self, descriptor: &PoolDescriptor, value: i64) -> Result<()> {
        match descriptor.strategy {
            PoolStrategy::Sequential => self.return_id(descriptor, value).await,
            PoolStrategy::InsertProbe { .. } | PoolStrategy::Chunk { .. } => {
                self.unclaim(&descriptor.name, value).await.map(|_| ())
            }
        }
    }

    /// Allocates `n` distinct values from a sequential or insert-probe pool,
    /// all or nothing, finishing by `deadline`.
    ///
    /// A sequential pool takes all `n` in one store call. A probe pool bounds
    /// each claim separately so that an expired deadline still releases the
    /// values already claimed.
    pub(crate) async fn allocate_values(
        &self,
        descriptor: &PoolDescriptor,
        n: usize,
        deadline: Option<Instant>,
    ) -> Result<Vec<i64>> {
        if n == 0 {
            return Err(Error::validation("number of values must be positive"));
        }
        match descriptor.strategy {
            PoolStrategy::Sequential => {
                self.until(deadline, self.take_ids(&descriptor.name, n))
                    .await
            }
            PoolStrategy::InsertProbe { retry_limit } => {
                if n as u128 > descriptor.config().len() {
                    return Err(Error::exhausted(&descriptor.name));
                }
                self.probe_claim_many(descriptor, retry_limit, n, deadline)
                    .await
            }
            PoolStrategy::Chunk { .. } => Err(Error::configuration(format!(
                "pool `{}` hands out chunks, not single values",
                descriptor.name
            ))),
        }
    }

    pub(crate) async fn claim_chunk(
        &self,
        descriptor: &PoolDescriptor,
        retry_limit: u32,
    ) -> Result<Chunk> {
        let config = descriptor.config();
        let (Some(count), PoolStrategy::Chunk { chunk_size, .. }) =
            (config.chunk_count(), config.strategy)
        else {
            return Err(Error::configuration(format!(
                "pool `{}` is not a chunk pool",
                descriptor.name
            )));
        };
        let last = i64::try_from(count - 1)
            .map_err(|_| Error::configuration("chunk count exceeds the id space"))?;
        let id = self.probe_claim(&descriptor.name, 0, last, retry_limit).await?;
        Ok(Chunk::nth(id, descriptor.min, descriptor.max, chunk_size))
    }
}

pub(crate) fn pool_filter(name: &str) -> Document {
    document(json!({ "_id": name }))
}

fn parse_descriptor(doc: Document) -> Result<PoolDescriptor> {
    serde_json::from_value(Value::Object(doc))
        .map_err(StoreError::from)
        .map_err(Error::from)
}

/// Fails with [`Error::Configuration`] unless `descriptor` is of `kind`.
pub(crate) fn expect_kind(descriptor: &PoolDescriptor, kind: &str) -> Result<()> {
    if descriptor.strategy.kind() == kind {
        Ok(())
    } else {
        Err(kind_mismatch(descriptor, kind))
    }
}

pub(crate) fn kind_mismatch(descriptor: &PoolDescriptor, expected: &str) -> Error {
    Error::configuration(format!(
        "pool `{}` is a {} pool, not a {expected} pool",
        descriptor.name,
        descriptor.strategy.kind()
    ))
}
