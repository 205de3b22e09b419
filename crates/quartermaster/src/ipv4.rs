use core::{fmt, net::Ipv4Addr, str::FromStr};

use serde::{Deserialize, Serialize};
#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::{
    Allocator, CandidateSource, Error, PoolConfig, PoolDescriptor, PoolStrategy, Result,
    ValueStrategy, allocator::kind_mismatch, store::DocumentStore,
};

/// An inclusive range of IPv4 addresses.
///
/// Parsed either from CIDR notation or from an explicit `first-last` pair:
///
/// ```
/// use core::net::Ipv4Addr;
/// use quartermaster::Ipv4Range;
///
/// // Network and broadcast addresses are not allocatable.
/// let lan: Ipv4Range = "192.168.1.0/24".parse().unwrap();
/// assert_eq!(lan.start(), Ipv4Addr::new(192, 168, 1, 1));
/// assert_eq!(lan.end(), Ipv4Addr::new(192, 168, 1, 254));
/// assert_eq!(lan.len(), 254);
///
/// let span: Ipv4Range = "10.0.0.10-10.0.0.19".parse().unwrap();
/// assert_eq!(span.len(), 10);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Range {
    start: Ipv4Addr,
    end: Ipv4Addr,
}

impl Ipv4Range {
    /// The addresses `start..=end`.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] when `start` comes after `end`.
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self> {
        if start > end {
            return Err(Error::configuration(format!(
                "range start {start} comes after its end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// The usable hosts of `network/prefix`.
    ///
    /// Host bits set in `network` are ignored. For prefixes shorter than
    /// /31 the network and broadcast addresses are excluded.
    pub fn from_cidr(network: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            return Err(Error::validation(format!(
                "prefix length {prefix} exceeds 32"
            )));
        }
        let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
        let base = u32::from(network) & mask;
        let last = base | !mask;
        let (first, last) = if prefix < 31 {
            (base + 1, last - 1)
        } else {
            (base, last)
        };
        Ok(Self {
            start: Ipv4Addr::from(first),
            end: Ipv4Addr::from(last),
        })
    }

    pub const fn start(&self) -> Ipv4Addr {
        self.start
    }

    pub const fn end(&self) -> Ipv4Addr {
        self.end
    }

    /// Number of addresses in the range.
    pub fn len(&self) -> u64 {
        u64::from(self.end.to_bits()) - u64::from(self.start.to_bits()) + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        self.start <= address && address <= self.end
    }

    /// The pool configuration covering this range.
    pub fn pool_config(&self, strategy: ValueStrategy) -> PoolConfig {
        PoolConfig {
            min: i64::from(self.start.to_bits()),
            max: i64::from(self.end.to_bits()),
            strategy: strategy.into(),
        }
    }
}

impl fmt::Display for Ipv4Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for Ipv4Range {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some((network, prefix)) = s.split_once('/') {
            let prefix = prefix
                .parse::<u8>()
                .map_err(|_| Error::validation(format!("invalid prefix length in `{s}`")))?;
            return Self::from_cidr(parse_addr(network)?, prefix);
        }
        if let Some((start, end)) = s.split_once('-') {
            return Self::new(parse_addr(start)?, parse_addr(end)?);
        }
        let single = parse_addr(s)?;
        Self::new(single, single)
    }
}

impl TryFrom<String> for Ipv4Range {
    type Error = Error;

    fn try_from(text: String) -> Result<Self> {
        text.parse()
    }
}

impl From<Ipv4Range> for String {
    fn from(range: Ipv4Range) -> Self {
        range.to_string()
    }
}

fn parse_addr(text: &str) -> Result<Ipv4Addr> {
    text.trim()
        .parse()
        .map_err(|_| Error::validation(format!("`{text}` is not an IPv4 address")))
}

fn to_addr(value: i64) -> Result<Ipv4Addr> {
    u32::try_from(value)
        .map(Ipv4Addr::from)
        .map_err(|_| Error::configuration(format!("{value} is outside the IPv4 space")))
}

impl<S, R> Allocator<S, R>
where
    S: DocumentStore,
    R: CandidateSource,
{
    /// Defines an address pool `name` over `range`.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self), err))]
    pub async fn initialize_ipv4_pool(
        &self,
        name: &str,
        range: &Ipv4Range,
        strategy: ValueStrategy,
    ) -> Result<()> {
        self.bounded(self.create(name, &range.pool_config(strategy)))
            .await
    }

    /// Allocates one address from pool `name`.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self), err))]
    pub async fn ip_address_alloc_one(&self, name: &str) -> Result<Ipv4Addr> {
        let addresses = self.ip_address_alloc_many(name, 1).await?;
        addresses
            .first()
            .copied()
            .ok_or_else(|| Error::exhausted(name))
    }

    /// Allocates `n` distinct addresses from pool `name`, all or nothing.
    ///
    /// A sequential pool removes the `n` lowest free addresses in one atomic
    /// update, or fails with [`Error::PoolExhausted`] leaving the pool as it
    /// was. A probe pool claims addresses one at a time and releases them
    /// again if a later claim fails or the call deadline passes.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] when `n` is zero, otherwise as
    /// [`ip_address_alloc_one`](Self::ip_address_alloc_one).
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self), err))]
    pub async fn ip_address_alloc_many(&self, name: &str, n: usize) -> Result<Vec<Ipv4Addr>> {
        let deadline = self.deadline();
        let descriptor = self.until(deadline, self.ipv4_descriptor(name)).await?;
        self.allocate_values(&descriptor, n, deadline)
            .await?
            .into_iter()
            .map(to_addr)
            .collect()
    }

    /// Returns `address` to pool `name`.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] when `address` is not a dotted-quad IPv4
    /// address; nothing is sent to the store in that case.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self), err))]
    pub async fn ip_address_release(&self, name: &str, address: &str) -> Result<()> {
        let address = parse_addr(address)?;
        self.bounded(async {
            let descriptor = self.ipv4_descriptor(name).await?;
            self.release_value(&descriptor, i64::from(address.to_bits()))
                .await
        })
        .await
    }

    async fn ipv4_descriptor(&self, name: &str) -> Result<PoolDescriptor> {
        let descriptor = self.load(name).await?;
        if matches!(descriptor.strategy, PoolStrategy::Chunk { .. }) {
            return Err(kind_mismatch(&descriptor, "sequential or insert_probe"));
        }
        if descriptor.min < 0 || descriptor.max > i64::from(u32::MAX) {
            return Err(Error::configuration(format!(
                "pool `{name}` covers {}..={}, which is not an IPv4 range",
                descriptor.min, descriptor.max
            )));
        }
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ErrorKind, store::MemoryStore, testing::Scripted};

    fn addr(text: &str) -> Ipv4Addr {
        text.parse().unwrap()
    }

    #[test]
    fn cidr_excludes_network_and_broadcast() {
        let range: Ipv4Range = "10.0.0.0/30".parse().unwrap();
        assert_eq!((range.start(), range.end()), (addr("10.0.0.1"), addr("10.0.0.2")));

        let range: Ipv4Range = "10.0.0.7/29".parse().unwrap();
        assert_eq!((range.start(), range.end()), (addr("10.0.0.1"), addr("10.0.0.6")));
    }

    #[test]
    fn cidr_edge_prefixes() {
        let point_to_point: Ipv4Range = "10.0.0.0/31".parse().unwrap();
        assert_eq!(point_to_point.len(), 2);
        assert_eq!(point_to_point.start(), addr("10.0.0.0"));

        let host: Ipv4Range = "10.0.0.9/32".parse().unwrap();
        assert_eq!(host.len(), 1);
        assert!(host.contains(addr("10.0.0.9")));

        let everything: Ipv4Range = "0.0.0.0/0".parse().unwrap();
        assert_eq!(everything.start(), addr("0.0.0.1"));
        assert_eq!(everything.end(), addr("255.255.255.254"));
        assert_eq!(everything.len(), u64::from(u32::MAX) - 1);
    }

    #[test]
    fn malformed_ranges() {
        for text in ["10.0.0.0/33", "10.0.0.0/x", "10.0.0/24", "10.0.0.9-10.0.0.1", "abc", ""] {
            assert!(text.parse::<Ipv4Range>().is_err(), "{text}");
        }
        assert_eq!(
            "10.0.0.9-10.0.0.1".parse::<Ipv4Range>().unwrap_err().kind(),
            ErrorKind::ConfigurationError
        );
        assert_eq!(
            "10.0.0.0/33".parse::<Ipv4Range>().unwrap_err().kind(),
            ErrorKind::ValidationError
        );
    }

    #[test]
    fn display_round_trips() {
        let range: Ipv4Range = "172.16.0.0/12".parse().unwrap();
        assert_eq!(range.to_string(), "172.16.0.1-172.31.255.254");
        assert_eq!(range.to_string().parse::<Ipv4Range>().unwrap(), range);

        let json = serde_json::to_value(range).unwrap();
        assert_eq!(json, serde_json::json!("172.16.0.1-172.31.255.254"));
        assert!(serde_json::from_value::<Ipv4Range>(serde_json::json!("1.1.1.9-1.1.1.1")).is_err());
    }

    #[tokio::test]
    async fn sequential_pool_hands_out_lowest_addresses() {
        let allocator = Allocator::new(MemoryStore::new());
        let range: Ipv4Range = "192.168.0.0/29".parse().unwrap();
        allocator
            .initialize_ipv4_pool("lan", &range, ValueStrategy::Sequential)
            .await
            .unwrap();

        assert_eq!(allocator.ip_address_alloc_one("lan").await.unwrap(), addr("192.168.0.1"));
        let many = allocator.ip_address_alloc_many("lan", 3).await.unwrap();
        assert_eq!(many, vec![addr("192.168.0.2"), addr("192.168.0.3"), addr("192.168.0.4")]);

        allocator.ip_address_release("lan", "192.168.0.1").await.unwrap();
        assert_eq!(allocator.ip_address_alloc_one("lan").await.unwrap(), addr("192.168.0.1"));
    }

    #[tokio::test]
    async fn sequential_bulk_is_all_or_nothing() {
        let allocator = Allocator::new(MemoryStore::new());
        let range = Ipv4Range::new(addr("10.1.0.1"), addr("10.1.0.4")).unwrap();
        allocator
            .initialize_ipv4_pool("small", &range, ValueStrategy::Sequential)
            .await
            .unwrap();
        allocator.ip_address_alloc_many("small", 3).await.unwrap();

        let err = allocator.ip_address_alloc_many("small", 2).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PoolExhausted);
        // The remaining address was not consumed by the failed call.
        assert_eq!(allocator.free_count("small").await.unwrap(), 1);
        assert_eq!(allocator.ip_address_alloc_one("small").await.unwrap(), addr("10.1.0.4"));
    }

    #[tokio::test]
    async fn probe_bulk_rolls_back_on_failure() {
        let store = MemoryStore::new();
        let base = i64::from(addr("10.2.0.1").to_bits());
        // Two fresh claims, then the same address over and over.
        let rand = Scripted::new([base, base + 1, base + 1, base + 1]);
        let allocator = Allocator::with_rand(store.clone(), rand, Default::default());
        let range = Ipv4Range::new(addr("10.2.0.1"), addr("10.2.0.8")).unwrap();
        allocator
            .initialize_ipv4_pool("probe", &range, ValueStrategy::InsertProbe { retry_limit: 2 })
            .await
            .unwrap();

        let err = allocator.ip_address_alloc_many("probe", 3).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AllocationRetriesExhausted);

        // Both claims of the failed call were released again.
        let records = crate::testing::records(&store, "probe").await;
        assert!(records.is_empty(), "{records:?}");
    }

    #[tokio::test]
    async fn probe_bulk_allocates_distinct_addresses() {
        let allocator = Allocator::new(MemoryStore::new());
        let range: Ipv4Range = "10.3.0.0/24".parse().unwrap();
        allocator
            .initialize_ipv4_pool("wide", &range, ValueStrategy::InsertProbe { retry_limit: 64 })
            .await
            .unwrap();

        let many = allocator.ip_address_alloc_many("wide", 20).await.unwrap();
        let mut unique = many.clone();
        unique.dedup();
        assert_eq!(unique.len(), 20);
        assert!(many.iter().all(|a| range.contains(*a)));
    }

    #[tokio::test]
    async fn bulk_larger_than_the_pool_is_exhausted() {
        let allocator = Allocator::new(MemoryStore::new());
        let range: Ipv4Range = "10.4.0.0/30".parse().unwrap();
        allocator
            .initialize_ipv4_pool("tiny", &range, ValueStrategy::InsertProbe { retry_limit: 8 })
            .await
            .unwrap();
        let err = allocator.ip_address_alloc_many("tiny", 3).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PoolExhausted);
    }

    #[tokio::test]
    async fn zero_addresses_is_invalid() {
        let allocator = Allocator::new(MemoryStore::new());
        let range: Ipv4Range = "10.5.0.0/30".parse().unwrap();
        allocator
            .initialize_ipv4_pool("z", &range, ValueStrategy::Sequential)
            .await
            .unwrap();
        let err = allocator.ip_address_alloc_many("z", 0).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn release_rejects_malformed_text_before_touching_the_store() {
        let store = MemoryStore::new();
        let allocator = Allocator::new(store.clone());
        let before = store.operation_count();

        let err = allocator.ip_address_release("any", "300.1.1.1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
        assert_eq!(store.operation_count(), before);
    }

    #[tokio::test]
    async fn release_outside_the_range_is_ignored() {
        let allocator = Allocator::new(MemoryStore::new());
        let range: Ipv4Range = "10.6.0.0/30".parse().unwrap();
        allocator
            .initialize_ipv4_pool("r", &range, ValueStrategy::Sequential)
            .await
            .unwrap();
        allocator.ip_address_release("r", "10.9.9.9").await.unwrap();
        allocator.ip_address_release("r", "10.6.0.1").await.unwrap();
        assert_eq!(allocator.free_count("r").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn integer_pools_outside_ipv4_space_are_rejected() {
        let allocator = Allocator::new(MemoryStore::new());
        allocator
            .initialize("neg", &PoolConfig::sequential(-5, 5))
            .await
            .unwrap();
        let err = allocator.ip_address_alloc_one("neg").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationError);

        allocator
            .initialize("chunks", &PoolConfig::chunk(0, 99, 3, 10))
            .await
            .unwrap();
        let err = allocator.ip_address_alloc_one("chunks").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationError);
    }
}
