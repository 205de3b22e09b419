use core::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use quartermaster::{
    AllocatorConfig, DEFAULT_MAX_FREE_SET_LEN, Ipv4Range, PoolConfig, ValueStrategy,
    store::ConnectPolicy,
};

/// Runtime configuration for the `quartermaster-server` binary.
///
/// All values are parsed from CLI arguments or environment variables (a
/// `.env` file is loaded first).
#[derive(Parser, Debug, Clone)]
#[command(
    name = "quartermaster-server",
    version,
    about = "An HTTP service allocating unique IDs, chunks and IPv4 addresses from shared pools"
)]
pub struct CliArgs {
    /// Address to listen on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:8000"))]
    pub server_addr: String,

    /// Deadline for every allocator call, in milliseconds. Zero disables it.
    ///
    /// Environment variable: `CALL_TIMEOUT_MS`
    #[arg(long, env = "CALL_TIMEOUT_MS", default_value_t = 5_000)]
    pub call_timeout_ms: u64,

    /// Upper bound of the random pause between two colliding probe attempts,
    /// in milliseconds. Zero retries immediately.
    ///
    /// Environment variable: `PROBE_JITTER_MS`
    #[arg(long, env = "PROBE_JITTER_MS", default_value_t = 0)]
    pub probe_jitter_ms: u64,

    /// Largest sequential pool accepted, in values.
    ///
    /// Environment variable: `MAX_FREE_SET_LEN`
    #[arg(long, env = "MAX_FREE_SET_LEN", default_value_t = DEFAULT_MAX_FREE_SET_LEN)]
    pub max_free_set_len: u64,

    /// Largest `number` accepted by a bulk allocation request.
    ///
    /// Environment variable: `MAX_BULK`
    #[arg(long, env = "MAX_BULK", default_value_t = 4096)]
    pub max_bulk: usize,

    /// Pools to initialize at startup, as `NAME=SPEC`. Repeatable.
    ///
    /// SPEC is one of `sequential:MIN..MAX`, `insert_probe:MIN..MAX:RETRIES`,
    /// `chunk:MIN..MAX:RETRIES:SIZE`, `ipv4:RANGE` or `ipv4:RANGE:RETRIES`,
    /// where RANGE is CIDR or `FIRST-LAST`.
    ///
    /// Environment variable: `POOLS` (`;`-separated)
    #[arg(long = "pool", env = "POOLS", value_delimiter = ';')]
    pub pools: Vec<String>,

    /// MongoDB connection string. When unset, pools live in process memory.
    ///
    /// Environment variable: `MONGO_URL`
    #[arg(long, env = "MONGO_URL")]
    pub mongo_url: Option<String>,

    /// MongoDB database holding the pool collections.
    ///
    /// Environment variable: `MONGO_DATABASE`
    #[arg(long, env = "MONGO_DATABASE", default_value_t = String::from("quartermaster"))]
    pub mongo_database: String,

    /// How long to keep retrying the initial store connection, in seconds.
    ///
    /// Environment variable: `CONNECT_DEADLINE_SECS`
    #[arg(long, env = "CONNECT_DEADLINE_SECS", default_value_t = 180)]
    pub connect_deadline_secs: u64,

    /// Pause between two connection attempts, in seconds.
    ///
    /// Environment variable: `CONNECT_POLL_SECS`
    #[arg(long, env = "CONNECT_POLL_SECS", default_value_t = 2)]
    pub connect_poll_secs: u64,
}

/// Where pool state is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    Memory,
    Mongo { url: String, database: String },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub allocator: AllocatorConfig,
    pub max_bulk: usize,
    pub pools: Vec<(String, PoolConfig)>,
    pub store: StoreConfig,
    pub connect: ConnectPolicy,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.max_bulk == 0 {
            bail!("MAX_BULK must be greater than 0");
        }
        if args.connect_poll_secs == 0 {
            bail!("CONNECT_POLL_SECS must be greater than 0");
        }

        let store = match args.mongo_url {
            None => StoreConfig::Memory,
            Some(url) if cfg!(feature = "mongodb") => StoreConfig::Mongo {
                url,
                database: args.mongo_database,
            },
            Some(_) => bail!("MONGO_URL is set but this build lacks the `mongodb` feature"),
        };

        let pools = args
            .pools
            .iter()
            .filter(|spec| !spec.trim().is_empty())
            .map(|spec| parse_pool(spec).with_context(|| format!("invalid pool `{spec}`")))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let millis = |ms: u64| (ms > 0).then(|| Duration::from_millis(ms));

        Ok(Self {
            server_addr: args.server_addr,
            allocator: AllocatorConfig {
                call_timeout: millis(args.call_timeout_ms),
                probe_jitter: millis(args.probe_jitter_ms),
                max_free_set_len: args.max_free_set_len,
            },
            max_bulk: args.max_bulk,
            pools,
            store,
            connect: ConnectPolicy {
                poll_interval: Duration::from_secs(args.connect_poll_secs),
                deadline: Duration::from_secs(args.connect_deadline_secs),
            },
        })
    }
}

/// Parses `NAME=SPEC` into a pool name and its configuration.
fn parse_pool(text: &str) -> anyhow::Result<(String, PoolConfig)> {
    let (name, spec) = text
        .trim()
        .split_once('=')
        .context("expected NAME=SPEC")?;
    if name.is_empty() {
        bail!("pool name is empty");
    }

    let mut parts = spec.split(':');
    let kind = parts.next().unwrap_or_default();
    let range = parts.next().context("missing range")?;
    let rest: Vec<&str> = parts.collect();

    let config = match (kind, rest.as_slice()) {
        ("sequential", []) => {
            let (min, max) = parse_bounds(range)?;
            PoolConfig::sequential(min, max)
        }
        ("insert_probe", [retries]) => {
            let (min, max) = parse_bounds(range)?;
            PoolConfig::insert_probe(min, max, retries.parse().context("invalid retry limit")?)
        }
        ("chunk", [retries, size]) => {
            let (min, max) = parse_bounds(range)?;
            PoolConfig::chunk(
                min,
                max,
                retries.parse().context("invalid retry limit")?,
                size.parse().context("invalid chunk size")?,
            )
        }
        ("ipv4", []) => range.parse::<Ipv4Range>()?.pool_config(ValueStrategy::Sequential),
        ("ipv4", [retries]) => range
            .parse::<Ipv4Range>()?
            .pool_config(ValueStrategy::InsertProbe {
                retry_limit: retries.parse().context("invalid retry limit")?,
            }),
        _ => bail!("unrecognized pool spec `{spec}`"),
    };
    config.validate()?;
    Ok((name.to_owned(), config))
}

fn parse_bounds(range: &str) -> anyhow::Result<(i64, i64)> {
    let (min, max) = range.split_once("..").context("expected MIN..MAX")?;
    Ok((
        min.parse().context("invalid lower bound")?,
        max.parse().context("invalid upper bound")?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<ServerConfig> {
        let argv = std::iter::once("quartermaster-server").chain(args.iter().copied());
        ServerConfig::try_from(CliArgs::try_parse_from(argv)?)
    }

    #[test]
    fn defaults() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.server_addr, "0.0.0.0:8000");
        assert_eq!(config.allocator.call_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.allocator.probe_jitter, None);
        assert_eq!(config.store, StoreConfig::Memory);
        assert_eq!(config.connect, ConnectPolicy::default());
        assert!(config.pools.is_empty());
    }

    #[test]
    fn zero_timeout_disables_the_deadline() {
        let config = parse(&["--call-timeout-ms", "0", "--probe-jitter-ms", "5"]).unwrap();
        assert_eq!(config.allocator.call_timeout, None);
        assert_eq!(config.allocator.probe_jitter, Some(Duration::from_millis(5)));
    }

    #[test]
    fn pool_specs() {
        let config = parse(&[
            "--pool",
            "pool1=sequential:1..3",
            "--pool",
            "ins=insert_probe:-10..10:5",
            "--pool",
            "blocks=chunk:0..99:4:10",
            "--pool",
            "lan=ipv4:10.0.0.0/24",
            "--pool",
            "wan=ipv4:192.0.2.10-192.0.2.20:8",
        ])
        .unwrap();

        assert_eq!(
            config.pools,
            vec![
                ("pool1".to_owned(), PoolConfig::sequential(1, 3)),
                ("ins".to_owned(), PoolConfig::insert_probe(-10, 10, 5)),
                ("blocks".to_owned(), PoolConfig::chunk(0, 99, 4, 10)),
                (
                    "lan".to_owned(),
                    "10.0.0.0/24"
                        .parse::<Ipv4Range>()
                        .unwrap()
                        .pool_config(ValueStrategy::Sequential)
                ),
                (
                    "wan".to_owned(),
                    "192.0.2.10-192.0.2.20"
                        .parse::<Ipv4Range>()
                        .unwrap()
                        .pool_config(ValueStrategy::InsertProbe { retry_limit: 8 })
                ),
            ]
        );
    }

    #[test]
    fn bad_pool_specs() {
        for spec in [
            "noequals",
            "=sequential:1..2",
            "p=sequential",
            "p=sequential:3..1",
            "p=sequential:1-3",
            "p=insert_probe:1..3",
            "p=insert_probe:1..3:0",
            "p=chunk:0..9:1",
            "p=ipv4:10.0.0.0/40",
            "p=bogus:1..2",
        ] {
            assert!(parse(&["--pool", spec]).is_err(), "{spec}");
        }
    }

    #[test]
    fn rejects_zero_bulk() {
        assert!(parse(&["--max-bulk", "0"]).is_err());
    }

    #[cfg(not(feature = "mongodb"))]
    #[test]
    fn mongo_requires_the_feature() {
        assert!(parse(&["--mongo-url", "mongodb://localhost:27017"]).is_err());
    }

    #[cfg(feature = "mongodb")]
    #[test]
    fn mongo_store() {
        let config = parse(&["--mongo-url", "mongodb://db:27017", "--mongo-database", "ipam"]).unwrap();
        assert_eq!(
            config.store,
            StoreConfig::Mongo {
                url: "mongodb://db:27017".into(),
                database: "ipam".into()
            }
        );
    }
}
