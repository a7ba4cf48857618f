//! Configuration for the cloudpool agent.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use cloudpool_id::PoolId;
use cloudpool_pool::{PoolConfig, ProvisioningFlags, ReleasePolicy};

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identifier of the pool this agent hosts.
    pub pool_id: PoolId,

    /// Pool location name override.
    pub location_name: Option<String>,

    pub pool: PoolConfig,

    /// How often machine usage is sampled.
    pub sample_interval: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        // Pool ID can be provided or auto-generated
        let pool_id = match lookup("CLOUDPOOL_POOL_ID") {
            Some(s) => s.parse().context("invalid CLOUDPOOL_POOL_ID")?,
            None => PoolId::new(),
        };

        let defaults = PoolConfig::default();

        let initial_size =
            parse_var(&lookup, "CLOUDPOOL_INITIAL_SIZE")?.unwrap_or(defaults.initial_size);
        let max_size = parse_var(&lookup, "CLOUDPOOL_MAX_SIZE")?;
        if max_size.is_some_and(|max| max < initial_size) {
            bail!("CLOUDPOOL_MAX_SIZE must not be below CLOUDPOOL_INITIAL_SIZE");
        }

        let release_policy = match lookup("CLOUDPOOL_RELEASE_POLICY") {
            Some(s) => s
                .parse::<ReleasePolicy>()
                .map_err(|e| anyhow!("invalid CLOUDPOOL_RELEASE_POLICY: {e}"))?,
            None => defaults.release_policy,
        };

        let register_machine_locations = match lookup("CLOUDPOOL_REGISTER_MACHINES") {
            Some(s) => parse_bool(&s).context("invalid CLOUDPOOL_REGISTER_MACHINES")?,
            None => defaults.register_machine_locations,
        };

        let provision_timeout = parse_var(&lookup, "CLOUDPOOL_PROVISION_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.provision_timeout);

        let provisioning_flags = match lookup("CLOUDPOOL_PROVISIONING_FLAGS") {
            Some(s) => parse_flags(&s).context("invalid CLOUDPOOL_PROVISIONING_FLAGS")?,
            None => ProvisioningFlags::new(),
        };

        let sample_interval_secs: u64 =
            parse_var(&lookup, "CLOUDPOOL_SAMPLE_INTERVAL_SECS")?.unwrap_or(15);
        if sample_interval_secs == 0 {
            bail!("CLOUDPOOL_SAMPLE_INTERVAL_SECS must be positive");
        }

        let location_name = lookup("CLOUDPOOL_LOCATION_NAME").filter(|s| !s.is_empty());
        let log_level = lookup("CLOUDPOOL_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            pool_id,
            location_name,
            pool: PoolConfig {
                initial_size,
                max_size,
                release_policy,
                register_machine_locations,
                provision_timeout,
                provisioning_flags,
            },
            sample_interval: Duration::from_secs(sample_interval_secs),
            log_level,
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|s| s.trim().parse::<T>().with_context(|| format!("invalid {key}: {s:?}")))
        .transpose()
}

fn parse_bool(s: &str) -> Result<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => bail!("expected a boolean, got {other:?}"),
    }
}

/// Parse `key=value,key=value`.
fn parse_flags(s: &str) -> Result<ProvisioningFlags> {
    let mut flags = ProvisioningFlags::new();
    for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("expected key=value, got {pair:?}"))?;
        let key = key.trim();
        if key.is_empty() {
            bail!("empty key in {pair:?}");
        }
        flags.insert(key.to_string(), value.trim().to_string());
    }
    Ok(flags)
}
