//! Miner configuration from environment variables.
//!
//! | Variable                 | Meaning                       | Default         |
//! |--------------------------|-------------------------------|-----------------|
//! | `BM1380_SERIAL_PORT`     | serial device of the chain    | `/dev/ttyUSB0`  |
//! | `BM1380_FREQUENCY`       | core clock in MHz             | 193             |
//! | `BM1380_TIMEOUT_MS`      | job re-issue timeout          | from hashrate   |
//! | `BM1380_POOL_URL`        | `stratum+tcp://host:port`     | required        |
//! | `BM1380_POOL_USER`       | pool username                 | empty           |
//! | `BM1380_POOL_PASS`       | pool password                 | `x`             |
//! | `BM1380_POOL_TIMEOUT_MS` | pool request timeout          | 5000            |

use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::asic::bm1380::{ChainConfig, Frequency};
use crate::stratum_v1::{parse_url, PoolConfig};

pub const SERIAL_PORT: &str = "BM1380_SERIAL_PORT";
pub const FREQUENCY: &str = "BM1380_FREQUENCY";
pub const TIMEOUT_MS: &str = "BM1380_TIMEOUT_MS";
pub const POOL_URL: &str = "BM1380_POOL_URL";
pub const POOL_USER: &str = "BM1380_POOL_USER";
pub const POOL_PASS: &str = "BM1380_POOL_PASS";
pub const POOL_TIMEOUT_MS: &str = "BM1380_POOL_TIMEOUT_MS";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be set")]
    Missing { name: &'static str },

    #[error("{name}={value:?} is invalid: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct MinerConfig {
    pub chain: ChainConfig,
    pub pool: PoolConfig,
}

impl MinerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build a config from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = ChainConfig::default();

        let frequency_mhz = parse_or(&lookup, FREQUENCY, defaults.frequency_mhz)?;
        Frequency::from_mhz(frequency_mhz).map_err(|e| ConfigError::Invalid {
            name: FREQUENCY,
            value: frequency_mhz.to_string(),
            reason: e.to_string(),
        })?;

        let timeout = parse::<u64>(&lookup, TIMEOUT_MS)?.map(Duration::from_millis);
        if timeout == Some(Duration::ZERO) {
            return Err(ConfigError::Invalid {
                name: TIMEOUT_MS,
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        let chain = ChainConfig {
            port: lookup(SERIAL_PORT).unwrap_or(defaults.port),
            frequency_mhz,
            timeout,
        };

        let url = lookup(POOL_URL).ok_or(ConfigError::Missing { name: POOL_URL })?;
        parse_url(&url).map_err(|e| ConfigError::Invalid {
            name: POOL_URL,
            value: url.clone(),
            reason: e.to_string(),
        })?;

        let pool_defaults = PoolConfig::default();
        let pool_timeout_ms = parse_or(
            &lookup,
            POOL_TIMEOUT_MS,
            pool_defaults.timeout.as_millis() as u64,
        )?;

        let pool = PoolConfig {
            url,
            username: lookup(POOL_USER).unwrap_or_default(),
            password: lookup(POOL_PASS).unwrap_or(pool_defaults.password),
            timeout: Duration::from_millis(pool_timeout_ms),
        };

        Ok(Self { chain, pool })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(name)
        .map(|value| {
            value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                name,
                value: value.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse(lookup, name)?.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    const ALL: [&str; 7] = [
        SERIAL_PORT,
        FREQUENCY,
        TIMEOUT_MS,
        POOL_URL,
        POOL_USER,
        POOL_PASS,
        POOL_TIMEOUT_MS,
    ];

    fn clear_env() {
        for name in ALL {
            env::remove_var(name);
        }
    }

    fn from_map(vars: &[(&str, &str)]) -> Result<MinerConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        MinerConfig::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    #[serial]
    fn test_defaults_from_env() {
        clear_env();
        env::set_var(POOL_URL, "stratum+tcp://pool.example.com:3333");

        let config = MinerConfig::from_env().unwrap();
        assert_eq!(config.chain.port, "/dev/ttyUSB0");
        assert_eq!(config.chain.frequency_mhz, 193);
        assert_eq!(config.chain.timeout, None);
        assert_eq!(config.pool.url, "stratum+tcp://pool.example.com:3333");
        assert_eq!(config.pool.username, "");
        assert_eq!(config.pool.password, "x");
        assert_eq!(config.pool.timeout, Duration::from_millis(5000));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_overrides_from_env() {
        clear_env();
        env::set_var(SERIAL_PORT, "/dev/ttyACM1");
        env::set_var(FREQUENCY, "400");
        env::set_var(TIMEOUT_MS, "750");
        env::set_var(POOL_URL, "pool.example.com:3333");
        env::set_var(POOL_USER, "bc1qworker.rig1");
        env::set_var(POOL_PASS, "secret");
        env::set_var(POOL_TIMEOUT_MS, "2500");

        let config = MinerConfig::from_env().unwrap();
        assert_eq!(config.chain.port, "/dev/ttyACM1");
        assert_eq!(config.chain.frequency_mhz, 400);
        assert_eq!(config.chain.timeout, Some(Duration::from_millis(750)));
        assert_eq!(config.pool.username, "bc1qworker.rig1");
        assert_eq!(config.pool.password, "secret");
        assert_eq!(config.pool.timeout, Duration::from_millis(2500));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_missing_pool_url() {
        clear_env();
        assert_eq!(
            MinerConfig::from_env().unwrap_err(),
            ConfigError::Missing { name: POOL_URL }
        );
    }

    #[test]
    fn test_unsupported_frequency_lists_options() {
        let err = from_map(&[(POOL_URL, "pool:3333"), (FREQUENCY, "180")]).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("BM1380_FREQUENCY"));
        assert!(message.contains("please use one of"));
    }

    #[test]
    fn test_invalid_values() {
        for (name, value) in [
            (FREQUENCY, "fast"),
            (TIMEOUT_MS, "-1"),
            (TIMEOUT_MS, "0"),
            (POOL_TIMEOUT_MS, "soon"),
            (POOL_URL, "pool.example.com"),
        ] {
            let mut vars = vec![(POOL_URL, "pool:3333")];
            vars.push((name, value));
            let err = from_map(&vars).unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid { name: n, .. } if n == name),
                "{}={} gave {:?}",
                name,
                value,
                err
            );
        }
    }
}
