//! Layered configuration for the tracker and its binary.
//!
//! Values start from built-in defaults, are replaced by an optional TOML file, then by
//! `VAULT_*` environment variables, and are validated last.

use crate::utils::duration::millis;
use crate::vault::sync::RetryPolicy;

use alloy_primitives::{Address, address};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Vault contract watched when none is configured
pub const DEFAULT_CONTRACT: Address = address!("2d71De053e0DEFbCE58D609E36568d874D07e1a5");

/// Public Base mainnet endpoint
pub const DEFAULT_RPC_URL: &str = "https://mainnet.base.org";

/// Base mainnet, where the vault is deployed
pub const BASE_MAINNET_CHAIN_ID: u64 = 8453;

/// Largest accepted distance of the zero baseline point, ten years
pub const MAX_BASELINE_OFFSET_SECS: i64 = 10 * 366 * 86_400;

pub const ENV_RPC_URL: &str = "VAULT_RPC_URL";
pub const ENV_CHAIN_ID: &str = "VAULT_CHAIN_ID";
pub const ENV_CONTRACT: &str = "VAULT_CONTRACT";
pub const ENV_USER: &str = "VAULT_USER";
pub const ENV_POLL_INTERVAL_MS: &str = "VAULT_POLL_INTERVAL_MS";
pub const ENV_LOG_LEVEL: &str = "VAULT_LOG_LEVEL";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("Failed to read config file {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("Failed to parse config file {path}: {source}")]
	Parse {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},

	#[error("Invalid value {value:?} for {name}: {reason}")]
	InvalidEnv {
		name: &'static str,
		value: String,
		reason: String,
	},

	#[error("Invalid configuration: {0}")]
	Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RpcConfig {
	pub url: String,
	/// Chain the node must serve
	pub chain_id: u64,
	/// Per-request HTTP timeout
	#[serde(with = "millis")]
	pub request_timeout: Duration,
}

impl Default for RpcConfig {
	fn default() -> Self {
		Self {
			url: DEFAULT_RPC_URL.to_string(),
			chain_id: BASE_MAINNET_CHAIN_ID,
			request_timeout: Duration::from_secs(20),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VaultConfig {
	pub contract: Address,
	/// Connected user; the vault-wide view is tracked when unset
	pub user: Option<Address>,
}

impl Default for VaultConfig {
	fn default() -> Self {
		Self {
			contract: DEFAULT_CONTRACT,
			user: None,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
	#[serde(with = "millis")]
	pub poll_interval: Duration,
	/// First block searched for vault logs
	pub from_block: u64,
	/// Widest block span of one log query
	pub max_block_range: u64,
	/// Block timestamp lookups kept in flight at once
	pub block_fetch_concurrency: usize,
	/// Distance of the zero baseline point before the first event
	pub baseline_offset_secs: i64,
	/// Minimum spacing of user-triggered refreshes
	#[serde(with = "millis")]
	pub user_refresh_cooldown: Duration,
	pub retry: RetryPolicy,
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			poll_interval: Duration::from_secs(30),
			from_block: 0,
			max_block_range: 50_000,
			block_fetch_concurrency: 8,
			baseline_offset_secs: 86_400,
			user_refresh_cooldown: Duration::from_secs(2),
			retry: RetryPolicy::default(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FeeConfig {
	/// Quiet period before a typed amount is estimated
	#[serde(with = "millis")]
	pub debounce: Duration,
}

impl Default for FeeConfig {
	fn default() -> Self {
		Self {
			debounce: Duration::from_millis(500),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
	/// Default level when `RUST_LOG` is unset
	pub level: String,
}

impl Default for LoggingConfig {
	fn default() -> Self {
		Self {
			level: "info".to_string(),
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
	pub rpc: RpcConfig,
	pub vault: VaultConfig,
	pub sync: SyncConfig,
	pub fees: FeeConfig,
	pub logging: LoggingConfig,
}

impl Config {
	/// Defaults, then `path` if given, then the process environment, then validation.
	pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
		let mut config = match path {
			Some(path) => Self::from_file(path)?,
			None => Self::default(),
		};
		config.apply_overrides(|name| std::env::var(name).ok())?;
		config.validate()?;
		Ok(config)
	}

	pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
		let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
			path: path.to_path_buf(),
			source,
		})?;
		debug!("Loaded config file {}", path.display());
		toml::from_str(&contents).map_err(|source| ConfigError::Parse {
			path: path.to_path_buf(),
			source,
		})
	}

	/// Apply `VAULT_*` overrides looked up through `lookup`.
	pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
	where
		F: Fn(&str) -> Option<String>,
	{
		if let Some(url) = lookup(ENV_RPC_URL) {
			self.rpc.url = url;
		}
		if let Some(value) = lookup(ENV_CHAIN_ID) {
			self.rpc.chain_id = parse_env(ENV_CHAIN_ID, value)?;
		}
		if let Some(value) = lookup(ENV_CONTRACT) {
			self.vault.contract = parse_env(ENV_CONTRACT, value)?;
		}
		if let Some(value) = lookup(ENV_USER) {
			self.vault.user = if value.trim().is_empty() {
				None
			} else {
				Some(parse_env(ENV_USER, value)?)
			};
		}
		if let Some(value) = lookup(ENV_POLL_INTERVAL_MS) {
			let millis: u64 = parse_env(ENV_POLL_INTERVAL_MS, value)?;
			self.sync.poll_interval = Duration::from_millis(millis);
		}
		if let Some(level) = lookup(ENV_LOG_LEVEL) {
			self.logging.level = level;
		}
		Ok(())
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if !(self.rpc.url.starts_with("http://") || self.rpc.url.starts_with("https://")) {
			return Err(ConfigError::Invalid(format!(
				"rpc.url must be an http(s) URL, got {:?}",
				self.rpc.url
			)));
		}
		if self.sync.poll_interval.is_zero() {
			return Err(ConfigError::Invalid("sync.poll_interval cannot be zero".to_string()));
		}
		if self.sync.max_block_range == 0 {
			return Err(ConfigError::Invalid("sync.max_block_range cannot be zero".to_string()));
		}
		if self.sync.block_fetch_concurrency == 0 {
			return Err(ConfigError::Invalid(
				"sync.block_fetch_concurrency cannot be zero".to_string(),
			));
		}
		if !(1..=MAX_BASELINE_OFFSET_SECS).contains(&self.sync.baseline_offset_secs) {
			return Err(ConfigError::Invalid(format!(
				"sync.baseline_offset_secs must be between 1 and {}, got {}",
				MAX_BASELINE_OFFSET_SECS, self.sync.baseline_offset_secs
			)));
		}
		let retry = &self.sync.retry;
		if retry.max_attempts == 0 {
			return Err(ConfigError::Invalid("sync.retry.max_attempts cannot be zero".to_string()));
		}
		if !retry.backoff_multiplier.is_finite() || retry.backoff_multiplier < 1.0 {
			return Err(ConfigError::Invalid(format!(
				"sync.retry.backoff_multiplier must be at least 1, got {}",
				retry.backoff_multiplier
			)));
		}
		if self.logging.level.parse::<tracing::Level>().is_err() {
			return Err(ConfigError::Invalid(format!(
				"logging.level {:?} is not a tracing level",
				self.logging.level
			)));
		}
		Ok(())
	}
}

fn parse_env<T>(name: &'static str, value: String) -> Result<T, ConfigError>
where
	T: std::str::FromStr,
	T::Err: std::fmt::Display,
{
	let parsed = value.trim().parse::<T>();
	parsed.map_err(|e| ConfigError::InvalidEnv {
		name,
		reason: e.to_string(),
		value,
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;

	fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
		let vars: HashMap<String, String> = pairs
			.iter()
			.map(|(k, v)| (k.to_string(), v.to_string()))
			.collect();
		move |name| vars.get(name).cloned()
	}

	#[test]
	fn test_defaults_are_valid() {
		let config = Config::default();
		config.validate().expect("defaults validate");
		assert_eq!(config.vault.contract, DEFAULT_CONTRACT);
		assert_eq!(config.rpc.chain_id, BASE_MAINNET_CHAIN_ID);
		assert_eq!(config.sync.poll_interval, Duration::from_secs(30));
		assert_eq!(config.sync.retry.max_attempts, 3);
		assert_eq!(config.sync.retry.base_delay, Duration::from_millis(500));
		assert_eq!(config.fees.debounce, Duration::from_millis(500));
	}

	#[test]
	fn test_partial_toml_keeps_defaults() {
		let config: Config = toml::from_str(
			r#"
			[rpc]
			url = "http://localhost:8545"

			[sync]
			poll_interval = 5000
			max_block_range = 1000

			[sync.retry]
			max_attempts = 5
			deadline = 10000
			"#,
		)
		.expect("parses");

		assert_eq!(config.rpc.url, "http://localhost:8545");
		assert_eq!(config.rpc.request_timeout, Duration::from_secs(20));
		assert_eq!(config.sync.poll_interval, Duration::from_secs(5));
		assert_eq!(config.sync.max_block_range, 1000);
		assert_eq!(config.sync.retry.max_attempts, 5);
		assert_eq!(config.sync.retry.base_delay, Duration::from_millis(500));
		assert_eq!(config.sync.retry.deadline, Some(Duration::from_secs(10)));
		assert_eq!(config.vault.contract, DEFAULT_CONTRACT);
	}

	#[test]
	fn test_env_overrides() {
		let mut config = Config::default();
		config
			.apply_overrides(env(&[
				(ENV_RPC_URL, "http://node:8545"),
				(ENV_CHAIN_ID, "31337"),
				(ENV_USER, "0x00000000000000000000000000000000000000a1"),
				(ENV_POLL_INTERVAL_MS, "1500"),
				(ENV_LOG_LEVEL, "debug"),
			]))
			.expect("overrides apply");

		assert_eq!(config.rpc.url, "http://node:8545");
		assert_eq!(config.rpc.chain_id, 31337);
		assert_eq!(
			config.vault.user,
			Some(address!("00000000000000000000000000000000000000a1"))
		);
		assert_eq!(config.sync.poll_interval, Duration::from_millis(1500));
		assert_eq!(config.logging.level, "debug");
		config.validate().expect("still valid");
	}

	#[test]
	fn test_bad_env_value_is_reported() {
		let mut config = Config::default();
		let err = config
			.apply_overrides(env(&[(ENV_POLL_INTERVAL_MS, "soon")]))
			.expect_err("rejects non-numeric interval");
		assert!(matches!(err, ConfigError::InvalidEnv { name: ENV_POLL_INTERVAL_MS, .. }));

		let err = config
			.apply_overrides(env(&[(ENV_CONTRACT, "0x1234")]))
			.expect_err("rejects short address");
		assert!(matches!(err, ConfigError::InvalidEnv { name: ENV_CONTRACT, .. }));
	}

	#[test]
	fn test_validation_rejects_bad_values() {
		let mut config = Config::default();
		config.sync.retry.max_attempts = 0;
		assert!(config.validate().is_err());

		let mut config = Config::default();
		config.rpc.url = "ws://node".to_string();
		assert!(config.validate().is_err());

		let mut config = Config::default();
		config.logging.level = "chatty".to_string();
		assert!(config.validate().is_err());

		let mut config = Config::default();
		config.sync.poll_interval = Duration::ZERO;
		assert!(config.validate().is_err());
	}

	#[test]
	fn test_baseline_offset_is_bounded() {
		let mut config = Config::default();
		for secs in [0, -1, MAX_BASELINE_OFFSET_SECS + 1, i64::MAX] {
			config.sync.baseline_offset_secs = secs;
			assert!(config.validate().is_err(), "{} should be rejected", secs);
		}
		config.sync.baseline_offset_secs = MAX_BASELINE_OFFSET_SECS;
		config.validate().expect("upper bound is accepted");
	}

	#[test]
	fn test_missing_file_is_an_io_error() {
		let err = Config::from_file(Path::new("/nonexistent/vault.toml")).expect_err("missing");
		assert!(matches!(err, ConfigError::Io { .. }));
	}
}
