#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{info, warn};

use crate::util::secret::SecretString;

/// Default config path: `~/.parley/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".parley").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub redis: RedisSettings,
	pub persistence: PersistenceSettings,
	pub delivery: DeliverySettings,
}

/// Server settings loaded by the server.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// HMAC secret for stateless access tokens. Required: connections
	/// cannot be admitted without identity.
	pub auth_hmac_secret: Option<SecretString>,
}

/// Redis settings. When no URL is configured the server runs in
/// single-process mode with in-memory presence, typing and bus backends.
#[derive(Debug, Clone, Default)]
pub struct RedisSettings {
	pub url: Option<String>,
}

/// Persistence settings loaded by the server.
#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Database URL (sqlite: or postgres:).
	pub database_url: Option<String>,
}

/// Tunables for the delivery subsystem.
#[derive(Debug, Clone)]
pub struct DeliverySettings {
	/// Presence record TTL. Refreshed only by re-registration.
	pub presence_ttl_secs: u64,
	/// TTL carried in published typing signals.
	pub typing_signal_ttl_secs: u64,
	/// Expiry of the per-connection typing claim set; refreshed on every
	/// typing event, so only an idle or vanished client lets it lapse.
	pub typing_claim_ttl_secs: u64,
	/// Per-connection outbound queue capacity.
	pub outbound_queue_capacity: usize,
}

impl Default for DeliverySettings {
	fn default() -> Self {
		Self {
			presence_ttl_secs: 24 * 60 * 60,
			typing_signal_ttl_secs: 10,
			typing_claim_ttl_secs: 15,
			outbound_queue_capacity: 1024,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	redis: FileRedisSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	delivery: FileDeliverySettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	auth_hmac_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRedisSettings {
	url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileDeliverySettings {
	presence_ttl_secs: Option<u64>,
	typing_signal_ttl_secs: Option<u64>,
	typing_claim_ttl_secs: Option<u64>,
	outbound_queue_capacity: Option<usize>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = DeliverySettings::default();

		Self {
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				auth_hmac_secret: file
					.server
					.auth_hmac_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
			},
			redis: RedisSettings {
				url: file.redis.url.filter(|s| !s.trim().is_empty()),
			},
			persistence: PersistenceSettings {
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
			delivery: DeliverySettings {
				presence_ttl_secs: file.delivery.presence_ttl_secs.unwrap_or(defaults.presence_ttl_secs),
				typing_signal_ttl_secs: file
					.delivery
					.typing_signal_ttl_secs
					.unwrap_or(defaults.typing_signal_ttl_secs),
				typing_claim_ttl_secs: file
					.delivery
					.typing_claim_ttl_secs
					.unwrap_or(defaults.typing_claim_ttl_secs),
				outbound_queue_capacity: file
					.delivery
					.outbound_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(defaults.outbound_queue_capacity),
			},
		}
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("PARLEY_AUTH_HMAC_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.auth_hmac_secret = Some(SecretString::new(v));
			info!("server auth: auth_hmac_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_REDIS_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.redis.url = Some(v);
			info!("redis config: url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = Some(v);
			info!("persistence: database_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_PRESENCE_TTL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.delivery.presence_ttl_secs = secs;
		info!(secs, "delivery config: presence_ttl_secs overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_TYPING_SIGNAL_TTL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.delivery.typing_signal_ttl_secs = secs;
		info!(secs, "delivery config: typing_signal_ttl_secs overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_TYPING_CLAIM_TTL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.delivery.typing_claim_ttl_secs = secs;
		info!(secs, "delivery config: typing_claim_ttl_secs overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_OUTBOUND_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
		&& capacity > 0
	{
		cfg.delivery.outbound_queue_capacity = capacity;
		info!(capacity, "delivery config: outbound_queue_capacity overridden by env");
	}

	if cfg.redis.url.is_none() {
		warn!("redis config: no url configured; running single-process (in-memory presence and bus)");
	}
}
