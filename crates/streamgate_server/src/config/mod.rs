#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::info;

/// Default config path: `~/.streamgate/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".streamgate").join("config.toml"))
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
#[derive(Debug, Clone)]
pub struct ServerConfig {
	/// TCP listen endpoint (host:port).
	pub bind_address: String,
	/// Interval between `server_ping` sweeps over the connection table.
	pub ping_timeout_clients: Duration,
	/// Interval between chat-channel cache refreshes from the directory.
	pub reread_cache_timeout: Duration,
	/// Informational host returned by `get_server_info`.
	pub bandwidth_host: String,
	pub bus: BusSettings,
	pub directory: DirectorySettings,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			bind_address: "127.0.0.1:7040".to_string(),
			ping_timeout_clients: Duration::from_secs(30),
			reread_cache_timeout: Duration::from_secs(60),
			bandwidth_host: "http://127.0.0.1:7040".to_string(),
			bus: BusSettings::default(),
			directory: DirectorySettings::default(),
		}
	}
}

/// Connection parameters and logical channel names of the external
/// pub/sub bus. `address` is handed to whichever transport implements
/// `ExternalBus`; none configured means the null transport.
#[derive(Debug, Clone)]
pub struct BusSettings {
	/// Transport endpoint (host:port). Unset disables the bus.
	pub address: Option<String>,
	/// Subscribed channel carrying inbound command injections.
	pub channel_in: String,
	/// Reply channel for relayed command responses.
	pub channel_out: String,
	/// Channel carrying client online/offline state.
	pub channel_clients_state: String,
}

impl Default for BusSettings {
	fn default() -> Self {
		Self {
			address: None,
			channel_in: "COMMANDS_IN".to_string(),
			channel_out: "COMMANDS_OUT".to_string(),
			channel_clients_state: "CLIENTS_STATE".to_string(),
		}
	}
}

/// Seed data for the in-memory user directory.
#[derive(Debug, Clone, Default)]
pub struct DirectorySettings {
	pub users: Vec<UserEntry>,
	/// Streams whose chat is official (writable by registered viewers).
	pub official_channels: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserEntry {
	pub uid: String,
	pub login: String,
	pub credential: String,
	#[serde(default)]
	pub devices: Vec<String>,
	#[serde(default)]
	pub channels: Vec<ChannelEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelEntry {
	pub id: String,
	pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	bind_address: Option<String>,
	ping_timeout_clients: Option<u64>,
	reread_cache_timeout: Option<u64>,
	bandwidth_host: Option<String>,

	#[serde(default)]
	bus: FileBusSettings,

	#[serde(default)]
	directory: FileDirectorySettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBusSettings {
	address: Option<String>,
	channel_in: Option<String>,
	channel_out: Option<String>,
	channel_clients_state: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileDirectorySettings {
	#[serde(default)]
	users: Vec<UserEntry>,

	#[serde(default)]
	official_channels: Vec<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerConfig::default();

		Self {
			bind_address: file
				.bind_address
				.filter(|s| !s.trim().is_empty())
				.unwrap_or(defaults.bind_address),
			ping_timeout_clients: file
				.ping_timeout_clients
				.filter(|v| *v > 0)
				.map(Duration::from_secs)
				.unwrap_or(defaults.ping_timeout_clients),
			reread_cache_timeout: file
				.reread_cache_timeout
				.filter(|v| *v > 0)
				.map(Duration::from_secs)
				.unwrap_or(defaults.reread_cache_timeout),
			bandwidth_host: file
				.bandwidth_host
				.filter(|s| !s.trim().is_empty())
				.unwrap_or(defaults.bandwidth_host),
			bus: BusSettings {
				address: file.bus.address.filter(|s| !s.trim().is_empty()),
				channel_in: file
					.bus
					.channel_in
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(defaults.bus.channel_in),
				channel_out: file
					.bus
					.channel_out
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(defaults.bus.channel_out),
				channel_clients_state: file
					.bus
					.channel_clients_state
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(defaults.bus.channel_clients_state),
			},
			directory: DirectorySettings {
				users: file.directory.users,
				official_channels: file.directory.official_channels,
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
	if let Ok(v) = std::env::var("STREAMGATE_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.bind_address = v;
			info!("server config: bind_address overridden by env");
		}
	}

	if let Ok(v) = std::env::var("STREAMGATE_PING_TIMEOUT_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.ping_timeout_clients = Duration::from_secs(secs);
		info!(secs, "server config: ping_timeout_clients overridden by env");
	}

	if let Ok(v) = std::env::var("STREAMGATE_REREAD_CACHE_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.reread_cache_timeout = Duration::from_secs(secs);
		info!(secs, "server config: reread_cache_timeout overridden by env");
	}

	if let Ok(v) = std::env::var("STREAMGATE_BANDWIDTH_HOST") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.bandwidth_host = v;
			info!("server config: bandwidth_host overridden by env");
		}
	}
}
