//! Node configuration
//!
//! The configuration follows a priority chain:
//! 1. Built-in defaults (Config::default())
//! 2. Config file (~/.decrep/config.json5)
//! 3. Environment variables (DECREP_* prefix)
//! 4. CLI flags (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::SyncError;

/// Default UDP port for presence announcements
pub const DEFAULT_DISCOVERY_PORT: u16 = 1488;

/// Default TCP port of the peer command endpoint
pub const DEFAULT_COMMAND_PORT: u16 = 1498;

// ============================================================================
// MAIN CONFIGURATION STRUCT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
	// ========================================================================
	// IDENTITY & STATE
	// ========================================================================
	/// Local identity used for commands originating on this node
	pub username: String,

	/// Record database and received blobs live here (~/.decrep)
	pub data_dir: PathBuf,

	// ========================================================================
	// PEER ENDPOINT
	// ========================================================================
	/// Address the command server binds to
	pub bind_addr: IpAddr,

	/// Port of the command server, announced to peers
	pub command_port: u16,

	/// Peers known without discovery
	pub static_peers: Vec<SocketAddr>,

	/// Fetch a snapshot from the first reachable peer when the store is empty
	pub bootstrap: bool,

	// ========================================================================
	// SUBSYSTEMS
	// ========================================================================
	pub discovery: DiscoveryConfig,

	pub propagation: PropagationConfig,

	// ========================================================================
	// OUTPUT
	// ========================================================================
	/// Log filter used when RUST_LOG is not set
	pub log_level: String,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			username: std::env::var("USER").unwrap_or_else(|_| "decrep".to_string()),
			data_dir: std::env::var("HOME")
				.ok()
				.map(|h| PathBuf::from(h).join(".decrep"))
				.unwrap_or_else(|| PathBuf::from(".decrep")),
			bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
			command_port: DEFAULT_COMMAND_PORT,
			static_peers: vec![],
			bootstrap: true,
			discovery: DiscoveryConfig::default(),
			propagation: PropagationConfig::default(),
			log_level: "info".to_string(),
		}
	}
}

impl Config {
	/// Default config file location
	pub fn default_path() -> PathBuf {
		Config::default().data_dir.join("config.json5")
	}

	/// Defaults overlaid with `path` (if it exists) and the environment
	pub fn load(path: Option<&Path>) -> Result<Config, SyncError> {
		let path = path.map(Path::to_path_buf).unwrap_or_else(Config::default_path);
		let mut config = if path.exists() {
			let contents = std::fs::read_to_string(&path)?;
			Config::from_json5(&contents).map_err(|e| SyncError::InvalidConfig {
				message: format!("{}: {}", path.display(), e),
			})?
		} else {
			Config::default()
		};
		config.apply_env(|key| std::env::var(key).ok())?;
		config.validate()?;
		Ok(config)
	}

	pub fn from_json5(contents: &str) -> Result<Config, json5::Error> {
		json5::from_str(contents)
	}

	/// Apply `DECREP_*` overrides; `lookup` abstracts the environment
	pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), SyncError>
	where
		F: Fn(&str) -> Option<String>,
	{
		fn parsed<T: std::str::FromStr>(key: &str, value: String) -> Result<T, SyncError> {
			value.parse().map_err(|_| SyncError::InvalidConfig {
				message: format!("{}={:?} is not valid", key, value),
			})
		}

		if let Some(v) = lookup("DECREP_USERNAME") {
			self.username = v;
		}
		if let Some(v) = lookup("DECREP_DATA_DIR") {
			self.data_dir = PathBuf::from(v);
		}
		if let Some(v) = lookup("DECREP_COMMAND_PORT") {
			self.command_port = parsed("DECREP_COMMAND_PORT", v)?;
		}
		if let Some(v) = lookup("DECREP_DISCOVERY_PORT") {
			self.discovery.port = parsed("DECREP_DISCOVERY_PORT", v)?;
		}
		if let Some(v) = lookup("DECREP_PEERS") {
			self.static_peers = v
				.split(',')
				.map(str::trim)
				.filter(|s| !s.is_empty())
				.map(|s| parsed("DECREP_PEERS", s.to_string()))
				.collect::<Result<_, _>>()?;
		}
		if let Some(v) = lookup("DECREP_MAX_RETRIES") {
			self.propagation.max_retries = parsed("DECREP_MAX_RETRIES", v)?;
		}
		if let Some(v) = lookup("DECREP_LOG") {
			self.log_level = v;
		}
		Ok(())
	}

	pub fn validate(&self) -> Result<(), SyncError> {
		let invalid = |message: String| Err(SyncError::InvalidConfig { message });

		if self.username.is_empty() || self.username.contains('/') || self.username.contains('"') {
			return invalid(format!("username {:?} cannot be used on the wire", self.username));
		}
		if self.discovery.enabled && self.discovery.port != 0 && self.discovery.port == self.command_port {
			return invalid(format!("discovery and command ports are both {}", self.command_port));
		}
		if self.discovery.interval_ms == 0 {
			return invalid("discovery.intervalMs must be greater than 0".to_string());
		}
		if let Some(timeout) = self.discovery.peer_timeout_secs {
			if timeout * 1000 < self.discovery.interval_ms * 2 {
				return invalid(format!(
					"discovery.peerTimeoutSecs ({}) must cover at least two announce intervals",
					timeout
				));
			}
		}
		if self.propagation.max_retries > 100 {
			return invalid(format!("Retry count too high: {}", self.propagation.max_retries));
		}
		if self.propagation.connect_timeout_ms == 0 {
			return invalid("propagation.connectTimeoutMs must be greater than 0".to_string());
		}
		Ok(())
	}

	/// Location of the record database
	pub fn database_path(&self) -> PathBuf {
		self.data_dir.join("records.redb")
	}

	/// Directory for content blobs received from peers
	pub fn blob_dir(&self) -> PathBuf {
		self.data_dir.join("blobs")
	}
}

// ============================================================================
// SUBSYSTEM CONFIGURATION
// ============================================================================

/// Presence announcement settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DiscoveryConfig {
	pub enabled: bool,

	/// UDP port the listener binds
	pub port: u16,

	pub bind_addr: IpAddr,

	/// Announce period in milliseconds
	pub interval_ms: u64,

	/// Where announcements are sent
	pub announce_targets: Vec<SocketAddr>,

	/// Forget peers not heard from for this long. `None` keeps them forever.
	pub peer_timeout_secs: Option<u64>,
}

impl Default for DiscoveryConfig {
	fn default() -> Self {
		DiscoveryConfig {
			enabled: true,
			port: DEFAULT_DISCOVERY_PORT,
			bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
			interval_ms: 1000,
			announce_targets: vec![SocketAddr::new(
				IpAddr::V4(Ipv4Addr::BROADCAST),
				DEFAULT_DISCOVERY_PORT,
			)],
			peer_timeout_secs: None,
		}
	}
}

impl DiscoveryConfig {
	pub fn interval(&self) -> Duration {
		Duration::from_millis(self.interval_ms)
	}

	pub fn peer_timeout(&self) -> Option<Duration> {
		self.peer_timeout_secs.map(Duration::from_secs)
	}
}

/// Fan-out settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PropagationConfig {
	/// Retries after the first failed delivery
	pub max_retries: u32,

	/// Fixed delay between attempts in milliseconds
	pub retry_delay_ms: u64,

	/// Connect and response timeout in milliseconds
	pub connect_timeout_ms: u64,

	/// Push file content to peers before the command that references it
	pub push_content: bool,
}

impl Default for PropagationConfig {
	fn default() -> Self {
		PropagationConfig { max_retries: 3, retry_delay_ms: 500, connect_timeout_ms: 2000, push_content: true }
	}
}

impl PropagationConfig {
	pub fn retry_delay(&self) -> Duration {
		Duration::from_millis(self.retry_delay_ms)
	}

	pub fn connect_timeout(&self) -> Duration {
		Duration::from_millis(self.connect_timeout_ms)
	}
}


// vim: ts=4
