//! Helpers shared by the node-level tests

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

use decrep::config::{Config, DiscoveryConfig, PropagationConfig};

pub fn localhost(port: u16) -> SocketAddr {
	SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

/// A TCP port nobody listens on right now
pub fn free_tcp_port() -> u16 {
	let listener = std::net::TcpListener::bind(localhost(0)).expect("bind ephemeral listener");
	listener.local_addr().expect("ephemeral address").port()
}

pub fn free_udp_port() -> u16 {
	let socket = std::net::UdpSocket::bind(localhost(0)).expect("bind ephemeral socket");
	socket.local_addr().expect("ephemeral address").port()
}

/// Loopback node without discovery and with fast retries
pub fn node_config(root: &Path, username: &str, command_port: u16, peers: Vec<SocketAddr>) -> Config {
	Config {
		username: username.to_string(),
		data_dir: root.join(username),
		bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
		command_port,
		static_peers: peers,
		bootstrap: false,
		discovery: DiscoveryConfig { enabled: false, ..DiscoveryConfig::default() },
		propagation: PropagationConfig {
			max_retries: 2,
			retry_delay_ms: 20,
			connect_timeout_ms: 1000,
			push_content: true,
		},
		log_level: "warn".to_string(),
	}
}

/// `add_file` wire line for a local file
pub fn add_file_line(local: &Path, repo_dir: &str, username: &str) -> String {
	format!("add_file/\"{}\"/\"{}\"/{}", local.display(), repo_dir, username)
}

// vim: ts=4
