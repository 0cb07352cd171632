//! Peer discovery over UDP
//!
//! Every node periodically sends `DEC REP HERE <node-id> <command-port>` to
//! its announce targets (by default the broadcast address) and listens for
//! the same message from others. The sender's IP plus the announced port
//! becomes a peer address. Announcements carrying our own node id are
//! ignored, so a node never lists itself even when it hears its own
//! broadcast.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::DiscoveryConfig;
use crate::error::SyncError;
use crate::logging::*;

const ANNOUNCE_PREFIX: &str = "DEC REP HERE";

/// Largest datagram we bother reading
const MAX_DATAGRAM: usize = 512;

/// Presence message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Announcement {
	pub node_id: Uuid,
	pub command_port: u16,
}

impl Announcement {
	pub fn encode(&self) -> String {
		format!("{} {} {}\n", ANNOUNCE_PREFIX, self.node_id, self.command_port)
	}

	pub fn parse(datagram: &[u8]) -> Option<Announcement> {
		let text = std::str::from_utf8(datagram).ok()?;
		let rest = text.trim_end().strip_prefix(ANNOUNCE_PREFIX)?;
		let mut fields = rest.split_whitespace();
		let node_id = fields.next()?.parse().ok()?;
		let command_port = fields.next()?.parse().ok()?;
		if fields.next().is_some() {
			return None;
		}
		Some(Announcement { node_id, command_port })
	}
}

/// Anything that can tell who the current peers are
#[async_trait]
pub trait PeerSource: Send + Sync {
	async fn peers(&self) -> Vec<SocketAddr>;
}

/// A fixed peer list
#[async_trait]
impl PeerSource for Vec<SocketAddr> {
	async fn peers(&self) -> Vec<SocketAddr> {
		self.clone()
	}
}

#[derive(Debug, Clone, Copy)]
struct PeerEntry {
	/// `None` for static peers, which never expire
	last_seen: Option<Instant>,
}

type PeerMap = Arc<RwLock<BTreeMap<SocketAddr, PeerEntry>>>;

/// Running discovery service: one speaker task and one listener task
pub struct PeerDiscovery {
	announcement: Announcement,
	local_addr: SocketAddr,
	peers: PeerMap,
	targets: Arc<RwLock<Vec<SocketAddr>>>,
	stop_tx: watch::Sender<bool>,
	tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerDiscovery {
	/// Bind the discovery socket and start announcing
	pub async fn start(
		node_id: Uuid,
		command_port: u16,
		config: &DiscoveryConfig,
	) -> Result<PeerDiscovery, SyncError> {
		let socket = UdpSocket::bind(SocketAddr::new(config.bind_addr, config.port)).await?;
		socket.set_broadcast(true)?;
		let local_addr = socket.local_addr()?;
		let socket = Arc::new(socket);

		let announcement = Announcement { node_id, command_port };
		let peers: PeerMap = Arc::new(RwLock::new(BTreeMap::new()));
		let targets = Arc::new(RwLock::new(config.announce_targets.clone()));
		let (stop_tx, stop_rx) = watch::channel(false);

		let speaker = tokio::spawn(speak(
			socket.clone(),
			announcement,
			targets.clone(),
			peers.clone(),
			config.clone(),
			stop_rx.clone(),
		));
		let listener = tokio::spawn(listen(socket, node_id, peers.clone(), stop_rx));

		info!("Discovery listening on {} (node {})", local_addr, node_id);
		Ok(PeerDiscovery {
			announcement,
			local_addr,
			peers,
			targets,
			stop_tx,
			tasks: Mutex::new(vec![speaker, listener]),
		})
	}

	pub fn node_id(&self) -> Uuid {
		self.announcement.node_id
	}

	/// Address the discovery socket is bound to
	pub fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}

	/// Snapshot of the peer set
	pub async fn peers(&self) -> Vec<SocketAddr> {
		self.peers.read().await.keys().copied().collect()
	}

	/// Register a peer that is known without discovery
	pub async fn add_peer(&self, addr: SocketAddr) {
		self.peers.write().await.insert(addr, PeerEntry { last_seen: None });
	}

	pub async fn remove_peer(&self, addr: &SocketAddr) -> bool {
		self.peers.write().await.remove(addr).is_some()
	}

	/// Also announce to `target` from the next tick on
	pub async fn announce_to(&self, target: SocketAddr) {
		let mut targets = self.targets.write().await;
		if !targets.contains(&target) {
			targets.push(target);
		}
	}

	/// Signal both tasks and wait for them. The socket is released when
	/// this returns.
	pub async fn stop(&self) {
		let _ = self.stop_tx.send(true);
		let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
		for task in tasks {
			if let Err(e) = task.await {
				warn!("Discovery task ended abnormally: {}", e);
			}
		}
		debug!("Discovery on {} stopped", self.local_addr);
	}
}

#[async_trait]
impl PeerSource for PeerDiscovery {
	async fn peers(&self) -> Vec<SocketAddr> {
		PeerDiscovery::peers(self).await
	}
}

impl Drop for PeerDiscovery {
	fn drop(&mut self) {
		let _ = self.stop_tx.send(true);
	}
}

/// Resolves once a stop was requested (or the service is gone)
async fn stopped(stop_rx: &mut watch::Receiver<bool>) {
	while !*stop_rx.borrow() {
		if stop_rx.changed().await.is_err() {
			return;
		}
	}
}

async fn speak(
	socket: Arc<UdpSocket>,
	announcement: Announcement,
	targets: Arc<RwLock<Vec<SocketAddr>>>,
	peers: PeerMap,
	config: DiscoveryConfig,
	mut stop_rx: watch::Receiver<bool>,
) {
	let message = announcement.encode();
	let mut ticker = tokio::time::interval(config.interval());
	ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
	let mut failing = false;

	loop {
		tokio::select! {
			_ = stopped(&mut stop_rx) => break,
			_ = ticker.tick() => {
				let targets = targets.read().await.clone();
				for target in targets {
					match socket.send_to(message.as_bytes(), target).await {
						Ok(_) => failing = false,
						Err(e) if !failing => {
							warn!("Cannot announce to {}: {}", target, e);
							failing = true;
						}
						Err(_) => {}
					}
				}
				if let Some(timeout) = config.peer_timeout() {
					expire(&peers, timeout).await;
				}
			}
		}
	}
}

async fn expire(peers: &PeerMap, timeout: std::time::Duration) {
	let mut peers = peers.write().await;
	peers.retain(|addr, entry| match entry.last_seen {
		Some(seen) if seen.elapsed() > timeout => {
			info!("Peer {} timed out", addr);
			false
		}
		_ => true,
	});
}

/// Note an announcement from `peer`; true when the peer is new. Static
/// entries stay static.
fn record_sighting(peers: &mut BTreeMap<SocketAddr, PeerEntry>, peer: SocketAddr, now: Instant) -> bool {
	match peers.get_mut(&peer) {
		Some(PeerEntry { last_seen: Some(seen) }) => {
			*seen = now;
			false
		}
		Some(PeerEntry { last_seen: None }) => false,
		None => {
			peers.insert(peer, PeerEntry { last_seen: Some(now) });
			true
		}
	}
}

async fn listen(socket: Arc<UdpSocket>, own_id: Uuid, peers: PeerMap, mut stop_rx: watch::Receiver<bool>) {
	let mut buf = [0u8; MAX_DATAGRAM];
	loop {
		tokio::select! {
			_ = stopped(&mut stop_rx) => break,
			received = socket.recv_from(&mut buf) => {
				let (len, from) = match received {
					Ok(received) => received,
					Err(e) => {
						debug!("Discovery receive failed: {}", e);
						continue;
					}
				};
				let announcement = match Announcement::parse(&buf[..len]) {
					Some(a) if a.node_id != own_id => a,
					Some(_) => continue,
					None => {
						debug!("Ignoring stray datagram from {}", from);
						continue;
					}
				};
				let peer = SocketAddr::new(from.ip(), announcement.command_port);
				if record_sighting(&mut *peers.write().await, peer, Instant::now()) {
					info!("Discovered peer {} (node {})", peer, announcement.node_id);
				}
			}
		}
	}
}


// vim: ts=4
