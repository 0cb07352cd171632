//! A running DecRep node
//!
//! Wires the pieces together: the redb record store under the data
//! directory, the sync engine, the peer command server, UDP discovery and
//! the change propagator. On first start with an empty store the node copies
//! the records of the first peer that answers a snapshot request.
//!
//! Filesystem events from whatever watcher backend the host uses are sent
//! into [`Node::fs_events`] and applied one at a time.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Config;
use crate::discovery::{PeerDiscovery, PeerSource};
use crate::engine::SyncEngine;
use crate::error::SyncError;
use crate::logging::*;
use crate::propagator::ChangePropagator;
use crate::store::RedbRecordStore;
use crate::transport::{BlobStore, PeerServer, TcpPeerClient};
use crate::watcher::FsEvent;

const FS_EVENT_QUEUE: usize = 256;

pub struct Node {
	node_id: Uuid,
	command_addr: SocketAddr,
	propagator: Arc<ChangePropagator>,
	discovery: Option<Arc<PeerDiscovery>>,
	fs_events: mpsc::Sender<FsEvent>,
	stop_tx: watch::Sender<bool>,
	tasks: Vec<JoinHandle<()>>,
}

impl Node {
	/// Open the store, bind the endpoints and start background tasks
	pub async fn start(config: Config) -> Result<Node, SyncError> {
		config.validate()?;
		let node_id = Uuid::new_v4();

		let store = RedbRecordStore::open(&config.database_path())?;
		let engine = Arc::new(SyncEngine::new(Box::new(store))?);
		engine.register_local_user(&config.username).await?;

		let server_addr = SocketAddr::new(config.bind_addr, config.command_port);
		let listener = tokio::net::TcpListener::bind(server_addr).await?;
		let command_addr = listener.local_addr()?;

		let (discovery, peers): (Option<Arc<PeerDiscovery>>, Arc<dyn PeerSource>) = if config.discovery.enabled {
			let discovery = Arc::new(PeerDiscovery::start(node_id, command_addr.port(), &config.discovery).await?);
			for peer in &config.static_peers {
				discovery.add_peer(*peer).await;
			}
			let source: Arc<dyn PeerSource> = discovery.clone();
			(Some(discovery), source)
		} else {
			let source: Arc<dyn PeerSource> = Arc::new(config.static_peers.clone());
			(None, source)
		};

		let client = TcpPeerClient::new(config.propagation.connect_timeout());
		let propagator = Arc::new(ChangePropagator::new(
			engine.clone(),
			peers.clone(),
			Arc::new(client.clone()),
			BlobStore::new(&config.blob_dir()),
			config.propagation.clone(),
		));

		let watching = propagator.watch_local_copies().await;
		debug!("Watching {} local copies", watching);

		let server = PeerServer::from_listener(listener, propagator.clone());
		let (stop_tx, stop_rx) = watch::channel(false);
		let (fs_events, events_rx) = mpsc::channel(FS_EVENT_QUEUE);
		let tasks = vec![
			tokio::spawn(server.serve(stop_rx.clone())),
			tokio::spawn(feed_fs_events(propagator.clone(), events_rx, stop_rx)),
		];

		if config.bootstrap && engine.inspect(|tree, _| tree.file_count() == 0).await {
			bootstrap(&engine, &client, &peers.peers().await).await;
		}

		info!("Node {} up as {} on {}", node_id, config.username, command_addr);
		Ok(Node { node_id, command_addr, propagator, discovery, fs_events, stop_tx, tasks })
	}

	pub fn node_id(&self) -> Uuid {
		self.node_id
	}

	/// Address peers reach the command server on
	pub fn command_addr(&self) -> SocketAddr {
		self.command_addr
	}

	pub fn propagator(&self) -> &Arc<ChangePropagator> {
		&self.propagator
	}

	pub fn engine(&self) -> &Arc<SyncEngine> {
		self.propagator.engine()
	}

	pub fn discovery(&self) -> Option<&Arc<PeerDiscovery>> {
		self.discovery.as_ref()
	}

	/// Sink for raw filesystem events. Events about files this node's user
	/// did not add are ignored.
	pub fn fs_events(&self) -> mpsc::Sender<FsEvent> {
		self.fs_events.clone()
	}

	/// Stop discovery, the command server and the event feed. In-flight
	/// deliveries are abandoned.
	pub async fn shutdown(self) {
		let _ = self.stop_tx.send(true);
		if let Some(discovery) = &self.discovery {
			discovery.stop().await;
		}
		for task in self.tasks {
			if let Err(e) = task.await {
				warn!("Node task ended abnormally: {}", e);
			}
		}
		info!("Node {} stopped", self.node_id);
	}
}

/// Apply filesystem events in arrival order until stopped
async fn feed_fs_events(
	propagator: Arc<ChangePropagator>,
	mut events: mpsc::Receiver<FsEvent>,
	mut stop_rx: watch::Receiver<bool>,
) {
	loop {
		let event = tokio::select! {
			changed = stop_rx.changed() => {
				if changed.is_err() || *stop_rx.borrow() {
					break;
				}
				continue;
			}
			event = events.recv() => match event {
				Some(event) => event,
				None => break,
			},
		};
		if let Err(e) = propagator.observe(event).await {
			warn!("Filesystem event not applied: {}", e);
		}
	}
	debug!("Filesystem event feed stopped");
}

/// Copy the records of the first peer that hands out a snapshot
async fn bootstrap(engine: &SyncEngine, client: &TcpPeerClient, peers: &[SocketAddr]) {
	for &peer in peers {
		match client.fetch_snapshot(peer).await {
			Ok(snapshot) => match engine.import_snapshot(&snapshot).await {
				Ok(imported) => {
					info!("Bootstrapped {} records from {}", imported, peer);
					return;
				}
				Err(e) => warn!("Cannot import snapshot from {}: {}", peer, e),
			},
			Err(e) => debug!("No snapshot from {}: {}", peer, e),
		}
	}
}

// vim: ts=4
