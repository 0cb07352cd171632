//! Apply locally, then fan out
//!
//! A command issued on this node is parsed, applied through the
//! [`SyncEngine`] and, only if that succeeded, relayed to every peer known at
//! that moment. Each peer gets its own delivery task; a slow or dead peer
//! never holds up the others or the local operation. Deliveries are retried
//! a bounded number of times and then abandoned.
//!
//! Commands received from peers go through [`ChangePropagator::handle_remote`]
//! and are never relayed again.
//!
//! Local copies added through this node are kept in a [`WatchedPaths`] set.
//! Raw filesystem events fed to [`ChangePropagator::observe`] that touch one
//! of them become commands issued as the local user.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::command::Command;
use crate::config::PropagationConfig;
use crate::content::verify_blob;
use crate::discovery::PeerSource;
use crate::engine::{Applied, SyncEngine};
use crate::error::{SyncError, TransportError, TreeError};
use crate::logging::*;
use crate::store::StoreSnapshot;
use crate::transport::{BlobStore, PeerService, PeerTransport, MAX_BLOB_BYTES};
use crate::tree::split_full_path;
use crate::watcher::{FsEvent, LocalChange, WatchedPaths};

/// How a single delivery ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
	Delivered { peer: SocketAddr, attempts: u32 },

	/// The peer answered with an error; retrying would not help
	Rejected { peer: SocketAddr, message: String },

	/// Gave up after `attempts` tries
	Abandoned { peer: SocketAddr, attempts: u32, error: String },
}

impl DeliveryOutcome {
	pub fn peer(&self) -> SocketAddr {
		match self {
			DeliveryOutcome::Delivered { peer, .. }
			| DeliveryOutcome::Rejected { peer, .. }
			| DeliveryOutcome::Abandoned { peer, .. } => *peer,
		}
	}

	pub fn is_delivered(&self) -> bool {
		matches!(self, DeliveryOutcome::Delivered { .. })
	}
}

/// A locally applied command and its in-flight deliveries
///
/// Dropping this detaches the delivery tasks; they keep running.
#[derive(Debug)]
pub struct Propagation {
	pub applied: Applied,
	deliveries: Vec<JoinHandle<DeliveryOutcome>>,
}

impl Propagation {
	/// Number of delivery tasks started (peers × relay commands)
	pub fn delivery_count(&self) -> usize {
		self.deliveries.len()
	}

	/// Wait for every delivery to finish
	pub async fn wait(self) -> Vec<DeliveryOutcome> {
		futures::future::join_all(self.deliveries)
			.await
			.into_iter()
			.filter_map(|joined| match joined {
				Ok(outcome) => Some(outcome),
				Err(e) => {
					warn!("Delivery task failed: {}", e);
					None
				}
			})
			.collect()
	}
}

/// Content pushed ahead of the command that references it
#[derive(Clone)]
struct OutgoingBlob {
	hash: String,
	data: Arc<Vec<u8>>,
}

pub struct ChangePropagator {
	engine: Arc<SyncEngine>,
	peers: Arc<dyn PeerSource>,
	transport: Arc<dyn PeerTransport>,
	blobs: BlobStore,
	config: PropagationConfig,
	watched: Mutex<WatchedPaths>,
}

impl ChangePropagator {
	pub fn new(
		engine: Arc<SyncEngine>,
		peers: Arc<dyn PeerSource>,
		transport: Arc<dyn PeerTransport>,
		blobs: BlobStore,
		config: PropagationConfig,
	) -> Self {
		ChangePropagator { engine, peers, transport, blobs, config, watched: Mutex::new(WatchedPaths::new()) }
	}

	pub fn engine(&self) -> &Arc<SyncEngine> {
		&self.engine
	}

	/// Parse, apply and relay one wire line. A line that fails to parse or
	/// apply contacts no peer.
	pub async fn submit(&self, line: &str) -> Result<Propagation, SyncError> {
		let command = Command::parse(line).map_err(|e| {
			warn!("Cannot parse {:?}: {}", line, e);
			SyncError::from(e)
		})?;
		self.submit_command(command).await
	}

	pub async fn submit_command(&self, command: Command) -> Result<Propagation, SyncError> {
		let applied = self.engine.apply(&command).await.map_err(|e| {
			warn!("{} failed locally: {}", command, e);
			e
		})?;
		self.track(&command, &applied).await;

		let peers = self.peers.peers().await;
		let mut deliveries = Vec::with_capacity(peers.len() * applied.relay.len());
		for relay in &applied.relay {
			let line = relay.to_wire();
			let blob = self.outgoing_blob(relay).await;
			for &peer in &peers {
				deliveries.push(tokio::spawn(deliver(
					self.transport.clone(),
					peer,
					line.clone(),
					blob.clone(),
					self.config.clone(),
				)));
			}
		}
		debug!("{} applied, {} deliveries started", command, deliveries.len());
		Ok(Propagation { applied, deliveries })
	}

	/// Translate a local filesystem change and submit each resulting command.
	/// A failing command does not stop the ones after it.
	pub async fn on_local_change(&self, change: &LocalChange) -> Result<Vec<Propagation>, SyncError> {
		let username = self
			.engine
			.local_username()
			.await
			.ok_or_else(|| SyncError::Other { message: "No local user registered".to_string() })?;

		let mut propagations = Vec::new();
		for command in change.to_commands(&username) {
			match self.submit_command(command).await {
				Ok(propagation) => propagations.push(propagation),
				Err(e) => debug!("Local change not applied: {}", e),
			}
		}
		Ok(propagations)
	}

	/// Feed one raw filesystem event. Events about tracked local copies are
	/// applied and relayed like any local command.
	pub async fn observe(&self, event: FsEvent) -> Result<Vec<Propagation>, SyncError> {
		let change = self.watched.lock().await.observe(event);
		match change {
			Some(change) => self.on_local_change(&change).await,
			None => Ok(Vec::new()),
		}
	}

	/// Watch every local copy the store records for this node's user
	pub async fn watch_local_copies(&self) -> usize {
		let paths = self.engine.local_paths().await;
		let mut watched = self.watched.lock().await;
		for path in &paths {
			watched.watch_file(Path::new(path));
		}
		paths.len()
	}

	pub async fn is_watched(&self, path: &Path) -> bool {
		self.watched.lock().await.is_watched(path)
	}

	/// Keep the watched set in step with an applied local command
	async fn track(&self, command: &Command, applied: &Applied) {
		let local = self.engine.local_username().await;
		if local.is_none() || command.username() != local.as_deref() {
			return;
		}
		let mut watched = self.watched.lock().await;
		match command {
			Command::AddFile { local_path, .. } => watched.watch_file(Path::new(local_path)),
			Command::AddFolder { local_folder, .. } => {
				let root = Path::new(local_folder);
				watched.watch_dir(root);
				for relay in &applied.relay {
					if let Command::AddFile { local_path, .. } = relay {
						let path = Path::new(local_path);
						watched.watch_file(path);
						for dir in path.ancestors().skip(1).take_while(|d| *d != root && d.starts_with(root)) {
							watched.watch_dir(dir);
						}
					}
				}
			}
			Command::DeleteLocalFile { local_path, .. } => {
				watched.observe(FsEvent::Removed(local_path.into()));
			}
			Command::UpdateLocalFilePath { old_local_path, new_local_path, .. } => {
				watched.observe(FsEvent::Renamed { from: old_local_path.into(), to: new_local_path.into() });
			}
			Command::UpdateLocalFolderPath { old_local_dir, new_local_dir, .. } => {
				watched.observe(FsEvent::Renamed { from: old_local_dir.into(), to: new_local_dir.into() });
			}
			_ => {}
		}
	}

	/// Apply a command received from a peer, see [`SyncEngine::apply_remote`]
	pub async fn handle_remote(&self, line: &str) -> Result<Applied, SyncError> {
		let command = Command::parse(line)?;
		let applied = self.engine.apply_remote(&command).await?;
		debug!("Applied remote {}", command);
		Ok(applied)
	}

	/// Fetch the content of `full_repo_path` from `peer`, write it to
	/// `local_path` and track it as a copy owned by the local user
	pub async fn download(
		&self,
		peer: SocketAddr,
		full_repo_path: &str,
		local_path: &Path,
	) -> Result<Propagation, SyncError> {
		let not_found = || SyncError::Tree(TreeError::NotFound { path: full_repo_path.to_string() });
		let content = self.engine.content_at(full_repo_path).await.ok_or_else(not_found)?;
		let (repo_dir, _) = split_full_path(full_repo_path).ok_or_else(not_found)?;
		let username = self
			.engine
			.local_username()
			.await
			.ok_or_else(|| SyncError::Other { message: "No local user registered".to_string() })?;

		let data = self.transport.fetch_blob(peer, &content.hash).await?;
		verify_blob(&data, &content.hash)?;

		if let Some(parent) = local_path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		tokio::fs::write(local_path, &data).await?;
		info!("Downloaded {} from {} to {}", full_repo_path, peer, local_path.display());

		self.submit_command(Command::AddFile {
			local_path: local_path.to_string_lossy().into_owned(),
			repo_dir,
			username,
			content: Some(content),
		})
		.await
	}

	/// Bytes to push before `command`, when it references content we hold
	async fn outgoing_blob(&self, command: &Command) -> Option<OutgoingBlob> {
		if !self.config.push_content {
			return None;
		}
		let content = command.content()?;
		if content.size > MAX_BLOB_BYTES as u64 {
			debug!("Not pushing {}: {} bytes is over the transfer limit", content.hash, content.size);
			return None;
		}
		let local_path = match command {
			Command::AddFile { local_path, .. } | Command::UpdateFileContent { local_path, .. } => local_path,
			_ => return None,
		};

		let data = match tokio::fs::read(local_path).await {
			Ok(data) => data,
			Err(e) => match self.blobs.get(&content.hash).await {
				Some(data) => data,
				None => {
					debug!("Not pushing {}: {}", local_path, e);
					return None;
				}
			},
		};
		if let Err(e) = verify_blob(&data, &content.hash) {
			warn!("{} changed since it was fingerprinted, not pushing: {}", local_path, e);
			return None;
		}
		Some(OutgoingBlob { hash: content.hash.clone(), data: Arc::new(data) })
	}
}

/// One delivery with bounded retries
async fn deliver(
	transport: Arc<dyn PeerTransport>,
	peer: SocketAddr,
	line: String,
	blob: Option<OutgoingBlob>,
	config: PropagationConfig,
) -> DeliveryOutcome {
	let mut attempts = 0u32;
	let mut pushed = false;
	loop {
		attempts += 1;
		let result = async {
			if let (Some(blob), false) = (&blob, pushed) {
				transport.push_blob(peer, &blob.hash, &blob.data).await?;
				pushed = true;
			}
			transport.deliver(peer, &line).await
		}
		.await;

		match result {
			Ok(()) => {
				debug!("Delivered {} to {} (attempt {})", line, peer, attempts);
				return DeliveryOutcome::Delivered { peer, attempts };
			}
			Err(TransportError::Rejected { message, .. }) => {
				warn!("Peer {} rejected {}: {}", peer, line, message);
				return DeliveryOutcome::Rejected { peer, message };
			}
			Err(e) if e.is_transient() && attempts <= config.max_retries => {
				debug!("Delivery of {} to {} failed (attempt {}): {}", line, peer, attempts, e);
				tokio::time::sleep(config.retry_delay()).await;
			}
			Err(e) => {
				warn!("Giving up on {} for {} after {} attempts: {}", peer, line, attempts, e);
				return DeliveryOutcome::Abandoned { peer, attempts, error: e.to_string() };
			}
		}
	}
}

#[async_trait]
impl PeerService for ChangePropagator {
	async fn execute(&self, line: &str) -> Result<(), SyncError> {
		self.handle_remote(line).await.map(|_| ())
	}

	async fn read_blob(&self, hash: &str) -> Result<Option<Vec<u8>>, SyncError> {
		if let Some(data) = self.blobs.get(hash).await {
			return Ok(Some(data));
		}
		let path = match self.engine.local_copy_of(hash).await {
			Some(path) => path,
			None => return Ok(None),
		};
		let data = match tokio::fs::read(&path).await {
			Ok(data) => data,
			Err(e) => {
				warn!("Local copy {} of {} is unreadable: {}", path, hash, e);
				return Ok(None);
			}
		};
		if verify_blob(&data, hash).is_err() {
			warn!("Local copy {} no longer matches {}", path, hash);
			return Ok(None);
		}
		Ok(Some(data))
	}

	async fn store_blob(&self, hash: &str, data: Vec<u8>) -> Result<(), SyncError> {
		self.blobs.put(hash, &data).await?;
		Ok(())
	}

	async fn snapshot(&self) -> StoreSnapshot {
		self.engine.snapshot().await
	}
}


// vim: ts=4
