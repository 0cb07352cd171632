//! Peer-to-peer transport
//!
//! Peers talk over TCP, one JSON object per line, with a `cmd` field naming
//! the message:
//!
//! ```text
//! -> {"cmd":"EXEC","line":"add_user/bob"}
//! <- {"cmd":"OK"}
//! -> {"cmd":"FETCH","hash":"af1349b9..."}
//! <- {"cmd":"BLOB","data":"aGVsbG8="}
//! -> {"cmd":"PUSH","hash":"af1349b9...","data":"aGVsbG8="}
//! -> {"cmd":"SNAPSHOT"}
//! <- {"cmd":"SNAPSHOT","snapshot":{...}}
//! ```
//!
//! Any request may be answered with `{"cmd":"ERR","msg":...}`. The client
//! opens one connection per request.
//!
//! The server reads at most [`MAX_LINE_BYTES`] per request line and drops
//! connections that stay silent for longer than [`IDLE_TIMEOUT`].

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use uuid::Uuid;

use crate::content::verify_blob;
use crate::error::{SyncError, TransportError};
use crate::logging::*;
use crate::store::StoreSnapshot;

/// Largest content pushed to or accepted from a peer
pub const MAX_BLOB_BYTES: usize = 64 * 1024 * 1024;

/// Longest request line the server reads: a base64 blob plus its envelope
pub const MAX_LINE_BYTES: usize = MAX_BLOB_BYTES / 3 * 4 + 4096;

/// Silence after which the server closes a connection
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Request sent to a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum PeerRequest {
	/// Apply a command line
	#[serde(rename = "EXEC")]
	Exec { line: String },

	/// Ask for the content with this fingerprint
	#[serde(rename = "FETCH")]
	Fetch { hash: String },

	/// Offer content ahead of a command that references it
	#[serde(rename = "PUSH")]
	Push { hash: String, data: String },

	/// Ask for the peer's whole record store
	#[serde(rename = "SNAPSHOT")]
	Snapshot,
}

/// Answer to a [`PeerRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum PeerResponse {
	#[serde(rename = "OK")]
	Done,

	#[serde(rename = "ERR")]
	Failed { msg: String },

	#[serde(rename = "BLOB")]
	Blob { data: String },

	#[serde(rename = "SNAPSHOT")]
	Snapshot { snapshot: StoreSnapshot },
}

pub fn encode_blob(data: &[u8]) -> String {
	base64::engine::general_purpose::STANDARD.encode(data)
}

pub fn decode_blob(data: &str) -> Result<Vec<u8>, TransportError> {
	Ok(base64::engine::general_purpose::STANDARD.decode(data)?)
}

// ============================================================================
// CLIENT SIDE
// ============================================================================

/// Sends command lines to peers
#[async_trait]
pub trait CommandTransport: Send + Sync {
	async fn deliver(&self, peer: SocketAddr, line: &str) -> Result<(), TransportError>;
}

/// Moves content blobs between peers
#[async_trait]
pub trait BlobTransfer: Send + Sync {
	/// Fetch and verify the content with fingerprint `hash`
	async fn fetch_blob(&self, peer: SocketAddr, hash: &str) -> Result<Vec<u8>, TransportError>;

	async fn push_blob(&self, peer: SocketAddr, hash: &str, data: &[u8]) -> Result<(), TransportError>;
}

/// Everything the propagator needs from the network
pub trait PeerTransport: CommandTransport + BlobTransfer {}

impl<T: CommandTransport + BlobTransfer> PeerTransport for T {}

/// TCP client, one connection per request
#[derive(Debug, Clone)]
pub struct TcpPeerClient {
	timeout: Duration,
}

impl TcpPeerClient {
	pub fn new(timeout: Duration) -> Self {
		TcpPeerClient { timeout }
	}

	/// Send one request and read one response line
	pub async fn request(
		&self,
		peer: SocketAddr,
		request: &PeerRequest,
	) -> Result<PeerResponse, TransportError> {
		let unreachable = |message: String| TransportError::PeerUnreachable { peer, message };

		let stream = tokio::time::timeout(self.timeout, TcpStream::connect(peer))
			.await
			.map_err(|_| unreachable("connect timed out".to_string()))?
			.map_err(|e| unreachable(e.to_string()))?;
		let (reader, mut writer) = stream.into_split();

		let mut payload = serde_json::to_string(request)?;
		payload.push('\n');
		writer.write_all(payload.as_bytes()).await.map_err(|e| unreachable(e.to_string()))?;
		writer.flush().await.map_err(|e| unreachable(e.to_string()))?;

		let mut reader = BufReader::new(reader);
		let mut line = String::new();
		let n = tokio::time::timeout(self.timeout, reader.read_line(&mut line))
			.await
			.map_err(|_| unreachable("no response".to_string()))?
			.map_err(|e| unreachable(e.to_string()))?;
		if n == 0 {
			return Err(unreachable("connection closed before response".to_string()));
		}

		match serde_json::from_str::<PeerResponse>(line.trim())? {
			PeerResponse::Failed { msg } => Err(TransportError::Rejected { peer, message: msg }),
			response => Ok(response),
		}
	}

	pub async fn fetch_snapshot(&self, peer: SocketAddr) -> Result<StoreSnapshot, TransportError> {
		match self.request(peer, &PeerRequest::Snapshot).await? {
			PeerResponse::Snapshot { snapshot } => Ok(snapshot),
			other => Err(unexpected(&other)),
		}
	}
}

fn unexpected(response: &PeerResponse) -> TransportError {
	TransportError::Protocol { message: format!("Unexpected response: {:?}", response) }
}

#[async_trait]
impl CommandTransport for TcpPeerClient {
	async fn deliver(&self, peer: SocketAddr, line: &str) -> Result<(), TransportError> {
		match self.request(peer, &PeerRequest::Exec { line: line.to_string() }).await? {
			PeerResponse::Done => Ok(()),
			other => Err(unexpected(&other)),
		}
	}
}

#[async_trait]
impl BlobTransfer for TcpPeerClient {
	async fn fetch_blob(&self, peer: SocketAddr, hash: &str) -> Result<Vec<u8>, TransportError> {
		match self.request(peer, &PeerRequest::Fetch { hash: hash.to_string() }).await? {
			PeerResponse::Blob { data } => {
				let data = decode_blob(&data)?;
				verify_blob(&data, hash)?;
				Ok(data)
			}
			other => Err(unexpected(&other)),
		}
	}

	async fn push_blob(&self, peer: SocketAddr, hash: &str, data: &[u8]) -> Result<(), TransportError> {
		let request = PeerRequest::Push { hash: hash.to_string(), data: encode_blob(data) };
		match self.request(peer, &request).await? {
			PeerResponse::Done => Ok(()),
			other => Err(unexpected(&other)),
		}
	}
}

// ============================================================================
// SERVER SIDE
// ============================================================================

/// What a node exposes to its peers
#[async_trait]
pub trait PeerService: Send + Sync {
	/// Apply a command received from a peer
	async fn execute(&self, line: &str) -> Result<(), SyncError>;

	async fn read_blob(&self, hash: &str) -> Result<Option<Vec<u8>>, SyncError>;

	/// Keep verified content received from a peer
	async fn store_blob(&self, hash: &str, data: Vec<u8>) -> Result<(), SyncError>;

	async fn snapshot(&self) -> StoreSnapshot;
}

#[derive(Debug, Clone, Copy)]
struct ConnectionLimits {
	max_line: usize,
	idle_timeout: Duration,
}

/// TCP command endpoint
pub struct PeerServer {
	listener: TcpListener,
	service: Arc<dyn PeerService>,
	limits: ConnectionLimits,
}

impl PeerServer {
	pub async fn bind(addr: SocketAddr, service: Arc<dyn PeerService>) -> Result<PeerServer, SyncError> {
		let listener = TcpListener::bind(addr).await?;
		Ok(Self::from_listener(listener, service))
	}

	/// Serve on an already bound listener
	pub fn from_listener(listener: TcpListener, service: Arc<dyn PeerService>) -> PeerServer {
		let limits = ConnectionLimits { max_line: MAX_LINE_BYTES, idle_timeout: IDLE_TIMEOUT };
		PeerServer { listener, service, limits }
	}

	/// Override the request line limit and the idle timeout
	pub fn with_limits(mut self, max_line: usize, idle_timeout: Duration) -> PeerServer {
		self.limits = ConnectionLimits { max_line, idle_timeout };
		self
	}

	pub fn local_addr(&self) -> Result<SocketAddr, SyncError> {
		Ok(self.listener.local_addr()?)
	}

	/// Accept connections until `stop_rx` turns true
	pub async fn serve(self, mut stop_rx: watch::Receiver<bool>) {
		let addr = self.listener.local_addr().ok();
		info!("Accepting peer commands on {:?}", addr);
		loop {
			tokio::select! {
				changed = stop_rx.changed() => {
					if changed.is_err() || *stop_rx.borrow() {
						break;
					}
				}
				accepted = self.listener.accept() => match accepted {
					Ok((stream, from)) => {
						let service = self.service.clone();
						let limits = self.limits;
						tokio::spawn(async move {
							if let Err(e) = handle_connection(stream, service, limits).await {
								debug!("Connection from {} ended: {}", from, e);
							}
						});
					}
					Err(e) => warn!("Accept failed: {}", e),
				},
			}
		}
		debug!("Peer server on {:?} stopped", addr);
	}
}

async fn handle_connection(
	stream: TcpStream,
	service: Arc<dyn PeerService>,
	limits: ConnectionLimits,
) -> Result<(), TransportError> {
	let (reader, mut writer) = stream.into_split();
	let mut reader = BufReader::new(reader);
	let mut line = String::new();

	loop {
		line.clear();
		let mut limited = (&mut reader).take(limits.max_line as u64 + 1);
		let n = match tokio::time::timeout(limits.idle_timeout, limited.read_line(&mut line)).await {
			Ok(n) => n?,
			Err(_) => {
				debug!("Closing idle connection");
				break;
			}
		};
		if n == 0 {
			break; // EOF
		}
		if n > limits.max_line && !line.ends_with('\n') {
			let msg = format!("Request longer than {} bytes", limits.max_line);
			reply(&mut writer, &PeerResponse::Failed { msg: msg.clone() }).await?;
			return Err(TransportError::Protocol { message: msg });
		}
		let trimmed = line.trim();
		if trimmed.is_empty() {
			continue;
		}

		let response = match serde_json::from_str::<PeerRequest>(trimmed) {
			Ok(request) => answer(service.as_ref(), request).await,
			Err(e) => PeerResponse::Failed { msg: format!("Bad request: {}", e) },
		};
		reply(&mut writer, &response).await?;
	}
	Ok(())
}

async fn reply(writer: &mut OwnedWriteHalf, response: &PeerResponse) -> Result<(), TransportError> {
	let mut payload = serde_json::to_string(response)?;
	payload.push('\n');
	writer.write_all(payload.as_bytes()).await?;
	writer.flush().await?;
	Ok(())
}

async fn answer(service: &dyn PeerService, request: PeerRequest) -> PeerResponse {
	let failed = |e: SyncError| PeerResponse::Failed { msg: e.to_string() };
	match request {
		PeerRequest::Exec { line } => match service.execute(&line).await {
			Ok(()) => PeerResponse::Done,
			Err(e) => {
				warn!("Peer command {} failed: {}", line, e);
				failed(e)
			}
		},
		PeerRequest::Fetch { hash } => match service.read_blob(&hash).await {
			Ok(Some(data)) => PeerResponse::Blob { data: encode_blob(&data) },
			Ok(None) => PeerResponse::Failed { msg: format!("No content for {}", hash) },
			Err(e) => failed(e),
		},
		PeerRequest::Push { hash, data } => {
			let data = match decode_blob(&data) {
				Ok(data) => data,
				Err(e) => return failed(e.into()),
			};
			match service.store_blob(&hash, data).await {
				Ok(()) => PeerResponse::Done,
				Err(e) => failed(e),
			}
		}
		PeerRequest::Snapshot => PeerResponse::Snapshot { snapshot: service.snapshot().await },
	}
}

// ============================================================================
// BLOB STORAGE
// ============================================================================

/// Content received from peers, one file per fingerprint
#[derive(Debug, Clone)]
pub struct BlobStore {
	dir: PathBuf,
}

impl BlobStore {
	pub fn new(dir: &Path) -> Self {
		BlobStore { dir: dir.to_path_buf() }
	}

	pub fn path_of(&self, hash: &str) -> Option<PathBuf> {
		if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
			return None;
		}
		Some(self.dir.join(hash.to_ascii_lowercase()))
	}

	/// Verify and store; the file appears atomically under its final name.
	/// Concurrent puts of the same content each write their own temp file.
	pub async fn put(&self, hash: &str, data: &[u8]) -> Result<PathBuf, TransportError> {
		verify_blob(data, hash)?;
		let path = self
			.path_of(hash)
			.ok_or_else(|| TransportError::Protocol { message: format!("Bad hash {:?}", hash) })?;
		if tokio::fs::try_exists(&path).await.unwrap_or(false) {
			return Ok(path);
		}
		tokio::fs::create_dir_all(&self.dir).await?;
		let tmp = self.dir.join(format!("{}.{}.part", hash.to_ascii_lowercase(), Uuid::new_v4()));
		tokio::fs::write(&tmp, data).await?;
		if let Err(e) = tokio::fs::rename(&tmp, &path).await {
			let _ = tokio::fs::remove_file(&tmp).await;
			return Err(e.into());
		}
		Ok(path)
	}

	/// Stored content for `hash`. A file that no longer matches its name is
	/// removed and reported as missing.
	pub async fn get(&self, hash: &str) -> Option<Vec<u8>> {
		let path = self.path_of(hash)?;
		let data = tokio::fs::read(&path).await.ok()?;
		if let Err(e) = verify_blob(&data, hash) {
			warn!("Dropping corrupt blob {}: {}", path.display(), e);
			let _ = tokio::fs::remove_file(&path).await;
			return None;
		}
		Some(data)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::content::fingerprint_bytes;
	use tempfile::TempDir;
	use tokio::sync::Mutex;

	#[derive(Default)]
	struct RecordingService {
		executed: Mutex<Vec<String>>,
		blobs: Mutex<Vec<(String, Vec<u8>)>>,
	}

	#[async_trait]
	impl PeerService for RecordingService {
		async fn execute(&self, line: &str) -> Result<(), SyncError> {
			if line.starts_with("bad") {
				return Err(SyncError::Other { message: "refused".into() });
			}
			self.executed.lock().await.push(line.to_string());
			Ok(())
		}

		async fn read_blob(&self, hash: &str) -> Result<Option<Vec<u8>>, SyncError> {
			let blobs = self.blobs.lock().await;
			Ok(blobs.iter().find(|(h, _)| h == hash).map(|(_, d)| d.clone()))
		}

		async fn store_blob(&self, hash: &str, data: Vec<u8>) -> Result<(), SyncError> {
			self.blobs.lock().await.push((hash.to_string(), data));
			Ok(())
		}

		async fn snapshot(&self) -> StoreSnapshot {
			StoreSnapshot::default()
		}
	}

	async fn start_server(service: Arc<RecordingService>) -> (SocketAddr, watch::Sender<bool>) {
		let server = PeerServer::bind("127.0.0.1:0".parse().unwrap(), service).await.unwrap();
		serve_in_background(server)
	}

	fn serve_in_background(server: PeerServer) -> (SocketAddr, watch::Sender<bool>) {
		let addr = server.local_addr().unwrap();
		let (stop_tx, stop_rx) = watch::channel(false);
		tokio::spawn(server.serve(stop_rx));
		(addr, stop_tx)
	}

	#[test]
	fn test_wire_shapes() {
		let json = serde_json::to_string(&PeerRequest::Exec { line: "add_user/bob".into() }).unwrap();
		assert_eq!(json, r#"{"cmd":"EXEC","line":"add_user/bob"}"#);
		assert_eq!(serde_json::to_string(&PeerResponse::Done).unwrap(), r#"{"cmd":"OK"}"#);
		let parsed: PeerResponse = serde_json::from_str(r#"{"cmd":"ERR","msg":"nope"}"#).unwrap();
		assert_eq!(parsed, PeerResponse::Failed { msg: "nope".into() });
	}

	#[tokio::test]
	async fn test_exec_and_blob_roundtrip() {
		let service = Arc::new(RecordingService::default());
		let (addr, stop_tx) = start_server(service.clone()).await;
		let client = TcpPeerClient::new(Duration::from_secs(2));

		client.deliver(addr, "add_user/bob").await.unwrap();
		assert_eq!(*service.executed.lock().await, vec!["add_user/bob".to_string()]);

		let info = fingerprint_bytes(b"blob body");
		client.push_blob(addr, &info.hash, b"blob body").await.unwrap();
		assert_eq!(client.fetch_blob(addr, &info.hash).await.unwrap(), b"blob body");

		let _ = stop_tx.send(true);
	}

	#[tokio::test]
	async fn test_rejected_command_is_not_transient() {
		let service = Arc::new(RecordingService::default());
		let (addr, _stop_tx) = start_server(service).await;
		let client = TcpPeerClient::new(Duration::from_secs(2));

		let err = client.deliver(addr, "bad/line").await.unwrap_err();
		assert!(matches!(err, TransportError::Rejected { .. }));
		assert!(!err.is_transient());
	}

	#[tokio::test]
	async fn test_fetch_detects_tampered_content() {
		let service = Arc::new(RecordingService::default());
		let expected = fingerprint_bytes(b"original");
		service.blobs.lock().await.push((expected.hash.clone(), b"tampered".to_vec()));
		let (addr, _stop_tx) = start_server(service).await;

		let client = TcpPeerClient::new(Duration::from_secs(2));
		let err = client.fetch_blob(addr, &expected.hash).await.unwrap_err();
		assert!(matches!(err, TransportError::HashMismatch { .. }));
	}

	#[tokio::test]
	async fn test_unreachable_peer() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		drop(listener);

		let client = TcpPeerClient::new(Duration::from_millis(500));
		let err = client.deliver(addr, "add_user/bob").await.unwrap_err();
		assert!(err.is_transient());
	}

	#[tokio::test]
	async fn test_blob_store_verifies() {
		let tmp = TempDir::new().unwrap();
		let store = BlobStore::new(&tmp.path().join("blobs"));
		let info = fingerprint_bytes(b"content");

		assert!(store.put(&info.hash, b"other").await.is_err());
		let path = store.put(&info.hash, b"content").await.unwrap();
		assert!(path.ends_with(&info.hash));
		assert_eq!(store.get(&info.hash).await.unwrap(), b"content");
		assert!(store.get("../etc/passwd").await.is_none());
	}

	#[tokio::test]
	async fn test_blob_store_concurrent_puts() {
		let tmp = TempDir::new().unwrap();
		let store = BlobStore::new(&tmp.path().join("blobs"));
		let info = fingerprint_bytes(b"same bytes from many peers");

		let puts = (0..8).map(|_| store.put(&info.hash, b"same bytes from many peers"));
		let results = futures::future::join_all(puts).await;

		assert!(results.iter().all(Result::is_ok));
		let names: Vec<_> =
			std::fs::read_dir(tmp.path().join("blobs")).unwrap().map(|e| e.unwrap().file_name()).collect();
		assert_eq!(names, vec![std::ffi::OsString::from(&info.hash)]);
	}

	#[tokio::test]
	async fn test_blob_store_drops_corrupt_file() {
		let tmp = TempDir::new().unwrap();
		let store = BlobStore::new(tmp.path());
		let info = fingerprint_bytes(b"genuine");
		let path = store.put(&info.hash, b"genuine").await.unwrap();

		std::fs::write(&path, b"bit rot").unwrap();
		assert!(store.get(&info.hash).await.is_none());
		assert!(!path.exists());
	}

	#[tokio::test]
	async fn test_oversized_request_is_refused() {
		let service = Arc::new(RecordingService::default());
		let server = PeerServer::bind("127.0.0.1:0".parse().unwrap(), service.clone()).await.unwrap();
		let (addr, _stop_tx) = serve_in_background(server.with_limits(64, Duration::from_secs(5)));

		let mut stream = TcpStream::connect(addr).await.unwrap();
		let request = serde_json::to_string(&PeerRequest::Exec { line: "x".repeat(200) }).unwrap();
		stream.write_all(request.as_bytes()).await.unwrap();

		let mut answer = String::new();
		let mut reader = BufReader::new(&mut stream);
		let read = tokio::time::timeout(Duration::from_secs(2), reader.read_line(&mut answer)).await;
		assert!(read.unwrap().unwrap() > 0);
		let response: PeerResponse = serde_json::from_str(answer.trim()).unwrap();
		assert!(matches!(response, PeerResponse::Failed { .. }));
		assert!(service.executed.lock().await.is_empty());
	}

	#[tokio::test]
	async fn test_idle_connection_is_closed() {
		let service = Arc::new(RecordingService::default());
		let server = PeerServer::bind("127.0.0.1:0".parse().unwrap(), service).await.unwrap();
		let (addr, _stop_tx) = serve_in_background(server.with_limits(MAX_LINE_BYTES, Duration::from_millis(100)));

		let mut stream = TcpStream::connect(addr).await.unwrap();
		let mut buf = [0u8; 16];
		let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await;
		assert_eq!(read.unwrap().unwrap(), 0);
	}
}

// vim: ts=4
