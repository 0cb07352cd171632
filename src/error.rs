//! Error types for DecRep operations

use std::error::Error;
use std::fmt;
use std::io;
use std::net::SocketAddr;

use crate::tree::NodeKind;

/// Main error type for command application and node operations
#[derive(Debug)]
pub enum SyncError {
	/// Command line could not be parsed
	Parse(ParseError),

	/// Structural tree error (precondition failed, nothing was changed)
	Tree(TreeError),

	/// Record store rejected the command; the tree was not touched
	StoreApplyFailed(StoreError),

	/// Store committed but the tree edit failed afterwards
	ConsistencyViolation { message: String },

	/// Transport error (peer delivery, blob transfer)
	Transport(TransportError),

	/// Invalid configuration
	InvalidConfig { message: String },

	/// I/O error
	Io(io::Error),

	/// Generic error message
	Other { message: String },
}

impl fmt::Display for SyncError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SyncError::Parse(e) => write!(f, "Parse error: {}", e),
			SyncError::Tree(e) => write!(f, "Tree error: {}", e),
			SyncError::StoreApplyFailed(e) => write!(f, "Record store rejected command: {}", e),
			SyncError::ConsistencyViolation { message } => {
				write!(f, "Store and tree disagree: {}", message)
			}
			SyncError::Transport(e) => write!(f, "Transport error: {}", e),
			SyncError::InvalidConfig { message } => {
				write!(f, "Invalid configuration: {}", message)
			}
			SyncError::Io(e) => write!(f, "I/O error: {}", e),
			SyncError::Other { message } => write!(f, "{}", message),
		}
	}
}

impl Error for SyncError {}

impl From<io::Error> for SyncError {
	fn from(e: io::Error) -> Self {
		SyncError::Io(e)
	}
}

impl From<String> for SyncError {
	fn from(e: String) -> Self {
		SyncError::Other { message: e }
	}
}

impl From<ParseError> for SyncError {
	fn from(e: ParseError) -> Self {
		SyncError::Parse(e)
	}
}

impl From<TreeError> for SyncError {
	fn from(e: TreeError) -> Self {
		SyncError::Tree(e)
	}
}

impl From<StoreError> for SyncError {
	fn from(e: StoreError) -> Self {
		SyncError::StoreApplyFailed(e)
	}
}

impl From<TransportError> for SyncError {
	fn from(e: TransportError) -> Self {
		SyncError::Transport(e)
	}
}

/// Command wire-form errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
	/// Nothing but delimiters
	Empty,

	/// First token names no known command
	UnknownCommand { name: String },

	/// Wrong number of arguments for the command
	ArityMismatch { command: &'static str, expected: String, got: usize },

	/// A `"` was opened but never closed
	UnterminatedQuote { position: usize },

	/// Argument present but malformed (e.g. a non-numeric size)
	InvalidArgument { command: &'static str, message: String },
}

impl fmt::Display for ParseError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ParseError::Empty => write!(f, "Empty command"),
			ParseError::UnknownCommand { name } => write!(f, "Unknown command: {}", name),
			ParseError::ArityMismatch { command, expected, got } => {
				write!(f, "{} expects {} arguments, got {}", command, expected, got)
			}
			ParseError::UnterminatedQuote { position } => {
				write!(f, "Unterminated quote starting at byte {}", position)
			}
			ParseError::InvalidArgument { command, message } => {
				write!(f, "Invalid argument for {}: {}", command, message)
			}
		}
	}
}

impl Error for ParseError {}

/// PathTree structural errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
	/// Path (or one of its parents) does not exist
	NotFound { path: String },

	/// Node exists but is the other kind
	WrongNodeKind { path: String, expected: NodeKind },

	/// A path segment names an existing file
	NotADirectory { path: String },

	/// Destination name already taken
	AlreadyExists { path: String },

	/// Folder moved onto itself or below itself
	InvalidMove { from: String, to: String },

	/// Operation needs at least one path segment
	EmptyPath,
}

impl fmt::Display for TreeError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			TreeError::NotFound { path } => write!(f, "{} does not exist", path),
			TreeError::WrongNodeKind { path, expected } => {
				write!(f, "{} is not a {}", path, expected)
			}
			TreeError::NotADirectory { path } => write!(f, "{} is not a directory", path),
			TreeError::AlreadyExists { path } => write!(f, "{} already exists", path),
			TreeError::InvalidMove { from, to } => {
				write!(f, "Cannot move folder {} into itself ({})", from, to)
			}
			TreeError::EmptyPath => write!(f, "Empty path"),
		}
	}
}

impl Error for TreeError {}

/// Record store errors
#[derive(Debug)]
pub enum StoreError {
	/// Operation names an unregistered user
	UserNotFound { username: String },

	/// Unique key already taken (username, repo path)
	AlreadyExists { what: String },

	/// Record or ownership edge missing
	NotFound { what: String },

	/// No fingerprint supplied and the local file could not be hashed
	ContentUnavailable { path: String, source: io::Error },

	/// Storage engine failure
	Backend { message: String },
}

impl fmt::Display for StoreError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			StoreError::UserNotFound { username } => write!(f, "User {} does not exist", username),
			StoreError::AlreadyExists { what } => write!(f, "{} already exists", what),
			StoreError::NotFound { what } => write!(f, "{} not found", what),
			StoreError::ContentUnavailable { path, source } => {
				write!(f, "Cannot fingerprint {}: {}", path, source)
			}
			StoreError::Backend { message } => write!(f, "Storage backend error: {}", message),
		}
	}
}

impl Error for StoreError {}

impl From<redb::Error> for StoreError {
	fn from(e: redb::Error) -> Self {
		StoreError::Backend { message: e.to_string() }
	}
}

impl From<redb::DatabaseError> for StoreError {
	fn from(e: redb::DatabaseError) -> Self {
		StoreError::Backend { message: e.to_string() }
	}
}

impl From<redb::TransactionError> for StoreError {
	fn from(e: redb::TransactionError) -> Self {
		StoreError::Backend { message: e.to_string() }
	}
}

impl From<redb::TableError> for StoreError {
	fn from(e: redb::TableError) -> Self {
		StoreError::Backend { message: e.to_string() }
	}
}

impl From<redb::StorageError> for StoreError {
	fn from(e: redb::StorageError) -> Self {
		StoreError::Backend { message: e.to_string() }
	}
}

impl From<redb::CommitError> for StoreError {
	fn from(e: redb::CommitError) -> Self {
		StoreError::Backend { message: e.to_string() }
	}
}

impl From<serde_json::Error> for StoreError {
	fn from(e: serde_json::Error) -> Self {
		StoreError::Backend { message: format!("Corrupted row: {}", e) }
	}
}

/// Peer transport errors
#[derive(Debug)]
pub enum TransportError {
	/// Could not connect or the connection dropped
	PeerUnreachable { peer: SocketAddr, message: String },

	/// Peer answered with an error status
	Rejected { peer: SocketAddr, message: String },

	/// Malformed or unexpected message
	Protocol { message: String },

	/// Blob content does not match its fingerprint
	HashMismatch { expected: String, actual: String },

	/// I/O error
	Io(io::Error),
}

impl TransportError {
	/// Whether retrying the same delivery can help
	pub fn is_transient(&self) -> bool {
		matches!(self, TransportError::PeerUnreachable { .. } | TransportError::Io(_))
	}
}

impl fmt::Display for TransportError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			TransportError::PeerUnreachable { peer, message } => {
				write!(f, "Peer {} unreachable: {}", peer, message)
			}
			TransportError::Rejected { peer, message } => {
				write!(f, "Peer {} rejected request: {}", peer, message)
			}
			TransportError::Protocol { message } => write!(f, "Protocol error: {}", message),
			TransportError::HashMismatch { expected, actual } => {
				write!(f, "Hash mismatch: expected {}, got {}", expected, actual)
			}
			TransportError::Io(e) => write!(f, "I/O error: {}", e),
		}
	}
}

impl Error for TransportError {}

impl From<io::Error> for TransportError {
	fn from(e: io::Error) -> Self {
		TransportError::Io(e)
	}
}

impl From<serde_json::Error> for TransportError {
	fn from(e: serde_json::Error) -> Self {
		TransportError::Protocol { message: e.to_string() }
	}
}

impl From<base64::DecodeError> for TransportError {
	fn from(e: base64::DecodeError) -> Self {
		TransportError::Protocol { message: format!("Base64 decode error: {}", e) }
	}
}


// vim: ts=4
