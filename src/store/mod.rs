//! Ownership and dedup bookkeeping
//!
//! A [`RecordStore`] keeps three relations:
//! - users, one of which may be the node's local identity,
//! - file records, one per distinct content fingerprint and per repo path,
//! - ownership edges, linking a user to a record through the local path of
//!   that user's copy.
//!
//! A record whose last ownership edge disappears is garbage and is removed
//! in the same call; the removed record's full repo path is handed back so
//! the caller can prune its tree.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::content::ContentInfo;
use crate::error::StoreError;
use crate::tree::join_repo_path;

pub mod disk;
pub mod memory;

pub use disk::RedbRecordStore;
pub use memory::MemoryRecordStore;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

pub type UserId = u64;
pub type FileId = u64;

/// A repository participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
	pub id: UserId,
	pub username: String,
	/// Unix seconds
	pub first_seen_at: u64,
	/// This node's operator identity
	pub is_local: bool,
}

/// One logical tracked file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
	pub id: FileId,
	pub file_name: String,
	/// Canonical parent directory in the repository
	pub repo_path: String,
	pub content_hash: String,
	pub size: u64,
	pub created_at: u64,
	pub modified_at: u64,
	pub author_user_id: UserId,
}

impl FileRecord {
	pub fn full_path(&self) -> String {
		join_repo_path(&self.repo_path, &self.file_name)
	}

	pub fn content(&self) -> ContentInfo {
		ContentInfo { hash: self.content_hash.clone(), size: self.size }
	}
}

/// A user holding a local copy of a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnershipEdge {
	pub owner_user_id: UserId,
	pub file_record_id: FileId,
	pub local_path: String,
}

/// One file of a folder import, fingerprinted up front
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFile {
	pub local_path: String,
	pub file_name: String,
	pub repo_path: String,
	pub content: ContentInfo,
}

/// Result of [`RecordStore::add_file_record`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
	/// New content: a record was created
	Created(FileRecord),
	/// Content already tracked: the owner was attached to the existing record
	Attached(FileRecord),
}

impl AddOutcome {
	pub fn record(&self) -> &FileRecord {
		match self {
			AddOutcome::Created(record) | AddOutcome::Attached(record) => record,
		}
	}

	pub fn is_duplicate(&self) -> bool {
		matches!(self, AddOutcome::Attached(_))
	}
}

/// Result of [`RecordStore::update_record_content`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentUpdate {
	/// Record the updating owner is attached to afterwards
	pub record: FileRecord,
	/// Full repo path of a record that lost its last owner
	pub orphaned: Option<String>,
}

/// Serializable copy of a whole store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
	pub users: Vec<User>,
	pub records: Vec<FileRecord>,
	pub edges: Vec<OwnershipEdge>,
}

/// Bookkeeping contract consumed by the sync engine
///
/// Implementations must leave their state untouched when they return an
/// error.
pub trait RecordStore: Send + Sync {
	// === Users ===

	fn add_user(&mut self, username: &str, is_local: bool) -> StoreResult<User>;

	/// Remove a user and all of their ownership edges. Returns the full repo
	/// paths of records that were left without owners (and were removed).
	fn delete_user(&mut self, username: &str) -> StoreResult<Vec<String>>;

	/// Flag an existing user as the local identity, clearing the flag on
	/// any other user
	fn set_local_user(&mut self, username: &str) -> StoreResult<User>;

	fn user(&self, username: &str) -> Option<User>;

	fn local_user(&self) -> Option<User>;

	fn users(&self) -> Vec<User>;

	// === Records ===

	/// Track `local_source_path` as `repo_path/file_name` for `owner`.
	///
	/// The fingerprint is taken from `content` when given, otherwise the
	/// local file is hashed.
	fn add_file_record(
		&mut self,
		local_source_path: &str,
		file_name: &str,
		repo_path: &str,
		owner: &str,
		content: Option<ContentInfo>,
	) -> StoreResult<AddOutcome>;

	/// [`RecordStore::add_file_record`] for every file, all or nothing.
	/// Outcomes come back in input order.
	fn add_file_records(&mut self, owner: &str, files: &[NewFile]) -> StoreResult<Vec<AddOutcome>>;

	/// Drop `username`'s copy at `local_path`. Returns the record's full repo
	/// path when that was the last copy. Unknown local paths are not an error.
	fn delete_local_copy(&mut self, local_path: &str, username: &str) -> StoreResult<Option<String>>;

	/// Remove the record at `full_repo_path` whatever its owner count
	fn untrack_file(&mut self, full_repo_path: &str) -> StoreResult<FileRecord>;

	/// Remove every record at or below `repo_path`
	fn untrack_folder(&mut self, repo_path: &str) -> StoreResult<Vec<FileRecord>>;

	fn rename_record(&mut self, repo_path: &str, old_name: &str, new_name: &str) -> StoreResult<()>;

	fn move_record_path(
		&mut self,
		file_name: &str,
		old_repo_path: &str,
		new_repo_path: &str,
	) -> StoreResult<()>;

	/// Re-root every record at or below `old_repo_path`. Returns how many moved.
	fn rename_record_folder(&mut self, old_repo_path: &str, new_repo_path: &str) -> StoreResult<usize>;

	/// Record new content for `username`'s copy at `local_path`. The updating
	/// owner becomes the record's only owner.
	fn update_record_content(
		&mut self,
		local_path: &str,
		username: &str,
		content: Option<ContentInfo>,
	) -> StoreResult<ContentUpdate>;

	fn update_owner_local_path(
		&mut self,
		old_local_path: &str,
		new_local_path: &str,
		username: &str,
	) -> StoreResult<()>;

	/// Rewrite the local paths of `username`'s copies below `old_local_dir`
	fn update_owner_folder_path(
		&mut self,
		old_local_dir: &str,
		new_local_dir: &str,
		username: &str,
	) -> StoreResult<usize>;

	// === Queries ===

	fn records(&self) -> Vec<FileRecord>;

	fn record_at(&self, full_repo_path: &str) -> Option<FileRecord>;

	fn record_by_hash(&self, content_hash: &str) -> Option<FileRecord>;

	fn owners(&self, file_id: FileId) -> Vec<OwnershipEdge>;

	/// Local path of the local user's copy of the given content, if any
	fn local_copy_of(&self, content_hash: &str) -> Option<String>;

	// === Bootstrap ===

	fn snapshot(&self) -> StoreSnapshot;

	/// Merge a peer's snapshot; returns the number of records added
	fn import_snapshot(&mut self, snapshot: &StoreSnapshot) -> StoreResult<usize>;
}

/// Current time in unix seconds
pub(crate) fn now_secs() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

// vim: ts=4
