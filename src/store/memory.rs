//! In-memory record store
//!
//! Holds the three relations in ordered maps. It is the full implementation
//! of the bookkeeping rules; the redb-backed store wraps it and persists the
//! rows it reports as changed.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use super::*;
use crate::content::{fingerprint_file, ContentInfo};
use crate::error::StoreError;
use crate::tree::{is_within, join_repo_path, normalize_repo_path, split_path};

/// A row that was written or removed by the last operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Change {
	User(UserId),
	File(FileId),
	Edge(FileId, UserId),
}

#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
	next_id: u64,
	users: BTreeMap<UserId, User>,
	files: BTreeMap<FileId, FileRecord>,
	/// Keyed by (record, owner) so per-record scans are range queries
	edges: BTreeMap<(FileId, UserId), OwnershipEdge>,
	journal: Option<BTreeSet<Change>>,
}

impl MemoryRecordStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Store that remembers which rows changed, see [`Self::take_changes`]
	pub fn with_journal() -> Self {
		MemoryRecordStore { journal: Some(BTreeSet::new()), ..Self::default() }
	}

	/// Rebuild from persisted rows
	pub fn from_rows(
		next_id: u64,
		users: Vec<User>,
		files: Vec<FileRecord>,
		edges: Vec<OwnershipEdge>,
	) -> Self {
		MemoryRecordStore {
			next_id,
			users: users.into_iter().map(|u| (u.id, u)).collect(),
			files: files.into_iter().map(|f| (f.id, f)).collect(),
			edges: edges.into_iter().map(|e| ((e.file_record_id, e.owner_user_id), e)).collect(),
			journal: Some(BTreeSet::new()),
		}
	}

	pub fn next_id(&self) -> u64 {
		self.next_id
	}

	/// Drain the set of rows touched since the last call
	pub fn take_changes(&mut self) -> Vec<Change> {
		match self.journal.as_mut() {
			Some(journal) => std::mem::take(journal).into_iter().collect(),
			None => Vec::new(),
		}
	}

	pub fn user_by_id(&self, id: UserId) -> Option<&User> {
		self.users.get(&id)
	}

	pub fn file_by_id(&self, id: FileId) -> Option<&FileRecord> {
		self.files.get(&id)
	}

	pub fn edge(&self, file_id: FileId, owner_id: UserId) -> Option<&OwnershipEdge> {
		self.edges.get(&(file_id, owner_id))
	}

	// ------------------------------------------------------------------
	// Row helpers; every write goes through these so the journal is exact
	// ------------------------------------------------------------------

	fn allocate_id(&mut self) -> u64 {
		self.next_id += 1;
		self.next_id
	}

	fn note(&mut self, change: Change) {
		if let Some(journal) = self.journal.as_mut() {
			journal.insert(change);
		}
	}

	fn put_user(&mut self, user: User) {
		self.note(Change::User(user.id));
		self.users.insert(user.id, user);
	}

	fn drop_user(&mut self, id: UserId) {
		self.note(Change::User(id));
		self.users.remove(&id);
	}

	fn put_file(&mut self, record: FileRecord) {
		self.note(Change::File(record.id));
		self.files.insert(record.id, record);
	}

	fn drop_file(&mut self, id: FileId) {
		self.note(Change::File(id));
		self.files.remove(&id);
	}

	fn put_edge(&mut self, edge: OwnershipEdge) {
		let key = (edge.file_record_id, edge.owner_user_id);
		self.note(Change::Edge(key.0, key.1));
		self.edges.insert(key, edge);
	}

	fn drop_edge(&mut self, file_id: FileId, owner_id: UserId) {
		self.note(Change::Edge(file_id, owner_id));
		self.edges.remove(&(file_id, owner_id));
	}

	// ------------------------------------------------------------------
	// Lookups
	// ------------------------------------------------------------------

	fn require_user(&self, username: &str) -> StoreResult<User> {
		self.user(username).ok_or_else(|| StoreError::UserNotFound { username: username.to_string() })
	}

	fn edges_of(&self, file_id: FileId) -> Vec<OwnershipEdge> {
		self.edges.range((file_id, 0)..=(file_id, UserId::MAX)).map(|(_, e)| e.clone()).collect()
	}

	fn edge_by_local_path(&self, owner_id: UserId, local_path: &str) -> Option<OwnershipEdge> {
		self.edges
			.values()
			.find(|e| e.owner_user_id == owner_id && e.local_path == local_path)
			.cloned()
	}

	fn record_in(&self, repo_path: &str, file_name: &str) -> Option<&FileRecord> {
		let repo_path = normalize_repo_path(repo_path);
		self.files.values().find(|r| r.repo_path == repo_path && r.file_name == file_name)
	}

	fn clear_local_flag(&mut self) {
		let previous: Vec<User> = self.users.values().filter(|u| u.is_local).cloned().collect();
		for mut user in previous {
			user.is_local = false;
			self.put_user(user);
		}
	}

	/// Drop the record when nobody owns it any more
	fn collect_if_orphaned(&mut self, file_id: FileId) -> Option<String> {
		if !self.edges_of(file_id).is_empty() {
			return None;
		}
		let path = self.files.get(&file_id)?.full_path();
		self.drop_file(file_id);
		Some(path)
	}

	fn resolve_content(local_path: &str, content: Option<ContentInfo>) -> StoreResult<ContentInfo> {
		match content {
			Some(content) => Ok(content),
			None => fingerprint_file(Path::new(local_path)).map_err(|source| {
				StoreError::ContentUnavailable { path: local_path.to_string(), source }
			}),
		}
	}
}

fn valid_name(name: &str) -> StoreResult<()> {
	if name.is_empty() || name.contains('/') {
		return Err(StoreError::NotFound { what: format!("valid file name in {:?}", name) });
	}
	Ok(())
}

impl RecordStore for MemoryRecordStore {
	fn add_user(&mut self, username: &str, is_local: bool) -> StoreResult<User> {
		if username.is_empty() {
			return Err(StoreError::NotFound { what: "username".to_string() });
		}
		if self.user(username).is_some() {
			return Err(StoreError::AlreadyExists { what: format!("User {}", username) });
		}
		if is_local {
			self.clear_local_flag();
		}
		let user = User {
			id: self.allocate_id(),
			username: username.to_string(),
			first_seen_at: now_secs(),
			is_local,
		};
		self.put_user(user.clone());
		Ok(user)
	}

	fn delete_user(&mut self, username: &str) -> StoreResult<Vec<String>> {
		let user = self.require_user(username)?;
		let owned: Vec<FileId> = self
			.edges
			.values()
			.filter(|e| e.owner_user_id == user.id)
			.map(|e| e.file_record_id)
			.collect();

		let mut orphaned = Vec::new();
		for file_id in owned {
			self.drop_edge(file_id, user.id);
			if let Some(path) = self.collect_if_orphaned(file_id) {
				orphaned.push(path);
			}
		}
		self.drop_user(user.id);
		Ok(orphaned)
	}

	fn set_local_user(&mut self, username: &str) -> StoreResult<User> {
		let mut user = self.require_user(username)?;
		if !user.is_local {
			self.clear_local_flag();
			user.is_local = true;
			self.put_user(user.clone());
		}
		Ok(user)
	}

	fn user(&self, username: &str) -> Option<User> {
		self.users.values().find(|u| u.username == username).cloned()
	}

	fn local_user(&self) -> Option<User> {
		self.users.values().find(|u| u.is_local).cloned()
	}

	fn users(&self) -> Vec<User> {
		self.users.values().cloned().collect()
	}

	fn add_file_record(
		&mut self,
		local_source_path: &str,
		file_name: &str,
		repo_path: &str,
		owner: &str,
		content: Option<ContentInfo>,
	) -> StoreResult<AddOutcome> {
		valid_name(file_name)?;
		let owner = self.require_user(owner)?;
		let content = Self::resolve_content(local_source_path, content)?;

		if let Some(existing) = self.record_by_hash(&content.hash) {
			let edge = OwnershipEdge {
				owner_user_id: owner.id,
				file_record_id: existing.id,
				local_path: local_source_path.to_string(),
			};
			if self.edge(existing.id, owner.id) != Some(&edge) {
				self.put_edge(edge);
			}
			return Ok(AddOutcome::Attached(existing));
		}

		if let Some(occupant) = self.record_in(repo_path, file_name) {
			return Err(StoreError::AlreadyExists {
				what: format!("{} (with other content)", occupant.full_path()),
			});
		}

		let now = now_secs();
		let record = FileRecord {
			id: self.allocate_id(),
			file_name: file_name.to_string(),
			repo_path: normalize_repo_path(repo_path),
			content_hash: content.hash,
			size: content.size,
			created_at: now,
			modified_at: now,
			author_user_id: owner.id,
		};
		self.put_file(record.clone());
		self.put_edge(OwnershipEdge {
			owner_user_id: owner.id,
			file_record_id: record.id,
			local_path: local_source_path.to_string(),
		});
		Ok(AddOutcome::Created(record))
	}

	fn add_file_records(&mut self, owner: &str, files: &[NewFile]) -> StoreResult<Vec<AddOutcome>> {
		self.require_user(owner)?;
		let mut staged = self.clone();
		let mut outcomes = Vec::with_capacity(files.len());
		for file in files {
			outcomes.push(staged.add_file_record(
				&file.local_path,
				&file.file_name,
				&file.repo_path,
				owner,
				Some(file.content.clone()),
			)?);
		}
		*self = staged;
		Ok(outcomes)
	}

	fn delete_local_copy(&mut self, local_path: &str, username: &str) -> StoreResult<Option<String>> {
		let owner = self.require_user(username)?;
		let edge = match self.edge_by_local_path(owner.id, local_path) {
			Some(edge) => edge,
			None => return Ok(None),
		};
		self.drop_edge(edge.file_record_id, owner.id);
		Ok(self.collect_if_orphaned(edge.file_record_id))
	}

	fn untrack_file(&mut self, full_repo_path: &str) -> StoreResult<FileRecord> {
		let record = self
			.record_at(full_repo_path)
			.ok_or_else(|| StoreError::NotFound { what: format!("Record {}", full_repo_path) })?;
		for edge in self.edges_of(record.id) {
			self.drop_edge(record.id, edge.owner_user_id);
		}
		self.drop_file(record.id);
		Ok(record)
	}

	fn untrack_folder(&mut self, repo_path: &str) -> StoreResult<Vec<FileRecord>> {
		let folder = normalize_repo_path(repo_path);
		let doomed: Vec<FileRecord> =
			self.files.values().filter(|r| is_within(&r.repo_path, &folder)).cloned().collect();
		for record in &doomed {
			for edge in self.edges_of(record.id) {
				self.drop_edge(record.id, edge.owner_user_id);
			}
			self.drop_file(record.id);
		}
		Ok(doomed)
	}

	fn rename_record(&mut self, repo_path: &str, old_name: &str, new_name: &str) -> StoreResult<()> {
		valid_name(new_name)?;
		let mut record = self.record_in(repo_path, old_name).cloned().ok_or_else(|| {
			StoreError::NotFound { what: format!("Record {}", join_repo_path(repo_path, old_name)) }
		})?;
		if self.record_in(repo_path, new_name).is_some() {
			return Err(StoreError::AlreadyExists { what: join_repo_path(repo_path, new_name) });
		}
		record.file_name = new_name.to_string();
		self.put_file(record);
		Ok(())
	}

	fn move_record_path(
		&mut self,
		file_name: &str,
		old_repo_path: &str,
		new_repo_path: &str,
	) -> StoreResult<()> {
		let mut record = self.record_in(old_repo_path, file_name).cloned().ok_or_else(|| {
			StoreError::NotFound { what: format!("Record {}", join_repo_path(old_repo_path, file_name)) }
		})?;
		if self.record_in(new_repo_path, file_name).is_some() {
			return Err(StoreError::AlreadyExists {
				what: join_repo_path(new_repo_path, file_name),
			});
		}
		record.repo_path = normalize_repo_path(new_repo_path);
		self.put_file(record);
		Ok(())
	}

	fn rename_record_folder(&mut self, old_repo_path: &str, new_repo_path: &str) -> StoreResult<usize> {
		let old = normalize_repo_path(old_repo_path);
		let new = normalize_repo_path(new_repo_path);
		if old == "/" || is_within(&new, &old) {
			return Err(StoreError::AlreadyExists { what: format!("{} inside {}", new, old) });
		}

		let rebase = |repo_path: &str| -> String {
			let rest = &split_path(repo_path)[split_path(&old).len()..];
			normalize_repo_path(&format!("{}/{}", new, rest.join("/")))
		};

		let (moving, staying): (Vec<FileRecord>, Vec<FileRecord>) =
			self.files.values().cloned().partition(|r| is_within(&r.repo_path, &old));
		let taken: BTreeSet<String> = staying.iter().map(FileRecord::full_path).collect();

		let mut moved = Vec::with_capacity(moving.len());
		for mut record in moving {
			record.repo_path = rebase(&record.repo_path);
			if taken.contains(&record.full_path()) {
				return Err(StoreError::AlreadyExists { what: record.full_path() });
			}
			moved.push(record);
		}
		let count = moved.len();
		for record in moved {
			self.put_file(record);
		}
		Ok(count)
	}

	fn update_record_content(
		&mut self,
		local_path: &str,
		username: &str,
		content: Option<ContentInfo>,
	) -> StoreResult<ContentUpdate> {
		let owner = self.require_user(username)?;
		let edge = self.edge_by_local_path(owner.id, local_path).ok_or_else(|| {
			StoreError::NotFound { what: format!("Copy {} of {}", local_path, username) }
		})?;
		let content = Self::resolve_content(local_path, content)?;
		let mut record = self
			.files
			.get(&edge.file_record_id)
			.cloned()
			.ok_or_else(|| StoreError::NotFound { what: format!("Record #{}", edge.file_record_id) })?;

		// Everybody else now holds stale content
		for other in self.edges_of(record.id) {
			if other.owner_user_id != owner.id {
				self.drop_edge(record.id, other.owner_user_id);
			}
		}

		if record.content_hash != content.hash {
			if let Some(target) = self.record_by_hash(&content.hash) {
				// Same content is already tracked elsewhere: join it
				self.drop_edge(record.id, owner.id);
				self.put_edge(OwnershipEdge {
					owner_user_id: owner.id,
					file_record_id: target.id,
					local_path: local_path.to_string(),
				});
				let orphaned = self.collect_if_orphaned(record.id);
				return Ok(ContentUpdate { record: target, orphaned });
			}
		}

		record.content_hash = content.hash;
		record.size = content.size;
		record.modified_at = now_secs();
		self.put_file(record.clone());
		Ok(ContentUpdate { record, orphaned: None })
	}

	fn update_owner_local_path(
		&mut self,
		old_local_path: &str,
		new_local_path: &str,
		username: &str,
	) -> StoreResult<()> {
		let owner = self.require_user(username)?;
		let mut edge = self.edge_by_local_path(owner.id, old_local_path).ok_or_else(|| {
			StoreError::NotFound { what: format!("Copy {} of {}", old_local_path, username) }
		})?;
		edge.local_path = new_local_path.to_string();
		self.put_edge(edge);
		Ok(())
	}

	fn update_owner_folder_path(
		&mut self,
		old_local_dir: &str,
		new_local_dir: &str,
		username: &str,
	) -> StoreResult<usize> {
		let owner = self.require_user(username)?;
		let updated: Vec<OwnershipEdge> = self
			.edges
			.values()
			.filter(|e| e.owner_user_id == owner.id)
			.filter_map(|e| {
				let rest = Path::new(&e.local_path).strip_prefix(old_local_dir).ok()?;
				let new_path: PathBuf = Path::new(new_local_dir).join(rest);
				let mut edge = e.clone();
				edge.local_path = new_path.to_string_lossy().into_owned();
				Some(edge)
			})
			.collect();
		let count = updated.len();
		for edge in updated {
			self.put_edge(edge);
		}
		Ok(count)
	}

	fn records(&self) -> Vec<FileRecord> {
		self.files.values().cloned().collect()
	}

	fn record_at(&self, full_repo_path: &str) -> Option<FileRecord> {
		let segments = split_path(full_repo_path);
		let (name, parents) = segments.split_last()?;
		self.record_in(&parents.join("/"), name).cloned()
	}

	fn record_by_hash(&self, content_hash: &str) -> Option<FileRecord> {
		self.files.values().find(|r| r.content_hash == content_hash).cloned()
	}

	fn owners(&self, file_id: FileId) -> Vec<OwnershipEdge> {
		self.edges_of(file_id)
	}

	fn local_copy_of(&self, content_hash: &str) -> Option<String> {
		let local = self.local_user()?;
		let record = self.record_by_hash(content_hash)?;
		self.edge(record.id, local.id).map(|e| e.local_path.clone())
	}

	fn snapshot(&self) -> StoreSnapshot {
		StoreSnapshot {
			users: self.users.values().cloned().collect(),
			records: self.files.values().cloned().collect(),
			edges: self.edges.values().cloned().collect(),
		}
	}

	fn import_snapshot(&mut self, snapshot: &StoreSnapshot) -> StoreResult<usize> {
		// Remote ids mean nothing here: match users by name and records by hash
		let mut user_ids: BTreeMap<UserId, UserId> = BTreeMap::new();
		for remote in &snapshot.users {
			let local_id = match self.user(&remote.username) {
				Some(user) => user.id,
				None => {
					let user = User {
						id: self.allocate_id(),
						username: remote.username.clone(),
						first_seen_at: remote.first_seen_at,
						is_local: false,
					};
					self.put_user(user.clone());
					user.id
				}
			};
			user_ids.insert(remote.id, local_id);
		}

		let mut file_ids: BTreeMap<FileId, FileId> = BTreeMap::new();
		let mut imported = 0;
		for remote in &snapshot.records {
			if let Some(existing) = self.record_by_hash(&remote.content_hash) {
				file_ids.insert(remote.id, existing.id);
				continue;
			}
			if self.record_in(&remote.repo_path, &remote.file_name).is_some() {
				continue;
			}
			let record = FileRecord {
				id: self.allocate_id(),
				author_user_id: user_ids.get(&remote.author_user_id).copied().unwrap_or(0),
				repo_path: normalize_repo_path(&remote.repo_path),
				..remote.clone()
			};
			file_ids.insert(remote.id, record.id);
			self.put_file(record);
			imported += 1;
		}

		for remote in &snapshot.edges {
			let (file_id, owner_id) =
				match (file_ids.get(&remote.file_record_id), user_ids.get(&remote.owner_user_id)) {
					(Some(f), Some(u)) => (*f, *u),
					_ => continue,
				};
			if self.edge(file_id, owner_id).is_none() {
				self.put_edge(OwnershipEdge {
					owner_user_id: owner_id,
					file_record_id: file_id,
					local_path: remote.local_path.clone(),
				});
			}
		}
		Ok(imported)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::content::fingerprint_bytes;

	fn content(data: &str) -> Option<ContentInfo> {
		Some(fingerprint_bytes(data.as_bytes()))
	}

	fn store_with_users(names: &[&str]) -> MemoryRecordStore {
		let mut store = MemoryRecordStore::new();
		for name in names {
			store.add_user(name, false).unwrap();
		}
		store
	}

	#[test]
	fn test_batch_add_all_or_nothing() {
		let mut store = store_with_users(&["alice"]);
		store.add_file_record("/a/old", "b.txt", "/import", "alice", content("old")).unwrap();
		let before = store.snapshot();
		let file = |name: &str, data: &str| NewFile {
			local_path: format!("/d/{}", name),
			file_name: name.into(),
			repo_path: "/import".into(),
			content: fingerprint_bytes(data.as_bytes()),
		};
		let files = [file("a.txt", "a"), file("b.txt", "new")];

		assert!(matches!(store.add_file_records("alice", &files), Err(StoreError::AlreadyExists { .. })));
		assert_eq!(store.snapshot(), before);
		assert!(store.record_at("/import/a.txt").is_none());

		let outcomes = store.add_file_records("alice", &files[..1]).unwrap();
		assert!(matches!(&outcomes[..], [AddOutcome::Created(record)] if record.full_path() == "/import/a.txt"));
	}

	#[test]
	fn test_add_user_twice_fails() {
		let mut store = store_with_users(&["alice"]);
		assert!(matches!(store.add_user("alice", false), Err(StoreError::AlreadyExists { .. })));
		assert_eq!(store.users().len(), 1);
	}

	#[test]
	fn test_single_local_identity() {
		let mut store = MemoryRecordStore::new();
		store.add_user("alice", true).unwrap();
		store.add_user("bob", true).unwrap();
		assert_eq!(store.local_user().unwrap().username, "bob");
		assert!(!store.user("alice").unwrap().is_local);
	}

	#[test]
	fn test_set_local_user() {
		let mut store = MemoryRecordStore::new();
		store.add_user("alice", true).unwrap();
		store.add_user("bob", false).unwrap();
		assert!(store.set_local_user("bob").unwrap().is_local);
		assert_eq!(store.local_user().unwrap().username, "bob");
		assert!(matches!(store.set_local_user("ghost"), Err(StoreError::UserNotFound { .. })));
	}

	#[test]
	fn test_dedup_by_content() {
		let mut store = store_with_users(&["alice", "bob"]);

		let first = store.add_file_record("/a/x.txt", "x.txt", "/docs", "alice", content("same")).unwrap();
		let again = store.add_file_record("/a/x.txt", "x.txt", "/docs", "alice", content("same")).unwrap();
		let other = store.add_file_record("/b/y.txt", "y.txt", "/else", "bob", content("same")).unwrap();

		assert!(matches!(first, AddOutcome::Created(_)));
		assert!(again.is_duplicate());
		assert!(other.is_duplicate());
		assert_eq!(other.record().full_path(), "/docs/x.txt");
		assert_eq!(store.records().len(), 1);
		assert_eq!(store.owners(first.record().id).len(), 2);
	}

	#[test]
	fn test_same_path_different_content_rejected() {
		let mut store = store_with_users(&["alice"]);
		store.add_file_record("/a/x.txt", "x.txt", "/docs", "alice", content("one")).unwrap();
		let err = store.add_file_record("/a/x2.txt", "x.txt", "/docs/", "alice", content("two"));
		assert!(matches!(err, Err(StoreError::AlreadyExists { .. })));
		assert_eq!(store.records().len(), 1);
	}

	#[test]
	fn test_unknown_owner() {
		let mut store = MemoryRecordStore::new();
		let err = store.add_file_record("/a/x.txt", "x.txt", "/docs", "ghost", content("x"));
		assert!(matches!(err, Err(StoreError::UserNotFound { .. })));
	}

	#[test]
	fn test_missing_local_file_without_fingerprint() {
		let mut store = store_with_users(&["alice"]);
		let err = store.add_file_record("/definitely/not/here.txt", "here.txt", "/", "alice", None);
		assert!(matches!(err, Err(StoreError::ContentUnavailable { .. })));
	}

	#[test]
	fn test_last_owner_delete_collects_record() {
		let mut store = store_with_users(&["user1", "user2"]);
		store.add_file_record("/u1/f.txt", "f.txt", "/shared", "user1", content("f")).unwrap();
		store.add_file_record("/u2/f.txt", "f.txt", "/shared", "user2", content("f")).unwrap();

		assert_eq!(store.delete_local_copy("/u1/f.txt", "user1").unwrap(), None);
		let record = store.record_at("/shared/f.txt").unwrap();
		assert_eq!(store.owners(record.id).len(), 1);

		assert_eq!(store.delete_local_copy("/u2/f.txt", "user2").unwrap(), Some("/shared/f.txt".into()));
		assert!(store.record_at("/shared/f.txt").is_none());
		assert!(store.records().is_empty());
	}

	#[test]
	fn test_delete_unknown_copy_is_noop() {
		let mut store = store_with_users(&["alice"]);
		assert_eq!(store.delete_local_copy("/nowhere", "alice").unwrap(), None);
		assert!(matches!(
			store.delete_local_copy("/nowhere", "ghost"),
			Err(StoreError::UserNotFound { .. })
		));
	}

	#[test]
	fn test_delete_user_returns_orphans() {
		let mut store = store_with_users(&["alice", "bob"]);
		store.add_file_record("/a/solo.txt", "solo.txt", "/docs", "alice", content("solo")).unwrap();
		store.add_file_record("/a/both.txt", "both.txt", "/docs", "alice", content("both")).unwrap();
		store.add_file_record("/b/both.txt", "both.txt", "/docs", "bob", content("both")).unwrap();

		let orphaned = store.delete_user("alice").unwrap();
		assert_eq!(orphaned, vec!["/docs/solo.txt".to_string()]);
		assert!(store.user("alice").is_none());
		assert!(store.record_at("/docs/both.txt").is_some());
	}

	#[test]
	fn test_untrack_folder_is_recursive() {
		let mut store = store_with_users(&["alice"]);
		store.add_file_record("/l/1", "1.txt", "/p", "alice", content("1")).unwrap();
		store.add_file_record("/l/2", "2.txt", "/p/sub", "alice", content("2")).unwrap();
		store.add_file_record("/l/3", "3.txt", "/pp", "alice", content("3")).unwrap();

		let removed = store.untrack_folder("/p").unwrap();
		assert_eq!(removed.len(), 2);
		assert_eq!(store.records().len(), 1);
		assert!(store.record_at("/pp/3.txt").is_some());
	}

	#[test]
	fn test_rename_and_move_records() {
		let mut store = store_with_users(&["alice"]);
		store.add_file_record("/l/a", "a.txt", "/docs", "alice", content("a")).unwrap();
		store.add_file_record("/l/b", "b.txt", "/docs", "alice", content("b")).unwrap();

		assert!(matches!(
			store.rename_record("/docs", "a.txt", "b.txt"),
			Err(StoreError::AlreadyExists { .. })
		));
		store.rename_record("/docs", "a.txt", "c.txt").unwrap();
		store.move_record_path("c.txt", "/docs", "/archive").unwrap();
		assert!(store.record_at("/archive/c.txt").is_some());
		assert!(store.record_at("/docs/a.txt").is_none());
	}

	#[test]
	fn test_rename_record_folder() {
		let mut store = store_with_users(&["alice"]);
		store.add_file_record("/l/a", "a.txt", "/p", "alice", content("a")).unwrap();
		store.add_file_record("/l/b", "b.txt", "/p/sub", "alice", content("b")).unwrap();
		store.add_file_record("/l/c", "c.txt", "/pp", "alice", content("c")).unwrap();

		assert_eq!(store.rename_record_folder("/p", "/q/r").unwrap(), 2);
		assert!(store.record_at("/q/r/a.txt").is_some());
		assert!(store.record_at("/q/r/sub/b.txt").is_some());
		assert!(store.record_at("/pp/c.txt").is_some());
		assert!(store.rename_record_folder("/q", "/q/inside").is_err());
	}

	#[test]
	fn test_update_content_makes_sole_owner() {
		let mut store = store_with_users(&["alice", "bob"]);
		store.add_file_record("/a/f", "f.txt", "/docs", "alice", content("v1")).unwrap();
		store.add_file_record("/b/f", "f.txt", "/docs", "bob", content("v1")).unwrap();

		let update = store.update_record_content("/a/f", "alice", content("v2")).unwrap();
		assert_eq!(update.orphaned, None);
		assert_eq!(update.record.content_hash, fingerprint_bytes(b"v2").hash);
		let owners = store.owners(update.record.id);
		assert_eq!(owners.len(), 1);
		assert_eq!(owners[0].local_path, "/a/f");
	}

	#[test]
	fn test_update_content_to_known_hash_joins_record() {
		let mut store = store_with_users(&["alice"]);
		store.add_file_record("/a/one", "one.txt", "/docs", "alice", content("1")).unwrap();
		store.add_file_record("/a/two", "two.txt", "/docs", "alice", content("2")).unwrap();

		let update = store.update_record_content("/a/two", "alice", content("1")).unwrap();
		assert_eq!(update.record.full_path(), "/docs/one.txt");
		assert_eq!(update.orphaned, Some("/docs/two.txt".into()));
		assert_eq!(store.records().len(), 1);
	}

	#[test]
	fn test_update_local_paths() {
		let mut store = store_with_users(&["alice"]);
		store.add_file_record("/home/a/x.txt", "x.txt", "/d", "alice", content("x")).unwrap();
		store.add_file_record("/home/a/sub/y.txt", "y.txt", "/d", "alice", content("y")).unwrap();

		store.update_owner_local_path("/home/a/x.txt", "/home/a/x2.txt", "alice").unwrap();
		assert_eq!(store.update_owner_folder_path("/home/a/sub", "/home/b", "alice").unwrap(), 1);
		assert_eq!(store.local_copy_of(&fingerprint_bytes(b"x").hash), None);

		let y = store.record_at("/d/y.txt").unwrap();
		assert_eq!(store.owners(y.id)[0].local_path, "/home/b/y.txt");
		let x = store.record_at("/d/x.txt").unwrap();
		assert_eq!(store.owners(x.id)[0].local_path, "/home/a/x2.txt");
	}

	#[test]
	fn test_journal_tracks_rows() {
		let mut store = MemoryRecordStore::with_journal();
		let user = store.add_user("alice", false).unwrap();
		let added = store.add_file_record("/a", "a.txt", "/", "alice", content("a")).unwrap();
		let changes = store.take_changes();
		assert!(changes.contains(&Change::User(user.id)));
		assert!(changes.contains(&Change::File(added.record().id)));
		assert!(changes.contains(&Change::Edge(added.record().id, user.id)));
		assert!(store.take_changes().is_empty());
	}

	#[test]
	fn test_snapshot_import_merges_by_name_and_hash() {
		let mut origin = store_with_users(&["alice", "bob"]);
		origin.add_file_record("/a/x", "x.txt", "/docs", "alice", content("x")).unwrap();
		origin.add_file_record("/b/x", "x.txt", "/docs", "bob", content("x")).unwrap();
		origin.add_file_record("/b/y", "y.txt", "/docs", "bob", content("y")).unwrap();

		let mut fresh = store_with_users(&["bob"]);
		assert_eq!(fresh.import_snapshot(&origin.snapshot()).unwrap(), 2);
		assert_eq!(fresh.users().len(), 2);
		let x = fresh.record_at("/docs/x.txt").unwrap();
		assert_eq!(fresh.owners(x.id).len(), 2);

		// importing twice changes nothing
		assert_eq!(fresh.import_snapshot(&origin.snapshot()).unwrap(), 0);
		assert_eq!(fresh.records().len(), 2);
	}
}

// vim: ts=4
