//! Persistent record store backed by redb
//!
//! Rows are kept as JSON in four tables. The working set lives in a
//! [`MemoryRecordStore`]; after every successful mutation the rows it reports
//! as touched are written back in a single write transaction.

use redb::{ReadableDatabase, ReadableTable, TableDefinition};
use std::path::{Path, PathBuf};

use super::memory::{Change, MemoryRecordStore};
use super::*;
use crate::content::ContentInfo;
use crate::error::StoreError;
use crate::logging::*;

/// Key: user id, value: serialized User
const USERS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("users");

/// Key: record id, value: serialized FileRecord
const FILES_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("files");

/// Key: (record id, owner id), value: serialized OwnershipEdge
const OWNERS_TABLE: TableDefinition<(u64, u64), &[u8]> = TableDefinition::new("owners");

/// Counters
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");

const NEXT_ID_KEY: &str = "next_id";

pub struct RedbRecordStore {
	db: redb::Database,
	db_path: PathBuf,
	inner: MemoryRecordStore,
}

impl RedbRecordStore {
	/// Open or create the database at `db_path`
	pub fn open(db_path: &Path) -> StoreResult<Self> {
		if let Some(parent) = db_path.parent() {
			if !parent.as_os_str().is_empty() {
				std::fs::create_dir_all(parent)
					.map_err(|e| StoreError::Backend { message: e.to_string() })?;
			}
		}
		let db = redb::Database::create(db_path)?;
		{
			let write_txn = db.begin_write()?;
			let _ = write_txn.open_table(USERS_TABLE)?;
			let _ = write_txn.open_table(FILES_TABLE)?;
			let _ = write_txn.open_table(OWNERS_TABLE)?;
			let _ = write_txn.open_table(META_TABLE)?;
			write_txn.commit()?;
		}
		let inner = Self::load(&db)?;
		debug!(
			"Opened record store {} ({} users, {} records)",
			db_path.display(),
			inner.users().len(),
			inner.records().len()
		);
		Ok(RedbRecordStore { db, db_path: db_path.to_path_buf(), inner })
	}

	pub fn path(&self) -> &Path {
		&self.db_path
	}

	fn load(db: &redb::Database) -> StoreResult<MemoryRecordStore> {
		let read_txn = db.begin_read()?;

		let mut users = Vec::new();
		let table = read_txn.open_table(USERS_TABLE)?;
		for row in table.iter()? {
			let (_, value) = row?;
			users.push(serde_json::from_slice::<User>(value.value())?);
		}

		let mut files = Vec::new();
		let table = read_txn.open_table(FILES_TABLE)?;
		for row in table.iter()? {
			let (_, value) = row?;
			files.push(serde_json::from_slice::<FileRecord>(value.value())?);
		}

		let mut edges = Vec::new();
		let table = read_txn.open_table(OWNERS_TABLE)?;
		for row in table.iter()? {
			let (_, value) = row?;
			edges.push(serde_json::from_slice::<OwnershipEdge>(value.value())?);
		}

		let meta = read_txn.open_table(META_TABLE)?;
		let next_id = meta.get(NEXT_ID_KEY)?.map(|v| v.value()).unwrap_or(0);

		Ok(MemoryRecordStore::from_rows(next_id, users, files, edges))
	}

	/// Write every row touched since the last persist
	fn persist(&mut self) -> StoreResult<()> {
		let changes = self.inner.take_changes();
		if changes.is_empty() {
			return Ok(());
		}

		let write_txn = self.db.begin_write()?;
		{
			let mut users = write_txn.open_table(USERS_TABLE)?;
			let mut files = write_txn.open_table(FILES_TABLE)?;
			let mut owners = write_txn.open_table(OWNERS_TABLE)?;
			let mut meta = write_txn.open_table(META_TABLE)?;

			for change in &changes {
				match *change {
					Change::User(id) => match self.inner.user_by_id(id) {
						Some(user) => {
							users.insert(id, serde_json::to_vec(user)?.as_slice())?;
						}
						None => {
							users.remove(id)?;
						}
					},
					Change::File(id) => match self.inner.file_by_id(id) {
						Some(record) => {
							files.insert(id, serde_json::to_vec(record)?.as_slice())?;
						}
						None => {
							files.remove(id)?;
						}
					},
					Change::Edge(file_id, owner_id) => match self.inner.edge(file_id, owner_id) {
						Some(edge) => {
							owners.insert((file_id, owner_id), serde_json::to_vec(edge)?.as_slice())?;
						}
						None => {
							owners.remove((file_id, owner_id))?;
						}
					},
				}
			}
			meta.insert(NEXT_ID_KEY, self.inner.next_id())?;
		}
		write_txn.commit()?;
		Ok(())
	}

	/// Persist after a mutation. If the write fails the working set is
	/// reloaded so it matches what is on disk again.
	fn finish<T>(&mut self, result: StoreResult<T>) -> StoreResult<T> {
		let value = match result {
			Ok(value) => value,
			Err(e) => {
				self.inner.take_changes();
				return Err(e);
			}
		};
		if let Err(e) = self.persist() {
			error!("Failed to persist record store {}: {}", self.db_path.display(), e);
			match Self::load(&self.db) {
				Ok(inner) => self.inner = inner,
				Err(reload) => error!("Reloading record store failed too: {}", reload),
			}
			return Err(e);
		}
		Ok(value)
	}
}

impl RecordStore for RedbRecordStore {
	fn add_user(&mut self, username: &str, is_local: bool) -> StoreResult<User> {
		let result = self.inner.add_user(username, is_local);
		self.finish(result)
	}

	fn delete_user(&mut self, username: &str) -> StoreResult<Vec<String>> {
		let result = self.inner.delete_user(username);
		self.finish(result)
	}

	fn set_local_user(&mut self, username: &str) -> StoreResult<User> {
		let result = self.inner.set_local_user(username);
		self.finish(result)
	}

	fn user(&self, username: &str) -> Option<User> {
		self.inner.user(username)
	}

	fn local_user(&self) -> Option<User> {
		self.inner.local_user()
	}

	fn users(&self) -> Vec<User> {
		self.inner.users()
	}

	fn add_file_record(
		&mut self,
		local_source_path: &str,
		file_name: &str,
		repo_path: &str,
		owner: &str,
		content: Option<ContentInfo>,
	) -> StoreResult<AddOutcome> {
		let result = self.inner.add_file_record(local_source_path, file_name, repo_path, owner, content);
		self.finish(result)
	}

	fn add_file_records(&mut self, owner: &str, files: &[NewFile]) -> StoreResult<Vec<AddOutcome>> {
		let result = self.inner.add_file_records(owner, files);
		self.finish(result)
	}

	fn delete_local_copy(&mut self, local_path: &str, username: &str) -> StoreResult<Option<String>> {
		let result = self.inner.delete_local_copy(local_path, username);
		self.finish(result)
	}

	fn untrack_file(&mut self, full_repo_path: &str) -> StoreResult<FileRecord> {
		let result = self.inner.untrack_file(full_repo_path);
		self.finish(result)
	}

	fn untrack_folder(&mut self, repo_path: &str) -> StoreResult<Vec<FileRecord>> {
		let result = self.inner.untrack_folder(repo_path);
		self.finish(result)
	}

	fn rename_record(&mut self, repo_path: &str, old_name: &str, new_name: &str) -> StoreResult<()> {
		let result = self.inner.rename_record(repo_path, old_name, new_name);
		self.finish(result)
	}

	fn move_record_path(
		&mut self,
		file_name: &str,
		old_repo_path: &str,
		new_repo_path: &str,
	) -> StoreResult<()> {
		let result = self.inner.move_record_path(file_name, old_repo_path, new_repo_path);
		self.finish(result)
	}

	fn rename_record_folder(&mut self, old_repo_path: &str, new_repo_path: &str) -> StoreResult<usize> {
		let result = self.inner.rename_record_folder(old_repo_path, new_repo_path);
		self.finish(result)
	}

	fn update_record_content(
		&mut self,
		local_path: &str,
		username: &str,
		content: Option<ContentInfo>,
	) -> StoreResult<ContentUpdate> {
		let result = self.inner.update_record_content(local_path, username, content);
		self.finish(result)
	}

	fn update_owner_local_path(
		&mut self,
		old_local_path: &str,
		new_local_path: &str,
		username: &str,
	) -> StoreResult<()> {
		let result = self.inner.update_owner_local_path(old_local_path, new_local_path, username);
		self.finish(result)
	}

	fn update_owner_folder_path(
		&mut self,
		old_local_dir: &str,
		new_local_dir: &str,
		username: &str,
	) -> StoreResult<usize> {
		let result = self.inner.update_owner_folder_path(old_local_dir, new_local_dir, username);
		self.finish(result)
	}

	fn records(&self) -> Vec<FileRecord> {
		self.inner.records()
	}

	fn record_at(&self, full_repo_path: &str) -> Option<FileRecord> {
		self.inner.record_at(full_repo_path)
	}

	fn record_by_hash(&self, content_hash: &str) -> Option<FileRecord> {
		self.inner.record_by_hash(content_hash)
	}

	fn owners(&self, file_id: FileId) -> Vec<OwnershipEdge> {
		self.inner.owners(file_id)
	}

	fn local_copy_of(&self, content_hash: &str) -> Option<String> {
		self.inner.local_copy_of(content_hash)
	}

	fn snapshot(&self) -> StoreSnapshot {
		self.inner.snapshot()
	}

	fn import_snapshot(&mut self, snapshot: &StoreSnapshot) -> StoreResult<usize> {
		let result = self.inner.import_snapshot(snapshot);
		self.finish(result)
	}
}


// vim: ts=4
