//! Command application
//!
//! The [`SyncEngine`] owns the repository tree and the record store. Local
//! files a command refers to are read and fingerprinted first, outside the
//! lock. The command then runs under the write lock in three steps: the tree
//! preconditions are checked without changing anything, the store operation
//! runs, and only then is the tree edited. A store failure therefore never
//! leaves a tree edit behind.
//!
//! A tree edit that fails after the store already committed means the two
//! have diverged. The engine logs it, reports a consistency violation and
//! refuses every further mutation.

use std::path::Path;
use tokio::sync::RwLock;

use crate::command::Command;
use crate::content::{fingerprint_file, scan_folder, source_files, ContentInfo};
use crate::error::{StoreError, SyncError, TreeError};
use crate::logging::*;
use crate::store::{AddOutcome, NewFile, RecordStore, StoreSnapshot};
use crate::tree::{join_repo_path, NodeKind, PathTree, SourceTree};

/// Outcome of a successfully applied command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
	/// Commands peers need to replay this change
	pub relay: Vec<Command>,
}

impl Applied {
	fn relay(command: Command) -> Self {
		Applied { relay: vec![command] }
	}
}

struct EngineState {
	tree: PathTree,
	store: Box<dyn RecordStore>,
	/// Set once the tree and the store disagree
	halted: Option<String>,
}

impl EngineState {
	/// Tree edit following a committed store change
	fn commit_tree(&mut self, command: &Command, edit: Result<(), TreeError>) -> Result<(), SyncError> {
		if let Err(e) = edit {
			let message = format!("{} committed to the store but the tree edit failed: {}", command, e);
			error!("{}", message);
			self.halted = Some(message.clone());
			return Err(SyncError::ConsistencyViolation { message });
		}
		Ok(())
	}
}

/// Files of an `add_folder`, read from disk before the lock is taken
struct FolderImport {
	source: SourceTree,
	files: Vec<NewFile>,
}

impl FolderImport {
	/// Scan `local_folder` and fingerprint every regular file below it
	fn read(local_folder: &str, repo_path: &str, username: &str) -> Result<Self, SyncError> {
		let source = scan_folder(Path::new(local_folder))?;
		let mut files = Vec::new();
		for (rel_dir, file_name) in source_files(&source) {
			let local_path = Path::new(local_folder).join(&rel_dir).join(&file_name);
			let local_path = local_path.to_string_lossy().into_owned();
			let file = NewFile {
				content: fingerprint(&local_path)?,
				local_path,
				file_name,
				repo_path: join_repo_path(repo_path, &rel_dir),
			};
			relay_add(&file, &file.repo_path, username).check_wire()?;
			files.push(file);
		}
		Ok(FolderImport { source, files })
	}
}

/// A command with its local reads done
struct Prepared {
	command: Command,
	folder: Option<FolderImport>,
}

/// Single-writer owner of the repository state
pub struct SyncEngine {
	state: RwLock<EngineState>,
}

impl SyncEngine {
	/// Take over `store` and rebuild the tree from its records
	pub fn new(store: Box<dyn RecordStore>) -> Result<Self, SyncError> {
		let mut tree = PathTree::new();
		for record in store.records() {
			tree.add_file(&record.repo_path, &record.file_name)?;
		}
		debug!("Engine started with {} tracked files", tree.file_count());
		Ok(SyncEngine { state: RwLock::new(EngineState { tree, store, halted: None }) })
	}

	/// Apply one command
	pub async fn apply(&self, command: &Command) -> Result<Applied, SyncError> {
		self.run(command, false).await
	}

	/// Apply a command received from a peer. A user it acts for that this
	/// node has not seen yet is registered under the same lock, and dropped
	/// again if the command fails.
	pub async fn apply_remote(&self, command: &Command) -> Result<Applied, SyncError> {
		self.run(command, true).await
	}

	async fn run(&self, command: &Command, remote: bool) -> Result<Applied, SyncError> {
		let prepared = Self::prepare(command).await?;
		let mut state = self.state.write().await;
		if let Some(reason) = &state.halted {
			return Err(SyncError::ConsistencyViolation {
				message: format!("engine halted, refusing {}: {}", command.kind(), reason),
			});
		}

		let names_user = !matches!(command, Command::AddUser { .. } | Command::DeleteUser { .. });
		let registered = match command.username() {
			Some(username) if remote && names_user && state.store.user(username).is_none() => {
				Some(username.to_string())
			}
			_ => None,
		};
		if let Some(username) = &registered {
			state.store.add_user(username, false)?;
			info!("Registered remote user {}", username);
		}

		let result = Self::dispatch(&mut state, &prepared);
		match &result {
			Ok(_) => debug!("Applied {}", command),
			Err(e) => {
				debug!("Rejected {}: {}", command, e);
				if let Some(username) = &registered {
					if let Err(e) = state.store.delete_user(username) {
						warn!("Cannot drop remote user {} again: {}", username, e);
					}
				}
			}
		}
		result
	}

	/// Reject unsendable arguments and do the file reads the command needs
	async fn prepare(command: &Command) -> Result<Prepared, SyncError> {
		command.check_wire()?;
		let mut command = command.clone();
		let mut folder = None;
		match &mut command {
			Command::AddFile { local_path, content: content @ None, .. }
			| Command::UpdateFileContent { local_path, content: content @ None, .. } => {
				let path = local_path.clone();
				*content = Some(blocking(move || fingerprint(&path)).await?);
			}
			Command::AddFolder { local_folder, repo_path, username } => {
				let (local_folder, repo_path, username) =
					(local_folder.clone(), repo_path.clone(), username.clone());
				let import = blocking(move || FolderImport::read(&local_folder, &repo_path, &username)).await?;
				folder = Some(import);
			}
			_ => {}
		}
		Ok(Prepared { command, folder })
	}

	fn dispatch(state: &mut EngineState, prepared: &Prepared) -> Result<Applied, SyncError> {
		let command = &prepared.command;
		match command {
			Command::AddFile { local_path, repo_dir, username, content } => {
				let file_name = local_file_name(local_path)?;
				state.tree.check_add_file(repo_dir, &file_name)?;
				let outcome =
					state.store.add_file_record(local_path, &file_name, repo_dir, username, content.clone())?;
				let record = outcome.record().clone();
				let edit = state.tree.add_file(&record.repo_path, &record.file_name);
				state.commit_tree(command, edit)?;
				if outcome.is_duplicate() {
					info!("{} has the same content as {}", local_path, record.full_path());
				}
				Ok(Applied::relay(Command::AddFile {
					local_path: local_path.clone(),
					repo_dir: record.repo_path.clone(),
					username: username.clone(),
					content: Some(record.content()),
				}))
			}

			Command::AddFolder { repo_path, username, .. } => match &prepared.folder {
				Some(import) => Self::add_folder(state, command, import, repo_path, username),
				None => Err(SyncError::Other { message: format!("{} was not scanned", command) }),
			},

			Command::RenameFile { repo_dir, old_name, new_name } => {
				state.tree.check_rename_file(repo_dir, old_name, new_name)?;
				state.store.rename_record(repo_dir, old_name, new_name)?;
				let edit = state.tree.rename_file(repo_dir, old_name, new_name);
				state.commit_tree(command, edit)?;
				Ok(Applied::relay(command.clone()))
			}

			Command::RenameFolder { old_repo_path, new_repo_path } => {
				state.tree.check_rename_folder(old_repo_path, new_repo_path)?;
				let moved = state.store.rename_record_folder(old_repo_path, new_repo_path)?;
				let edit = state.tree.rename_folder(old_repo_path, new_repo_path);
				state.commit_tree(command, edit)?;
				debug!("Moved {} records from {} to {}", moved, old_repo_path, new_repo_path);
				Ok(Applied::relay(command.clone()))
			}

			Command::ChangeRepoPath { file_name, old_repo_dir, new_repo_dir } => {
				state.tree.check_move(file_name, old_repo_dir, new_repo_dir)?;
				state.store.move_record_path(file_name, old_repo_dir, new_repo_dir)?;
				let edit = state.tree.move_path(file_name, old_repo_dir, new_repo_dir);
				state.commit_tree(command, edit)?;
				Ok(Applied::relay(command.clone()))
			}

			Command::AddUser { username } => {
				state.store.add_user(username, false)?;
				Ok(Applied::relay(command.clone()))
			}

			Command::UpdateFileContent { local_path, username, content } => {
				let update = state.store.update_record_content(local_path, username, content.clone())?;
				if let Some(orphaned) = &update.orphaned {
					let edit = state.tree.delete_file(orphaned);
					state.commit_tree(command, edit)?;
				}
				Ok(Applied::relay(Command::UpdateFileContent {
					local_path: local_path.clone(),
					username: username.clone(),
					content: Some(update.record.content()),
				}))
			}

			Command::UpdateLocalFilePath { old_local_path, new_local_path, username } => {
				state.store.update_owner_local_path(old_local_path, new_local_path, username)?;
				Ok(Applied::relay(command.clone()))
			}

			Command::UpdateLocalFolderPath { old_local_dir, new_local_dir, username } => {
				let count = state.store.update_owner_folder_path(old_local_dir, new_local_dir, username)?;
				debug!("Rewrote {} local paths of {}", count, username);
				Ok(Applied::relay(command.clone()))
			}

			Command::UntrackFile { full_repo_path } => {
				state.tree.check_delete(full_repo_path, NodeKind::File)?;
				state.store.untrack_file(full_repo_path)?;
				let edit = state.tree.delete_file(full_repo_path);
				state.commit_tree(command, edit)?;
				Ok(Applied::relay(command.clone()))
			}

			Command::UntrackFolder { repo_path } => {
				state.tree.check_delete(repo_path, NodeKind::Directory)?;
				let removed = state.store.untrack_folder(repo_path)?;
				let edit = state.tree.delete_folder(repo_path);
				state.commit_tree(command, edit)?;
				debug!("Untracked {} records below {}", removed.len(), repo_path);
				Ok(Applied::relay(command.clone()))
			}

			Command::DeleteLocalFile { local_path, username } => {
				if let Some(orphaned) = state.store.delete_local_copy(local_path, username)? {
					let edit = state.tree.delete_file(&orphaned);
					state.commit_tree(command, edit)?;
					info!("{} has no owners left, removed", orphaned);
				}
				Ok(Applied::relay(command.clone()))
			}

			Command::DeleteUser { username } => {
				let orphaned = state.store.delete_user(username)?;
				let edit = state.tree.delete_files(&orphaned);
				state.commit_tree(command, edit)?;
				Ok(Applied::relay(command.clone()))
			}
		}
	}

	/// Import a scanned folder. The records are added in one store call, so
	/// a rejected file leaves neither the store nor the tree changed.
	fn add_folder(
		state: &mut EngineState,
		command: &Command,
		import: &FolderImport,
		repo_path: &str,
		username: &str,
	) -> Result<Applied, SyncError> {
		state.tree.check_add_folder(repo_path, &import.source)?;
		let outcomes = state.store.add_file_records(username, &import.files)?;

		let edit = state.tree.add_folder(repo_path, &directories_only(&import.source)).and_then(|_| {
			outcomes
				.iter()
				.map(AddOutcome::record)
				.try_for_each(|record| state.tree.add_file(&record.repo_path, &record.file_name))
		});
		state.commit_tree(command, edit)?;

		let relay = import
			.files
			.iter()
			.zip(&outcomes)
			.map(|(file, outcome)| relay_add(file, &outcome.record().repo_path, username))
			.collect();
		Ok(Applied { relay })
	}

	// ------------------------------------------------------------------
	// Read side
	// ------------------------------------------------------------------

	/// Paths of every node called `name`, see [`PathTree::find_all_paths`]
	pub async fn find_all_paths(&self, name: &str) -> Vec<String> {
		self.state.read().await.tree.find_all_paths(name)
	}

	pub async fn render_tree(&self) -> String {
		self.state.read().await.tree.render()
	}

	/// Run a read-only closure against the current tree and store
	pub async fn inspect<R>(&self, f: impl FnOnce(&PathTree, &dyn RecordStore) -> R) -> R {
		let state = self.state.read().await;
		f(&state.tree, state.store.as_ref())
	}

	pub async fn snapshot(&self) -> StoreSnapshot {
		self.state.read().await.store.snapshot()
	}

	/// Local path of a copy of `hash` held by this node's user
	pub async fn local_copy_of(&self, hash: &str) -> Option<String> {
		self.state.read().await.store.local_copy_of(hash)
	}

	/// Local paths of every copy held by this node's user
	pub async fn local_paths(&self) -> Vec<String> {
		let state = self.state.read().await;
		let local = match state.store.local_user() {
			Some(user) => user,
			None => return Vec::new(),
		};
		state
			.store
			.records()
			.iter()
			.flat_map(|record| state.store.owners(record.id))
			.filter(|edge| edge.owner_user_id == local.id)
			.map(|edge| edge.local_path)
			.collect()
	}

	pub async fn local_username(&self) -> Option<String> {
		self.state.read().await.store.local_user().map(|u| u.username)
	}

	/// Fingerprint of the record at `full_repo_path`
	pub async fn content_at(&self, full_repo_path: &str) -> Option<ContentInfo> {
		self.state.read().await.store.record_at(full_repo_path).map(|r| r.content())
	}

	pub async fn is_halted(&self) -> bool {
		self.state.read().await.halted.is_some()
	}

	// ------------------------------------------------------------------
	// Administrative
	// ------------------------------------------------------------------

	/// Make `username` this node's identity, registering it if needed
	pub async fn register_local_user(&self, username: &str) -> Result<(), SyncError> {
		let mut state = self.state.write().await;
		if state.store.user(username).is_some() {
			state.store.set_local_user(username)?;
		} else {
			state.store.add_user(username, true)?;
			info!("Registered local user {}", username);
		}
		Ok(())
	}

	/// Merge a peer's snapshot and add the new records to the tree
	pub async fn import_snapshot(&self, snapshot: &StoreSnapshot) -> Result<usize, SyncError> {
		let mut guard = self.state.write().await;
		let state = &mut *guard;
		if state.halted.is_some() {
			return Err(SyncError::ConsistencyViolation { message: "engine halted".to_string() });
		}
		let imported = state.store.import_snapshot(snapshot)?;
		for record in state.store.records() {
			if !state.tree.contains_file(&record.full_path()) {
				if let Err(e) = state.tree.add_file(&record.repo_path, &record.file_name) {
					let message = format!("imported record {} does not fit the tree: {}", record.full_path(), e);
					error!("{}", message);
					state.halted = Some(message.clone());
					return Err(SyncError::ConsistencyViolation { message });
				}
			}
		}
		Ok(imported)
	}
}

/// Run blocking file reads off the async workers
async fn blocking<T, F>(f: F) -> Result<T, SyncError>
where
	T: Send + 'static,
	F: FnOnce() -> Result<T, SyncError> + Send + 'static,
{
	tokio::task::spawn_blocking(f)
		.await
		.map_err(|e| SyncError::Other { message: format!("file read task failed: {}", e) })?
}

fn fingerprint(local_path: &str) -> Result<ContentInfo, SyncError> {
	fingerprint_file(Path::new(local_path)).map_err(|source| {
		SyncError::StoreApplyFailed(StoreError::ContentUnavailable { path: local_path.to_string(), source })
	})
}

fn relay_add(file: &NewFile, repo_dir: &str, username: &str) -> Command {
	Command::AddFile {
		local_path: file.local_path.clone(),
		repo_dir: repo_dir.to_string(),
		username: username.to_string(),
		content: Some(file.content.clone()),
	}
}

fn local_file_name(local_path: &str) -> Result<String, SyncError> {
	Path::new(local_path)
		.file_name()
		.and_then(|name| name.to_str())
		.map(str::to_string)
		.ok_or_else(|| SyncError::Tree(TreeError::EmptyPath))
}

fn directories_only(source: &SourceTree) -> SourceTree {
	SourceTree {
		files: Vec::new(),
		dirs: source.dirs.iter().map(|(name, sub)| (name.clone(), directories_only(sub))).collect(),
	}
}


// vim: ts=4
