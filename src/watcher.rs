//! Local filesystem change events
//!
//! A watcher backend reports raw events; [`WatchedPaths`] keeps the set of
//! tracked local files and directories and turns raw events into
//! [`LocalChange`]s that only mention tracked files. A moved directory
//! becomes one old/new pair per tracked file below it.
//!
//! [`LocalChange::to_commands`] maps a change onto commands issued as the
//! node's local user. A running node accepts [`FsEvent`]s from any backend
//! through [`crate::Node::fs_events`].

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::command::Command;

/// What happened to the affected paths
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
	Added,
	Deleted,
	Modified,
	Moved,
}

/// A change to tracked local files. For `Moved`, `old_paths[i]` became
/// `new_paths[i]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalChange {
	pub kind: ChangeKind,
	pub old_paths: Vec<String>,
	pub new_paths: Vec<String>,
}

impl LocalChange {
	pub fn modified(path: &str) -> Self {
		LocalChange { kind: ChangeKind::Modified, old_paths: vec![], new_paths: vec![path.to_string()] }
	}

	pub fn deleted(path: &str) -> Self {
		LocalChange { kind: ChangeKind::Deleted, old_paths: vec![path.to_string()], new_paths: vec![] }
	}

	pub fn moved(from: &str, to: &str) -> Self {
		LocalChange {
			kind: ChangeKind::Moved,
			old_paths: vec![from.to_string()],
			new_paths: vec![to.to_string()],
		}
	}

	/// Commands describing this change. Additions produce nothing: new
	/// files are only tracked through an explicit `add_file`.
	pub fn to_commands(&self, username: &str) -> Vec<Command> {
		match self.kind {
			ChangeKind::Added => Vec::new(),
			ChangeKind::Modified => self
				.new_paths
				.iter()
				.map(|path| Command::UpdateFileContent {
					local_path: path.clone(),
					username: username.to_string(),
					content: None,
				})
				.collect(),
			ChangeKind::Deleted => self
				.old_paths
				.iter()
				.map(|path| Command::DeleteLocalFile {
					local_path: path.clone(),
					username: username.to_string(),
				})
				.collect(),
			ChangeKind::Moved => self
				.old_paths
				.iter()
				.zip(self.new_paths.iter())
				.map(|(old, new)| Command::UpdateLocalFilePath {
					old_local_path: old.clone(),
					new_local_path: new.clone(),
					username: username.to_string(),
				})
				.collect(),
		}
	}
}

/// Event as reported by a watcher backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
	Created(PathBuf),
	Removed(PathBuf),
	Written(PathBuf),
	Renamed { from: PathBuf, to: PathBuf },
}

/// Local paths the node is responsible for
#[derive(Debug, Clone, Default)]
pub struct WatchedPaths {
	files: BTreeSet<PathBuf>,
	dirs: BTreeSet<PathBuf>,
}

impl WatchedPaths {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn watch_file(&mut self, path: &Path) {
		self.files.insert(path.to_path_buf());
	}

	pub fn watch_dir(&mut self, path: &Path) {
		self.dirs.insert(path.to_path_buf());
	}

	pub fn is_watched(&self, path: &Path) -> bool {
		self.files.contains(path) || self.dirs.contains(path)
	}

	/// Translate a raw event, updating the watched set. Events about
	/// untracked paths yield `None`.
	pub fn observe(&mut self, event: FsEvent) -> Option<LocalChange> {
		match event {
			FsEvent::Created(_) => None,
			FsEvent::Written(path) => {
				self.files.contains(&path).then(|| LocalChange::modified(&lossy(&path)))
			}
			FsEvent::Removed(path) => {
				if self.files.remove(&path) {
					Some(LocalChange::deleted(&lossy(&path)))
				} else {
					None
				}
			}
			FsEvent::Renamed { from, to } => {
				if self.files.remove(&from) {
					self.files.insert(to.clone());
					return Some(LocalChange::moved(&lossy(&from), &lossy(&to)));
				}
				if self.dirs.contains(&from) {
					return Some(self.move_dir(&from, &to));
				}
				None
			}
		}
	}

	fn move_dir(&mut self, from: &Path, to: &Path) -> LocalChange {
		let rebase = |p: &Path| -> Option<PathBuf> { p.strip_prefix(from).ok().map(|rest| to.join(rest)) };

		let dirs: Vec<PathBuf> = self.dirs.iter().filter(|d| d.starts_with(from)).cloned().collect();
		for dir in dirs {
			self.dirs.remove(&dir);
			if let Some(new_dir) = rebase(&dir) {
				self.dirs.insert(new_dir);
			}
		}

		let files: Vec<PathBuf> = self.files.iter().filter(|f| f.starts_with(from)).cloned().collect();
		let mut change = LocalChange { kind: ChangeKind::Moved, old_paths: vec![], new_paths: vec![] };
		for file in files {
			self.files.remove(&file);
			if let Some(new_file) = rebase(&file) {
				change.old_paths.push(lossy(&file));
				change.new_paths.push(lossy(&new_file));
				self.files.insert(new_file);
			}
		}
		change
	}
}

fn lossy(path: &Path) -> String {
	path.to_string_lossy().into_owned()
}


// vim: ts=4
