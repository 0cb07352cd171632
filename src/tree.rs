//! In-memory repository namespace
//!
//! The tree mirrors the set of tracked files as a strict hierarchy of
//! directories and files under a single root named [`ROOT_NAME`]. Paths are
//! slash-delimited; empty segments are ignored, so `/docs//a` and `docs/a`
//! resolve to the same node.
//!
//! Every mutating operation validates all of its preconditions before it
//! touches the tree, so a failed call leaves the tree exactly as it was.
//! The same checks are exposed as `check_*` methods, which the sync engine
//! runs before committing anything to the record store.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::TreeError;

/// Name of the root directory
pub const ROOT_NAME: &str = "DecRep";

/// Kind tag of a tree node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
	File,
	Directory,
}

impl fmt::Display for NodeKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			NodeKind::File => write!(f, "file"),
			NodeKind::Directory => write!(f, "directory"),
		}
	}
}

/// A tree element; directories own their children
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
	File { name: String },
	Directory { name: String, children: BTreeMap<String, Node> },
}

impl Node {
	fn file(name: &str) -> Self {
		Node::File { name: name.to_string() }
	}

	fn directory(name: &str) -> Self {
		Node::Directory { name: name.to_string(), children: BTreeMap::new() }
	}

	pub fn name(&self) -> &str {
		match self {
			Node::File { name } | Node::Directory { name, .. } => name,
		}
	}

	pub fn kind(&self) -> NodeKind {
		match self {
			Node::File { .. } => NodeKind::File,
			Node::Directory { .. } => NodeKind::Directory,
		}
	}

	fn set_name(&mut self, new_name: &str) {
		match self {
			Node::File { name } | Node::Directory { name, .. } => *name = new_name.to_string(),
		}
	}
}

/// Snapshot of a directory on some filesystem, used to import folders
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceTree {
	pub files: Vec<String>,
	pub dirs: BTreeMap<String, SourceTree>,
}

impl SourceTree {
	/// Number of files, recursively
	pub fn file_count(&self) -> usize {
		self.files.len() + self.dirs.values().map(SourceTree::file_count).sum::<usize>()
	}
}

/// Split a path into its non-empty segments
pub fn split_path(path: &str) -> Vec<&str> {
	path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Canonical repo path: leading slash, no empty segments, `/` for the root
pub fn normalize_repo_path(path: &str) -> String {
	format!("/{}", split_path(path).join("/"))
}

/// Join a repo directory and an entry name into a canonical full path
pub fn join_repo_path(dir: &str, name: &str) -> String {
	let dir = normalize_repo_path(dir);
	if dir == "/" {
		format!("/{}", name)
	} else {
		format!("{}/{}", dir, name)
	}
}

/// Split a full repo path into (parent directory, leaf name)
pub fn split_full_path(full_path: &str) -> Option<(String, String)> {
	let segments = split_path(full_path);
	let (leaf, parents) = segments.split_last()?;
	Some((format!("/{}", parents.join("/")), leaf.to_string()))
}

/// Whether `path` equals `base` or lies below it (both canonical)
pub fn is_within(path: &str, base: &str) -> bool {
	base == "/" || path == base || path.starts_with(&format!("{}/", base))
}

fn display(segments: &[&str]) -> String {
	format!("/{}", segments.join("/"))
}

type Children = BTreeMap<String, Node>;

/// The repository namespace
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathTree {
	root: Children,
}

impl PathTree {
	pub fn new() -> Self {
		PathTree { root: BTreeMap::new() }
	}

	// ------------------------------------------------------------------
	// Resolution helpers
	// ------------------------------------------------------------------

	fn find_dir(&self, segments: &[&str]) -> Result<&Children, TreeError> {
		let mut children = &self.root;
		for (i, segment) in segments.iter().enumerate() {
			children = match children.get(*segment) {
				Some(Node::Directory { children, .. }) => children,
				Some(Node::File { .. }) => {
					return Err(TreeError::NotADirectory { path: display(&segments[..=i]) })
				}
				None => return Err(TreeError::NotFound { path: display(&segments[..=i]) }),
			};
		}
		Ok(children)
	}

	fn find_dir_mut(&mut self, segments: &[&str]) -> Result<&mut Children, TreeError> {
		let mut children = &mut self.root;
		for (i, segment) in segments.iter().enumerate() {
			children = match children.get_mut(*segment) {
				Some(Node::Directory { children, .. }) => children,
				Some(Node::File { .. }) => {
					return Err(TreeError::NotADirectory { path: display(&segments[..=i]) })
				}
				None => return Err(TreeError::NotFound { path: display(&segments[..=i]) }),
			};
		}
		Ok(children)
	}

	/// Directory children at `segments` if it exists; errors only when a
	/// segment is a file, so missing directories can be created later
	fn existing_prefix(&self, segments: &[&str]) -> Result<Option<&Children>, TreeError> {
		match self.find_dir(segments) {
			Ok(children) => Ok(Some(children)),
			Err(TreeError::NotFound { .. }) => Ok(None),
			Err(e) => Err(e),
		}
	}

	fn ensure_dir(&mut self, segments: &[&str]) -> Result<&mut Children, TreeError> {
		let mut children = &mut self.root;
		for (i, segment) in segments.iter().enumerate() {
			let node = children.entry(segment.to_string()).or_insert_with(|| Node::directory(segment));
			children = match node {
				Node::Directory { children, .. } => children,
				Node::File { .. } => {
					return Err(TreeError::NotADirectory { path: display(&segments[..=i]) })
				}
			};
		}
		Ok(children)
	}

	fn resolve(&self, path: &str) -> Option<&Node> {
		let segments = split_path(path);
		let (leaf, parents) = segments.split_last()?;
		self.find_dir(parents).ok()?.get(*leaf)
	}

	// ------------------------------------------------------------------
	// Queries
	// ------------------------------------------------------------------

	/// Kind of the node at `path`; the empty path is the root directory
	pub fn node_kind(&self, path: &str) -> Option<NodeKind> {
		if split_path(path).is_empty() {
			return Some(NodeKind::Directory);
		}
		self.resolve(path).map(Node::kind)
	}

	pub fn contains_file(&self, path: &str) -> bool {
		self.node_kind(path) == Some(NodeKind::File)
	}

	pub fn contains_dir(&self, path: &str) -> bool {
		self.node_kind(path) == Some(NodeKind::Directory)
	}

	/// Total number of file nodes
	pub fn file_count(&self) -> usize {
		fn count(children: &Children) -> usize {
			children
				.values()
				.map(|node| match node {
					Node::File { .. } => 1,
					Node::Directory { children, .. } => count(children),
				})
				.sum()
		}
		count(&self.root)
	}

	/// Full paths (rooted at `DecRep`) of every node called `name`
	///
	/// Depth-first, children in lexicographic order. The root itself matches
	/// when `name` is [`ROOT_NAME`].
	pub fn find_all_paths(&self, name: &str) -> Vec<String> {
		fn walk(children: &Children, name: &str, prefix: &str, out: &mut Vec<String>) {
			for node in children.values() {
				let path = format!("{}/{}", prefix, node.name());
				if node.name() == name {
					out.push(path.clone());
				}
				if let Node::Directory { children, .. } = node {
					walk(children, name, &path, out);
				}
			}
		}

		let mut out = Vec::new();
		if name == ROOT_NAME {
			out.push(ROOT_NAME.to_string());
		}
		walk(&self.root, name, ROOT_NAME, &mut out);
		out
	}

	/// Indented listing, two spaces per level
	pub fn render(&self) -> String {
		fn walk(children: &Children, level: usize, out: &mut String) {
			for node in children.values() {
				out.push_str(&" ".repeat(level));
				out.push_str(node.name());
				out.push('\n');
				if let Node::Directory { children, .. } = node {
					walk(children, level + 2, out);
				}
			}
		}

		let mut out = format!("{}\n", ROOT_NAME);
		walk(&self.root, 2, &mut out);
		out
	}

	// ------------------------------------------------------------------
	// Precondition checks
	// ------------------------------------------------------------------

	pub fn check_add_file(&self, dir_path: &str, file_name: &str) -> Result<(), TreeError> {
		if file_name.is_empty() || file_name.contains('/') {
			return Err(TreeError::EmptyPath);
		}
		let segments = split_path(dir_path);
		if let Some(children) = self.existing_prefix(&segments)? {
			if let Some(Node::Directory { .. }) = children.get(file_name) {
				return Err(TreeError::WrongNodeKind {
					path: join_repo_path(dir_path, file_name),
					expected: NodeKind::File,
				});
			}
		}
		Ok(())
	}

	pub fn check_add_folder(&self, repo_path: &str, source: &SourceTree) -> Result<(), TreeError> {
		fn check_mirror(
			existing: Option<&Children>,
			source: &SourceTree,
			path: &str,
		) -> Result<(), TreeError> {
			let existing = match existing {
				Some(children) => children,
				None => return Ok(()),
			};
			for file in &source.files {
				if let Some(Node::Directory { .. }) = existing.get(file) {
					return Err(TreeError::WrongNodeKind {
						path: join_repo_path(path, file),
						expected: NodeKind::File,
					});
				}
			}
			for (name, sub) in &source.dirs {
				let sub_path = join_repo_path(path, name);
				match existing.get(name) {
					Some(Node::File { .. }) => {
						return Err(TreeError::NotADirectory { path: sub_path })
					}
					Some(Node::Directory { children, .. }) => {
						check_mirror(Some(children), sub, &sub_path)?
					}
					None => {}
				}
			}
			Ok(())
		}

		let segments = split_path(repo_path);
		let existing = self.existing_prefix(&segments)?;
		check_mirror(existing, source, &normalize_repo_path(repo_path))
	}

	pub fn check_delete(&self, full_path: &str, expected: NodeKind) -> Result<(), TreeError> {
		let segments = split_path(full_path);
		let (leaf, parents) = segments.split_last().ok_or(TreeError::EmptyPath)?;
		let parent = self.find_dir(parents)?;
		match parent.get(*leaf) {
			None => Err(TreeError::NotFound { path: display(&segments) }),
			Some(node) if node.kind() != expected => {
				Err(TreeError::WrongNodeKind { path: display(&segments), expected })
			}
			Some(_) => Ok(()),
		}
	}

	pub fn check_rename_file(
		&self,
		dir_path: &str,
		old_name: &str,
		new_name: &str,
	) -> Result<(), TreeError> {
		if new_name.is_empty() || new_name.contains('/') {
			return Err(TreeError::EmptyPath);
		}
		let parent = self.find_dir(&split_path(dir_path))?;
		match parent.get(old_name) {
			None => return Err(TreeError::NotFound { path: join_repo_path(dir_path, old_name) }),
			Some(Node::Directory { .. }) => {
				return Err(TreeError::WrongNodeKind {
					path: join_repo_path(dir_path, old_name),
					expected: NodeKind::File,
				})
			}
			Some(Node::File { .. }) => {}
		}
		if parent.contains_key(new_name) {
			return Err(TreeError::AlreadyExists { path: join_repo_path(dir_path, new_name) });
		}
		Ok(())
	}

	pub fn check_rename_folder(&self, old_path: &str, new_path: &str) -> Result<(), TreeError> {
		let old = normalize_repo_path(old_path);
		let new = normalize_repo_path(new_path);
		if old == "/" || new == "/" {
			return Err(TreeError::EmptyPath);
		}
		if is_within(&new, &old) {
			return Err(TreeError::InvalidMove { from: old, to: new });
		}
		self.check_delete(&old, NodeKind::Directory)?;

		let new_segments = split_path(&new);
		if let Some((leaf, parents)) = new_segments.split_last() {
			if let Some(children) = self.existing_prefix(parents)? {
				if children.contains_key(*leaf) {
					return Err(TreeError::AlreadyExists { path: new });
				}
			}
		}
		Ok(())
	}

	pub fn check_move(&self, name: &str, old_parent: &str, new_parent: &str) -> Result<(), TreeError> {
		let source = self.find_dir(&split_path(old_parent))?;
		let node = source
			.get(name)
			.ok_or_else(|| TreeError::NotFound { path: join_repo_path(old_parent, name) })?;

		let from = join_repo_path(old_parent, name);
		let target = normalize_repo_path(new_parent);
		if node.kind() == NodeKind::Directory && is_within(&target, &from) {
			return Err(TreeError::InvalidMove { from, to: join_repo_path(&target, name) });
		}
		if let Some(children) = self.existing_prefix(&split_path(&target))? {
			if children.contains_key(name) {
				return Err(TreeError::AlreadyExists { path: join_repo_path(&target, name) });
			}
		}
		Ok(())
	}

	// ------------------------------------------------------------------
	// Mutations
	// ------------------------------------------------------------------

	/// Insert a file, creating missing parent directories. Re-adding an
	/// existing file is a no-op.
	pub fn add_file(&mut self, dir_path: &str, file_name: &str) -> Result<(), TreeError> {
		self.check_add_file(dir_path, file_name)?;
		let parent = self.ensure_dir(&split_path(dir_path))?;
		parent.entry(file_name.to_string()).or_insert_with(|| Node::file(file_name));
		Ok(())
	}

	/// Create the directory at `repo_path` and mirror `source` into it
	pub fn add_folder(&mut self, repo_path: &str, source: &SourceTree) -> Result<(), TreeError> {
		fn mirror(children: &mut Children, source: &SourceTree) {
			for file in &source.files {
				children.entry(file.clone()).or_insert_with(|| Node::file(file));
			}
			for (name, sub) in &source.dirs {
				let node = children.entry(name.clone()).or_insert_with(|| Node::directory(name));
				if let Node::Directory { children, .. } = node {
					mirror(children, sub);
				}
			}
		}

		self.check_add_folder(repo_path, source)?;
		let target = self.ensure_dir(&split_path(repo_path))?;
		mirror(target, source);
		Ok(())
	}

	pub fn delete_file(&mut self, full_path: &str) -> Result<(), TreeError> {
		self.remove(full_path, NodeKind::File).map(|_| ())
	}

	pub fn delete_folder(&mut self, full_path: &str) -> Result<(), TreeError> {
		self.remove(full_path, NodeKind::Directory).map(|_| ())
	}

	/// Remove each listed file
	pub fn delete_files<S: AsRef<str>>(&mut self, full_paths: &[S]) -> Result<(), TreeError> {
		for path in full_paths {
			self.delete_file(path.as_ref())?;
		}
		Ok(())
	}

	fn remove(&mut self, full_path: &str, expected: NodeKind) -> Result<Node, TreeError> {
		self.check_delete(full_path, expected)?;
		let segments = split_path(full_path);
		let (leaf, parents) = segments.split_last().ok_or(TreeError::EmptyPath)?;
		self.find_dir_mut(parents)?
			.remove(*leaf)
			.ok_or_else(|| TreeError::NotFound { path: display(&segments) })
	}

	pub fn rename_file(
		&mut self,
		dir_path: &str,
		old_name: &str,
		new_name: &str,
	) -> Result<(), TreeError> {
		self.check_rename_file(dir_path, old_name, new_name)?;
		let parent = self.find_dir_mut(&split_path(dir_path))?;
		let mut node = parent
			.remove(old_name)
			.ok_or_else(|| TreeError::NotFound { path: join_repo_path(dir_path, old_name) })?;
		node.set_name(new_name);
		parent.insert(new_name.to_string(), node);
		Ok(())
	}

	/// Move a directory (with its subtree) to `new_path`
	pub fn rename_folder(&mut self, old_path: &str, new_path: &str) -> Result<(), TreeError> {
		self.check_rename_folder(old_path, new_path)?;
		let mut node = self.remove(old_path, NodeKind::Directory)?;

		let new_segments = split_path(new_path);
		let (leaf, parents) = new_segments.split_last().ok_or(TreeError::EmptyPath)?;
		node.set_name(leaf);
		self.ensure_dir(parents)?.insert(leaf.to_string(), node);
		Ok(())
	}

	/// Relocate the child `name` of `old_parent` under `new_parent`
	pub fn move_path(&mut self, name: &str, old_parent: &str, new_parent: &str) -> Result<(), TreeError> {
		self.check_move(name, old_parent, new_parent)?;
		let node = self
			.find_dir_mut(&split_path(old_parent))?
			.remove(name)
			.ok_or_else(|| TreeError::NotFound { path: join_repo_path(old_parent, name) })?;
		self.ensure_dir(&split_path(new_parent))?.insert(name.to_string(), node);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn source(files: &[&str], dirs: Vec<(&str, SourceTree)>) -> SourceTree {
		SourceTree {
			files: files.iter().map(|f| f.to_string()).collect(),
			dirs: dirs.into_iter().map(|(n, t)| (n.to_string(), t)).collect(),
		}
	}

	#[test]
	fn test_path_helpers() {
		assert_eq!(split_path("//docs///a/"), vec!["docs", "a"]);
		assert_eq!(normalize_repo_path("docs//a/"), "/docs/a");
		assert_eq!(normalize_repo_path(""), "/");
		assert_eq!(join_repo_path("/", "x.txt"), "/x.txt");
		assert_eq!(join_repo_path("docs/", "x.txt"), "/docs/x.txt");
		assert_eq!(split_full_path("/docs/x.txt"), Some(("/docs".into(), "x.txt".into())));
		assert_eq!(split_full_path("/x.txt"), Some(("/".into(), "x.txt".into())));
		assert_eq!(split_full_path("/"), None);
		assert!(is_within("/a/b", "/a"));
		assert!(is_within("/a", "/a"));
		assert!(!is_within("/ab", "/a"));
	}

	#[test]
	fn test_add_file_creates_parents() {
		let mut tree = PathTree::new();
		tree.add_file("/docs/reports", "q1.txt").unwrap();
		assert!(tree.contains_dir("/docs"));
		assert!(tree.contains_dir("/docs/reports"));
		assert!(tree.contains_file("/docs/reports/q1.txt"));
		assert_eq!(tree.file_count(), 1);
	}

	#[test]
	fn test_add_file_is_idempotent() {
		let mut once = PathTree::new();
		once.add_file("/docs", "x.txt").unwrap();

		let mut twice = PathTree::new();
		twice.add_file("/docs", "x.txt").unwrap();
		twice.add_file("docs/", "x.txt").unwrap();

		assert_eq!(once, twice);
	}

	#[test]
	fn test_add_file_through_file_fails_without_changes() {
		let mut tree = PathTree::new();
		tree.add_file("/docs", "x.txt").unwrap();
		let before = tree.clone();

		let err = tree.add_file("/docs/x.txt/deeper", "y.txt").unwrap_err();
		assert_eq!(err, TreeError::NotADirectory { path: "/docs/x.txt".into() });
		assert_eq!(tree, before);
	}

	#[test]
	fn test_add_folder_mirrors_source() {
		let mut tree = PathTree::new();
		let src = source(&["a.txt", "b.txt"], vec![("sub", source(&["c.txt"], vec![]))]);
		tree.add_folder("/projects/demo", &src).unwrap();

		assert!(tree.contains_file("/projects/demo/a.txt"));
		assert!(tree.contains_file("/projects/demo/b.txt"));
		assert!(tree.contains_file("/projects/demo/sub/c.txt"));
		assert_eq!(tree.file_count(), 3);
	}

	#[test]
	fn test_add_folder_conflicting_kind() {
		let mut tree = PathTree::new();
		tree.add_file("/projects/demo", "sub").unwrap();
		let src = source(&[], vec![("sub", source(&["c.txt"], vec![]))]);
		let before = tree.clone();
		assert!(matches!(
			tree.add_folder("/projects/demo", &src),
			Err(TreeError::NotADirectory { .. })
		));
		assert_eq!(tree, before);
	}

	#[test]
	fn test_delete_file_and_folder() {
		let mut tree = PathTree::new();
		tree.add_file("/docs", "x.txt").unwrap();
		tree.add_file("/docs/sub", "y.txt").unwrap();

		assert_eq!(
			tree.delete_file("/docs/sub"),
			Err(TreeError::WrongNodeKind { path: "/docs/sub".into(), expected: NodeKind::File })
		);
		assert_eq!(
			tree.delete_folder("/docs/x.txt"),
			Err(TreeError::WrongNodeKind {
				path: "/docs/x.txt".into(),
				expected: NodeKind::Directory
			})
		);
		assert_eq!(
			tree.delete_file("/docs/missing.txt"),
			Err(TreeError::NotFound { path: "/docs/missing.txt".into() })
		);
		assert_eq!(tree.delete_file("/"), Err(TreeError::EmptyPath));

		tree.delete_file("/docs/x.txt").unwrap();
		assert!(!tree.contains_file("/docs/x.txt"));
		tree.delete_folder("/docs/sub").unwrap();
		assert!(tree.contains_dir("/docs"));
		assert_eq!(tree.file_count(), 0);
	}

	#[test]
	fn test_rename_file() {
		let mut tree = PathTree::new();
		tree.add_file("/docs", "a.txt").unwrap();
		tree.add_file("/docs", "b.txt").unwrap();

		assert!(matches!(
			tree.rename_file("/docs", "a.txt", "b.txt"),
			Err(TreeError::AlreadyExists { .. })
		));
		assert!(matches!(
			tree.rename_file("/docs", "zzz.txt", "c.txt"),
			Err(TreeError::NotFound { .. })
		));

		tree.rename_file("/docs", "a.txt", "c.txt").unwrap();
		assert!(tree.contains_file("/docs/c.txt"));
		assert!(!tree.contains_file("/docs/a.txt"));
		assert_eq!(tree.find_all_paths("c.txt"), vec!["DecRep/docs/c.txt"]);
	}

	#[test]
	fn test_rename_folder_into_itself_fails() {
		let mut tree = PathTree::new();
		tree.add_file("/a", "x.txt").unwrap();
		let before = tree.clone();

		assert!(matches!(tree.rename_folder("/a", "/a/b"), Err(TreeError::InvalidMove { .. })));
		assert!(matches!(tree.rename_folder("/a", "/a"), Err(TreeError::InvalidMove { .. })));
		assert_eq!(tree, before);
	}

	#[test]
	fn test_rename_folder_moves_subtree() {
		let mut tree = PathTree::new();
		tree.add_file("/a/inner", "x.txt").unwrap();
		tree.add_file("/other", "y.txt").unwrap();

		assert!(matches!(tree.rename_folder("/a", "/other"), Err(TreeError::AlreadyExists { .. })));

		tree.rename_folder("/a", "/archive/2024/a-renamed").unwrap();
		assert!(!tree.contains_dir("/a"));
		assert!(tree.contains_file("/archive/2024/a-renamed/inner/x.txt"));
		// sibling prefix is not a nesting
		tree.rename_folder("/other", "/other-2").unwrap();
		assert!(tree.contains_file("/other-2/y.txt"));
	}

	#[test]
	fn test_move_path() {
		let mut tree = PathTree::new();
		tree.add_file("/in", "x.txt").unwrap();
		tree.add_file("/out", "x.txt").unwrap();

		assert!(matches!(tree.move_path("x.txt", "/in", "/out"), Err(TreeError::AlreadyExists { .. })));
		tree.move_path("x.txt", "/in", "/elsewhere/deep").unwrap();
		assert!(tree.contains_file("/elsewhere/deep/x.txt"));
		assert!(tree.contains_dir("/in"));
		assert!(!tree.contains_file("/in/x.txt"));

		assert!(matches!(
			tree.move_path("elsewhere", "/", "/elsewhere/deep"),
			Err(TreeError::InvalidMove { .. })
		));
	}

	#[test]
	fn test_find_all_paths_is_depth_first_and_sorted() {
		let mut tree = PathTree::new();
		tree.add_file("/b", "note.txt").unwrap();
		tree.add_file("/a/deep", "note.txt").unwrap();
		tree.add_file("/a", "note.txt").unwrap();

		assert_eq!(
			tree.find_all_paths("note.txt"),
			vec!["DecRep/a/deep/note.txt", "DecRep/a/note.txt", "DecRep/b/note.txt"]
		);
		assert!(tree.find_all_paths("absent").is_empty());
		assert_eq!(tree.find_all_paths(ROOT_NAME), vec!["DecRep"]);
	}

	#[test]
	fn test_render() {
		let mut tree = PathTree::new();
		tree.add_file("/docs", "x.txt").unwrap();
		assert_eq!(tree.render(), "DecRep\n  docs\n    x.txt\n");
	}
}

// vim: ts=4
