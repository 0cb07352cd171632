//! Command wire format
//!
//! Every repository mutation is a [`Command`]. On the wire a command is one
//! line: the command name followed by its arguments, joined by `/`.
//! Arguments that are empty or contain `/` are wrapped in double quotes:
//!
//! ```text
//! add_file/"/home/user/doc.txt"/"/docs"/alice
//! ```
//!
//! Tokenizing extracts quoted spans first; everything between them is split
//! on `/` and empty pieces are dropped. A quoted span is always a token, even
//! when it is empty. Quotes cannot be nested or escaped, so an argument
//! holding a `"` or a line break has no wire form; [`Command::check_wire`]
//! rejects such commands.

use std::fmt;

use crate::content::ContentInfo;
use crate::error::ParseError;

/// Command names, in wire form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
	AddFile,
	AddFolder,
	RenameFile,
	RenameFolder,
	ChangeRepoPath,
	AddUser,
	UpdateFileContent,
	UpdateLocalFilePath,
	UpdateLocalFolderPath,
	UntrackFile,
	UntrackFolder,
	DeleteLocalFile,
	DeleteUser,
}

impl CommandKind {
	pub const ALL: [CommandKind; 13] = [
		CommandKind::AddFile,
		CommandKind::AddFolder,
		CommandKind::RenameFile,
		CommandKind::RenameFolder,
		CommandKind::ChangeRepoPath,
		CommandKind::AddUser,
		CommandKind::UpdateFileContent,
		CommandKind::UpdateLocalFilePath,
		CommandKind::UpdateLocalFolderPath,
		CommandKind::UntrackFile,
		CommandKind::UntrackFolder,
		CommandKind::DeleteLocalFile,
		CommandKind::DeleteUser,
	];

	pub fn name(self) -> &'static str {
		match self {
			CommandKind::AddFile => "add_file",
			CommandKind::AddFolder => "add_folder",
			CommandKind::RenameFile => "rename_file",
			CommandKind::RenameFolder => "rename_folder",
			CommandKind::ChangeRepoPath => "change_repo_path",
			CommandKind::AddUser => "add_user",
			CommandKind::UpdateFileContent => "update_file",
			CommandKind::UpdateLocalFilePath => "update_local_path",
			CommandKind::UpdateLocalFolderPath => "update_local_folder_path",
			CommandKind::UntrackFile => "untrack_file",
			CommandKind::UntrackFolder => "untrack_folder",
			CommandKind::DeleteLocalFile => "delete_local_file",
			CommandKind::DeleteUser => "delete_user",
		}
	}

	pub fn from_name(name: &str) -> Option<CommandKind> {
		CommandKind::ALL.iter().copied().find(|kind| kind.name() == name)
	}

	/// Required argument count
	pub fn arity(self) -> usize {
		match self {
			CommandKind::AddFile => 3,
			CommandKind::AddFolder => 3,
			CommandKind::RenameFile => 3,
			CommandKind::RenameFolder => 2,
			CommandKind::ChangeRepoPath => 3,
			CommandKind::AddUser => 1,
			CommandKind::UpdateFileContent => 2,
			CommandKind::UpdateLocalFilePath => 3,
			CommandKind::UpdateLocalFolderPath => 3,
			CommandKind::UntrackFile => 1,
			CommandKind::UntrackFolder => 1,
			CommandKind::DeleteLocalFile => 2,
			CommandKind::DeleteUser => 1,
		}
	}

	/// Whether the command may carry a trailing `hash/size` fingerprint
	pub fn takes_fingerprint(self) -> bool {
		matches!(self, CommandKind::AddFile | CommandKind::UpdateFileContent)
	}

	fn expected(self) -> String {
		if self.takes_fingerprint() {
			format!("{} or {}", self.arity(), self.arity() + 2)
		} else {
			self.arity().to_string()
		}
	}
}

impl fmt::Display for CommandKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.name())
	}
}

/// A repository mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
	/// Track a local file under `repo_dir`
	AddFile { local_path: String, repo_dir: String, username: String, content: Option<ContentInfo> },

	/// Track every file of a local folder, mirrored under `repo_path`
	AddFolder { local_folder: String, repo_path: String, username: String },

	RenameFile { repo_dir: String, old_name: String, new_name: String },

	RenameFolder { old_repo_path: String, new_repo_path: String },

	/// Move a file to another repo directory, keeping its name
	ChangeRepoPath { file_name: String, old_repo_dir: String, new_repo_dir: String },

	AddUser { username: String },

	/// The local copy changed content
	UpdateFileContent { local_path: String, username: String, content: Option<ContentInfo> },

	UpdateLocalFilePath { old_local_path: String, new_local_path: String, username: String },

	UpdateLocalFolderPath { old_local_dir: String, new_local_dir: String, username: String },

	/// Stop tracking a file regardless of who owns it
	UntrackFile { full_repo_path: String },

	UntrackFolder { repo_path: String },

	/// The user's local copy is gone
	DeleteLocalFile { local_path: String, username: String },

	DeleteUser { username: String },
}

impl Command {
	pub fn kind(&self) -> CommandKind {
		match self {
			Command::AddFile { .. } => CommandKind::AddFile,
			Command::AddFolder { .. } => CommandKind::AddFolder,
			Command::RenameFile { .. } => CommandKind::RenameFile,
			Command::RenameFolder { .. } => CommandKind::RenameFolder,
			Command::ChangeRepoPath { .. } => CommandKind::ChangeRepoPath,
			Command::AddUser { .. } => CommandKind::AddUser,
			Command::UpdateFileContent { .. } => CommandKind::UpdateFileContent,
			Command::UpdateLocalFilePath { .. } => CommandKind::UpdateLocalFilePath,
			Command::UpdateLocalFolderPath { .. } => CommandKind::UpdateLocalFolderPath,
			Command::UntrackFile { .. } => CommandKind::UntrackFile,
			Command::UntrackFolder { .. } => CommandKind::UntrackFolder,
			Command::DeleteLocalFile { .. } => CommandKind::DeleteLocalFile,
			Command::DeleteUser { .. } => CommandKind::DeleteUser,
		}
	}

	/// Fingerprint carried by the command, if any
	pub fn content(&self) -> Option<&ContentInfo> {
		match self {
			Command::AddFile { content, .. } | Command::UpdateFileContent { content, .. } => {
				content.as_ref()
			}
			_ => None,
		}
	}

	/// User the command acts for, if it names one
	pub fn username(&self) -> Option<&str> {
		match self {
			Command::AddFile { username, .. }
			| Command::AddFolder { username, .. }
			| Command::AddUser { username }
			| Command::UpdateFileContent { username, .. }
			| Command::UpdateLocalFilePath { username, .. }
			| Command::UpdateLocalFolderPath { username, .. }
			| Command::DeleteLocalFile { username, .. }
			| Command::DeleteUser { username } => Some(username),
			Command::RenameFile { .. }
			| Command::RenameFolder { .. }
			| Command::ChangeRepoPath { .. }
			| Command::UntrackFile { .. }
			| Command::UntrackFolder { .. } => None,
		}
	}

	/// Parse one wire line
	pub fn parse(line: &str) -> Result<Command, ParseError> {
		let mut tokens = tokenize(line)?.into_iter();
		let name = tokens.next().ok_or(ParseError::Empty)?;
		let kind = CommandKind::from_name(&name)
			.ok_or_else(|| ParseError::UnknownCommand { name: name.clone() })?;
		let args: Vec<String> = tokens.collect();

		let fingerprint_ok = kind.takes_fingerprint() && args.len() == kind.arity() + 2;
		if args.len() != kind.arity() && !fingerprint_ok {
			return Err(ParseError::ArityMismatch {
				command: kind.name(),
				expected: kind.expected(),
				got: args.len(),
			});
		}
		let content = if fingerprint_ok { Some(parse_fingerprint(kind, &args[kind.arity()..])?) } else { None };

		let mut args = args.into_iter();
		let mut next = || args.next().unwrap_or_default();
		let command = match kind {
			CommandKind::AddFile => {
				Command::AddFile { local_path: next(), repo_dir: next(), username: next(), content }
			}
			CommandKind::AddFolder => {
				Command::AddFolder { local_folder: next(), repo_path: next(), username: next() }
			}
			CommandKind::RenameFile => {
				Command::RenameFile { repo_dir: next(), old_name: next(), new_name: next() }
			}
			CommandKind::RenameFolder => {
				Command::RenameFolder { old_repo_path: next(), new_repo_path: next() }
			}
			CommandKind::ChangeRepoPath => Command::ChangeRepoPath {
				file_name: next(),
				old_repo_dir: next(),
				new_repo_dir: next(),
			},
			CommandKind::AddUser => Command::AddUser { username: next() },
			CommandKind::UpdateFileContent => {
				Command::UpdateFileContent { local_path: next(), username: next(), content }
			}
			CommandKind::UpdateLocalFilePath => Command::UpdateLocalFilePath {
				old_local_path: next(),
				new_local_path: next(),
				username: next(),
			},
			CommandKind::UpdateLocalFolderPath => Command::UpdateLocalFolderPath {
				old_local_dir: next(),
				new_local_dir: next(),
				username: next(),
			},
			CommandKind::UntrackFile => Command::UntrackFile { full_repo_path: next() },
			CommandKind::UntrackFolder => Command::UntrackFolder { repo_path: next() },
			CommandKind::DeleteLocalFile => {
				Command::DeleteLocalFile { local_path: next(), username: next() }
			}
			CommandKind::DeleteUser => Command::DeleteUser { username: next() },
		};
		Ok(command)
	}

	/// Arguments in wire order, without the command name
	pub fn args(&self) -> Vec<String> {
		let mut args: Vec<String> = match self {
			Command::AddFile { local_path, repo_dir, username, .. } => {
				vec![local_path.clone(), repo_dir.clone(), username.clone()]
			}
			Command::AddFolder { local_folder, repo_path, username } => {
				vec![local_folder.clone(), repo_path.clone(), username.clone()]
			}
			Command::RenameFile { repo_dir, old_name, new_name } => {
				vec![repo_dir.clone(), old_name.clone(), new_name.clone()]
			}
			Command::RenameFolder { old_repo_path, new_repo_path } => {
				vec![old_repo_path.clone(), new_repo_path.clone()]
			}
			Command::ChangeRepoPath { file_name, old_repo_dir, new_repo_dir } => {
				vec![file_name.clone(), old_repo_dir.clone(), new_repo_dir.clone()]
			}
			Command::AddUser { username } | Command::DeleteUser { username } => vec![username.clone()],
			Command::UpdateFileContent { local_path, username, .. }
			| Command::DeleteLocalFile { local_path, username } => {
				vec![local_path.clone(), username.clone()]
			}
			Command::UpdateLocalFilePath { old_local_path, new_local_path, username } => {
				vec![old_local_path.clone(), new_local_path.clone(), username.clone()]
			}
			Command::UpdateLocalFolderPath { old_local_dir, new_local_dir, username } => {
				vec![old_local_dir.clone(), new_local_dir.clone(), username.clone()]
			}
			Command::UntrackFile { full_repo_path } => vec![full_repo_path.clone()],
			Command::UntrackFolder { repo_path } => vec![repo_path.clone()],
		};
		if let Some(content) = self.content() {
			args.push(content.hash.clone());
			args.push(content.size.to_string());
		}
		args
	}

	/// Fails when an argument cannot be written as a single wire token
	pub fn check_wire(&self) -> Result<(), ParseError> {
		for arg in self.args() {
			if let Some(c) = arg.chars().find(|c| matches!(c, '"' | '\n' | '\r')) {
				return Err(ParseError::InvalidArgument {
					command: self.kind().name(),
					message: format!("{:?} cannot be sent: contains {:?}", arg, c),
				});
			}
		}
		Ok(())
	}

	/// Serialize to one wire line
	pub fn to_wire(&self) -> String {
		let mut parts = vec![self.kind().name().to_string()];
		parts.extend(self.args().iter().map(|arg| quote(arg)));
		parts.join("/")
	}
}

impl fmt::Display for Command {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.to_wire())
	}
}

impl std::str::FromStr for Command {
	type Err = ParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Command::parse(s)
	}
}

fn parse_fingerprint(kind: CommandKind, args: &[String]) -> Result<ContentInfo, ParseError> {
	let (hash, size) = match args {
		[hash, size] => (hash, size),
		_ => {
			return Err(ParseError::InvalidArgument {
				command: kind.name(),
				message: "fingerprint needs a hash and a size".to_string(),
			})
		}
	};
	if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
		return Err(ParseError::InvalidArgument {
			command: kind.name(),
			message: format!("{:?} is not a hex hash", hash),
		});
	}
	let size = size.parse::<u64>().map_err(|e| ParseError::InvalidArgument {
		command: kind.name(),
		message: format!("size {:?}: {}", size, e),
	})?;
	Ok(ContentInfo { hash: hash.to_ascii_lowercase(), size })
}

/// Wrap a token in quotes when it would not survive tokenizing as-is
pub fn quote(token: &str) -> String {
	if token.is_empty() || token.contains('/') || token.contains('"') {
		format!("\"{}\"", token)
	} else {
		token.to_string()
	}
}

/// Split a wire line into tokens
pub fn tokenize(line: &str) -> Result<Vec<String>, ParseError> {
	let line = line.trim_end_matches(['\r', '\n']);
	let mut tokens = Vec::new();
	let mut rest = line;
	let mut offset = 0;

	while !rest.is_empty() {
		match rest.find('"') {
			Some(0) => {
				let close = rest[1..].find('"').ok_or(ParseError::UnterminatedQuote { position: offset })?;
				tokens.push(rest[1..1 + close].to_string());
				let consumed = close + 2;
				rest = &rest[consumed..];
				offset += consumed;
			}
			found => {
				let end = found.unwrap_or(rest.len());
				tokens.extend(rest[..end].split('/').filter(|s| !s.is_empty()).map(str::to_string));
				rest = &rest[end..];
				offset += end;
			}
		}
	}

	Ok(tokens)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::content::fingerprint_bytes;

	#[test]
	fn test_tokenize_quoted_paths() {
		let tokens = tokenize(r#"add_file/"/home/user/doc.txt"/"/docs"/alice"#).unwrap();
		assert_eq!(tokens, vec!["add_file", "/home/user/doc.txt", "/docs", "alice"]);
	}

	#[test]
	fn test_tokenize_drops_empty_unquoted_spans() {
		assert_eq!(tokenize("//add_user///bob//").unwrap(), vec!["add_user", "bob"]);
		assert_eq!(tokenize(r#"rename_file/""/a/b"#).unwrap(), vec!["rename_file", "", "a", "b"]);
		assert!(tokenize("///").unwrap().is_empty());
	}

	#[test]
	fn test_tokenize_unterminated_quote() {
		let err = tokenize(r#"add_user/"bob"#).unwrap_err();
		assert_eq!(err, ParseError::UnterminatedQuote { position: 9 });
	}

	#[test]
	fn test_parse_add_file() {
		let cmd = Command::parse(r#"add_file/"/home/user/doc.txt"/"/docs"/alice"#).unwrap();
		assert_eq!(
			cmd,
			Command::AddFile {
				local_path: "/home/user/doc.txt".into(),
				repo_dir: "/docs".into(),
				username: "alice".into(),
				content: None,
			}
		);
	}

	#[test]
	fn test_parse_with_fingerprint() {
		let info = fingerprint_bytes(b"doc");
		let line = format!("update_file/\"/home/a/doc.txt\"/alice/{}/{}", info.hash, info.size);
		let cmd = Command::parse(&line).unwrap();
		assert_eq!(cmd.content(), Some(&info));
		assert_eq!(cmd.to_wire(), line);
	}

	#[test]
	fn test_parse_bad_fingerprint() {
		let err = Command::parse("add_file/a/b/c/zz/10").unwrap_err();
		assert!(matches!(err, ParseError::InvalidArgument { command: "add_file", .. }));
		let err = Command::parse("add_file/a/b/c/abcd/ten").unwrap_err();
		assert!(matches!(err, ParseError::InvalidArgument { .. }));
	}

	#[test]
	fn test_arity_mismatch() {
		let err = Command::parse(r#"add_file/"/home/user/doc.txt"/"/docs""#).unwrap_err();
		assert_eq!(
			err,
			ParseError::ArityMismatch { command: "add_file", expected: "3 or 5".into(), got: 2 }
		);
		assert!(matches!(
			Command::parse("add_file/a/b/c/d"),
			Err(ParseError::ArityMismatch { got: 4, .. })
		));
		assert!(matches!(
			Command::parse("rename_folder/a"),
			Err(ParseError::ArityMismatch { command: "rename_folder", got: 1, .. })
		));
	}

	#[test]
	fn test_unknown_and_empty() {
		assert_eq!(
			Command::parse("frobnicate/x").unwrap_err(),
			ParseError::UnknownCommand { name: "frobnicate".into() }
		);
		assert_eq!(Command::parse("").unwrap_err(), ParseError::Empty);
	}

	#[test]
	fn test_every_kind_has_a_unique_name() {
		for kind in CommandKind::ALL {
			assert_eq!(CommandKind::from_name(kind.name()), Some(kind));
		}
	}

	#[test]
	fn test_wire_quotes_only_when_needed() {
		let cmd = Command::RenameFolder { old_repo_path: "/docs".into(), new_repo_path: "archive".into() };
		assert_eq!(cmd.to_wire(), r#"rename_folder/"/docs"/archive"#);

		let cmd = Command::RenameFile { repo_dir: "".into(), old_name: "a b.txt".into(), new_name: "c".into() };
		assert_eq!(cmd.to_wire(), r#"rename_file/""/a b.txt/c"#);
		assert_eq!(Command::parse(&cmd.to_wire()).unwrap(), cmd);
	}

	#[test]
	fn test_quote_in_argument_has_no_wire_form() {
		let cmd = Command::AddFile {
			local_path: "/home/a/say \"hi\".txt".into(),
			repo_dir: "/docs".into(),
			username: "alice".into(),
			content: None,
		};
		let err = cmd.check_wire().unwrap_err();
		assert!(matches!(err, ParseError::InvalidArgument { command: "add_file", .. }));

		let cmd = Command::AddUser { username: "line\nbreak".into() };
		assert!(cmd.check_wire().is_err());
		assert!(Command::AddUser { username: "alice".into() }.check_wire().is_ok());
	}
}

// vim: ts=4
