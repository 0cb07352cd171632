//! Content fingerprints and local folder scanning

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Read};
use std::path::Path;

use crate::error::TransportError;
use crate::logging::*;
use crate::tree::SourceTree;

const READ_BUFFER_SIZE: usize = 65536;

/// Fingerprint of a file's content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentInfo {
	/// Hex-encoded blake3 digest
	pub hash: String,
	pub size: u64,
}

/// Hex-encoded blake3 digest of a buffer
pub fn hash_bytes(data: &[u8]) -> String {
	hex::encode(blake3::hash(data).as_bytes())
}

pub fn fingerprint_bytes(data: &[u8]) -> ContentInfo {
	ContentInfo { hash: hash_bytes(data), size: data.len() as u64 }
}

/// Hash a local file in streaming fashion
pub fn fingerprint_file(path: &Path) -> io::Result<ContentInfo> {
	let mut file = fs::File::open(path)?;
	let mut hasher = blake3::Hasher::new();
	let mut buf = vec![0u8; READ_BUFFER_SIZE];
	let mut size = 0u64;
	loop {
		let n = file.read(&mut buf)?;
		if n == 0 {
			break;
		}
		hasher.update(&buf[..n]);
		size += n as u64;
	}
	Ok(ContentInfo { hash: hex::encode(hasher.finalize().as_bytes()), size })
}

/// Check that received bytes match the fingerprint they were requested by
pub fn verify_blob(data: &[u8], expected_hash: &str) -> Result<(), TransportError> {
	let actual = hash_bytes(data);
	if actual.eq_ignore_ascii_case(expected_hash) {
		Ok(())
	} else {
		Err(TransportError::HashMismatch { expected: expected_hash.to_string(), actual })
	}
}

/// Snapshot a local directory: regular files and subdirectories, recursively.
/// Other entry types (symlinks, sockets) are skipped.
pub fn scan_folder(dir: &Path) -> io::Result<SourceTree> {
	let mut tree = SourceTree::default();
	for entry in fs::read_dir(dir)? {
		let entry = entry?;
		let name = match entry.file_name().into_string() {
			Ok(name) => name,
			Err(raw) => {
				warn!("Skipping non UTF-8 entry {:?} in {}", raw, dir.display());
				continue;
			}
		};
		let file_type = entry.file_type()?;
		if file_type.is_dir() {
			tree.dirs.insert(name, scan_folder(&entry.path())?);
		} else if file_type.is_file() {
			tree.files.push(name);
		}
	}
	tree.files.sort();
	Ok(tree)
}

/// Flatten a source tree into (relative directory, file name) pairs.
/// The relative directory is `""` for files at the top level.
pub fn source_files(tree: &SourceTree) -> Vec<(String, String)> {
	fn walk(tree: &SourceTree, rel: &str, out: &mut Vec<(String, String)>) {
		for file in &tree.files {
			out.push((rel.to_string(), file.clone()));
		}
		for (name, sub) in &tree.dirs {
			let sub_rel = if rel.is_empty() { name.clone() } else { format!("{}/{}", rel, name) };
			walk(sub, &sub_rel, out);
		}
	}

	let mut out = Vec::new();
	walk(tree, "", &mut out);
	out
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[test]
	fn test_fingerprint_file_matches_bytes() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("a.txt");
		fs::write(&path, b"hello decrep").unwrap();

		let from_file = fingerprint_file(&path).unwrap();
		assert_eq!(from_file, fingerprint_bytes(b"hello decrep"));
		assert_eq!(from_file.size, 12);
		assert_eq!(from_file.hash.len(), 64);
	}

	#[test]
	fn test_verify_blob() {
		let info = fingerprint_bytes(b"payload");
		assert!(verify_blob(b"payload", &info.hash).is_ok());
		assert!(matches!(
			verify_blob(b"tampered", &info.hash),
			Err(TransportError::HashMismatch { .. })
		));
	}

	#[test]
	fn test_scan_folder() {
		let dir = TempDir::new().unwrap();
		fs::write(dir.path().join("b.txt"), b"b").unwrap();
		fs::write(dir.path().join("a.txt"), b"a").unwrap();
		fs::create_dir_all(dir.path().join("sub/inner")).unwrap();
		fs::write(dir.path().join("sub/inner/c.txt"), b"c").unwrap();

		let tree = scan_folder(dir.path()).unwrap();
		assert_eq!(tree.files, vec!["a.txt", "b.txt"]);
		assert_eq!(tree.file_count(), 3);
		assert_eq!(
			source_files(&tree),
			vec![
				("".to_string(), "a.txt".to_string()),
				("".to_string(), "b.txt".to_string()),
				("sub/inner".to_string(), "c.txt".to_string()),
			]
		);
	}
}

// vim: ts=4
