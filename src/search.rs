use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use anyhow::{anyhow, Result};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use crate::sandbox::{self, AllowList};

// Name search over a directory tree. Every visited entry is re-resolved
// against the allow list so a symlinked subdirectory cannot carry the
// traversal outside the roots; entries that fail to resolve are skipped
// silently. Results are sorted for stable output.
pub async fn search(
	root: &Path,
	pattern: &str,
	exclude_patterns: &[String],
	allow: &AllowList) -> Result<Vec<PathBuf>> {
	let excludes = build_exclude_set(exclude_patterns)?;
	let needle = pattern.to_lowercase();
	let mut matches = Vec::new();
	walk(
		root.to_path_buf(),
		root.to_path_buf(),
		needle,
		excludes,
		allow.clone(),
		&mut matches
	).await;
	matches.sort();
	Ok(matches)
}

// A pattern with a wildcard is matched as a glob against the path relative
// to the search root; a bare pattern excludes that name as a path segment
// anywhere below the root.
pub fn build_exclude_set(patterns: &[String]) -> Result<Option<GlobSet>> {
	if patterns.is_empty() {
		return Ok(None);
	}
	let mut builder = GlobSetBuilder::new();
	for pattern in patterns {
		if pattern.contains(['*', '?', '[']) {
			builder.add(compile_glob(pattern)?);
		}
		else {
			builder.add(compile_glob(&format!("**/{}", pattern))?);
			builder.add(compile_glob(&format!("**/{}/**", pattern))?);
		}
	}
	Ok(Some(builder.build().map_err(|err| anyhow!("invalid exclude set: {}", err))?))
}

fn compile_glob(pattern: &str) -> Result<globset::Glob> {
	GlobBuilder::new(pattern)
		.literal_separator(true)
		.build()
		.map_err(|err| anyhow!("invalid exclude glob {}: {}", pattern, err))
}

pub fn is_excluded(excludes: &Option<GlobSet>, rel: &Path) -> bool {
	match excludes {
		Some(set) => set.is_match(rel),
		None => false,
	}
}

fn walk(
	root: PathBuf,
	dir: PathBuf,
	needle: String,
	excludes: Option<GlobSet>,
	allow: AllowList,
	matches: &mut Vec<PathBuf>) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
	Box::pin(
		async move {
			let mut entries = match tokio::fs::read_dir(&dir).await {
				Ok(entries) => entries,
				Err(_) => return,
			};
			while let Ok(Some(entry)) = entries.next_entry().await {
				let full = entry.path();
				if sandbox::resolve(&full.to_string_lossy(), &allow).is_err() {
					continue;
				}
				let rel = match full.strip_prefix(&root) {
					Ok(rel) => rel.to_path_buf(),
					Err(_) => continue,
				};
				if is_excluded(&excludes, &rel) {
					continue;
				}
				let name = entry.file_name().to_string_lossy().to_lowercase();
				if name.contains(&needle) {
					matches.push(full.clone());
				}
				if is_directory(&full).await {
					walk(
						root.clone(),
						full,
						needle.clone(),
						excludes.clone(),
						allow.clone(),
						matches
					).await;
				}
			}
		}
	)
}

// Descent never follows symlinked directories; a link pointing at an
// ancestor would cycle the walk. The link itself is still a candidate for
// a name match above.
async fn is_directory(path: &Path) -> bool {
	match tokio::fs::symlink_metadata(path).await {
		Ok(meta) => meta.is_dir(),
		Err(_) => false,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn allow_for(dir: &Path) -> AllowList {
		AllowList::open(&[dir.to_string_lossy().to_string()]).expect("allow list")
	}

	fn touch(path: &Path) {
		std::fs::create_dir_all(path.parent().expect("parent")).expect("dirs");
		std::fs::write(path, "x").expect("write");
	}

	#[tokio::test]
	async fn finds_names_case_insensitively() {
		let tmp = tempfile::tempdir().expect("tempdir");
		touch(&tmp.path().join("Notes.TXT"));
		touch(&tmp.path().join("deep/more-notes.txt"));
		touch(&tmp.path().join("deep/other.rs"));
		let allow = allow_for(tmp.path());
		let found = search(tmp.path(), "notes", &[], &allow).await.expect("search");
		assert_eq!(found.len(), 2);
		assert!(found.iter().all(|path| path.is_absolute()));
	}

	#[tokio::test]
	async fn bare_exclude_pattern_skips_segment_anywhere() {
		let tmp = tempfile::tempdir().expect("tempdir");
		touch(&tmp.path().join("a/b/node_modules/x.txt"));
		touch(&tmp.path().join("a/keep.txt"));
		let allow = allow_for(tmp.path());
		let excludes = vec!["node_modules".to_string()];
		let found = search(tmp.path(), "", &excludes, &allow).await.expect("search");
		assert!(!found.iter().any(|path| path.to_string_lossy().contains("node_modules")));
		assert!(found.iter().any(|path| path.ends_with("a/keep.txt")));
	}

	#[tokio::test]
	async fn wildcard_exclude_matches_relative_path_glob() {
		let tmp = tempfile::tempdir().expect("tempdir");
		touch(&tmp.path().join("src/lib.rs"));
		touch(&tmp.path().join("src/lib.txt"));
		let allow = allow_for(tmp.path());
		let excludes = vec!["src/*.rs".to_string()];
		let found = search(tmp.path(), "lib", &excludes, &allow).await.expect("search");
		assert_eq!(found.len(), 1);
		assert!(found[0].ends_with("src/lib.txt"));
	}

	#[tokio::test]
	async fn symlink_escaping_roots_is_skipped_silently() {
		let base = tempfile::tempdir().expect("tempdir");
		let root = base.path().join("root");
		let outside = base.path().join("outside");
		std::fs::create_dir_all(&root).expect("root");
		std::fs::create_dir_all(&outside).expect("outside");
		touch(&outside.join("secret-match.txt"));
		std::os::unix::fs::symlink(&outside, root.join("portal")).expect("symlink");
		touch(&root.join("match.txt"));
		let allow = allow_for(&root);
		let found = search(&root, "match", &[], &allow).await.expect("search");
		assert_eq!(found.len(), 1);
		assert!(found[0].ends_with("match.txt"));
	}

	#[tokio::test]
	async fn symlink_cycle_inside_root_terminates() {
		let tmp = tempfile::tempdir().expect("tempdir");
		let sub = tmp.path().join("sub");
		std::fs::create_dir_all(&sub).expect("sub");
		touch(&sub.join("found.txt"));
		std::os::unix::fs::symlink(tmp.path(), sub.join("loop")).expect("symlink");
		let allow = allow_for(tmp.path());
		let found = search(tmp.path(), "found", &[], &allow).await.expect("search");
		assert_eq!(found.len(), 1);
		assert!(found[0].ends_with("sub/found.txt"));
	}

	#[tokio::test]
	async fn results_are_sorted() {
		let tmp = tempfile::tempdir().expect("tempdir");
		touch(&tmp.path().join("zebra.txt"));
		touch(&tmp.path().join("alpha.txt"));
		touch(&tmp.path().join("midway.txt"));
		let allow = allow_for(tmp.path());
		let found = search(tmp.path(), ".txt", &[], &allow).await.expect("search");
		let mut sorted = found.clone();
		sorted.sort();
		assert_eq!(found, sorted);
	}
}
