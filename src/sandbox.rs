use std::path::{Component, Path, PathBuf};
use anyhow::{anyhow, Result};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
	#[error("requested path outside allowed directories: {0}")]
	OutsideRoots(PathBuf),
	#[error("symlink target outside allowed directories: {0}")]
	SymlinkOutsideRoots(PathBuf),
	#[error("parent directory does not exist: {0}")]
	ParentMissing(PathBuf),
	#[error("resolve {path}: {source}")]
	Io {
		path: PathBuf,
		source: std::io::Error,
	},
}

#[derive(Clone, Debug)]
pub struct AllowedRoot {
	pub path: PathBuf,
	pub canonical: PathBuf,
	pub display: String,
}

#[derive(Clone, Debug)]
pub struct AllowList {
	roots: Vec<AllowedRoot>,
}

impl AllowList {
	pub fn open(inputs: &[String]) -> Result<Self> {
		if inputs.is_empty() {
			return Err(anyhow!("at least one allowed directory is required"));
		}
		let cwd = std::env::current_dir()?;
		let mut roots = Vec::new();
		for input in inputs {
			let expanded = expand_home(input);
			let absolute = if expanded.is_absolute() {
				expanded
			}
			else {
				cwd.join(expanded)
			};
			let normalized = normalize_path(&absolute);
			let meta = std::fs::metadata(&normalized)
				.map_err(|err| anyhow!("allowed directory {}: {}", normalized.display(), err))?;
			if !meta.is_dir() {
				return Err(anyhow!("allowed directory {} is not a directory", normalized.display()));
			}
			let canonical = normalized.canonicalize()
				.map_err(|err| anyhow!("allowed directory {}: {}", normalized.display(), err))?;
			let display = normalized.to_string_lossy().to_string();
			roots.push(AllowedRoot {
				path: normalized,
				canonical,
				display,
			});
		}
		Ok(Self {
			roots
		})
	}

	pub fn roots(&self) -> &[AllowedRoot] {
		&self.roots
	}

	// Component-wise containment; "/allowed2" must not match root "/allowed".
	pub fn contains(&self, path: &Path) -> bool {
		self.roots
			.iter()
			.any(|root| path.starts_with(&root.path) || path.starts_with(&root.canonical))
	}

	pub fn is_root(&self, path: &Path) -> bool {
		self.roots
			.iter()
			.any(|root| path == root.path || path == root.canonical)
	}

	pub fn relativize(&self, path: &Path) -> String {
		for root in &self.roots {
			if let Ok(rel) = path.strip_prefix(&root.canonical) {
				return display_relative(rel);
			}
			if let Ok(rel) = path.strip_prefix(&root.path) {
				return display_relative(rel);
			}
		}
		path.to_string_lossy().to_string()
	}
}

fn display_relative(rel: &Path) -> String {
	let text = rel.to_string_lossy().to_string();
	if text.is_empty() {
		".".to_string()
	}
	else {
		text
	}
}

// ExpandHome -> ToAbsolute -> Normalize -> ContainmentCheck -> Canonicalize
// -> RecheckContainment. Existing paths come back canonical; paths that do
// not exist yet are checked through their nearest existing ancestor and come
// back as given. Callers re-resolve on every operation; the filesystem can
// change between calls.
pub fn resolve(requested: &str, allow: &AllowList) -> Result<PathBuf, SandboxError> {
	let expanded = expand_home(requested);
	let absolute = if expanded.is_absolute() {
		expanded
	}
	else {
		let cwd = std::env::current_dir().map_err(|err| SandboxError::Io {
			path: expanded.clone(),
			source: err,
		})?;
		cwd.join(expanded)
	};
	let normalized = normalize_path(&absolute);
	if !allow.contains(&normalized) {
		return Err(SandboxError::OutsideRoots(normalized));
	}
	match normalized.canonicalize() {
		Ok(canonical) => {
			if !allow.contains(&canonical) {
				return Err(SandboxError::SymlinkOutsideRoots(normalized));
			}
			Ok(canonical)
		}
		Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
			// The leaf may still exist as a dangling symlink; trusting it
			// would let a later write follow the link outside the roots.
			// Resolve the link target instead of the link itself.
			if let Ok(meta) = std::fs::symlink_metadata(&normalized) {
				if meta.file_type().is_symlink() {
					let target = std::fs::read_link(&normalized).map_err(|err| SandboxError::Io {
						path: normalized.clone(),
						source: err,
					})?;
					let target = if target.is_absolute() {
						target
					}
					else {
						match normalized.parent() {
							Some(parent) => parent.join(&target),
							None => target,
						}
					};
					let target = normalize_path(&target);
					if !allow.contains(&target) {
						return Err(SandboxError::SymlinkOutsideRoots(normalized));
					}
					return resolve(&target.to_string_lossy(), allow);
				}
			}
			let parent = normalized
				.parent()
				.ok_or_else(|| SandboxError::ParentMissing(normalized.clone()))?;
			let canonical_parent = match parent.canonicalize() {
				Ok(canonical) => canonical,
				Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
					return Err(SandboxError::ParentMissing(parent.to_path_buf()));
				}
				Err(err) => {
					return Err(SandboxError::Io {
						path: parent.to_path_buf(),
						source: err,
					});
				}
			};
			if !allow.contains(&canonical_parent) {
				return Err(SandboxError::SymlinkOutsideRoots(normalized));
			}
			Ok(normalized)
		}
		Err(err) => Err(SandboxError::Io {
			path: normalized,
			source: err,
		}),
	}
}

// Variant for directory creation: any number of missing trailing segments
// is accepted as long as the nearest existing ancestor stays inside the
// roots once canonicalized.
pub fn resolve_for_create(requested: &str, allow: &AllowList) -> Result<PathBuf, SandboxError> {
	let expanded = expand_home(requested);
	let absolute = if expanded.is_absolute() {
		expanded
	}
	else {
		let cwd = std::env::current_dir().map_err(|err| SandboxError::Io {
			path: expanded.clone(),
			source: err,
		})?;
		cwd.join(expanded)
	};
	let normalized = normalize_path(&absolute);
	if !allow.contains(&normalized) {
		return Err(SandboxError::OutsideRoots(normalized));
	}
	let mut ancestor = normalized.as_path();
	loop {
		match ancestor.canonicalize() {
			Ok(canonical) => {
				if !allow.contains(&canonical) {
					return Err(SandboxError::SymlinkOutsideRoots(normalized.clone()));
				}
				return Ok(normalized.clone());
			}
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
				ancestor = match ancestor.parent() {
					Some(parent) => parent,
					None => return Err(SandboxError::OutsideRoots(normalized.clone())),
				};
			}
			Err(err) => {
				return Err(SandboxError::Io {
					path: ancestor.to_path_buf(),
					source: err,
				});
			}
		}
	}
}

pub fn expand_home(raw: &str) -> PathBuf {
	if raw == "~" {
		if let Some(home) = dirs::home_dir() {
			return home;
		}
	}
	if let Some(rest) = raw.strip_prefix("~/") {
		if let Some(home) = dirs::home_dir() {
			return home.join(rest);
		}
	}
	PathBuf::from(raw)
}

pub fn normalize_path(path: &Path) -> PathBuf {
	let mut stack: Vec<std::ffi::OsString> = Vec::new();
	let mut prefix: Option<std::ffi::OsString> = None;
	let mut absolute = false;
	for component in path.components() {
		match component {
			Component::Prefix(prefix_component) => {
				prefix = Some(prefix_component.as_os_str().to_os_string());
			}
			Component::RootDir => {
				absolute = true;
				stack.clear();
			}
			Component::CurDir => {}
			Component::ParentDir => {
				if !stack.is_empty() {
					stack.pop();
				}
				else if !absolute {
					stack.push(std::ffi::OsString::from(".."));
				}
			}
			Component::Normal(part) => stack.push(part.to_os_string()),
		}
	}
	let mut out = PathBuf::new();
	if let Some(prefix) = prefix {
		out.push(prefix);
	}
	if absolute {
		out.push(Path::new("/"));
	}
	for part in stack {
		out.push(part);
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	fn allow_for(dir: &Path) -> AllowList {
		AllowList::open(&[dir.to_string_lossy().to_string()]).expect("allow list")
	}

	#[test]
	fn normalize_collapses_dot_and_dot_dot() {
		assert_eq!(normalize_path(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
		assert_eq!(normalize_path(Path::new("/a//b/")), PathBuf::from("/a/b"));
		assert_eq!(normalize_path(Path::new("/a/../../..")), PathBuf::from("/"));
	}

	#[test]
	fn open_rejects_missing_and_non_directory_roots() {
		let tmp = tempfile::tempdir().expect("tempdir");
		let file = tmp.path().join("plain.txt");
		std::fs::write(&file, "x").expect("write");
		assert!(AllowList::open(&[file.to_string_lossy().to_string()]).is_err());
		let missing = tmp.path().join("missing");
		assert!(AllowList::open(&[missing.to_string_lossy().to_string()]).is_err());
		assert!(AllowList::open(&[]).is_err());
	}

	#[test]
	fn resolve_rejects_path_outside_roots() {
		let tmp = tempfile::tempdir().expect("tempdir");
		let allow = allow_for(tmp.path());
		let err = resolve("/etc/passwd", &allow).expect_err("outside");
		assert!(matches!(err, SandboxError::OutsideRoots(_)));
	}

	#[test]
	fn resolve_rejects_traversal_out_of_root() {
		let tmp = tempfile::tempdir().expect("tempdir");
		let allow = allow_for(tmp.path());
		let sneaky = format!("{}/sub/../../outside.txt", tmp.path().display());
		let err = resolve(&sneaky, &allow).expect_err("escape");
		assert!(matches!(err, SandboxError::OutsideRoots(_)));
	}

	#[test]
	fn resolve_rejects_sibling_directory_with_shared_prefix() {
		let base = tempfile::tempdir().expect("tempdir");
		let allowed = base.path().join("allowed");
		let sibling = base.path().join("allowed2");
		std::fs::create_dir_all(&allowed).expect("allowed");
		std::fs::create_dir_all(&sibling).expect("sibling");
		let allow = allow_for(&allowed);
		let inside = allowed.join("file.txt");
		std::fs::write(&inside, "ok").expect("write");
		assert!(resolve(&inside.to_string_lossy(), &allow).is_ok());
		let err = resolve(&sibling.join("file.txt").to_string_lossy(), &allow).expect_err("sibling");
		assert!(matches!(err, SandboxError::OutsideRoots(_)));
	}

	#[test]
	fn resolve_returns_canonical_form_for_existing_paths() {
		let tmp = tempfile::tempdir().expect("tempdir");
		let file = tmp.path().join("data.txt");
		std::fs::write(&file, "x").expect("write");
		let allow = allow_for(tmp.path());
		let resolved = resolve(&file.to_string_lossy(), &allow).expect("resolve");
		assert_eq!(resolved, file.canonicalize().expect("canon"));
	}

	#[test]
	fn resolve_follows_symlink_inside_roots() {
		let tmp = tempfile::tempdir().expect("tempdir");
		let target = tmp.path().join("real.txt");
		std::fs::write(&target, "x").expect("write");
		let link = tmp.path().join("link.txt");
		std::os::unix::fs::symlink(&target, &link).expect("symlink");
		let allow = allow_for(tmp.path());
		let resolved = resolve(&link.to_string_lossy(), &allow).expect("resolve");
		assert_eq!(resolved, target.canonicalize().expect("canon"));
	}

	#[test]
	fn resolve_rejects_symlink_pointing_outside_roots() {
		let base = tempfile::tempdir().expect("tempdir");
		let root = base.path().join("root");
		let outside = base.path().join("outside");
		std::fs::create_dir_all(&root).expect("root");
		std::fs::create_dir_all(&outside).expect("outside");
		let target = outside.join("secret.txt");
		std::fs::write(&target, "secret").expect("write");
		let link = root.join("escape.txt");
		std::os::unix::fs::symlink(&target, &link).expect("symlink");
		let allow = allow_for(&root);
		let err = resolve(&link.to_string_lossy(), &allow).expect_err("escape");
		assert!(matches!(err, SandboxError::SymlinkOutsideRoots(_)));
	}

	#[test]
	fn resolve_accepts_new_file_with_existing_parent() {
		let tmp = tempfile::tempdir().expect("tempdir");
		let allow = allow_for(tmp.path());
		let fresh = tmp.path().join("brand-new.txt");
		let resolved = resolve(&fresh.to_string_lossy(), &allow).expect("resolve");
		assert_eq!(resolved, normalize_path(&fresh));
	}

	#[test]
	fn resolve_reports_missing_parent_for_new_paths() {
		let tmp = tempfile::tempdir().expect("tempdir");
		let allow = allow_for(tmp.path());
		let nested = tmp.path().join("no-such-dir/new.txt");
		let err = resolve(&nested.to_string_lossy(), &allow).expect_err("parent");
		assert!(matches!(err, SandboxError::ParentMissing(_)));
	}

	#[test]
	fn resolve_rejects_dangling_symlink_targeting_outside_roots() {
		let base = tempfile::tempdir().expect("tempdir");
		let root = base.path().join("root");
		let outside = base.path().join("outside");
		std::fs::create_dir_all(&root).expect("root");
		std::fs::create_dir_all(&outside).expect("outside");
		let link = root.join("evil.txt");
		std::os::unix::fs::symlink(outside.join("victim.txt"), &link).expect("symlink");
		let allow = allow_for(&root);
		let err = resolve(&link.to_string_lossy(), &allow).expect_err("escape");
		assert!(matches!(err, SandboxError::SymlinkOutsideRoots(_)));
	}

	#[test]
	fn resolve_follows_dangling_symlink_targeting_inside_roots() {
		let tmp = tempfile::tempdir().expect("tempdir");
		let target = tmp.path().join("future.txt");
		let link = tmp.path().join("link.txt");
		std::os::unix::fs::symlink(&target, &link).expect("symlink");
		let allow = allow_for(tmp.path());
		let resolved = resolve(&link.to_string_lossy(), &allow).expect("resolve");
		assert_eq!(resolved, normalize_path(&target));
	}

	#[test]
	fn resolve_for_create_accepts_nested_missing_directories() {
		let tmp = tempfile::tempdir().expect("tempdir");
		let allow = allow_for(tmp.path());
		let nested = tmp.path().join("a/b/c");
		let resolved = resolve_for_create(&nested.to_string_lossy(), &allow).expect("resolve");
		assert_eq!(resolved, normalize_path(&nested));
		let outside = "/etc/a/b/c";
		let err = resolve_for_create(outside, &allow).expect_err("outside");
		assert!(matches!(err, SandboxError::OutsideRoots(_)));
	}

	#[test]
	fn resolve_for_create_rejects_traversal_through_missing_segments() {
		let tmp = tempfile::tempdir().expect("tempdir");
		let allow = allow_for(tmp.path());
		let sneaky = format!("{}/new/../../escape/dir", tmp.path().display());
		let err = resolve_for_create(&sneaky, &allow).expect_err("escape");
		assert!(matches!(err, SandboxError::OutsideRoots(_)));
	}

	#[test]
	fn resolve_rejects_new_file_under_symlinked_parent_escaping_roots() {
		let base = tempfile::tempdir().expect("tempdir");
		let root = base.path().join("root");
		let outside = base.path().join("outside");
		std::fs::create_dir_all(&root).expect("root");
		std::fs::create_dir_all(&outside).expect("outside");
		let link_dir = root.join("portal");
		std::os::unix::fs::symlink(&outside, &link_dir).expect("symlink");
		let allow = allow_for(&root);
		let err = resolve(&link_dir.join("new.txt").to_string_lossy(), &allow).expect_err("escape");
		assert!(matches!(err, SandboxError::SymlinkOutsideRoots(_)));
	}
}
