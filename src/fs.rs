use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};
use anyhow::{anyhow, Result};
use globset::GlobSet;
use serde_json::{json, Value};
use tokio::fs;
use filetime::{set_file_times, FileTime};
use crate::sandbox::{self, AllowList};
use crate::search::is_excluded;

pub struct ReadSlice {
	pub content: String,
	pub count: usize,
	pub total: usize,
	pub truncated: bool,
	pub truncated_reason: Vec<&'static str>,
}

pub async fn read_file(
	path: &Path,
	start_line: usize,
	limit: usize,
	max_total_bytes: usize,
	max_line_bytes: usize) -> Result<ReadSlice> {
	let content = fs::read_to_string(path).await?;
	let mut slice = format_lines(
		&content,
		start_line,
		limit,
		max_total_bytes,
		max_line_bytes
	);
	let line_truncated = start_line.saturating_sub(1) + slice.count < slice.total;
	if line_truncated {
		slice.truncated = true;
		if !slice.truncated_reason.contains(&"line_limit") {
			slice.truncated_reason.push("line_limit");
		}
	}
	Ok(slice)
}

fn format_lines(
	content: &str,
	start_line: usize,
	limit: usize,
	max_total_bytes: usize,
	max_line_bytes: usize) -> ReadSlice {
	let total = content.lines().count();
	let mut out = String::new();
	let mut taken = 0usize;
	let mut total_bytes = 0usize;
	let mut truncated = false;
	let mut reasons: Vec<&'static str> = Vec::new();
	let start_index = start_line.saturating_sub(1);
	for (index, line) in content.lines().enumerate() {
		if index < start_index {
			continue;
		}
		if taken >= limit {
			truncated = true;
			if !reasons.contains(&"line_limit") {
				reasons.push("line_limit");
			}
			break;
		}
		let mut line_text = line.to_string();
		let line_bytes = line.len();
		if line_bytes > max_line_bytes {
			let (kept, kept_bytes) = truncate_to_bytes(line, max_line_bytes);
			line_text = format!(
				"{} [TRUNCATED: {} bytes hidden]",
				kept,
				line_bytes - kept_bytes
			);
			truncated = true;
			if !reasons.contains(&"long_lines") {
				reasons.push("long_lines");
			}
		}
		let formatted = format!("{}: {}", index + 1, line_text);
		let separator_bytes = if out.is_empty() {
			0
		}
		else {
			1
		};
		if total_bytes + separator_bytes + formatted.len() > max_total_bytes {
			truncated = true;
			if !reasons.contains(&"max_bytes") {
				reasons.push("max_bytes");
			}
			break;
		}
		if !out.is_empty() {
			out.push('\n');
			total_bytes += 1;
		}
		out.push_str(&formatted);
		total_bytes += formatted.len();
		taken += 1;
	}
	ReadSlice {
		content: out,
		count: taken,
		total,
		truncated,
		truncated_reason: reasons,
	}
}

fn truncate_to_bytes(input: &str, max_bytes: usize) -> (String, usize) {
	if input.len() <= max_bytes {
		return (input.to_string(), input.len());
	}
	let mut end = 0usize;
	for (idx, ch) in input.char_indices() {
		let next = idx + ch.len_utf8();
		if next > max_bytes {
			break;
		}
		end = next;
	}
	(input[..end].to_string(), end)
}

pub async fn write_file(path: &Path, content: &str) -> Result<()> {
	fs::write(path, content).await?;
	Ok(())
}

pub async fn create_directory(path: &Path) -> Result<()> {
	fs::create_dir_all(path).await?;
	Ok(())
}

pub async fn list_directory(path: &Path) -> Result<Vec<String>> {
	let mut entries = fs::read_dir(path).await?;
	let mut lines = Vec::new();
	while let Some(entry) = entries.next_entry().await? {
		let name = entry.file_name().to_string_lossy().to_string();
		let is_dir = entry.metadata().await.map(|meta| meta.is_dir()).unwrap_or(false);
		let tag = if is_dir {
			"[DIR]"
		}
		else {
			"[FILE]"
		};
		lines.push(format!("{} {}", tag, name));
	}
	lines.sort();
	Ok(lines)
}

// JSON tree of name/type/children. The allow list is consulted for every
// entry so symlinks cannot pull outside content into the tree; unreadable
// or excluded entries are dropped. Symlinked directories are listed but
// never descended into, so a link at an ancestor cannot cycle the walk.
pub fn directory_tree<'a>(
	root: &'a Path,
	dir: PathBuf,
	excludes: &'a Option<GlobSet>,
	allow: &'a AllowList) -> Pin<Box<dyn Future<Output = Result<Vec<Value>>> + Send + 'a>> {
	Box::pin(
		async move {
			let mut nodes = Vec::new();
			let mut entries = fs::read_dir(&dir).await?;
			while let Some(entry) = entries.next_entry().await? {
				let full = entry.path();
				if sandbox::resolve(&full.to_string_lossy(), allow).is_err() {
					continue;
				}
				if let Ok(rel) = full.strip_prefix(root) {
					if is_excluded(excludes, rel) {
						continue;
					}
				}
				let name = entry.file_name().to_string_lossy().to_string();
				let is_dir = fs::symlink_metadata(&full).await.map(|meta| meta.is_dir()).unwrap_or(false);
				if is_dir {
					let children = match directory_tree(root, full, excludes, allow).await {
						Ok(children) => children,
						Err(_) => Vec::new(),
					};
					nodes.push(json!({
						"name": name,
						"type": "directory",
						"children": children,
					}));
				}
				else {
					nodes.push(json!({
						"name": name,
						"type": "file",
					}));
				}
			}
			nodes.sort_by(
				|a, b| {
					let a_name = a.get("name").and_then(Value::as_str).unwrap_or("");
					let b_name = b.get("name").and_then(Value::as_str).unwrap_or("");
					a_name.cmp(b_name)
				}
			);
			Ok(nodes)
		}
	)
}

pub async fn file_info(path: &Path) -> Result<Value> {
	let meta = fs::symlink_metadata(path).await?;
	let kind = if meta.is_dir() {
		"directory"
	}
	else if meta.file_type().is_symlink() {
		"symlink"
	}
	else {
		"file"
	};
	Ok(json!({
		"size": meta.len(),
		"type": kind,
		"permissions": format!("{:o}", meta.permissions().mode() & 0o777),
		"modified": epoch_seconds(meta.modified().ok()),
		"accessed": epoch_seconds(meta.accessed().ok()),
		"created": epoch_seconds(meta.created().ok()),
	}))
}

fn epoch_seconds(time: Option<SystemTime>) -> Value {
	match time.and_then(|value| value.duration_since(UNIX_EPOCH).ok()) {
		Some(duration) => Value::Number(duration.as_secs().into()),
		None => Value::Null,
	}
}

pub async fn move_path(from: &Path, to: &Path) -> Result<()> {
	if fs::metadata(to).await.is_ok() {
		return Err(anyhow!("target exists"));
	}
	match fs::rename(from, to).await {
		Ok(_) => return Ok(()),
		Err(err) => {
			if !is_cross_device(&err) {
				return Err(err.into());
			}
		}
	}
	let meta = fs::metadata(from).await?;
	if meta.is_dir() {
		copy_dir_recursive(from.to_path_buf(), to.to_path_buf()).await?;
		fs::remove_dir_all(from).await?;
	}
	else {
		copy_file_with_meta(from, to).await?;
		fs::remove_file(from).await?;
	}
	Ok(())
}

pub async fn delete_path(path: &Path) -> Result<()> {
	let meta = fs::metadata(path).await?;
	if meta.is_dir() {
		fs::remove_dir_all(path).await?;
	}
	else {
		fs::remove_file(path).await?;
	}
	Ok(())
}

async fn copy_file_with_meta(from: &Path, to: &Path) -> Result<()> {
	if let Some(parent) = to.parent() {
		fs::create_dir_all(parent).await?;
	}
	fs::copy(from, to).await?;
	let meta = fs::metadata(from).await?;
	fs::set_permissions(to, meta.permissions()).await?;
	let atime = FileTime::from_last_access_time(&meta);
	let mtime = FileTime::from_last_modification_time(&meta);
	set_file_times(to, atime, mtime)?;
	Ok(())
}

fn copy_dir_recursive(from: PathBuf, to: PathBuf) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
	Box::pin(
		async move {
			fs::create_dir_all(&to).await?;
			let mut entries = fs::read_dir(&from).await?;
			while let Some(entry) = entries.next_entry().await? {
				let src = entry.path();
				let dst = to.join(entry.file_name());
				let meta = fs::metadata(&src).await?;
				if meta.is_dir() {
					copy_dir_recursive(src, dst).await?;
				}
				else {
					copy_file_with_meta(&src, &dst).await?;
				}
			}
			let meta = fs::metadata(&from).await?;
			fs::set_permissions(&to, meta.permissions()).await?;
			let atime = FileTime::from_last_access_time(&meta);
			let mtime = FileTime::from_last_modification_time(&meta);
			set_file_times(&to, atime, mtime)?;
			Ok(())
		}
	)
}

fn is_cross_device(err: &std::io::Error) -> bool {
	err.raw_os_error() == Some(libc::EXDEV)
}
