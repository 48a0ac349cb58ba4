use std::path::Path;
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct Edit {
	pub old_text: String,
	pub new_text: String,
}

#[derive(Debug, Error)]
pub enum PatchError {
	#[error("edit text not found in file: {0:?}")]
	EditNotFound(String),
	#[error("{action} {path}: {source}")]
	Io {
		action: &'static str,
		path: String,
		source: std::io::Error,
	},
}

// Applies edits strictly in order, each against the output of the previous
// one, then renders a single unified diff between the initial and final
// snapshots. A failing edit aborts before any write; the file is untouched.
pub async fn apply_edits(path: &Path, edits: &[Edit], dry_run: bool) -> Result<String, PatchError> {
	let raw = tokio::fs::read_to_string(path).await.map_err(|err| PatchError::Io {
		action: "read",
		path: path.to_string_lossy().to_string(),
		source: err,
	})?;
	let original = normalize_line_endings(&raw);
	let mut current = original.clone();
	for edit in edits {
		current = apply_edit(&current, edit)?;
	}
	let diff = fenced_diff(&original, &current);
	if !dry_run {
		tokio::fs::write(path, &current).await.map_err(|err| PatchError::Io {
			action: "write",
			path: path.to_string_lossy().to_string(),
			source: err,
		})?;
	}
	Ok(diff)
}

pub fn normalize_line_endings(text: &str) -> String {
	text.replace("\r\n", "\n")
}

fn apply_edit(content: &str, edit: &Edit) -> Result<String, PatchError> {
	let old = normalize_line_endings(&edit.old_text);
	let new = normalize_line_endings(&edit.new_text);
	if content.contains(&old) {
		return Ok(content.replacen(&old, &new, 1));
	}
	replace_matching_window(content, &old, &new)
		.ok_or_else(|| PatchError::EditNotFound(edit.old_text.clone()))
}

// Whitespace-insensitive fallback: slide a window of old's line count over
// the content and accept the first window whose lines all match after
// trimming. Indentation of the replacement is repaired from the window's
// first line; later lines shift by the old/new indent delta, floored at
// zero. The repair is a heuristic, not a guarantee.
fn replace_matching_window(content: &str, old: &str, new: &str) -> Option<String> {
	let content_lines: Vec<&str> = content.split('\n').collect();
	let old_lines: Vec<&str> = old.split('\n').collect();
	if old_lines.is_empty() || old_lines.len() > content_lines.len() {
		return None;
	}
	for start in 0..=(content_lines.len() - old_lines.len()) {
		let window = &content_lines[start..start + old_lines.len()];
		let matched = window
			.iter()
			.zip(old_lines.iter())
			.all(|(have, want)| have.trim() == want.trim());
		if !matched {
			continue;
		}
		let base_indent = leading_whitespace(window[0]);
		let mut replacement: Vec<String> = Vec::new();
		for (index, line) in new.split('\n').enumerate() {
			if index == 0 {
				replacement.push(format!("{}{}", base_indent, line.trim_start()));
				continue;
			}
			let old_indent = old_lines
				.get(index)
				.map(|value| leading_whitespace(value))
				.unwrap_or("");
			let new_indent = leading_whitespace(line);
			if old_indent.is_empty() || new_indent.is_empty() {
				replacement.push(line.to_string());
				continue;
			}
			let width = (base_indent.len() + new_indent.len()).saturating_sub(old_indent.len());
			replacement.push(format!("{}{}", " ".repeat(width), line.trim_start()));
		}
		let mut out: Vec<String> = Vec::with_capacity(
			content_lines.len() - old_lines.len() + replacement.len()
		);
		out.extend(content_lines[..start].iter().map(|value| value.to_string()));
		out.extend(replacement);
		out.extend(
			content_lines[start + old_lines.len()..]
				.iter()
				.map(|value| value.to_string())
		);
		return Some(out.join("\n"));
	}
	None
}

fn leading_whitespace(line: &str) -> &str {
	let end = line
		.char_indices()
		.find(|(_, ch)| !ch.is_whitespace())
		.map(|(index, _)| index)
		.unwrap_or(line.len());
	&line[..end]
}

pub fn fenced_diff(original: &str, modified: &str) -> String {
	let diff = similar::TextDiff::from_lines(original, modified);
	let mut body = diff.unified_diff()
		.context_radius(3)
		.header("original", "modified")
		.to_string();
	if !body.is_empty() && !body.ends_with('\n') {
		body.push('\n');
	}
	let fence = "`".repeat(fence_len(&body));
	format!("{}diff\n{}{}\n", fence, body, fence)
}

// One backtick longer than the longest run inside the diff, so a diff that
// itself contains fenced blocks cannot terminate the outer fence early.
fn fence_len(body: &str) -> usize {
	let mut longest = 0usize;
	let mut run = 0usize;
	for ch in body.chars() {
		if ch == '`' {
			run += 1;
			longest = longest.max(run);
		}
		else {
			run = 0;
		}
	}
	(longest + 1).max(3)
}
