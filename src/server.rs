use crate::fs;
use crate::patch::{self, Edit, PatchError};
use crate::protocol::{Request, Response};
use crate::sandbox::{self, AllowList, SandboxError};
use crate::search;
use anyhow::{anyhow, Result};
use opentelemetry::global;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace as sdktrace;
use opentelemetry_semantic_conventions::resource as semconv;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info_span, Span};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug)]
struct ProtocolError {
	code: i64,
	message: String,
}

impl ProtocolError {
	fn new(code: i64, message: impl Into<String>) -> Self {
		Self {
			code,
			message: message.into()
		}
	}
}

impl std::fmt::Display for ProtocolError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.message)
	}
}

impl std::error::Error for ProtocolError {}

#[derive(Clone, Debug)]
pub struct Config {
	pub allow: AllowList,
	pub read_max_bytes: usize,
	pub read_max_line_bytes: usize,
	pub otel_enabled: bool,
	pub otel_endpoint: String,
	pub otel_service_name: String,
	pub session_id: String,
}

pub fn load_config() -> Result<Config> {
	let mut roots_raw: Vec<String> = Vec::new();
	let mut read_max_bytes: usize = 50 * 1024;
	let mut read_max_line_bytes: usize = 25 * 1024;
	let mut otel_enabled = false;
	let mut otel_endpoint = String::from("http://127.0.0.1:4317");
	let mut otel_service_name = String::from("sandbox-fs");
	let mut args = std::env::args().skip(1);
	while let Some(arg) = args.next() {
		match arg.as_str() {
			"--read-max-bytes" => {
				let value = args.next().ok_or_else(|| anyhow!("--read-max-bytes requires a value"))?;
				read_max_bytes = parse_byte_limit(&value, "--read-max-bytes")?;
			}
			"--read-max-line-bytes" => {
				let value = args.next().ok_or_else(|| anyhow!("--read-max-line-bytes requires a value"))?;
				read_max_line_bytes = parse_byte_limit(&value, "--read-max-line-bytes")?;
			}
			"--otel-enabled" => {
				let value = args.next().ok_or_else(|| anyhow!("--otel-enabled requires a value"))?;
				otel_enabled = parse_bool(&value, "--otel-enabled")?;
			}
			"--otel-endpoint" => {
				let value = args.next().ok_or_else(|| anyhow!("--otel-endpoint requires a value"))?;
				otel_endpoint = value;
			}
			"--otel-service-name" => {
				let value = args.next().ok_or_else(|| anyhow!("--otel-service-name requires a value"))?;
				otel_service_name = value;
			}
			other if other.starts_with("--") => {
				return Err(anyhow!("unknown argument: {}", other));
			}
			_ => roots_raw.push(arg),
		}
	}
	if roots_raw.is_empty() {
		if let Ok(env_roots) = std::env::var("SANDBOX_FS_ROOTS") {
			for value in env_roots.split(',') {
				let trimmed = value.trim();
				if !trimmed.is_empty() {
					roots_raw.push(trimmed.to_string());
				}
			}
		}
	}
	if let Ok(env_limit) = std::env::var("SANDBOX_FS_READ_MAX_BYTES") {
		if !env_limit.trim().is_empty() {
			read_max_bytes = parse_byte_limit(&env_limit, "SANDBOX_FS_READ_MAX_BYTES")?;
		}
	}
	if let Ok(env_limit) = std::env::var("SANDBOX_FS_READ_MAX_LINE_BYTES") {
		if !env_limit.trim().is_empty() {
			read_max_line_bytes = parse_byte_limit(&env_limit, "SANDBOX_FS_READ_MAX_LINE_BYTES")?;
		}
	}
	if let Ok(env_enabled) = std::env::var("SANDBOX_FS_OTEL_ENABLED") {
		if !env_enabled.trim().is_empty() {
			otel_enabled = parse_bool(&env_enabled, "SANDBOX_FS_OTEL_ENABLED")?;
		}
	}
	if let Ok(env_endpoint) = std::env::var("SANDBOX_FS_OTEL_ENDPOINT") {
		if !env_endpoint.trim().is_empty() {
			otel_endpoint = env_endpoint;
		}
	}
	if let Ok(env_service) = std::env::var("SANDBOX_FS_OTEL_SERVICE_NAME") {
		if !env_service.trim().is_empty() {
			otel_service_name = env_service;
		}
	}
	let allow = AllowList::open(&roots_raw)?;
	Ok(Config {
		allow,
		read_max_bytes,
		read_max_line_bytes,
		otel_enabled,
		otel_endpoint,
		otel_service_name,
		session_id: uuid::Uuid::new_v4().to_string(),
	})
}

fn parse_byte_limit(value: &str, name: &str) -> Result<usize> {
	let parsed = value.trim().parse::<usize>()
		.map_err(|_| anyhow!("{} must be a non-negative integer", name))?;
	if parsed == 0 {
		return Ok(usize::MAX);
	}
	Ok(parsed)
}

fn parse_bool(value: &str, name: &str) -> Result<bool> {
	match value.trim().to_lowercase().as_str() {
		"1" | "true" | "yes" => Ok(true),
		"0" | "false" | "no" => Ok(false),
		_ => Err(anyhow!("{} must be a boolean", name)),
	}
}

pub fn init_tracing(config: &Config) {
	let _ = global::set_error_handler(|_| {});
	let resource = Resource::new(
		vec![
		opentelemetry::KeyValue::new(semconv::SERVICE_NAME, config.otel_service_name.clone()),
		opentelemetry::KeyValue::new(semconv::SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
		opentelemetry::KeyValue::new("fs.session_id", config.session_id.clone()),
		]
	);
	let tracing_layer = if config.otel_enabled {
		let exporter = opentelemetry_otlp::new_exporter().tonic().with_endpoint(config.otel_endpoint.clone());
		opentelemetry_otlp::new_pipeline()
			.tracing()
			.with_exporter(exporter)
			.with_trace_config(sdktrace::Config::default().with_resource(resource))
			.install_batch(opentelemetry_sdk::runtime::Tokio)
			.ok()
			.map(OpenTelemetryLayer::new)
	}
	else {
		None
	};
	let fmt_layer = tracing_subscriber::fmt::layer()
		.with_target(false)
		.with_writer(std::io::stderr);
	let subscriber = tracing_subscriber::registry().with(fmt_layer);
	if let Some(layer) = tracing_layer {
		subscriber.with(layer).init();
	}
	else {
		subscriber.init();
	}
}

pub async fn run(config: Config) -> Result<()> {
	let stdin = io::stdin();
	let stdout = io::stdout();
	let mut reader = BufReader::new(stdin).lines();
	let mut writer = io::BufWriter::new(stdout);
	while let Some(line) = reader.next_line().await? {
		if line.trim().is_empty() {
			continue;
		}
		let req: Request = match serde_json::from_str(&line) {
			Ok(req) => req,
			Err(err) => {
				let resp = Response::err(Value::Null, -32700, err.to_string());
				write_response(&mut writer, resp).await?;
				continue;
			}
		};
		let resp = handle_request(&config, req).await;
		write_response(&mut writer, resp).await?;
	}
	Ok(())
}

async fn write_response(
	writer: &mut io::BufWriter<io::Stdout>,
	resp: Response) -> Result<()> {
	let payload = serde_json::to_string(&resp)?;
	writer.write_all(payload.as_bytes()).await?;
	writer.write_all(b"\n").await?;
	writer.flush().await?;
	Ok(())
}

async fn handle_request(config: &Config, req: Request) -> Response {
	let method = req.method.clone();
	let tool_name = extract_tool_name(&method, &req.params);
	let span = info_span!(
		"fs.request",
		"fs.session_id" = %config.session_id,
		"fs.method" = %method,
		"fs.tool_name" = tool_name.as_deref().unwrap_or(""),
		"fs.is_error" = tracing::field::Empty,
		"fs.error_code" = tracing::field::Empty,
	);
	let _guard = span.enter();
	match route(config, &req).await {
		Ok(value) => {
			record_result(&span, &value);
			Response::ok(req.id, value)
		}
		Err(err) => {
			span.record("fs.is_error", true);
			if let Some(protocol) = err.downcast_ref::<ProtocolError>() {
				Response::err(req.id, protocol.code, protocol.message.clone())
			}
			else {
				Response::err(req.id, -32000, err.to_string())
			}
		}
	}
}

fn extract_tool_name(method: &str, params: &Value) -> Option<String> {
	if method != "tools/call" {
		return None;
	}
	params.get("name")
		.and_then(Value::as_str)
		.map(|name| name.to_string())
}

fn record_result(span: &Span, value: &Value) {
	let is_error = value.get("isError")
		.and_then(Value::as_bool)
		.unwrap_or(false);
	span.record("fs.is_error", is_error);
	if let Some(code) = value.get("structuredContent")
		.and_then(|content| content.get("code"))
		.and_then(Value::as_str) {
		span.record("fs.error_code", code);
	}
}

async fn route(config: &Config, req: &Request) -> Result<Value> {
	match req.method.as_str() {
		"initialize" => Ok(json!({
			"serverInfo": {
                "name": "sandbox-fs",
                "version": env!("CARGO_PKG_VERSION")
            },
			"capabilities": {
                "tools": {
                    "list": true,
                    "call": true
                }
            }
		})),
		"tools/list" => Ok(json!({
			"tools": tool_definitions(),
		})),
		"tools/call" => {
			let name = req.params
				.get("name")
				.and_then(Value::as_str)
				.ok_or_else(|| ProtocolError::new(-32602, "name is required"))?;
			let arguments = req.params
				.get("arguments")
				.cloned()
				.unwrap_or_else(|| json!({}));
			execute_tool(config, name, &arguments).await
		}
		_ => Err(ProtocolError::new(-32601, "method not found").into()),
	}
}

async fn run_tool<F, Fut>(name: &str, handler: F) -> Value
where
	F: FnOnce() -> Fut,
	Fut: std::future::Future<Output = Result<Value>>, {
	match handler().await {
		Ok(structured) => tool_success(name, structured),
		Err(err) => tool_error(&err),
	}
}

fn tool_success(name: &str, structured: Value) -> Value {
	let message = tool_message(name, &structured);
	json!({
		"structuredContent": structured,
		"content": [
            {
                "type": "text",
                "text": message
            }
        ]
	})
}

fn tool_error(err: &anyhow::Error) -> Value {
	let code = error_code(err);
	json!({
		"isError": true,
		"structuredContent": {
            "code": code
        },
		"content": [
            {
                "type": "text",
                "text": err.to_string()
            }
        ]
	})
}

fn tool_message(name: &str, structured: &Value) -> String {
	match name {
		"list_allowed_directories" => {
			let count = structured.get("directories")
				.and_then(Value::as_array)
				.map(|items| items.len())
				.unwrap_or(0);
			format!("Listed {} allowed director{}.", count, if count == 1 { "y" } else { "ies" })
		}
		"read_file" => {
			let count = get_u64(structured, "count").unwrap_or(0);
			let total = get_u64(structured, "total").unwrap_or(count);
			let path = structured.get("path")
				.and_then(Value::as_str)
				.unwrap_or("file");
			format!("Read {} line(s) from {} (total {}).", count, path, total)
		}
		"read_multiple_files" => {
			let count = structured.get("files")
				.and_then(Value::as_array)
				.map(|files| files.len())
				.unwrap_or(0);
			format!("Read {} file(s).", count)
		}
		"write_file" => {
			let path = structured.get("path")
				.and_then(Value::as_str)
				.unwrap_or("file");
			format!("Wrote {}.", path)
		}
		"create_directory" => {
			let path = structured.get("path")
				.and_then(Value::as_str)
				.unwrap_or("directory");
			format!("Created {}.", path)
		}
		"list_directory" => {
			let count = structured.get("entries")
				.and_then(Value::as_array)
				.map(|items| items.len())
				.unwrap_or(0);
			format!("Listed {} entr{}.", count, if count == 1 { "y" } else { "ies" })
		}
		"directory_tree" => {
			let path = structured.get("path")
				.and_then(Value::as_str)
				.unwrap_or("directory");
			format!("Built tree for {}.", path)
		}
		"get_file_info" => {
			let path = structured.get("path")
				.and_then(Value::as_str)
				.unwrap_or("file");
			format!("Stat {}.", path)
		}
		"move_file" => {
			let from = structured.get("from")
				.and_then(Value::as_str)
				.unwrap_or("source");
			let to = structured.get("to")
				.and_then(Value::as_str)
				.unwrap_or("destination");
			format!("Moved {} to {}.", from, to)
		}
		"delete_file" => {
			let path = structured.get("path")
				.and_then(Value::as_str)
				.unwrap_or("file");
			format!("Deleted {}.", path)
		}
		"search_files" => {
			let count = get_u64(structured, "count").unwrap_or(0);
			format!("Found {} match(es).", count)
		}
		"edit_file" => {
			let path = structured.get("path")
				.and_then(Value::as_str)
				.unwrap_or("file");
			let dry_run = structured.get("dry_run")
				.and_then(Value::as_bool)
				.unwrap_or(false);
			if dry_run {
				format!("Previewed edits for {}.", path)
			}
			else {
				format!("Applied edits to {}.", path)
			}
		}
		_ => "Completed tool call.".to_string(),
	}
}

fn get_u64(value: &Value, key: &str) -> Option<u64> {
	value.get(key).and_then(Value::as_u64)
}

// Maps typed core failures first, then falls back to message matching the
// way generic io errors surface.
fn error_code(err: &anyhow::Error) -> &'static str {
	if let Some(sandbox_err) = err.downcast_ref::<SandboxError>() {
		return match sandbox_err {
			SandboxError::OutsideRoots(_) => "PATH_OUTSIDE_ROOT",
			SandboxError::SymlinkOutsideRoots(_) => "PATH_OUTSIDE_ROOT",
			SandboxError::ParentMissing(_) => "PARENT_NOT_FOUND",
			SandboxError::Io { .. } => "IO_ERROR",
		};
	}
	if let Some(patch_err) = err.downcast_ref::<PatchError>() {
		return match patch_err {
			PatchError::EditNotFound(_) => "EDIT_NOT_FOUND",
			PatchError::Io { .. } => "IO_ERROR",
		};
	}
	let lower = err.to_string().to_lowercase();
	if lower.contains("path is required") {
		"MISSING_PATH"
	}
	else if lower.contains("pattern is required") {
		"MISSING_PATTERN"
	}
	else if lower.contains("content is required") {
		"MISSING_CONTENT"
	}
	else if lower.contains("paths is required") {
		"MISSING_PATHS"
	}
	else if lower.contains("paths must be an array") {
		"INVALID_PATHS"
	}
	else if lower.contains("paths is empty") {
		"EMPTY_PATHS"
	}
	else if lower.contains("edits is required") {
		"MISSING_EDITS"
	}
	else if lower.contains("edits must be an array") {
		"INVALID_EDITS"
	}
	else if lower.contains("oldtext is required") {
		"MISSING_OLD_TEXT"
	}
	else if lower.contains("newtext is required") {
		"MISSING_NEW_TEXT"
	}
	else if lower.contains("oldtext is empty") {
		"OLD_TEXT_EMPTY"
	}
	else if lower.contains("from is required") {
		"MISSING_FROM"
	}
	else if lower.contains("to is required") {
		"MISSING_TO"
	}
	else if lower.contains("target exists") {
		"TARGET_EXISTS"
	}
	else if lower.contains("cannot delete root") {
		"DELETE_ROOT_DENIED"
	}
	else if lower.contains("cannot move root") {
		"MOVE_ROOT_DENIED"
	}
	else if lower.contains("root not found") {
		"ROOT_NOT_FOUND"
	}
	else if lower.contains("invalid exclude glob") || lower.contains("invalid exclude set") {
		"INVALID_GLOB"
	}
	else if lower.contains("no such file") || lower.contains("not found") {
		"FILE_NOT_FOUND"
	}
	else if lower.contains("permission denied") {
		"PERMISSION_DENIED"
	}
	else if lower.contains("is a directory") {
		"IS_A_DIRECTORY"
	}
	else {
		"EXECUTION_ERROR"
	}
}

fn format_io_error(action: &str, path: &str, err: anyhow::Error) -> anyhow::Error {
	if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
		let reason = match io_err.kind() {
			std::io::ErrorKind::NotFound => "not found",
			std::io::ErrorKind::PermissionDenied => "permission denied",
			std::io::ErrorKind::InvalidInput => "invalid input",
			std::io::ErrorKind::InvalidData => "invalid data",
			_ => "io error",
		};
		return anyhow!("{} {}: {}", action, path, reason);
	}
	anyhow!("{} {}: {}", action, path, err)
}

// Every path argument goes through the resolver; the typed error is kept
// intact so error_code can classify it.
fn resolve_arg(allow: &AllowList, requested: &str) -> Result<PathBuf> {
	sandbox::resolve(requested, allow).map_err(anyhow::Error::new)
}

fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
	args.get(key)
		.and_then(Value::as_str)
		.ok_or_else(|| anyhow!("{} is required", key))
}

fn string_array(args: &Value, key: &str) -> Vec<String> {
	args.get(key)
		.and_then(Value::as_array)
		.map(
			|values| {
				values.iter()
					.filter_map(Value::as_str)
					.map(|value| value.to_string())
					.collect::<Vec<_>>()
			})
		.unwrap_or_default()
}

async fn require_dir(resolved: &Path, requested: &str) -> Result<()> {
	let meta = tokio::fs::metadata(resolved).await
		.map_err(|_| anyhow!("root not found: {}", requested))?;
	if !meta.is_dir() {
		return Err(anyhow!("root not found: {}", requested));
	}
	Ok(())
}

async fn execute_tool(config: &Config, name: &str, arguments: &Value) -> Result<Value> {
	let params = arguments.as_object().ok_or_else(|| ProtocolError::new(-32602, "arguments must be an object"))?;
	let args = Value::Object(params.clone());
	let allow = &config.allow;
	let result = match name {
		"list_allowed_directories" => run_tool(
			name,
			|| async {
				let directories = allow.roots()
					.iter()
					.map(|root| Value::String(root.display.clone()))
					.collect::<Vec<_>>();
				Ok(json!({
					"directories": directories
				}))
			}
		).await,
		"read_file" => run_tool(
			name,
			|| async {
				let path = require_str(&args, "path")?;
				let start_line = args.get("start_line")
					.and_then(Value::as_u64)
					.unwrap_or(1) as usize;
				let limit = match args.get("limit").and_then(Value::as_u64) {
					Some(0) | None => usize::MAX,
					Some(value) => value as usize,
				};
				let resolved = resolve_arg(allow, path)?;
				let rel = allow.relativize(&resolved);
				let slice = fs::read_file(
					&resolved,
					start_line,
					limit,
					config.read_max_bytes,
					config.read_max_line_bytes
				).await.map_err(|err| format_io_error("read", &rel, err))?;
				let mut obj = serde_json::Map::new();
				obj.insert("path".to_string(), Value::String(rel));
				obj.insert("content".to_string(), Value::String(slice.content));
				obj.insert("count".to_string(), Value::Number(slice.count.into()));
				obj.insert("total".to_string(), Value::Number(slice.total.into()));
				obj.insert("start_line".to_string(), Value::Number(start_line.into()));
				obj.insert("truncated".to_string(), Value::Bool(slice.truncated));
				if slice.truncated {
					let reasons = slice.truncated_reason
						.iter()
						.map(|reason| Value::String(reason.to_string()))
						.collect::<Vec<_>>();
					obj.insert("truncated_reason".to_string(), Value::Array(reasons));
				}
				Ok(Value::Object(obj))
			}
		).await,
		"read_multiple_files" => run_tool(
			name,
			|| async {
				let paths = args.get("paths").ok_or_else(|| anyhow!("paths is required"))?.as_array()
					.ok_or_else(|| anyhow!("paths must be an array"))?;
				if paths.is_empty() {
					return Err(anyhow!("paths is empty"));
				}
				let per_file = if config.read_max_bytes == usize::MAX {
					usize::MAX
				}
				else {
					config.read_max_bytes / paths.len().max(1)
				};
				let mut files = Vec::new();
				for path_value in paths {
					let path = match path_value.as_str() {
						Some(value) => value,
						None => {
							files.push(json!({
								"path": path_value,
								"error": "paths entries must be strings",
								"code": "INVALID_PATHS"
							}));
							continue;
						}
					};
					let resolved = match resolve_arg(allow, path) {
						Ok(resolved) => resolved,
						Err(err) => {
							files.push(json!({
								"path": path,
								"error": err.to_string(),
								"code": error_code(&err)
							}));
							continue;
						}
					};
					let rel = allow.relativize(&resolved);
					match fs::read_file(
						&resolved,
						1,
						usize::MAX,
						per_file,
						config.read_max_line_bytes
					).await {
						Ok(slice) => files.push(json!({
							"path": rel,
							"content": slice.content,
							"count": slice.count,
							"total": slice.total,
							"truncated": slice.truncated
						})),
						Err(err) => {
							let err = format_io_error("read", &rel, err);
							files.push(json!({
								"path": rel,
								"error": err.to_string(),
								"code": error_code(&err)
							}));
						}
					}
				}
				Ok(json!({
					"files": files
				}))
			}
		).await,
		"write_file" => run_tool(
			name,
			|| async {
				let path = require_str(&args, "path")?;
				let content = require_str(&args, "content")?;
				let resolved = resolve_arg(allow, path)?;
				let rel = allow.relativize(&resolved);
				fs::write_file(&resolved, content).await
					.map_err(|err| format_io_error("write", &rel, err))?;
				Ok(json!({
					"path": rel,
					"bytes": content.len()
				}))
			}
		).await,
		"create_directory" => run_tool(
			name,
			|| async {
				let path = require_str(&args, "path")?;
				let resolved = sandbox::resolve_for_create(path, allow)
					.map_err(anyhow::Error::new)?;
				let rel = allow.relativize(&resolved);
				fs::create_directory(&resolved).await
					.map_err(|err| format_io_error("create", &rel, err))?;
				Ok(json!({
					"path": rel
				}))
			}
		).await,
		"list_directory" => run_tool(
			name,
			|| async {
				let path = require_str(&args, "path")?;
				let resolved = resolve_arg(allow, path)?;
				let rel = allow.relativize(&resolved);
				let entries = fs::list_directory(&resolved).await
					.map_err(|err| format_io_error("list", &rel, err))?;
				Ok(json!({
					"path": rel,
					"entries": entries
				}))
			}
		).await,
		"directory_tree" => run_tool(
			name,
			|| async {
				let path = require_str(&args, "path")?;
				let exclude_patterns = string_array(&args, "exclude_patterns");
				let resolved = resolve_arg(allow, path)?;
				require_dir(&resolved, path).await?;
				let rel = allow.relativize(&resolved);
				let excludes = search::build_exclude_set(&exclude_patterns)?;
				let tree = fs::directory_tree(&resolved, resolved.clone(), &excludes, allow).await
					.map_err(|err| format_io_error("walk", &rel, err))?;
				Ok(json!({
					"path": rel,
					"tree": tree
				}))
			}
		).await,
		"get_file_info" => run_tool(
			name,
			|| async {
				let path = require_str(&args, "path")?;
				let resolved = resolve_arg(allow, path)?;
				let rel = allow.relativize(&resolved);
				let mut info = fs::file_info(&resolved).await
					.map_err(|err| format_io_error("stat", &rel, err))?;
				if let Some(obj) = info.as_object_mut() {
					obj.insert("path".to_string(), Value::String(rel));
				}
				Ok(info)
			}
		).await,
		"move_file" => run_tool(
			name,
			|| async {
				let from = require_str(&args, "from")?;
				let to = require_str(&args, "to")?;
				let resolved_from = resolve_arg(allow, from)?;
				let resolved_to = resolve_arg(allow, to)?;
				if allow.is_root(&resolved_from) {
					return Err(anyhow!("cannot move root"));
				}
				let rel_from = allow.relativize(&resolved_from);
				let rel_to = allow.relativize(&resolved_to);
				fs::move_path(&resolved_from, &resolved_to).await
					.map_err(|err| {
						if err.to_string().contains("target exists") {
							err
						}
						else {
							format_io_error("move", &rel_from, err)
						}
					})?;
				Ok(json!({
					"from": rel_from,
					"to": rel_to
				}))
			}
		).await,
		"delete_file" => run_tool(
			name,
			|| async {
				let path = require_str(&args, "path")?;
				let resolved = resolve_arg(allow, path)?;
				if allow.is_root(&resolved) {
					return Err(anyhow!("cannot delete root"));
				}
				let rel = allow.relativize(&resolved);
				fs::delete_path(&resolved).await
					.map_err(|err| format_io_error("delete", &rel, err))?;
				Ok(json!({
					"path": rel
				}))
			}
		).await,
		"search_files" => run_tool(
			name,
			|| async {
				let path = require_str(&args, "path")?;
				let pattern = require_str(&args, "pattern")?;
				let exclude_patterns = string_array(&args, "exclude_patterns");
				let resolved = resolve_arg(allow, path)?;
				require_dir(&resolved, path).await?;
				let matches = search::search(&resolved, pattern, &exclude_patterns, allow).await?;
				let count = matches.len();
				let matches = matches.iter()
					.map(|entry| Value::String(entry.to_string_lossy().to_string()))
					.collect::<Vec<_>>();
				Ok(json!({
					"path": allow.relativize(&resolved),
					"pattern": pattern,
					"matches": matches,
					"count": count
				}))
			}
		).await,
		"edit_file" => run_tool(
			name,
			|| async {
				let path = require_str(&args, "path")?;
				let edits = args.get("edits").ok_or_else(|| anyhow!("edits is required"))?.as_array()
					.ok_or_else(|| anyhow!("edits must be an array"))?;
				let dry_run = args.get("dryRun")
					.and_then(Value::as_bool)
					.unwrap_or(false);
				let edits = edits.iter()
					.enumerate()
					.map(
						|(index, edit)| {
							let old_text = edit.get("oldText")
								.and_then(Value::as_str)
								.ok_or_else(|| anyhow!("oldText is required"))?;
							let new_text = edit.get("newText")
								.and_then(Value::as_str)
								.ok_or_else(|| anyhow!("newText is required"))?;
							if old_text.is_empty() {
								return Err(anyhow!("oldText is empty at index {}", index));
							}
							Ok(Edit {
								old_text: old_text.to_string(),
								new_text: new_text.to_string(),
							})
						})
					.collect::<Result<Vec<_>>>()?;
				let resolved = resolve_arg(allow, path)?;
				let rel = allow.relativize(&resolved);
				let diff = patch::apply_edits(&resolved, &edits, dry_run).await
					.map_err(anyhow::Error::new)?;
				Ok(json!({
					"path": rel,
					"diff": diff,
					"dry_run": dry_run
				}))
			}
		).await,
		_ => return Err(ProtocolError::new(-32602, format!("unknown tool: {}", name)).into()),
	};
	Ok(result)
}

fn tool_definitions() -> Vec<Value> {
	vec![
	json!({
		"name": "list_allowed_directories",
		"description": "list the directories this server is allowed to touch",
		"inputSchema": {
            "type": "object",
            "properties": {},
            "additionalProperties": false
        }
	}),
	json!({
		"name": "read_file",
		"description": "read a file as numbered lines with optional start_line/limit",
		"inputSchema": {
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path inside an allowed directory." },
                "start_line": { "type": "integer", "minimum": 1, "description": "First line to return (1-based)." },
                "limit": { "type": "integer", "minimum": 1, "description": "Maximum number of lines to return." }
            },
            "required": ["path"]
        }
	}),
	json!({
		"name": "read_multiple_files",
		"description": "read several files; a failing path reports inline and does not abort the rest",
		"inputSchema": {
            "type": "object",
            "properties": {
                "paths": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "File paths inside allowed directories."
                }
            },
            "required": ["paths"]
        }
	}),
	json!({
		"name": "write_file",
		"description": "create or overwrite a file (the parent directory must exist)",
		"inputSchema": {
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Destination path inside an allowed directory." },
                "content": { "type": "string", "description": "Full file content." }
            },
            "required": ["path", "content"]
        }
	}),
	json!({
		"name": "create_directory",
		"description": "create a directory and any missing parents",
		"inputSchema": {
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory path inside an allowed directory." }
            },
            "required": ["path"]
        }
	}),
	json!({
		"name": "list_directory",
		"description": "list one directory level as [FILE]/[DIR] entries",
		"inputSchema": {
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory path inside an allowed directory." }
            },
            "required": ["path"]
        }
	}),
	json!({
		"name": "directory_tree",
		"description": "recursive JSON tree of a directory",
		"inputSchema": {
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory path inside an allowed directory." },
                "exclude_patterns": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Glob patterns to skip; a bare name excludes that path segment anywhere."
                }
            },
            "required": ["path"]
        }
	}),
	json!({
		"name": "get_file_info",
		"description": "size, timestamps, type, and permissions of a path",
		"inputSchema": {
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path inside an allowed directory." }
            },
            "required": ["path"]
        }
	}),
	json!({
		"name": "move_file",
		"description": "move/rename a file or directory (fails if destination exists)",
		"inputSchema": {
            "type": "object",
            "properties": {
                "from": { "type": "string", "description": "Source path inside an allowed directory." },
                "to": { "type": "string", "description": "Destination path inside an allowed directory." }
            },
            "required": ["from", "to"]
        }
	}),
	json!({
		"name": "delete_file",
		"description": "delete a file or directory recursively",
		"inputSchema": {
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path inside an allowed directory." }
            },
            "required": ["path"]
        }
	}),
	json!({
		"name": "search_files",
		"description": "recursively find entries whose name contains the pattern (case-insensitive)",
		"inputSchema": {
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory to search, inside an allowed directory." },
                "pattern": { "type": "string", "description": "Case-insensitive substring to match against entry names." },
                "exclude_patterns": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Glob patterns to skip; a bare name excludes that path segment anywhere."
                }
            },
            "required": ["path", "pattern"]
        }
	}),
	json!({
		"name": "edit_file",
		"description": "apply ordered text edits with a whitespace-insensitive fallback and return a fenced unified diff",
		"inputSchema": {
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path inside an allowed directory." },
                "edits": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "oldText": { "type": "string", "description": "Text to replace; matched exactly first, then line-by-line ignoring surrounding whitespace." },
                            "newText": { "type": "string", "description": "Replacement text." }
                        },
                        "required": ["oldText", "newText"]
                    }
                },
                "dryRun": { "type": "boolean", "description": "Compute the diff without writing the file." }
            },
            "required": ["path", "edits"]
        }
	})]
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn error_code_classifies_typed_failures() {
		let outside = anyhow::Error::new(SandboxError::OutsideRoots(PathBuf::from("/etc/passwd")));
		assert_eq!(error_code(&outside), "PATH_OUTSIDE_ROOT");
		let symlink = anyhow::Error::new(SandboxError::SymlinkOutsideRoots(PathBuf::from("/tmp/x")));
		assert_eq!(error_code(&symlink), "PATH_OUTSIDE_ROOT");
		let parent = anyhow::Error::new(SandboxError::ParentMissing(PathBuf::from("/tmp/x")));
		assert_eq!(error_code(&parent), "PARENT_NOT_FOUND");
		let edit = anyhow::Error::new(PatchError::EditNotFound("missing".to_string()));
		assert_eq!(error_code(&edit), "EDIT_NOT_FOUND");
	}

	#[test]
	fn error_code_falls_back_to_message_matching() {
		assert_eq!(error_code(&anyhow!("path is required")), "MISSING_PATH");
		assert_eq!(error_code(&anyhow!("target exists")), "TARGET_EXISTS");
		assert_eq!(error_code(&anyhow!("read config.txt: not found")), "FILE_NOT_FOUND");
		assert_eq!(error_code(&anyhow!("something else entirely")), "EXECUTION_ERROR");
	}

	#[test]
	fn tool_definitions_cover_the_full_surface() {
		let names = tool_definitions()
			.iter()
			.filter_map(|tool| tool.get("name").and_then(Value::as_str).map(str::to_string))
			.collect::<Vec<_>>();
		assert_eq!(names.len(), 12);
		for expected in [
			"list_allowed_directories",
			"read_file",
			"read_multiple_files",
			"write_file",
			"create_directory",
			"list_directory",
			"directory_tree",
			"get_file_info",
			"move_file",
			"delete_file",
			"search_files",
			"edit_file",
		] {
			assert!(names.iter().any(|name| name == expected), "missing {}", expected);
		}
	}
}
