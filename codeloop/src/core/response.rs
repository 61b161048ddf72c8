//! Parsing of model responses into file blocks.
//!
//! The model answers with a JSON envelope:
//!
//! ```json
//! {
//!   "project_type": "python",
//!   "out_file": [
//!     { "file_name": "main.py", "operation": "write", "description": "...", "code": "..." }
//!   ]
//! }
//! ```
//!
//! The envelope may be bare, wrapped in a fenced code block, or surrounded by
//! prose. Each `out_file` entry is one file block; entries that cannot be used
//! are dropped with a warning instead of failing the whole response.

use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use jsonschema::{Validator, validator_for};
use regex::Regex;
use serde_json::{Map, Value};
use tracing::warn;

use crate::core::types::{FileBlock, FileOperation};

const RESPONSE_SCHEMA: &str = include_str!("../../schemas/response.schema.json");

/// Directory inside the project that belongs to the agent, never to the model.
pub const STATE_DIR: &str = ".codeloop";

/// Usable content of one model response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    /// Project kind declared by the model (`web` or `python`), if any.
    pub project_type: Option<String>,
    /// File blocks in response order, one per path.
    pub blocks: Vec<FileBlock>,
    /// Human-readable reasons for every dropped entry.
    pub dropped: Vec<String>,
}

impl ParsedResponse {
    pub fn writes(&self) -> impl Iterator<Item = &FileBlock> {
        self.blocks
            .iter()
            .filter(|block| block.operation == FileOperation::Write)
    }
}

/// Parse a raw model response.
///
/// Returns an error describing the problem when no JSON envelope can be found
/// or when zero file blocks survive validation.
pub fn parse_response(text: &str) -> Result<ParsedResponse, String> {
    let envelope = extract_envelope(text)?;

    let project_type = envelope
        .get("project_type")
        .and_then(Value::as_str)
        .map(str::to_string);
    let entries = envelope
        .get("out_file")
        .and_then(Value::as_array)
        .ok_or_else(|| "response has no out_file array".to_string())?;

    let mut blocks: Vec<FileBlock> = Vec::new();
    let mut dropped = Vec::new();
    for (idx, entry) in entries.iter().enumerate() {
        match parse_entry(entry) {
            Ok(block) => {
                if let Some(pos) = blocks.iter().position(|b| b.path == block.path) {
                    let reason = format!(
                        "out_file[{idx}]: duplicate path {}, keeping the later entry",
                        block.path.display()
                    );
                    warn!(%reason, "dropping file block");
                    dropped.push(reason);
                    blocks.remove(pos);
                }
                blocks.push(block);
            }
            Err(reason) => {
                let reason = format!("out_file[{idx}]: {reason}");
                warn!(%reason, "dropping file block");
                dropped.push(reason);
            }
        }
    }

    let write_paths: Vec<PathBuf> = blocks
        .iter()
        .filter(|b| b.operation == FileOperation::Write)
        .map(|b| b.path.clone())
        .collect();
    blocks.retain(|block| {
        let Some(nested) = write_paths
            .iter()
            .find(|other| *other != &block.path && other.starts_with(&block.path))
        else {
            return true;
        };
        let reason = format!(
            "{} is also the parent directory of {}",
            block.path.display(),
            nested.display()
        );
        warn!(%reason, "dropping file block");
        dropped.push(reason);
        false
    });

    if blocks.is_empty() {
        return Err(format!(
            "response contained no usable file blocks ({} dropped)",
            dropped.len()
        ));
    }

    Ok(ParsedResponse {
        project_type,
        blocks,
        dropped,
    })
}

/// Find the first candidate JSON object in `text` that matches the envelope schema.
fn extract_envelope(text: &str) -> Result<Map<String, Value>, String> {
    static FENCE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").unwrap());

    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("response was empty".to_string());
    }

    let mut candidates: Vec<&str> = vec![trimmed];
    candidates.extend(
        FENCE_RE
            .captures_iter(trimmed)
            .filter_map(|caps| caps.get(1).map(|m| m.as_str())),
    );
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && start < end
    {
        candidates.push(&trimmed[start..=end]);
    }

    let mut last_error = "response did not contain a JSON object".to_string();
    for candidate in candidates {
        let Ok(value) = serde_json::from_str::<Value>(candidate) else {
            continue;
        };
        if let Err(err) = validate_envelope(&value) {
            last_error = err;
            continue;
        }
        if let Value::Object(object) = value {
            return Ok(object);
        }
    }
    Err(last_error)
}

fn validate_envelope(value: &Value) -> Result<(), String> {
    static VALIDATOR: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
        let schema: Value = serde_json::from_str(RESPONSE_SCHEMA)
            .map_err(|err| format!("invalid embedded response schema: {err}"))?;
        validator_for(&schema).map_err(|err| format!("invalid response schema: {err}"))
    });

    let validator = VALIDATOR.as_ref().map_err(Clone::clone)?;
    if validator.is_valid(value) {
        return Ok(());
    }
    let messages = validator
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect::<Vec<_>>();
    Err(format!(
        "response does not match the expected format: {}",
        messages.join("; ")
    ))
}

fn parse_entry(entry: &Value) -> Result<FileBlock, String> {
    let name = entry
        .get("file_name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| "missing file_name".to_string())?;
    let path = normalize_relative_path(name)?;

    let operation = match entry.get("operation").and_then(Value::as_str) {
        None | Some("write") => FileOperation::Write,
        Some("delete") => FileOperation::Delete,
        Some(other) => return Err(format!("unsupported operation {other:?} for {name}")),
    };

    let content = entry
        .get("code")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if operation == FileOperation::Write && content.trim().is_empty() {
        return Err(format!("empty content for {name}"));
    }

    let description = entry
        .get("description")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(FileBlock {
        path,
        operation,
        description,
        content: if operation == FileOperation::Write {
            content
        } else {
            String::new()
        },
    })
}

/// Validate a model-supplied path and return it relative to the project root.
///
/// Rejects absolute paths, parent-directory components, and the agent's own
/// state directory.
pub fn normalize_relative_path(raw: &str) -> Result<PathBuf, String> {
    let mut normalized = PathBuf::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => return Err(format!("path escapes project root: {raw}")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(format!("absolute path not allowed: {raw}"));
            }
        }
    }
    if normalized.as_os_str().is_empty() {
        return Err(format!("empty path: {raw:?}"));
    }
    if normalized.starts_with(STATE_DIR) {
        return Err(format!("path is reserved for the agent: {raw}"));
    }
    Ok(normalized)
}
