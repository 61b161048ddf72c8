//! Inputs for the follow-up prompt sent after a failed attempt.
//!
//! The rendered wording lives in `io::prompt`; this module decides what goes in
//! and bounds the diagnostic so repeated failures cannot grow requests without
//! limit.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;

/// Why the previous attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The project ran and crashed.
    Crashed,
    /// The provider failed or the response could not be used.
    Provider,
}

/// One source file to include verbatim in the feedback prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFile {
    pub path: String,
    pub content: String,
}

/// Everything the feedback template needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedbackInputs {
    pub kind: FailureKind,
    pub requirement: String,
    pub sources: Vec<SourceFile>,
    pub diagnostic: String,
}

/// Collect feedback inputs from the last materialized files and the failure text.
///
/// `diagnostic_limit_bytes` bounds the diagnostic only; requirement and sources
/// are always included in full.
pub fn compose_feedback(
    kind: FailureKind,
    requirement: &str,
    files: &BTreeMap<PathBuf, String>,
    diagnostic: &str,
    diagnostic_limit_bytes: usize,
) -> FeedbackInputs {
    let sources = files
        .iter()
        .map(|(path, content)| SourceFile {
            path: path.to_string_lossy().replace('\\', "/"),
            content: content.clone(),
        })
        .collect();
    FeedbackInputs {
        kind,
        requirement: requirement.to_string(),
        sources,
        diagnostic: truncate_tail(diagnostic, diagnostic_limit_bytes),
    }
}

/// Keep at most `limit` bytes from the end of `text`, on a line boundary when
/// one is available.
pub fn truncate_tail(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }

    let mut cut = text.len() - limit;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    if let Some(newline) = text[cut..].find('\n') {
        let line_start = cut + newline + 1;
        if line_start < text.len() {
            cut = line_start;
        }
    }

    format!("[... {cut} earlier bytes truncated ...]\n{}", &text[cut..])
}
