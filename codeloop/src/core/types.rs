//! Shared deterministic types for the generation loop.
//!
//! These types define stable contracts between the session controller, the
//! supervisor, and the attempt log. They carry no I/O handles.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Session mode chosen by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Generate a project from nothing. The session owns the whole tree.
    Fresh,
    /// Modify a project that already exists on disk.
    Existing,
}

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// One entry of the conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn model(content: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            content: content.into(),
        }
    }
}

/// How a supervised run of the project ended.
///
/// `Running` is observed but never returned by the supervisor: a running
/// process always ends as one of the other variants before the call returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// Alive past the startup window with no error signal (a service).
    Running,
    /// Exited with a success status and no error markers in its output.
    CleanExit,
    /// Exited with a failure status or printed an error marker.
    Crashed { trace: String },
    /// Stopped by the operator while alive.
    UserInterrupted,
    /// Still running when the configured run limit expired.
    TimedOut,
}

impl ExecutionOutcome {
    /// Whether the outcome ends the repair loop as a success.
    pub fn is_success(&self) -> bool {
        !matches!(self, ExecutionOutcome::Crashed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            ExecutionOutcome::Running => "running",
            ExecutionOutcome::CleanExit => "clean exit",
            ExecutionOutcome::Crashed { .. } => "crashed",
            ExecutionOutcome::UserInterrupted => "stopped by operator",
            ExecutionOutcome::TimedOut => "timed out",
        }
    }
}

/// Result recorded for one generation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The response was materialized and executed.
    Executed { outcome: ExecutionOutcome },
    /// The provider failed or the response held no usable file blocks.
    ProviderFailed { message: String },
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        match self {
            AttemptOutcome::Executed { outcome } => outcome.is_success(),
            AttemptOutcome::ProviderFailed { .. } => false,
        }
    }

    /// Diagnostic text to feed back to the model, if the attempt failed.
    pub fn failure_text(&self) -> Option<&str> {
        match self {
            AttemptOutcome::Executed {
                outcome: ExecutionOutcome::Crashed { trace },
            } => Some(trace),
            AttemptOutcome::Executed { .. } => None,
            AttemptOutcome::ProviderFailed { message } => Some(message),
        }
    }
}

/// One request/response exchange with the model. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationAttempt {
    pub prompt_text: String,
    pub response_text: String,
    /// RFC 3339 timestamp of when the request was sent.
    pub timestamp: String,
    pub outcome: AttemptOutcome,
}

/// What the model asked to happen to one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    Write,
    Delete,
}

/// A single parsed file block from a model response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBlock {
    /// Path relative to the project root, already validated.
    pub path: PathBuf,
    pub operation: FileOperation,
    pub description: Option<String>,
    /// File contents; empty for deletions.
    pub content: String,
}
