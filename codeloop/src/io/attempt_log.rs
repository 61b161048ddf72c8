//! Attempt logging helpers for `.codeloop/attempts/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::response::STATE_DIR;
use crate::core::types::{AttemptOutcome, GenerationAttempt};
use crate::io::deps::DependencyReport;
use crate::io::materialize::MaterializeReport;

#[derive(Debug, Clone, Serialize)]
pub struct AttemptMeta {
    pub attempt: usize,
    pub started_at: String,
    pub duration_ms: u64,
    /// Attempts left for the current requirement after this one.
    pub budget_remaining: u32,
    pub outcome: AttemptOutcome,
    pub materialized: Option<MaterializeReport>,
}

#[derive(Debug, Clone)]
pub struct AttemptPaths {
    pub dir: PathBuf,
    pub prompt_path: PathBuf,
    pub response_path: PathBuf,
    pub meta_path: PathBuf,
    pub trace_path: PathBuf,
    pub dependencies_path: PathBuf,
}

const ATTEMPTS_DIR: &str = "attempts";

impl AttemptPaths {
    pub fn new(root: &Path, attempt: usize) -> Self {
        let dir = root
            .join(STATE_DIR)
            .join(ATTEMPTS_DIR)
            .join(attempt.to_string());
        Self {
            prompt_path: dir.join("prompt.md"),
            response_path: dir.join("response.txt"),
            meta_path: dir.join("meta.json"),
            trace_path: dir.join("trace.log"),
            dependencies_path: dir.join("dependencies.json"),
            dir,
        }
    }
}

pub struct AttemptWriteRequest<'a> {
    pub root: &'a Path,
    pub record: &'a GenerationAttempt,
    pub meta: &'a AttemptMeta,
    pub dependencies: Option<&'a DependencyReport>,
}

pub fn write_attempt(request: &AttemptWriteRequest<'_>) -> Result<AttemptPaths> {
    let paths = AttemptPaths::new(request.root, request.meta.attempt);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create attempt dir {}", paths.dir.display()))?;

    write_text(&paths.prompt_path, &request.record.prompt_text)?;
    write_text(&paths.response_path, &request.record.response_text)?;
    write_json(&paths.meta_path, request.meta)?;
    if let Some(trace) = request.record.outcome.failure_text() {
        write_text(&paths.trace_path, trace)?;
    }
    if let Some(report) = request.dependencies {
        write_json(&paths.dependencies_path, report)?;
    }

    Ok(paths)
}

/// Highest attempt number already recorded under `root`, or 0.
///
/// Sessions continue numbering from here so earlier sessions' attempts on the
/// same project are never overwritten.
pub fn last_attempt_number(root: &Path) -> Result<usize> {
    let dir = root.join(STATE_DIR).join(ATTEMPTS_DIR);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err).with_context(|| format!("read {}", dir.display())),
    };
    let mut last = 0;
    for entry in entries {
        let entry = entry.with_context(|| format!("read {}", dir.display()))?;
        if let Some(number) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<usize>().ok())
        {
            last = last.max(number);
        }
    }
    Ok(last)
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ExecutionOutcome;

    fn meta(attempt: usize, outcome: AttemptOutcome) -> AttemptMeta {
        AttemptMeta {
            attempt,
            started_at: "2024-01-01T00:00:00Z".to_string(),
            duration_ms: 12,
            budget_remaining: 4,
            outcome,
            materialized: None,
        }
    }

    #[test]
    fn attempt_paths_are_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = AttemptPaths::new(temp.path(), 3);

        assert!(paths.dir.ends_with(Path::new(".codeloop/attempts/3")));
        assert!(paths.prompt_path.ends_with("prompt.md"));
        assert!(paths.response_path.ends_with("response.txt"));
        assert!(paths.meta_path.ends_with("meta.json"));
        assert!(paths.trace_path.ends_with("trace.log"));
        assert!(paths.dependencies_path.ends_with("dependencies.json"));
    }

    #[test]
    fn crashed_attempt_writes_trace_and_dependencies() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outcome = AttemptOutcome::Executed {
            outcome: ExecutionOutcome::Crashed {
                trace: "NameError: x".to_string(),
            },
        };
        let record = GenerationAttempt {
            prompt_text: "build it".to_string(),
            response_text: "{}".to_string(),
            timestamp: "2024-01-01T00:00:00Z".to_string(),
            outcome: outcome.clone(),
        };

        let paths = write_attempt(&AttemptWriteRequest {
            root: temp.path(),
            record: &record,
            meta: &meta(1, outcome),
            dependencies: Some(&DependencyReport::default()),
        })
        .expect("write");

        assert_eq!(fs::read_to_string(&paths.prompt_path).expect("prompt"), "build it");
        assert_eq!(fs::read_to_string(&paths.trace_path).expect("trace"), "NameError: x");
        assert!(paths.dependencies_path.is_file());
        let meta: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.meta_path).expect("meta"))
                .expect("json");
        assert_eq!(meta["outcome"]["outcome"]["kind"], "crashed");
    }

    #[test]
    fn successful_attempt_has_no_trace() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outcome = AttemptOutcome::Executed {
            outcome: ExecutionOutcome::CleanExit,
        };
        let record = GenerationAttempt {
            prompt_text: "p".to_string(),
            response_text: "r".to_string(),
            timestamp: "2024-01-01T00:00:00Z".to_string(),
            outcome: outcome.clone(),
        };

        let paths = write_attempt(&AttemptWriteRequest {
            root: temp.path(),
            record: &record,
            meta: &meta(2, outcome),
            dependencies: None,
        })
        .expect("write");

        assert!(paths.meta_path.is_file());
        assert!(!paths.trace_path.exists());
        assert!(!paths.dependencies_path.exists());
    }

    #[test]
    fn last_attempt_number_ignores_non_numeric_entries() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert_eq!(last_attempt_number(temp.path()).expect("empty"), 0);

        let attempts = temp.path().join(".codeloop/attempts");
        for name in ["2", "11", "7", "notes"] {
            fs::create_dir_all(attempts.join(name)).expect("mkdir");
        }
        assert_eq!(last_attempt_number(temp.path()).expect("scan"), 11);
    }
}
