//! Deterministic classification of a finished project run.

use crate::core::types::ExecutionOutcome;

/// Everything observed about a child process that has exited.
#[derive(Debug, Clone, Copy)]
pub struct ExitReport<'a> {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, if the process was killed.
    pub signal: Option<i32>,
    /// Captured stdout tail.
    pub stdout: &'a str,
    /// Captured stderr tail.
    pub stderr: &'a str,
    /// Whether any error marker was seen on any line, including lines that
    /// have since dropped out of the captured tails.
    pub marker_seen: bool,
}

/// Classify an exited process.
///
/// - `CleanExit` if the exit code is 0 and no error marker was printed.
/// - `Crashed` otherwise, with the diagnostic tail as the trace.
pub fn classify_exit(report: &ExitReport<'_>, markers: &[String]) -> ExecutionOutcome {
    if report.code == Some(0) && !report.marker_seen {
        return ExecutionOutcome::CleanExit;
    }
    ExecutionOutcome::Crashed {
        trace: build_trace(report, markers),
    }
}

/// First error marker contained in `line`, if any.
pub fn find_marker<'m>(line: &str, markers: &'m [String]) -> Option<&'m str> {
    markers
        .iter()
        .find(|marker| !marker.is_empty() && line.contains(marker.as_str()))
        .map(String::as_str)
}

fn build_trace(report: &ExitReport<'_>, markers: &[String]) -> String {
    let status = match (report.code, report.signal) {
        (Some(code), _) => format!("[process exited with status {code}]"),
        (None, Some(signal)) => format!("[process terminated by signal {signal}]"),
        (None, None) => "[process exited with unknown status]".to_string(),
    };

    let body = from_last_marker(report.stderr, markers)
        .or_else(|| from_last_marker(report.stdout, markers))
        .unwrap_or_else(|| {
            if report.stderr.trim().is_empty() {
                report.stdout.trim_end()
            } else {
                report.stderr.trim_end()
            }
        });

    if body.is_empty() {
        status
    } else {
        format!("{status}\n{body}")
    }
}

/// Slice of `text` starting at the line holding the last marker occurrence.
fn from_last_marker<'t>(text: &'t str, markers: &[String]) -> Option<&'t str> {
    let start = markers
        .iter()
        .filter(|marker| !marker.is_empty())
        .filter_map(|marker| text.rfind(marker.as_str()))
        .max()?;
    let line_start = text[..start].rfind('\n').map(|idx| idx + 1).unwrap_or(0);
    Some(text[line_start..].trim_end())
}
