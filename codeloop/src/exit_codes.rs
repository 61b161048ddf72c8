//! Stable exit codes for the codeloop CLI.

/// The operator ended the session (after a success, or before any request).
pub const OK: i32 = 0;
/// Invalid config, unusable project directory, missing API key, or a supervisor fault.
pub const FAULT: i32 = 1;
/// Every attempt allowed for a requirement failed.
pub const EXHAUSTED: i32 = 2;
/// The operator interrupted while no project was running.
pub const INTERRUPTED: i32 = 3;
