//! LLM-driven project generation with an execute-and-repair loop.
//!
//! Given a requirement, the agent asks a model for a whole project, writes it
//! to disk, runs it and feeds any crash back to the model until the project
//! runs or the retry budget is spent. The architecture keeps a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (state machine, response parsing,
//!   outcome classification, feedback composition). No I/O.
//! - **[`io`]**: Side-effecting operations (model API, filesystem, package
//!   installs, child processes, signals). Each external seam is a trait so
//!   tests can script it.
//!
//! [`session`] coordinates the two and is what the CLI drives.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
