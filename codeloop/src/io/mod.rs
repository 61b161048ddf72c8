//! Side-effecting parts of the loop: network, filesystem, processes, signals.

pub mod attempt_log;
pub mod config;
pub mod deps;
pub mod interrupt;
pub mod materialize;
pub mod process;
pub mod prompt;
pub mod provider;
pub mod supervisor;
pub mod web;
