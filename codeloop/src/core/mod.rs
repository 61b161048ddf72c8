//! Deterministic, pure logic shared by the generation loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod classifier;
pub mod feedback;
pub mod history;
pub mod response;
pub mod state;
pub mod types;
