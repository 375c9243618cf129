//! Deterministic, pure logic shared by the orchestration layer.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod events;
pub mod guards;
pub mod progress;
pub mod recovery;
pub mod types;
