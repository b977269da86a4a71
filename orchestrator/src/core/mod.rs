//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod capacity;
pub mod classifier;
pub mod effort;
pub mod graph;
pub mod lifecycle;
pub mod regression;
pub mod retry;
pub mod types;
pub mod verdict;
