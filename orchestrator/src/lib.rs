//! Autonomous task orchestration engine.
//!
//! A work request is decomposed into stories and tasks with prerequisites.
//! The orchestrator runs every task through execution, independent review and
//! a regression-checking quality gate, using a bounded pool of workers against
//! one shared git working tree. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (dependency graph, lifecycle,
//!   failure classification, retry decisions, regression diffing). No I/O,
//!   fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (agents, git, test runs, state
//!   persistence, notifications). Isolated behind traits to enable fakes in
//!   tests.
//!
//! Orchestration modules ([`scheduler`], [`worker`], [`session`], [`validate`])
//! coordinate core logic with I/O to implement CLI commands.

pub mod cancel;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod report;
pub mod scheduler;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;
pub mod work_request;
pub mod worker;
