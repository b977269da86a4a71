//! Stable exit codes for orchestrator CLI commands.

/// Command succeeded; for `run`, every task is done.
pub const OK: i32 = 0;
/// Invalid input, config or state, or any other error.
pub const INVALID: i32 = 1;
/// The run finished but some tasks are blocked.
pub const BLOCKED: i32 = 2;
/// The run was cancelled or is not finished.
pub const CANCELLED: i32 = 3;
