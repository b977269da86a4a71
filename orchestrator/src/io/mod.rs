//! I/O helpers for orchestrator commands.

pub mod agent;
pub mod config;
pub mod execution;
pub mod git;
pub mod init;
pub mod notify;
pub mod process;
pub mod prompt;
pub mod quality;
pub mod resources;
pub mod safety;
pub mod sandbox;
pub mod store;
pub mod verification;
