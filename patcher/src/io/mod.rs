//! Side-effecting operations: filesystem, git, child processes, framework calls.

pub mod config;
pub mod crash;
pub mod framework;
pub mod git;
pub mod inputs;
pub mod process;
pub mod prompt;
pub mod session_log;
pub mod workspace;
