//! Stable exit codes for patcher CLI commands.

/// Run finished: patch produced, no patch, or nothing to do.
pub const OK: i32 = 0;
/// Setup failed (configuration, source, builder, agent) or the workspace could not be trusted.
pub const FATAL: i32 = 1;
/// Stopped by SIGINT or SIGTERM after terminating the agent.
pub const INTERRUPTED: i32 = 130;
