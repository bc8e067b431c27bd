//! Vulnerability-patching session orchestrator.
//!
//! Given proof-of-vulnerability inputs that crash a fuzzed target, the patcher
//! reproduces each crash, hands the evidence to an external patching agent,
//! supervises that agent under a time budget and leaves patch submission to a
//! background watcher. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (truncation, diff parsing, outcome
//!   classification, the run state machine). No I/O.
//! - **[`io`]**: Side-effecting operations (git, child processes, framework
//!   calls, configuration, session artifacts).
//! - **[`agents`]**: Agent implementations and the process supervisor.
//!
//! [`controller`] coordinates all three to implement `patcher run`.

pub mod agents;
pub mod controller;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
