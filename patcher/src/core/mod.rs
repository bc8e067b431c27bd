//! Deterministic, pure logic shared by the patcher.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod budget;
pub mod crash_log;
pub mod outcome;
pub mod phase;
pub mod ref_diff;
pub mod types;
