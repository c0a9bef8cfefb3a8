//! Integration testing framework for the socket-activation unit controller
//!
//! Spawns the real `sockunitd` binary and drives it the way an init system
//! would: real listen sockets, real signals, real control-process exits.

pub mod infrastructure;
pub mod scenarios;

// Re-export commonly used types for convenience
pub use infrastructure::{ProcessTestHarness, TestProcess};
