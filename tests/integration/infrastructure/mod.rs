pub mod process_harness;
pub mod socket_framework;

pub use process_harness::{ProcessTestHarness, TestProcess};
pub use socket_framework::{SocketInheritanceEnv, SocketTestUtils};
