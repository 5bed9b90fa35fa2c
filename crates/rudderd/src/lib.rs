//! rudderd — the Rudder daemon, as a library.
//!
//! The binary in `main.rs` only parses arguments and installs logging;
//! assembling the agent lives here so it can be driven from tests.

pub mod daemon;
pub mod local;

pub use daemon::{Daemon, check_config};
pub use local::LocalDriver;
