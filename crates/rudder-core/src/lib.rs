//! rudder-core — shared vocabulary of the Rudder GitOps agent.
//!
//! Domain types for applications, snapshots, deployments and pipelines,
//! plus the interfaces the core talks to the outside world through:
//!
//! - **`source`** — desired-state providers (`FileProvider`)
//! - **`driver`** — platform driver capability set and registry
//! - **`reporter`** — fire-and-forget transition sinks
//! - **`config`** — `rudderd.toml` parsing

pub mod clock;
pub mod config;
pub mod driver;
pub mod reporter;
pub mod source;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod types;

pub use config::DaemonConfig;
pub use driver::{DriverBounds, DriverError, DriverRegistry, PlatformDriver, StageContext, StageOutput};
pub use reporter::{ChannelReporter, FanoutReporter, Reporter, TracingReporter};
pub use source::{DesiredStateProvider, FileProvider, ProviderError};
pub use types::*;
