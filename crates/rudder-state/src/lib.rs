//! rudder-state — embedded state store for Rudder.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for applications, deployments, active-deployment markers and
//! evaluation markers.
//!
//! # Architecture
//!
//! Every value is a JSON-serialized [`Versioned`] envelope. Writers that may
//! race use compare-and-swap against the version they read; redb serializes
//! write transactions, so the check and the write commit atomically.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
