//! redb table definitions for the Rudder state store.
//!
//! Each table uses `&str` keys and `&[u8]` values holding a JSON-serialized
//! [`Versioned`](crate::Versioned) envelope.

use redb::TableDefinition;

/// Table shape shared by every record kind.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Application registrations keyed by `{application_id}`.
pub const APPLICATIONS: JsonTable = TableDefinition::new("applications");

/// Deployment records keyed by `{deployment_id}`.
pub const DEPLOYMENTS: JsonTable = TableDefinition::new("deployments");

/// Active-deployment markers keyed by `{application_id}`.
pub const ACTIVE: JsonTable = TableDefinition::new("active_deployments");

/// Evaluation markers keyed by `{application_id}`.
pub const EVALUATIONS: JsonTable = TableDefinition::new("evaluations");
