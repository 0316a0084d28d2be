//! redb table definitions for the Keel state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Singleton records (desired spec, framework identity) keyed by record name.
pub const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

/// Executor slots keyed by the zero-padded slot id, so iteration is slot-ordered.
pub const SLOTS: TableDefinition<&str, &[u8]> = TableDefinition::new("slots");

/// Key of the desired spec in [`META`].
pub const DESIRED_KEY: &str = "desired";

/// Key of the framework identity in [`META`].
pub const FRAMEWORK_KEY: &str = "framework";

/// Key of the generation high-water mark of removed slots in [`META`].
pub const GENERATION_FLOOR_KEY: &str = "generation_floor";

/// Key of the liveness record [`crate::StateStore::ping`] rewrites in [`META`].
pub const HEARTBEAT_KEY: &str = "heartbeat";
