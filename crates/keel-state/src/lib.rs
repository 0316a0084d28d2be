//! keel-state — embedded state store for Keel.
//!
//! Backed by [redb](https://docs.rs/redb), persists everything the scheduler
//! needs to survive its own restart: the desired spec, the framework
//! identity, and one record per executor slot.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Slot keys are zero-padded slot ids so a table scan yields slots in order.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. Every `put_*` commits its own write
//! transaction before returning.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{PersistedState, StateStore};
pub use types::*;
