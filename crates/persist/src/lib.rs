//! File-backed snapshot persistence.
//!
//! State is stored as a single JSON envelope document:
//! ```text
//! {
//!   "schema_version": 2,
//!   "snapshot": { ... },
//!   "metadata": {
//!     "saved_at_epoch_millis": 1700000000000,
//!     "snapshot_sha256": "…hex…",
//!     "migration_history": ["0->1: …"]
//!   }
//! }
//! ```
//! Older files (version 0 bare snapshots, version 1 envelopes without
//! metadata) are upgraded on load through an ordered chain of pure
//! migration steps.

pub mod migrate;
pub mod store;

pub use migrate::CURRENT_SCHEMA_VERSION;
pub use store::{LoadResult, MigrationReport, StateStore, StoreError};
