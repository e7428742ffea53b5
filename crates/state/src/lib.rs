//! World state registry: the single source of truth for simulated world contents.
//!
//! # Invariants
//! - World and player names are case-insensitive unique keys.
//! - Every online player has exactly one mirrored entity of kind `"player"`.
//! - Per-world entity counters always equal the number of entity records in
//!   that world.
//! - Inventory entries exist only for online owners; slot indices are within
//!   `[0, INVENTORY_CAPACITY)`.

pub mod model;
pub mod registry;
pub mod snapshot;

pub use model::{Entity, Inventory, Player, World, INVENTORY_CAPACITY, PLAYER_KIND};
pub use registry::{StateError, WorldState};
pub use snapshot::WorldSnapshot;
