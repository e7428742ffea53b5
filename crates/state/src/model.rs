use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use worldhost_common::{EntityId, Position};

/// Fixed number of inventory slots per owner.
pub const INVENTORY_CAPACITY: u32 = 36;

/// Entity kind tag reserved for the record mirroring an online player.
pub const PLAYER_KIND: &str = "player";

/// Default weather for a freshly created world.
pub const DEFAULT_WEATHER: &str = "clear";

/// A simulated world. Worlds are created on first reference and never
/// deleted while the server runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct World {
    pub name: String,
    #[serde(default)]
    pub seed: i64,
    /// Monotonically increasing time counter, advanced once per tick.
    #[serde(default)]
    pub time: u64,
    #[serde(default = "default_weather")]
    pub weather: String,
    /// Free-form string metadata attached to the world.
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl World {
    pub fn new(name: impl Into<String>, seed: i64) -> Self {
        Self {
            name: name.into(),
            seed,
            time: 0,
            weather: DEFAULT_WEATHER.to_string(),
            data: BTreeMap::new(),
        }
    }
}

fn default_weather() -> String {
    DEFAULT_WEATHER.to_string()
}

/// An online player. The id is allocated fresh on every join; a rejoin under
/// the same name replaces the previous record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub id: EntityId,
    pub name: String,
    pub world: String,
    pub position: Position,
}

/// A simulated entity. Online players are mirrored by an entity of kind
/// [`PLAYER_KIND`] sharing the player's id, world, and position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub kind: String,
    pub world: String,
    pub position: Position,
}

/// A read view of an owner's inventory. Absent slots are empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    pub owner: String,
    pub capacity: u32,
    pub slots: BTreeMap<u32, String>,
}

/// Item ids that denote an empty slot. Setting one clears the slot entry
/// instead of storing a sentinel value.
pub fn is_empty_item(item_id: &str) -> bool {
    item_id.eq_ignore_ascii_case("air") || item_id.eq_ignore_ascii_case("empty")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_world_starts_at_time_zero() {
        let w = World::new("overworld", 42);
        assert_eq!(w.time, 0);
        assert_eq!(w.seed, 42);
        assert_eq!(w.weather, DEFAULT_WEATHER);
    }

    #[test]
    fn empty_item_ids() {
        assert!(is_empty_item("air"));
        assert!(is_empty_item("AIR"));
        assert!(is_empty_item("Empty"));
        assert!(!is_empty_item("iron_ingot"));
    }
}
