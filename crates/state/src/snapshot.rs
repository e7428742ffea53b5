use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::{Entity, Player, World};

/// Immutable point-in-time export of all world state.
///
/// Lists are sorted (worlds and players by lower-cased name, entities by
/// world, kind, then id) so that two snapshots of equal state compare equal
/// and serialize identically. Inventory owners are stored under their
/// canonical (lower-cased) name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldSnapshot {
    #[serde(default)]
    pub worlds: Vec<World>,
    #[serde(default)]
    pub players: Vec<Player>,
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub inventories: BTreeMap<String, BTreeMap<u32, String>>,
}

impl WorldSnapshot {
    pub fn is_empty(&self) -> bool {
        self.worlds.is_empty()
            && self.players.is_empty()
            && self.entities.is_empty()
            && self.inventories.is_empty()
    }
}
