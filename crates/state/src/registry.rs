use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use worldhost_common::{EntityId, Position};

use crate::model::{
    is_empty_item, Entity, Inventory, Player, World, DEFAULT_WEATHER, INVENTORY_CAPACITY,
    PLAYER_KIND,
};
use crate::snapshot::WorldSnapshot;

/// Raised only for ill-formed input (blank identifiers). Well-formed input
/// that has no effect is reported through `bool`/`Option` results instead.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("{0} must not be blank")]
    Blank(&'static str),
}

/// Concurrent registry of worlds, players, entities, and per-owner
/// inventories.
///
/// All maps live behind a single mutex; read views are sorted lazily and
/// cached until the next relevant mutation. Per-world entity views are
/// invalidated only for the worlds a mutation touched, so heavy churn in one
/// world does not evict views of the others.
pub struct WorldState {
    inner: Mutex<StateInner>,
}

#[derive(Default)]
struct StateInner {
    /// Canonical (lower-cased, trimmed) name -> world record.
    worlds: HashMap<String, World>,
    /// Canonical name -> player record.
    players: HashMap<String, Player>,
    entities: HashMap<EntityId, Entity>,
    /// Canonical owner name -> sparse slot map. Present only while online.
    inventories: HashMap<String, BTreeMap<u32, String>>,
    /// Canonical world name -> number of entity records in that world.
    world_entity_counts: HashMap<String, usize>,

    worlds_cache: Option<Arc<Vec<World>>>,
    players_cache: Option<Arc<Vec<Player>>>,
    entities_cache: Option<Arc<Vec<Entity>>>,
    entities_by_world: HashMap<String, Arc<Vec<Entity>>>,
}

fn canonical(value: &str) -> String {
    value.trim().to_lowercase()
}

fn required(value: &str, field: &'static str) -> Result<String, StateError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(StateError::Blank(field));
    }
    Ok(trimmed.to_string())
}

fn cmp_ci(a: &str, b: &str) -> Ordering {
    a.to_lowercase().cmp(&b.to_lowercase())
}

fn cmp_entities(a: &Entity, b: &Entity) -> Ordering {
    cmp_ci(&a.world, &b.world)
        .then_with(|| cmp_ci(&a.kind, &b.kind))
        .then_with(|| a.id.cmp(&b.id))
}

fn cmp_entities_in_world(a: &Entity, b: &Entity) -> Ordering {
    cmp_ci(&a.kind, &b.kind).then_with(|| a.id.cmp(&b.id))
}

impl WorldState {
    /// Create a registry containing only the given default world.
    pub fn new(default_world: &str) -> Self {
        let state = Self {
            inner: Mutex::new(StateInner::default()),
        };
        {
            let mut inner = state.lock();
            let name = if default_world.trim().is_empty() {
                "world"
            } else {
                default_world
            };
            create_world_locked(&mut inner, name, 0);
        }
        state
    }

    fn lock(&self) -> MutexGuard<'_, StateInner> {
        // A poisoned lock means a panic mid-mutation elsewhere; the maps are
        // still structurally valid, so recover rather than cascade.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // --- worlds ---

    /// Idempotent: returns the existing record when the name is already taken
    /// (case-insensitively), otherwise creates the world at time 0.
    pub fn create_world(&self, name: &str, seed: i64) -> Result<World, StateError> {
        let name = required(name, "world")?;
        let mut inner = self.lock();
        let (world, created) = create_world_locked(&mut inner, &name, seed);
        if created {
            tracing::info!(world = %world.name, seed, "world created");
        }
        Ok(world)
    }

    pub fn has_world(&self, name: &str) -> bool {
        let key = canonical(name);
        if key.is_empty() {
            return false;
        }
        self.lock().worlds.contains_key(&key)
    }

    pub fn world_count(&self) -> usize {
        self.lock().worlds.len()
    }

    pub fn world_time(&self, name: &str) -> Option<u64> {
        let key = canonical(name);
        self.lock().worlds.get(&key).map(|w| w.time)
    }

    pub fn set_world_time(&self, name: &str, time: u64) -> bool {
        let key = canonical(name);
        let mut inner = self.lock();
        match inner.worlds.get_mut(&key) {
            Some(world) => {
                world.time = time;
                inner.worlds_cache = None;
                true
            }
            None => false,
        }
    }

    pub fn world_weather(&self, name: &str) -> Option<String> {
        let key = canonical(name);
        self.lock().worlds.get(&key).map(|w| w.weather.clone())
    }

    pub fn set_world_weather(&self, name: &str, weather: &str) -> bool {
        let value = weather.trim();
        if value.is_empty() {
            return false;
        }
        let key = canonical(name);
        let mut inner = self.lock();
        match inner.worlds.get_mut(&key) {
            Some(world) => {
                world.weather = value.to_string();
                inner.worlds_cache = None;
                true
            }
            None => false,
        }
    }

    pub fn world_data(&self, name: &str) -> Option<BTreeMap<String, String>> {
        let key = canonical(name);
        self.lock().worlds.get(&key).map(|w| w.data.clone())
    }

    /// Replace a world's metadata map. Keys and values are trimmed; empty
    /// pairs are discarded. Returns the stored map, or `None` for an unknown
    /// world.
    pub fn set_world_data(
        &self,
        name: &str,
        data: &BTreeMap<String, String>,
    ) -> Option<BTreeMap<String, String>> {
        let key = canonical(name);
        let mut inner = self.lock();
        let world = inner.worlds.get_mut(&key)?;
        world.data = sanitize_string_map(data);
        let stored = world.data.clone();
        inner.worlds_cache = None;
        Some(stored)
    }

    /// Advance every world's time counter by one tick.
    pub fn tick_worlds(&self) {
        let mut inner = self.lock();
        for world in inner.worlds.values_mut() {
            world.time += 1;
        }
        inner.worlds_cache = None;
    }

    // --- players ---

    /// Bring a player online. The target world is created on demand; a fresh
    /// identity is allocated for this join, and any previous record under the
    /// same name (case-insensitively) is replaced along with its mirrored
    /// entity. An empty inventory is initialized if the owner has none.
    pub fn join_player(
        &self,
        name: &str,
        world: &str,
        position: Position,
    ) -> Result<Player, StateError> {
        let name = required(name, "name")?;
        let world = required(world, "world")?;
        let mut inner = self.lock();
        let (world, _) = create_world_locked(&mut inner, &world, 0);
        let key = canonical(&name);
        if let Some(previous) = inner.players.remove(&key) {
            remove_entity_record_locked(&mut inner, previous.id);
        }
        let player = Player {
            id: EntityId::new(),
            name,
            world: world.name.clone(),
            position,
        };
        inner.players.insert(key.clone(), player.clone());
        inner.players_cache = None;
        inner.inventories.entry(key).or_default();
        insert_entity_record_locked(
            &mut inner,
            Entity {
                id: player.id,
                kind: PLAYER_KIND.to_string(),
                world: player.world.clone(),
                position,
            },
        );
        tracing::info!(player = %player.name, world = %player.world, "player joined");
        Ok(player)
    }

    /// Take a player offline. Removes the record, its mirrored entity, and
    /// its inventory. Returns `None` if no such player is online.
    pub fn leave_player(&self, name: &str) -> Option<Player> {
        let key = canonical(name);
        if key.is_empty() {
            return None;
        }
        let mut inner = self.lock();
        let player = inner.players.remove(&key)?;
        inner.players_cache = None;
        inner.inventories.remove(&key);
        remove_entity_record_locked(&mut inner, player.id);
        tracing::info!(player = %player.name, "player left");
        Some(player)
    }

    pub fn find_player(&self, name: &str) -> Option<Player> {
        let key = canonical(name);
        self.lock().players.get(&key).cloned()
    }

    pub fn online_player_count(&self) -> usize {
        self.lock().players.len()
    }

    /// Move an online player, optionally across worlds (the target world is
    /// created on demand). The mirrored entity and the per-world entity
    /// counters are updated in the same step. Returns `None` if the player is
    /// not online.
    pub fn move_player(
        &self,
        name: &str,
        position: Position,
        world: Option<&str>,
    ) -> Option<Player> {
        let key = canonical(name);
        if key.is_empty() {
            return None;
        }
        let mut inner = self.lock();
        if !inner.players.contains_key(&key) {
            return None;
        }
        let next_world = match world {
            Some(w) if !w.trim().is_empty() => create_world_locked(&mut inner, w, 0).0.name,
            _ => inner.players[&key].world.clone(),
        };
        let player = inner.players.get_mut(&key)?;
        player.world = next_world.clone();
        player.position = position;
        let moved = player.clone();
        inner.players_cache = None;
        match inner.entities.get(&moved.id).cloned() {
            Some(previous) => {
                let previous_key = canonical(&previous.world);
                let next_key = canonical(&next_world);
                if previous_key != next_key {
                    decrement_world_count_locked(&mut inner, &previous_key);
                    increment_world_count_locked(&mut inner, &next_key);
                    inner.entities_by_world.remove(&previous_key);
                }
                inner.entities_by_world.remove(&next_key);
                if let Some(entity) = inner.entities.get_mut(&moved.id) {
                    entity.world = next_world;
                    entity.position = position;
                }
                inner.entities_cache = None;
            }
            None => {
                // Mirror got lost somehow; re-establish the invariant.
                insert_entity_record_locked(
                    &mut inner,
                    Entity {
                        id: moved.id,
                        kind: PLAYER_KIND.to_string(),
                        world: next_world,
                        position,
                    },
                );
            }
        }
        Some(moved)
    }

    // --- entities ---

    /// Spawn an entity with a fresh identity. The world is created on demand.
    pub fn spawn_entity(
        &self,
        kind: &str,
        world: &str,
        position: Position,
    ) -> Result<Entity, StateError> {
        let kind = required(kind, "kind")?;
        let world = required(world, "world")?;
        let mut inner = self.lock();
        let (world, _) = create_world_locked(&mut inner, &world, 0);
        let entity = Entity {
            id: EntityId::new(),
            kind,
            world: world.name,
            position,
        };
        insert_entity_record_locked(&mut inner, entity.clone());
        tracing::debug!(entity = %entity.id, kind = %entity.kind, world = %entity.world, "entity spawned");
        Ok(entity)
    }

    pub fn find_entity(&self, id: EntityId) -> Option<Entity> {
        self.lock().entities.get(&id).cloned()
    }

    /// Despawn an entity. Removing a player-kind entity also takes the
    /// corresponding player offline.
    pub fn remove_entity(&self, id: EntityId) -> Option<Entity> {
        let mut inner = self.lock();
        let removed = remove_entity_record_locked(&mut inner, id)?;
        if removed.kind.eq_ignore_ascii_case(PLAYER_KIND) {
            let owner = inner
                .players
                .iter()
                .find(|(_, p)| p.id == id)
                .map(|(key, _)| key.clone());
            if let Some(key) = owner {
                inner.players.remove(&key);
                inner.inventories.remove(&key);
                inner.players_cache = None;
            }
        }
        Some(removed)
    }

    pub fn entity_count(&self) -> usize {
        self.lock().entities.len()
    }

    pub fn entity_count_in(&self, world: &str) -> usize {
        let key = canonical(world);
        self.lock()
            .world_entity_counts
            .get(&key)
            .copied()
            .unwrap_or(0)
    }

    // --- inventories ---

    pub fn inventory(&self, owner: &str) -> Option<Inventory> {
        let key = canonical(owner);
        let inner = self.lock();
        let slots = inner.inventories.get(&key)?;
        let display = inner
            .players
            .get(&key)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| owner.trim().to_string());
        Some(Inventory {
            owner: display,
            capacity: INVENTORY_CAPACITY,
            slots: slots.clone(),
        })
    }

    pub fn inventory_item(&self, owner: &str, slot: u32) -> Option<String> {
        if slot >= INVENTORY_CAPACITY {
            return None;
        }
        let key = canonical(owner);
        self.lock()
            .inventories
            .get(&key)
            .and_then(|slots| slots.get(&slot).cloned())
    }

    /// Set an inventory slot. Fails (returns `false`) when the owner is not
    /// online, the slot is out of range, or the item id is blank. An item id
    /// denoting "empty" clears the slot entry.
    pub fn set_inventory_item(&self, owner: &str, slot: u32, item_id: &str) -> bool {
        if slot >= INVENTORY_CAPACITY {
            return false;
        }
        let item = item_id.trim();
        if item.is_empty() {
            return false;
        }
        let key = canonical(owner);
        let mut inner = self.lock();
        if !inner.players.contains_key(&key) {
            return false;
        }
        let slots = inner.inventories.entry(key).or_default();
        if is_empty_item(item) {
            slots.remove(&slot);
        } else {
            slots.insert(slot, item.to_string());
        }
        true
    }

    // --- read views ---

    /// All worlds, sorted by lower-cased name. Cached until a world mutation.
    pub fn worlds(&self) -> Arc<Vec<World>> {
        let mut inner = self.lock();
        if let Some(cache) = &inner.worlds_cache {
            return Arc::clone(cache);
        }
        let mut list: Vec<World> = inner.worlds.values().cloned().collect();
        list.sort_by(|a, b| cmp_ci(&a.name, &b.name));
        let cache = Arc::new(list);
        inner.worlds_cache = Some(Arc::clone(&cache));
        cache
    }

    /// All online players, sorted by lower-cased name.
    pub fn players(&self) -> Arc<Vec<Player>> {
        let mut inner = self.lock();
        if let Some(cache) = &inner.players_cache {
            return Arc::clone(cache);
        }
        let mut list: Vec<Player> = inner.players.values().cloned().collect();
        list.sort_by(|a, b| cmp_ci(&a.name, &b.name));
        let cache = Arc::new(list);
        inner.players_cache = Some(Arc::clone(&cache));
        cache
    }

    /// Entities, optionally restricted to one world. Sorted by world, kind,
    /// then id; the per-world views are cached independently.
    pub fn entities(&self, world: Option<&str>) -> Arc<Vec<Entity>> {
        let mut inner = self.lock();
        match world {
            None => {
                if let Some(cache) = &inner.entities_cache {
                    return Arc::clone(cache);
                }
                let mut list: Vec<Entity> = inner.entities.values().cloned().collect();
                list.sort_by(cmp_entities);
                let cache = Arc::new(list);
                inner.entities_cache = Some(Arc::clone(&cache));
                cache
            }
            Some(world) => {
                let key = canonical(world);
                if let Some(cache) = inner.entities_by_world.get(&key) {
                    return Arc::clone(cache);
                }
                let mut list: Vec<Entity> = inner
                    .entities
                    .values()
                    .filter(|e| canonical(&e.world) == key)
                    .cloned()
                    .collect();
                list.sort_by(cmp_entities_in_world);
                let cache = Arc::new(list);
                inner.entities_by_world.insert(key, Arc::clone(&cache));
                cache
            }
        }
    }

    // --- snapshot / restore ---

    /// Export the full state as a sorted, deterministic snapshot.
    pub fn snapshot(&self) -> WorldSnapshot {
        let inner = self.lock();
        let mut worlds: Vec<World> = inner.worlds.values().cloned().collect();
        worlds.sort_by(|a, b| cmp_ci(&a.name, &b.name));
        let mut players: Vec<Player> = inner.players.values().cloned().collect();
        players.sort_by(|a, b| cmp_ci(&a.name, &b.name));
        let mut entities: Vec<Entity> = inner.entities.values().cloned().collect();
        entities.sort_by(cmp_entities);
        let inventories = inner
            .inventories
            .iter()
            .map(|(owner, slots)| (owner.clone(), slots.clone()))
            .collect();
        WorldSnapshot {
            worlds,
            players,
            entities,
            inventories,
        }
    }

    /// Replace the full state from a snapshot, sanitizing as it goes: blank
    /// names are dropped, duplicate keys keep the first occurrence, player
    /// mirror entities are re-established, inventories of offline owners and
    /// out-of-range slots are discarded, and per-world counters are rebuilt.
    /// At least one world is always left present.
    pub fn restore(&self, snapshot: &WorldSnapshot) {
        let mut inner = self.lock();
        inner.worlds.clear();
        inner.players.clear();
        inner.entities.clear();
        inner.inventories.clear();
        inner.world_entity_counts.clear();

        for world in &snapshot.worlds {
            let name = world.name.trim();
            if name.is_empty() {
                continue;
            }
            let key = canonical(name);
            if inner.worlds.contains_key(&key) {
                continue;
            }
            let weather = world.weather.trim();
            inner.worlds.insert(
                key,
                World {
                    name: name.to_string(),
                    seed: world.seed,
                    time: world.time,
                    weather: if weather.is_empty() {
                        DEFAULT_WEATHER.to_string()
                    } else {
                        weather.to_string()
                    },
                    data: sanitize_string_map(&world.data),
                },
            );
        }

        for player in &snapshot.players {
            let name = player.name.trim();
            if name.is_empty() {
                continue;
            }
            let key = canonical(name);
            if inner.players.contains_key(&key) {
                continue;
            }
            let (world, _) = create_world_locked(&mut inner, &player.world, 0);
            inner.players.insert(
                key,
                Player {
                    id: player.id,
                    name: name.to_string(),
                    world: world.name,
                    position: player.position,
                },
            );
        }

        for entity in &snapshot.entities {
            let kind = entity.kind.trim();
            if kind.is_empty() || inner.entities.contains_key(&entity.id) {
                continue;
            }
            let (world, _) = create_world_locked(&mut inner, &entity.world, 0);
            inner.entities.insert(
                entity.id,
                Entity {
                    id: entity.id,
                    kind: kind.to_string(),
                    world: world.name,
                    position: entity.position,
                },
            );
        }

        // Mirror entities are authoritative from the player records.
        let players: Vec<Player> = inner.players.values().cloned().collect();
        for player in players {
            inner.entities.insert(
                player.id,
                Entity {
                    id: player.id,
                    kind: PLAYER_KIND.to_string(),
                    world: player.world,
                    position: player.position,
                },
            );
        }

        for (owner, slots) in &snapshot.inventories {
            let key = canonical(owner);
            if key.is_empty() || !inner.players.contains_key(&key) {
                continue;
            }
            let mut sanitized = BTreeMap::new();
            for (slot, item) in slots {
                let item = item.trim();
                if *slot < INVENTORY_CAPACITY && !item.is_empty() && !is_empty_item(item) {
                    sanitized.insert(*slot, item.to_string());
                }
            }
            inner.inventories.insert(key, sanitized);
        }
        // Online players without a persisted inventory still get an empty one.
        let online: Vec<String> = inner.players.keys().cloned().collect();
        for key in online {
            inner.inventories.entry(key).or_default();
        }

        if inner.worlds.is_empty() {
            create_world_locked(&mut inner, "world", 0);
        }

        rebuild_world_counts_locked(&mut inner);
        inner.worlds_cache = None;
        inner.players_cache = None;
        inner.entities_cache = None;
        inner.entities_by_world.clear();
        tracing::info!(
            worlds = inner.worlds.len(),
            players = inner.players.len(),
            entities = inner.entities.len(),
            "state restored from snapshot"
        );
    }
}

fn sanitize_string_map(data: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    data.iter()
        .filter_map(|(k, v)| {
            let k = k.trim();
            let v = v.trim();
            if k.is_empty() || v.is_empty() {
                None
            } else {
                Some((k.to_string(), v.to_string()))
            }
        })
        .collect()
}

/// Create-or-get a world under the lock. Assumes `name` is non-blank after
/// trimming. Returns the record and whether it was newly created.
fn create_world_locked(inner: &mut StateInner, name: &str, seed: i64) -> (World, bool) {
    let trimmed = name.trim();
    let key = canonical(trimmed);
    if let Some(existing) = inner.worlds.get(&key) {
        let world = existing.clone();
        inner.world_entity_counts.entry(key).or_insert(0);
        return (world, false);
    }
    let world = World::new(trimmed, seed);
    inner.worlds.insert(key.clone(), world.clone());
    inner.world_entity_counts.insert(key, 0);
    inner.worlds_cache = None;
    (world, true)
}

fn insert_entity_record_locked(inner: &mut StateInner, entity: Entity) {
    let world_key = canonical(&entity.world);
    inner.entities.insert(entity.id, entity);
    increment_world_count_locked(inner, &world_key);
    inner.entities_cache = None;
    inner.entities_by_world.remove(&world_key);
}

fn remove_entity_record_locked(inner: &mut StateInner, id: EntityId) -> Option<Entity> {
    let removed = inner.entities.remove(&id)?;
    let world_key = canonical(&removed.world);
    decrement_world_count_locked(inner, &world_key);
    inner.entities_cache = None;
    inner.entities_by_world.remove(&world_key);
    Some(removed)
}

fn increment_world_count_locked(inner: &mut StateInner, world_key: &str) {
    *inner
        .world_entity_counts
        .entry(world_key.to_string())
        .or_insert(0) += 1;
}

fn decrement_world_count_locked(inner: &mut StateInner, world_key: &str) {
    if let Some(count) = inner.world_entity_counts.get_mut(world_key) {
        *count = count.saturating_sub(1);
    }
}

fn rebuild_world_counts_locked(inner: &mut StateInner) {
    inner.world_entity_counts.clear();
    let keys: Vec<String> = inner.worlds.keys().cloned().collect();
    for key in keys {
        inner.world_entity_counts.insert(key, 0);
    }
    let worlds: Vec<String> = inner.entities.values().map(|e| canonical(&e.world)).collect();
    for key in worlds {
        *inner.world_entity_counts.entry(key).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(x: f64, y: f64, z: f64) -> Position {
        Position::new(x, y, z)
    }

    #[test]
    fn starts_with_default_world() {
        let state = WorldState::new("world");
        assert_eq!(state.world_count(), 1);
        assert!(state.has_world("World"));
        assert_eq!(state.world_time("world"), Some(0));
    }

    #[test]
    fn create_world_is_idempotent_case_insensitive() {
        let state = WorldState::new("world");
        let first = state.create_world("Nether", 7).unwrap();
        let second = state.create_world("nether", 99).unwrap();
        assert_eq!(first.name, "Nether");
        assert_eq!(second.seed, 7); // existing record wins
        assert_eq!(state.world_count(), 2);
    }

    #[test]
    fn blank_world_name_is_rejected() {
        let state = WorldState::new("world");
        assert!(state.create_world("   ", 0).is_err());
    }

    #[test]
    fn join_creates_player_and_mirrored_entity() {
        let state = WorldState::new("world");
        let player = state.join_player("Alex", "world", pos(10.0, 70.0, 5.0)).unwrap();
        let players = state.players();
        assert_eq!(players.len(), 1);
        assert_eq!(players[0].name, "Alex");
        let entities = state.entities(Some("world"));
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].kind, PLAYER_KIND);
        assert_eq!(entities[0].id, player.id);
        assert_eq!(entities[0].position, pos(10.0, 70.0, 5.0));
        assert_eq!(state.entity_count_in("world"), 1);
    }

    #[test]
    fn rejoin_replaces_record_and_allocates_fresh_identity() {
        let state = WorldState::new("world");
        let first = state.join_player("Alex", "world", pos(0.0, 64.0, 0.0)).unwrap();
        let second = state.join_player("alex", "world", pos(1.0, 64.0, 1.0)).unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(state.online_player_count(), 1);
        assert_eq!(state.entity_count_in("world"), 1);
        assert!(state.find_entity(first.id).is_none());
        assert!(state.find_entity(second.id).is_some());
    }

    #[test]
    fn leave_removes_player_entity_and_inventory() {
        let state = WorldState::new("world");
        state.join_player("Alex", "world", pos(0.0, 64.0, 0.0)).unwrap();
        assert!(state.set_inventory_item("Alex", 0, "stone"));
        let left = state.leave_player("ALEX");
        assert!(left.is_some());
        assert_eq!(state.online_player_count(), 0);
        assert_eq!(state.entity_count(), 0);
        assert!(state.inventory("Alex").is_none());
        assert!(state.leave_player("Alex").is_none());
    }

    #[test]
    fn move_player_across_worlds_updates_counters_and_mirror() {
        let state = WorldState::new("world");
        let player = state.join_player("Alex", "world", pos(0.0, 64.0, 0.0)).unwrap();
        let moved = state
            .move_player("Alex", pos(5.0, 70.0, 5.0), Some("nether"))
            .unwrap();
        assert_eq!(moved.world, "nether");
        assert_eq!(state.entity_count_in("world"), 0);
        assert_eq!(state.entity_count_in("nether"), 1);
        let mirror = state.find_entity(player.id).unwrap();
        assert_eq!(mirror.world, "nether");
        assert_eq!(mirror.position, pos(5.0, 70.0, 5.0));
    }

    #[test]
    fn move_offline_player_is_noop() {
        let state = WorldState::new("world");
        assert!(state.move_player("Ghost", pos(0.0, 0.0, 0.0), None).is_none());
    }

    #[test]
    fn spawn_entity_creates_world_on_demand() {
        let state = WorldState::new("world");
        let sheep = state.spawn_entity("sheep", "plains", pos(1.0, 60.0, 1.0)).unwrap();
        assert!(state.has_world("plains"));
        assert_eq!(state.entity_count_in("plains"), 1);
        assert_eq!(state.find_entity(sheep.id).unwrap().kind, "sheep");
    }

    #[test]
    fn remove_player_entity_takes_player_offline() {
        let state = WorldState::new("world");
        let player = state.join_player("Alex", "world", pos(0.0, 64.0, 0.0)).unwrap();
        let removed = state.remove_entity(player.id).unwrap();
        assert_eq!(removed.kind, PLAYER_KIND);
        assert_eq!(state.online_player_count(), 0);
        assert!(state.inventory("Alex").is_none());
    }

    #[test]
    fn inventory_rules() {
        let state = WorldState::new("world");
        assert!(!state.set_inventory_item("Alex", 0, "stone")); // offline
        state.join_player("Alex", "world", pos(0.0, 64.0, 0.0)).unwrap();
        assert!(!state.set_inventory_item("Alex", INVENTORY_CAPACITY, "stone"));
        assert!(!state.set_inventory_item("Alex", 0, "  "));
        assert!(state.set_inventory_item("Alex", 0, "iron_ingot"));
        assert_eq!(state.inventory_item("alex", 0).as_deref(), Some("iron_ingot"));
        // Clearing stores no sentinel value.
        assert!(state.set_inventory_item("Alex", 0, "air"));
        let inv = state.inventory("Alex").unwrap();
        assert!(!inv.slots.contains_key(&0));
        assert_eq!(inv.capacity, INVENTORY_CAPACITY);
    }

    #[test]
    fn read_views_are_sorted_and_deterministic() {
        let state = WorldState::new("world");
        state.create_world("Zeta", 0).unwrap();
        state.create_world("alpha", 0).unwrap();
        let names: Vec<String> = state.worlds().iter().map(|w| w.name.clone()).collect();
        assert_eq!(names, vec!["alpha", "world", "Zeta"]);

        state.join_player("bob", "world", pos(0.0, 0.0, 0.0)).unwrap();
        state.join_player("Alice", "world", pos(0.0, 0.0, 0.0)).unwrap();
        let players: Vec<String> = state.players().iter().map(|p| p.name.clone()).collect();
        assert_eq!(players, vec!["Alice", "bob"]);

        state.spawn_entity("zombie", "world", pos(0.0, 0.0, 0.0)).unwrap();
        state.spawn_entity("cow", "world", pos(0.0, 0.0, 0.0)).unwrap();
        let kinds: Vec<String> = state
            .entities(Some("world"))
            .iter()
            .map(|e| e.kind.clone())
            .collect();
        assert_eq!(kinds, vec!["cow", "player", "player", "zombie"]);
    }

    #[test]
    fn per_world_cache_reused_until_that_world_changes() {
        let state = WorldState::new("world");
        state.create_world("other", 0).unwrap();
        state.spawn_entity("cow", "world", pos(0.0, 0.0, 0.0)).unwrap();
        let before = state.entities(Some("other"));
        // Mutating "world" must not evict the cached "other" view.
        state.spawn_entity("pig", "world", pos(0.0, 0.0, 0.0)).unwrap();
        let after = state.entities(Some("other"));
        assert!(Arc::ptr_eq(&before, &after));
        // Mutating "other" rebuilds it.
        state.spawn_entity("bee", "other", pos(0.0, 0.0, 0.0)).unwrap();
        let rebuilt = state.entities(Some("other"));
        assert!(!Arc::ptr_eq(&after, &rebuilt));
        assert_eq!(rebuilt.len(), 1);
    }

    #[test]
    fn tick_worlds_advances_all_time_counters() {
        let state = WorldState::new("world");
        state.create_world("nether", 0).unwrap();
        state.tick_worlds();
        state.tick_worlds();
        assert_eq!(state.world_time("world"), Some(2));
        assert_eq!(state.world_time("nether"), Some(2));
    }

    #[test]
    fn weather_and_data_updates() {
        let state = WorldState::new("world");
        assert_eq!(state.world_weather("world").as_deref(), Some("clear"));
        assert!(state.set_world_weather("world", "rain"));
        assert!(!state.set_world_weather("world", "   "));
        assert!(!state.set_world_weather("missing", "rain"));
        assert_eq!(state.world_weather("world").as_deref(), Some("rain"));

        let mut data = BTreeMap::new();
        data.insert("difficulty".to_string(), "hard".to_string());
        data.insert("  ".to_string(), "dropped".to_string());
        let stored = state.set_world_data("world", &data).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(state.world_data("world").unwrap()["difficulty"], "hard");
        assert!(state.set_world_data("missing", &data).is_none());
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let state = WorldState::new("world");
        state.create_world("Nether", 42).unwrap();
        state.join_player("Alex", "world", pos(10.0, 70.0, 5.0)).unwrap();
        state.set_inventory_item("Alex", 0, "iron_ingot");
        state.spawn_entity("sheep", "world", pos(1.0, 64.0, 1.0)).unwrap();
        state.set_world_weather("Nether", "storm");
        state.tick_worlds();

        let snapshot = state.snapshot();
        let restored = WorldState::new("world");
        restored.restore(&snapshot);

        assert_eq!(restored.snapshot(), snapshot);
        assert_eq!(restored.world_time("world"), Some(1));
        assert_eq!(restored.world_weather("nether").as_deref(), Some("storm"));
        assert_eq!(restored.inventory_item("alex", 0).as_deref(), Some("iron_ingot"));
        assert_eq!(restored.entity_count_in("world"), 2);
    }

    #[test]
    fn restore_empty_snapshot_leaves_default_world() {
        let state = WorldState::new("world");
        state.join_player("Alex", "hub", pos(0.0, 64.0, 0.0)).unwrap();
        state.restore(&WorldSnapshot::default());
        assert_eq!(state.world_count(), 1);
        assert!(state.has_world("world"));
        assert_eq!(state.online_player_count(), 0);
    }

    #[test]
    fn restore_sanitizes_bad_records() {
        let state = WorldState::new("world");
        let mut snapshot = WorldSnapshot::default();
        snapshot.worlds.push(World::new("  hub  ", 1));
        snapshot.worlds.push(World::new("   ", 2)); // dropped
        let ghost = Player {
            id: EntityId::new(),
            name: "  Alex ".to_string(),
            world: "hub".to_string(),
            position: pos(0.0, 64.0, 0.0),
        };
        snapshot.players.push(ghost.clone());
        let mut slots = BTreeMap::new();
        slots.insert(0, "iron_ingot".to_string());
        slots.insert(99, "oob".to_string()); // out of range, dropped
        slots.insert(1, "air".to_string()); // empty sentinel, dropped
        snapshot.inventories.insert("alex".to_string(), slots);
        snapshot
            .inventories
            .insert("offline_guy".to_string(), BTreeMap::new()); // dropped

        state.restore(&snapshot);
        assert!(state.has_world("hub"));
        assert_eq!(state.world_count(), 1);
        let players = state.players();
        assert_eq!(players.len(), 1);
        assert_eq!(players[0].name, "Alex");
        // Mirror entity re-established from the player record.
        assert_eq!(state.entity_count_in("hub"), 1);
        let inv = state.inventory("Alex").unwrap();
        assert_eq!(inv.slots.len(), 1);
        assert_eq!(inv.slots[&0], "iron_ingot");
        assert!(state.inventory("offline_guy").is_none());
    }

    #[test]
    fn concurrent_joins_do_not_lose_records() {
        let state = Arc::new(WorldState::new("world"));
        let mut handles = Vec::new();
        for i in 0..16 {
            let state = Arc::clone(&state);
            handles.push(std::thread::spawn(move || {
                state
                    .join_player(&format!("player{i}"), "world", pos(0.0, 64.0, 0.0))
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(state.players().len(), 16);
        assert_eq!(state.entity_count_in("world"), 16);
    }
}
