//! The authoritative world state.
//!
//! `WorldState` is the single owner of every entity, faction and resource.
//! It lives inside the tick scheduler and is passed by reference into each
//! update step. All collections are `BTreeMap`s so iteration is always in
//! identifier order.
//!
//! Flavor text (the chronicle) is stored alongside but is never part of a
//! `WorldSnapshot` and never feeds back into simulation state.

mod input;
mod invariants;
mod rules;

pub use input::{Command, PlayerInput};
pub use invariants::{validate_and_repair, InvariantViolation, Severity, ViolationKind};
pub use rules::{run_updates, DefaultRules, StepEnv, WorldRules};

use crate::hashing::content_hash;
use crate::ids::{EntityId, FactionId, IdAllocator, ResourceId};
use crate::narrative::Origin;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Playable area. Positions are valid in `0..width` x `0..height`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub width: i32,
    pub height: i32,
}

impl Bounds {
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && x < self.width && y < self.height
    }

    pub fn clamp(&self, x: i32, y: i32) -> (i32, i32) {
        (x.clamp(0, self.width - 1), y.clamp(0, self.height - 1))
    }
}

impl Default for Bounds {
    fn default() -> Self {
        Self {
            width: 64,
            height: 64,
        }
    }
}

/// A simulated inhabitant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    pub x: i32,
    pub y: i32,
    /// Where the entity is walking to, if anywhere.
    pub target: Option<(i32, i32)>,
    /// Current mood in `[-1, 1]`.
    pub mood: f32,
    /// Mood the entity relaxes towards.
    pub baseline_mood: f32,
    pub faction: Option<FactionId>,
}

/// A group whose loyalty is an aggregate of its members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Faction {
    pub id: FactionId,
    pub name: String,
    /// Aggregate loyalty in `[0, 1]`.
    pub loyalty: f32,
}

/// A monitored quantity with a scarcity floor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub name: String,
    pub quantity: f64,
    pub floor: f64,
    pub consumption_per_head: f64,
    pub regrowth: f64,
}

/// Kinds of discrete world events.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Festival,
    Storm,
    Raid,
    Discovery,
    Custom(String),
}

impl EventKind {
    /// Parse an event name as typed by a player.
    pub fn from_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "festival" => EventKind::Festival,
            "storm" => EventKind::Storm,
            "raid" => EventKind::Raid,
            "discovery" => EventKind::Discovery,
            other => EventKind::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Festival => write!(f, "festival"),
            EventKind::Storm => write!(f, "storm"),
            EventKind::Raid => write!(f, "raid"),
            EventKind::Discovery => write!(f, "discovery"),
            EventKind::Custom(name) => write!(f, "{name}"),
        }
    }
}

/// A discrete event fired during a tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldEvent {
    pub kind: EventKind,
    pub subject: Option<EntityId>,
}

/// Where a piece of flavor text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlavorSource {
    Provider,
    Cache,
    Fallback,
    Player,
}

impl fmt::Display for FlavorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlavorSource::Provider => "provider",
            FlavorSource::Cache => "cache",
            FlavorSource::Fallback => "fallback",
            FlavorSource::Player => "player",
        };
        f.pad(name)
    }
}

/// Non-authoritative narrative attached to the world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlavorEntry {
    /// Tick the text was applied on.
    pub tick: u64,
    pub origin: Origin,
    pub text: String,
    pub source: FlavorSource,
}

/// The complete mutable world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldState {
    pub tick: u64,
    pub bounds: Bounds,
    pub entities: BTreeMap<EntityId, Entity>,
    pub factions: BTreeMap<FactionId, Faction>,
    pub resources: BTreeMap<ResourceId, Resource>,
    /// Events fired during the current tick; cleared when a tick starts.
    pub fired_events: Vec<WorldEvent>,
    ids: IdAllocator,

    /// Narrative log. Never hashed, never read by the simulation.
    #[serde(default)]
    pub chronicle: Vec<FlavorEntry>,
}

impl Default for WorldState {
    fn default() -> Self {
        Self::new(Bounds::default())
    }
}

impl WorldState {
    /// An empty world.
    pub fn new(bounds: Bounds) -> Self {
        Self {
            tick: 0,
            bounds,
            entities: BTreeMap::new(),
            factions: BTreeMap::new(),
            resources: BTreeMap::new(),
            fired_events: Vec::new(),
            ids: IdAllocator::default(),
            chronicle: Vec::new(),
        }
    }

    /// A small settlement used by the headless runner and tests.
    ///
    /// Ten villagers split between two factions, plus grain and timber.
    pub fn village() -> Self {
        let mut world = Self::new(Bounds::default());
        let wardens = world.add_faction("Wardens");
        let weavers = world.add_faction("Weavers");
        let names = [
            "Ansel", "Brisa", "Corin", "Dalia", "Edric", "Fenna", "Garrow", "Hale", "Ivo", "Juna",
        ];
        for (i, name) in names.iter().enumerate() {
            let faction = if i % 2 == 0 { wardens } else { weavers };
            let i = i as i32;
            let id = world.add_entity(*name, (i * 5) % 64, (i * 7) % 64, Some(faction));
            if let Some(entity) = world.entities.get_mut(&id) {
                entity.baseline_mood = ((i % 5) as f32 - 2.0) * 0.1;
                entity.mood = entity.baseline_mood;
            }
        }
        world.add_resource("grain", 400.0, 100.0, 0.02, 0.15);
        world.add_resource("timber", 250.0, 60.0, 0.01, 0.05);
        world.recompute_loyalty();
        world
    }

    /// Add an entity at `(x, y)` and return its id.
    pub fn add_entity(
        &mut self,
        name: impl Into<String>,
        x: i32,
        y: i32,
        faction: Option<FactionId>,
    ) -> EntityId {
        let id = EntityId::new(self.ids.allocate());
        let (x, y) = self.bounds.clamp(x, y);
        self.entities.insert(
            id,
            Entity {
                id,
                name: name.into(),
                x,
                y,
                target: None,
                mood: 0.0,
                baseline_mood: 0.0,
                faction,
            },
        );
        id
    }

    /// Add a faction and return its id.
    pub fn add_faction(&mut self, name: impl Into<String>) -> FactionId {
        let id = FactionId::new(self.ids.allocate());
        self.factions.insert(
            id,
            Faction {
                id,
                name: name.into(),
                loyalty: 0.5,
            },
        );
        id
    }

    /// Add a monitored resource and return its id.
    pub fn add_resource(
        &mut self,
        name: impl Into<String>,
        quantity: f64,
        floor: f64,
        consumption_per_head: f64,
        regrowth: f64,
    ) -> ResourceId {
        let id = ResourceId::new(self.ids.allocate());
        self.resources.insert(
            id,
            Resource {
                id,
                name: name.into(),
                quantity,
                floor,
                consumption_per_head,
                regrowth,
            },
        );
        id
    }

    pub fn population(&self) -> usize {
        self.entities.len()
    }

    /// Set each faction's loyalty to the mean member mood mapped to `[0, 1]`.
    ///
    /// Factions without members keep their current loyalty.
    pub fn recompute_loyalty(&mut self) {
        let mut sums: BTreeMap<FactionId, (f32, u32)> = BTreeMap::new();
        for entity in self.entities.values() {
            if let Some(faction) = entity.faction {
                let slot = sums.entry(faction).or_insert((0.0, 0));
                slot.0 += (entity.mood + 1.0) / 2.0;
                slot.1 += 1;
            }
        }
        for (id, faction) in self.factions.iter_mut() {
            if let Some((sum, count)) = sums.get(id) {
                faction.loyalty = sum / *count as f32;
            }
        }
    }

    /// Immutable copy of the authoritative state.
    pub fn snapshot(&self) -> WorldSnapshot {
        WorldSnapshot {
            tick: self.tick,
            bounds: self.bounds,
            entities: self.entities.clone(),
            factions: self.factions.clone(),
            resources: self.resources.clone(),
            fired_events: self.fired_events.clone(),
            next_id: self.ids.peek(),
        }
    }

    /// Append flavor text, dropping the oldest entries past `limit`.
    pub fn add_flavor(&mut self, entry: FlavorEntry, limit: usize) {
        self.chronicle.push(entry);
        if self.chronicle.len() > limit {
            let excess = self.chronicle.len() - limit;
            self.chronicle.drain(..excess);
        }
    }
}

/// Immutable copy of the authoritative world at one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub tick: u64,
    pub bounds: Bounds,
    pub entities: BTreeMap<EntityId, Entity>,
    pub factions: BTreeMap<FactionId, Faction>,
    pub resources: BTreeMap<ResourceId, Resource>,
    pub fired_events: Vec<WorldEvent>,
    pub next_id: u64,
}

impl WorldSnapshot {
    pub fn population(&self) -> usize {
        self.entities.len()
    }

    /// SHA-256 over the canonical encoding.
    pub fn content_hash(&self) -> String {
        // Plain structs, BTreeMaps and finite floats cannot fail to encode;
        // a NaN would, and invariant repair removes those before hashing.
        content_hash(self).unwrap_or_else(|e| format!("unhashable: {e}"))
    }

    /// Canonical byte encoding, used to compare runs.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_village_layout() {
        let world = WorldState::village();
        assert_eq!(world.population(), 10);
        assert_eq!(world.factions.len(), 2);
        assert_eq!(world.resources.len(), 2);
        for entity in world.entities.values() {
            assert!(world.bounds.contains(entity.x, entity.y));
        }
    }

    #[test]
    fn test_village_is_reproducible() {
        let world = WorldState::village();
        assert_eq!(world, WorldState::village());
        let names: Vec<&str> = world.entities.values().map(|e| e.name.as_str()).collect();
        assert_eq!(names.first(), Some(&"Ansel"));
        assert_eq!(names.last(), Some(&"Juna"));
        assert_eq!(world.entities.keys().next(), Some(&EntityId::new(2)));
    }

    #[test]
    fn test_ids_are_sequential_across_kinds() {
        let mut world = WorldState::default();
        let f = world.add_faction("A");
        let e = world.add_entity("x", 1, 1, Some(f));
        let r = world.add_resource("water", 1.0, 0.0, 0.0, 0.0);
        assert_eq!(f.raw(), 0);
        assert_eq!(e.raw(), 1);
        assert_eq!(r.raw(), 2);
    }

    #[test]
    fn test_snapshot_hash_ignores_chronicle() {
        let mut world = WorldState::village();
        let before = world.snapshot().content_hash();
        world.add_flavor(
            FlavorEntry {
                tick: 0,
                origin: Origin::Interactive {
                    label: "test".into(),
                },
                text: "A quiet morning.".into(),
                source: FlavorSource::Provider,
            },
            10,
        );
        assert_eq!(world.snapshot().content_hash(), before);
    }

    #[test]
    fn test_snapshot_hash_tracks_state() {
        let mut world = WorldState::village();
        let before = world.snapshot().content_hash();
        if let Some(entity) = world.entities.values_mut().next() {
            entity.mood += 0.5;
        }
        assert_ne!(world.snapshot().content_hash(), before);
    }

    #[test]
    fn test_flavor_is_bounded() {
        let mut world = WorldState::default();
        for tick in 0..5 {
            world.add_flavor(
                FlavorEntry {
                    tick,
                    origin: Origin::Interactive { label: "t".into() },
                    text: format!("entry {tick}"),
                    source: FlavorSource::Fallback,
                },
                3,
            );
        }
        assert_eq!(world.chronicle.len(), 3);
        assert_eq!(world.chronicle[0].tick, 2);
    }

    #[test]
    fn test_loyalty_tracks_mood() {
        let mut world = WorldState::default();
        let f = world.add_faction("A");
        let a = world.add_entity("a", 0, 0, Some(f));
        let b = world.add_entity("b", 0, 0, Some(f));
        world.entities.get_mut(&a).unwrap().mood = 1.0;
        world.entities.get_mut(&b).unwrap().mood = 0.0;
        world.recompute_loyalty();
        assert!((world.factions[&f].loyalty - 0.75).abs() < 1e-6);
    }
}
