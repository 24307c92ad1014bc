//! Change detection between consecutive snapshots.
//!
//! `detect` is pure: it reads two snapshots and returns the changes worth
//! narrating. It walks each collection once, in id order, so the output is
//! the same on every platform. Events come out grouped by kind (mood,
//! faction, scarcity, fired events, population) and by id within a kind.

use crate::config::DetectorConfig;
use crate::ids::{EntityId, FactionId, ResourceId};
use crate::narrative::{NarrativePayload, Origin};
use crate::world::{WorldEvent, WorldSnapshot};
use serde::{Deserialize, Serialize};

/// One entity's mood movement inside a mood-shift batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoodChange {
    pub entity: EntityId,
    pub name: String,
    pub before: f32,
    pub after: f32,
}

/// A change worth a narrative request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    /// Enough entities changed mood at once.
    MoodShift { changes: Vec<MoodChange> },
    /// A faction's aggregate loyalty moved past its bound.
    FactionLoyaltyShift {
        faction: FactionId,
        name: String,
        before: f32,
        after: f32,
    },
    /// A resource dropped below its floor this tick.
    ScarcityCrossed {
        resource: ResourceId,
        name: String,
        quantity: f64,
        floor: f64,
    },
    /// A discrete event fired this tick.
    EventTriggered { event: WorldEvent, subject: Option<String> },
    /// Population grew.
    PopulationChanged {
        before: usize,
        after: usize,
        arrivals: Vec<(EntityId, String)>,
    },
}

impl ChangeEvent {
    /// Short, stable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::MoodShift { .. } => "mood_shift",
            ChangeEvent::FactionLoyaltyShift { .. } => "faction_loyalty",
            ChangeEvent::ScarcityCrossed { .. } => "scarcity",
            ChangeEvent::EventTriggered { .. } => "event",
            ChangeEvent::PopulationChanged { .. } => "immigration",
        }
    }

    /// Build the minimal request payload for this change.
    ///
    /// Facts are kept coarse so recurring situations hit the cache.
    pub fn payload(&self) -> NarrativePayload {
        let payload = NarrativePayload::new(self.kind());
        match self {
            ChangeEvent::MoodShift { changes } => {
                let net: f32 = changes.iter().map(|c| c.after - c.before).sum();
                let direction = if net >= 0.0 { "brighter" } else { "darker" };
                changes
                    .iter()
                    .fold(payload, |p, c| p.with_subject(&c.name))
                    .with_fact("direction", direction)
            }
            ChangeEvent::FactionLoyaltyShift {
                name, before, after, ..
            } => {
                let direction = if after >= before { "rising" } else { "falling" };
                payload.with_subject(name).with_fact("loyalty", direction)
            }
            ChangeEvent::ScarcityCrossed { name, floor, .. } => payload
                .with_subject(name)
                .with_fact("state", "below floor")
                .with_fact("floor", floor),
            ChangeEvent::EventTriggered { event, subject } => {
                let payload = payload.with_subject(event.kind.to_string());
                match subject {
                    Some(name) => payload.with_fact("involving", name),
                    None => payload,
                }
            }
            ChangeEvent::PopulationChanged { arrivals, .. } => arrivals
                .iter()
                .fold(payload, |p, (_, name)| p.with_subject(name)),
        }
    }

    /// Where the resulting flavor text belongs.
    pub fn origin(&self, tick: u64) -> Origin {
        Origin::Change {
            tick,
            kind: self.kind().to_string(),
        }
    }
}

/// Compares snapshots using configured thresholds.
#[derive(Debug, Clone, Default)]
pub struct ChangeDetector {
    config: DetectorConfig,
}

impl ChangeDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Every change between `prev` and `curr` that warrants narration.
    pub fn detect(&self, prev: &WorldSnapshot, curr: &WorldSnapshot) -> Vec<ChangeEvent> {
        let mut events = Vec::new();

        let changes: Vec<MoodChange> = curr
            .entities
            .values()
            .filter_map(|now| {
                let before = prev.entities.get(&now.id)?;
                ((now.mood - before.mood).abs() > self.config.mood_delta).then(|| MoodChange {
                    entity: now.id,
                    name: now.name.clone(),
                    before: before.mood,
                    after: now.mood,
                })
            })
            .collect();
        if changes.len() >= self.config.min_mood_entities {
            events.push(ChangeEvent::MoodShift { changes });
        }

        for faction in curr.factions.values() {
            if let Some(before) = prev.factions.get(&faction.id) {
                if (faction.loyalty - before.loyalty).abs() > self.config.loyalty_delta {
                    events.push(ChangeEvent::FactionLoyaltyShift {
                        faction: faction.id,
                        name: faction.name.clone(),
                        before: before.loyalty,
                        after: faction.loyalty,
                    });
                }
            }
        }

        for resource in curr.resources.values() {
            if let Some(before) = prev.resources.get(&resource.id) {
                if before.quantity >= resource.floor && resource.quantity < resource.floor {
                    events.push(ChangeEvent::ScarcityCrossed {
                        resource: resource.id,
                        name: resource.name.clone(),
                        quantity: resource.quantity,
                        floor: resource.floor,
                    });
                }
            }
        }

        for event in &curr.fired_events {
            let subject = event
                .subject
                .and_then(|id| curr.entities.get(&id))
                .map(|e| e.name.clone());
            events.push(ChangeEvent::EventTriggered {
                event: event.clone(),
                subject,
            });
        }

        if curr.population() > prev.population() {
            let arrivals = curr
                .entities
                .values()
                .filter(|e| !prev.entities.contains_key(&e.id))
                .map(|e| (e.id, e.name.clone()))
                .collect();
            events.push(ChangeEvent::PopulationChanged {
                before: prev.population(),
                after: curr.population(),
                arrivals,
            });
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::{EventKind, WorldState};

    fn ten_villagers() -> WorldState {
        let mut world = WorldState::default();
        for i in 0..10 {
            world.add_entity(format!("v{i}"), i, i, None);
        }
        world
    }

    fn shift_moods(world: &mut WorldState, count: usize, delta: f32) -> Vec<EntityId> {
        let ids: Vec<EntityId> = world.entities.keys().copied().take(count).collect();
        for id in &ids {
            world.entities.get_mut(id).unwrap().mood += delta;
        }
        ids
    }

    #[test]
    fn test_three_of_ten_mood_changes_make_one_event() {
        let detector = ChangeDetector::default();
        let mut world = ten_villagers();
        let prev = world.snapshot();
        let changed = shift_moods(&mut world, 3, 0.5);
        let events = detector.detect(&prev, &world.snapshot());

        assert_eq!(events.len(), 1);
        match &events[0] {
            ChangeEvent::MoodShift { changes } => {
                let ids: Vec<EntityId> = changes.iter().map(|c| c.entity).collect();
                assert_eq!(ids, changed);
            }
            other => panic!("expected mood shift, got {other:?}"),
        }
    }

    #[test]
    fn test_two_mood_changes_make_no_event() {
        let detector = ChangeDetector::default();
        let mut world = ten_villagers();
        let prev = world.snapshot();
        shift_moods(&mut world, 2, 0.5);
        assert!(detector.detect(&prev, &world.snapshot()).is_empty());
    }

    #[test]
    fn test_small_mood_changes_ignored() {
        let detector = ChangeDetector::default();
        let mut world = ten_villagers();
        let prev = world.snapshot();
        shift_moods(&mut world, 10, 0.1);
        assert!(detector.detect(&prev, &world.snapshot()).is_empty());
    }

    #[test]
    fn test_scarcity_only_on_crossing() {
        let detector = ChangeDetector::default();
        let mut world = WorldState::default();
        let rid = world.add_resource("grain", 101.0, 100.0, 0.0, 0.0);
        let prev = world.snapshot();
        world.resources.get_mut(&rid).unwrap().quantity = 99.0;
        let events = detector.detect(&prev, &world.snapshot());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "scarcity");

        // Already below: no new event.
        let prev = world.snapshot();
        world.resources.get_mut(&rid).unwrap().quantity = 90.0;
        assert!(detector.detect(&prev, &world.snapshot()).is_empty());
    }

    #[test]
    fn test_faction_event() {
        let detector = ChangeDetector::default();
        let mut world = WorldState::default();
        let fid = world.add_faction("Wardens");
        let prev = world.snapshot();
        world.factions.get_mut(&fid).unwrap().loyalty = 0.8;
        let events = detector.detect(&prev, &world.snapshot());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload().facts["loyalty"], "rising");
    }

    #[test]
    fn test_fired_events_and_immigration() {
        let detector = ChangeDetector::default();
        let mut world = ten_villagers();
        let prev = world.snapshot();
        world.fired_events.push(WorldEvent {
            kind: EventKind::Storm,
            subject: None,
        });
        let newcomer = world.add_entity("Mira", 1, 1, None);
        let events = detector.detect(&prev, &world.snapshot());
        let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["event", "immigration"]);
        match &events[1] {
            ChangeEvent::PopulationChanged {
                before,
                after,
                arrivals,
            } => {
                assert_eq!((*before, *after), (10, 11));
                assert_eq!(arrivals, &vec![(newcomer, "Mira".to_string())]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_payload_carries_only_implicated_entities() {
        let detector = ChangeDetector::default();
        let mut world = ten_villagers();
        let prev = world.snapshot();
        shift_moods(&mut world, 4, -0.6);
        let events = detector.detect(&prev, &world.snapshot());
        let payload = events[0].payload();
        assert_eq!(payload.subjects, vec!["v0", "v1", "v2", "v3"]);
        assert_eq!(payload.facts["direction"], "darker");
    }
}
