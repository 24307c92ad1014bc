//! World-update collaborators.
//!
//! The engine only fixes *when* and *in what order* these run: every entity
//! in id order, then the aggregate step. The formulas themselves belong to
//! whoever implements [`WorldRules`]; [`DefaultRules`] is a small reference
//! implementation.

use super::{Bounds, Entity, EventKind, Faction, WorldEvent, WorldState};
use crate::ids::FactionId;
use crate::rng::TickRng;
use rand::Rng;
use std::collections::BTreeMap;

/// Read-only context handed to each per-entity step.
pub struct StepEnv<'a> {
    pub tick: u64,
    pub bounds: Bounds,
    pub factions: &'a BTreeMap<FactionId, Faction>,
}

/// Deterministic per-tick update logic.
///
/// Implementations must draw randomness only from the supplied RNG.
pub trait WorldRules: Send + Sync {
    /// Advance one entity (movement, decay/growth).
    fn step_entity(&self, entity: &mut Entity, env: &StepEnv<'_>, rng: &mut TickRng);

    /// Advance world-level state and recompute aggregates.
    fn step_world(&self, world: &mut WorldState, rng: &mut TickRng);
}

/// Run every update for one tick in stable order.
pub fn run_updates(world: &mut WorldState, rules: &dyn WorldRules, rng: &mut TickRng) {
    let env = StepEnv {
        tick: world.tick,
        bounds: world.bounds,
        factions: &world.factions,
    };
    for entity in world.entities.values_mut() {
        rules.step_entity(entity, &env, rng);
    }
    rules.step_world(world, rng);
}

/// Reference rules: walking, mood relaxation, consumption and rare events.
#[derive(Debug, Clone)]
pub struct DefaultRules {
    /// Fraction of the gap to baseline mood closed each tick.
    pub mood_relaxation: f32,
    /// Maximum random mood nudge per tick.
    pub mood_noise: f32,
    /// Chance per tick that an idle entity wanders one cell.
    pub wander_chance: f64,
    /// Chance per tick of a storm or a festival.
    pub event_chance: f64,
    /// Chance per tick that a newcomer arrives.
    pub arrival_chance: f64,
}

impl Default for DefaultRules {
    fn default() -> Self {
        Self {
            mood_relaxation: 0.02,
            mood_noise: 0.01,
            wander_chance: 0.05,
            event_chance: 0.004,
            arrival_chance: 0.002,
        }
    }
}

impl DefaultRules {
    /// Rules with no random events, for tests that need a quiet world.
    pub fn quiet() -> Self {
        Self {
            event_chance: 0.0,
            arrival_chance: 0.0,
            ..Self::default()
        }
    }

    fn step_toward(from: i32, to: i32) -> i32 {
        from + (to - from).signum()
    }

    fn fire_event(&self, world: &mut WorldState, kind: EventKind, mood_delta: f32) {
        for entity in world.entities.values_mut() {
            entity.mood = (entity.mood + mood_delta).clamp(-1.0, 1.0);
        }
        world.fired_events.push(WorldEvent {
            kind,
            subject: None,
        });
    }
}

impl WorldRules for DefaultRules {
    fn step_entity(&self, entity: &mut Entity, env: &StepEnv<'_>, rng: &mut TickRng) {
        match entity.target {
            Some((tx, ty)) => {
                entity.x = Self::step_toward(entity.x, tx);
                entity.y = Self::step_toward(entity.y, ty);
                if (entity.x, entity.y) == (tx, ty) {
                    entity.target = None;
                }
            }
            None => {
                if rng.gen_bool(self.wander_chance) {
                    let dx = rng.gen_range(-1..=1);
                    let dy = rng.gen_range(-1..=1);
                    let (x, y) = env.bounds.clamp(entity.x + dx, entity.y + dy);
                    entity.x = x;
                    entity.y = y;
                }
            }
        }

        // Loyal factions lift their members a little.
        let lift = entity
            .faction
            .and_then(|f| env.factions.get(&f))
            .map(|f| (f.loyalty - 0.5) * 0.002)
            .unwrap_or(0.0);
        let noise = if self.mood_noise > 0.0 {
            rng.gen_range(-self.mood_noise..=self.mood_noise)
        } else {
            0.0
        };
        let relax = (entity.baseline_mood - entity.mood) * self.mood_relaxation;
        entity.mood = (entity.mood + relax + lift + noise).clamp(-1.0, 1.0);
    }

    fn step_world(&self, world: &mut WorldState, rng: &mut TickRng) {
        let population = world.population() as f64;
        for resource in world.resources.values_mut() {
            let next = resource.quantity - resource.consumption_per_head * population
                + resource.regrowth;
            resource.quantity = next.max(0.0);
        }

        if self.event_chance > 0.0 && rng.gen_bool(self.event_chance) {
            if rng.gen_bool(0.5) {
                self.fire_event(world, EventKind::Storm, -0.4);
            } else {
                self.fire_event(world, EventKind::Festival, 0.4);
            }
        }

        if self.arrival_chance > 0.0 && rng.gen_bool(self.arrival_chance) {
            let faction = world.factions.keys().next().copied();
            let x = rng.gen_range(0..world.bounds.width);
            let y = rng.gen_range(0..world.bounds.height);
            let name = format!("Newcomer {}", world.tick);
            world.add_entity(name, x, y, faction);
        }

        world.recompute_loyalty();
    }
}
