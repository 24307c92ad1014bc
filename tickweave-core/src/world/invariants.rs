//! End-of-tick invariant checks.
//!
//! Violations are repaired in place (clamped, reset or detached) and
//! reported. Only a violation that cannot be repaired without guessing is
//! marked [`Severity::Fatal`].

use super::WorldState;
use crate::ids::{EntityId, FactionId, ResourceId};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    /// Repaired; the tick continues normally.
    Recoverable,
    /// Left as-is and surfaced to the operator.
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ViolationKind {
    MoodOutOfRange { entity: EntityId, value: f32 },
    NonFiniteMood { entity: EntityId },
    OutOfBounds { entity: EntityId, x: i32, y: i32 },
    DanglingFaction { entity: EntityId, faction: FactionId },
    LoyaltyOutOfRange { faction: FactionId, value: f32 },
    NegativeQuantity { resource: ResourceId, value: f64 },
    NonFiniteQuantity { resource: ResourceId },
    /// Map key and stored id disagree; there is no safe way to pick one.
    IdMismatch { key: u64, stored: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub kind: ViolationKind,
    pub severity: Severity,
}

impl InvariantViolation {
    fn repaired(kind: ViolationKind) -> Self {
        Self {
            kind,
            severity: Severity::Recoverable,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ViolationKind::MoodOutOfRange { entity, value } => {
                write!(f, "mood of {entity} out of range ({value})")
            }
            ViolationKind::NonFiniteMood { entity } => write!(f, "mood of {entity} is not finite"),
            ViolationKind::OutOfBounds { entity, x, y } => {
                write!(f, "{entity} outside world at ({x}, {y})")
            }
            ViolationKind::DanglingFaction { entity, faction } => {
                write!(f, "{entity} belongs to missing faction {faction}")
            }
            ViolationKind::LoyaltyOutOfRange { faction, value } => {
                write!(f, "loyalty of {faction} out of range ({value})")
            }
            ViolationKind::NegativeQuantity { resource, value } => {
                write!(f, "{resource} has negative quantity ({value})")
            }
            ViolationKind::NonFiniteQuantity { resource } => {
                write!(f, "quantity of {resource} is not finite")
            }
            ViolationKind::IdMismatch { key, stored } => {
                write!(f, "entry keyed {key} stores id {stored}")
            }
        }
    }
}

/// Check every invariant, repairing what can be repaired.
///
/// Violations are returned in a stable order: entities, factions, resources,
/// each by id.
pub fn validate_and_repair(world: &mut WorldState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let bounds = world.bounds;

    for (key, entity) in world.entities.iter_mut() {
        if *key != entity.id {
            violations.push(InvariantViolation {
                kind: ViolationKind::IdMismatch {
                    key: key.raw(),
                    stored: entity.id.raw(),
                },
                severity: Severity::Fatal,
            });
            continue;
        }
        if !entity.mood.is_finite() {
            violations.push(InvariantViolation::repaired(ViolationKind::NonFiniteMood {
                entity: entity.id,
            }));
            entity.mood = entity.baseline_mood.clamp(-1.0, 1.0);
        } else if !(-1.0..=1.0).contains(&entity.mood) {
            violations.push(InvariantViolation::repaired(ViolationKind::MoodOutOfRange {
                entity: entity.id,
                value: entity.mood,
            }));
            entity.mood = entity.mood.clamp(-1.0, 1.0);
        }
        if !bounds.contains(entity.x, entity.y) {
            violations.push(InvariantViolation::repaired(ViolationKind::OutOfBounds {
                entity: entity.id,
                x: entity.x,
                y: entity.y,
            }));
            let (x, y) = bounds.clamp(entity.x, entity.y);
            entity.x = x;
            entity.y = y;
        }
        if let Some(faction) = entity.faction {
            if !world.factions.contains_key(&faction) {
                violations.push(InvariantViolation::repaired(
                    ViolationKind::DanglingFaction {
                        entity: entity.id,
                        faction,
                    },
                ));
                entity.faction = None;
            }
        }
    }

    for faction in world.factions.values_mut() {
        if !faction.loyalty.is_finite() || !(0.0..=1.0).contains(&faction.loyalty) {
            violations.push(InvariantViolation::repaired(
                ViolationKind::LoyaltyOutOfRange {
                    faction: faction.id,
                    value: faction.loyalty,
                },
            ));
            faction.loyalty = if faction.loyalty.is_finite() {
                faction.loyalty.clamp(0.0, 1.0)
            } else {
                0.5
            };
        }
    }

    for resource in world.resources.values_mut() {
        if !resource.quantity.is_finite() {
            violations.push(InvariantViolation::repaired(
                ViolationKind::NonFiniteQuantity {
                    resource: resource.id,
                },
            ));
            resource.quantity = 0.0;
        } else if resource.quantity < 0.0 {
            violations.push(InvariantViolation::repaired(
                ViolationKind::NegativeQuantity {
                    resource: resource.id,
                    value: resource.quantity,
                },
            ));
            resource.quantity = 0.0;
        }
    }

    violations
}
