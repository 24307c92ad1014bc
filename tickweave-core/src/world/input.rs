//! Player input: parsing, validation and application.
//!
//! Everything here is deterministic. The only free-form part of an input is
//! its optional flavor text, which is stored in the chronicle and otherwise
//! ignored.
//!
//! Syntax, one command per line:
//!
//! ```text
//! move <entity> <x> <y>
//! cheer <entity> <delta>
//! grant <resource> <amount>
//! trigger <event>
//! spawn <name> [faction]
//! ```
//!
//! Any command may end with `-- some flavor text`.

use super::{EventKind, WorldEvent, WorldState};
use crate::error::InputError;
use crate::ids::{EntityId, FactionId, ResourceId};
use crate::narrative::NarrativePayload;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// The mechanical part of a player input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Send an entity walking to a position.
    Move { entity: EntityId, x: i32, y: i32 },
    /// Raise (or lower) an entity's mood.
    Cheer { entity: EntityId, delta: f32 },
    /// Add to a resource stockpile.
    Grant { resource: ResourceId, amount: f64 },
    /// Fire a discrete world event.
    Trigger { event: EventKind },
    /// Bring a new entity into the world.
    Spawn {
        name: String,
        faction: Option<FactionId>,
    },
}

/// A queued player action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerInput {
    pub command: Command,
    /// Optional narrative text typed alongside the command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flavor: Option<String>,
}

impl PlayerInput {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            flavor: None,
        }
    }

    pub fn with_flavor(mut self, flavor: impl Into<String>) -> Self {
        self.flavor = Some(flavor.into());
        self
    }

    /// Name of the command as typed.
    pub fn verb(&self) -> &'static str {
        match self.command {
            Command::Move { .. } => "move",
            Command::Cheer { .. } => "cheer",
            Command::Grant { .. } => "grant",
            Command::Trigger { .. } => "trigger",
            Command::Spawn { .. } => "spawn",
        }
    }

    /// Narration request for an applied input, naming what it touched.
    pub fn payload(&self, world: &WorldState) -> NarrativePayload {
        let payload = NarrativePayload::new("player_action").with_fact("command", self.verb());
        match &self.command {
            Command::Move { entity, .. } | Command::Cheer { entity, .. } => {
                match world.entities.get(entity) {
                    Some(e) => payload.with_subject(&e.name),
                    None => payload,
                }
            }
            Command::Grant { resource, .. } => match world.resources.get(resource) {
                Some(r) => payload.with_subject(&r.name),
                None => payload,
            },
            Command::Trigger { event } => payload.with_subject(event.to_string()),
            Command::Spawn { name, .. } => payload.with_subject(name.trim()),
        }
    }

    /// Check the command against the current world without changing it.
    pub fn validate(&self, world: &WorldState) -> Result<(), InputError> {
        match &self.command {
            Command::Move { entity, x, y } => {
                if !world.entities.contains_key(entity) {
                    return Err(InputError::UnknownEntity(entity.raw()));
                }
                if !world.bounds.contains(*x, *y) {
                    return Err(InputError::OutOfBounds { x: *x, y: *y });
                }
            }
            Command::Cheer { entity, delta } => {
                if !world.entities.contains_key(entity) {
                    return Err(InputError::UnknownEntity(entity.raw()));
                }
                if !delta.is_finite() {
                    return Err(bad_args("cheer", "delta must be finite"));
                }
            }
            Command::Grant { resource, amount } => {
                if !world.resources.contains_key(resource) {
                    return Err(InputError::UnknownResource(resource.raw()));
                }
                if !amount.is_finite() || *amount < 0.0 {
                    return Err(bad_args("grant", "amount must be a non-negative number"));
                }
            }
            Command::Trigger { .. } => {}
            Command::Spawn { name, faction } => {
                if name.trim().is_empty() {
                    return Err(bad_args("spawn", "name must not be empty"));
                }
                if let Some(faction) = faction {
                    if !world.factions.contains_key(faction) {
                        return Err(InputError::UnknownFaction(faction.raw()));
                    }
                }
            }
        }
        Ok(())
    }

    /// Validate, then apply the deterministic consequences to `world`.
    pub fn apply(&self, world: &mut WorldState) -> Result<(), InputError> {
        self.validate(world)?;
        match &self.command {
            Command::Move { entity, x, y } => {
                if let Some(e) = world.entities.get_mut(entity) {
                    e.target = Some((*x, *y));
                }
            }
            Command::Cheer { entity, delta } => {
                if let Some(e) = world.entities.get_mut(entity) {
                    e.mood = (e.mood + delta).clamp(-1.0, 1.0);
                }
            }
            Command::Grant { resource, amount } => {
                if let Some(r) = world.resources.get_mut(resource) {
                    r.quantity += amount;
                }
            }
            Command::Trigger { event } => {
                world.fired_events.push(WorldEvent {
                    kind: event.clone(),
                    subject: None,
                });
            }
            Command::Spawn { name, faction } => {
                let (cx, cy) = (world.bounds.width / 2, world.bounds.height / 2);
                world.add_entity(name.trim(), cx, cy, *faction);
            }
        }
        Ok(())
    }
}

fn bad_args(command: &str, reason: &str) -> InputError {
    InputError::BadArguments {
        command: command.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_arg<T: FromStr>(command: &str, value: Option<&str>, what: &str) -> Result<T, InputError> {
    let value = value.ok_or_else(|| bad_args(command, &format!("missing {what}")))?;
    value
        .parse()
        .map_err(|_| bad_args(command, &format!("invalid {what}: {value}")))
}

impl FromStr for PlayerInput {
    type Err = InputError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let (mechanics, flavor) = match line.split_once("--") {
            Some((head, tail)) => {
                let tail = tail.trim();
                (head, (!tail.is_empty()).then(|| tail.to_string()))
            }
            None => (line, None),
        };

        let mut parts = mechanics.split_whitespace();
        let verb = parts.next().ok_or(InputError::Empty)?.to_lowercase();
        let command = match verb.as_str() {
            "move" => Command::Move {
                entity: parse_arg("move", parts.next(), "entity")?,
                x: parse_arg("move", parts.next(), "x")?,
                y: parse_arg("move", parts.next(), "y")?,
            },
            "cheer" => Command::Cheer {
                entity: parse_arg("cheer", parts.next(), "entity")?,
                delta: parse_arg("cheer", parts.next(), "delta")?,
            },
            "grant" => Command::Grant {
                resource: parse_arg("grant", parts.next(), "resource")?,
                amount: parse_arg("grant", parts.next(), "amount")?,
            },
            "trigger" => {
                let name = parts
                    .next()
                    .ok_or_else(|| bad_args("trigger", "missing event"))?;
                Command::Trigger {
                    event: EventKind::from_name(name),
                }
            }
            "spawn" => {
                let name = parts
                    .next()
                    .ok_or_else(|| bad_args("spawn", "missing name"))?
                    .to_string();
                let faction = match parts.next() {
                    Some(raw) => Some(parse_arg("spawn", Some(raw), "faction")?),
                    None => None,
                };
                Command::Spawn { name, faction }
            }
            other => return Err(InputError::UnknownCommand(other.to_string())),
        };

        if let Some(extra) = parts.next() {
            return Err(bad_args(&verb, &format!("unexpected argument: {extra}")));
        }

        Ok(PlayerInput { command, flavor })
    }
}
