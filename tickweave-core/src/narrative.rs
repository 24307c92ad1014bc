//! The narrative-generation boundary.
//!
//! The engine never knows how text is produced. It hands a prompt to a
//! [`NarrativeProvider`] and, when that fails for good, asks a
//! [`FallbackGenerator`] for replacement text. Fallbacks must be pure so a
//! replayed session gets exactly the same text.

use crate::error::NarrativeError;
use crate::hashing::fnv64;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Core trait for narrative providers.
///
/// Calls may take seconds and may fail. They run on worker tasks, never on
/// the scheduling thread.
#[async_trait]
pub trait NarrativeProvider: Send + Sync {
    /// Generate flavor text for a prompt.
    async fn call(&self, prompt: &str) -> Result<String, NarrativeError>;

    /// Get the provider name
    fn name(&self) -> &str;
}

/// Produces replacement text once a request has failed for good.
pub trait FallbackGenerator: Send + Sync {
    /// Must depend only on the payload.
    fn generate(&self, payload: &NarrativePayload) -> String;
}

/// What a finished request's text should be attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Origin {
    /// A change detected on a tick.
    Change { tick: u64, kind: String },
    /// A player input applied on a tick.
    Input { tick: u64 },
    /// A caller-issued request (dialogue, tooltips, ...).
    Interactive { label: String },
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Change { tick, kind } => write!(f, "{kind}@{tick}"),
            Origin::Input { tick } => write!(f, "input@{tick}"),
            Origin::Interactive { label } => write!(f, "interactive:{label}"),
        }
    }
}

/// Minimal description of what happened, sent to the provider.
///
/// Carries only the implicated entities, never the whole world. The tick is
/// deliberately not part of the payload so identical situations share a
/// cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NarrativePayload {
    pub kind: String,
    pub subjects: Vec<String>,
    pub facts: BTreeMap<String, String>,
}

impl NarrativePayload {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            subjects: Vec::new(),
            facts: BTreeMap::new(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subjects.push(subject.into());
        self
    }

    pub fn with_fact(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.facts.insert(key.into(), value.to_string());
        self
    }

    /// Stable hash used for deduplication and caching.
    pub fn dedup_key(&self) -> u64 {
        let bytes = serde_json::to_vec(self).unwrap_or_else(|_| self.kind.as_bytes().to_vec());
        fnv64(&bytes)
    }

    /// Hex form of [`dedup_key`](Self::dedup_key), used in the replay log.
    pub fn digest(&self) -> String {
        format!("{:016x}", self.dedup_key())
    }

    /// Render the prompt text handed to the provider.
    pub fn prompt(&self) -> String {
        let mut prompt = format!(
            "Write one or two sentences of flavor text for a '{}' moment.",
            self.kind
        );
        if !self.subjects.is_empty() {
            prompt.push_str(&format!("\nInvolved: {}.", self.subjects.join(", ")));
        }
        for (key, value) in &self.facts {
            prompt.push_str(&format!("\n- {key}: {value}"));
        }
        prompt
    }
}

/// Fallback text from fixed templates, picked by payload hash.
#[derive(Debug, Clone, Default)]
pub struct TemplateFallback;

impl TemplateFallback {
    fn templates(kind: &str) -> &'static [&'static str] {
        match kind {
            "mood_shift" => &[
                "A change of spirit passes through {subjects}.",
                "Something weighs differently on {subjects} today.",
            ],
            "faction_loyalty" => &[
                "Talk among {subjects} turns to where their loyalties lie.",
                "The bonds within {subjects} shift.",
            ],
            "scarcity" => &[
                "Stores of {subjects} are running low.",
                "People begin to count their {subjects} carefully.",
            ],
            "event" => &[
                "Word spreads of the {subjects}.",
                "The {subjects} is all anyone talks about.",
            ],
            "player_action" => &[
                "All eyes turn to {subjects}.",
                "Word of what happened with {subjects} travels fast.",
            ],
            "immigration" => &[
                "New faces arrive: {subjects}.",
                "The settlement grows as {subjects} settle in.",
            ],
            _ => &["Life goes on for {subjects}."],
        }
    }
}

impl FallbackGenerator for TemplateFallback {
    fn generate(&self, payload: &NarrativePayload) -> String {
        let templates = Self::templates(&payload.kind);
        let template = templates[(payload.dedup_key() % templates.len() as u64) as usize];
        let subjects = if payload.subjects.is_empty() {
            "everyone".to_string()
        } else {
            payload.subjects.join(", ")
        };
        template.replace("{subjects}", &subjects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> NarrativePayload {
        NarrativePayload::new("scarcity")
            .with_subject("grain")
            .with_fact("quantity", 95)
            .with_fact("floor", 100)
    }

    #[test]
    fn test_dedup_key_is_stable() {
        assert_eq!(payload().dedup_key(), payload().dedup_key());
        let other = payload().with_fact("quantity", 94);
        assert_ne!(payload().dedup_key(), other.dedup_key());
        assert_eq!(payload().digest().len(), 16);
    }

    #[test]
    fn test_prompt_mentions_subjects_and_facts() {
        let prompt = payload().prompt();
        assert!(prompt.contains("'scarcity'"));
        assert!(prompt.contains("Involved: grain."));
        assert!(prompt.contains("- floor: 100"));
    }

    #[test]
    fn test_fallback_is_pure() {
        let fallback = TemplateFallback;
        let a = fallback.generate(&payload());
        let b = fallback.generate(&payload());
        assert_eq!(a, b);
        assert!(a.contains("grain"));
    }

    #[test]
    fn test_fallback_without_subjects() {
        let text = TemplateFallback.generate(&NarrativePayload::new("unknown"));
        assert_eq!(text, "Life goes on for everyone.");
    }

    #[test]
    fn test_origin_display() {
        let origin = Origin::Change {
            tick: 12,
            kind: "scarcity".into(),
        };
        assert_eq!(origin.to_string(), "scarcity@12");
    }
}
