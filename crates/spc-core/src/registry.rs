use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::CoreError;

pub const UNKNOWN_ROLE: &str = "Unknown";
pub const UNKNOWN_COLOR: &str = "#6B7280";

/// One registered agent: the name it signs messages with, the glyph that
/// prefixes its lines, and how viewers should label and color it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub name: String,
    #[serde(rename = "emoji")]
    pub glyph: String,
    pub role: String,
    pub color: String,
}

impl AgentIdentity {
    pub fn new(name: &str, glyph: &str, role: &str, color: &str) -> Self {
        Self {
            name: name.to_string(),
            glyph: glyph.to_string(),
            role: role.to_string(),
            color: color.to_string(),
        }
    }
}

/// Role and color a sender name resolves to; unknown names fall back to
/// `UNKNOWN_ROLE` / `UNKNOWN_COLOR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderStyle<'a> {
    pub role: &'a str,
    pub color: &'a str,
}

/// Immutable, ordered set of agents known for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRegistry {
    agents: Vec<AgentIdentity>,
}

impl AgentRegistry {
    pub fn new(agents: Vec<AgentIdentity>) -> Result<Self, CoreError> {
        if agents.is_empty() {
            return Err(CoreError::EmptyRegistry);
        }
        let mut seen = HashSet::new();
        for agent in &agents {
            if agent.name.trim().is_empty() {
                return Err(CoreError::InvalidAgent("empty name".to_string()));
            }
            if agent.glyph.trim().is_empty() {
                return Err(CoreError::InvalidAgent(format!(
                    "{} has an empty glyph",
                    agent.name
                )));
            }
            if !seen.insert(agent.name.as_str()) {
                return Err(CoreError::DuplicateAgent(agent.name.clone()));
            }
        }
        Ok(Self { agents })
    }

    /// The six-member product team the chat UI ships with.
    pub fn default_team() -> Self {
        Self {
            agents: vec![
                AgentIdentity::new("Alex", "🧑‍💼", "PM", "#3B82F6"),
                AgentIdentity::new("Jamie", "📐", "Architect", "#8B5CF6"),
                AgentIdentity::new("Morgan", "🎨", "Designer", "#EC4899"),
                AgentIdentity::new("Sam", "💻", "Developer", "#10B981"),
                AgentIdentity::new("Taylor", "🧪", "QA", "#F59E0B"),
                AgentIdentity::new("Riley", "📝", "Writer", "#6366F1"),
            ],
        }
    }

    pub fn agents(&self) -> &[AgentIdentity] {
        &self.agents
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&AgentIdentity> {
        self.agents.iter().find(|agent| agent.name == name)
    }

    pub fn glyphs(&self) -> impl Iterator<Item = &str> {
        self.agents.iter().map(|agent| agent.glyph.as_str())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.agents.iter().map(|agent| agent.name.as_str())
    }

    pub fn style_for(&self, name: &str) -> SenderStyle<'_> {
        match self.get(name) {
            Some(agent) => SenderStyle {
                role: &agent.role,
                color: &agent.color,
            },
            None => SenderStyle {
                role: UNKNOWN_ROLE,
                color: UNKNOWN_COLOR,
            },
        }
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::default_team()
    }
}

#[derive(Serialize)]
struct AgentCard<'a> {
    emoji: &'a str,
    role: &'a str,
    color: &'a str,
}

// Serialized as an object keyed by name, in registry order.
impl Serialize for AgentRegistry {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.agents.len()))?;
        for agent in &self.agents {
            map.serialize_entry(
                &agent.name,
                &AgentCard {
                    emoji: &agent.glyph,
                    role: &agent.role,
                    color: &agent.color,
                },
            )?;
        }
        map.end()
    }
}
