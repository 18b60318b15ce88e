use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::party_grammar::PartyLine;
use crate::registry::AgentRegistry;

pub const DEFAULT_PORT: u16 = 3847;
pub const INGRESS_PATH: &str = "/api/message";
pub const VIEWER_PATH: &str = "/ws";

/// One relayed utterance. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub agent: String,
    pub emoji: String,
    pub role: String,
    pub color: String,
    pub content: String,
}

impl ChatMessage {
    pub fn from_line(
        id: String,
        line: &PartyLine<'_>,
        registry: &AgentRegistry,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let style = registry.style_for(line.sender);
        Self {
            id,
            timestamp,
            agent: line.sender.to_string(),
            emoji: line.glyph.to_string(),
            role: style.role.to_string(),
            color: style.color.to_string(),
            content: line.body.trim().to_string(),
        }
    }
}

/// Everything the hub pushes down a viewer socket, as `{type, data}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ViewerEvent {
    Message(ChatMessage),
    History(Vec<ChatMessage>),
    Feature(String),
    TimerReset(u64),
    TimerWarning(u64),
    Shutdown(String),
}

impl ViewerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ViewerEvent::Message(_) => "message",
            ViewerEvent::History(_) => "history",
            ViewerEvent::Feature(_) => "feature",
            ViewerEvent::TimerReset(_) => "timer_reset",
            ViewerEvent::TimerWarning(_) => "timer_warning",
            ViewerEvent::Shutdown(_) => "shutdown",
        }
    }
}

/// Which side of the relay a `/ws` connection is on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionRole {
    #[default]
    #[serde(alias = "viewer")]
    Subscriber,
    Publisher,
}

impl ConnectionRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionRole::Subscriber => "subscriber",
            ConnectionRole::Publisher => "publisher",
        }
    }
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionRole {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "subscriber" | "viewer" => Ok(ConnectionRole::Subscriber),
            "publisher" => Ok(ConnectionRole::Publisher),
            other => Err(format!("Unknown role: {other}")),
        }
    }
}

/// Body of `POST /api/message`, and of a publisher's text frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngressRequest {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngressResponse {
    pub success: bool,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub uptime: u64,
    pub idle_timeout_seconds: u64,
    pub remaining_seconds: u64,
    pub connected_clients: usize,
    pub message_count: usize,
    pub feature: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KeepaliveResponse {
    pub success: bool,
    pub remaining_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShutdownResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::party_grammar::PartyGrammar;

    #[test]
    fn viewer_event_wire_shape() {
        let raw = serde_json::to_value(ViewerEvent::TimerWarning(42)).expect("encode");
        assert_eq!(raw, serde_json::json!({"type": "timer_warning", "data": 42}));

        let raw = serde_json::to_value(ViewerEvent::Shutdown("idle-timeout".to_string()))
            .expect("encode");
        assert_eq!(raw, serde_json::json!({"type": "shutdown", "data": "idle-timeout"}));

        let raw = serde_json::to_value(ViewerEvent::History(Vec::new())).expect("encode");
        assert_eq!(raw, serde_json::json!({"type": "history", "data": []}));
    }

    #[test]
    fn message_fields_resolve_from_registry() {
        let registry = AgentRegistry::default_team();
        let grammar = PartyGrammar::from_registry(&registry).expect("grammar");
        let line = grammar
            .parse_line("🧪 Taylor: regression suite passing")
            .expect("qualifying line");
        let timestamp = DateTime::parse_from_rfc3339("2026-02-07T21:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc);
        let msg = ChatMessage::from_line("1-1".to_string(), &line, &registry, timestamp);

        let raw = serde_json::to_value(ViewerEvent::Message(msg)).expect("encode");
        assert_eq!(raw["type"], "message");
        assert_eq!(raw["data"]["agent"], "Taylor");
        assert_eq!(raw["data"]["emoji"], "🧪");
        assert_eq!(raw["data"]["role"], "QA");
        assert_eq!(raw["data"]["color"], "#F59E0B");
        assert_eq!(raw["data"]["content"], "regression suite passing");
        assert!(raw["data"]["timestamp"]
            .as_str()
            .is_some_and(|ts| ts.starts_with("2026-02-07T21:00:00")));
    }

    #[test]
    fn status_report_uses_camel_case() {
        let report = StatusReport {
            uptime: 5,
            idle_timeout_seconds: 1800,
            remaining_seconds: 1795,
            connected_clients: 2,
            message_count: 7,
            feature: None,
        };
        let raw = serde_json::to_value(report).expect("encode");
        assert_eq!(raw["idleTimeoutSeconds"], 1800);
        assert_eq!(raw["remainingSeconds"], 1795);
        assert_eq!(raw["connectedClients"], 2);
        assert_eq!(raw["messageCount"], 7);
    }

    #[test]
    fn connection_role_parses_loosely() {
        assert_eq!(
            "Publisher".parse::<ConnectionRole>(),
            Ok(ConnectionRole::Publisher)
        );
        assert_eq!(
            "viewer".parse::<ConnectionRole>(),
            Ok(ConnectionRole::Subscriber)
        );
        assert!("admin".parse::<ConnectionRole>().is_err());
    }
}
