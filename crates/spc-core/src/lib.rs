pub mod chat_contracts;
pub mod party_grammar;
pub mod registry;
pub mod stream_decoder;

use thiserror::Error;

pub use chat_contracts::{
    ChatMessage, ConnectionRole, ErrorResponse, IngressRequest, IngressResponse,
    KeepaliveResponse, ShutdownResponse, StatusReport, ViewerEvent, DEFAULT_PORT, INGRESS_PATH,
    VIEWER_PATH,
};
pub use party_grammar::{PartyGrammar, PartyLine};
pub use registry::{AgentIdentity, AgentRegistry, SenderStyle, UNKNOWN_COLOR, UNKNOWN_ROLE};
pub use stream_decoder::{record_payloads, StreamDecoder};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("agent registry is empty")]
    EmptyRegistry,
    #[error("duplicate agent name: {0}")]
    DuplicateAgent(String),
    #[error("invalid agent: {0}")]
    InvalidAgent(String),
    #[error("message pattern failed to compile: {0}")]
    Pattern(String),
}
