//! Pulls agent chat lines out of an LLM runtime's NDJSON output stream.
//!
//! Only three record shapes carry text worth looking at:
//!
//! ```text
//! {"type":"message","content":[{"type":"text","text":"..."}]}
//! {"type":"assistant","message":"..."}            (or a {content:[...]} object)
//! {"type":"result","result":"..."}
//! ```
//!
//! Every other record, and every line that is not JSON, is skipped.

use serde_json::Value;

use crate::party_grammar::PartyGrammar;
use crate::registry::AgentRegistry;
use crate::CoreError;

#[derive(Debug, Clone)]
pub struct StreamDecoder {
    grammar: PartyGrammar,
}

impl StreamDecoder {
    pub fn new(grammar: PartyGrammar) -> Self {
        Self { grammar }
    }

    pub fn from_registry(registry: &AgentRegistry) -> Result<Self, CoreError> {
        Ok(Self::new(PartyGrammar::from_registry(registry)?))
    }

    pub fn grammar(&self) -> &PartyGrammar {
        &self.grammar
    }

    /// Decode one raw NDJSON line. Blank or unparseable lines yield nothing.
    pub fn decode_line(&self, line: &str) -> Vec<String> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }
        match serde_json::from_str::<Value>(line) {
            Ok(record) => self.decode_record(&record),
            Err(_) => Vec::new(),
        }
    }

    pub fn decode_record(&self, record: &Value) -> Vec<String> {
        record_payloads(record)
            .into_iter()
            .flat_map(|payload| self.grammar.extract(payload))
            .map(str::to_string)
            .collect()
    }
}

/// Candidate text payloads carried by a record, in record order.
pub fn record_payloads(record: &Value) -> Vec<&str> {
    let mut payloads = Vec::new();
    match record.get("type").and_then(Value::as_str) {
        Some("message") => push_text_blocks(record.get("content"), &mut payloads),
        Some("assistant") => match record.get("message") {
            Some(Value::String(text)) => payloads.push(text.as_str()),
            Some(Value::Object(message)) => push_text_blocks(message.get("content"), &mut payloads),
            _ => {}
        },
        Some("result") => {
            if let Some(text) = record.get("result").and_then(Value::as_str) {
                payloads.push(text);
            }
        }
        _ => {}
    }
    payloads
}

fn push_text_blocks<'a>(content: Option<&'a Value>, out: &mut Vec<&'a str>) {
    let Some(blocks) = content.and_then(Value::as_array) else {
        return;
    };
    for block in blocks {
        if block.get("type").and_then(Value::as_str) != Some("text") {
            continue;
        }
        if let Some(text) = block.get("text").and_then(Value::as_str) {
            if !text.is_empty() {
                out.push(text);
            }
        }
    }
}
