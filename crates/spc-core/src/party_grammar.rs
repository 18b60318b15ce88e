//! Recognizes agent chat lines of the form `<glyph> <Name>: <body>` inside
//! arbitrary text. The pattern is compiled once from the live registry, so a
//! new agent only needs a registry entry.

use regex::Regex;

use crate::registry::AgentRegistry;
use crate::CoreError;

/// A qualifying line split into its three captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartyLine<'a> {
    pub glyph: &'a str,
    pub sender: &'a str,
    pub body: &'a str,
}

#[derive(Debug, Clone)]
pub struct PartyGrammar {
    pattern: Regex,
}

impl PartyGrammar {
    pub fn from_registry(registry: &AgentRegistry) -> Result<Self, CoreError> {
        if registry.is_empty() {
            return Err(CoreError::EmptyRegistry);
        }
        let glyphs = alternation(registry.glyphs());
        let names = alternation(registry.names());
        let source = format!(r"^(?P<glyph>{glyphs})\s+(?P<sender>{names}):\s+(?P<body>.+)$");
        let pattern = Regex::new(&source).map_err(|err| CoreError::Pattern(err.to_string()))?;
        Ok(Self { pattern })
    }

    /// Whether `line`, once trimmed, is a chat line.
    pub fn is_match(&self, line: &str) -> bool {
        self.pattern.is_match(line.trim())
    }

    /// Trimmed qualifying lines of `text`, in order. Everything else is
    /// dropped without comment.
    pub fn extract<'a>(&'a self, text: &'a str) -> impl Iterator<Item = &'a str> + Clone + 'a {
        text.lines()
            .map(str::trim)
            .filter(move |line| self.pattern.is_match(line))
    }

    pub fn parse_line<'a>(&self, line: &'a str) -> Option<PartyLine<'a>> {
        let caps = self.pattern.captures(line.trim())?;
        let glyph = caps.name("glyph")?.as_str();
        let sender = caps.name("sender")?.as_str();
        let body = caps.name("body")?.as_str().trim();
        if body.is_empty() {
            return None;
        }
        Some(PartyLine {
            glyph,
            sender,
            body,
        })
    }

    /// Like [`extract`](Self::extract) but yields the split captures.
    pub fn parse<'a>(&'a self, text: &'a str) -> impl Iterator<Item = PartyLine<'a>> + 'a {
        text.lines().filter_map(move |line| self.parse_line(line))
    }
}

// Longest alternatives first so a glyph that prefixes another cannot win the
// capture.
fn alternation<'a>(items: impl Iterator<Item = &'a str>) -> String {
    let mut items: Vec<&str> = items.collect();
    items.sort_by(|a, b| b.len().cmp(&a.len()));
    items
        .into_iter()
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join("|")
}
