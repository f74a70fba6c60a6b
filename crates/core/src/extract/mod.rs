//! # Structured Output Extractor
//!
//! Turns noisy model text into JSON. Model output may be wrapped in
//! `___start___`/`___end___` markers, fenced in code blocks, padded with prose,
//! or slightly malformed. Extraction never fails: when nothing parses, a
//! synthetic record carrying the raw text is returned instead.
//!
//! Order of attempts:
//! 1. strict parse of the whole text
//! 2. strip code fences, isolate the marker span (if any), strict parse
//! 3. without markers, isolate the outermost `{...}` span, strict parse
//! 4. the [`repair`] list, re-parsing after each step
//! 5. synthetic fallback record

mod plan;
pub mod repair;

pub use plan::{PlanRecord, ReplicationStrategy};

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Map, Value};

pub const START_MARKER: &str = "___start___";
pub const END_MARKER: &str = "___end___";

/// How an [`Extraction`] was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractOutcome {
    Parsed,
    /// Parsed after the named repair step
    Repaired(&'static str),
    /// Nothing parsed; value is the synthetic record
    Fallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub value: Value,
    pub outcome: ExtractOutcome,
}

impl Extraction {
    pub fn is_fallback(&self) -> bool {
        self.outcome == ExtractOutcome::Fallback
    }
}

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```(?:json)?\s*").expect("valid fence regex"))
}

fn message_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#""filesCount"\s*:\s*\d+\s*,\s*"message"\s*:\s*"([^"]+)""#)
            .expect("valid message regex")
    })
}

fn generated_files_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#""generatedFiles":\s*(\{[\s\S]*?\})\s*(?:,\s*"files"|$)"#)
            .expect("valid generatedFiles regex")
    })
}

/// Remove ```` ```json ```` / ```` ``` ```` fence markers.
pub fn strip_fences(text: &str) -> String {
    fence_re().replace_all(text, "").into_owned()
}

/// Substring between the start and end markers, if a start marker is present.
/// A missing end marker takes the rest of the text.
pub fn marker_span(text: &str) -> Option<&str> {
    let start = text.find(START_MARKER)? + START_MARKER.len();
    let rest = &text[start..];
    let end = rest.find(END_MARKER).unwrap_or(rest.len());
    Some(rest[..end].trim())
}

/// Outermost `{...}` span.
pub fn brace_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn parse(text: &str) -> Option<Value> {
    serde_json::from_str(text).ok()
}

/// Extract JSON without the synthetic fallback.
pub fn try_extract_json(raw: &str) -> Option<(Value, ExtractOutcome)> {
    if let Some(value) = parse(raw.trim()) {
        return Some((value, ExtractOutcome::Parsed));
    }

    let cleaned = strip_fences(raw);
    let cleaned = cleaned.trim();
    let candidate = match marker_span(cleaned) {
        Some(span) => span,
        None => brace_span(cleaned).unwrap_or(cleaned),
    };
    if let Some(value) = parse(candidate) {
        return Some((value, ExtractOutcome::Parsed));
    }

    for (name, repaired) in repair::repair_steps(candidate) {
        if let Some(value) = parse(&repaired) {
            tracing::info!("Model output parsed after repair step {}", name);
            return Some((value, ExtractOutcome::Repaired(name)));
        }
    }
    None
}

/// Extract JSON from model text. `subject` names what the text is about and
/// only appears in the fallback record.
pub fn extract_json(raw: &str, subject: &str) -> Extraction {
    match try_extract_json(raw) {
        Some((value, outcome)) => Extraction { value, outcome },
        None => {
            tracing::warn!(
                "Model output could not be parsed ({} chars), using fallback record",
                raw.len()
            );
            Extraction {
                value: fallback_record(raw, subject),
                outcome: ExtractOutcome::Fallback,
            }
        }
    }
}

/// Placeholder record used when nothing in the text parses.
pub fn fallback_record(raw: &str, subject: &str) -> Value {
    json!({
        "rawPlan": raw,
        "description": format!("Analysis of: {subject}"),
        "features": [
            "Core functionality implementation",
            "User interface development",
            "Backend API integration"
        ]
    })
}

/// Assistant summary from a `"filesCount": N, "message": "..."` sequence.
pub fn extract_message(raw: &str) -> Option<String> {
    message_re()
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Recover just the `generatedFiles` object from text that does not parse as a whole.
///
/// Takes the shortest brace span after `"generatedFiles":` that is followed by a
/// `"files"` key (or the end of the text) and parses it, with repairs if needed.
pub fn salvage_generated_files(raw: &str) -> Option<Map<String, Value>> {
    if raw.trim().is_empty() {
        return None;
    }
    let captures = generated_files_re().captures(raw)?;
    let span = captures.get(1)?.as_str();
    let value = parse(span).or_else(|| {
        repair::repair_steps(span)
            .into_iter()
            .find_map(|(_, repaired)| parse(&repaired))
    })?;
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}
