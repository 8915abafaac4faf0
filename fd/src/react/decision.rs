//! Structured decision parsing and format repair
//!
//! Each round the agent must answer with one JSON object:
//! `{"thought": "...", "action": "ACTION_NAME", "params": {...}}`.
//! Agents drift into prose; [`parse_decision`] salvages an embedded JSON
//! object when it can, and names the offending field otherwise so the
//! repair prompt can point at exactly what was wrong.

use serde_json::Value;
use thiserror::Error;

/// The recognized decision shape, quoted in repair prompts
pub const DECISION_SHAPE: &str = r#"{"thought": "<reasoning>", "action": "<ACTION_NAME>", "params": {<parameters>}}"#;

/// A parsed agent decision
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub thought: String,
    pub action: String,
    pub params: Value,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecisionError {
    #[error("response is not a JSON object")]
    NotJson,

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("field '{0}' has the wrong type")]
    WrongType(&'static str),
}

impl DecisionError {
    /// The field a repair prompt should call out
    pub fn field(&self) -> &'static str {
        match self {
            DecisionError::NotJson => "response",
            DecisionError::MissingField(f) | DecisionError::WrongType(f) => f,
        }
    }
}

/// Parse an agent response into a [`Decision`].
///
/// Accepts a bare JSON object or one embedded in surrounding prose
/// (including fenced code blocks). `thought` defaults to empty and
/// `params` to `{}`; `action` is mandatory and must be a non-empty
/// string.
pub fn parse_decision(raw: &str) -> Result<Decision, DecisionError> {
    let value = parse_object(raw).ok_or(DecisionError::NotJson)?;

    let thought = match value.get("thought") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(_) => return Err(DecisionError::WrongType("thought")),
    };

    let action = match value.get("action") {
        None | Some(Value::Null) => return Err(DecisionError::MissingField("action")),
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::String(_)) => return Err(DecisionError::MissingField("action")),
        Some(_) => return Err(DecisionError::WrongType("action")),
    };

    let params = match value.get("params") {
        None | Some(Value::Null) => Value::Object(serde_json::Map::new()),
        Some(p @ Value::Object(_)) => p.clone(),
        Some(_) => return Err(DecisionError::WrongType("params")),
    };

    Ok(Decision { thought, action, params })
}

/// Try the whole string, then the largest `{...}` span inside it
fn parse_object(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&trimmed[start..=end]) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}
