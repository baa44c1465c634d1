use serde::Deserialize;

use crate::model::{OptimizationEntry, ScenarioResult};

/// Log text the server emits once the whole optimization loop has finished.
pub const COMPLETION_SENTINEL: &str = "Optimization Complete";

/// One message from the simulation server, discriminated by its `type` field.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerEvent {
    Log { message: String },
    Result(ScenarioResult),
    Optimization(OptimizationEntry),
    Error {
        #[serde(default)]
        message: String,
    },
    /// Any `type` this client does not know yet.
    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Log { .. } => "log",
            ServerEvent::Result(_) => "result",
            ServerEvent::Optimization(_) => "optimization",
            ServerEvent::Error { .. } => "error",
            ServerEvent::Unknown => "unknown",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed event: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid '{field}' in {kind} event: {reason}")]
    InvalidField {
        kind: &'static str,
        field: &'static str,
        reason: String,
    },
}

/// Decode and validate one inbound frame.
///
/// # Errors
///
/// Returns [`ProtocolError`] when the frame is not a JSON object with a `type`
/// tag, when a known event lacks a required field, or when a field holds an
/// impossible value.
pub fn decode(frame: &str) -> Result<ServerEvent, ProtocolError> {
    let event: ServerEvent = serde_json::from_str(frame)?;
    if let ServerEvent::Result(result) = &event {
        if result.cycle == 0 {
            return Err(ProtocolError::InvalidField {
                kind: "result",
                field: "cycle",
                reason: "cycles start at 1".to_string(),
            });
        }
        if !result.score.is_finite() {
            return Err(ProtocolError::InvalidField {
                kind: "result",
                field: "score",
                reason: format!("{} is not a finite number", result.score),
            });
        }
    }
    Ok(event)
}
