//! The `Response` type returned by every agent invocation
//!
//! One `Response` closes out one provider call (Phase 1, Phase 2, or Phase 3
//! of a movement, or a sub-movement/part/batch of a concurrent variant).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome status of one agent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    /// The agent finished its turn normally.
    Done,
    /// The agent is waiting on something it cannot resolve itself.
    Blocked,
    /// The provider call failed; `content` carries a human-readable reason.
    Error,
    /// The agent answered a query (team-leader / rule-evaluator judge calls).
    Answer,
}

/// One agent invocation's result.
///
/// Invariant: `status == Error` implies `content` is non-empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub content: String,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub timestamp: String,
}

impl Response {
    pub fn done(content: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            status: ResponseStatus::Done,
            structured_output: None,
            session_id: None,
            timestamp: timestamp.into(),
        }
    }

    /// Build an error response, enforcing the non-empty-content invariant by
    /// falling back to a generic message if `reason` is blank.
    pub fn error(reason: impl Into<String>, timestamp: impl Into<String>) -> Self {
        let reason = reason.into();
        let content = if reason.trim().is_empty() {
            "provider error (no reason given)".to_string()
        } else {
            reason
        };
        Self {
            content,
            status: ResponseStatus::Error,
            structured_output: None,
            session_id: None,
            timestamp: timestamp.into(),
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_structured_output(mut self, value: Value) -> Self {
        self.structured_output = Some(value);
        self
    }

    pub fn is_error(&self) -> bool {
        self.status == ResponseStatus::Error
    }

    /// Pull a `{"step": N}`-shaped structured-output integer, if present.
    pub fn structured_step(&self) -> Option<u32> {
        self.structured_output
            .as_ref()
            .and_then(|v| v.get("step"))
            .and_then(|v| v.as_u64())
            .map(|n| n as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_never_has_empty_content() {
        let r = Response::error("", "2026-01-01T00:00:00Z");
        assert!(r.is_error());
        assert!(!r.content.is_empty());
    }

    #[test]
    fn structured_step_reads_nested_field() {
        let r = Response::done("ok", "t").with_structured_output(serde_json::json!({"step": 3}));
        assert_eq!(r.structured_step(), Some(3));
    }

    #[test]
    fn structured_step_absent_when_no_structured_output() {
        let r = Response::done("ok", "t");
        assert_eq!(r.structured_step(), None);
    }
}
