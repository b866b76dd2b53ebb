//! Parley error types

use std::fmt;

use thiserror::Error;

use crate::message::{AgentId, ConversationId, MessageId};

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, ParleyError>;

/// A single problem found while validating an envelope or request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Offending field, e.g. `message_type` or `steps[2].agent`
    pub field: String,
    /// What is wrong with it
    pub reason: String,
}

impl ValidationIssue {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

/// Renders a non-empty issue list as `a: x; b: y`
fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors that can occur in the orchestration core
#[derive(Debug, Error)]
pub enum ParleyError {
    /// Malformed message or request, rejected before any side effect
    #[error("Validation failed: {}", join_issues(.0))]
    Validation(Vec<ValidationIssue>),

    /// No subscriber accepts the message
    #[error("No route to {receiver} for message {message_id}")]
    Routing {
        message_id: MessageId,
        receiver: AgentId,
    },

    /// A subscriber failed while handling a delivery
    #[error("Delivery of {message_id} to {agent_id} failed: {reason}")]
    Delivery {
        agent_id: AgentId,
        message_id: MessageId,
        reason: String,
    },

    /// Conversation save/load failure
    #[error("Persistence error for conversation {conversation_id}: {reason}")]
    Persistence {
        conversation_id: ConversationId,
        reason: String,
    },

    /// Task deadline exceeded
    #[error("Task {task_id} timed out after {elapsed_ms}ms")]
    Timeout { task_id: String, elapsed_ms: u128 },

    /// Explicit abort requested
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Unknown conversation, message, workflow or operation
    #[error("Not found: {0}")]
    NotFound(String),

    /// State machine rejected a transition
    #[error("Invalid transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },

    /// Subscription registry error
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Queue or channel has been closed
    #[error("Channel closed: {0}")]
    Closed(String),
}

impl ParleyError {
    /// Shorthand for a validation error with a single issue
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation(vec![ValidationIssue::new(field, reason)])
    }

    /// Shorthand for a persistence error
    pub fn persistence(conversation_id: &ConversationId, reason: impl fmt::Display) -> Self {
        Self::Persistence {
            conversation_id: conversation_id.clone(),
            reason: reason.to_string(),
        }
    }

    /// True for errors that were raised before any side effect
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Validation issues, empty for every other variant
    pub fn issues(&self) -> &[ValidationIssue] {
        match self {
            Self::Validation(issues) => issues,
            _ => &[],
        }
    }
}

impl From<serde_json::Error> for ParleyError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid("document", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_display_joins_issues() {
        let err = ParleyError::Validation(vec![
            ValidationIssue::new("sender", "must not be empty"),
            ValidationIssue::new("message_type", "unknown type `shout`"),
        ]);

        assert_eq!(
            err.to_string(),
            "Validation failed: sender: must not be empty; message_type: unknown type `shout`"
        );
        assert!(err.is_validation());
        assert_eq!(err.issues().len(), 2);
    }

    #[test]
    fn test_non_validation_has_no_issues() {
        let err = ParleyError::Cancelled("workflow aborted".into());
        assert!(!err.is_validation());
        assert!(err.issues().is_empty());
    }

    #[test]
    fn test_persistence_shorthand() {
        let id = ConversationId::from("c1");
        let err = ParleyError::persistence(&id, "disk full");
        assert_eq!(err.to_string(), "Persistence error for conversation c1: disk full");
    }
}
