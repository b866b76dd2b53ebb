//! Envelope schema validation
//!
//! Two entry points: [`validate`] checks a typed [`Message`] built in-process,
//! [`parse_envelope`] checks a raw JSON document coming off the wire. Both
//! collect every problem they find instead of stopping at the first one.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::{ParleyError, Result, ValidationIssue};
use crate::message::{
    AgentId, ConversationId, Message, MessageId, MessageType, Priority, SchemaVersion,
};

const REQUIRED_FIELDS: [&str; 7] = [
    "message_id",
    "timestamp",
    "sender",
    "message_type",
    "conversation_id",
    "content",
    "schema_version",
];

/// Check the invariants a typed message must satisfy before publication
pub fn validate(message: &Message) -> Result<()> {
    let issues = message_issues(message);
    if issues.is_empty() {
        Ok(())
    } else {
        Err(ParleyError::Validation(issues))
    }
}

fn message_issues(message: &Message) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if message.message_id.is_empty() {
        issues.push(ValidationIssue::new("message_id", "must not be empty"));
    }
    if message.sender.is_empty() {
        issues.push(ValidationIssue::new("sender", "must not be empty"));
    }
    if message.conversation_id.is_empty() {
        issues.push(ValidationIssue::new("conversation_id", "must not be empty"));
    }
    if message.timestamp < 0 {
        issues.push(ValidationIssue::new("timestamp", "must not be negative"));
    }
    if let Some(receiver) = &message.receiver {
        if receiver.is_empty() {
            issues.push(ValidationIssue::new("receiver", "must not be empty when present"));
        }
    }
    if let Some(parent) = &message.parent_id {
        if parent.is_empty() {
            issues.push(ValidationIssue::new("parent_id", "must not be empty when present"));
        } else if parent == &message.message_id {
            issues.push(ValidationIssue::new("parent_id", "message cannot be its own parent"));
        }
    }
    if !message.content.is_object() {
        issues.push(ValidationIssue::new("content", "must be a JSON object"));
    }
    if let Some(confidence) = message.confidence {
        if !(0.0..=1.0).contains(&confidence) {
            issues.push(ValidationIssue::new(
                "confidence",
                format!("{confidence} is outside [0, 1]"),
            ));
        }
    }

    issues
}

/// Parse and validate a raw JSON envelope
pub fn parse_envelope(doc: &Value) -> Result<Message> {
    let Some(obj) = doc.as_object() else {
        return Err(ParleyError::invalid("envelope", "must be a JSON object"));
    };

    let mut issues = Vec::new();
    for field in REQUIRED_FIELDS {
        if obj.get(field).map_or(true, Value::is_null) {
            issues.push(ValidationIssue::new(field, "is required"));
        }
    }

    let message_id = string_field(obj, "message_id", &mut issues);
    let sender = string_field(obj, "sender", &mut issues);
    let conversation_id = string_field(obj, "conversation_id", &mut issues);
    let receiver = string_field(obj, "receiver", &mut issues);
    let parent_id = string_field(obj, "parent_id", &mut issues);

    let timestamp = match obj.get("timestamp") {
        Some(Value::Number(n)) => match n.as_i64() {
            Some(ts) => Some(ts),
            None => {
                issues.push(ValidationIssue::new("timestamp", "must be an integer"));
                None
            }
        },
        Some(Value::Null) | None => None,
        Some(_) => {
            issues.push(ValidationIssue::new("timestamp", "must be numeric"));
            None
        }
    };

    let message_type = match obj.get("message_type") {
        Some(Value::String(s)) => match s.parse::<MessageType>() {
            Ok(ty) => Some(ty),
            Err(err) => {
                issues.extend(err.issues().iter().cloned());
                None
            }
        },
        Some(Value::Null) | None => None,
        Some(_) => {
            issues.push(ValidationIssue::new("message_type", "must be a string"));
            None
        }
    };

    let schema_version = match obj.get("schema_version") {
        Some(Value::String(s)) => match s.parse::<SchemaVersion>() {
            Ok(v) => Some(v),
            Err(err) => {
                issues.extend(err.issues().iter().cloned());
                None
            }
        },
        Some(Value::Null) | None => None,
        Some(_) => {
            issues.push(ValidationIssue::new("schema_version", "must be a string"));
            None
        }
    };

    let priority = match obj.get("priority") {
        None | Some(Value::Null) => Priority::default(),
        Some(value) => match serde_json::from_value::<Priority>(value.clone()) {
            Ok(p) => p,
            Err(_) => {
                issues.push(ValidationIssue::new(
                    "priority",
                    "must be a level 0-255 or one of background/low/normal/high/critical",
                ));
                Priority::default()
            }
        },
    };

    let confidence = match obj.get("confidence") {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => n.as_f64(),
        Some(_) => {
            issues.push(ValidationIssue::new("confidence", "must be numeric"));
            None
        }
    };

    let metadata = match obj.get("metadata") {
        None | Some(Value::Null) => BTreeMap::new(),
        Some(Value::Object(map)) => {
            let mut metadata = BTreeMap::new();
            for (key, value) in map {
                match value {
                    Value::String(s) => {
                        metadata.insert(key.clone(), s.clone());
                    }
                    other => {
                        metadata.insert(key.clone(), other.to_string());
                    }
                }
            }
            metadata
        }
        Some(_) => {
            issues.push(ValidationIssue::new("metadata", "must be an object"));
            BTreeMap::new()
        }
    };

    let content = obj.get("content").cloned().unwrap_or(Value::Null);

    match (
        message_id,
        timestamp,
        sender,
        message_type,
        conversation_id,
        schema_version,
    ) {
        (
            Some(message_id),
            Some(timestamp),
            Some(sender),
            Some(message_type),
            Some(conversation_id),
            Some(schema_version),
        ) if issues.is_empty() => {
            let message = Message {
                message_id: MessageId::from(message_id),
                timestamp,
                sender: AgentId::from(sender),
                receiver: receiver.map(AgentId::from),
                message_type,
                conversation_id: ConversationId::from(conversation_id),
                parent_id: parent_id.map(MessageId::from),
                priority,
                content,
                confidence,
                metadata,
                schema_version,
            };
            validate(&message)?;
            Ok(message)
        }
        _ => Err(ParleyError::Validation(dedup(issues))),
    }
}

fn string_field(
    obj: &Map<String, Value>,
    field: &str,
    issues: &mut Vec<ValidationIssue>,
) -> Option<String> {
    match obj.get(field) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Null) | None => None,
        Some(_) => {
            issues.push(ValidationIssue::new(field, "must be a string"));
            None
        }
    }
}

fn dedup(mut issues: Vec<ValidationIssue>) -> Vec<ValidationIssue> {
    let mut seen = Vec::with_capacity(issues.len());
    issues.retain(|issue| {
        if seen.contains(issue) {
            false
        } else {
            seen.push(issue.clone());
            true
        }
    });
    issues
}
