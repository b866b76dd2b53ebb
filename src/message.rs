//! Message envelope exchanged between agents

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ParleyError;

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identity of an agent (or of the orchestrator itself)
    AgentId
);
string_id!(
    /// Thread identifier shared by every message of a conversation
    ConversationId
);
string_id!(
    /// Globally unique message identifier
    MessageId
);

impl MessageId {
    /// Generate a fresh random id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl ConversationId {
    /// Generate a fresh random conversation id
    pub fn generate() -> Self {
        Self(format!("conv-{}", Uuid::new_v4()))
    }
}

/// Closed set of message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    TaskRequest,
    TaskResult,
    Query,
    QueryResponse,
    Error,
    Status,
    Log,
}

impl MessageType {
    pub const ALL: [MessageType; 7] = [
        MessageType::TaskRequest,
        MessageType::TaskResult,
        MessageType::Query,
        MessageType::QueryResponse,
        MessageType::Error,
        MessageType::Status,
        MessageType::Log,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskRequest => "task-request",
            Self::TaskResult => "task-result",
            Self::Query => "query",
            Self::QueryResponse => "query-response",
            Self::Error => "error",
            Self::Status => "status",
            Self::Log => "log",
        }
    }

    /// Whether this type closes out a task request
    pub fn is_terminal_reply(&self) -> bool {
        matches!(self, Self::TaskResult | Self::Error)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ParleyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ParleyError::invalid("message_type", format!("unknown type `{s}`")))
    }
}

/// Delivery priority; larger values are served first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    pub const BACKGROUND: Priority = Priority(0);
    pub const LOW: Priority = Priority(25);
    pub const NORMAL: Priority = Priority(50);
    pub const HIGH: Priority = Priority(75);
    pub const CRITICAL: Priority = Priority(100);

    pub const fn new(level: u8) -> Self {
        Self(level)
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    /// Resolve a named level (`low`, `high`, ...)
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "background" => Some(Self::BACKGROUND),
            "low" => Some(Self::LOW),
            "normal" => Some(Self::NORMAL),
            "high" => Some(Self::HIGH),
            "critical" => Some(Self::CRITICAL),
            _ => None,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Level(u8),
            Name(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Level(level) => Ok(Priority(level)),
            Repr::Name(name) => Priority::from_name(&name)
                .ok_or_else(|| serde::de::Error::custom(format!("unknown priority `{name}`"))),
        }
    }
}

/// Envelope schema versions this build understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchemaVersion {
    #[serde(rename = "1.0")]
    V1_0,
    #[serde(rename = "1.1")]
    V1_1,
}

impl SchemaVersion {
    pub const CURRENT: SchemaVersion = SchemaVersion::V1_1;
    pub const SUPPORTED: [SchemaVersion; 2] = [SchemaVersion::V1_0, SchemaVersion::V1_1];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V1_0 => "1.0",
            Self::V1_1 => "1.1",
        }
    }
}

impl Default for SchemaVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl FromStr for SchemaVersion {
    type Err = ParleyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::SUPPORTED
            .iter()
            .copied()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| {
                ParleyError::invalid("schema_version", format!("unsupported version `{s}`"))
            })
    }
}

/// Immutable envelope exchanged between agents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    /// Creation time in epoch milliseconds
    pub timestamp: i64,
    pub sender: AgentId,
    /// `None` means broadcast
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<AgentId>,
    pub message_type: MessageType,
    pub conversation_id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
    #[serde(default)]
    pub priority: Priority,
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    pub schema_version: SchemaVersion,
}

impl Message {
    /// Start building a message
    pub fn builder(
        sender: impl Into<AgentId>,
        message_type: MessageType,
        conversation_id: impl Into<ConversationId>,
    ) -> MessageBuilder {
        MessageBuilder::new(sender.into(), message_type, conversation_id.into())
    }

    /// Start a reply threaded under this message and addressed to its sender
    pub fn reply(&self, sender: impl Into<AgentId>, message_type: MessageType) -> MessageBuilder {
        MessageBuilder::new(sender.into(), message_type, self.conversation_id.clone())
            .parent(self.message_id.clone())
            .to(self.sender.clone())
    }

    pub fn is_broadcast(&self) -> bool {
        self.receiver.is_none()
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Read a string field from an object payload
    pub fn content_str(&self, key: &str) -> Option<&str> {
        self.content.get(key).and_then(Value::as_str)
    }
}

/// Builder for [`Message`]; validation happens at publish time
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    message: Message,
}

impl MessageBuilder {
    fn new(sender: AgentId, message_type: MessageType, conversation_id: ConversationId) -> Self {
        Self {
            message: Message {
                message_id: MessageId::generate(),
                timestamp: chrono::Utc::now().timestamp_millis(),
                sender,
                receiver: None,
                message_type,
                conversation_id,
                parent_id: None,
                priority: Priority::default(),
                content: Value::Object(Default::default()),
                confidence: None,
                metadata: BTreeMap::new(),
                schema_version: SchemaVersion::CURRENT,
            },
        }
    }

    pub fn id(mut self, id: impl Into<MessageId>) -> Self {
        self.message.message_id = id.into();
        self
    }

    pub fn to(mut self, receiver: impl Into<AgentId>) -> Self {
        self.message.receiver = Some(receiver.into());
        self
    }

    pub fn broadcast(mut self) -> Self {
        self.message.receiver = None;
        self
    }

    pub fn parent(mut self, parent: impl Into<MessageId>) -> Self {
        self.message.parent_id = Some(parent.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.message.priority = priority;
        self
    }

    pub fn content(mut self, content: Value) -> Self {
        self.message.content = content;
        self
    }

    pub fn confidence(mut self, confidence: f64) -> Self {
        self.message.confidence = Some(confidence);
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.message.metadata.insert(key.into(), value.into());
        self
    }

    pub fn timestamp(mut self, millis: i64) -> Self {
        self.message.timestamp = millis;
        self
    }

    pub fn schema_version(mut self, version: SchemaVersion) -> Self {
        self.message.schema_version = version;
        self
    }

    pub fn build(self) -> Message {
        self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_type_names() {
        for ty in MessageType::ALL {
            assert_eq!(ty.as_str().parse::<MessageType>().unwrap(), ty);
            let encoded = serde_json::to_value(ty).unwrap();
            assert_eq!(encoded, json!(ty.as_str()));
        }
        assert!("shout".parse::<MessageType>().is_err());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::CRITICAL > Priority::HIGH);
        assert!(Priority::new(5) > Priority::new(1));
        assert_eq!(Priority::default(), Priority::NORMAL);
    }

    #[test]
    fn test_priority_accepts_names_and_levels() {
        let named: Priority = serde_json::from_value(json!("high")).unwrap();
        let level: Priority = serde_json::from_value(json!(7)).unwrap();
        assert_eq!(named, Priority::HIGH);
        assert_eq!(level, Priority::new(7));
        assert!(serde_json::from_value::<Priority>(json!("urgent")).is_err());
    }

    #[test]
    fn test_builder_defaults() {
        let msg = Message::builder("planner", MessageType::Query, "c1").build();

        assert!(msg.is_broadcast());
        assert!(msg.is_root());
        assert_eq!(msg.priority, Priority::NORMAL);
        assert_eq!(msg.schema_version, SchemaVersion::CURRENT);
        assert!(msg.content.is_object());
    }

    #[test]
    fn test_reply_threads_under_original() {
        let request = Message::builder("orchestrator", MessageType::TaskRequest, "c1")
            .to("scanner")
            .build();
        let reply = request.reply("scanner", MessageType::TaskResult).build();

        assert_eq!(reply.parent_id.as_ref(), Some(&request.message_id));
        assert_eq!(reply.receiver.as_ref(), Some(&request.sender));
        assert_eq!(reply.conversation_id, request.conversation_id);
    }

    #[test]
    fn test_envelope_field_names() {
        let msg = Message::builder("a", MessageType::Log, "c1")
            .meta("source", "unit")
            .build();
        let doc = serde_json::to_value(&msg).unwrap();

        assert_eq!(doc["message_type"], json!("log"));
        assert_eq!(doc["schema_version"], json!("1.1"));
        assert_eq!(doc["metadata"]["source"], json!("unit"));
        assert!(doc.get("receiver").is_none());
    }
}
