//! Conversation store - threads messages into thought chains
//!
//! Every conversation is an append-only tree of messages linked by
//! `parent_id`. A parent must already be present in the same conversation
//! when a child is appended, which rules out cycles. Each conversation sits
//! behind its own lock; the id maps have their own short-lived locks.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ParleyError, Result};
use crate::message::{ConversationId, Message, MessageId, SchemaVersion};
use crate::schema;
use crate::storage::{ConversationStorage, MemoryStorage, StoredBlob};

/// Version of the persisted record layout
pub const RECORD_FORMAT: u32 = 1;

/// An append-only message tree sharing one conversation id
#[derive(Debug, Clone)]
pub struct Conversation {
    id: ConversationId,
    messages: Vec<Arc<Message>>,
    index: HashMap<MessageId, usize>,
    children: HashMap<MessageId, Vec<MessageId>>,
}

impl Conversation {
    pub fn new(id: ConversationId) -> Self {
        Self {
            id,
            messages: Vec::new(),
            index: HashMap::new(),
            children: HashMap::new(),
        }
    }

    /// Rebuild a conversation, enforcing the same rules as live appends
    pub fn from_messages(id: ConversationId, messages: Vec<Message>) -> Result<Self> {
        let mut conversation = Self::new(id);
        for message in messages {
            conversation.append(Arc::new(message))?;
        }
        Ok(conversation)
    }

    pub fn id(&self) -> &ConversationId {
        &self.id
    }

    /// Append a message whose parent (if any) is already present
    pub fn append(&mut self, message: Arc<Message>) -> Result<()> {
        if message.conversation_id != self.id {
            return Err(ParleyError::invalid(
                "conversation_id",
                format!("{} does not belong to {}", message.conversation_id, self.id),
            ));
        }
        if self.index.contains_key(&message.message_id) {
            return Err(ParleyError::invalid(
                "message_id",
                format!("duplicate id {}", message.message_id),
            ));
        }
        if let Some(parent) = &message.parent_id {
            if !self.index.contains_key(parent) {
                return Err(ParleyError::invalid(
                    "parent_id",
                    format!("{parent} is not in conversation {}", self.id),
                ));
            }
            self.children
                .entry(parent.clone())
                .or_default()
                .push(message.message_id.clone());
        }

        self.index.insert(message.message_id.clone(), self.messages.len());
        self.messages.push(message);
        Ok(())
    }

    pub fn get(&self, id: &MessageId) -> Option<&Arc<Message>> {
        self.index.get(id).map(|&pos| &self.messages[pos])
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.index.contains_key(id)
    }

    /// Messages in append order
    pub fn messages(&self) -> &[Arc<Message>] {
        &self.messages
    }

    pub fn roots(&self) -> Vec<Arc<Message>> {
        self.messages.iter().filter(|m| m.is_root()).cloned().collect()
    }

    /// Direct replies to `id`, in append order
    pub fn children(&self, id: &MessageId) -> Vec<Arc<Message>> {
        self.children
            .get(id)
            .map(|ids| ids.iter().filter_map(|c| self.get(c).cloned()).collect())
            .unwrap_or_default()
    }

    /// Root-to-`id` path, empty when `id` is unknown
    pub fn path_to(&self, id: &MessageId) -> Vec<Arc<Message>> {
        let mut path = Vec::new();
        let mut cursor = self.get(id);
        while let Some(message) = cursor {
            path.push(Arc::clone(message));
            cursor = message.parent_id.as_ref().and_then(|p| self.get(p));
        }
        path.reverse();
        path
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Ancestor-to-descendant path ending at one message
///
/// Nothing is resolved until iteration, and every call to [`Chain::iter`]
/// restarts from the root. Conversations are append-only, so the path for a
/// given message only changes when the conversation is reloaded.
#[derive(Clone)]
pub struct Chain {
    conversation: Arc<Mutex<Conversation>>,
    tip: MessageId,
}

impl Chain {
    pub fn tip(&self) -> &MessageId {
        &self.tip
    }

    pub fn iter(&self) -> std::vec::IntoIter<Arc<Message>> {
        self.conversation.lock().path_to(&self.tip).into_iter()
    }

    pub fn to_vec(&self) -> Vec<Arc<Message>> {
        self.iter().collect()
    }

    pub fn ids(&self) -> Vec<MessageId> {
        self.iter().map(|m| m.message_id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.iter().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain").field("tip", &self.tip).finish()
    }
}

impl IntoIterator for &Chain {
    type Item = Arc<Message>;
    type IntoIter = std::vec::IntoIter<Arc<Message>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Durable form of a conversation
#[derive(Debug, Serialize, Deserialize)]
struct ConversationRecord {
    format: u32,
    schema_version: SchemaVersion,
    conversation_id: ConversationId,
    saved_at: i64,
    messages: Vec<Message>,
}

/// Outcome of a successful save
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveReport {
    pub conversation_id: ConversationId,
    pub messages: usize,
    pub bytes: usize,
    pub compressed: bool,
}

/// Thread-safe store of all conversations
pub struct ConversationStore {
    conversations: RwLock<HashMap<ConversationId, Arc<Mutex<Conversation>>>>,
    message_index: RwLock<HashMap<MessageId, ConversationId>>,
    storage: Arc<dyn ConversationStorage>,
    compression_threshold: usize,
}

impl ConversationStore {
    pub fn new(storage: Arc<dyn ConversationStorage>, compression_threshold: usize) -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            message_index: RwLock::new(HashMap::new()),
            storage,
            compression_threshold,
        }
    }

    /// Store backed by [`MemoryStorage`]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new(5)), 64 * 1024)
    }

    pub fn storage(&self) -> &Arc<dyn ConversationStorage> {
        &self.storage
    }

    fn handle(&self, id: &ConversationId) -> Option<Arc<Mutex<Conversation>>> {
        self.conversations.read().get(id).cloned()
    }

    /// Append a message, creating its conversation on first use
    pub fn add_message(&self, message: Message) -> Result<Arc<Message>> {
        let message = Arc::new(message);
        let message_id = message.message_id.clone();
        let conversation_id = message.conversation_id.clone();

        // reserve the id globally before touching the conversation
        {
            let mut index = self.message_index.write();
            if let Some(owner) = index.get(&message_id) {
                return Err(ParleyError::invalid(
                    "message_id",
                    format!("duplicate id {message_id} (already in {owner})"),
                ));
            }
            index.insert(message_id.clone(), conversation_id.clone());
        }

        let outcome = match self.handle(&conversation_id) {
            Some(handle) => handle.lock().append(Arc::clone(&message)),
            None if message.parent_id.is_some() => Err(ParleyError::invalid(
                "parent_id",
                format!("conversation {conversation_id} does not exist"),
            )),
            None => {
                let handle = Arc::clone(
                    self.conversations
                        .write()
                        .entry(conversation_id.clone())
                        .or_insert_with(|| {
                            Arc::new(Mutex::new(Conversation::new(conversation_id.clone())))
                        }),
                );
                let appended = handle.lock().append(Arc::clone(&message));
                appended
            }
        };

        match outcome {
            Ok(()) => {
                debug!(
                    conversation_id = %conversation_id,
                    message_id = %message_id,
                    "Appended message"
                );
                Ok(message)
            }
            Err(err) => {
                self.message_index.write().remove(&message_id);
                Err(err)
            }
        }
    }

    /// Snapshot of a conversation
    pub fn get_conversation(&self, id: &ConversationId) -> Option<Conversation> {
        self.handle(id).map(|handle| handle.lock().clone())
    }

    pub fn get_message(&self, id: &MessageId) -> Option<Arc<Message>> {
        let conversation_id = self.message_index.read().get(id).cloned()?;
        let handle = self.handle(&conversation_id)?;
        let message = handle.lock().get(id).cloned();
        message
    }

    /// Thought chain ending at `message_id`
    pub fn get_chain(&self, message_id: &MessageId) -> Result<Chain> {
        let conversation_id = self
            .message_index
            .read()
            .get(message_id)
            .cloned()
            .ok_or_else(|| ParleyError::NotFound(format!("message {message_id}")))?;
        let conversation = self
            .handle(&conversation_id)
            .ok_or_else(|| ParleyError::NotFound(format!("conversation {conversation_id}")))?;

        Ok(Chain {
            conversation,
            tip: message_id.clone(),
        })
    }

    /// Direct replies to a message
    pub fn children(&self, message_id: &MessageId) -> Vec<Arc<Message>> {
        let Some(conversation_id) = self.message_index.read().get(message_id).cloned() else {
            return Vec::new();
        };
        self.handle(&conversation_id)
            .map(|handle| handle.lock().children(message_id))
            .unwrap_or_default()
    }

    pub fn list_conversations(&self) -> Vec<ConversationId> {
        let mut ids: Vec<_> = self.conversations.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Remove a conversation from memory; persisted copies are untouched
    pub fn cleanup(&self, id: &ConversationId) -> bool {
        let Some(handle) = self.conversations.write().remove(id) else {
            return false;
        };

        let ids: Vec<MessageId> = handle
            .lock()
            .messages()
            .iter()
            .map(|m| m.message_id.clone())
            .collect();
        let mut index = self.message_index.write();
        for message_id in ids {
            index.remove(&message_id);
        }

        info!(conversation_id = %id, "Conversation cleaned up");
        true
    }

    /// Persist a conversation through the storage port.
    ///
    /// The conversation stays locked from snapshot until the storage write
    /// returns, so saves of one conversation land in order.
    pub fn save(&self, id: &ConversationId) -> Result<SaveReport> {
        let handle = self
            .handle(id)
            .ok_or_else(|| ParleyError::NotFound(format!("conversation {id}")))?;
        let conversation = handle.lock();

        let messages: Vec<Message> = conversation
            .messages()
            .iter()
            .map(|m| Message::clone(m))
            .collect();

        let record = ConversationRecord {
            format: RECORD_FORMAT,
            schema_version: SchemaVersion::CURRENT,
            conversation_id: id.clone(),
            saved_at: chrono::Utc::now().timestamp_millis(),
            messages,
        };
        let serialized = serde_json::to_vec(&record)
            .map_err(|e| ParleyError::persistence(id, format!("serialization failed: {e}")))?;
        let blob = StoredBlob::encode(id, serialized, self.compression_threshold)?;

        if let Err(err) = self.storage.write(id, &blob) {
            warn!(conversation_id = %id, error = %err, "Failed to save conversation");
            return Err(err);
        }
        drop(conversation);

        let report = SaveReport {
            conversation_id: id.clone(),
            messages: record.messages.len(),
            bytes: blob.bytes.len(),
            compressed: blob.compressed,
        };
        info!(
            conversation_id = %id,
            messages = report.messages,
            bytes = report.bytes,
            compressed = report.compressed,
            "Conversation saved"
        );
        Ok(report)
    }

    /// Rebuild a conversation from storage, replacing any in-memory copy.
    ///
    /// The record is fully decoded and validated first; on any error the
    /// in-memory state is left as it was. An existing conversation is
    /// overwritten in place, so handles taken earlier see the loaded copy.
    pub fn load(&self, id: &ConversationId) -> Result<Conversation> {
        let blob = self.storage.read(id)?;
        let bytes = blob.decode(id)?;
        let record: ConversationRecord = serde_json::from_slice(&bytes)
            .map_err(|e| ParleyError::persistence(id, format!("unreadable record: {e}")))?;

        if record.format != RECORD_FORMAT {
            return Err(ParleyError::persistence(
                id,
                format!("unsupported record format {}", record.format),
            ));
        }
        if &record.conversation_id != id {
            return Err(ParleyError::persistence(
                id,
                format!("record belongs to {}", record.conversation_id),
            ));
        }
        for message in &record.messages {
            schema::validate(message).map_err(|e| ParleyError::persistence(id, e))?;
        }
        let conversation = Conversation::from_messages(id.clone(), record.messages)
            .map_err(|e| ParleyError::persistence(id, e))?;

        {
            let mut index = self.message_index.write();
            if let Some(clash) = conversation.messages().iter().find(|m| {
                index
                    .get(&m.message_id)
                    .is_some_and(|owner| owner != id)
            }) {
                return Err(ParleyError::persistence(
                    id,
                    format!("message {} already belongs to another conversation", clash.message_id),
                ));
            }

            let handle = Arc::clone(
                self.conversations
                    .write()
                    .entry(id.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(Conversation::new(id.clone())))),
            );
            let mut current = handle.lock();
            // ids reserved by in-flight appends stay indexed
            for message in current.messages() {
                index.remove(&message.message_id);
            }
            for message in conversation.messages() {
                index.insert(message.message_id.clone(), id.clone());
            }
            *current = conversation.clone();
        }

        info!(conversation_id = %id, messages = conversation.len(), "Conversation loaded");
        Ok(conversation)
    }

    /// Conversation ids known to the storage backend
    pub fn list_persisted(&self) -> Result<Vec<ConversationId>> {
        self.storage.list()
    }
}

impl std::fmt::Debug for ConversationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationStore")
            .field("conversations", &self.conversations.read().len())
            .field("compression_threshold", &self.compression_threshold)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use serde_json::json;

    fn msg(id: &str, conversation: &str, parent: Option<&str>) -> Message {
        let builder = Message::builder("agent", MessageType::Log, conversation)
            .id(id)
            .content(json!({"text": format!("message {id}")}));
        match parent {
            Some(p) => builder.parent(p).build(),
            None => builder.build(),
        }
    }

    fn ids(messages: &[Arc<Message>]) -> Vec<&str> {
        messages.iter().map(|m| m.message_id.as_str()).collect()
    }

    // === Threading Tests ===

    #[test]
    fn test_creates_conversation_on_first_message() {
        let store = ConversationStore::in_memory();
        store.add_message(msg("m1", "c1", None)).unwrap();

        assert_eq!(store.list_conversations(), vec![ConversationId::from("c1")]);
        assert_eq!(store.get_conversation(&"c1".into()).unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_parent_rejected_without_side_effects() {
        let store = ConversationStore::in_memory();
        store.add_message(msg("m1", "c1", None)).unwrap();

        let err = store.add_message(msg("m2", "c1", Some("missing"))).unwrap_err();
        assert!(err.is_validation());
        assert!(store.get_message(&"m2".into()).is_none());

        // retrying with the same id after a rejection must work
        store.add_message(msg("m2", "c1", Some("m1"))).unwrap();
    }

    #[test]
    fn test_parent_in_other_conversation_rejected() {
        let store = ConversationStore::in_memory();
        store.add_message(msg("m1", "c1", None)).unwrap();

        assert!(store.add_message(msg("m2", "c2", Some("m1"))).is_err());
        assert!(store.get_conversation(&"c2".into()).is_none());
    }

    #[test]
    fn test_duplicate_id_rejected_across_conversations() {
        let store = ConversationStore::in_memory();
        store.add_message(msg("m1", "c1", None)).unwrap();

        assert!(store.add_message(msg("m1", "c1", None)).is_err());
        assert!(store.add_message(msg("m1", "c2", None)).is_err());
    }

    #[test]
    fn test_chain_is_root_to_tip_path() {
        let store = ConversationStore::in_memory();
        store.add_message(msg("root", "c1", None)).unwrap();
        store.add_message(msg("a", "c1", Some("root"))).unwrap();
        store.add_message(msg("b", "c1", Some("root"))).unwrap();
        store.add_message(msg("a1", "c1", Some("a"))).unwrap();

        let chain = store.get_chain(&"a1".into()).unwrap();
        assert_eq!(ids(&chain.to_vec()), vec!["root", "a", "a1"]);

        // restartable
        assert_eq!(chain.iter().count(), 3);
        assert_eq!((&chain).into_iter().count(), 3);

        let children = store.children(&"root".into());
        assert_eq!(ids(&children), vec!["a", "b"]);
    }

    #[test]
    fn test_chain_unknown_message() {
        let store = ConversationStore::in_memory();
        assert!(matches!(
            store.get_chain(&"nope".into()),
            Err(ParleyError::NotFound(_))
        ));
    }

    #[test]
    fn test_cleanup_releases_ids() {
        let store = ConversationStore::in_memory();
        store.add_message(msg("m1", "c1", None)).unwrap();

        assert!(store.cleanup(&"c1".into()));
        assert!(store.get_conversation(&"c1".into()).is_none());
        assert!(!store.cleanup(&"c1".into()));
        store.add_message(msg("m1", "c9", None)).unwrap();
    }

    // === Persistence Tests ===

    #[test]
    fn test_save_then_load_round_trip() {
        let store = ConversationStore::in_memory();
        store.add_message(msg("m1", "c1", None)).unwrap();
        store.add_message(msg("m2", "c1", Some("m1"))).unwrap();
        store.add_message(msg("m3", "c1", Some("m1"))).unwrap();
        let before = store.get_conversation(&"c1".into()).unwrap();

        let report = store.save(&"c1".into()).unwrap();
        assert_eq!(report.messages, 3);
        assert!(!report.compressed);

        store.cleanup(&"c1".into());
        let loaded = store.load(&"c1".into()).unwrap();

        let original: Vec<&Message> = before.messages().iter().map(|m| m.as_ref()).collect();
        let restored: Vec<&Message> = loaded.messages().iter().map(|m| m.as_ref()).collect();
        assert_eq!(original, restored);
        assert_eq!(
            ids(&store.get_chain(&"m3".into()).unwrap().to_vec()),
            vec!["m1", "m3"]
        );
    }

    #[test]
    fn test_round_trip_across_compression_threshold() {
        let store = ConversationStore::new(Arc::new(MemoryStorage::new(2)), 256);
        store.add_message(msg("m1", "c1", None)).unwrap();
        for i in 2..40 {
            let parent = format!("m{}", i - 1);
            store
                .add_message(msg(&format!("m{i}"), "c1", Some(&parent)))
                .unwrap();
        }
        let before = store.get_conversation(&"c1".into()).unwrap();

        let report = store.save(&"c1".into()).unwrap();
        assert!(report.compressed);

        let loaded = store.load(&"c1".into()).unwrap();
        assert_eq!(loaded.len(), before.len());
        for (a, b) in before.messages().iter().zip(loaded.messages()) {
            assert_eq!(a.as_ref(), b.as_ref());
        }
        assert_eq!(store.get_chain(&"m39".into()).unwrap().len(), 39);
    }

    #[test]
    fn test_corrupt_record_leaves_memory_untouched() {
        let storage = Arc::new(MemoryStorage::new(2));
        let store = ConversationStore::new(storage.clone(), 1024);
        store.add_message(msg("m1", "c1", None)).unwrap();

        storage
            .write(
                &"c1".into(),
                &StoredBlob {
                    bytes: b"{ not json".to_vec(),
                    compressed: false,
                },
            )
            .unwrap();

        let err = store.load(&"c1".into()).unwrap_err();
        assert!(matches!(err, ParleyError::Persistence { .. }));
        assert_eq!(store.get_conversation(&"c1".into()).unwrap().len(), 1);
    }

    #[test]
    fn test_record_with_dangling_parent_rejected() {
        let storage = Arc::new(MemoryStorage::new(2));
        let store = ConversationStore::new(storage.clone(), 1024);

        let record = ConversationRecord {
            format: RECORD_FORMAT,
            schema_version: SchemaVersion::CURRENT,
            conversation_id: "c1".into(),
            saved_at: 0,
            messages: vec![msg("m2", "c1", Some("m1"))],
        };
        storage
            .write(
                &"c1".into(),
                &StoredBlob {
                    bytes: serde_json::to_vec(&record).unwrap(),
                    compressed: false,
                },
            )
            .unwrap();

        assert!(matches!(
            store.load(&"c1".into()),
            Err(ParleyError::Persistence { .. })
        ));
        assert!(store.get_conversation(&"c1".into()).is_none());
    }

    #[test]
    fn test_load_missing_conversation() {
        let store = ConversationStore::in_memory();
        assert!(matches!(
            store.load(&"ghost".into()),
            Err(ParleyError::Persistence { .. })
        ));
    }

    #[test]
    fn test_save_unknown_conversation() {
        let store = ConversationStore::in_memory();
        assert!(matches!(
            store.save(&"ghost".into()),
            Err(ParleyError::NotFound(_))
        ));
    }

    #[test]
    fn test_load_replaces_contents_in_place() {
        let store = ConversationStore::in_memory();
        store.add_message(msg("m1", "c1", None)).unwrap();
        store.add_message(msg("m2", "c1", Some("m1"))).unwrap();
        store.save(&"c1".into()).unwrap();
        store.add_message(msg("m3", "c1", Some("m2"))).unwrap();

        let before = store.handle(&"c1".into()).unwrap();
        let chain = store.get_chain(&"m2".into()).unwrap();
        let loaded = store.load(&"c1".into()).unwrap();
        assert_eq!(loaded.len(), 2);

        let after = store.handle(&"c1".into()).unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(before.lock().len(), 2);
        assert_eq!(ids(&chain.to_vec()), vec!["m1", "m2"]);

        // the dropped message no longer holds its id
        assert!(store.get_message(&"m3".into()).is_none());
        store.add_message(msg("m3", "c1", Some("m2"))).unwrap();
        assert_eq!(ids(&store.get_chain(&"m3".into()).unwrap().to_vec()), vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn test_concurrent_saves_of_one_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(crate::storage::FileStorage::new(dir.path(), 3).unwrap());
        let store = Arc::new(ConversationStore::new(storage, 64 * 1024));
        store.add_message(msg("m1", "c1", None)).unwrap();
        for i in 2..400 {
            let parent = format!("m{}", i - 1);
            store
                .add_message(msg(&format!("m{i}"), "c1", Some(&parent)))
                .unwrap();
        }

        let savers: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    (0..30)
                        .filter(|_| store.save(&"c1".into()).is_err())
                        .count()
                })
            })
            .collect();
        let failures: usize = savers.into_iter().map(|s| s.join().unwrap()).sum();
        assert_eq!(failures, 0);

        store.cleanup(&"c1".into());
        assert_eq!(store.load(&"c1".into()).unwrap().len(), 399);
    }

    #[test]
    fn test_save_writes_backups() {
        let storage = Arc::new(MemoryStorage::new(2));
        let store = ConversationStore::new(storage.clone(), 1024);
        store.add_message(msg("m1", "c1", None)).unwrap();

        for _ in 0..3 {
            store.save(&"c1".into()).unwrap();
        }
        assert_eq!(storage.backups(&"c1".into()).unwrap().len(), 2);
        assert_eq!(store.list_persisted().unwrap(), vec![ConversationId::from("c1")]);
    }
}
