//! Message bus
//!
//! `publish` validates a message, appends it to its conversation, then
//! pushes it onto the queue of every matching subscriber. Handler-style
//! subscribers get a delivery worker task that drains the queue in priority
//! order; inbox subscribers pull from the queue themselves.
//!
//! Routing and delivery failures never surface as errors from `publish`.
//! They are logged and broadcast as [`BusEvent`]s.

use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::{BusConfig, ParleyConfig};
use crate::conversation::{Chain, Conversation, ConversationStore};
use crate::error::{ParleyError, Result};
use crate::mailbox::{Enqueued, Inbox, Mailbox};
use crate::message::{AgentId, ConversationId, Message, MessageId, MessageType};
use crate::registry::{HandlerTable, MessageHandler, NewWorker, SubscriptionRegistry};
use crate::schema;
use crate::storage::ConversationStorage;

/// Observability events emitted by the bus
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BusEvent {
    Published {
        message_id: MessageId,
        conversation_id: ConversationId,
        message_type: MessageType,
        recipients: usize,
    },
    RoutingFailed {
        message_id: MessageId,
        receiver: AgentId,
        message_type: MessageType,
    },
    DeliveryFailed {
        agent_id: AgentId,
        message_id: MessageId,
        reason: String,
    },
    /// A queued or incoming message was discarded under backpressure
    Dropped {
        agent_id: AgentId,
        message_id: MessageId,
    },
}

/// Overall outcome of a publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Queued for at least one subscriber
    Delivered,
    /// Broadcast that nobody subscribes to
    NoRecipients,
    /// Directed message with no matching subscriber, or every queue refused it
    Failed,
}

/// Entry discarded from a subscriber queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DroppedEntry {
    pub agent_id: AgentId,
    pub message_id: MessageId,
}

/// What `publish` did with a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub message_id: MessageId,
    pub status: DeliveryStatus,
    pub recipients: Vec<AgentId>,
    pub dropped: Vec<DroppedEntry>,
}

impl PublishReport {
    pub fn is_delivered(&self) -> bool {
        self.status == DeliveryStatus::Delivered
    }
}

/// In-process message bus shared by the orchestrator and agents
pub struct MessageBus {
    registry: SubscriptionRegistry,
    store: Arc<ConversationStore>,
    events: broadcast::Sender<BusEvent>,
}

impl MessageBus {
    pub fn new(config: &BusConfig, store: Arc<ConversationStore>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            registry: SubscriptionRegistry::new(config.queue_capacity, config.backpressure),
            store,
            events,
        }
    }

    /// Bus and conversation store wired from one configuration
    pub fn from_config(config: &ParleyConfig, storage: Arc<dyn ConversationStorage>) -> Self {
        let store = ConversationStore::new(storage, config.storage.compression_threshold_bytes);
        Self::new(&config.bus, Arc::new(store))
    }

    /// Default configuration over in-memory storage
    pub fn in_memory() -> Self {
        Self::new(&BusConfig::default(), Arc::new(ConversationStore::in_memory()))
    }

    /// Register `handler` for `types` under `agent_id`.
    ///
    /// Must be called inside a tokio runtime; the first subscription of an
    /// agent spawns its delivery worker.
    pub fn subscribe(
        &self,
        agent_id: impl Into<AgentId>,
        types: &[MessageType],
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let agent_id = agent_id.into();
        let runtime = Handle::try_current().map_err(|_| {
            ParleyError::Subscription(format!(
                "{agent_id}: handler subscriptions need a tokio runtime"
            ))
        })?;

        if let Some(worker) = self.registry.register_handlers(&agent_id, types, handler)? {
            let NewWorker { mailbox, handlers } = worker;
            runtime.spawn(run_delivery_worker(
                agent_id.clone(),
                mailbox,
                handlers,
                self.events.clone(),
            ));
        }

        info!(agent_id = %agent_id, ?types, "Agent subscribed");
        Ok(())
    }

    /// Register a pull-style subscription and return its inbox
    pub fn subscribe_inbox(&self, agent_id: impl Into<AgentId>, types: &[MessageType]) -> Result<Inbox> {
        let agent_id = agent_id.into();
        let inbox = self.registry.register_inbox(&agent_id, types)?;
        info!(agent_id = %agent_id, ?types, "Agent subscribed with inbox");
        Ok(inbox)
    }

    /// Remove `types`, or the whole subscription when `None`
    pub fn unsubscribe(&self, agent_id: &AgentId, types: Option<&[MessageType]>) -> bool {
        let removed = self.registry.remove(agent_id, types);
        if removed {
            info!(agent_id = %agent_id, ?types, "Agent unsubscribed");
        }
        removed
    }

    /// Validate, store and route a message
    pub async fn publish(&self, message: Message) -> Result<PublishReport> {
        schema::validate(&message)?;
        let message = self.store.add_message(message)?;
        let targets = self.registry.route(&message);

        if targets.is_empty() {
            return Ok(self.unrouted(&message));
        }

        let mut recipients = Vec::with_capacity(targets.len());
        let mut dropped = Vec::new();
        for (agent_id, mailbox) in targets {
            match mailbox.push(Arc::clone(&message)).await {
                Ok(Enqueued::Accepted) => recipients.push(agent_id),
                Ok(Enqueued::Evicted(victim)) => {
                    self.report_drop(&agent_id, &victim.message_id, &mut dropped);
                    recipients.push(agent_id);
                }
                Ok(Enqueued::Rejected) => {
                    self.report_drop(&agent_id, &message.message_id, &mut dropped);
                }
                Err(err) => {
                    // unsubscribed between routing and push
                    warn!(agent_id = %agent_id, message_id = %message.message_id, error = %err, "Delivery failed");
                    let _ = self.events.send(BusEvent::DeliveryFailed {
                        agent_id,
                        message_id: message.message_id.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        debug!(
            message_id = %message.message_id,
            conversation_id = %message.conversation_id,
            message_type = %message.message_type,
            recipients = recipients.len(),
            "Message published"
        );
        let _ = self.events.send(BusEvent::Published {
            message_id: message.message_id.clone(),
            conversation_id: message.conversation_id.clone(),
            message_type: message.message_type,
            recipients: recipients.len(),
        });

        let status = if recipients.is_empty() {
            DeliveryStatus::Failed
        } else {
            DeliveryStatus::Delivered
        };
        Ok(PublishReport {
            message_id: message.message_id.clone(),
            status,
            recipients,
            dropped,
        })
    }

    fn unrouted(&self, message: &Message) -> PublishReport {
        let status = match &message.receiver {
            Some(receiver) => {
                let err = ParleyError::Routing {
                    message_id: message.message_id.clone(),
                    receiver: receiver.clone(),
                };
                warn!(error = %err, message_type = %message.message_type, "Routing failed");
                let _ = self.events.send(BusEvent::RoutingFailed {
                    message_id: message.message_id.clone(),
                    receiver: receiver.clone(),
                    message_type: message.message_type,
                });
                DeliveryStatus::Failed
            }
            None => {
                debug!(message_id = %message.message_id, "Broadcast has no subscribers");
                DeliveryStatus::NoRecipients
            }
        };

        let _ = self.events.send(BusEvent::Published {
            message_id: message.message_id.clone(),
            conversation_id: message.conversation_id.clone(),
            message_type: message.message_type,
            recipients: 0,
        });
        PublishReport {
            message_id: message.message_id.clone(),
            status,
            recipients: Vec::new(),
            dropped: Vec::new(),
        }
    }

    fn report_drop(&self, agent_id: &AgentId, message_id: &MessageId, dropped: &mut Vec<DroppedEntry>) {
        warn!(agent_id = %agent_id, message_id = %message_id, "Queue full, message dropped");
        let _ = self.events.send(BusEvent::Dropped {
            agent_id: agent_id.clone(),
            message_id: message_id.clone(),
        });
        dropped.push(DroppedEntry {
            agent_id: agent_id.clone(),
            message_id: message_id.clone(),
        });
    }

    /// Parse a raw JSON envelope and publish it
    pub async fn publish_json(&self, document: &Value) -> Result<PublishReport> {
        let message = schema::parse_envelope(document)?;
        self.publish(message).await
    }

    pub fn get_conversation(&self, id: &ConversationId) -> Option<Conversation> {
        self.store.get_conversation(id)
    }

    pub fn get_chain(&self, message_id: &MessageId) -> Result<Chain> {
        self.store.get_chain(message_id)
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Receive bus events emitted from now on
    pub fn events(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("registry", &self.registry)
            .field("store", &self.store)
            .finish()
    }
}

/// Drains one subscriber queue into its handlers until the queue closes
async fn run_delivery_worker(
    agent_id: AgentId,
    mailbox: Arc<Mailbox>,
    handlers: HandlerTable,
    events: broadcast::Sender<BusEvent>,
) {
    debug!(agent_id = %agent_id, "Delivery worker started");

    while let Some(message) = mailbox.pop().await {
        let handler = handlers.read().get(&message.message_type).cloned();
        let Some(handler) = handler else {
            // type removed after the message was queued
            continue;
        };

        let outcome = std::panic::AssertUnwindSafe(handler.handle(Arc::clone(&message)))
            .catch_unwind()
            .await;
        let reason = match outcome {
            Ok(Ok(())) => continue,
            Ok(Err(err)) => format!("{err:#}"),
            Err(panic) => panic_reason(panic.as_ref()),
        };

        let err = ParleyError::Delivery {
            agent_id: agent_id.clone(),
            message_id: message.message_id.clone(),
            reason: reason.clone(),
        };
        warn!(error = %err, "Handler failed");
        let _ = events.send(BusEvent::DeliveryFailed {
            agent_id: agent_id.clone(),
            message_id: message.message_id.clone(),
            reason,
        });
    }

    debug!(agent_id = %agent_id, "Delivery worker stopped");
}

fn panic_reason(payload: &(dyn std::any::Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("handler panicked: {detail}")
}
