//! Subscription registry
//!
//! Maps each agent id to the message types it accepts and to where those
//! messages go: a table of typed handlers drained by a delivery worker, or a
//! pull [`Inbox`]. Guarded by a single read-mostly lock.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::error::{ParleyError, Result};
use crate::mailbox::{BackpressurePolicy, Inbox, Mailbox};
use crate::message::{AgentId, Message, MessageType};

/// Receives messages of the types it was registered for
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Arc<Message>) -> anyhow::Result<()>;
}

/// Adapter turning a synchronous closure into a [`MessageHandler`]
pub struct FnHandler<F>(F);

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(Arc<Message>) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, message: Arc<Message>) -> anyhow::Result<()> {
        (self.0)(message)
    }
}

/// Wrap a closure as a shareable handler
pub fn handler_fn<F>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Arc<Message>) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Forwards every delivery into an unbounded channel
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<Arc<Message>>,
}

impl ChannelHandler {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Arc<Message>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl MessageHandler for ChannelHandler {
    async fn handle(&self, message: Arc<Message>) -> anyhow::Result<()> {
        self.tx
            .send(message)
            .map_err(|_| anyhow::anyhow!("handler channel closed"))
    }
}

/// Handlers keyed by message type, shared with the delivery worker
pub type HandlerTable = Arc<RwLock<HashMap<MessageType, Arc<dyn MessageHandler>>>>;

/// Where a subscription's messages end up
#[derive(Clone)]
pub enum DeliveryTarget {
    Handlers(HandlerTable),
    Inbox,
}

impl DeliveryTarget {
    fn kind(&self) -> &'static str {
        match self {
            Self::Handlers(_) => "handlers",
            Self::Inbox => "inbox",
        }
    }
}

impl fmt::Debug for DeliveryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handlers(table) => {
                let types: BTreeSet<_> = table.read().keys().copied().collect();
                f.debug_tuple("Handlers").field(&types).finish()
            }
            Self::Inbox => f.write_str("Inbox"),
        }
    }
}

/// One agent's subscription
#[derive(Debug, Clone)]
pub struct Subscription {
    pub agent_id: AgentId,
    pub types: BTreeSet<MessageType>,
    pub target: DeliveryTarget,
    mailbox: Arc<Mailbox>,
}

impl Subscription {
    pub fn accepts(&self, message_type: MessageType) -> bool {
        self.types.contains(&message_type)
    }

    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }
}

/// Newly created handler subscription that needs a delivery worker
pub(crate) struct NewWorker {
    pub mailbox: Arc<Mailbox>,
    pub handlers: HandlerTable,
}

/// Registry of all subscriptions on a bus
pub struct SubscriptionRegistry {
    subscriptions: RwLock<HashMap<AgentId, Subscription>>,
    queue_capacity: usize,
    policy: BackpressurePolicy,
}

impl SubscriptionRegistry {
    pub fn new(queue_capacity: usize, policy: BackpressurePolicy) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            queue_capacity,
            policy,
        }
    }

    fn check_agent(agent_id: &AgentId) -> Result<()> {
        if agent_id.is_empty() {
            return Err(ParleyError::invalid("agent_id", "must not be empty"));
        }
        Ok(())
    }

    fn new_mailbox(&self, agent_id: &AgentId) -> Arc<Mailbox> {
        Arc::new(Mailbox::new(agent_id.clone(), self.queue_capacity, self.policy))
    }

    /// Register `handler` for each of `types`, merging into any existing subscription.
    ///
    /// Returns the worker inputs when the subscription is new.
    pub(crate) fn register_handlers(
        &self,
        agent_id: &AgentId,
        types: &[MessageType],
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Option<NewWorker>> {
        Self::check_agent(agent_id)?;
        let mut subs = self.subscriptions.write();

        if let Some(existing) = subs.get_mut(agent_id) {
            let DeliveryTarget::Handlers(table) = &existing.target else {
                return Err(ParleyError::Subscription(format!(
                    "{agent_id} is already subscribed with an {} target",
                    existing.target.kind()
                )));
            };
            let mut table = table.write();
            for ty in types {
                table.insert(*ty, Arc::clone(&handler));
                existing.types.insert(*ty);
            }
            return Ok(None);
        }

        let table: HandlerTable = Arc::new(RwLock::new(
            types.iter().map(|ty| (*ty, Arc::clone(&handler))).collect(),
        ));
        let mailbox = self.new_mailbox(agent_id);
        subs.insert(
            agent_id.clone(),
            Subscription {
                agent_id: agent_id.clone(),
                types: types.iter().copied().collect(),
                target: DeliveryTarget::Handlers(Arc::clone(&table)),
                mailbox: Arc::clone(&mailbox),
            },
        );

        Ok(Some(NewWorker {
            mailbox,
            handlers: table,
        }))
    }

    /// Register or extend a pull-style subscription
    pub(crate) fn register_inbox(&self, agent_id: &AgentId, types: &[MessageType]) -> Result<Inbox> {
        Self::check_agent(agent_id)?;
        let mut subs = self.subscriptions.write();

        if let Some(existing) = subs.get_mut(agent_id) {
            if !matches!(existing.target, DeliveryTarget::Inbox) {
                return Err(ParleyError::Subscription(format!(
                    "{agent_id} is already subscribed with a {} target",
                    existing.target.kind()
                )));
            }
            existing.types.extend(types.iter().copied());
            return Ok(Inbox::new(Arc::clone(&existing.mailbox)));
        }

        let mailbox = self.new_mailbox(agent_id);
        subs.insert(
            agent_id.clone(),
            Subscription {
                agent_id: agent_id.clone(),
                types: types.iter().copied().collect(),
                target: DeliveryTarget::Inbox,
                mailbox: Arc::clone(&mailbox),
            },
        );
        Ok(Inbox::new(mailbox))
    }

    /// Drop some types, or the whole subscription when `types` is `None`.
    ///
    /// A subscription left with no types is removed and its queue closed.
    pub fn remove(&self, agent_id: &AgentId, types: Option<&[MessageType]>) -> bool {
        let mut subs = self.subscriptions.write();
        let Some(existing) = subs.get_mut(agent_id) else {
            return false;
        };

        if let Some(types) = types {
            for ty in types {
                existing.types.remove(ty);
                if let DeliveryTarget::Handlers(table) = &existing.target {
                    table.write().remove(ty);
                }
            }
            if !existing.types.is_empty() {
                return true;
            }
        }

        if let Some(removed) = subs.remove(agent_id) {
            removed.mailbox.close();
        }
        true
    }

    /// Resolve the queues a message should be pushed to
    pub fn route(&self, message: &Message) -> Vec<(AgentId, Arc<Mailbox>)> {
        let subs = self.subscriptions.read();
        match &message.receiver {
            Some(receiver) => subs
                .get(receiver)
                .filter(|sub| sub.accepts(message.message_type))
                .map(|sub| vec![(sub.agent_id.clone(), Arc::clone(&sub.mailbox))])
                .unwrap_or_default(),
            None => {
                let mut targets: Vec<_> = subs
                    .values()
                    .filter(|sub| sub.agent_id != message.sender && sub.accepts(message.message_type))
                    .map(|sub| (sub.agent_id.clone(), Arc::clone(&sub.mailbox)))
                    .collect();
                targets.sort_by(|a, b| a.0.cmp(&b.0));
                targets
            }
        }
    }

    pub fn get(&self, agent_id: &AgentId) -> Option<Subscription> {
        self.subscriptions.read().get(agent_id).cloned()
    }

    pub fn accepted_types(&self, agent_id: &AgentId) -> BTreeSet<MessageType> {
        self.subscriptions
            .read()
            .get(agent_id)
            .map(|sub| sub.types.clone())
            .unwrap_or_default()
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<_> = self.subscriptions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.read().is_empty()
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("agents", &self.agent_ids())
            .field("queue_capacity", &self.queue_capacity)
            .field("policy", &self.policy)
            .finish()
    }
}
