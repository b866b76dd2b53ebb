//! Agent endpoint - the worker side of the task protocol
//!
//! Wraps an inbox subscription and enforces the one rule every agent must
//! follow: each task request gets exactly one terminal reply, either
//! `task-result` or `error`, threaded under the request. A request that was
//! cancelled is owed nothing, and answering it is an error.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, info, instrument};

use crate::bus::{MessageBus, PublishReport};
use crate::error::{ParleyError, Result};
use crate::mailbox::Inbox;
use crate::message::{AgentId, Message, MessageId, MessageType};
use crate::workflow::{DispatchPayload, TaskId};

/// Types an agent subscribes to on connect
pub const AGENT_TYPES: [MessageType; 3] = [
    MessageType::TaskRequest,
    MessageType::Status,
    MessageType::Query,
];

/// A task request together with its decoded payload
#[derive(Debug, Clone)]
pub struct TaskAssignment {
    pub request: Arc<Message>,
    /// `None` when the request did not come from an orchestrator
    pub payload: Option<DispatchPayload>,
}

impl TaskAssignment {
    pub fn request_id(&self) -> &MessageId {
        &self.request.message_id
    }

    pub fn params(&self) -> Option<&Value> {
        self.payload.as_ref().map(|p| &p.params)
    }
}

/// Cooperative request to stop working on a task
#[derive(Debug, Clone)]
pub struct CancelNotice {
    pub message: Arc<Message>,
    /// Dispatch the notice refers to
    pub request_id: Option<MessageId>,
    pub task_id: Option<TaskId>,
    pub reason: String,
}

/// What an agent pulled off its inbox
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Task(TaskAssignment),
    Cancel(CancelNotice),
    Other(Arc<Message>),
}

/// A connected agent
pub struct Agent {
    /// Identity on the bus
    pub id: AgentId,
    bus: Arc<MessageBus>,
    inbox: Inbox,
    /// Requests still owed a terminal reply
    open: Mutex<HashSet<MessageId>>,
    /// Cancelled requests and the reason given
    cancelled: Mutex<HashMap<MessageId, String>>,
}

impl Agent {
    /// Subscribe `id` to task requests, status notices and queries
    pub fn connect(bus: Arc<MessageBus>, id: impl Into<AgentId>) -> Result<Self> {
        let id = id.into();
        let inbox = bus.subscribe_inbox(id.clone(), &AGENT_TYPES)?;
        info!(agent_id = %id, "Agent connected");

        Ok(Self {
            id,
            bus,
            inbox,
            open: Mutex::new(HashSet::new()),
            cancelled: Mutex::new(HashMap::new()),
        })
    }

    /// Next event, or `None` once disconnected
    pub async fn recv(&self) -> Option<AgentEvent> {
        let message = self.inbox.recv().await?;
        Some(self.classify(message))
    }

    /// Next event without waiting
    pub fn try_recv(&self) -> Option<AgentEvent> {
        self.inbox.try_recv().map(|m| self.classify(m))
    }

    fn classify(&self, message: Arc<Message>) -> AgentEvent {
        match message.message_type {
            MessageType::TaskRequest => {
                // the notice can overtake its request in a priority queue
                if !self.cancelled.lock().contains_key(&message.message_id) {
                    self.open.lock().insert(message.message_id.clone());
                }
                let payload = DispatchPayload::from_message(&message);
                debug!(agent_id = %self.id, message_id = %message.message_id, "Task received");
                AgentEvent::Task(TaskAssignment {
                    request: message,
                    payload,
                })
            }
            MessageType::Status if message.content_str("signal") == Some("cancel") => {
                let task_id = message
                    .content
                    .get("task_id")
                    .and_then(|v| serde_json::from_value(v.clone()).ok());
                let reason = message.content_str("reason").unwrap_or("cancelled").to_string();
                debug!(agent_id = %self.id, reason = %reason, "Cancellation received");
                if let Some(request_id) = &message.parent_id {
                    self.open.lock().remove(request_id);
                    self.cancelled.lock().insert(request_id.clone(), reason.clone());
                }
                AgentEvent::Cancel(CancelNotice {
                    request_id: message.parent_id.clone(),
                    task_id,
                    reason,
                    message,
                })
            }
            _ => AgentEvent::Other(message),
        }
    }

    /// Requests that have not been answered yet
    pub fn open_requests(&self) -> Vec<MessageId> {
        let mut ids: Vec<_> = self.open.lock().iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Requests withdrawn by a cancellation notice
    pub fn cancelled_requests(&self) -> Vec<MessageId> {
        let mut ids: Vec<_> = self.cancelled.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn take_open(&self, request: &Message) -> Result<()> {
        if self.open.lock().remove(&request.message_id) {
            Ok(())
        } else if let Some(reason) = self.cancelled.lock().remove(&request.message_id) {
            Err(ParleyError::Cancelled(format!(
                "request {} was cancelled: {reason}",
                request.message_id
            )))
        } else {
            Err(ParleyError::InvalidTransition {
                entity: format!("request {}", request.message_id),
                from: "answered".to_string(),
                to: "answered".to_string(),
            })
        }
    }

    async fn answer(&self, request: &Message, reply: Message) -> Result<PublishReport> {
        self.take_open(request)?;
        match self.bus.publish(reply).await {
            Ok(report) => Ok(report),
            Err(err) => {
                // nothing was sent, so the request is still owed a reply
                self.open.lock().insert(request.message_id.clone());
                Err(err)
            }
        }
    }

    /// Send the terminal `task-result` for `request`
    #[instrument(skip(self, request, content), fields(agent_id = %self.id, request_id = %request.message_id))]
    pub async fn complete(&self, request: &Message, content: Value) -> Result<PublishReport> {
        let reply = request
            .reply(self.id.clone(), MessageType::TaskResult)
            .priority(request.priority)
            .content(content)
            .build();
        self.answer(request, reply).await
    }

    /// Send the terminal `error` for `request`
    #[instrument(skip(self, request, error), fields(agent_id = %self.id, request_id = %request.message_id))]
    pub async fn fail(&self, request: &Message, error: impl fmt::Display + Send) -> Result<PublishReport> {
        let reply = request
            .reply(self.id.clone(), MessageType::Error)
            .priority(request.priority)
            .content(json!({"error": error.to_string()}))
            .build();
        self.answer(request, reply).await
    }

    /// Non-terminal progress report for an open request
    pub async fn report_status(
        &self,
        request: &Message,
        progress: Option<f64>,
        activity: &str,
    ) -> Result<PublishReport> {
        if let Some(reason) = self.cancelled.lock().get(&request.message_id) {
            return Err(ParleyError::Cancelled(format!(
                "request {} was cancelled: {reason}",
                request.message_id
            )));
        }
        if !self.open.lock().contains(&request.message_id) {
            return Err(ParleyError::NotFound(format!(
                "open request {}",
                request.message_id
            )));
        }

        let mut content = json!({"activity": activity});
        if let Some(progress) = progress {
            content["progress"] = json!(progress);
        }
        let reply = request
            .reply(self.id.clone(), MessageType::Status)
            .content(content)
            .build();
        self.bus.publish(reply).await
    }

    /// Unsubscribe; the inbox drains and then yields `None`
    pub fn disconnect(&self) {
        if self.bus.unsubscribe(&self.id, None) {
            info!(agent_id = %self.id, "Agent disconnected");
        }
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("pending", &self.inbox.pending())
            .field("open", &self.open.lock().len())
            .finish()
    }
}

/// Shareable handle to an agent, e.g. for a spawned worker loop
#[derive(Clone, Debug)]
pub struct AgentHandle {
    inner: Arc<Agent>,
}

impl AgentHandle {
    pub fn new(agent: Agent) -> Self {
        Self {
            inner: Arc::new(agent),
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.inner.id
    }

    pub fn inner(&self) -> &Agent {
        &self.inner
    }
}

impl std::ops::Deref for AgentHandle {
    type Target = Agent;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_request(to: &str) -> Message {
        Message::builder("orchestrator", MessageType::TaskRequest, "c1")
            .to(to)
            .content(json!({"work": true}))
            .build()
    }

    #[tokio::test]
    async fn test_exactly_one_terminal_reply() {
        let bus = Arc::new(MessageBus::in_memory());
        let agent = Agent::connect(bus.clone(), "worker").unwrap();
        bus.publish(task_request("worker")).await.unwrap();

        let Some(AgentEvent::Task(task)) = agent.recv().await else {
            panic!("expected a task");
        };
        assert!(task.payload.is_none());
        assert_eq!(agent.open_requests(), vec![task.request_id().clone()]);

        agent.complete(&task.request, json!({"ok": true})).await.unwrap();
        assert!(agent.open_requests().is_empty());

        let again = agent.fail(&task.request, "too late").await.unwrap_err();
        assert!(matches!(again, ParleyError::InvalidTransition { .. }));

        let chain = bus.get_chain(&task.request.message_id).unwrap();
        assert_eq!(chain.len(), 1);
        let conversation = bus.get_conversation(&"c1".into()).unwrap();
        assert_eq!(conversation.len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_notice_classified() {
        let bus = Arc::new(MessageBus::in_memory());
        let agent = AgentHandle::new(Agent::connect(bus.clone(), "worker").unwrap());
        let request = task_request("worker");
        let request_id = request.message_id.clone();
        bus.publish(request).await.unwrap();

        let notice = Message::builder("orchestrator", MessageType::Status, "c1")
            .to("worker")
            .parent(request_id.clone())
            .content(json!({"signal": "cancel", "reason": "timeout"}))
            .build();
        bus.publish(notice).await.unwrap();

        assert!(matches!(agent.try_recv(), Some(AgentEvent::Task(_))));
        match agent.try_recv() {
            Some(AgentEvent::Cancel(notice)) => {
                assert_eq!(notice.reason, "timeout");
                assert_eq!(notice.request_id, Some(request_id.clone()));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(agent.open_requests().is_empty());
        assert_eq!(agent.cancelled_requests(), vec![request_id]);
    }

    #[tokio::test]
    async fn test_cancelled_request_cannot_be_answered() {
        let bus = Arc::new(MessageBus::in_memory());
        let agent = Agent::connect(bus.clone(), "worker").unwrap();
        bus.publish(task_request("worker")).await.unwrap();
        let Some(AgentEvent::Task(task)) = agent.recv().await else {
            panic!("expected a task");
        };

        let notice = Message::builder("orchestrator", MessageType::Status, "c1")
            .to("worker")
            .parent(task.request_id().clone())
            .content(json!({"signal": "cancel", "reason": "workflow cancelled"}))
            .build();
        bus.publish(notice).await.unwrap();
        assert!(matches!(agent.recv().await, Some(AgentEvent::Cancel(_))));

        assert!(matches!(
            agent.report_status(&task.request, None, "still going").await,
            Err(ParleyError::Cancelled(_))
        ));
        let err = agent.complete(&task.request, json!({})).await.unwrap_err();
        assert!(matches!(err, ParleyError::Cancelled(_)));
        assert!(err.to_string().contains("workflow cancelled"));

        // only the notice is threaded under the request
        assert_eq!(bus.store().children(task.request_id()).len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_ahead_of_request_leaves_it_closed() {
        let bus = Arc::new(MessageBus::in_memory());
        let agent = Agent::connect(bus.clone(), "worker").unwrap();
        let request = task_request("worker");
        let request_id = request.message_id.clone();
        bus.publish(request).await.unwrap();

        let notice = Message::builder("orchestrator", MessageType::Status, "c1")
            .to("worker")
            .parent(request_id.clone())
            .priority(crate::message::Priority::HIGH)
            .content(json!({"signal": "cancel", "reason": "timeout"}))
            .build();
        bus.publish(notice).await.unwrap();

        assert!(matches!(agent.try_recv(), Some(AgentEvent::Cancel(_))));
        let Some(AgentEvent::Task(task)) = agent.try_recv() else {
            panic!("expected a task");
        };
        assert!(agent.open_requests().is_empty());
        assert!(matches!(
            agent.fail(&task.request, "gave up").await,
            Err(ParleyError::Cancelled(_))
        ));
    }

    #[tokio::test]
    async fn test_status_requires_open_request() {
        let bus = Arc::new(MessageBus::in_memory());
        let agent = Agent::connect(bus.clone(), "worker").unwrap();
        let stray = task_request("worker");

        assert!(matches!(
            agent.report_status(&stray, Some(10.0), "busy").await,
            Err(ParleyError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_ends_stream() {
        let bus = Arc::new(MessageBus::in_memory());
        let agent = Agent::connect(bus, "worker").unwrap();
        agent.disconnect();
        assert!(agent.recv().await.is_none());
    }
}
