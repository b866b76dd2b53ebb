//! # Parley
//!
//! Multi-agent orchestration core - the table where agents talk things over.
//!
//! Independent agents never call each other. They exchange [`Message`]s over
//! a [`MessageBus`], every message is threaded into a conversation, and an
//! [`Orchestrator`] turns task requests into workflows whose steps are
//! dispatched to agents, timed, retried and reported on.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            ORCHESTRATOR                              │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐  ┌──────────┐  │
//! │  │  Decompose   │  │   Timeout    │  │   Recovery   │  │ Progress │  │
//! │  │  (workflow)  │  │   scanner    │  │    policy    │  │ tracker  │  │
//! │  └──────────────┘  └──────────────┘  └──────────────┘  └──────────┘  │
//! └───────────────────────────────┬──────────────────────────────────────┘
//!                                 │ task-request / task-result / status
//!                                 ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                             MESSAGE BUS                              │
//! │  validate ──▶ conversation store ──▶ registry ──▶ priority mailboxes  │
//! └───────┬─────────────────────┬─────────────────────┬──────────────────┘
//!         ▼                     ▼                     ▼
//!   ┌───────────┐         ┌───────────┐         ┌───────────┐
//!   │  Agent A  │         │  Agent B  │         │  Agent C  │
//!   └───────────┘         └───────────┘         └───────────┘
//! ```
//!
//! ## Key Concepts
//!
//! - **Message**: immutable envelope with sender, optional receiver, type,
//!   priority and a JSON object payload
//! - **Conversation**: append-only tree of messages linked by `parent_id`;
//!   a root-to-message path is a thought chain
//! - **Subscription**: the message types an agent accepts and where they go
//! - **Workflow**: a decomposed task request, one task per step
//! - **Recovery policy**: ordered strategies tried when a task fails or
//!   times out
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use parley::{
//!     Agent, AgentEvent, MessageBus, Orchestrator, OrchestratorConfig, ProgressTracker,
//!     StepSpec, TaskRequest,
//! };
//! use serde_json::json;
//!
//! # async fn run() -> parley::Result<()> {
//! let bus = Arc::new(MessageBus::in_memory());
//! let orchestrator = Arc::new(Orchestrator::new(
//!     bus.clone(),
//!     Arc::new(ProgressTracker::default()),
//!     OrchestratorConfig::default(),
//! ));
//! orchestrator.attach()?;
//! let _scanner = orchestrator.spawn_timeout_scanner();
//!
//! let agent = Agent::connect(bus.clone(), "scanner")?;
//! let mut handle = orchestrator
//!     .submit(TaskRequest::new("c1", "cli", vec![StepSpec::new("scan", "scanner")]))
//!     .await?;
//!
//! if let Some(AgentEvent::Task(task)) = agent.recv().await {
//!     agent.complete(&task.request, json!({"findings": 0})).await?;
//! }
//! let result = handle.wait().await?;
//! assert!(result.is_success());
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod bus;
pub mod config;
pub mod conversation;
pub mod error;
pub mod mailbox;
pub mod message;
pub mod orchestrator;
pub mod progress;
pub mod recovery;
pub mod registry;
pub mod schema;
pub mod storage;
pub mod ticker;
pub mod workflow;

pub use agent::{Agent, AgentEvent, AgentHandle, CancelNotice, TaskAssignment};
pub use bus::{BusEvent, DeliveryStatus, DroppedEntry, MessageBus, PublishReport};
pub use config::{BusConfig, OrchestratorConfig, ParleyConfig, ProgressConfig, StorageConfig};
pub use conversation::{Chain, Conversation, ConversationStore, SaveReport};
pub use error::{ParleyError, Result, ValidationIssue};
pub use mailbox::{BackpressurePolicy, Inbox};
pub use message::{
    AgentId, ConversationId, Message, MessageBuilder, MessageId, MessageType, Priority,
    SchemaVersion,
};
pub use orchestrator::{Orchestrator, WorkflowHandle};
pub use progress::{ProgressEvent, ProgressRecord, ProgressTracker};
pub use recovery::{RecoveryAction, RecoveryPolicy, RecoveryStrategy};
pub use registry::{handler_fn, ChannelHandler, MessageHandler};
pub use storage::{ConversationStorage, FileStorage, MemoryStorage};
pub use ticker::{spawn_periodic, Periodic, PeriodicHandle};
pub use workflow::{
    ExecutionMode, StepOutcome, StepOutcomeKind, StepSpec, TaskId, TaskRequest, TaskState,
    WorkflowId, WorkflowResult, WorkflowStatus,
};
