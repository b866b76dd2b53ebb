//! Workflow and task model
//!
//! A [`TaskRequest`] is decomposed into a [`Workflow`] of [`Task`]s, one per
//! step. The orchestrator owns every workflow and is the only thing that
//! mutates task state.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{ParleyError, Result, ValidationIssue};
use crate::message::{AgentId, ConversationId, Message, MessageId, MessageType, Priority};
use crate::recovery::RecoveryStrategy;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique workflow identifier
    WorkflowId
);
uuid_id!(
    /// Unique task identifier
    TaskId
);

fn empty_object() -> Value {
    Value::Object(Default::default())
}

/// One step of a task request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    /// Agent the step is dispatched to
    pub agent: AgentId,
    #[serde(default)]
    pub action: String,
    #[serde(default = "empty_object")]
    pub params: Value,
    /// May run alongside neighbouring parallel steps
    #[serde(default)]
    pub parallel: bool,
    /// Explicit predecessors by step index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<usize>>,
    /// Overrides the orchestrator's task timeout
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    /// Parameters used by the degraded recovery strategy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded_params: Option<Value>,
}

impl StepSpec {
    pub fn new(name: impl Into<String>, agent: impl Into<AgentId>) -> Self {
        Self {
            name: name.into(),
            agent: agent.into(),
            action: String::new(),
            params: empty_object(),
            parallel: false,
            depends_on: None,
            timeout: None,
            degraded_params: None,
        }
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    pub fn params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    pub fn depends_on(mut self, steps: Vec<usize>) -> Self {
        self.depends_on = Some(steps);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn degraded_params(mut self, params: Value) -> Self {
        self.degraded_params = Some(params);
        self
    }
}

/// Body of a `task-request` message addressed to the orchestrator
#[derive(Debug, Deserialize)]
struct RequestBody {
    #[serde(default)]
    description: String,
    steps: Vec<StepSpec>,
}

/// Work handed to the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub conversation_id: ConversationId,
    pub requested_by: AgentId,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub priority: Priority,
}

impl TaskRequest {
    pub fn new(
        conversation_id: impl Into<ConversationId>,
        requested_by: impl Into<AgentId>,
        steps: Vec<StepSpec>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            requested_by: requested_by.into(),
            description: String::new(),
            steps,
            priority: Priority::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Read a request out of a `task-request` message
    pub fn from_message(message: &Message) -> Result<Self> {
        if message.message_type != MessageType::TaskRequest {
            return Err(ParleyError::invalid(
                "message_type",
                format!("expected task-request, got {}", message.message_type),
            ));
        }
        let body: RequestBody = serde_json::from_value(message.content.clone())
            .map_err(|e| ParleyError::invalid("content", e.to_string()))?;

        let request = Self {
            conversation_id: message.conversation_id.clone(),
            requested_by: message.sender.clone(),
            description: body.description,
            steps: body.steps,
            priority: message.priority,
        };
        request.validate()?;
        Ok(request)
    }

    /// Collect every structural problem with the request
    pub fn validate(&self) -> Result<()> {
        let mut issues = Vec::new();

        if self.conversation_id.is_empty() {
            issues.push(ValidationIssue::new("conversation_id", "must not be empty"));
        }
        if self.requested_by.is_empty() {
            issues.push(ValidationIssue::new("requested_by", "must not be empty"));
        }
        if self.steps.is_empty() {
            issues.push(ValidationIssue::new("steps", "at least one step is required"));
        }

        for (index, step) in self.steps.iter().enumerate() {
            let field = |name: &str| format!("steps[{index}].{name}");
            if step.name.trim().is_empty() {
                issues.push(ValidationIssue::new(field("name"), "must not be empty"));
            }
            if step.agent.is_empty() {
                issues.push(ValidationIssue::new(field("agent"), "must not be empty"));
            }
            if !step.params.is_object() {
                issues.push(ValidationIssue::new(field("params"), "must be a JSON object"));
            }
            if step.degraded_params.as_ref().is_some_and(|p| !p.is_object()) {
                issues.push(ValidationIssue::new(
                    field("degraded_params"),
                    "must be a JSON object",
                ));
            }
            if step.timeout.is_some_and(|t| t.is_zero()) {
                issues.push(ValidationIssue::new(field("timeout"), "must be > 0"));
            }
            for dep in step.depends_on.iter().flatten() {
                if *dep >= index {
                    issues.push(ValidationIssue::new(
                        field("depends_on"),
                        format!("step {dep} is not an earlier step"),
                    ));
                }
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ParleyError::Validation(issues))
        }
    }

    /// Predecessors of every step, by index.
    ///
    /// Explicit `depends_on` wins. Otherwise a sequential step waits for all
    /// earlier steps, and a parallel step waits for everything up to and
    /// including the most recent sequential step.
    pub fn dependencies(&self) -> Vec<Vec<usize>> {
        let mut last_sequential: Option<usize> = None;
        let mut deps = Vec::with_capacity(self.steps.len());

        for (index, step) in self.steps.iter().enumerate() {
            let resolved = match &step.depends_on {
                Some(explicit) => explicit
                    .iter()
                    .copied()
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect(),
                None if step.parallel => last_sequential.map_or_else(Vec::new, |last| (0..=last).collect()),
                None => (0..index).collect(),
            };
            if !step.parallel {
                last_sequential = Some(index);
            }
            deps.push(resolved);
        }
        deps
    }
}

/// How a task attempt should be carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Normal,
    /// Runs with no other task of the workflow in flight
    Sequential,
    /// Minimal configuration
    Degraded,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Sequential => "sequential",
            Self::Degraded => "degraded",
        }
    }
}

/// Lifecycle of a single task.
///
/// `Completed` is only reachable from `InProgress`: a terminal reply from
/// the agent first moves a `Dispatched` task to `InProgress`. `Failed` and
/// `TimedOut` may follow `Dispatched` directly, for dispatches that were
/// never delivered and agents that never answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Dispatched,
    InProgress,
    Completed,
    Failed,
    TimedOut,
    Abandoned,
    Cancelled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Dispatched => "dispatched",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Abandoned => "abandoned",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Abandoned | Self::Cancelled)
    }

    /// Waiting on an agent
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Dispatched | Self::InProgress)
    }

    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (from, Cancelled) => !from.is_terminal(),
            (Pending, Dispatched) => true,
            (Dispatched, InProgress | Failed | TimedOut) => true,
            (InProgress, Completed | Failed | TimedOut) => true,
            (Failed | TimedOut, Dispatched | Abandoned) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall state of a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Runtime state of one step
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub workflow_id: WorkflowId,
    pub step: usize,
    pub name: String,
    pub action: String,
    /// Current target; changes when a substitute takes over
    pub agent: AgentId,
    /// Parameters of the current attempt
    pub params: Value,
    pub depends_on: Vec<usize>,
    pub timeout: Duration,
    pub attempts: u32,
    pub deadline: Option<Instant>,
    pub state: TaskState,
    pub last_error: Option<String>,
    pub mode: ExecutionMode,
    /// Last attempt ran alongside other tasks of the workflow
    pub concurrent: bool,
    /// Next position in the recovery strategy list
    pub recovery_cursor: usize,
    pub strategies_applied: Vec<RecoveryStrategy>,
    /// Failed or timed out, with a retry planned
    pub awaiting_retry: bool,
    pub dispatch_id: Option<MessageId>,
    pub result_id: Option<MessageId>,
    pub result: Option<Value>,
}

impl Task {
    fn new(workflow_id: WorkflowId, step: usize, spec: &StepSpec, depends_on: Vec<usize>, timeout: Duration) -> Self {
        Self {
            id: TaskId::new(),
            workflow_id,
            step,
            name: spec.name.clone(),
            action: spec.action.clone(),
            agent: spec.agent.clone(),
            params: spec.params.clone(),
            depends_on,
            timeout: spec.timeout.unwrap_or(timeout),
            attempts: 0,
            deadline: None,
            state: TaskState::Pending,
            last_error: None,
            mode: ExecutionMode::Normal,
            concurrent: false,
            recovery_cursor: 0,
            strategies_applied: Vec::new(),
            awaiting_retry: false,
            dispatch_id: None,
            result_id: None,
            result: None,
        }
    }

    /// Move to `next`, leaving the state untouched when the move is illegal
    pub fn transition(&mut self, next: TaskState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ParleyError::InvalidTransition {
                entity: format!("task {} (step {})", self.id, self.step),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn outcome(&self) -> StepOutcome {
        let kind = match self.state {
            TaskState::Completed if self.attempts > 1 => StepOutcomeKind::Retried {
                retries: self.attempts - 1,
            },
            TaskState::Completed => StepOutcomeKind::Succeeded,
            TaskState::Abandoned => StepOutcomeKind::Abandoned,
            _ => StepOutcomeKind::Cancelled,
        };

        StepOutcome {
            step: self.step,
            name: self.name.clone(),
            task_id: self.id,
            agent: self.agent.clone(),
            kind,
            state: self.state,
            attempts: self.attempts,
            strategies: self.strategies_applied.clone(),
            last_error: self.last_error.clone(),
            result: self.result.clone(),
        }
    }
}

/// Content of a dispatched `task-request`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchPayload {
    pub workflow_id: WorkflowId,
    pub task_id: TaskId,
    pub step: usize,
    pub name: String,
    pub action: String,
    pub params: Value,
    pub attempt: u32,
    pub mode: ExecutionMode,
}

impl DispatchPayload {
    pub fn for_task(task: &Task) -> Self {
        Self {
            workflow_id: task.workflow_id,
            task_id: task.id,
            step: task.step,
            name: task.name.clone(),
            action: task.action.clone(),
            params: task.params.clone(),
            attempt: task.attempts,
            mode: task.mode,
        }
    }

    pub fn from_message(message: &Message) -> Option<Self> {
        serde_json::from_value(message.content.clone()).ok()
    }

    /// Message content for this payload
    pub fn to_content(&self) -> Value {
        json!({
            "workflow_id": self.workflow_id.to_string(),
            "task_id": self.task_id.to_string(),
            "step": self.step,
            "name": self.name,
            "action": self.action,
            "params": self.params,
            "attempt": self.attempt,
            "mode": self.mode.as_str(),
        })
    }
}

/// A decomposed task request
#[derive(Debug, Clone)]
pub struct Workflow {
    pub id: WorkflowId,
    pub request: TaskRequest,
    /// Inbound message the request arrived in, if any
    pub origin: Option<MessageId>,
    pub status: WorkflowStatus,
    pub tasks: Vec<Task>,
    pub started_at: Instant,
}

impl Workflow {
    /// Validate and decompose a request
    pub fn new(request: TaskRequest, origin: Option<MessageId>, default_timeout: Duration) -> Result<Self> {
        request.validate()?;
        let id = WorkflowId::new();
        let tasks = request
            .steps
            .iter()
            .zip(request.dependencies())
            .enumerate()
            .map(|(index, (spec, deps))| Task::new(id, index, spec, deps, default_timeout))
            .collect();

        Ok(Self {
            id,
            request,
            origin,
            status: WorkflowStatus::Pending,
            tasks,
            started_at: Instant::now(),
        })
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.request.conversation_id
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.iter().filter(|t| t.state.is_in_flight()).count()
    }

    pub fn all_completed(&self) -> bool {
        self.tasks.iter().all(|t| t.state == TaskState::Completed)
    }

    /// Steps that can be dispatched right now.
    ///
    /// A task retrying in sequential mode waits until nothing else is in
    /// flight, and nothing new starts while it runs.
    pub fn dispatchable(&self) -> Vec<usize> {
        if self.status.is_terminal() {
            return Vec::new();
        }
        if self
            .tasks
            .iter()
            .any(|t| t.state.is_in_flight() && t.mode == ExecutionMode::Sequential)
        {
            return Vec::new();
        }

        if let Some(solo) = self
            .tasks
            .iter()
            .find(|t| t.awaiting_retry && t.mode == ExecutionMode::Sequential)
        {
            return if self.in_flight() == 0 {
                vec![solo.step]
            } else {
                Vec::new()
            };
        }

        self.tasks
            .iter()
            .filter(|t| {
                t.awaiting_retry
                    || (t.state == TaskState::Pending
                        && t.depends_on
                            .iter()
                            .all(|dep| self.tasks[*dep].state == TaskState::Completed))
            })
            .map(|t| t.step)
            .collect()
    }

    pub fn result(&self) -> WorkflowResult {
        WorkflowResult {
            workflow_id: self.id,
            conversation_id: self.request.conversation_id.clone(),
            status: self.status,
            steps: self.tasks.iter().map(Task::outcome).collect(),
            elapsed_ms: self.started_at.elapsed().as_millis() as u64,
        }
    }
}

/// How a step ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepOutcomeKind {
    Succeeded,
    Retried { retries: u32 },
    Abandoned,
    Cancelled,
}

/// Per-step entry of a [`WorkflowResult`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step: usize,
    pub name: String,
    pub task_id: TaskId,
    pub agent: AgentId,
    pub kind: StepOutcomeKind,
    pub state: TaskState,
    pub attempts: u32,
    pub strategies: Vec<RecoveryStrategy>,
    pub last_error: Option<String>,
    pub result: Option<Value>,
}

/// Final report of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow_id: WorkflowId,
    pub conversation_id: ConversationId,
    pub status: WorkflowStatus,
    pub steps: Vec<StepOutcome>,
    pub elapsed_ms: u64,
}

impl WorkflowResult {
    pub fn is_success(&self) -> bool {
        self.status == WorkflowStatus::Completed
    }

    /// First step that did not succeed
    pub fn failed_step(&self) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| {
            !matches!(
                s.kind,
                StepOutcomeKind::Succeeded | StepOutcomeKind::Retried { .. }
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(steps: Vec<StepSpec>) -> TaskRequest {
        TaskRequest::new("c1", "client", steps)
    }

    // === Decomposition Tests ===

    #[test]
    fn test_sequential_steps_chain() {
        let req = request(vec![
            StepSpec::new("a", "x"),
            StepSpec::new("b", "x"),
            StepSpec::new("c", "x"),
        ]);
        assert_eq!(req.dependencies(), vec![vec![], vec![0], vec![0, 1]]);
    }

    #[test]
    fn test_parallel_steps_share_barrier() {
        let req = request(vec![
            StepSpec::new("fetch", "x"),
            StepSpec::new("scan-1", "x").parallel(),
            StepSpec::new("scan-2", "x").parallel(),
            StepSpec::new("merge", "x"),
        ]);
        assert_eq!(
            req.dependencies(),
            vec![vec![], vec![0], vec![0], vec![0, 1, 2]]
        );
    }

    #[test]
    fn test_leading_parallel_steps_are_independent() {
        let req = request(vec![
            StepSpec::new("a", "x").parallel(),
            StepSpec::new("b", "y").parallel(),
            StepSpec::new("c", "z").parallel(),
        ]);
        assert_eq!(req.dependencies(), vec![Vec::<usize>::new(), vec![], vec![]]);

        let wf = Workflow::new(req, None, Duration::from_secs(1)).unwrap();
        assert_eq!(wf.dispatchable(), vec![0, 1, 2]);
    }

    #[test]
    fn test_explicit_dependencies_win() {
        let req = request(vec![
            StepSpec::new("a", "x"),
            StepSpec::new("b", "x").parallel(),
            StepSpec::new("c", "x").depends_on(vec![1, 1]),
        ]);
        assert_eq!(req.dependencies()[2], vec![1]);
    }

    // === Validation Tests ===

    #[test]
    fn test_forward_dependency_rejected() {
        let req = request(vec![
            StepSpec::new("a", "x").depends_on(vec![1]),
            StepSpec::new("b", "x"),
        ]);
        let err = req.validate().unwrap_err();
        assert_eq!(err.issues()[0].field, "steps[0].depends_on");

        // never decomposed into tasks that would index past the end
        let err = Workflow::new(req, None, Duration::from_secs(1)).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_empty_request_rejected() {
        let err = request(vec![]).validate().unwrap_err();
        assert_eq!(err.issues()[0].field, "steps");

        let err = request(vec![StepSpec::new("", "")]).validate().unwrap_err();
        assert_eq!(err.issues().len(), 2);
    }

    #[test]
    fn test_from_message() {
        let msg = Message::builder("client", MessageType::TaskRequest, "c1")
            .to("orchestrator")
            .content(json!({
                "description": "scan repo",
                "steps": [
                    {"name": "scan", "agent": "scanner", "action": "scan", "timeout": "5s"},
                    {"name": "report", "agent": "reporter"}
                ]
            }))
            .build();

        let req = TaskRequest::from_message(&msg).unwrap();
        assert_eq!(req.requested_by.as_str(), "client");
        assert_eq!(req.steps[0].timeout, Some(Duration::from_secs(5)));
        assert_eq!(req.steps[1].params, json!({}));
    }

    #[test]
    fn test_from_message_missing_steps() {
        let msg = Message::builder("client", MessageType::TaskRequest, "c1")
            .content(json!({"description": "nothing"}))
            .build();
        let err = TaskRequest::from_message(&msg).unwrap_err();
        assert_eq!(err.issues()[0].field, "content");
    }

    // === State Machine Tests ===

    #[test]
    fn test_task_transitions() {
        use TaskState::*;
        assert!(Pending.can_transition_to(Dispatched));
        assert!(Dispatched.can_transition_to(InProgress));
        assert!(Dispatched.can_transition_to(TimedOut));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(TimedOut));
        assert!(TimedOut.can_transition_to(Dispatched));
        assert!(Failed.can_transition_to(Abandoned));
        assert!(InProgress.can_transition_to(Cancelled));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Dispatched.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Dispatched));
        assert!(!Abandoned.can_transition_to(Cancelled));
        assert!(!InProgress.can_transition_to(Dispatched));
    }

    #[test]
    fn test_illegal_transition_leaves_state() {
        let req = request(vec![StepSpec::new("a", "x")]);
        let mut wf = Workflow::new(req, None, Duration::from_secs(1)).unwrap();
        let task = &mut wf.tasks[0];

        let err = task.transition(TaskState::Completed).unwrap_err();
        assert!(matches!(err, ParleyError::InvalidTransition { .. }));
        assert_eq!(task.state, TaskState::Pending);
    }

    #[test]
    fn test_dispatchable_waits_for_dependencies() {
        let req = request(vec![StepSpec::new("a", "x"), StepSpec::new("b", "x")]);
        let mut wf = Workflow::new(req, None, Duration::from_secs(1)).unwrap();
        wf.status = WorkflowStatus::Running;
        assert_eq!(wf.dispatchable(), vec![0]);

        wf.tasks[0].state = TaskState::Dispatched;
        assert!(wf.dispatchable().is_empty());

        wf.tasks[0].state = TaskState::Completed;
        assert_eq!(wf.dispatchable(), vec![1]);
    }

    #[test]
    fn test_sequential_retry_waits_for_others() {
        let req = request(vec![
            StepSpec::new("a", "x").parallel(),
            StepSpec::new("b", "y").parallel(),
        ]);
        let mut wf = Workflow::new(req, None, Duration::from_secs(1)).unwrap();
        wf.status = WorkflowStatus::Running;
        wf.tasks[0].state = TaskState::Failed;
        wf.tasks[0].awaiting_retry = true;
        wf.tasks[0].mode = ExecutionMode::Sequential;
        wf.tasks[1].state = TaskState::InProgress;

        assert!(wf.dispatchable().is_empty());
        wf.tasks[1].state = TaskState::Completed;
        assert_eq!(wf.dispatchable(), vec![0]);
    }

    #[test]
    fn test_outcome_kinds() {
        let req = request(vec![StepSpec::new("a", "x")]);
        let mut wf = Workflow::new(req, None, Duration::from_secs(1)).unwrap();
        let task = &mut wf.tasks[0];

        task.state = TaskState::Completed;
        task.attempts = 1;
        assert_eq!(task.outcome().kind, StepOutcomeKind::Succeeded);

        task.attempts = 3;
        assert_eq!(task.outcome().kind, StepOutcomeKind::Retried { retries: 2 });

        task.state = TaskState::Abandoned;
        assert_eq!(task.outcome().kind, StepOutcomeKind::Abandoned);
    }

    #[test]
    fn test_step_timeout_override() {
        let req = request(vec![
            StepSpec::new("a", "x").timeout(Duration::from_secs(3)),
            StepSpec::new("b", "x"),
        ]);
        let wf = Workflow::new(req, None, Duration::from_secs(60)).unwrap();
        assert_eq!(wf.tasks[0].timeout, Duration::from_secs(3));
        assert_eq!(wf.tasks[1].timeout, Duration::from_secs(60));
    }
}
