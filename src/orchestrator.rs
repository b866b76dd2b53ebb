//! Main orchestrator - drives workflows over the message bus
//!
//! Each step of a workflow is dispatched as a `task-request` addressed to
//! its agent. Replies threaded under the dispatch (`task-result`, `error`,
//! `status`) advance the task state machine. A periodic scan times out tasks
//! whose agents went quiet and hands them to the recovery policy.
//!
//! All workflow state sits behind one mutex that is never held across an
//! await. State changes produce a list of outgoing messages which are handed
//! to a publisher task once the lock is released, so neither the delivery
//! worker nor the timeout scan ever waits on a full subscriber queue.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::bus::MessageBus;
use crate::config::OrchestratorConfig;
use crate::error::{ParleyError, Result};
use crate::message::{AgentId, ConversationId, Message, MessageId, MessageType, Priority};
use crate::progress::ProgressTracker;
use crate::recovery::RecoveryAction;
use crate::registry::MessageHandler;
use crate::ticker::{spawn_periodic, Periodic, PeriodicHandle};
use crate::workflow::{
    DispatchPayload, Task, TaskRequest, TaskState, Workflow, WorkflowId, WorkflowResult,
    WorkflowStatus,
};

/// Message types the orchestrator listens for once attached
pub const ORCHESTRATOR_TYPES: [MessageType; 4] = [
    MessageType::TaskRequest,
    MessageType::TaskResult,
    MessageType::Error,
    MessageType::Status,
];

/// Which attempt of which task a dispatch message belongs to
#[derive(Debug, Clone, Copy)]
struct TaskRef {
    workflow_id: WorkflowId,
    step: usize,
    attempt: u32,
}

struct WorkflowEntry {
    workflow: Workflow,
    done: watch::Sender<Option<WorkflowResult>>,
    archived: bool,
}

#[derive(Default)]
struct EngineState {
    workflows: HashMap<WorkflowId, WorkflowEntry>,
    dispatches: HashMap<MessageId, TaskRef>,
    /// Finished workflows, oldest first
    archive: VecDeque<WorkflowId>,
}

/// Message to publish after the state lock is released
enum Outgoing {
    /// Task dispatch; a failed publish fails the task
    Dispatch { task: TaskRef, message: Message },
    /// Best-effort notice or reply
    Notice(Message),
}

type Outbox = Vec<Outgoing>;

/// Awaitable handle to a submitted workflow
#[derive(Debug, Clone)]
pub struct WorkflowHandle {
    id: WorkflowId,
    rx: watch::Receiver<Option<WorkflowResult>>,
}

impl WorkflowHandle {
    pub fn id(&self) -> WorkflowId {
        self.id
    }

    /// Result if the workflow already finished
    pub fn try_result(&self) -> Option<WorkflowResult> {
        self.rx.borrow().clone()
    }

    /// Wait for the workflow to finish
    pub async fn wait(&mut self) -> Result<WorkflowResult> {
        let id = self.id;
        let finished = self
            .rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ParleyError::Closed(format!("workflow {id}")))?;
        finished
            .clone()
            .ok_or_else(|| ParleyError::Closed(format!("workflow {id}")))
    }
}

/// Workflow engine
pub struct Orchestrator {
    agent_id: AgentId,
    bus: Arc<MessageBus>,
    progress: Arc<ProgressTracker>,
    config: OrchestratorConfig,
    state: Mutex<EngineState>,
    outgoing: mpsc::UnboundedSender<Outbox>,
    /// Taken by the publisher task on `attach`
    pending_publisher: Mutex<Option<mpsc::UnboundedReceiver<Outbox>>>,
}

impl Orchestrator {
    pub fn new(bus: Arc<MessageBus>, progress: Arc<ProgressTracker>, config: OrchestratorConfig) -> Self {
        let (outgoing, rx) = mpsc::unbounded_channel();
        Self {
            agent_id: config.agent_id.clone(),
            bus,
            progress,
            config,
            state: Mutex::new(EngineState::default()),
            outgoing,
            pending_publisher: Mutex::new(Some(rx)),
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn progress(&self) -> &Arc<ProgressTracker> {
        &self.progress
    }

    /// Subscribe to the bus under the orchestrator's own agent id and start
    /// the publisher task. Must be called once, inside a tokio runtime,
    /// before any workflow is submitted.
    pub fn attach(self: &Arc<Self>) -> Result<()> {
        let mut pending = self.pending_publisher.lock();
        if pending.is_none() {
            return Err(ParleyError::Subscription(format!(
                "{} is already attached",
                self.agent_id
            )));
        }

        let inbox = Arc::new(OrchestratorInbox {
            engine: Arc::downgrade(self),
        });
        self.bus
            .subscribe(self.agent_id.clone(), &ORCHESTRATOR_TYPES, inbox)?;
        if let Some(rx) = pending.take() {
            tokio::spawn(run_publisher(Arc::downgrade(self), rx));
        }
        info!(agent_id = %self.agent_id, "Orchestrator attached to bus");
        Ok(())
    }

    pub fn is_attached(&self) -> bool {
        self.pending_publisher.lock().is_none()
    }

    /// Run the timeout scan every `scan_interval`
    pub fn spawn_timeout_scanner(self: &Arc<Self>) -> PeriodicHandle {
        spawn_periodic(Arc::clone(self) as Arc<dyn Periodic>, self.config.scan_interval)
    }

    /// Decompose a request into a workflow and dispatch its first steps
    #[instrument(skip(self, request), fields(conversation_id = %request.conversation_id, steps = request.steps.len()))]
    pub async fn submit(&self, request: TaskRequest) -> Result<WorkflowHandle> {
        self.start(request, None).await
    }

    async fn start(&self, request: TaskRequest, origin: Option<MessageId>) -> Result<WorkflowHandle> {
        if !self.is_attached() {
            return Err(ParleyError::Subscription(format!(
                "{} is not attached to the bus",
                self.agent_id
            )));
        }

        let mut workflow = Workflow::new(request, origin, self.config.task_timeout)?;
        let id = workflow.id;
        self.progress
            .start_operation(&id.to_string(), Some(workflow.tasks.len() as u32))?;

        let (done, rx) = watch::channel(None);
        let outbox = {
            let mut state = self.state.lock();
            let EngineState {
                workflows,
                dispatches,
                ..
            } = &mut *state;

            workflow.status = WorkflowStatus::Running;
            let entry = workflows.entry(id).or_insert(WorkflowEntry {
                workflow,
                done,
                archived: false,
            });
            let mut outbox = Outbox::new();
            self.schedule(entry, dispatches, &mut outbox);
            outbox
        };

        info!(workflow_id = %id, "Workflow started");
        self.send(outbox);
        Ok(WorkflowHandle { id, rx })
    }

    /// Entry point for every message routed to the orchestrator
    pub async fn handle_message(&self, message: Arc<Message>) {
        match message.message_type {
            MessageType::TaskRequest => {
                if let Err(err) = self.accept_request(&message).await {
                    debug!(message_id = %message.message_id, error = %err, "Task request rejected");
                }
            }
            MessageType::TaskResult | MessageType::Error | MessageType::Status => {
                self.handle_reply(&message).await;
            }
            other => debug!(message_type = %other, "Ignoring message"),
        }
    }

    /// Turn an inbound `task-request` into a workflow, answering malformed
    /// requests with an `error` message
    async fn accept_request(&self, message: &Message) -> Result<WorkflowHandle> {
        let request = match TaskRequest::from_message(message) {
            Ok(request) => request,
            Err(err) => {
                warn!(
                    message_id = %message.message_id,
                    sender = %message.sender,
                    error = %err,
                    "Malformed task request"
                );
                let issues: Vec<Value> = err
                    .issues()
                    .iter()
                    .map(|i| json!({"field": i.field, "reason": i.reason}))
                    .collect();
                let reply = message
                    .reply(self.agent_id.clone(), MessageType::Error)
                    .priority(message.priority)
                    .content(json!({"error": err.to_string(), "issues": issues}))
                    .build();
                self.send(vec![Outgoing::Notice(reply)]);
                return Err(err);
            }
        };

        self.start(request, Some(message.message_id.clone())).await
    }

    async fn handle_reply(&self, message: &Message) {
        let Some(parent) = &message.parent_id else {
            debug!(message_id = %message.message_id, "Reply without parent ignored");
            return;
        };

        let outbox = {
            let mut state = self.state.lock();
            let EngineState {
                workflows,
                dispatches,
                ..
            } = &mut *state;

            let Some(task_ref) = dispatches.get(parent).copied() else {
                debug!(message_id = %message.message_id, parent_id = %parent, "Reply to unknown or superseded dispatch");
                return;
            };
            let Some(entry) = workflows.get_mut(&task_ref.workflow_id) else {
                return;
            };
            let task = &entry.workflow.tasks[task_ref.step];
            if task.attempts != task_ref.attempt || !task.state.is_in_flight() {
                debug!(message_id = %message.message_id, "Stale reply ignored");
                return;
            }
            if message.sender != task.agent {
                warn!(
                    message_id = %message.message_id,
                    sender = %message.sender,
                    expected = %task.agent,
                    "Reply from unexpected sender ignored"
                );
                return;
            }

            let mut outbox = Outbox::new();
            match message.message_type {
                MessageType::TaskResult => {
                    picked_up(&mut entry.workflow.tasks[task_ref.step]);
                    self.complete_task(entry, dispatches, &mut outbox, task_ref.step, message);
                }
                MessageType::Error => {
                    picked_up(&mut entry.workflow.tasks[task_ref.step]);
                    let reason = message
                        .content_str("error")
                        .unwrap_or("agent reported an error")
                        .to_string();
                    self.fail_task(entry, dispatches, &mut outbox, task_ref.step, TaskState::Failed, reason);
                }
                MessageType::Status => self.mark_in_progress(entry, task_ref.step, message),
                _ => {}
            }
            self.archive_finished(&mut state);
            outbox
        };

        self.send(outbox);
    }

    /// Time out every in-flight task whose deadline plus grace is before `now`
    pub async fn scan_timeouts_at(&self, now: Instant) -> usize {
        let (expired, outbox) = {
            let mut state = self.state.lock();
            let EngineState {
                workflows,
                dispatches,
                ..
            } = &mut *state;

            let mut outbox = Outbox::new();
            let mut expired = 0;
            for entry in workflows.values_mut() {
                if entry.workflow.status != WorkflowStatus::Running {
                    continue;
                }
                let overdue: Vec<usize> = entry
                    .workflow
                    .tasks
                    .iter()
                    .filter(|t| t.state.is_in_flight())
                    .filter(|t| t.deadline.is_some_and(|d| now > d + self.config.grace_period))
                    .map(|t| t.step)
                    .collect();

                for step in overdue {
                    // an earlier abandonment may have cancelled it
                    let task = &entry.workflow.tasks[step];
                    if !task.state.is_in_flight() {
                        continue;
                    }
                    let started = task.deadline.map(|d| d - task.timeout).unwrap_or(now);
                    let err = ParleyError::Timeout {
                        task_id: task.id.to_string(),
                        elapsed_ms: now.saturating_duration_since(started).as_millis(),
                    };
                    warn!(workflow_id = %task.workflow_id, step, agent_id = %task.agent, "Task timed out");

                    if let Some(notice) = self.cancel_notice(&entry.workflow, task, "timeout") {
                        outbox.push(Outgoing::Notice(notice));
                    }
                    self.fail_task(entry, dispatches, &mut outbox, step, TaskState::TimedOut, err.to_string());
                    expired += 1;
                }
            }
            self.archive_finished(&mut state);
            (expired, outbox)
        };

        self.send(outbox);
        expired
    }

    pub async fn scan_timeouts(&self) -> usize {
        self.scan_timeouts_at(Instant::now()).await
    }

    /// Cancel a running workflow and every unfinished task in it
    #[instrument(skip(self))]
    pub async fn cancel_workflow(&self, id: WorkflowId) -> Result<WorkflowResult> {
        let (result, outbox) = {
            let mut state = self.state.lock();
            let EngineState {
                workflows,
                dispatches,
                ..
            } = &mut *state;

            let entry = workflows
                .get_mut(&id)
                .ok_or_else(|| ParleyError::NotFound(format!("workflow {id}")))?;
            match entry.workflow.status {
                WorkflowStatus::Cancelled => {
                    return Err(ParleyError::Cancelled(format!("workflow {id} was already cancelled")));
                }
                status if status.is_terminal() => {
                    return Err(ParleyError::InvalidTransition {
                        entity: format!("workflow {id}"),
                        from: format!("{status:?}"),
                        to: format!("{:?}", WorkflowStatus::Cancelled),
                    });
                }
                _ => {}
            }

            let mut outbox = Outbox::new();
            self.abort(entry, dispatches, &mut outbox, WorkflowStatus::Cancelled, "workflow cancelled");
            let result = entry.workflow.result();
            self.archive_finished(&mut state);
            (result, outbox)
        };

        self.send(outbox);
        Ok(result)
    }

    pub fn workflow_status(&self, id: WorkflowId) -> Option<WorkflowStatus> {
        self.state
            .lock()
            .workflows
            .get(&id)
            .map(|entry| entry.workflow.status)
    }

    /// Copy of every task in a workflow
    pub fn task_snapshot(&self, id: WorkflowId) -> Option<Vec<Task>> {
        self.state
            .lock()
            .workflows
            .get(&id)
            .map(|entry| entry.workflow.tasks.clone())
    }

    /// Final result, once the workflow has finished
    pub fn result(&self, id: WorkflowId) -> Option<WorkflowResult> {
        self.state
            .lock()
            .workflows
            .get(&id)
            .and_then(|entry| entry.done.borrow().clone())
    }

    pub fn workflows(&self) -> Vec<WorkflowId> {
        let mut ids: Vec<_> = self.state.lock().workflows.keys().copied().collect();
        ids.sort();
        ids
    }

    // === State transitions (called with the state lock held) ===

    fn schedule(&self, entry: &mut WorkflowEntry, dispatches: &mut HashMap<MessageId, TaskRef>, outbox: &mut Outbox) {
        let ready = entry.workflow.dispatchable();
        if ready.is_empty() {
            return;
        }

        let now = Instant::now();
        for step in ready {
            let parent = self.thread_parent(&entry.workflow, step);
            let workflow = &mut entry.workflow;
            let priority = workflow.request.priority;
            let conversation_id = workflow.request.conversation_id.clone();
            let task = &mut workflow.tasks[step];

            if let Err(err) = task.transition(TaskState::Dispatched) {
                warn!(error = %err, "Skipping dispatch");
                continue;
            }
            task.attempts += 1;
            task.awaiting_retry = false;
            task.concurrent = false;
            task.deadline = Some(now + task.timeout);

            let message = dispatch_message(&self.agent_id, &conversation_id, priority, parent, task);
            task.dispatch_id = Some(message.message_id.clone());

            let task_ref = TaskRef {
                workflow_id: task.workflow_id,
                step,
                attempt: task.attempts,
            };
            dispatches.insert(message.message_id.clone(), task_ref);
            info!(
                workflow_id = %task.workflow_id,
                step,
                agent_id = %task.agent,
                attempt = task.attempts,
                mode = task.mode.as_str(),
                "Dispatching task"
            );
            outbox.push(Outgoing::Dispatch {
                task: task_ref,
                message,
            });
        }

        if entry.workflow.in_flight() > 1 {
            for task in entry.workflow.tasks.iter_mut().filter(|t| t.state.is_in_flight()) {
                task.concurrent = true;
            }
        }
    }

    /// Parent for the next dispatch of `step`: the previous attempt, else the
    /// result of its last dependency, else the inbound request
    fn thread_parent(&self, workflow: &Workflow, step: usize) -> Option<MessageId> {
        let task = &workflow.tasks[step];
        // queued ahead of this retry, so stored by the time it is published
        if let Some(previous) = &task.dispatch_id {
            return Some(previous.clone());
        }

        let conversation_id = workflow.conversation_id();
        let dependency = task
            .depends_on
            .iter()
            .max()
            .and_then(|dep| workflow.tasks[*dep].result_id.clone());

        [dependency, workflow.origin.clone()]
            .into_iter()
            .flatten()
            .find(|id| self.threadable(id, conversation_id))
    }

    fn threadable(&self, id: &MessageId, conversation_id: &ConversationId) -> bool {
        self.bus
            .store()
            .get_message(id)
            .is_some_and(|m| &m.conversation_id == conversation_id)
    }

    fn mark_in_progress(&self, entry: &mut WorkflowEntry, step: usize, message: &Message) {
        let workflow = &mut entry.workflow;
        let total = workflow.tasks.len() as f64;
        let completed = workflow
            .tasks
            .iter()
            .filter(|t| t.state == TaskState::Completed)
            .count() as f64;
        let task = &mut workflow.tasks[step];

        if task.state == TaskState::Dispatched {
            if let Err(err) = task.transition(TaskState::InProgress) {
                warn!(error = %err, "Status update rejected");
                return;
            }
            debug!(workflow_id = %task.workflow_id, step, "Task in progress");
        }

        if let Some(percent) = message.content.get("progress").and_then(Value::as_f64) {
            let overall = (completed + percent.clamp(0.0, 100.0) / 100.0) / total * 100.0;
            let activity = message.content_str("activity").unwrap_or("working");
            let label = format!("{}: {activity}", task.name);
            if let Err(err) = self
                .progress
                .update_progress(&task.workflow_id.to_string(), overall, &label)
            {
                debug!(error = %err, "Progress update skipped");
            }
        }
    }

    fn complete_task(
        &self,
        entry: &mut WorkflowEntry,
        dispatches: &mut HashMap<MessageId, TaskRef>,
        outbox: &mut Outbox,
        step: usize,
        message: &Message,
    ) {
        let task = &mut entry.workflow.tasks[step];
        if let Err(err) = task.transition(TaskState::Completed) {
            warn!(error = %err, "Result rejected");
            return;
        }
        task.result = Some(message.content.clone());
        task.result_id = Some(message.message_id.clone());
        task.deadline = None;
        if let Some(dispatch) = &task.dispatch_id {
            dispatches.remove(dispatch);
        }

        info!(
            workflow_id = %task.workflow_id,
            step,
            attempts = task.attempts,
            "Task completed"
        );
        let label = format!("{} completed", task.name);
        if let Err(err) = self
            .progress
            .complete_step(&task.workflow_id.to_string(), &label)
        {
            debug!(error = %err, "Progress update skipped");
        }

        if entry.workflow.all_completed() {
            self.finish(entry, dispatches, outbox, WorkflowStatus::Completed);
        } else {
            self.schedule(entry, dispatches, outbox);
        }
    }

    fn fail_task(
        &self,
        entry: &mut WorkflowEntry,
        dispatches: &mut HashMap<MessageId, TaskRef>,
        outbox: &mut Outbox,
        step: usize,
        failure: TaskState,
        reason: String,
    ) {
        let spec = entry.workflow.request.steps[step].clone();
        let task = &mut entry.workflow.tasks[step];
        if let Err(err) = task.transition(failure) {
            warn!(error = %err, "Failure rejected");
            return;
        }
        warn!(
            workflow_id = %task.workflow_id,
            step,
            agent_id = %task.agent,
            attempt = task.attempts,
            reason = %reason,
            "Task failed"
        );
        task.last_error = Some(reason);
        task.deadline = None;
        if let Some(dispatch) = &task.dispatch_id {
            dispatches.remove(dispatch);
        }

        match self.config.recovery.next_action(task, &spec) {
            RecoveryAction::Retry {
                strategy,
                agent,
                params,
                mode,
            } => {
                info!(
                    workflow_id = %task.workflow_id,
                    step,
                    ?strategy,
                    agent_id = %agent,
                    "Recovering task"
                );
                task.agent = agent;
                task.params = params;
                task.mode = mode;
                task.strategies_applied.push(strategy);
                task.awaiting_retry = true;
                self.schedule(entry, dispatches, outbox);
            }
            RecoveryAction::Abandon => {
                if let Err(err) = task.transition(TaskState::Abandoned) {
                    warn!(error = %err, "Abandon rejected");
                    return;
                }
                warn!(
                    workflow_id = %task.workflow_id,
                    step,
                    attempts = task.attempts,
                    "Recovery exhausted, task abandoned"
                );
                self.abort(entry, dispatches, outbox, WorkflowStatus::Failed, "workflow failed");
            }
        }
    }

    /// Cancel every unfinished task, then finish with `status`
    fn abort(
        &self,
        entry: &mut WorkflowEntry,
        dispatches: &mut HashMap<MessageId, TaskRef>,
        outbox: &mut Outbox,
        status: WorkflowStatus,
        reason: &str,
    ) {
        for step in 0..entry.workflow.tasks.len() {
            let task = &entry.workflow.tasks[step];
            if task.state.is_terminal() {
                continue;
            }
            if task.state.is_in_flight() {
                if let Some(notice) = self.cancel_notice(&entry.workflow, task, reason) {
                    outbox.push(Outgoing::Notice(notice));
                }
            }

            let task = &mut entry.workflow.tasks[step];
            if let Some(dispatch) = &task.dispatch_id {
                dispatches.remove(dispatch);
            }
            task.awaiting_retry = false;
            task.deadline = None;
            if let Err(err) = task.transition(TaskState::Cancelled) {
                warn!(error = %err, "Cancel rejected");
            }
        }

        self.finish(entry, dispatches, outbox, status);
    }

    fn finish(
        &self,
        entry: &mut WorkflowEntry,
        dispatches: &mut HashMap<MessageId, TaskRef>,
        outbox: &mut Outbox,
        status: WorkflowStatus,
    ) {
        let workflow = &mut entry.workflow;
        workflow.status = status;
        let id = workflow.id;
        dispatches.retain(|_, task| task.workflow_id != id);

        let closed = if status == WorkflowStatus::Completed {
            self.progress.complete_operation(&id.to_string())
        } else {
            self.progress.close_operation(&id.to_string())
        };
        if let Err(err) = closed {
            debug!(error = %err, "Progress update skipped");
        }

        let result = workflow.result();
        info!(workflow_id = %id, ?status, elapsed_ms = result.elapsed_ms, "Workflow finished");

        if let Some(origin) = &workflow.origin {
            let message_type = if result.is_success() {
                MessageType::TaskResult
            } else {
                MessageType::Error
            };
            let mut reply = Message::builder(
                self.agent_id.clone(),
                message_type,
                workflow.request.conversation_id.clone(),
            )
            .to(workflow.request.requested_by.clone())
            .parent(origin.clone())
            .priority(workflow.request.priority)
            .meta("workflow_id", id.to_string())
            .content(json!({
                "workflow_id": id.to_string(),
                "status": result.status,
                "result": serde_json::to_value(&result).unwrap_or_default(),
            }));
            if !result.is_success() {
                let summary = result
                    .failed_step()
                    .map(|s| format!("step {} ({}) {:?}", s.step, s.name, s.kind))
                    .unwrap_or_else(|| format!("{status:?}"));
                reply = reply.meta("error", summary);
            }
            outbox.push(Outgoing::Notice(reply.build()));
        }

        entry.done.send_replace(Some(result));
    }

    /// Queue newly finished workflows and evict the oldest past `archive_limit`
    fn archive_finished(&self, state: &mut EngineState) {
        let EngineState {
            workflows, archive, ..
        } = state;

        for (id, entry) in workflows.iter_mut() {
            if entry.workflow.status.is_terminal() && !entry.archived {
                entry.archived = true;
                archive.push_back(*id);
            }
        }
        while archive.len() > self.config.archive_limit {
            let Some(id) = archive.pop_front() else {
                break;
            };
            workflows.remove(&id);
            self.progress.remove(&id.to_string());
            debug!(workflow_id = %id, "Finished workflow evicted");
        }
    }

    fn cancel_notice(&self, workflow: &Workflow, task: &Task, reason: &str) -> Option<Message> {
        let dispatch = task.dispatch_id.clone()?;
        Some(
            Message::builder(
                self.agent_id.clone(),
                MessageType::Status,
                workflow.request.conversation_id.clone(),
            )
            .to(task.agent.clone())
            .parent(dispatch)
            .priority(Priority::HIGH)
            .content(json!({
                "signal": "cancel",
                "workflow_id": task.workflow_id.to_string(),
                "task_id": task.id.to_string(),
                "reason": reason,
            }))
            .build(),
        )
    }

    // === Publishing ===

    fn send(&self, outbox: Outbox) {
        if outbox.is_empty() {
            return;
        }
        if self.outgoing.send(outbox).is_err() {
            warn!(agent_id = %self.agent_id, "Publisher stopped, outgoing messages dropped");
        }
    }

    /// Publish in order; a dispatch that is not delivered fails its task
    async fn publish_all(&self, outbox: Outbox) {
        let mut queue = VecDeque::from(outbox);
        while let Some(outgoing) = queue.pop_front() {
            match outgoing {
                Outgoing::Dispatch { task, message } => {
                    let message_id = message.message_id.clone();
                    let failure = match self.bus.publish(message).await {
                        Ok(report) if report.is_delivered() => None,
                        Ok(report) => Some(format!(
                            "dispatch {message_id} not delivered ({:?})",
                            report.status
                        )),
                        Err(err) => Some(err.to_string()),
                    };
                    if let Some(reason) = failure {
                        queue.extend(self.dispatch_failed(&message_id, task, reason));
                    }
                }
                Outgoing::Notice(message) => {
                    let message_id = message.message_id.clone();
                    if let Err(err) = self.bus.publish(message).await {
                        warn!(message_id = %message_id, error = %err, "Failed to publish notice");
                    }
                }
            }
        }
    }

    fn dispatch_failed(&self, message_id: &MessageId, task_ref: TaskRef, reason: String) -> Outbox {
        let mut state = self.state.lock();
        let EngineState {
            workflows,
            dispatches,
            ..
        } = &mut *state;

        let mut outbox = Outbox::new();
        let Some(entry) = workflows.get_mut(&task_ref.workflow_id) else {
            return outbox;
        };
        let task = &entry.workflow.tasks[task_ref.step];
        let current = task.dispatch_id.as_ref() == Some(message_id)
            && task.attempts == task_ref.attempt
            && task.state.is_in_flight();
        if current {
            self.fail_task(entry, dispatches, &mut outbox, task_ref.step, TaskState::Failed, reason);
            self.archive_finished(&mut state);
        }
        outbox
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("agent_id", &self.agent_id)
            .field("workflows", &self.state.lock().workflows.len())
            .finish()
    }
}

/// A terminal reply proves the agent picked the task up
fn picked_up(task: &mut Task) {
    if task.state == TaskState::Dispatched {
        if let Err(err) = task.transition(TaskState::InProgress) {
            warn!(error = %err, "Task could not be marked in progress");
        }
    }
}

async fn run_publisher(engine: Weak<Orchestrator>, mut rx: mpsc::UnboundedReceiver<Outbox>) {
    while let Some(outbox) = rx.recv().await {
        let Some(engine) = engine.upgrade() else {
            break;
        };
        engine.publish_all(outbox).await;
    }
    debug!("Orchestrator publisher stopped");
}

fn dispatch_message(
    sender: &AgentId,
    conversation_id: &ConversationId,
    priority: Priority,
    parent: Option<MessageId>,
    task: &Task,
) -> Message {
    let builder = Message::builder(sender.clone(), MessageType::TaskRequest, conversation_id.clone())
        .to(task.agent.clone())
        .priority(priority)
        .meta("workflow_id", task.workflow_id.to_string())
        .meta("task_id", task.id.to_string())
        .content(DispatchPayload::for_task(task).to_content());
    match parent {
        Some(parent) => builder.parent(parent).build(),
        None => builder.build(),
    }
}

#[async_trait]
impl Periodic for Orchestrator {
    fn name(&self) -> &'static str {
        "timeout-scanner"
    }

    async fn tick(&self) {
        let expired = self.scan_timeouts().await;
        if expired > 0 {
            debug!(expired, "Timeout scan finished");
        }
    }
}

/// Bus handler forwarding to the orchestrator without keeping it alive
struct OrchestratorInbox {
    engine: Weak<Orchestrator>,
}

#[async_trait]
impl MessageHandler for OrchestratorInbox {
    async fn handle(&self, message: Arc<Message>) -> anyhow::Result<()> {
        if let Some(engine) = self.engine.upgrade() {
            engine.handle_message(message).await;
        }
        Ok(())
    }
}
