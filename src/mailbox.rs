//! Bounded per-subscriber delivery queues
//!
//! Entries are served highest priority first, FIFO within a priority. When a
//! queue is full the configured [`BackpressurePolicy`] decides whether the
//! publisher waits or the oldest lowest-priority entry is dropped.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::error::{ParleyError, Result};
use crate::message::{AgentId, Message, Priority};

/// What to do when a subscriber queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackpressurePolicy {
    /// Publisher waits until the subscriber frees a slot
    #[default]
    Block,
    /// Best effort: evict the oldest entry of the lowest queued priority
    DropOldestLowPriority,
}

/// Outcome of enqueueing one message
#[derive(Debug, Clone)]
pub enum Enqueued {
    Accepted,
    /// Accepted after evicting an older entry
    Evicted(Arc<Message>),
    /// The incoming message itself was the lowest-priority candidate
    Rejected,
}

/// Ordering key: `Reverse` puts the highest priority first, then lowest sequence
type QueueKey = (Reverse<Priority>, u64);

#[derive(Default)]
struct QueueState {
    entries: BTreeMap<QueueKey, Arc<Message>>,
    next_seq: u64,
    closed: bool,
}

/// Priority queue feeding a single subscriber
pub struct Mailbox {
    agent_id: AgentId,
    capacity: usize,
    policy: BackpressurePolicy,
    state: Mutex<QueueState>,
    readable: Notify,
    writable: Notify,
}

impl Mailbox {
    pub fn new(agent_id: AgentId, capacity: usize, policy: BackpressurePolicy) -> Self {
        Self {
            agent_id,
            capacity: capacity.max(1),
            policy,
            state: Mutex::new(QueueState::default()),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue a message, waiting for space under [`BackpressurePolicy::Block`]
    pub async fn push(&self, message: Arc<Message>) -> Result<Enqueued> {
        loop {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(ParleyError::Closed(format!("mailbox of {}", self.agent_id)));
                }

                if state.entries.len() < self.capacity {
                    Self::insert(&mut state, message);
                    drop(state);
                    self.readable.notify_one();
                    return Ok(Enqueued::Accepted);
                }

                if self.policy == BackpressurePolicy::DropOldestLowPriority {
                    let outcome = Self::evict_for(&mut state, message);
                    drop(state);
                    if matches!(outcome, Enqueued::Evicted(_)) {
                        self.readable.notify_one();
                    }
                    return Ok(outcome);
                }
            }

            notified.await;
        }
    }

    fn insert(state: &mut QueueState, message: Arc<Message>) {
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert((Reverse(message.priority), seq), message);
    }

    fn evict_for(state: &mut QueueState, incoming: Arc<Message>) -> Enqueued {
        let Some(lowest) = state.entries.keys().next_back().map(|(Reverse(p), _)| *p) else {
            return Enqueued::Rejected;
        };
        if incoming.priority < lowest {
            return Enqueued::Rejected;
        }

        // the tier of the lowest priority starts at its smallest sequence
        let victim_key = state
            .entries
            .range((Reverse(lowest), 0)..)
            .next()
            .map(|(key, _)| *key);

        match victim_key.and_then(|key| state.entries.remove(&key)) {
            Some(victim) => {
                Self::insert(state, incoming);
                Enqueued::Evicted(victim)
            }
            None => Enqueued::Rejected,
        }
    }

    /// Wait for the next message; `None` once closed and drained
    pub async fn pop(&self) -> Option<Arc<Message>> {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some((_, message)) = state.entries.pop_first() {
                    drop(state);
                    self.writable.notify_one();
                    return Some(message);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Take the next message without waiting
    pub fn try_pop(&self) -> Option<Arc<Message>> {
        let message = self.state.lock().entries.pop_first().map(|(_, m)| m);
        if message.is_some() {
            self.writable.notify_one();
        }
        message
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Stop accepting messages and wake every waiter
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("agent_id", &self.agent_id)
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .field("len", &self.len())
            .finish()
    }
}

/// Pull-style delivery target handed to an agent
#[derive(Debug, Clone)]
pub struct Inbox {
    mailbox: Arc<Mailbox>,
}

impl Inbox {
    pub(crate) fn new(mailbox: Arc<Mailbox>) -> Self {
        Self { mailbox }
    }

    pub fn agent_id(&self) -> &AgentId {
        self.mailbox.agent_id()
    }

    /// Receive the next message; `None` after unsubscribe
    pub async fn recv(&self) -> Option<Arc<Message>> {
        self.mailbox.pop().await
    }

    /// Receive without waiting
    pub fn try_recv(&self) -> Option<Arc<Message>> {
        self.mailbox.try_pop()
    }

    /// Take everything currently queued, in delivery order
    pub fn drain(&self) -> Vec<Arc<Message>> {
        std::iter::from_fn(|| self.mailbox.try_pop()).collect()
    }

    pub fn pending(&self) -> usize {
        self.mailbox.len()
    }

    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }
}
