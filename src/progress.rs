//! Progress tracking for long-running operations
//!
//! Percent complete only ever moves forward. Milestones fire once per
//! threshold, and a heartbeat check flags operations that have gone quiet.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ProgressConfig;
use crate::error::{ParleyError, Result};
use crate::ticker::{spawn_periodic, Periodic, PeriodicHandle};

/// Snapshot of one tracked operation
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressRecord {
    pub operation_id: String,
    /// Always within `[0, 100]`
    pub percent: f64,
    pub activity: String,
    pub total_steps: Option<u32>,
    pub completed_steps: u32,
    pub started_at: Instant,
    pub last_update: Instant,
    pub milestones_emitted: BTreeSet<u8>,
    pub stalled: bool,
    pub completed: bool,
    /// Finished or abandoned; no longer watched by the heartbeat
    pub closed: bool,
}

/// Broadcast to progress observers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started {
        operation_id: String,
        total_steps: Option<u32>,
    },
    Updated {
        operation_id: String,
        percent: f64,
        activity: String,
    },
    Milestone {
        operation_id: String,
        threshold: u8,
    },
    Stalled {
        operation_id: String,
        idle_ms: u64,
    },
    Completed {
        operation_id: String,
    },
    /// Closed without reaching 100%
    Abandoned {
        operation_id: String,
        percent: f64,
    },
}

/// Tracks percent-complete state per operation id
pub struct ProgressTracker {
    records: Mutex<HashMap<String, ProgressRecord>>,
    milestones: Vec<u8>,
    stall_after: Duration,
    heartbeat_interval: Duration,
    events: broadcast::Sender<ProgressEvent>,
}

impl ProgressTracker {
    pub fn new(config: &ProgressConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            records: Mutex::new(HashMap::new()),
            milestones: config.milestones.clone(),
            stall_after: config.stall_after,
            heartbeat_interval: config.heartbeat_interval,
            events,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Run [`check_stalled`](Self::check_stalled) every `heartbeat_interval`
    pub fn spawn_heartbeat(self: &Arc<Self>) -> PeriodicHandle {
        spawn_periodic(Arc::clone(self) as Arc<dyn Periodic>, self.heartbeat_interval)
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    fn emit(&self, events: Vec<ProgressEvent>) {
        for event in events {
            // no observers is fine
            let _ = self.events.send(event);
        }
    }

    /// Begin tracking an operation
    pub fn start_operation(&self, operation_id: &str, total_steps: Option<u32>) -> Result<()> {
        if operation_id.trim().is_empty() {
            return Err(ParleyError::invalid("operation_id", "must not be empty"));
        }
        if total_steps == Some(0) {
            return Err(ParleyError::invalid("total_steps", "must be > 0 when given"));
        }

        {
            let mut records = self.records.lock();
            if records.contains_key(operation_id) {
                return Err(ParleyError::invalid(
                    "operation_id",
                    format!("{operation_id} is already tracked"),
                ));
            }
            let now = Instant::now();
            records.insert(
                operation_id.to_string(),
                ProgressRecord {
                    operation_id: operation_id.to_string(),
                    percent: 0.0,
                    activity: String::new(),
                    total_steps,
                    completed_steps: 0,
                    started_at: now,
                    last_update: now,
                    milestones_emitted: BTreeSet::new(),
                    stalled: false,
                    completed: false,
                    closed: false,
                },
            );
        }

        debug!(operation_id, ?total_steps, "Operation started");
        self.emit(vec![ProgressEvent::Started {
            operation_id: operation_id.to_string(),
            total_steps,
        }]);
        Ok(())
    }

    /// Record progress; lower values than already reported are ignored
    pub fn update_progress(&self, operation_id: &str, percent: f64, activity: &str) -> Result<f64> {
        if percent.is_nan() {
            return Err(ParleyError::invalid("percent", "must be a number"));
        }

        let (current, events) = {
            let mut records = self.records.lock();
            let record = records
                .get_mut(operation_id)
                .ok_or_else(|| ParleyError::NotFound(format!("operation {operation_id}")))?;
            let events = self.advance(record, percent, activity);
            (record.percent, events)
        };

        self.emit(events);
        Ok(current)
    }

    /// Count one finished step and derive percent from the step total
    pub fn complete_step(&self, operation_id: &str, activity: &str) -> Result<f64> {
        let (current, events) = {
            let mut records = self.records.lock();
            let record = records
                .get_mut(operation_id)
                .ok_or_else(|| ParleyError::NotFound(format!("operation {operation_id}")))?;

            record.completed_steps += 1;
            let percent = match record.total_steps {
                Some(total) => f64::from(record.completed_steps) * 100.0 / f64::from(total),
                None => record.percent,
            };
            let events = self.advance(record, percent, activity);
            (record.percent, events)
        };

        self.emit(events);
        Ok(current)
    }

    /// Mark an operation finished at 100%
    pub fn complete_operation(&self, operation_id: &str) -> Result<()> {
        let events = {
            let mut records = self.records.lock();
            let record = records
                .get_mut(operation_id)
                .ok_or_else(|| ParleyError::NotFound(format!("operation {operation_id}")))?;
            if record.completed {
                return Ok(());
            }

            let activity = record.activity.clone();
            let mut events = self.advance(record, 100.0, &activity);
            record.completed = true;
            record.closed = true;
            events.push(ProgressEvent::Completed {
                operation_id: operation_id.to_string(),
            });
            events
        };

        info!(operation_id, "Operation completed");
        self.emit(events);
        Ok(())
    }

    /// Stop watching an operation that will not finish, keeping its percent
    pub fn close_operation(&self, operation_id: &str) -> Result<()> {
        let event = {
            let mut records = self.records.lock();
            let record = records
                .get_mut(operation_id)
                .ok_or_else(|| ParleyError::NotFound(format!("operation {operation_id}")))?;
            if record.closed {
                return Ok(());
            }
            record.closed = true;
            record.stalled = false;
            ProgressEvent::Abandoned {
                operation_id: operation_id.to_string(),
                percent: record.percent,
            }
        };

        debug!(operation_id, "Operation closed");
        self.emit(vec![event]);
        Ok(())
    }

    fn advance(&self, record: &mut ProgressRecord, percent: f64, activity: &str) -> Vec<ProgressEvent> {
        let clamped = percent.clamp(0.0, 100.0);
        record.percent = record.percent.max(clamped);
        if !activity.is_empty() {
            record.activity = activity.to_string();
        }
        record.last_update = Instant::now();
        record.stalled = false;

        let mut events = vec![ProgressEvent::Updated {
            operation_id: record.operation_id.clone(),
            percent: record.percent,
            activity: record.activity.clone(),
        }];
        for &threshold in &self.milestones {
            if record.percent >= f64::from(threshold) && record.milestones_emitted.insert(threshold) {
                debug!(operation_id = %record.operation_id, threshold, "Milestone reached");
                events.push(ProgressEvent::Milestone {
                    operation_id: record.operation_id.clone(),
                    threshold,
                });
            }
        }
        events
    }

    pub fn get_progress(&self, operation_id: &str) -> Option<ProgressRecord> {
        self.records.lock().get(operation_id).cloned()
    }

    /// Stop tracking an operation
    pub fn remove(&self, operation_id: &str) -> Option<ProgressRecord> {
        self.records.lock().remove(operation_id)
    }

    pub fn operations(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.records.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Flag unfinished operations with no update since `now - stall_after`.
    ///
    /// Returns the ids newly flagged by this call.
    pub fn check_stalled(&self, now: Instant) -> Vec<String> {
        let (flagged, events) = {
            let mut records = self.records.lock();
            let mut flagged = Vec::new();
            let mut events = Vec::new();
            for record in records.values_mut() {
                if record.closed || record.stalled {
                    continue;
                }
                let idle = now.saturating_duration_since(record.last_update);
                if idle > self.stall_after {
                    record.stalled = true;
                    flagged.push(record.operation_id.clone());
                    events.push(ProgressEvent::Stalled {
                        operation_id: record.operation_id.clone(),
                        idle_ms: idle.as_millis() as u64,
                    });
                }
            }
            flagged.sort();
            (flagged, events)
        };

        for operation_id in &flagged {
            warn!(operation_id = %operation_id, "Operation stalled");
        }
        self.emit(events);
        flagged
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(&ProgressConfig::default())
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("operations", &self.records.lock().len())
            .field("milestones", &self.milestones)
            .finish()
    }
}

#[async_trait]
impl Periodic for ProgressTracker {
    fn name(&self) -> &'static str {
        "progress-heartbeat"
    }

    async fn tick(&self) {
        self.check_stalled(Instant::now());
    }
}
