//! Recovery policy for failed and timed-out tasks
//!
//! The policy is an ordered list of strategies. After each failure the
//! orchestrator asks for the next strategy that applies to the task; each
//! strategy is used at most once per task, and running out of strategies
//! abandons the task.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ParleyError, Result};
use crate::message::AgentId;
use crate::workflow::{ExecutionMode, StepSpec, Task};

/// One way of retrying a failed step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryStrategy {
    /// Same agent, same parameters
    RetrySame,
    /// Run alone; only applies after a failure under parallel dispatch
    Sequential,
    /// Hand the step to the configured substitute agent
    SubstituteAgent,
    /// Degraded parameters and `degraded` execution mode
    Degraded,
}

impl RecoveryStrategy {
    pub const ALL: [RecoveryStrategy; 4] = [
        RecoveryStrategy::RetrySame,
        RecoveryStrategy::Sequential,
        RecoveryStrategy::SubstituteAgent,
        RecoveryStrategy::Degraded,
    ];
}

/// What to do with a failed task
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    Retry {
        strategy: RecoveryStrategy,
        agent: AgentId,
        params: Value,
        mode: ExecutionMode,
    },
    Abandon,
}

/// Ordered recovery strategies plus agent substitutions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecoveryPolicy {
    pub strategies: Vec<RecoveryStrategy>,
    /// Replacement agent for each agent that may be disabled
    pub substitutes: HashMap<AgentId, AgentId>,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            strategies: RecoveryStrategy::ALL.to_vec(),
            substitutes: HashMap::new(),
        }
    }
}

impl RecoveryPolicy {
    /// A policy that abandons on the first failure
    pub fn none() -> Self {
        Self {
            strategies: Vec::new(),
            substitutes: HashMap::new(),
        }
    }

    pub fn with_strategies(mut self, strategies: Vec<RecoveryStrategy>) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn with_substitute(mut self, agent: impl Into<AgentId>, substitute: impl Into<AgentId>) -> Self {
        self.substitutes.insert(agent.into(), substitute.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        for (i, strategy) in self.strategies.iter().enumerate() {
            if self.strategies[..i].contains(strategy) {
                return Err(ParleyError::Config(format!(
                    "recovery strategy {strategy:?} listed twice"
                )));
            }
        }
        for (agent, substitute) in &self.substitutes {
            if agent.is_empty() || substitute.is_empty() {
                return Err(ParleyError::Config(
                    "recovery substitutes must name non-empty agents".to_string(),
                ));
            }
            if agent == substitute {
                return Err(ParleyError::Config(format!(
                    "{agent} cannot substitute for itself"
                )));
            }
        }
        Ok(())
    }

    /// Pick the next applicable strategy and advance the task's cursor
    pub fn next_action(&self, task: &mut Task, spec: &StepSpec) -> RecoveryAction {
        while let Some(strategy) = self.strategies.get(task.recovery_cursor).copied() {
            task.recovery_cursor += 1;
            if let Some(action) = self.apply(strategy, task, spec) {
                return action;
            }
        }
        RecoveryAction::Abandon
    }

    fn apply(&self, strategy: RecoveryStrategy, task: &Task, spec: &StepSpec) -> Option<RecoveryAction> {
        let (agent, params, mode) = match strategy {
            RecoveryStrategy::RetrySame => (task.agent.clone(), task.params.clone(), task.mode),
            RecoveryStrategy::Sequential => {
                if !task.concurrent {
                    return None;
                }
                (task.agent.clone(), task.params.clone(), ExecutionMode::Sequential)
            }
            RecoveryStrategy::SubstituteAgent => {
                let substitute = self.substitutes.get(&task.agent)?;
                (substitute.clone(), task.params.clone(), task.mode)
            }
            RecoveryStrategy::Degraded => {
                let params = spec.degraded_params.clone().unwrap_or_else(|| spec.params.clone());
                (task.agent.clone(), params, ExecutionMode::Degraded)
            }
        };

        Some(RecoveryAction::Retry {
            strategy,
            agent,
            params,
            mode,
        })
    }
}
