//! Timer-driven background work
//!
//! The timeout scanner and the progress heartbeat both implement
//! [`Periodic`] and run on their own task via [`spawn_periodic`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Work performed once per tick
#[async_trait]
pub trait Periodic: Send + Sync {
    fn name(&self) -> &'static str;

    async fn tick(&self);
}

/// Running periodic task; dropping the handle stops it
#[derive(Debug)]
pub struct PeriodicHandle {
    name: &'static str,
    token: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl PeriodicHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|join| !join.is_finished())
    }

    /// Signal the task and wait for it to exit
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

impl Drop for PeriodicHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Run `work` every `period` until the returned handle is shut down or dropped.
///
/// The first tick fires one full period after spawning. Ticks missed while
/// `work` was busy are skipped rather than replayed.
pub fn spawn_periodic(work: Arc<dyn Periodic>, period: Duration) -> PeriodicHandle {
    let name = work.name();
    let token = CancellationToken::new();
    let child = token.clone();

    let join = tokio::spawn(async move {
        let mut ticks = interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(task = name, period_ms = period.as_millis() as u64, "Periodic task started");
        loop {
            tokio::select! {
                _ = child.cancelled() => break,
                _ = ticks.tick() => {
                    debug!(task = name, "Tick");
                    work.tick().await;
                }
            }
        }
        info!(task = name, "Periodic task stopped");
    });

    PeriodicHandle {
        name,
        token,
        join: Some(join),
    }
}
