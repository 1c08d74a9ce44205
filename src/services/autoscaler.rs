//! Fleet autoscaler: sizes the worker fleet from request-queue depth.
//!
//! # Scaling Algorithm
//!
//! ```text
//! target = clamp(depth / jobs_per_instance, 1, max_instances)
//!
//! if target > running:  start (target - running) stopped instances
//! if target < running:  stop  (running - target) running instances
//! ```
//!
//! Candidates are taken in ascending identifier order, so identical inputs
//! always produce identical commands. There is no dead-band: the tick period
//! is the only damping.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::models::fleet::{FleetState, InstanceId};
use crate::services::fleet::{FleetController, FleetError};
use crate::services::queue::{QueueClient, QueueError};

/// Proportional sizing policy: one instance per `jobs_per_instance` queued
/// jobs, never fewer than one, never more than `max_instances`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingPolicy {
    pub jobs_per_instance: u32,
    pub max_instances: u32,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            jobs_per_instance: 4,
            max_instances: 20,
        }
    }
}

impl ScalingPolicy {
    pub fn target(&self, queue_depth: u64) -> u32 {
        let per_instance = u64::from(self.jobs_per_instance.max(1));
        let max = self.max_instances.max(1);
        let wanted = (queue_depth / per_instance).min(u64::from(max)) as u32;
        wanted.max(1)
    }
}

/// Commands for one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScalingAction {
    Start(Vec<InstanceId>),
    Stop(Vec<InstanceId>),
    Hold,
}

/// Decide which instances to start or stop to reach `target`.
///
/// When fewer stopped instances exist than are needed, all of them are
/// started.
pub fn plan(target: u32, fleet: &FleetState) -> ScalingAction {
    let target = target as usize;
    let running = fleet.running.len();

    if target > running {
        let start: Vec<_> = fleet
            .stopped
            .iter()
            .take(target - running)
            .cloned()
            .collect();
        if start.is_empty() {
            ScalingAction::Hold
        } else {
            ScalingAction::Start(start)
        }
    } else if target < running {
        ScalingAction::Stop(fleet.running.iter().take(running - target).cloned().collect())
    } else {
        ScalingAction::Hold
    }
}

/// What a control tick observed and did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub queue_depth: u64,
    pub target: u32,
    pub running: usize,
    pub action: ScalingAction,
}

pub struct Autoscaler {
    queue: Arc<dyn QueueClient>,
    fleet: Arc<dyn FleetController>,
    policy: ScalingPolicy,
    request_queue: String,
    instance_ids: Vec<InstanceId>,
    period: Duration,
}

impl Autoscaler {
    pub fn new(
        queue: Arc<dyn QueueClient>,
        fleet: Arc<dyn FleetController>,
        policy: ScalingPolicy,
        request_queue: impl Into<String>,
        instance_ids: Vec<InstanceId>,
        period: Duration,
    ) -> Self {
        Self {
            queue,
            fleet,
            policy,
            request_queue: request_queue.into(),
            instance_ids,
            period,
        }
    }

    /// One control tick: observe, decide, act.
    pub async fn tick(&self) -> Result<TickReport, AutoscaleError> {
        let queue_depth = self.queue.depth(&self.request_queue).await?;
        let target = self.policy.target(queue_depth);

        let statuses = self.fleet.describe(&self.instance_ids).await?;
        let fleet = FleetState::from_statuses(statuses);
        let action = plan(target, &fleet);

        metrics::gauge!("classify_queue_depth").set(queue_depth as f64);
        metrics::gauge!("classify_fleet_target").set(f64::from(target));
        metrics::gauge!("classify_fleet_running").set(fleet.running.len() as f64);

        match &action {
            ScalingAction::Start(ids) => {
                tracing::info!(
                    queue_depth,
                    target,
                    running = fleet.running.len(),
                    instance_ids = ?ids,
                    "Starting instances"
                );
                self.fleet.start(ids).await?;
            }
            ScalingAction::Stop(ids) => {
                tracing::info!(
                    queue_depth,
                    target,
                    running = fleet.running.len(),
                    instance_ids = ?ids,
                    "Stopping instances"
                );
                self.fleet.stop(ids).await?;
            }
            ScalingAction::Hold => {
                tracing::debug!(queue_depth, target, running = fleet.running.len(), "Fleet at target");
            }
        }

        Ok(TickReport {
            queue_depth,
            target,
            running: fleet.running.len(),
            action,
        })
    }

    /// Tick every `period` until `shutdown` is cancelled. A failed tick is
    /// logged and the next tick retries.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            period_ms = self.period.as_millis() as u64,
            instances = self.instance_ids.len(),
            jobs_per_instance = self.policy.jobs_per_instance,
            max_instances = self.policy.max_instances,
            "Autoscaler started"
        );

        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.tick().await {
                tracing::warn!(error = %e, "Autoscaler tick failed, skipping");
            }
        }
        tracing::info!("Autoscaler stopped");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AutoscaleError {
    #[error("Failed to read queue depth: {0}")]
    Queue(#[from] QueueError),

    #[error("Fleet command failed: {0}")]
    Fleet(#[from] FleetError),
}
