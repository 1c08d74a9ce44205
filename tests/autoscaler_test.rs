//! Autoscaler ticks against an in-memory queue and fleet.

use std::sync::Arc;
use std::time::Duration;

use classify_fleet::models::fleet::{InstanceId, InstanceState};
use classify_fleet::services::autoscaler::{AutoscaleError, Autoscaler, ScalingAction, ScalingPolicy};
use classify_fleet::services::memory::{FleetCommand, MemoryFleet, MemoryQueue};
use classify_fleet::services::queue::QueueClient;
use tokio_util::sync::CancellationToken;

const REQUEST_QUEUE: &str = "test:requests";
const FLEET: &[&str] = &["i-03", "i-01", "i-04", "i-02"];

fn ids(names: &[&str]) -> Vec<InstanceId> {
    names.iter().map(|n| InstanceId::from(*n)).collect()
}

async fn queue_with_depth(depth: usize) -> Arc<MemoryQueue> {
    let queue = Arc::new(MemoryQueue::new(Duration::from_secs(30)));
    for i in 0..depth {
        queue.send(REQUEST_QUEUE, &format!("job-{i}")).await.unwrap();
    }
    queue
}

fn autoscaler(queue: Arc<MemoryQueue>, fleet: Arc<MemoryFleet>) -> Autoscaler {
    Autoscaler::new(
        queue,
        fleet,
        ScalingPolicy {
            jobs_per_instance: 4,
            max_instances: 20,
        },
        REQUEST_QUEUE,
        ids(FLEET),
        Duration::from_millis(20),
    )
}

#[tokio::test]
async fn test_scale_up_starts_lowest_ids() {
    let queue = queue_with_depth(8).await;
    let fleet = Arc::new(MemoryFleet::with_instances(FLEET.iter().copied(), InstanceState::Stopped));
    let scaler = autoscaler(queue, fleet.clone());

    let report = scaler.tick().await.unwrap();

    assert_eq!(report.queue_depth, 8);
    assert_eq!(report.target, 2);
    assert_eq!(report.running, 0);
    assert_eq!(report.action, ScalingAction::Start(ids(&["i-01", "i-02"])));
    assert_eq!(fleet.commands(), vec![FleetCommand::Start(ids(&["i-01", "i-02"]))]);
}

#[tokio::test]
async fn test_starting_instances_are_not_started_twice() {
    let queue = queue_with_depth(8).await;
    let fleet = Arc::new(MemoryFleet::with_instances(FLEET.iter().copied(), InstanceState::Stopped));
    let scaler = autoscaler(queue, fleet.clone());

    scaler.tick().await.unwrap();
    // Still pending, not yet settled.
    let second = scaler.tick().await.unwrap();

    assert_eq!(second.running, 2);
    assert_eq!(second.action, ScalingAction::Hold);
    assert_eq!(fleet.commands().len(), 1);
}

#[tokio::test]
async fn test_identical_inputs_give_identical_commands() {
    let mut commands = Vec::new();
    for _ in 0..3 {
        let queue = queue_with_depth(13).await;
        let fleet = Arc::new(MemoryFleet::with_instances(FLEET.iter().copied(), InstanceState::Stopped));
        autoscaler(queue, fleet.clone()).tick().await.unwrap();
        commands.push(fleet.commands());
    }

    assert_eq!(commands[0], vec![FleetCommand::Start(ids(&["i-01", "i-02", "i-03"]))]);
    assert!(commands.windows(2).all(|pair| pair[0] == pair[1]));
}

#[tokio::test]
async fn test_empty_queue_scales_down_to_one() {
    let queue = queue_with_depth(0).await;
    let fleet = Arc::new(MemoryFleet::with_instances(FLEET.iter().copied(), InstanceState::Running));
    let scaler = autoscaler(queue, fleet.clone());

    let report = scaler.tick().await.unwrap();

    assert_eq!(report.target, 1);
    assert_eq!(report.action, ScalingAction::Stop(ids(&["i-01", "i-02", "i-03"])));
    assert_eq!(fleet.state(&InstanceId::from("i-04")), Some(InstanceState::Running));

    fleet.settle();
    let report = scaler.tick().await.unwrap();
    assert_eq!(report.running, 1);
    assert_eq!(report.action, ScalingAction::Hold);
}

#[tokio::test]
async fn test_target_above_fleet_size_starts_everything_available() {
    let queue = queue_with_depth(400).await;
    let fleet = Arc::new(MemoryFleet::with_instances(FLEET.iter().copied(), InstanceState::Stopped));
    fleet.set_state("i-02", InstanceState::Terminated);
    let scaler = autoscaler(queue, fleet.clone());

    let report = scaler.tick().await.unwrap();

    assert_eq!(report.target, 20);
    assert_eq!(report.action, ScalingAction::Start(ids(&["i-01", "i-03", "i-04"])));
}

#[tokio::test]
async fn test_queue_failure_skips_tick() {
    let queue = queue_with_depth(0).await;
    queue.set_unavailable(true);
    let fleet = Arc::new(MemoryFleet::with_instances(FLEET.iter().copied(), InstanceState::Running));
    let scaler = autoscaler(queue, fleet.clone());

    let err = scaler.tick().await.unwrap_err();

    assert!(matches!(err, AutoscaleError::Queue(_)));
    // An unreadable depth must not be mistaken for an empty queue.
    assert!(fleet.commands().is_empty());
}

#[tokio::test]
async fn test_run_ticks_until_cancelled() {
    let queue = queue_with_depth(8).await;
    let fleet = Arc::new(MemoryFleet::with_instances(FLEET.iter().copied(), InstanceState::Stopped));
    let scaler = autoscaler(queue, fleet.clone());

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(scaler.run(shutdown.clone()));
    tokio::time::sleep(Duration::from_millis(150)).await;
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("autoscaler should stop promptly")
        .unwrap();

    // Later ticks see the started instances as running and hold.
    assert_eq!(fleet.commands(), vec![FleetCommand::Start(ids(&["i-01", "i-02"]))]);
}
