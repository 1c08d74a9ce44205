//! In-process implementations of the queue, store and fleet contracts.
//!
//! Used by the test suites and for single-process local runs. The queue
//! simulates visibility timeouts: a received message is hidden until it is
//! acknowledged, released, or the timeout elapses.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::models::fleet::{InstanceId, InstanceState, InstanceStatus};
use crate::services::fleet::{FleetController, FleetError};
use crate::services::queue::{QueueClient, QueueError, QueueMessage, ReceiptHandle};
use crate::services::storage::{ArtifactStore, Container, StorageError};

#[derive(Debug)]
struct StoredMessage {
    id: u64,
    body: String,
    visible_at: Option<Instant>,
    receive_count: u32,
}

/// In-memory queue with visibility timeout simulation.
pub struct MemoryQueue {
    queues: Mutex<HashMap<String, VecDeque<StoredMessage>>>,
    next_id: AtomicU64,
    visibility_timeout: Duration,
    arrived: Notify,
    unavailable: AtomicBool,
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            visibility_timeout,
            arrived: Notify::new(),
            unavailable: AtomicBool::new(false),
        }
    }

    /// All messages in `queue`, visible or in flight.
    pub fn len(&self, queue: &str) -> usize {
        self.queues.lock().get(queue).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }

    /// Bodies of all messages in `queue`, in queue order.
    pub fn bodies(&self, queue: &str) -> Vec<String> {
        self.queues
            .lock()
            .get(queue)
            .map(|q| q.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Make every call fail, simulating an outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), QueueError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("memory queue switched off".to_string()));
        }
        Ok(())
    }

    /// Take up to `max` visible messages, or report when the next hidden one
    /// becomes visible.
    fn take_visible(
        &self,
        queue: &str,
        max: usize,
    ) -> (Vec<QueueMessage>, Option<Instant>) {
        let now = Instant::now();
        let mut queues = self.queues.lock();
        let Some(messages) = queues.get_mut(queue) else {
            return (Vec::new(), None);
        };

        let mut taken = Vec::new();
        let mut next_visible: Option<Instant> = None;
        for message in messages.iter_mut() {
            match message.visible_at {
                Some(at) if at > now => {
                    next_visible = Some(next_visible.map_or(at, |n| n.min(at)));
                }
                _ if taken.len() < max => {
                    message.visible_at = Some(now + self.visibility_timeout);
                    message.receive_count += 1;
                    taken.push(QueueMessage {
                        queue: queue.to_string(),
                        body: message.body.clone(),
                        receipt: ReceiptHandle::new(message.id.to_string()),
                        receive_count: message.receive_count,
                    });
                }
                _ => {}
            }
        }
        (taken, next_visible)
    }

    fn receipt_id(message: &QueueMessage) -> Result<u64, QueueError> {
        message
            .receipt
            .as_str()
            .parse()
            .map_err(|_| QueueError::UnknownReceipt(message.receipt.as_str().to_string()))
    }
}

#[async_trait]
impl QueueClient for MemoryQueue {
    async fn send(&self, queue: &str, body: &str) -> Result<(), QueueError> {
        self.check_available()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.queues
            .lock()
            .entry(queue.to_string())
            .or_default()
            .push_back(StoredMessage {
                id,
                body: body.to_string(),
                visible_at: None,
                receive_count: 0,
            });
        self.arrived.notify_waiters();
        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        self.check_available()?;
        if max_messages == 0 {
            return Ok(Vec::new());
        }
        let deadline = Instant::now() + wait;
        loop {
            let arrived = self.arrived.notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();

            let (taken, next_visible) = self.take_visible(queue, max_messages);
            if !taken.is_empty() {
                return Ok(taken);
            }
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }

            let wake_at = next_visible.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = &mut arrived => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, message: &QueueMessage) -> Result<(), QueueError> {
        self.check_available()?;
        let id = Self::receipt_id(message)?;
        let mut queues = self.queues.lock();
        let messages = queues
            .get_mut(&message.queue)
            .ok_or_else(|| QueueError::UnknownReceipt(message.receipt.as_str().to_string()))?;
        match messages.iter().position(|m| m.id == id) {
            Some(pos) => {
                messages.remove(pos);
                Ok(())
            }
            None => Err(QueueError::UnknownReceipt(id.to_string())),
        }
    }

    async fn release(&self, message: &QueueMessage, delay: Duration) -> Result<(), QueueError> {
        self.check_available()?;
        let id = Self::receipt_id(message)?;
        {
            let mut queues = self.queues.lock();
            let stored = queues
                .get_mut(&message.queue)
                .and_then(|messages| messages.iter_mut().find(|m| m.id == id))
                .ok_or_else(|| QueueError::UnknownReceipt(id.to_string()))?;
            stored.visible_at = (!delay.is_zero()).then(|| Instant::now() + delay);
        }
        self.arrived.notify_waiters();
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<u64, QueueError> {
        self.check_available()?;
        let now = Instant::now();
        let queues = self.queues.lock();
        let depth = queues.get(queue).map_or(0, |messages| {
            messages
                .iter()
                .filter(|m| m.visible_at.map_or(true, |at| at <= now))
                .count()
        });
        Ok(depth as u64)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        self.check_available()
    }
}

/// In-memory artifact store that counts writes.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<(Container, String), Vec<u8>>>,
    puts: AtomicU64,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object(&self, container: Container, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .get(&(container, key.to_string()))
            .cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    /// Total successful `put` calls, overwrites included.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn put(
        &self,
        container: Container,
        key: &str,
        data: &[u8],
        _content_type: &str,
    ) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(format!("put {container}/{key}")));
        }
        self.objects
            .lock()
            .insert((container, key.to_string()), data.to_vec());
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, container: Container, key: &str) -> Result<Vec<u8>, StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(format!("get {container}/{key}")));
        }
        self.object(container, key).ok_or_else(|| StorageError::NotFound {
            container,
            key: key.to_string(),
        })
    }
}

/// A start or stop command issued to a [`MemoryFleet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetCommand {
    Start(Vec<InstanceId>),
    Stop(Vec<InstanceId>),
}

/// Fleet that records commands. Started instances go to `pending`, stopped
/// ones to `stopping`, mirroring a real compute API.
#[derive(Default)]
pub struct MemoryFleet {
    states: Mutex<BTreeMap<InstanceId, InstanceState>>,
    commands: Mutex<Vec<FleetCommand>>,
}

impl MemoryFleet {
    pub fn with_instances<I, S>(ids: I, state: InstanceState) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<InstanceId>,
    {
        let fleet = Self::default();
        {
            let mut states = fleet.states.lock();
            for id in ids {
                states.insert(id.into(), state);
            }
        }
        fleet
    }

    pub fn set_state(&self, id: impl Into<InstanceId>, state: InstanceState) {
        self.states.lock().insert(id.into(), state);
    }

    pub fn state(&self, id: &InstanceId) -> Option<InstanceState> {
        self.states.lock().get(id).copied()
    }

    /// Settle transitional states, as the provider would after a while.
    pub fn settle(&self) {
        for state in self.states.lock().values_mut() {
            *state = match *state {
                InstanceState::Pending => InstanceState::Running,
                InstanceState::Stopping => InstanceState::Stopped,
                other => other,
            };
        }
    }

    pub fn commands(&self) -> Vec<FleetCommand> {
        self.commands.lock().clone()
    }
}

#[async_trait]
impl FleetController for MemoryFleet {
    async fn describe(&self, ids: &[InstanceId]) -> Result<Vec<InstanceStatus>, FleetError> {
        let states = self.states.lock();
        Ok(ids
            .iter()
            .filter_map(|id| {
                states.get(id).map(|state| InstanceStatus {
                    instance_id: id.clone(),
                    state: *state,
                })
            })
            .collect())
    }

    async fn start(&self, ids: &[InstanceId]) -> Result<(), FleetError> {
        let mut states = self.states.lock();
        for id in ids {
            states.insert(id.clone(), InstanceState::Pending);
        }
        self.commands.lock().push(FleetCommand::Start(ids.to_vec()));
        Ok(())
    }

    async fn stop(&self, ids: &[InstanceId]) -> Result<(), FleetError> {
        let mut states = self.states.lock();
        for id in ids {
            states.insert(id.clone(), InstanceState::Stopping);
        }
        self.commands.lock().push(FleetCommand::Stop(ids.to_vec()));
        Ok(())
    }
}
