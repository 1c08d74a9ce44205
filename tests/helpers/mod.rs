//! Test helpers: an in-memory deployment of gateway, worker and fleet.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use classify_fleet::services::classifier::{Classifier, ClassifierError};
use classify_fleet::services::gateway::{Gateway, GatewaySettings};
use classify_fleet::services::memory::{MemoryQueue, MemoryStore};
use classify_fleet::services::worker::{Worker, WorkerSettings};

pub const REQUEST_QUEUE: &str = "test:requests";
pub const RESPONSE_QUEUE: &str = "test:responses";
pub const MISS_LABEL: &str = "no detection";

/// Classifier answering from a fixed table keyed by the original file stem.
/// Names starting with `fail` make it error, unknown names yield no result.
pub struct TableClassifier {
    labels: Vec<(&'static str, &'static str)>,
    calls: AtomicUsize,
}

impl TableClassifier {
    pub fn new(labels: &[(&'static str, &'static str)]) -> Self {
        Self {
            labels: labels.to_vec(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Classifier for TableClassifier {
    async fn classify(&self, image: &Path) -> Result<Option<String>, ClassifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(image.exists(), "scratch file must exist while classifying");

        let stem = image.file_stem().unwrap().to_string_lossy().into_owned();

        if stem.starts_with("fail") {
            return Err(ClassifierError::Failed {
                code: Some(1),
                stderr: "model crashed".to_string(),
            });
        }
        Ok(self
            .labels
            .iter()
            .find(|(name, _)| *name == stem.as_str())
            .map(|(_, label)| label.to_string()))
    }
}

pub fn gateway_settings(timeout: Duration) -> GatewaySettings {
    GatewaySettings {
        request_queue: REQUEST_QUEUE.to_string(),
        response_queue: RESPONSE_QUEUE.to_string(),
        timeout,
        response_wait: Duration::from_millis(50),
        response_batch_size: 10,
        max_result_deliveries: 3,
        result_redelivery_delay: Duration::from_millis(10),
    }
}

pub fn worker_settings(scratch_dir: &Path) -> WorkerSettings {
    WorkerSettings {
        request_queue: REQUEST_QUEUE.to_string(),
        response_queue: RESPONSE_QUEUE.to_string(),
        receive_wait: Duration::from_millis(50),
        scratch_dir: scratch_dir.to_path_buf(),
        miss_label: MISS_LABEL.to_string(),
    }
}

/// Queue, store, gateway (with its poller running) and a worker that is not
/// started until asked.
pub struct Harness {
    pub queue: Arc<MemoryQueue>,
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<Gateway>,
    pub classifier: Arc<TableClassifier>,
    pub worker: Arc<Worker>,
    pub shutdown: CancellationToken,
    pub scratch: tempfile::TempDir,
}

impl Harness {
    pub fn new(timeout: Duration, labels: &[(&'static str, &'static str)]) -> Self {
        let queue = Arc::new(MemoryQueue::new(Duration::from_millis(200)));
        let store = Arc::new(MemoryStore::new());
        let classifier = Arc::new(TableClassifier::new(labels));
        let scratch = tempfile::tempdir().expect("Failed to create scratch dir");

        let gateway = Arc::new(Gateway::new(
            queue.clone(),
            store.clone(),
            gateway_settings(timeout),
        ));
        let worker = Arc::new(Worker::new(
            queue.clone(),
            store.clone(),
            classifier.clone(),
            worker_settings(scratch.path()),
        ));

        let shutdown = CancellationToken::new();
        tokio::spawn(gateway.clone().run_response_poller(shutdown.clone()));

        Self {
            queue,
            store,
            gateway,
            classifier,
            worker,
            shutdown,
            scratch,
        }
    }

    /// Run the worker loop in the background until the harness shuts down.
    pub fn start_worker(&self) {
        let worker = self.worker.clone();
        let token = self.shutdown.child_token();
        tokio::spawn(async move { worker.run(token).await });
    }

    /// Whether the scratch directory has no files left behind.
    pub fn scratch_is_empty(&self) -> bool {
        std::fs::read_dir(self.scratch.path())
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
