//! Synchronous submission on top of the asynchronous request/response queues.
//!
//! A caller's `submit` stores the payload, enqueues the job and then waits on
//! its correlation slot. One response poller per process drains the response
//! queue and hands each result to the waiter registered under the same name.
//! Results nobody here is waiting for are released back to the queue so a
//! different gateway process can claim them; after `max_result_deliveries`
//! they are discarded.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::models::job::{Job, JobResult};
use crate::services::correlation::CorrelationTable;
use crate::services::queue::{self, QueueClient, QueueError, QueueMessage};
use crate::services::storage::{ArtifactStore, Container, StorageError};

const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub request_queue: String,
    pub response_queue: String,
    /// Hard deadline for a single submission.
    pub timeout: Duration,
    /// Long-poll wait of each response-queue receive.
    pub response_wait: Duration,
    pub response_batch_size: usize,
    /// Deliveries after which an unclaimed result is dropped.
    pub max_result_deliveries: u32,
    pub result_redelivery_delay: Duration,
}

pub struct Gateway {
    queue: Arc<dyn QueueClient>,
    storage: Arc<dyn ArtifactStore>,
    pending: Arc<CorrelationTable>,
    settings: GatewaySettings,
}

/// What one pass over the response queue did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollSummary {
    pub claimed: usize,
    pub released: usize,
    pub discarded: usize,
}

impl Gateway {
    pub fn new(
        queue: Arc<dyn QueueClient>,
        storage: Arc<dyn ArtifactStore>,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            queue,
            storage,
            pending: Arc::new(CorrelationTable::new()),
            settings,
        }
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub fn pending(&self) -> &CorrelationTable {
        &self.pending
    }

    /// Submit a job and wait for its label.
    ///
    /// Requires [`Gateway::run_response_poller`] to be running for results to
    /// be observed.
    pub async fn submit(&self, file_name: &str, payload: Vec<u8>) -> Result<String, SubmitError> {
        if file_name.trim().is_empty() {
            return Err(SubmitError::InvalidInput("No selected file".to_string()));
        }
        if payload.is_empty() {
            return Err(SubmitError::InvalidInput(format!("File {file_name} is empty")));
        }

        metrics::counter!("classify_jobs_submitted_total").increment(1);
        let start = Instant::now();

        // Registered before enqueueing so a fast result always finds its waiter.
        let mut pending = self.pending.register(file_name);

        if let Err(e) = self.dispatch(file_name, payload).await {
            metrics::counter!("classify_jobs_failed_total").increment(1);
            tracing::error!(file_name, error = %e, "Failed to dispatch job");
            return Err(e);
        }
        tracing::info!(file_name, "Job dispatched, awaiting result");

        let outcome = tokio::time::timeout(self.settings.timeout, pending.recv()).await;
        metrics::histogram!("classify_submit_seconds").record(start.elapsed().as_secs_f64());

        match outcome {
            Ok(Some(label)) => {
                metrics::counter!("classify_jobs_completed_total").increment(1);
                tracing::info!(file_name, label = %label, "Job completed");
                Ok(label)
            }
            Ok(None) => {
                metrics::counter!("classify_jobs_failed_total").increment(1);
                Err(SubmitError::Superseded(file_name.to_string()))
            }
            Err(_) => {
                metrics::counter!("classify_jobs_timed_out_total").increment(1);
                tracing::warn!(
                    file_name,
                    timeout_secs = self.settings.timeout.as_secs(),
                    "Timed out waiting for result"
                );
                Err(SubmitError::Timeout {
                    file_name: file_name.to_string(),
                    timeout: self.settings.timeout,
                })
            }
        }
        // `pending` drops here and removes its entry on every path.
    }

    async fn dispatch(&self, file_name: &str, payload: Vec<u8>) -> Result<(), SubmitError> {
        self.storage
            .put(Container::Input, file_name, &payload, "application/octet-stream")
            .await?;
        let job = Job::new(file_name, payload);
        queue::send_json(self.queue.as_ref(), &self.settings.request_queue, &job).await?;
        Ok(())
    }

    /// Drain the response queue until `shutdown` is cancelled. Idles while
    /// no submission is pending so results stay available to other gateways.
    pub async fn run_response_poller(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(queue = %self.settings.response_queue, "Response poller started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.pending.wait_for_pending() => {}
            }

            let polled = tokio::select! {
                _ = shutdown.cancelled() => break,
                polled = self.poll_responses() => polled,
            };

            if let Err(e) = polled {
                tracing::error!(error = %e, "Error polling response queue, will retry");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                }
            }
        }
        tracing::info!("Response poller stopped");
    }

    /// One receive from the response queue, dispatching every message.
    pub async fn poll_responses(&self) -> Result<PollSummary, QueueError> {
        let messages = self
            .queue
            .receive(
                &self.settings.response_queue,
                self.settings.response_batch_size,
                self.settings.response_wait,
            )
            .await?;

        let mut summary = PollSummary::default();
        for message in messages {
            match self.route_response(&message).await {
                Ok(Routed::Claimed) => summary.claimed += 1,
                Ok(Routed::Released) => summary.released += 1,
                Ok(Routed::Discarded) => summary.discarded += 1,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to settle response message");
                }
            }
        }
        Ok(summary)
    }

    async fn route_response(&self, message: &QueueMessage) -> Result<Routed, QueueError> {
        let result: JobResult = match message.decode() {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(error = %e, body = %message.body, "Discarding malformed result");
                self.queue.ack(message).await?;
                return Ok(Routed::Discarded);
            }
        };

        if self.pending.resolve(&result.file_name, result.result.clone()) {
            // The label is already delivered; a failed ack only means a
            // duplicate that will go unclaimed.
            if let Err(e) = self.queue.ack(message).await {
                tracing::warn!(file_name = %result.file_name, error = %e, "Failed to acknowledge claimed result");
            }
            return Ok(Routed::Claimed);
        }

        metrics::counter!("classify_unclaimed_results_total").increment(1);
        if message.receive_count >= self.settings.max_result_deliveries {
            tracing::info!(
                file_name = %result.file_name,
                deliveries = message.receive_count,
                "Discarding result nobody claimed"
            );
            self.queue.ack(message).await?;
            Ok(Routed::Discarded)
        } else {
            tracing::debug!(
                file_name = %result.file_name,
                deliveries = message.receive_count,
                "Releasing result awaited elsewhere"
            );
            self.queue
                .release(message, self.settings.result_redelivery_delay)
                .await?;
            Ok(Routed::Released)
        }
    }
}

enum Routed {
    Claimed,
    Released,
    Discarded,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("Timed out after {timeout:?} waiting for the result of {file_name}")]
    Timeout { file_name: String, timeout: Duration },

    #[error("Submission for {0} was superseded by a newer one with the same name")]
    Superseded(String),

    #[error("Failed to store payload: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to enqueue job: {0}")]
    Queue(#[from] QueueError),
}

impl SubmitError {
    /// Transient infrastructure failure; the caller may retry the whole
    /// submission.
    pub fn is_infra(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Queue(_) | Self::Superseded(_))
    }
}
