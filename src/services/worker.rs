use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::models::job::{Job, JobResult};
use crate::services::classifier::{Classifier, ClassifierError};
use crate::services::queue::{self, QueueClient, QueueError, QueueMessage};
use crate::services::storage::{ArtifactStore, Container, StorageError};

const ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub request_queue: String,
    pub response_queue: String,
    /// Long-poll wait of each request-queue receive.
    pub receive_wait: Duration,
    /// Directory for scratch copies of the payload handed to the classifier.
    pub scratch_dir: PathBuf,
    /// Label published when the classifier finds nothing. A miss is a
    /// terminal answer for the caller, so it is published and acknowledged
    /// like any other label instead of being left to time out.
    pub miss_label: String,
}

/// Outcome of one poll of the request queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Processed {
    Labelled { file_name: String, label: String },
    /// The message could never be processed and was dropped.
    Rejected,
    Idle,
}

/// Single consumer of the request queue: classify, publish, then acknowledge.
pub struct Worker {
    queue: Arc<dyn QueueClient>,
    storage: Arc<dyn ArtifactStore>,
    classifier: Arc<dyn Classifier>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn QueueClient>,
        storage: Arc<dyn ArtifactStore>,
        classifier: Arc<dyn Classifier>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            storage,
            classifier,
            settings,
        }
    }

    /// Poll-process-acknowledge until `shutdown` is cancelled. A failed
    /// iteration is logged and the loop carries on.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(queue = %self.settings.request_queue, "Worker ready, starting job processing loop");
        loop {
            let outcome = tokio::select! {
                _ = shutdown.cancelled() => break,
                outcome = self.process_next() => outcome,
            };

            match outcome {
                Ok(Processed::Labelled { file_name, .. }) => {
                    tracing::debug!(file_name = %file_name, "Job processed, checking for next job");
                }
                Ok(Processed::Rejected) => {}
                Ok(Processed::Idle) => {
                    // The long-poll wait already throttles an empty queue.
                    tracing::trace!("No jobs available");
                }
                Err(e) => {
                    metrics::counter!("classify_worker_failures_total").increment(1);
                    tracing::error!(error = %e, "Error processing job, message left for redelivery");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                    }
                }
            }
        }
        tracing::info!("Worker stopped");
    }

    /// Receive and process at most one job.
    ///
    /// On error the message is left unacknowledged so the queue redelivers
    /// it after its visibility timeout.
    pub async fn process_next(&self) -> Result<Processed, WorkerError> {
        let message = match self
            .queue
            .receive(&self.settings.request_queue, 1, self.settings.receive_wait)
            .await?
            .into_iter()
            .next()
        {
            Some(message) => message,
            None => return Ok(Processed::Idle),
        };

        let job: Job = match message.decode() {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(error = %e, "Dropping malformed job message");
                self.queue.ack(&message).await?;
                return Ok(Processed::Rejected);
            }
        };

        tracing::info!(
            file_name = %job.file_name,
            deliveries = message.receive_count,
            bytes = job.image_data.len(),
            "Processing classification job"
        );

        let label = self.classify(&job).await?;
        self.publish(&job, &label, &message).await?;

        metrics::counter!("classify_worker_processed_total").increment(1);
        tracing::info!(file_name = %job.file_name, label = %label, "Job completed successfully");

        Ok(Processed::Labelled {
            file_name: job.file_name,
            label,
        })
    }

    async fn classify(&self, job: &Job) -> Result<String, WorkerError> {
        let scratch = write_scratch(&self.settings.scratch_dir, &job.file_name, &job.image_data).await?;

        let start = Instant::now();
        let outcome = self.classifier.classify(scratch.path()).await;
        tracing::debug!(
            file_name = %job.file_name,
            classify_ms = start.elapsed().as_millis() as u64,
            "Classifier finished"
        );
        // `scratch` is removed on drop, whichever way the classifier went.

        match outcome? {
            Some(label) => Ok(label),
            None => {
                tracing::info!(file_name = %job.file_name, "Classifier found nothing");
                Ok(self.settings.miss_label.clone())
            }
        }
    }

    /// Store the label, publish the result, and only then acknowledge the
    /// request.
    async fn publish(&self, job: &Job, label: &str, message: &QueueMessage) -> Result<(), WorkerError> {
        self.storage
            .put(Container::Output, &job.output_key(), label.as_bytes(), "text/plain")
            .await?;

        let result = JobResult {
            file_name: job.file_name.clone(),
            result: label.to_string(),
        };
        queue::send_json(self.queue.as_ref(), &self.settings.response_queue, &result).await?;

        self.queue.ack(message).await?;
        Ok(())
    }
}

/// Scratch copy of a payload. Its directory is removed on drop.
struct ScratchFile {
    _dir: tempfile::TempDir,
    path: PathBuf,
}

impl ScratchFile {
    fn path(&self) -> &Path {
        &self.path
    }
}

/// Write the payload under a fresh directory in `dir`, keeping the final
/// path component of `file_name` as the file name.
async fn write_scratch(dir: &Path, file_name: &str, data: &[u8]) -> Result<ScratchFile, WorkerError> {
    let dir = dir.to_path_buf();
    let base = Path::new(file_name)
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| "payload".into());
    let data = data.to_vec();

    tokio::task::spawn_blocking(move || -> std::io::Result<ScratchFile> {
        std::fs::create_dir_all(&dir)?;
        let scratch_dir = tempfile::Builder::new().prefix("job-").tempdir_in(&dir)?;
        let path = scratch_dir.path().join(base);
        std::fs::write(&path, data)?;
        Ok(ScratchFile {
            _dir: scratch_dir,
            path,
        })
    })
    .await
    .map_err(|e| WorkerError::Scratch(std::io::Error::other(e)))?
    .map_err(WorkerError::Scratch)
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Classification failed: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("Scratch file error: {0}")]
    Scratch(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scratch_file_keeps_name_and_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = write_scratch(dir.path(), "../../etc/face.jpg", b"pixels")
            .await
            .unwrap();
        let path = scratch.path().to_path_buf();
        let job_dir = path.parent().unwrap().to_path_buf();

        assert_eq!(job_dir.parent().unwrap(), dir.path());
        assert_eq!(path.file_name().unwrap(), "face.jpg");
        assert_eq!(std::fs::read(&path).unwrap(), b"pixels");

        drop(scratch);
        assert!(!path.exists());
        assert!(!job_dir.exists());
    }

    #[tokio::test]
    async fn test_same_name_scratch_files_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_scratch(dir.path(), "a.jpg", b"one").await.unwrap();
        let second = write_scratch(dir.path(), "a.jpg", b"two").await.unwrap();

        assert_ne!(first.path(), second.path());
        assert_eq!(std::fs::read(first.path()).unwrap(), b"one");
        assert_eq!(std::fs::read(second.path()).unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_unusable_name_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = write_scratch(dir.path(), "..", b"pixels").await.unwrap();
        assert_eq!(scratch.path().file_name().unwrap(), "payload");
    }
}
