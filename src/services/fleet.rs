use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::models::fleet::{InstanceId, InstanceState, InstanceStatus};
use crate::services::worker::Worker;

/// Compute-fleet API over a fixed set of instance identifiers.
#[async_trait]
pub trait FleetController: Send + Sync {
    /// Current lifecycle state of each requested instance.
    async fn describe(&self, ids: &[InstanceId]) -> Result<Vec<InstanceStatus>, FleetError>;

    async fn start(&self, ids: &[InstanceId]) -> Result<(), FleetError>;

    async fn stop(&self, ids: &[InstanceId]) -> Result<(), FleetError>;
}

/// Client for a JSON fleet-management API.
///
/// `POST {endpoint}/instances/describe|start|stop` with
/// `{"instance_ids": [...]}`; describe answers with
/// `{"instances": [{"instance_id": "...", "state": "running"}]}`.
pub struct HttpFleetController {
    http: Client,
    endpoint: String,
    api_token: Option<String>,
}

#[derive(Serialize)]
struct InstanceIdsRequest<'a> {
    instance_ids: &'a [InstanceId],
}

#[derive(Deserialize)]
struct DescribeResponse {
    instances: Vec<InstanceStatus>,
}

impl HttpFleetController {
    pub fn new(endpoint: &str, api_token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_token,
        }
    }

    async fn post(&self, action: &str, ids: &[InstanceId]) -> Result<reqwest::Response, FleetError> {
        let url = format!("{}/instances/{}", self.endpoint, action);
        let mut request = self.http.post(&url).json(&InstanceIdsRequest { instance_ids: ids });
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        request
            .send()
            .await
            .map_err(FleetError::Http)?
            .error_for_status()
            .map_err(FleetError::Http)
    }
}

#[async_trait]
impl FleetController for HttpFleetController {
    async fn describe(&self, ids: &[InstanceId]) -> Result<Vec<InstanceStatus>, FleetError> {
        let response = self.post("describe", ids).await?;
        let body: DescribeResponse = response.json().await.map_err(FleetError::Http)?;
        Ok(body.instances)
    }

    async fn start(&self, ids: &[InstanceId]) -> Result<(), FleetError> {
        self.post("start", ids).await?;
        Ok(())
    }

    async fn stop(&self, ids: &[InstanceId]) -> Result<(), FleetError> {
        self.post("stop", ids).await?;
        Ok(())
    }
}

struct LocalInstance {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// Fleet whose instances are worker tasks inside this process.
///
/// Starting an instance spawns [`Worker::run`]; stopping cancels it. All
/// instances share one `Worker`, each running its own loop.
pub struct LocalFleet {
    worker: Arc<Worker>,
    instances: Mutex<HashMap<InstanceId, LocalInstance>>,
}

impl LocalFleet {
    pub fn new(worker: Arc<Worker>) -> Self {
        Self {
            worker,
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Cancel every running instance.
    pub fn shutdown(&self) {
        for (_, instance) in self.instances.lock().drain() {
            instance.shutdown.cancel();
        }
    }
}

#[async_trait]
impl FleetController for LocalFleet {
    async fn describe(&self, ids: &[InstanceId]) -> Result<Vec<InstanceStatus>, FleetError> {
        let instances = self.instances.lock();
        Ok(ids
            .iter()
            .map(|id| {
                let running = instances
                    .get(id)
                    .is_some_and(|instance| !instance.handle.is_finished());
                InstanceStatus {
                    instance_id: id.clone(),
                    state: if running {
                        InstanceState::Running
                    } else {
                        InstanceState::Stopped
                    },
                }
            })
            .collect())
    }

    async fn start(&self, ids: &[InstanceId]) -> Result<(), FleetError> {
        let mut instances = self.instances.lock();
        for id in ids {
            if instances.get(id).is_some_and(|i| !i.handle.is_finished()) {
                continue;
            }
            let shutdown = CancellationToken::new();
            let worker = Arc::clone(&self.worker);
            let token = shutdown.clone();
            let span = tracing::info_span!("instance", instance_id = %id);
            let handle = tokio::spawn(async move { worker.run(token).await }.instrument(span));
            instances.insert(id.clone(), LocalInstance { shutdown, handle });
        }
        Ok(())
    }

    async fn stop(&self, ids: &[InstanceId]) -> Result<(), FleetError> {
        let mut instances = self.instances.lock();
        for id in ids {
            if let Some(instance) = instances.remove(id) {
                instance.shutdown.cancel();
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("Fleet API request failed: {0}")]
    Http(#[from] reqwest::Error),
}
