use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use garde::Validate;
use serde::Deserialize;

use crate::models::fleet::InstanceId;
use crate::services::autoscaler::ScalingPolicy;
use crate::services::classifier::{Classifier, ClassifierError, CommandClassifier, LookupClassifier};
use crate::services::gateway::GatewaySettings;
use crate::services::storage::S3Settings;
use crate::services::worker::WorkerSettings;

/// Which fleet API the autoscaler drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FleetBackend {
    /// Remote fleet API at `FLEET_ENDPOINT`.
    #[default]
    Http,
    /// Worker tasks inside the gateway process.
    Local,
}

/// How workers turn an image into a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierBackend {
    /// External program at `CLASSIFIER_COMMAND`.
    #[default]
    Command,
    /// Precomputed results table at `CLASSIFIER_TABLE`.
    Lookup,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    #[garde(skip)]
    pub bind_addr: String,

    /// Redis connection string for both queues
    #[garde(length(min = 1))]
    pub redis_url: String,

    #[serde(default = "default_request_queue")]
    #[garde(length(min = 1))]
    pub request_queue: String,

    #[serde(default = "default_response_queue")]
    #[garde(length(min = 1))]
    pub response_queue: String,

    #[serde(default = "default_input_bucket")]
    #[garde(length(min = 1))]
    pub input_bucket: String,

    #[serde(default = "default_output_bucket")]
    #[garde(length(min = 1))]
    pub output_bucket: String,

    #[serde(default = "default_s3_region")]
    #[garde(length(min = 1))]
    pub s3_region: String,

    /// S3 endpoint URL; defaults to the AWS endpoint of `s3_region`
    #[serde(default)]
    #[garde(skip)]
    pub s3_endpoint: Option<String>,

    /// Access key; the default credential chain is used when unset
    #[serde(default)]
    #[garde(skip)]
    pub s3_access_key: Option<String>,

    #[serde(default)]
    #[garde(skip)]
    pub s3_secret_key: Option<String>,

    /// Path-style addressing, needed by most self-hosted S3 servers
    #[serde(default)]
    #[garde(skip)]
    pub s3_path_style: bool,

    #[serde(default = "default_jobs_per_instance")]
    #[garde(range(min = 1))]
    pub jobs_per_instance: u32,

    #[serde(default = "default_max_instances")]
    #[garde(range(min = 1))]
    pub max_instances: u32,

    #[serde(default = "default_autoscale_period_secs")]
    #[garde(range(min = 1))]
    pub autoscale_period_secs: u64,

    /// How long a submission waits for its result
    #[serde(default = "default_gateway_timeout_secs")]
    #[garde(range(min = 1))]
    pub gateway_timeout_secs: u64,

    #[serde(default = "default_response_wait_secs")]
    #[garde(range(max = 20))]
    pub response_wait_secs: u64,

    #[serde(default = "default_response_batch_size")]
    #[garde(range(min = 1, max = 10))]
    pub response_batch_size: usize,

    #[serde(default = "default_request_wait_secs")]
    #[garde(range(max = 20))]
    pub request_wait_secs: u64,

    #[serde(default = "default_visibility_timeout_secs")]
    #[garde(range(min = 1))]
    pub visibility_timeout_secs: u64,

    #[serde(default = "default_max_result_deliveries")]
    #[garde(range(min = 1))]
    pub max_result_deliveries: u32,

    #[serde(default = "default_result_redelivery_delay_secs")]
    #[garde(skip)]
    pub result_redelivery_delay_secs: u64,

    #[serde(default)]
    #[garde(skip)]
    pub fleet_backend: FleetBackend,

    /// Fleet API base URL (required for the http backend)
    #[serde(default)]
    #[garde(skip)]
    pub fleet_endpoint: Option<String>,

    #[serde(default)]
    #[garde(skip)]
    pub fleet_api_token: Option<String>,

    /// Comma-separated, fixed set of fleet instance ids
    #[serde(default)]
    #[garde(skip)]
    pub instance_ids: Vec<String>,

    /// Scratch directory for payloads handed to the classifier
    #[serde(default)]
    #[garde(skip)]
    pub scratch_dir: Option<PathBuf>,

    #[serde(default)]
    #[garde(skip)]
    pub classifier: ClassifierBackend,

    /// CSV results table (`Image,Results`) for the lookup classifier
    #[serde(default)]
    #[garde(skip)]
    pub classifier_table: Option<PathBuf>,

    #[serde(default = "default_classifier_command")]
    #[garde(length(min = 1))]
    pub classifier_command: String,

    #[serde(default = "default_classifier_args")]
    #[garde(skip)]
    pub classifier_args: Vec<String>,

    #[serde(default = "default_classifier_timeout_secs")]
    #[garde(range(min = 1))]
    pub classifier_timeout_secs: u64,

    /// Label reported when the classifier finds nothing
    #[serde(default = "default_miss_label")]
    #[garde(length(min = 1))]
    pub miss_label: String,

    #[serde(default = "default_max_upload_bytes")]
    #[garde(range(min = 1))]
    pub max_upload_bytes: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_request_queue() -> String {
    "classify:requests".to_string()
}

fn default_response_queue() -> String {
    "classify:responses".to_string()
}

fn default_input_bucket() -> String {
    "classify-input".to_string()
}

fn default_output_bucket() -> String {
    "classify-output".to_string()
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

fn default_jobs_per_instance() -> u32 {
    4
}

fn default_max_instances() -> u32 {
    20
}

fn default_autoscale_period_secs() -> u64 {
    5
}

fn default_gateway_timeout_secs() -> u64 {
    300
}

fn default_response_wait_secs() -> u64 {
    20
}

fn default_response_batch_size() -> usize {
    10
}

fn default_request_wait_secs() -> u64 {
    19
}

fn default_visibility_timeout_secs() -> u64 {
    30
}

fn default_max_result_deliveries() -> u32 {
    5
}

fn default_result_redelivery_delay_secs() -> u64 {
    1
}

fn default_classifier_command() -> String {
    "python3".to_string()
}

fn default_classifier_args() -> Vec<String> {
    vec!["face_recognition.py".to_string()]
}

fn default_classifier_timeout_secs() -> u64 {
    120
}

fn default_miss_label() -> String {
    "no detection".to_string()
}

fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_vars(std::env::vars())
    }

    /// Build from explicit `(KEY, value)` pairs.
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: Self = envy::from_iter(vars)?;
        config.validate()?;
        Ok(config)
    }

    /// Fleet API base URL; only the http fleet backend needs one.
    pub fn fleet_endpoint(&self) -> Result<&str, ConfigError> {
        self.fleet_endpoint
            .as_deref()
            .filter(|endpoint| !endpoint.is_empty())
            .ok_or(ConfigError::MissingFleetEndpoint)
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            request_queue: self.request_queue.clone(),
            response_queue: self.response_queue.clone(),
            timeout: Duration::from_secs(self.gateway_timeout_secs),
            response_wait: Duration::from_secs(self.response_wait_secs),
            response_batch_size: self.response_batch_size,
            max_result_deliveries: self.max_result_deliveries,
            result_redelivery_delay: Duration::from_secs(self.result_redelivery_delay_secs),
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            request_queue: self.request_queue.clone(),
            response_queue: self.response_queue.clone(),
            receive_wait: Duration::from_secs(self.request_wait_secs),
            scratch_dir: self
                .scratch_dir
                .clone()
                .unwrap_or_else(|| std::env::temp_dir().join("classify-scratch")),
            miss_label: self.miss_label.clone(),
        }
    }

    pub fn s3_settings(&self) -> S3Settings {
        S3Settings {
            input_bucket: self.input_bucket.clone(),
            output_bucket: self.output_bucket.clone(),
            region: self.s3_region.clone(),
            endpoint: self
                .s3_endpoint
                .clone()
                .unwrap_or_else(|| format!("https://s3.{}.amazonaws.com", self.s3_region)),
            access_key: self.s3_access_key.clone(),
            secret_key: self.s3_secret_key.clone(),
            path_style: self.s3_path_style,
        }
    }

    /// Build the configured classifier. Loading a lookup table reads the
    /// whole file, so call this at startup.
    pub fn build_classifier(&self) -> Result<Arc<dyn Classifier>, ConfigError> {
        match self.classifier {
            ClassifierBackend::Command => Ok(Arc::new(CommandClassifier::new(
                &self.classifier_command,
                self.classifier_args.clone(),
                self.classifier_timeout(),
            ))),
            ClassifierBackend::Lookup => {
                let table = self
                    .classifier_table
                    .as_deref()
                    .ok_or(ConfigError::MissingClassifierTable)?;
                Ok(Arc::new(LookupClassifier::from_path(table)?))
            }
        }
    }

    pub fn scaling_policy(&self) -> ScalingPolicy {
        ScalingPolicy {
            jobs_per_instance: self.jobs_per_instance,
            max_instances: self.max_instances,
        }
    }

    pub fn instance_ids(&self) -> Vec<InstanceId> {
        self.instance_ids
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .map(InstanceId::from)
            .collect()
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn classifier_timeout(&self) -> Duration {
        Duration::from_secs(self.classifier_timeout_secs)
    }

    pub fn autoscale_period(&self) -> Duration {
        Duration::from_secs(self.autoscale_period_secs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] garde::Report),

    #[error("FLEET_ENDPOINT is required when FLEET_BACKEND=http")]
    MissingFleetEndpoint,

    #[error("CLASSIFIER_TABLE is required when CLASSIFIER=lookup")]
    MissingClassifierTable,

    #[error("Failed to build classifier: {0}")]
    Classifier(#[from] ClassifierError),
}
