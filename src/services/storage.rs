use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use strum::Display;

/// Logical container an artifact lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Container {
    /// Submitted payloads, keyed by the original file name.
    Input,
    /// Classification labels, keyed by `<basename>.txt`.
    Output,
}

/// Durable blob storage keyed by name.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(
        &self,
        container: Container,
        key: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError>;

    async fn get(&self, container: Container, key: &str) -> Result<Vec<u8>, StorageError>;
}

/// Connection settings for an S3-compatible endpoint.
#[derive(Debug, Clone)]
pub struct S3Settings {
    pub input_bucket: String,
    pub output_bucket: String,
    pub region: String,
    pub endpoint: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub path_style: bool,
}

/// S3-compatible object storage with one bucket per container.
pub struct S3Store {
    input: Box<Bucket>,
    output: Box<Bucket>,
}

impl S3Store {
    pub fn new(settings: &S3Settings) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: settings.region.clone(),
            endpoint: settings.endpoint.clone(),
        };

        let credentials = Credentials::new(
            settings.access_key.as_deref(),
            settings.secret_key.as_deref(),
            None,
            None,
            None,
        )
        .map_err(|e| StorageError::Config(e.to_string()))?;

        let open = |name: &str| -> Result<Box<Bucket>, StorageError> {
            let bucket = Bucket::new(name, region.clone(), credentials.clone())
                .map_err(|e| StorageError::Config(e.to_string()))?;
            Ok(if settings.path_style {
                bucket.with_path_style()
            } else {
                bucket
            })
        };

        Ok(Self {
            input: open(&settings.input_bucket)?,
            output: open(&settings.output_bucket)?,
        })
    }

    fn bucket(&self, container: Container) -> &Bucket {
        match container {
            Container::Input => &self.input,
            Container::Output => &self.output,
        }
    }
}

#[async_trait]
impl ArtifactStore for S3Store {
    async fn put(
        &self,
        container: Container,
        key: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError> {
        let response = self
            .bucket(container)
            .put_object_with_content_type(key, data, content_type)
            .await
            .map_err(StorageError::S3)?;
        check_status(response.status_code(), container, key)
    }

    async fn get(&self, container: Container, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self
            .bucket(container)
            .get_object(key)
            .await
            .map_err(StorageError::S3)?;
        check_status(response.status_code(), container, key)?;
        Ok(response.bytes().to_vec())
    }
}

fn check_status(status: u16, container: Container, key: &str) -> Result<(), StorageError> {
    match status {
        200..=299 => Ok(()),
        404 => Err(StorageError::NotFound {
            container,
            key: key.to_string(),
        }),
        _ => Err(StorageError::Status {
            container,
            key: key.to_string(),
            status,
        }),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Object {container}/{key} not found")]
    NotFound { container: Container, key: String },

    #[error("Object store returned status {status} for {container}/{key}")]
    Status {
        container: Container,
        key: String,
        status: u16,
    },

    #[error("Storage configuration error: {0}")]
    Config(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}
