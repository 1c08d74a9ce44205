use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

/// The external image classifier.
///
/// `Ok(None)` means the classifier ran but found nothing to report (e.g. no
/// face detected); that is a valid outcome, not an error.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, image: &Path) -> Result<Option<String>, ClassifierError>;
}

/// Runs `<program> <args...> <image path>` and reads the label from stdout.
pub struct CommandClassifier {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandClassifier {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }
}

#[async_trait]
impl Classifier for CommandClassifier {
    async fn classify(&self, image: &Path) -> Result<Option<String>, ClassifierError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(image)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ClassifierError::Spawn)?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ClassifierError::TimedOut(self.timeout))?
            .map_err(ClassifierError::Spawn)?;

        if !output.status.success() {
            return Err(ClassifierError::Failed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let label = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!label.is_empty()).then_some(label))
    }
}

/// Classifier answering from a precomputed results table.
///
/// The table is a CSV file with `Image` and `Results` columns; an image is
/// looked up by its file name without extension. Unknown images have no
/// result.
pub struct LookupClassifier {
    labels: HashMap<String, String>,
}

#[derive(Deserialize)]
struct LookupRow {
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "Results")]
    results: String,
}

impl LookupClassifier {
    pub fn from_path(path: &Path) -> Result<Self, ClassifierError> {
        let reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
        let classifier = Self::from_csv(reader)?;
        tracing::info!(table = %path.display(), entries = classifier.len(), "Loaded lookup table");
        Ok(classifier)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, ClassifierError> {
        Self::from_csv(csv::ReaderBuilder::new().has_headers(true).from_reader(reader))
    }

    fn from_csv<R: Read>(mut reader: csv::Reader<R>) -> Result<Self, ClassifierError> {
        let mut labels = HashMap::new();
        for row in reader.deserialize::<LookupRow>() {
            let row = row?;
            labels.insert(row.image.trim().to_string(), row.results.trim().to_string());
        }
        Ok(Self { labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[async_trait]
impl Classifier for LookupClassifier {
    async fn classify(&self, image: &Path) -> Result<Option<String>, ClassifierError> {
        let stem = image
            .file_stem()
            .map(|s| s.to_string_lossy())
            .unwrap_or_default();
        Ok(self.labels.get(stem.as_ref()).cloned())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("Failed to run classifier: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Classifier exited with {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },

    #[error("Classifier did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("Failed to load lookup table: {0}")]
    Table(#[from] csv::Error),
}


#[cfg(all(test, unix))]
mod command_tests {
    use super::*;

    fn sh(script: &str) -> CommandClassifier {
        CommandClassifier::new(
            "sh",
            vec!["-c".to_string(), script.to_string(), "classifier".to_string()],
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_label_from_stdout() {
        let classifier = sh("echo \"  alice \"");
        let label = classifier.classify(Path::new("a.jpg")).await.unwrap();
        assert_eq!(label.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_image_path_is_last_argument() {
        let classifier = sh("basename \"$1\"");
        let label = classifier.classify(Path::new("/tmp/x/b.png")).await.unwrap();
        assert_eq!(label.as_deref(), Some("b.png"));
    }

    #[tokio::test]
    async fn test_empty_output_is_no_result() {
        let classifier = sh("true");
        assert_eq!(classifier.classify(Path::new("a.jpg")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_error() {
        let classifier = sh("echo boom >&2; exit 3");
        let err = classifier.classify(Path::new("a.jpg")).await.unwrap_err();
        match err {
            ClassifierError::Failed { code, stderr } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_timeout() {
        let classifier = CommandClassifier::new(
            "sh",
            vec!["-c".to_string(), "sleep 5".to_string()],
            Duration::from_millis(100),
        );
        let err = classifier.classify(Path::new("a.jpg")).await.unwrap_err();
        assert!(matches!(err, ClassifierError::TimedOut(_)));
    }
}
