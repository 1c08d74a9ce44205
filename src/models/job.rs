use std::path::Path;

use serde::{Deserialize, Serialize};

/// A classification job as it travels on the request queue.
///
/// `file_name` is the correlation key end-to-end; the image bytes are carried
/// base64-encoded in `imageData`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub file_name: String,
    #[serde(with = "base64_bytes")]
    pub image_data: Vec<u8>,
}

/// A classification outcome published by a worker on the response queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub file_name: String,
    pub result: String,
}

impl Job {
    pub fn new(file_name: impl Into<String>, image_data: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            image_data,
        }
    }

    /// Key of the label artifact in the output container.
    pub fn output_key(&self) -> String {
        output_key(&self.file_name)
    }
}

/// `<name without extension>.txt`, e.g. `a.jpg` -> `a.txt`.
pub fn output_key(file_name: &str) -> String {
    Path::new(file_name)
        .with_extension("txt")
        .to_string_lossy()
        .into_owned()
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
