use std::collections::HashMap;

use axum::extract::{Multipart, State};
use axum::Json;

use crate::app_state::AppState;
use crate::routes::ApiError;

/// Multipart field carrying the image.
pub const FILE_FIELD: &str = "inputFile";

/// POST /: Upload an image and wait for its label.
///
/// Responds `{"<file name>": "<label>"}`.
pub async fn classify_image(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<HashMap<String, String>>, ApiError> {
    let mut upload: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Malformed multipart body: {e}")))?
    {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let file_name = field.file_name().unwrap_or_default().to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("Failed to read upload: {e}")))?;
        upload = Some((file_name, data.to_vec()));
    }

    let (file_name, data) = upload.ok_or_else(|| ApiError::bad_request("No file uploaded"))?;
    if file_name.is_empty() {
        return Err(ApiError::bad_request("No selected file"));
    }

    let label = state.gateway.submit(&file_name, data).await?;
    Ok(Json(HashMap::from([(file_name, label)])))
}
