use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use crate::app_state::AppState;
use crate::models::job::output_key;
use crate::routes::ApiError;
use crate::services::storage::{Container, StorageError};

/// GET /results/{file_name}: Stored label of a finished job.
///
/// Lets a caller whose submission timed out pick the label up later.
pub async fn get_result(
    State(state): State<AppState>,
    Path(file_name): Path<String>,
) -> Result<Json<HashMap<String, String>>, ApiError> {
    match state.storage.get(Container::Output, &output_key(&file_name)).await {
        Ok(bytes) => {
            let label = String::from_utf8_lossy(&bytes).trim().to_string();
            Ok(Json(HashMap::from([(file_name, label)])))
        }
        Err(StorageError::NotFound { .. }) => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("No result for {file_name} yet"),
        )),
        Err(e) => {
            tracing::error!(file_name = %file_name, error = %e, "Failed to read stored result");
            Err(ApiError::internal("Failed to read stored result"))
        }
    }
}
