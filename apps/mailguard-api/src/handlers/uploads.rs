use std::time::Duration;

use crate::AppState;
use crate::error::{AppError, AppResult};
use crate::handlers::import::{read_form, require_file};
use crate::services::csv_service::FileTypeCheck;
use crate::services::file_upload_service::{FileInfo, UploadOptions, UploadResult, UploadStats};
use axum::{
    Json,
    extract::{Multipart, Path, Query, State},
};
use mailguard_shared::api::ApiResponse;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

const MAX_FILES: usize = 5;

pub async fn upload_multiple(
    State(state): State<AppState>,
    multipart: Multipart,
) -> AppResult<Json<ApiResponse<Vec<UploadResult>>>> {
    let form = read_form(multipart).await?;
    let files: Vec<_> = form.files.into_iter().filter(|f| !f.bytes.is_empty()).collect();
    if files.is_empty() {
        return Err(AppError::validation("No files uploaded"));
    }
    if files.len() > MAX_FILES {
        return Err(AppError::validation(format!(
            "At most {MAX_FILES} files can be uploaded at once"
        )));
    }
    info!("Multiple upload received: {} files", files.len());
    let results = state
        .uploads
        .upload_multiple_files(&files, &UploadOptions::default())
        .await?;
    Ok(Json(ApiResponse::ok(results)))
}

pub async fn validate_file(
    State(state): State<AppState>,
    multipart: Multipart,
) -> AppResult<Json<ApiResponse<FileTypeCheck>>> {
    let mut form = read_form(multipart).await?;
    let file = require_file(&mut form)?;
    Ok(Json(ApiResponse::ok(state.uploads.check_file_type(&file))))
}

pub async fn file_info(
    State(state): State<AppState>,
    Path((job_id, file_name)): Path<(String, String)>,
) -> AppResult<Json<ApiResponse<FileInfo>>> {
    let path = state.uploads.import_file_path(&job_id, &file_name)?;
    Ok(Json(ApiResponse::ok(state.uploads.get_file_info(&path).await)))
}

pub async fn delete_file(
    State(state): State<AppState>,
    Path((job_id, file_name)): Path<(String, String)>,
) -> AppResult<Json<ApiResponse<Value>>> {
    let path = state.uploads.import_file_path(&job_id, &file_name)?;
    if !state.uploads.get_file_info(&path).await.exists {
        return Err(AppError::not_found(format!("File {file_name} not found")));
    }
    if !state.uploads.delete_file(&path).await {
        return Err(AppError::Internal(anyhow::anyhow!(
            "Failed to delete {}",
            path.display()
        )));
    }
    Ok(Json(ApiResponse::ok(json!({
        "jobId": job_id,
        "fileName": file_name,
        "message": "File deleted"
    }))))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupQuery {
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u64,
}

fn default_max_age_hours() -> u64 {
    24
}

pub async fn cleanup(
    State(state): State<AppState>,
    Query(query): Query<CleanupQuery>,
) -> AppResult<Json<ApiResponse<Value>>> {
    let max_age = Duration::from_secs(query.max_age_hours.saturating_mul(3600));
    let cleaned = state.uploads.cleanup_old_files(max_age).await;
    Ok(Json(ApiResponse::ok(json!({
        "cleanedFiles": cleaned,
        "maxAgeHours": query.max_age_hours
    }))))
}

pub async fn upload_stats(State(state): State<AppState>) -> AppResult<Json<ApiResponse<UploadStats>>> {
    Ok(Json(ApiResponse::ok(state.uploads.get_upload_stats().await)))
}
