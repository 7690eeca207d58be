use std::collections::BTreeMap;

use crate::AppState;
use crate::error::{AppError, AppResult};
use crate::services::bulk_import_service::{
    CsvStructure, DuplicateCheck, ImportJobDetails, ImportJobSummary,
};
use crate::services::file_upload_service::IncomingFile;
use axum::{
    Json,
    extract::{Multipart, Path, Query, State},
};
use mailguard_db::models::{
    ImportJobStatus, ImportOptions, ImportResult, ImportResultStatus, JobAggregates, JobFilter,
};
use mailguard_shared::api::{ApiResponse, Paginated};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};
use uuid::Uuid;

/// Fields of an upload form. Unknown fields are ignored.
#[derive(Debug, Default)]
pub(crate) struct UploadForm {
    pub files: Vec<IncomingFile>,
    pub options: Option<String>,
    pub user_id: Option<String>,
}

pub(crate) async fn read_form(mut multipart: Multipart) -> AppResult<UploadForm> {
    let mut form = UploadForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::validation(format!("Malformed multipart body: {e}")))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        match name.as_str() {
            "file" | "files" => {
                let original_name = field.file_name().unwrap_or("upload.csv").to_string();
                let mime_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::validation(format!("Failed to read uploaded file: {e}")))?;
                form.files.push(IncomingFile {
                    original_name,
                    mime_type,
                    bytes: bytes.to_vec(),
                });
            }
            "options" | "userId" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::validation(format!("Failed to read field {name}: {e}")))?;
                if text.trim().is_empty() {
                    continue;
                }
                if name == "options" {
                    form.options = Some(text);
                } else {
                    form.user_id = Some(text.trim().to_string());
                }
            }
            other => warn!("Ignoring unexpected multipart field '{}'", other),
        }
    }
    Ok(form)
}

pub(crate) fn require_file(form: &mut UploadForm) -> AppResult<IncomingFile> {
    if form.files.is_empty() {
        return Err(AppError::validation("No file uploaded"));
    }
    let file = form.files.swap_remove(0);
    if file.bytes.is_empty() {
        return Err(AppError::validation("No file uploaded"));
    }
    Ok(file)
}

fn parse_options(raw: Option<&str>) -> AppResult<ImportOptions> {
    match raw {
        None => Ok(ImportOptions::default()),
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| AppError::validation(format!("Invalid import options: {e}"))),
    }
}

fn parse_job_status(raw: Option<&str>) -> AppResult<Option<ImportJobStatus>> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => serde_json::from_value(Value::String(s.to_lowercase()))
            .map(Some)
            .map_err(|_| AppError::validation(format!("Unknown job status: {s}"))),
    }
}

fn parse_result_status(raw: Option<&str>) -> AppResult<Option<ImportResultStatus>> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => serde_json::from_value(Value::String(s.to_lowercase()))
            .map(Some)
            .map_err(|_| AppError::validation(format!("Unknown result status: {s}"))),
    }
}

pub async fn upload(
    State(state): State<AppState>,
    multipart: Multipart,
) -> AppResult<Json<ApiResponse<ImportJobDetails>>> {
    let mut form = read_form(multipart).await?;
    let file = require_file(&mut form)?;
    let options = parse_options(form.options.as_deref())?;
    info!(
        "Import upload received: {} ({} bytes)",
        file.original_name,
        file.size()
    );
    let job = state
        .imports
        .create_import_job(&file, options, form.user_id)
        .await?;
    Ok(Json(ApiResponse::ok(job)))
}

pub async fn validate_csv(
    State(state): State<AppState>,
    multipart: Multipart,
) -> AppResult<Json<ApiResponse<CsvStructure>>> {
    let mut form = read_form(multipart).await?;
    let file = require_file(&mut form)?;
    Ok(Json(ApiResponse::ok(state.imports.validate_csv_structure(&file))))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobListQuery {
    pub user_id: Option<String>,
    pub status: Option<String>,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub limit: u32,
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobListQuery>,
) -> AppResult<Json<ApiResponse<Paginated<ImportJobSummary>>>> {
    let filter = JobFilter {
        status: parse_job_status(query.status.as_deref())?,
        user_id: query.user_id.filter(|u| !u.is_empty()),
        page: query.page,
        limit: query.limit.min(100),
    };
    Ok(Json(ApiResponse::ok(state.imports.list_import_jobs(filter).await?)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsQuery {
    pub user_id: Option<String>,
}

pub async fn statistics(
    State(state): State<AppState>,
    Query(query): Query<StatisticsQuery>,
) -> AppResult<Json<ApiResponse<JobAggregates>>> {
    let stats = state
        .imports
        .get_import_statistics(query.user_id.as_deref().filter(|u| !u.is_empty()))
        .await?;
    Ok(Json(ApiResponse::ok(stats)))
}

pub async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<ImportJobSummary>>> {
    Ok(Json(ApiResponse::ok(
        state.imports.get_import_job_summary(job_id).await?,
    )))
}

pub async fn job_details(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<ImportJobDetails>>> {
    Ok(Json(ApiResponse::ok(state.imports.get_import_job(job_id).await?)))
}

#[derive(Debug, Default, Deserialize)]
pub struct ResultsQuery {
    pub status: Option<String>,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub limit: u32,
}

pub async fn job_results(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Query(query): Query<ResultsQuery>,
) -> AppResult<Json<ApiResponse<Paginated<ImportResult>>>> {
    let status = parse_result_status(query.status.as_deref())?;
    let results = state
        .imports
        .get_import_results(job_id, status, query.page, query.limit.min(1000))
        .await?;
    Ok(Json(ApiResponse::ok(results)))
}

pub async fn retry_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<ImportJobDetails>>> {
    Ok(Json(ApiResponse::ok(state.imports.retry_import_job(job_id).await?)))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<Value>>> {
    state.imports.cancel_import_job(job_id).await?;
    Ok(Json(ApiResponse::ok(json!({
        "jobId": job_id,
        "message": "Import job cancelled"
    }))))
}

#[derive(Debug, Deserialize)]
pub struct DuplicateCheckRequest {
    #[serde(default)]
    pub emails: Vec<String>,
}

const MAX_DUPLICATE_CHECK: usize = 1000;

pub async fn check_duplicates(
    State(state): State<AppState>,
    Json(req): Json<DuplicateCheckRequest>,
) -> AppResult<Json<ApiResponse<BTreeMap<String, DuplicateCheck>>>> {
    if req.emails.is_empty() {
        return Err(AppError::validation("Emails array is required"));
    }
    if req.emails.len() > MAX_DUPLICATE_CHECK {
        return Err(AppError::validation(format!(
            "At most {MAX_DUPLICATE_CHECK} emails can be checked at once"
        )));
    }
    Ok(Json(ApiResponse::ok(state.imports.check_duplicates(&req.emails).await?)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_filters_accept_known_values_only() {
        assert_eq!(parse_job_status(Some("Completed")).unwrap(), Some(ImportJobStatus::Completed));
        assert_eq!(parse_job_status(Some("pending")).unwrap(), Some(ImportJobStatus::Created));
        assert_eq!(parse_job_status(Some("")).unwrap(), None);
        assert!(matches!(parse_job_status(Some("done")), Err(AppError::Validation(_))));

        assert_eq!(parse_result_status(Some("risky")).unwrap(), Some(ImportResultStatus::Risky));
        assert!(parse_result_status(Some("maybe")).is_err());
    }

    fn file(name: &str, body: &[u8]) -> IncomingFile {
        IncomingFile {
            original_name: name.to_string(),
            mime_type: "text/csv".to_string(),
            bytes: body.to_vec(),
        }
    }

    #[test]
    fn first_uploaded_file_is_required() {
        let mut form = UploadForm::default();
        assert!(require_file(&mut form).is_err());

        form.files = vec![file("a.csv", b"email\n"), file("b.csv", b"email\n")];
        assert_eq!(require_file(&mut form).unwrap().original_name, "a.csv");

        form.files = vec![file("empty.csv", b"")];
        assert!(require_file(&mut form).is_err());
    }

    #[test]
    fn options_default_when_absent() {
        let opts = parse_options(None).unwrap();
        assert_eq!(opts, ImportOptions::default());
        let opts = parse_options(Some(r#"{"duplicateHandling":"update","validationThreshold":60}"#)).unwrap();
        assert_eq!(opts.validation_threshold, 60);
        assert!(parse_options(Some("{not json")).is_err());
    }
}
