use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use mailguard_db::models::{
    ColumnMapping, ImportJob, ImportJobStatus, ImportOptions, ImportResult, ImportResultStatus,
    JobAggregates, JobFilter, NewImportJob, ValidationSummary,
};
use mailguard_db::{ImportStore, SubscriberStore};
use mailguard_shared::api::Paginated;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::UploadConfig;
use crate::error::{AppError, AppResult};
use crate::services::csv_service::{
    ColumnSuggestion, CsvRow, detect_columns, parse_csv_bytes, parse_csv_file,
    validate_column_mapping, validate_file_type,
};
use crate::services::file_security_service::FileSecurityService;
use crate::services::file_upload_service::{FileUploadService, IncomingFile, UploadOptions};

const SAMPLE_ROWS: usize = 5;

/// Upload directory key of a job: the folder its source file lives in.
pub fn upload_key(job: &ImportJob) -> Option<String> {
    Path::new(&job.file_path)
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportJobSummary {
    pub id: Uuid,
    pub file_name: String,
    pub status: ImportJobStatus,
    pub total_records: i64,
    pub processed_records: i64,
    pub valid_records: i64,
    pub invalid_records: i64,
    pub risky_records: i64,
    pub duplicate_records: i64,
    pub imported_records: i64,
    pub progress_percentage: i32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&ImportJob> for ImportJobSummary {
    fn from(job: &ImportJob) -> Self {
        Self {
            id: job.id,
            file_name: job.file_name.clone(),
            status: job.status,
            total_records: job.total_records,
            processed_records: job.processed_records,
            valid_records: job.valid_records,
            invalid_records: job.invalid_records,
            risky_records: job.risky_records,
            duplicate_records: job.duplicate_records,
            imported_records: job.imported_records,
            progress_percentage: job.progress_percentage,
            created_at: job.created_at,
            completed_at: job.completed_at,
            error: job.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportJobDetails {
    #[serde(flatten)]
    pub summary: ImportJobSummary,
    pub original_file_name: String,
    pub file_path: String,
    pub options: ImportOptions,
    pub column_mapping: ColumnMapping,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_summary: Option<ValidationSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl From<&ImportJob> for ImportJobDetails {
    fn from(job: &ImportJob) -> Self {
        Self {
            summary: job.into(),
            original_file_name: job.original_file_name.clone(),
            file_path: job.file_path.clone(),
            options: job.options.clone(),
            column_mapping: job.column_mapping.clone(),
            validation_summary: job.validation_summary.clone(),
            user_id: job.user_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateType {
    Exact,
    None,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateCheck {
    pub is_duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing_subscriber_id: Option<Uuid>,
    pub duplicate_type: DuplicateType,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CsvStructure {
    pub is_valid: bool,
    pub headers: Vec<String>,
    pub sample_data: Vec<CsvRow>,
    pub suggestions: Vec<ColumnSuggestion>,
    pub errors: Vec<String>,
}

pub struct BulkImportService {
    imports: Arc<dyn ImportStore>,
    subscribers: Arc<dyn SubscriberStore>,
    uploads: Arc<FileUploadService>,
    security: Arc<FileSecurityService>,
    upload_config: UploadConfig,
    queue: mpsc::Sender<Uuid>,
}

impl BulkImportService {
    pub fn new(
        imports: Arc<dyn ImportStore>,
        subscribers: Arc<dyn SubscriberStore>,
        uploads: Arc<FileUploadService>,
        security: Arc<FileSecurityService>,
        upload_config: &UploadConfig,
        queue: mpsc::Sender<Uuid>,
    ) -> Self {
        Self {
            imports,
            subscribers,
            uploads,
            security,
            upload_config: upload_config.clone(),
            queue,
        }
    }

    async fn load_job(&self, id: Uuid) -> AppResult<ImportJob> {
        self.imports
            .get_job(id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Import job {id} not found")))
    }

    async fn remove_job_files(&self, job: &ImportJob) {
        if let Some(key) = upload_key(job) {
            self.security
                .automatic_sensitive_file_cleanup(Some(&key), Duration::ZERO)
                .await;
        }
    }

    pub async fn create_import_job(
        &self,
        file: &IncomingFile,
        options: ImportOptions,
        user_id: Option<String>,
    ) -> AppResult<ImportJobDetails> {
        info!("Creating import job for file: {}", file.original_name);

        if options.validation_threshold > 100 {
            return Err(AppError::validation("validationThreshold must be between 0 and 100"));
        }

        let upload = self.uploads.upload_file(file, &UploadOptions::default()).await?;

        let parsed = match parse_csv_file(&upload.file_path).await {
            Ok(parsed) => parsed,
            Err(e) => {
                self.uploads.delete_file(&upload.file_path).await;
                return Err(AppError::validation(format!("Failed to parse CSV file: {e:#}")));
            }
        };
        if !parsed.errors.is_empty() {
            warn!(
                "CSV parsing warnings for {}: {} rows skipped",
                upload.job_id,
                parsed.errors.len()
            );
        }

        let mapping_errors = validate_column_mapping(&options.column_mapping, &parsed.headers);
        if !mapping_errors.is_empty() {
            self.uploads.delete_file(&upload.file_path).await;
            return Err(AppError::validation(format!(
                "Invalid column mapping provided: {}",
                mapping_errors.join(", ")
            )));
        }

        let job = self
            .imports
            .create_job(NewImportJob {
                file_name: upload.file_name.clone(),
                original_file_name: upload.original_file_name.clone(),
                file_path: upload.file_path.display().to_string(),
                total_records: parsed.total_rows() as i64,
                options,
                user_id,
            })
            .await?;

        self.enqueue(&job).await?;
        info!("Import job created successfully: {}", job.id);
        Ok((&job).into())
    }

    async fn enqueue(&self, job: &ImportJob) -> AppResult<()> {
        if self.queue.send(job.id).await.is_err() {
            error!("Import queue closed, failing job {}", job.id);
            self.imports
                .set_job_status(job.id, ImportJobStatus::Failed, Some("Import queue unavailable"))
                .await?;
            return Err(AppError::Internal(anyhow!("import queue is closed")));
        }
        Ok(())
    }

    pub async fn get_import_job(&self, id: Uuid) -> AppResult<ImportJobDetails> {
        Ok((&self.load_job(id).await?).into())
    }

    pub async fn get_import_job_summary(&self, id: Uuid) -> AppResult<ImportJobSummary> {
        Ok((&self.load_job(id).await?).into())
    }

    pub async fn list_import_jobs(&self, mut filter: JobFilter) -> AppResult<Paginated<ImportJobSummary>> {
        if filter.page == 0 {
            filter.page = 1;
        }
        if filter.limit == 0 {
            filter.limit = 20;
        }
        let (jobs, total) = self.imports.list_jobs(&filter).await?;
        Ok(Paginated::new(
            jobs.iter().map(ImportJobSummary::from).collect(),
            total,
            filter.page,
            filter.limit,
        ))
    }

    pub async fn cancel_import_job(&self, id: Uuid) -> AppResult<()> {
        let job = self.load_job(id).await?;
        if job.status.is_terminal() {
            return Err(AppError::validation(format!(
                "Cannot cancel job in {} status",
                job.status.as_str()
            )));
        }
        self.imports
            .set_job_status(id, ImportJobStatus::Failed, Some("Job cancelled by user"))
            .await?;
        self.remove_job_files(&job).await;
        info!("Import job {} cancelled", id);
        Ok(())
    }

    pub async fn retry_import_job(&self, id: Uuid) -> AppResult<ImportJobDetails> {
        let job = self.load_job(id).await?;
        if job.status != ImportJobStatus::Failed {
            return Err(AppError::validation(format!(
                "Only failed jobs can be retried (current status: {})",
                job.status.as_str()
            )));
        }
        if !tokio::fs::try_exists(&job.file_path).await.unwrap_or(false) {
            return Err(AppError::validation(format!(
                "Source file for import job {id} no longer exists"
            )));
        }

        self.imports.delete_results(id).await?;
        self.imports.reset_job(id).await?;
        let job = self.load_job(id).await?;
        self.enqueue(&job).await?;
        info!("Import job {} queued for retry", id);
        Ok((&job).into())
    }

    pub async fn get_import_results(
        &self,
        id: Uuid,
        status: Option<ImportResultStatus>,
        page: u32,
        limit: u32,
    ) -> AppResult<Paginated<ImportResult>> {
        self.load_job(id).await?;
        let page = page.max(1);
        let limit = if limit == 0 { 100 } else { limit };
        let (results, total) = self.imports.list_results(id, status, page, limit).await?;
        Ok(Paginated::new(results, total, page, limit))
    }

    pub async fn check_duplicates(&self, emails: &[String]) -> AppResult<BTreeMap<String, DuplicateCheck>> {
        let normalized: Vec<String> = emails.iter().map(|e| e.trim().to_lowercase()).collect();
        let existing = self.subscribers.find_subscribers_by_emails(&normalized).await?;

        Ok(normalized
            .into_iter()
            .map(|email| {
                let check = match existing.iter().find(|s| s.email == email) {
                    Some(sub) => DuplicateCheck {
                        is_duplicate: true,
                        existing_subscriber_id: Some(sub.id),
                        duplicate_type: DuplicateType::Exact,
                    },
                    None => DuplicateCheck {
                        is_duplicate: false,
                        existing_subscriber_id: None,
                        duplicate_type: DuplicateType::None,
                    },
                };
                (email, check)
            })
            .collect())
    }

    /// Header, sample and mapping suggestions for a file, without storing it.
    pub fn validate_csv_structure(&self, file: &IncomingFile) -> CsvStructure {
        let check = validate_file_type(
            &file.original_name,
            &file.mime_type,
            file.size(),
            self.upload_config.max_file_size,
            &self.upload_config.allowed_mime_types,
        );
        if !check.is_valid {
            return CsvStructure {
                errors: check.errors,
                ..Default::default()
            };
        }

        match parse_csv_bytes(&file.bytes) {
            Ok(parsed) => {
                let detection = detect_columns(&parsed.headers, &parsed.rows);
                CsvStructure {
                    is_valid: parsed.errors.is_empty(),
                    sample_data: parsed.rows.iter().take(SAMPLE_ROWS).cloned().collect(),
                    suggestions: detection.suggestions,
                    errors: parsed
                        .errors
                        .iter()
                        .map(|e| format!("Row {}: {}", e.row, e.message))
                        .collect(),
                    headers: parsed.headers,
                }
            }
            Err(e) => {
                error!("CSV structure validation failed: {:#}", e);
                CsvStructure {
                    errors: vec![format!("{e:#}")],
                    ..Default::default()
                }
            }
        }
    }

    pub async fn get_import_statistics(&self, user_id: Option<&str>) -> AppResult<JobAggregates> {
        Ok(self.imports.job_aggregates(user_id).await?)
    }

    /// Remove jobs older than `days`. A job that fails to clean up is skipped.
    pub async fn cleanup_old_jobs(&self, days: i64) -> AppResult<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let jobs = self.imports.jobs_created_before(cutoff).await?;
        let mut cleaned = 0;
        for job in jobs {
            self.remove_job_files(&job).await;
            if tokio::fs::try_exists(&job.file_path).await.unwrap_or(false) {
                self.uploads.delete_file(Path::new(&job.file_path)).await;
            }
            match self.imports.delete_job(job.id).await {
                Ok(()) => cleaned += 1,
                Err(e) => warn!("Failed to cleanup job {}: {:#}", job.id, e),
            }
        }
        info!("Cleaned up {} old import jobs", cleaned);
        Ok(cleaned)
    }
}
