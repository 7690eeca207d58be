use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::models::{
    ColumnMapping, ImportCounts, ImportJob, ImportJobStatus, ImportOptions, ImportResult,
    ImportResultStatus, JobAggregates, JobFilter, NewImportJob, NewImportResult,
    ValidationSummary,
};
use crate::store::{ImportStore, page_offset};

const JOB_COLUMNS: &str = "id, file_name, original_file_name, file_path, status, total_records, \
     processed_records, valid_records, invalid_records, risky_records, duplicate_records, \
     imported_records, options, column_mapping, validation_summary, error, user_id, \
     progress_percentage, created_at, completed_at";

const RESULT_COLUMNS: &str = "id, import_job_id, row_number, email, status, confidence_score, \
     issues, suggestions, original_data, mailer_check, imported, subscriber_id, error, created_at";

#[derive(Debug, Clone)]
pub struct ImportRepository {
    pool: PgPool,
}

impl ImportRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_job(row: &PgRow) -> Result<ImportJob> {
        let summary: Option<Json<ValidationSummary>> = row.try_get("validation_summary")?;
        Ok(ImportJob {
            id: row.try_get("id")?,
            file_name: row.try_get("file_name")?,
            original_file_name: row.try_get("original_file_name")?,
            file_path: row.try_get("file_path")?,
            status: ImportJobStatus::parse(&row.try_get::<String, _>("status")?),
            total_records: row.try_get("total_records")?,
            processed_records: row.try_get("processed_records")?,
            valid_records: row.try_get("valid_records")?,
            invalid_records: row.try_get("invalid_records")?,
            risky_records: row.try_get("risky_records")?,
            duplicate_records: row.try_get("duplicate_records")?,
            imported_records: row.try_get("imported_records")?,
            options: row.try_get::<Json<ImportOptions>, _>("options")?.0,
            column_mapping: row.try_get::<Json<ColumnMapping>, _>("column_mapping")?.0,
            validation_summary: summary.map(|s| s.0),
            error: row.try_get("error")?,
            user_id: row.try_get("user_id")?,
            progress_percentage: row.try_get("progress_percentage")?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn row_to_result(row: &PgRow) -> Result<ImportResult> {
        Ok(ImportResult {
            id: row.try_get("id")?,
            import_job_id: row.try_get("import_job_id")?,
            row_number: row.try_get("row_number")?,
            email: row.try_get("email")?,
            status: ImportResultStatus::parse(&row.try_get::<String, _>("status")?),
            confidence_score: row.try_get("confidence_score")?,
            issues: row.try_get("issues")?,
            suggestions: row.try_get("suggestions")?,
            original_data: row.try_get("original_data")?,
            mailer_check: row.try_get("mailer_check")?,
            imported: row.try_get("imported")?,
            subscriber_id: row.try_get("subscriber_id")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl ImportStore for ImportRepository {
    async fn create_job(&self, new: NewImportJob) -> Result<ImportJob> {
        let job = new.into_job();
        let sql = format!(
            "INSERT INTO import_jobs (id, file_name, original_file_name, file_path, status, \
             total_records, options, column_mapping, user_id, progress_percentage, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0, $10) RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(job.id)
            .bind(&job.file_name)
            .bind(&job.original_file_name)
            .bind(&job.file_path)
            .bind(job.status.as_str())
            .bind(job.total_records)
            .bind(Json(&job.options))
            .bind(Json(&job.column_mapping))
            .bind(&job.user_id)
            .bind(job.created_at)
            .fetch_one(&self.pool)
            .await
            .context("Failed to create import job")?;
        Self::row_to_job(&row)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<ImportJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM import_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch import job")?;
        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<(Vec<ImportJob>, i64)> {
        let (offset, limit) = page_offset(filter.page, filter.limit);
        let status = filter.status.map(|s| s.as_str());

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM import_jobs \
             WHERE ($1::TEXT IS NULL OR user_id = $1) AND ($2::TEXT IS NULL OR status = $2)",
        )
        .bind(&filter.user_id)
        .bind(status)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count import jobs")?;

        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM import_jobs \
             WHERE ($1::TEXT IS NULL OR user_id = $1) AND ($2::TEXT IS NULL OR status = $2) \
             ORDER BY created_at DESC LIMIT $3 OFFSET $4"
        );
        let rows = sqlx::query(&sql)
            .bind(&filter.user_id)
            .bind(status)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list import jobs")?;
        let jobs = rows.iter().map(Self::row_to_job).collect::<Result<Vec<_>>>()?;
        Ok((jobs, total))
    }

    async fn set_job_status(
        &self,
        id: Uuid,
        status: ImportJobStatus,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE import_jobs SET status = $2, error = $3, \
             completed_at = CASE WHEN $4 THEN NOW() ELSE completed_at END \
             WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error)
        .bind(status.is_terminal())
        .execute(&self.pool)
        .await
        .context("Failed to update import job status")?;
        Ok(())
    }

    async fn update_job_progress(&self, id: Uuid, counts: &ImportCounts) -> Result<()> {
        sqlx::query(
            "UPDATE import_jobs SET processed_records = $2, valid_records = $3, \
             invalid_records = $4, risky_records = $5, duplicate_records = $6, \
             progress_percentage = $7 \
             WHERE id = $1 AND status <> 'completed'",
        )
        .bind(id)
        .bind(counts.processed)
        .bind(counts.valid)
        .bind(counts.invalid)
        .bind(counts.risky)
        .bind(counts.duplicate)
        .bind(counts.progress_percentage())
        .execute(&self.pool)
        .await
        .context("Failed to update import job progress")?;
        Ok(())
    }

    async fn complete_job(
        &self,
        id: Uuid,
        imported: i64,
        summary: &ValidationSummary,
    ) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE import_jobs SET status = 'completed', imported_records = $2, \
             validation_summary = $3, progress_percentage = 100, completed_at = NOW() \
             WHERE id = $1 AND status = 'processing'",
        )
        .bind(id)
        .bind(imported)
        .bind(Json(summary))
        .execute(&self.pool)
        .await
        .context("Failed to complete import job")?;
        Ok(done.rows_affected() > 0)
    }

    async fn reset_job(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE import_jobs SET status = 'created', processed_records = 0, valid_records = 0, \
             invalid_records = 0, risky_records = 0, duplicate_records = 0, imported_records = 0, \
             validation_summary = NULL, error = NULL, progress_percentage = 0, completed_at = NULL \
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to reset import job")?;
        Ok(())
    }

    async fn delete_job(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM import_jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete import job")?;
        Ok(())
    }

    async fn jobs_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<ImportJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM import_jobs WHERE created_at < $1");
        let rows = sqlx::query(&sql)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch old import jobs")?;
        rows.iter().map(Self::row_to_job).collect()
    }

    async fn job_aggregates(&self, user_id: Option<&str>) -> Result<JobAggregates> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total_jobs, \
             COUNT(*) FILTER (WHERE status = 'completed') AS completed_jobs, \
             COUNT(*) FILTER (WHERE status = 'failed') AS failed_jobs, \
             COALESCE(SUM(processed_records), 0)::BIGINT AS total_records_processed, \
             COALESCE(SUM(valid_records), 0)::BIGINT AS total_valid_records, \
             COALESCE(AVG(valid_records::FLOAT8 * 100.0 / total_records) \
                 FILTER (WHERE status = 'completed' AND total_records > 0), 0)::FLOAT8 AS average_success_rate \
             FROM import_jobs WHERE ($1::TEXT IS NULL OR user_id = $1)",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to aggregate import jobs")?;

        Ok(JobAggregates {
            total_jobs: row.try_get("total_jobs")?,
            completed_jobs: row.try_get("completed_jobs")?,
            failed_jobs: row.try_get("failed_jobs")?,
            total_records_processed: row.try_get("total_records_processed")?,
            total_valid_records: row.try_get("total_valid_records")?,
            average_success_rate: row.try_get("average_success_rate")?,
        })
    }

    async fn insert_results(&self, results: Vec<NewImportResult>) -> Result<()> {
        if results.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        for new in results {
            let r = new.into_result();
            sqlx::query(
                "INSERT INTO import_results (id, import_job_id, row_number, email, status, \
                 confidence_score, issues, suggestions, original_data, mailer_check, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            )
            .bind(r.id)
            .bind(r.import_job_id)
            .bind(r.row_number)
            .bind(&r.email)
            .bind(r.status.as_str())
            .bind(r.confidence_score)
            .bind(&r.issues)
            .bind(&r.suggestions)
            .bind(&r.original_data)
            .bind(&r.mailer_check)
            .bind(r.created_at)
            .execute(&mut *tx)
            .await
            .context("Failed to insert import result")?;
        }
        tx.commit().await.context("Failed to commit import results")?;
        Ok(())
    }

    async fn list_results(
        &self,
        job_id: Uuid,
        status: Option<ImportResultStatus>,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<ImportResult>, i64)> {
        let (offset, limit) = page_offset(page, limit);
        let status = status.map(|s| s.as_str());

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM import_results \
             WHERE import_job_id = $1 AND ($2::TEXT IS NULL OR status = $2)",
        )
        .bind(job_id)
        .bind(status)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count import results")?;

        let sql = format!(
            "SELECT {RESULT_COLUMNS} FROM import_results \
             WHERE import_job_id = $1 AND ($2::TEXT IS NULL OR status = $2) \
             ORDER BY row_number ASC LIMIT $3 OFFSET $4"
        );
        let rows = sqlx::query(&sql)
            .bind(job_id)
            .bind(status)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list import results")?;
        let items = rows
            .iter()
            .map(Self::row_to_result)
            .collect::<Result<Vec<_>>>()?;
        Ok((items, total))
    }

    async fn importable_results(
        &self,
        job_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<ImportResult>> {
        let sql = format!(
            "SELECT {RESULT_COLUMNS} FROM import_results \
             WHERE import_job_id = $1 AND status IN ('valid', 'risky') \
             ORDER BY row_number ASC LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&sql)
            .bind(job_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch importable results")?;
        rows.iter().map(Self::row_to_result).collect()
    }

    async fn mark_result_imported(
        &self,
        id: Uuid,
        subscriber_id: Option<Uuid>,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE import_results SET imported = $2, subscriber_id = $3, error = $4 WHERE id = $1",
        )
        .bind(id)
        .bind(subscriber_id.is_some())
        .bind(subscriber_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .context("Failed to mark import result")?;
        Ok(())
    }

    async fn delete_results(&self, job_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM import_results WHERE import_job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete import results")?;
        Ok(())
    }
}
