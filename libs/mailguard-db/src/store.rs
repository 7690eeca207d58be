use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    ImportCounts, ImportJob, ImportJobStatus, ImportResult, ImportResultStatus, JobAggregates,
    JobFilter, NewImportJob, NewImportResult, NewSubscriber, Subscriber, SubscriberFilter,
    ValidationSummary,
};

/// A subscriber with this email already exists.
#[derive(Debug, thiserror::Error)]
#[error("Subscriber with email {0} already exists")]
pub struct DuplicateEmail(pub String);

#[async_trait]
pub trait SubscriberStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Fails with [`DuplicateEmail`] when the email is taken.
    async fn create_subscriber(&self, new: NewSubscriber) -> Result<Subscriber>;
    async fn get_subscriber(&self, id: Uuid) -> Result<Option<Subscriber>>;
    async fn find_subscriber_by_email(&self, email: &str) -> Result<Option<Subscriber>>;
    async fn find_subscribers_by_emails(&self, emails: &[String]) -> Result<Vec<Subscriber>>;
    /// Persist every mutable column of `sub` and bump `updated_at`.
    async fn save_subscriber(&self, sub: &Subscriber) -> Result<Subscriber>;
    async fn list_subscribers(&self, filter: &SubscriberFilter) -> Result<(Vec<Subscriber>, i64)>;
}

#[async_trait]
pub trait ImportStore: Send + Sync {
    async fn create_job(&self, new: NewImportJob) -> Result<ImportJob>;
    async fn get_job(&self, id: Uuid) -> Result<Option<ImportJob>>;
    async fn list_jobs(&self, filter: &JobFilter) -> Result<(Vec<ImportJob>, i64)>;
    /// Sets `completed_at` when moving into a terminal status.
    async fn set_job_status(&self, id: Uuid, status: ImportJobStatus, error: Option<&str>)
    -> Result<()>;
    /// No-op for completed jobs.
    async fn update_job_progress(&self, id: Uuid, counts: &ImportCounts) -> Result<()>;
    /// Only a job still in `processing` completes. Returns whether it did.
    async fn complete_job(&self, id: Uuid, imported: i64, summary: &ValidationSummary)
    -> Result<bool>;
    /// Back to `created` with zeroed counts, keeping `total_records`.
    async fn reset_job(&self, id: Uuid) -> Result<()>;
    async fn delete_job(&self, id: Uuid) -> Result<()>;
    async fn jobs_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<ImportJob>>;
    async fn job_aggregates(&self, user_id: Option<&str>) -> Result<JobAggregates>;

    async fn insert_results(&self, results: Vec<NewImportResult>) -> Result<()>;
    async fn list_results(
        &self,
        job_id: Uuid,
        status: Option<ImportResultStatus>,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<ImportResult>, i64)>;
    /// Valid and risky rows in row order.
    async fn importable_results(&self, job_id: Uuid, offset: i64, limit: i64)
    -> Result<Vec<ImportResult>>;
    async fn mark_result_imported(
        &self,
        id: Uuid,
        subscriber_id: Option<Uuid>,
        error: Option<&str>,
    ) -> Result<()>;
    async fn delete_results(&self, job_id: Uuid) -> Result<()>;
}

pub(crate) fn page_offset(page: u32, limit: u32) -> (i64, i64) {
    let page = page.max(1) as i64;
    let limit = limit.max(1) as i64;
    ((page - 1) * limit, limit)
}
