//! In-process store used when no database is configured, and by tests.

use std::collections::HashMap;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{
    ImportCounts, ImportJob, ImportJobStatus, ImportResult, ImportResultStatus, JobAggregates,
    JobFilter, NewImportJob, NewImportResult, NewSubscriber, Subscriber, SubscriberFilter,
    ValidationSummary,
};
use crate::store::{DuplicateEmail, ImportStore, SubscriberStore, page_offset};

#[derive(Default)]
pub struct MemoryStore {
    subscribers: RwLock<HashMap<Uuid, Subscriber>>,
    jobs: RwLock<HashMap<Uuid, ImportJob>>,
    results: RwLock<Vec<ImportResult>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn paginate<T: Clone>(items: &[T], page: u32, limit: u32) -> Vec<T> {
    let (offset, limit) = page_offset(page, limit);
    items
        .iter()
        .skip(offset as usize)
        .take(limit as usize)
        .cloned()
        .collect()
}

#[async_trait]
impl SubscriberStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn create_subscriber(&self, new: NewSubscriber) -> Result<Subscriber> {
        let mut subs = self.subscribers.write().await;
        if subs.values().any(|s| s.email == new.email) {
            return Err(DuplicateEmail(new.email).into());
        }
        let sub = new.into_subscriber();
        subs.insert(sub.id, sub.clone());
        Ok(sub)
    }

    async fn get_subscriber(&self, id: Uuid) -> Result<Option<Subscriber>> {
        Ok(self.subscribers.read().await.get(&id).cloned())
    }

    async fn find_subscriber_by_email(&self, email: &str) -> Result<Option<Subscriber>> {
        Ok(self
            .subscribers
            .read()
            .await
            .values()
            .find(|s| s.email == email)
            .cloned())
    }

    async fn find_subscribers_by_emails(&self, emails: &[String]) -> Result<Vec<Subscriber>> {
        Ok(self
            .subscribers
            .read()
            .await
            .values()
            .filter(|s| emails.contains(&s.email))
            .cloned()
            .collect())
    }

    async fn save_subscriber(&self, sub: &Subscriber) -> Result<Subscriber> {
        let mut subs = self.subscribers.write().await;
        let Some(existing) = subs.get_mut(&sub.id) else {
            bail!("Subscriber {} not found", sub.id);
        };
        let created_at = existing.created_at;
        *existing = sub.clone();
        existing.created_at = created_at;
        existing.updated_at = Utc::now();
        Ok(existing.clone())
    }

    async fn list_subscribers(&self, filter: &SubscriberFilter) -> Result<(Vec<Subscriber>, i64)> {
        let subs = self.subscribers.read().await;
        let mut matching: Vec<Subscriber> = subs
            .values()
            .filter(|s| filter.status.is_none_or(|st| s.status == st))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = matching.len() as i64;
        Ok((paginate(&matching, filter.page, filter.limit), total))
    }
}

#[async_trait]
impl ImportStore for MemoryStore {
    async fn create_job(&self, new: NewImportJob) -> Result<ImportJob> {
        let job = new.into_job();
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<ImportJob>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<(Vec<ImportJob>, i64)> {
        let jobs = self.jobs.read().await;
        let mut matching: Vec<ImportJob> = jobs
            .values()
            .filter(|j| {
                filter
                    .user_id
                    .as_ref()
                    .is_none_or(|u| j.user_id.as_ref() == Some(u))
            })
            .filter(|j| filter.status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = matching.len() as i64;
        Ok((paginate(&matching, filter.page, filter.limit), total))
    }

    async fn set_job_status(
        &self,
        id: Uuid,
        status: ImportJobStatus,
        error: Option<&str>,
    ) -> Result<()> {
        if let Some(job) = self.jobs.write().await.get_mut(&id) {
            job.status = status;
            job.error = error.map(str::to_string);
            if status.is_terminal() {
                job.completed_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn update_job_progress(&self, id: Uuid, counts: &ImportCounts) -> Result<()> {
        if let Some(job) = self.jobs.write().await.get_mut(&id) {
            if job.status == ImportJobStatus::Completed {
                return Ok(());
            }
            job.processed_records = counts.processed;
            job.valid_records = counts.valid;
            job.invalid_records = counts.invalid;
            job.risky_records = counts.risky;
            job.duplicate_records = counts.duplicate;
            job.progress_percentage = counts.progress_percentage();
        }
        Ok(())
    }

    async fn complete_job(
        &self,
        id: Uuid,
        imported: i64,
        summary: &ValidationSummary,
    ) -> Result<bool> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs
            .get_mut(&id)
            .filter(|j| j.status == ImportJobStatus::Processing)
        else {
            return Ok(false);
        };
        job.status = ImportJobStatus::Completed;
        job.imported_records = imported;
        job.validation_summary = Some(summary.clone());
        job.progress_percentage = 100;
        job.completed_at = Some(Utc::now());
        Ok(true)
    }

    async fn reset_job(&self, id: Uuid) -> Result<()> {
        if let Some(job) = self.jobs.write().await.get_mut(&id) {
            job.status = ImportJobStatus::Created;
            job.processed_records = 0;
            job.valid_records = 0;
            job.invalid_records = 0;
            job.risky_records = 0;
            job.duplicate_records = 0;
            job.imported_records = 0;
            job.validation_summary = None;
            job.error = None;
            job.progress_percentage = 0;
            job.completed_at = None;
        }
        Ok(())
    }

    async fn delete_job(&self, id: Uuid) -> Result<()> {
        self.jobs.write().await.remove(&id);
        self.results.write().await.retain(|r| r.import_job_id != id);
        Ok(())
    }

    async fn jobs_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<ImportJob>> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| j.created_at < cutoff)
            .cloned()
            .collect())
    }

    async fn job_aggregates(&self, user_id: Option<&str>) -> Result<JobAggregates> {
        let jobs = self.jobs.read().await;
        let mut agg = JobAggregates::default();
        let mut rates = Vec::new();
        for job in jobs
            .values()
            .filter(|j| user_id.is_none_or(|u| j.user_id.as_deref() == Some(u)))
        {
            agg.total_jobs += 1;
            agg.total_records_processed += job.processed_records;
            agg.total_valid_records += job.valid_records;
            match job.status {
                ImportJobStatus::Completed => {
                    agg.completed_jobs += 1;
                    if job.total_records > 0 {
                        rates.push(job.valid_records as f64 * 100.0 / job.total_records as f64);
                    }
                }
                ImportJobStatus::Failed => agg.failed_jobs += 1,
                _ => {}
            }
        }
        if !rates.is_empty() {
            agg.average_success_rate = rates.iter().sum::<f64>() / rates.len() as f64;
        }
        Ok(agg)
    }

    async fn insert_results(&self, results: Vec<NewImportResult>) -> Result<()> {
        let mut stored = self.results.write().await;
        stored.extend(results.into_iter().map(NewImportResult::into_result));
        Ok(())
    }

    async fn list_results(
        &self,
        job_id: Uuid,
        status: Option<ImportResultStatus>,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<ImportResult>, i64)> {
        let results = self.results.read().await;
        let mut matching: Vec<ImportResult> = results
            .iter()
            .filter(|r| r.import_job_id == job_id)
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.row_number);
        let total = matching.len() as i64;
        Ok((paginate(&matching, page, limit), total))
    }

    async fn importable_results(
        &self,
        job_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<ImportResult>> {
        let results = self.results.read().await;
        let mut matching: Vec<ImportResult> = results
            .iter()
            .filter(|r| r.import_job_id == job_id)
            .filter(|r| {
                matches!(
                    r.status,
                    ImportResultStatus::Valid | ImportResultStatus::Risky
                )
            })
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.row_number);
        Ok(matching
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn mark_result_imported(
        &self,
        id: Uuid,
        subscriber_id: Option<Uuid>,
        error: Option<&str>,
    ) -> Result<()> {
        if let Some(r) = self.results.write().await.iter_mut().find(|r| r.id == id) {
            r.imported = subscriber_id.is_some();
            r.subscriber_id = subscriber_id;
            r.error = error.map(str::to_string);
        }
        Ok(())
    }

    async fn delete_results(&self, job_id: Uuid) -> Result<()> {
        self.results.write().await.retain(|r| r.import_job_id != job_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ImportOptions, SubscriberProfile, SubscriberStatus};

    fn new_job() -> NewImportJob {
        NewImportJob {
            file_name: "f.csv".into(),
            original_file_name: "f.csv".into(),
            file_path: "/tmp/f.csv".into(),
            total_records: 2,
            options: ImportOptions::default(),
            user_id: Some("u1".into()),
        }
    }

    fn result(job: Uuid, row: i64, status: ImportResultStatus) -> NewImportResult {
        NewImportResult {
            import_job_id: job,
            row_number: row,
            email: format!("r{row}@example.com"),
            status,
            confidence_score: 90,
            issues: vec![],
            suggestions: vec![],
            original_data: serde_json::json!({}),
            mailer_check: None,
        }
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let store = MemoryStore::new();
        let new = NewSubscriber {
            email: "a@example.com".into(),
            status: SubscriberStatus::Pending,
            profile: SubscriberProfile::default(),
            groups: vec![],
            segments: vec![],
            validation_result: None,
        };
        store.create_subscriber(new.clone()).await.unwrap();
        let err = store.create_subscriber(new).await.unwrap_err();
        assert!(err.downcast_ref::<DuplicateEmail>().is_some());
    }

    #[tokio::test]
    async fn completed_job_ignores_progress_updates() {
        let store = MemoryStore::new();
        let job = store.create_job(new_job()).await.unwrap();
        store
            .set_job_status(job.id, ImportJobStatus::Processing, None)
            .await
            .unwrap();
        assert!(
            store
                .complete_job(job.id, 0, &ValidationSummary::default())
                .await
                .unwrap()
        );
        let counts = ImportCounts {
            total: 2,
            processed: 1,
            valid: 1,
            ..Default::default()
        };
        store.update_job_progress(job.id, &counts).await.unwrap();
        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.processed_records, 0);
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn cancelled_job_cannot_complete() {
        let store = MemoryStore::new();
        let job = store.create_job(new_job()).await.unwrap();
        assert!(
            !store
                .complete_job(job.id, 0, &ValidationSummary::default())
                .await
                .unwrap()
        );

        store
            .set_job_status(job.id, ImportJobStatus::Processing, None)
            .await
            .unwrap();
        store
            .set_job_status(job.id, ImportJobStatus::Failed, Some("Job cancelled by user"))
            .await
            .unwrap();
        assert!(
            !store
                .complete_job(job.id, 3, &ValidationSummary::default())
                .await
                .unwrap()
        );
        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, ImportJobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("Job cancelled by user"));
        assert_eq!(job.imported_records, 0);
        assert!(job.validation_summary.is_none());
    }

    #[tokio::test]
    async fn importable_results_skip_invalid_rows_in_order() {
        let store = MemoryStore::new();
        let job = store.create_job(new_job()).await.unwrap();
        store
            .insert_results(vec![
                result(job.id, 3, ImportResultStatus::Risky),
                result(job.id, 1, ImportResultStatus::Valid),
                result(job.id, 2, ImportResultStatus::Invalid),
                result(job.id, 4, ImportResultStatus::Duplicate),
            ])
            .await
            .unwrap();
        let rows = store.importable_results(job.id, 0, 100).await.unwrap();
        let numbers: Vec<i64> = rows.iter().map(|r| r.row_number).collect();
        assert_eq!(numbers, vec![1, 3]);
    }

    #[tokio::test]
    async fn aggregates_average_only_completed_jobs() {
        let store = MemoryStore::new();
        let a = store.create_job(new_job()).await.unwrap();
        let counts = ImportCounts {
            total: 2,
            processed: 2,
            valid: 1,
            invalid: 1,
            ..Default::default()
        };
        store
            .set_job_status(a.id, ImportJobStatus::Processing, None)
            .await
            .unwrap();
        store.update_job_progress(a.id, &counts).await.unwrap();
        store
            .complete_job(a.id, 1, &ValidationSummary::default())
            .await
            .unwrap();
        let b = store.create_job(new_job()).await.unwrap();
        store
            .set_job_status(b.id, ImportJobStatus::Failed, Some("boom"))
            .await
            .unwrap();

        let agg = store.job_aggregates(Some("u1")).await.unwrap();
        assert_eq!(agg.total_jobs, 2);
        assert_eq!(agg.completed_jobs, 1);
        assert_eq!(agg.failed_jobs, 1);
        assert!((agg.average_success_rate - 50.0).abs() < f64::EPSILON);
        assert_eq!(store.job_aggregates(Some("other")).await.unwrap().total_jobs, 0);
    }
}
