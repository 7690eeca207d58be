use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use mailguard_db::models::{
    DuplicateHandling, ImportCounts, ImportJob, ImportJobStatus, ImportResultStatus,
    NewImportResult, ValidationSummary,
};
use mailguard_db::{ImportStore, SubscriberStore};
use mailguard_shared::reputation::{EmailStatus, EmailValidationResult};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ImportConfig;
use crate::services::bulk_import_service::upload_key;
use crate::services::csv_service::{CsvRow, parse_csv_file};
use crate::services::email_validation_service::{
    EmailValidationService, is_basic_email_shape, mailer_check,
};
use crate::services::file_security_service::FileSecurityService;
use crate::services::import_integration_service::ImportIntegrationService;

const UNKNOWN_STATUS_CONFIDENCE: i32 = 50;

/// Outcome of one row before it is tied to a job.
#[derive(Debug, Clone, PartialEq)]
pub struct RowVerdict {
    pub email: String,
    pub status: ImportResultStatus,
    pub confidence: i32,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
    pub mailer_check: Option<String>,
}

impl RowVerdict {
    fn rejected(email: String, issue: &str) -> Self {
        Self {
            email,
            status: ImportResultStatus::Invalid,
            confidence: 0,
            issues: vec![issue.to_string()],
            suggestions: Vec::new(),
            mailer_check: None,
        }
    }
}

fn failing_details(result: &EmailValidationResult) -> Vec<String> {
    let Some(checks) = &result.checks else {
        return Vec::new();
    };
    let mut issues = Vec::new();
    for outcome in [Some(&checks.syntax), Some(&checks.domain), Some(&checks.mx)]
        .into_iter()
        .chain([checks.disposable.as_ref(), checks.role_account.as_ref()])
        .flatten()
    {
        if !outcome.is_valid {
            issues.push(outcome.details.clone());
        }
    }
    if let Some(typo) = checks.typo.as_ref().filter(|t| !t.is_valid) {
        issues.push(typo.details.clone());
    }
    if let Some(ip) = checks.ip_reputation.as_ref().filter(|c| !c.is_valid) {
        issues.push(ip.details.clone());
    }
    if let Some(dr) = checks.domain_reputation.as_ref().filter(|c| !c.is_valid) {
        issues.push(dr.details.clone());
    }
    issues
}

/// Map a validator result onto an import status given the job threshold.
pub fn classify_validation(
    email: String,
    result: &EmailValidationResult,
    validation_threshold: u8,
    risky_threshold: u8,
) -> RowVerdict {
    let mut issues = failing_details(result);
    let mut suggestions = Vec::new();
    if let (Some(fix), Some((local, _))) = (result.suggestion(), email.split_once('@')) {
        suggestions.push(format!("Did you mean {local}@{fix}?"));
    }

    if let Some(err) = &result.error {
        issues.push(format!("Validation error: {err}"));
        return RowVerdict {
            email,
            status: ImportResultStatus::Invalid,
            confidence: 0,
            issues,
            suggestions,
            mailer_check: Some(mailer_check(result).to_string()),
        };
    }

    let confidence = if result.status == EmailStatus::Unknown {
        issues.push("Validation status unknown".to_string());
        UNKNOWN_STATUS_CONFIDENCE
    } else {
        result.confidence as i32
    };

    let status = if !result.is_valid || confidence < validation_threshold as i32 {
        ImportResultStatus::Invalid
    } else if confidence < risky_threshold as i32 {
        ImportResultStatus::Risky
    } else {
        ImportResultStatus::Valid
    };

    RowVerdict {
        email,
        status,
        confidence,
        issues,
        suggestions,
        mailer_check: Some(mailer_check(result).to_string()),
    }
}

pub struct ImportProcessor {
    imports: Arc<dyn ImportStore>,
    subscribers: Arc<dyn SubscriberStore>,
    validator: Arc<EmailValidationService>,
    integration: Arc<ImportIntegrationService>,
    security: Arc<FileSecurityService>,
    config: ImportConfig,
    verify_integrity: bool,
}

impl ImportProcessor {
    pub fn new(
        imports: Arc<dyn ImportStore>,
        subscribers: Arc<dyn SubscriberStore>,
        validator: Arc<EmailValidationService>,
        integration: Arc<ImportIntegrationService>,
        security: Arc<FileSecurityService>,
        config: &ImportConfig,
        verify_integrity: bool,
    ) -> Self {
        Self {
            imports,
            subscribers,
            validator,
            integration,
            security,
            config: config.clone(),
            verify_integrity,
        }
    }

    /// Consume job ids until every sender is dropped.
    pub async fn run(self: Arc<Self>, mut queue: mpsc::Receiver<Uuid>) {
        info!("Import worker started");
        while let Some(job_id) = queue.recv().await {
            self.handle(job_id).await;
        }
        info!("Import worker stopped");
    }

    pub async fn handle(&self, job_id: Uuid) {
        if let Err(e) = self.process_job(job_id).await {
            self.fail_job(job_id, &format!("{e:#}")).await;
        }
    }

    /// Records a processing failure unless the job was already failed by a cancel.
    async fn fail_job(&self, job_id: Uuid, message: &str) {
        match self.is_cancelled(job_id).await {
            Ok(true) => {
                info!("Import job {} was cancelled, ignoring failure: {}", job_id, message);
                return;
            }
            Ok(false) => {}
            Err(e) => warn!("Could not load job {} before failing it: {:#}", job_id, e),
        }
        error!("Import job {} failed: {}", job_id, message);
        if let Err(e) = self
            .imports
            .set_job_status(job_id, ImportJobStatus::Failed, Some(message))
            .await
        {
            error!("Failed to mark job {} as failed: {:#}", job_id, e);
        }
    }

    async fn is_cancelled(&self, job_id: Uuid) -> Result<bool> {
        Ok(self
            .imports
            .get_job(job_id)
            .await?
            .is_none_or(|j| j.status == ImportJobStatus::Failed))
    }

    async fn process_job(&self, job_id: Uuid) -> Result<()> {
        let Some(job) = self.imports.get_job(job_id).await? else {
            warn!("Import job {} disappeared before processing", job_id);
            return Ok(());
        };
        if job.status != ImportJobStatus::Created {
            debug!("Skipping import job {} in {} status", job_id, job.status.as_str());
            return Ok(());
        }

        self.imports
            .set_job_status(job_id, ImportJobStatus::Processing, None)
            .await?;
        let started = Instant::now();
        info!("Processing import job {}", job_id);

        let path = PathBuf::from(&job.file_path);
        let key = upload_key(&job);
        if self.verify_integrity {
            if let Some(key) = &key {
                if !self.security.verify_file_integrity(&path, key).await {
                    bail!("Source file failed integrity verification");
                }
            }
        }

        let parsed = parse_csv_file(&path).await?;
        let email_column = job
            .options
            .email_column()
            .map(str::to_string)
            .context("Column mapping has no email column")?;
        let batch_size = job.options.batch_size.unwrap_or(self.config.batch_size).max(1);
        let batches = parsed.rows.len().div_ceil(batch_size);

        let mut counts = ImportCounts {
            total: parsed.total_rows() as i64,
            ..Default::default()
        };
        let mut seen = HashSet::new();
        let mut confidence_sum = 0i64;

        for (batch_no, chunk) in parsed.rows.chunks(batch_size).enumerate() {
            let existing = self.existing_emails(&job, chunk, &email_column).await?;
            let mut results = Vec::with_capacity(chunk.len());
            for (i, row) in chunk.iter().enumerate() {
                let row_number = (batch_no * batch_size + i + 1) as i64;
                let verdict = self
                    .classify_row(&job, row, &email_column, &mut seen, &existing)
                    .await;
                counts.record(verdict.status);
                confidence_sum += verdict.confidence as i64;
                results.push(NewImportResult {
                    import_job_id: job_id,
                    row_number,
                    email: verdict.email,
                    status: verdict.status,
                    confidence_score: verdict.confidence,
                    issues: verdict.issues,
                    suggestions: verdict.suggestions,
                    original_data: serde_json::to_value(row)?,
                    mailer_check: verdict.mailer_check,
                });
            }

            self.imports.insert_results(results).await?;
            self.imports.update_job_progress(job_id, &counts).await?;
            debug!(
                "Job {} batch {}/{}: {}% complete",
                job_id,
                batch_no + 1,
                batches,
                counts.progress_percentage()
            );

            if self.is_cancelled(job_id).await? {
                info!("Import job {} was cancelled, stopping", job_id);
                return Ok(());
            }
            if batch_no + 1 < batches && self.config.batch_pause_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.batch_pause_ms)).await;
            }
        }

        let integration = self
            .integration
            .process_import_results(job_id, &job.options)
            .await?;

        if self.is_cancelled(job_id).await? {
            info!("Import job {} was cancelled before completion", job_id);
            return Ok(());
        }

        let summary = ValidationSummary {
            total_processed: counts.processed,
            valid: counts.valid,
            invalid: counts.invalid,
            risky: counts.risky,
            duplicates: counts.duplicate,
            average_confidence: if counts.processed > 0 {
                confidence_sum as f64 / counts.processed as f64
            } else {
                0.0
            },
            processing_time_ms: started.elapsed().as_millis() as u64,
            created: integration.created,
            updated: integration.updated,
            skipped: integration.skipped,
            failed: integration.failed,
        };
        if !self
            .imports
            .complete_job(job_id, integration.imported(), &summary)
            .await?
        {
            info!("Import job {} left processing before completion", job_id);
            return Ok(());
        }

        if let Some(key) = &key {
            self.security
                .automatic_sensitive_file_cleanup(Some(key), Duration::ZERO)
                .await;
        }

        info!(
            "Import job {} completed: {} valid, {} risky, {} invalid, {} duplicate, {} imported",
            job_id,
            counts.valid,
            counts.risky,
            counts.invalid,
            counts.duplicate,
            integration.imported()
        );
        Ok(())
    }

    /// Emails in `chunk` owned by existing subscribers, when such rows count as duplicates.
    async fn existing_emails(
        &self,
        job: &ImportJob,
        chunk: &[CsvRow],
        email_column: &str,
    ) -> Result<HashSet<String>> {
        if job.options.duplicate_handling != DuplicateHandling::Skip {
            return Ok(HashSet::new());
        }
        let emails: Vec<String> = chunk
            .iter()
            .filter_map(|row| row.get(email_column))
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        if emails.is_empty() {
            return Ok(HashSet::new());
        }
        Ok(self
            .subscribers
            .find_subscribers_by_emails(&emails)
            .await?
            .into_iter()
            .map(|s| s.email)
            .collect())
    }

    async fn classify_row(
        &self,
        job: &ImportJob,
        row: &CsvRow,
        email_column: &str,
        seen: &mut HashSet<String>,
        existing: &HashSet<String>,
    ) -> RowVerdict {
        let raw = row.get(email_column).map(|e| e.trim()).unwrap_or_default();
        if raw.is_empty() {
            return RowVerdict::rejected(String::new(), "Email field is required");
        }
        let email = raw.to_lowercase();
        if !is_basic_email_shape(&email) {
            return RowVerdict::rejected(email, "Invalid email format");
        }

        if !seen.insert(email.clone()) {
            return RowVerdict {
                email,
                status: ImportResultStatus::Duplicate,
                confidence: 0,
                issues: vec!["Duplicate email within file".to_string()],
                suggestions: Vec::new(),
                mailer_check: None,
            };
        }
        if existing.contains(&email) {
            return RowVerdict {
                email,
                status: ImportResultStatus::Duplicate,
                confidence: 0,
                issues: vec!["Subscriber already exists".to_string()],
                suggestions: Vec::new(),
                mailer_check: None,
            };
        }

        let result = self
            .validator
            .validate_email(&email, job.options.sender_ip.as_deref())
            .await;
        classify_validation(
            email,
            &result,
            job.options.validation_threshold,
            self.config.risky_threshold,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::config::{ReputationConfig, UploadConfig};
    use crate::dns::testing::FakeDns;
    use crate::services::reputation_service::ReputationService;
    use mailguard_db::MemoryStore;
    use mailguard_db::models::{
        ImportOptions, NewImportJob, NewSubscriber, SubscriberProfile, SubscriberStatus,
    };

    struct Fixture {
        dir: tempfile::TempDir,
        store: Arc<MemoryStore>,
        processor: ImportProcessor,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let dns = Arc::new(FakeDns::new());
        dns.mail_domain("example.com");
        dns.mail_domain("gmial.com");
        let cache = Cache::memory();
        let reputation = Arc::new(ReputationService::new(
            dns.clone(),
            cache.clone(),
            &ReputationConfig::default(),
        ));
        let validator = Arc::new(EmailValidationService::new(
            dns,
            cache,
            reputation,
            Duration::from_secs(60),
        ));
        let store = Arc::new(MemoryStore::new());
        let integration = Arc::new(ImportIntegrationService::new(store.clone(), store.clone(), 2));
        let upload_cfg = UploadConfig {
            upload_dir: dir.path().join("uploads"),
            quarantine_dir: dir.path().join("quarantine"),
            temp_root: dir.path().join("temp"),
            ..UploadConfig::default()
        };
        let security = Arc::new(FileSecurityService::new(&upload_cfg));
        let config = ImportConfig {
            batch_size: 2,
            batch_pause_ms: 0,
            ..ImportConfig::default()
        };
        let processor = ImportProcessor::new(
            store.clone(),
            store.clone(),
            validator,
            integration,
            security,
            &config,
            false,
        );
        Fixture {
            dir,
            store,
            processor,
        }
    }

    async fn job(fx: &Fixture, body: &str, options: ImportOptions) -> Uuid {
        let job_dir = fx.dir.path().join("uploads").join("imports").join("k1");
        std::fs::create_dir_all(&job_dir).unwrap();
        let path = job_dir.join("list.csv");
        std::fs::write(&path, body).unwrap();
        fx.store
            .create_job(NewImportJob {
                file_name: "list.csv".into(),
                original_file_name: "list.csv".into(),
                file_path: path.display().to_string(),
                total_records: 0,
                options,
                user_id: None,
            })
            .await
            .unwrap()
            .id
    }

    fn options() -> ImportOptions {
        let mut opts = ImportOptions::default();
        opts.column_mapping.insert("email".into(), "email".into());
        opts.column_mapping.insert("name".into(), "firstName".into());
        opts
    }

    #[tokio::test]
    async fn classifies_rows_and_keeps_counts_consistent() {
        let fx = fixture();
        fx.store
            .create_subscriber(NewSubscriber {
                email: "known@example.com".into(),
                status: SubscriberStatus::Active,
                profile: SubscriberProfile::default(),
                groups: vec![],
                segments: vec![],
                validation_result: None,
            })
            .await
            .unwrap();

        let body = "email,name\n\
                    jane@example.com,Jane\n\
                    ,Nobody\n\
                    not-an-email,Bad\n\
                    JANE@example.com,Again\n\
                    known@example.com,Known\n\
                    ann@nowhere.test,Ann\n\
                    info@gmial.com,Role\n";
        // role -20, typo -25 lands at 55: risky with a 50 threshold
        let mut opts = options();
        opts.validation_threshold = 50;
        let id = job(&fx, body, opts).await;
        fx.processor.handle(id).await;

        let job = fx.store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, ImportJobStatus::Completed, "{:?}", job.error);
        assert_eq!(job.processed_records, 7);
        assert_eq!(
            job.valid_records + job.invalid_records + job.risky_records + job.duplicate_records,
            7
        );
        assert_eq!(
            (job.valid_records, job.risky_records, job.invalid_records, job.duplicate_records),
            (1, 1, 3, 2)
        );
        assert_eq!(job.imported_records, 2);
        assert_eq!(job.progress_percentage, 100);
        let summary = job.validation_summary.unwrap();
        assert_eq!(summary.created, 2);
        assert_eq!(summary.total_processed, 7);

        let (results, _) = fx.store.list_results(id, None, 1, 100).await.unwrap();
        assert_eq!(results[1].issues, vec!["Email field is required"]);
        assert_eq!(results[3].status, ImportResultStatus::Duplicate);
        assert_eq!(results[4].issues, vec!["Subscriber already exists"]);

        let jane = fx.store.find_subscriber_by_email("jane@example.com").await.unwrap().unwrap();
        assert_eq!(jane.first_name.as_deref(), Some("Jane"));
        assert_eq!(jane.validation_result.as_deref(), Some("valid"));
        let info = fx.store.find_subscriber_by_email("info@gmial.com").await.unwrap().unwrap();
        assert_eq!(info.status, SubscriberStatus::Pending);
        assert_eq!(results[6].suggestions, vec!["Did you mean info@gmail.com?"]);
        assert!(!std::path::Path::new(&job.file_path).exists());
    }

    #[tokio::test]
    async fn update_mode_does_not_count_existing_as_duplicate() {
        let fx = fixture();
        fx.store
            .create_subscriber(NewSubscriber {
                email: "known@example.com".into(),
                status: SubscriberStatus::Active,
                profile: SubscriberProfile::default(),
                groups: vec![],
                segments: vec![],
                validation_result: None,
            })
            .await
            .unwrap();
        let mut opts = options();
        opts.duplicate_handling = DuplicateHandling::Update;
        let id = job(&fx, "email,name\nknown@example.com,Kim\n", opts).await;
        fx.processor.handle(id).await;

        let job = fx.store.get_job(id).await.unwrap().unwrap();
        assert_eq!((job.valid_records, job.duplicate_records, job.imported_records), (1, 0, 1));
        let known = fx.store.find_subscriber_by_email("known@example.com").await.unwrap().unwrap();
        assert_eq!(known.first_name.as_deref(), Some("Kim"));
    }

    #[tokio::test]
    async fn missing_file_fails_the_job() {
        let fx = fixture();
        let id = job(&fx, "email\n", options()).await;
        let job = fx.store.get_job(id).await.unwrap().unwrap();
        std::fs::remove_file(&job.file_path).unwrap();

        fx.processor.handle(id).await;
        let job = fx.store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, ImportJobStatus::Failed);
        assert!(job.error.unwrap().contains("Failed to read CSV file"));
    }

    #[tokio::test]
    async fn cancel_during_processing_keeps_cancel_reason() {
        let fx = fixture();
        let id = job(&fx, "email\na@example.com\n", options()).await;
        fx.store
            .set_job_status(id, ImportJobStatus::Processing, None)
            .await
            .unwrap();
        fx.store
            .set_job_status(id, ImportJobStatus::Failed, Some("Job cancelled by user"))
            .await
            .unwrap();

        fx.processor.fail_job(id, "Failed to read CSV file").await;
        let job = fx.store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, ImportJobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("Job cancelled by user"));

        let done = fx
            .store
            .complete_job(id, 1, &ValidationSummary::default())
            .await
            .unwrap();
        assert!(!done);
        let job = fx.store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, ImportJobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("Job cancelled by user"));
    }

    #[tokio::test]
    async fn non_created_jobs_are_ignored() {
        let fx = fixture();
        let id = job(&fx, "email\na@example.com\n", options()).await;
        fx.store
            .set_job_status(id, ImportJobStatus::Failed, Some("Job cancelled by user"))
            .await
            .unwrap();
        fx.processor.handle(id).await;
        let (results, total) = fx.store.list_results(id, None, 1, 10).await.unwrap();
        assert!(results.is_empty());
        assert_eq!(total, 0);
    }

    #[test]
    fn threshold_mapping() {
        let base = EmailValidationResult {
            email: "a@b.com".into(),
            is_valid: true,
            status: EmailStatus::Valid,
            confidence: 75,
            checks: None,
            error: None,
        };
        let v = classify_validation("a@b.com".into(), &base, 70, 80);
        assert_eq!(v.status, ImportResultStatus::Risky);
        let v = classify_validation("a@b.com".into(), &base, 90, 80);
        assert_eq!(v.status, ImportResultStatus::Invalid);

        let unknown = EmailValidationResult {
            status: EmailStatus::Unknown,
            is_valid: false,
            confidence: 0,
            ..base.clone()
        };
        let v = classify_validation("a@b.com".into(), &unknown, 40, 80);
        assert_eq!(v.confidence, 50);
        assert_eq!(v.status, ImportResultStatus::Invalid);
        assert!(v.issues.contains(&"Validation status unknown".to_string()));

        let failed = EmailValidationResult {
            error: Some("resolver down".into()),
            ..unknown
        };
        let v = classify_validation("a@b.com".into(), &failed, 40, 80);
        assert_eq!(v.status, ImportResultStatus::Invalid);
        assert!(v.issues.iter().any(|i| i.contains("resolver down")));
    }
}
