use std::sync::Arc;

use anyhow::Result;
use mailguard_db::models::{
    ColumnMapping, DuplicateHandling, ImportOptions, ImportResult, ImportResultStatus,
    NewSubscriber, SubscriberProfile, SubscriberStatus,
};
use mailguard_db::{ImportStore, SubscriberStore};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportAction {
    Created,
    Updated,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationSummary {
    pub total_processed: i64,
    pub created: i64,
    pub updated: i64,
    pub skipped: i64,
    pub failed: i64,
    pub errors: Vec<String>,
}

impl IntegrationSummary {
    fn record(&mut self, action: ImportAction) {
        self.total_processed += 1;
        match action {
            ImportAction::Created => self.created += 1,
            ImportAction::Updated => self.updated += 1,
            ImportAction::Skipped => self.skipped += 1,
            ImportAction::Failed => self.failed += 1,
        }
    }

    pub fn imported(&self) -> i64 {
        self.created + self.updated
    }
}

fn cell(row: &Value, column: &str) -> Option<String> {
    let value = match row.get(column)? {
        Value::String(s) => s.trim().to_string(),
        Value::Null => return None,
        other => other.to_string(),
    };
    (!value.is_empty()).then_some(value)
}

/// Apply mapped columns of `row` to `profile`. With `replace`, empty cells clear the field.
pub fn apply_row(profile: &mut SubscriberProfile, row: &Value, mapping: &ColumnMapping, replace: bool) {
    fn put(dst: &mut Option<String>, value: Option<String>, replace: bool) {
        if value.is_some() || replace {
            *dst = value;
        }
    }

    for (column, field) in mapping {
        let value = cell(row, column);
        match field.as_str() {
            "email" => {}
            "firstName" => put(&mut profile.first_name, value, replace),
            "lastName" => put(&mut profile.last_name, value, replace),
            "company" => put(&mut profile.company, value, replace),
            "phone" => put(&mut profile.phone, value, replace),
            "location" => put(&mut profile.location, value, replace),
            other => {
                let key = other.strip_prefix("custom_").unwrap_or(other).to_string();
                match value {
                    Some(v) => {
                        profile.custom_fields.insert(key, Value::String(v));
                    }
                    None if replace => {
                        profile.custom_fields.remove(&key);
                    }
                    None => {}
                }
            }
        }
    }
}

fn status_for_result(status: ImportResultStatus) -> SubscriberStatus {
    match status {
        ImportResultStatus::Valid => SubscriberStatus::Active,
        _ => SubscriberStatus::Pending,
    }
}

pub struct ImportIntegrationService {
    subscribers: Arc<dyn SubscriberStore>,
    imports: Arc<dyn ImportStore>,
    batch_size: usize,
}

impl ImportIntegrationService {
    pub fn new(
        subscribers: Arc<dyn SubscriberStore>,
        imports: Arc<dyn ImportStore>,
        batch_size: usize,
    ) -> Self {
        Self {
            subscribers,
            imports,
            batch_size: batch_size.max(1),
        }
    }

    /// Create or update subscribers for every valid and risky row of a job.
    pub async fn process_import_results(
        &self,
        job_id: Uuid,
        options: &ImportOptions,
    ) -> Result<IntegrationSummary> {
        let mut summary = IntegrationSummary::default();
        let mut offset = 0i64;
        let mut batch_no = 0;

        loop {
            let batch = self
                .imports
                .importable_results(job_id, offset, self.batch_size as i64)
                .await?;
            if batch.is_empty() {
                break;
            }
            offset += batch.len() as i64;
            batch_no += 1;

            for result in &batch {
                let (action, subscriber_id, err) = match self.process_subscriber(result, options).await {
                    Ok((action, id)) => (action, Some(id), None),
                    Err(e) => (ImportAction::Failed, None, Some(format!("{e:#}"))),
                };
                if let Some(e) = &err {
                    summary.errors.push(format!("Row {}: {}", result.row_number, e));
                }
                summary.record(action);
                self.imports
                    .mark_result_imported(result.id, subscriber_id, err.as_deref())
                    .await?;
            }
            info!("Processed integration batch {} for job {}", batch_no, job_id);
        }

        info!(
            "Import processing completed for job {}. Created: {}, Updated: {}, Skipped: {}, Failed: {}",
            job_id, summary.created, summary.updated, summary.skipped, summary.failed
        );
        if !summary.errors.is_empty() {
            error!("Import integration errors for job {}: {}", job_id, summary.errors.join("; "));
        }
        Ok(summary)
    }

    async fn process_subscriber(
        &self,
        result: &ImportResult,
        options: &ImportOptions,
    ) -> Result<(ImportAction, Uuid)> {
        let email = result.email.trim().to_lowercase();
        let mailer_check = result.mailer_check.clone();

        if let Some(mut existing) = self.subscribers.find_subscriber_by_email(&email).await? {
            let replace = match options.duplicate_handling {
                DuplicateHandling::Skip => return Ok((ImportAction::Skipped, existing.id)),
                DuplicateHandling::Update => false,
                DuplicateHandling::Replace => true,
            };
            let mut profile = existing.profile();
            apply_row(&mut profile, &result.original_data, &options.column_mapping, replace);
            existing.apply_profile(profile);
            existing.merge_groups(&options.group_ids, &options.segment_ids);
            if mailer_check.is_some() {
                existing.validation_result = mailer_check;
            }
            let saved = self.subscribers.save_subscriber(&existing).await?;
            return Ok((ImportAction::Updated, saved.id));
        }

        let mut profile = SubscriberProfile::default();
        apply_row(&mut profile, &result.original_data, &options.column_mapping, false);
        let created = self
            .subscribers
            .create_subscriber(NewSubscriber {
                email,
                status: status_for_result(result.status),
                profile,
                groups: options.group_ids.clone(),
                segments: options.segment_ids.clone(),
                validation_result: mailer_check,
            })
            .await?;
        Ok((ImportAction::Created, created.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailguard_db::models::{NewImportJob, NewImportResult};
    use mailguard_db::MemoryStore;
    use serde_json::json;

    fn mapping() -> ColumnMapping {
        [
            ("Email", "email"),
            ("First", "firstName"),
            ("Org", "company"),
            ("Plan", "custom_plan"),
            ("Tier", "customerStatus"),
        ]
        .into_iter()
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .collect()
    }

    #[test]
    fn row_mapping_respects_replace() {
        let row = json!({"Email": "a@b.com", "First": " Ann ", "Org": "", "Plan": "gold", "Tier": "vip"});
        let mut profile = SubscriberProfile {
            company: Some("Acme".into()),
            ..Default::default()
        };
        apply_row(&mut profile, &row, &mapping(), false);
        assert_eq!(profile.first_name.as_deref(), Some("Ann"));
        assert_eq!(profile.company.as_deref(), Some("Acme"));
        assert_eq!(profile.custom_fields["plan"], "gold");
        assert_eq!(profile.custom_fields["customerStatus"], "vip");

        apply_row(&mut profile, &row, &mapping(), true);
        assert_eq!(profile.company, None);
    }

    async fn job_with_rows(
        store: &Arc<MemoryStore>,
        options: ImportOptions,
        rows: &[(&str, ImportResultStatus, serde_json::Value)],
    ) -> Uuid {
        let job = store
            .create_job(NewImportJob {
                file_name: "f.csv".into(),
                original_file_name: "f.csv".into(),
                file_path: "/tmp/f.csv".into(),
                total_records: rows.len() as i64,
                options,
                user_id: None,
            })
            .await
            .unwrap();
        let results = rows
            .iter()
            .enumerate()
            .map(|(i, (email, status, data))| NewImportResult {
                import_job_id: job.id,
                row_number: i as i64 + 1,
                email: email.to_string(),
                status: *status,
                confidence_score: 90,
                issues: vec![],
                suggestions: vec![],
                original_data: data.clone(),
                mailer_check: Some("valid".into()),
            })
            .collect();
        store.insert_results(results).await.unwrap();
        job.id
    }

    #[tokio::test]
    async fn creates_updates_and_skips() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_subscriber(NewSubscriber {
                email: "old@example.com".into(),
                status: SubscriberStatus::Active,
                profile: SubscriberProfile {
                    company: Some("Acme".into()),
                    ..Default::default()
                },
                groups: vec!["g0".into()],
                segments: vec![],
                validation_result: None,
            })
            .await
            .unwrap();

        let options = ImportOptions {
            column_mapping: mapping(),
            duplicate_handling: DuplicateHandling::Update,
            group_ids: vec!["g0".into(), "g1".into()],
            ..Default::default()
        };
        let job = job_with_rows(
            &store,
            options.clone(),
            &[
                ("new@example.com", ImportResultStatus::Valid, json!({"Email": "new@example.com", "First": "New"})),
                ("old@example.com", ImportResultStatus::Risky, json!({"Email": "old@example.com", "First": "Old", "Org": ""})),
                ("gone@example.com", ImportResultStatus::Invalid, json!({})),
                ("risky@example.com", ImportResultStatus::Risky, json!({"Email": "risky@example.com"})),
            ],
        )
        .await;

        let svc = ImportIntegrationService::new(store.clone(), store.clone(), 2);
        let summary = svc.process_import_results(job, &options).await.unwrap();
        assert_eq!((summary.created, summary.updated, summary.skipped, summary.failed), (2, 1, 0, 0));
        assert_eq!(summary.imported(), 3);

        let old = store.find_subscriber_by_email("old@example.com").await.unwrap().unwrap();
        assert_eq!(old.first_name.as_deref(), Some("Old"));
        assert_eq!(old.company.as_deref(), Some("Acme"));
        assert_eq!(old.groups, vec!["g0", "g1"]);
        assert_eq!(old.status, SubscriberStatus::Active);

        let new = store.find_subscriber_by_email("new@example.com").await.unwrap().unwrap();
        assert_eq!(new.status, SubscriberStatus::Active);
        let risky = store.find_subscriber_by_email("risky@example.com").await.unwrap().unwrap();
        assert_eq!(risky.status, SubscriberStatus::Pending);

        let (results, _) = store.list_results(job, None, 1, 10).await.unwrap();
        let imported: Vec<bool> = results.iter().map(|r| r.imported).collect();
        assert_eq!(imported, vec![true, true, false, true]);
    }

    #[tokio::test]
    async fn skip_leaves_existing_subscriber_untouched() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_subscriber(NewSubscriber {
                email: "old@example.com".into(),
                status: SubscriberStatus::Active,
                profile: SubscriberProfile::default(),
                groups: vec![],
                segments: vec![],
                validation_result: None,
            })
            .await
            .unwrap();
        let options = ImportOptions {
            column_mapping: mapping(),
            ..Default::default()
        };
        let job = job_with_rows(
            &store,
            options.clone(),
            &[("old@example.com", ImportResultStatus::Valid, json!({"First": "Changed"}))],
        )
        .await;

        let svc = ImportIntegrationService::new(store.clone(), store.clone(), 100);
        let summary = svc.process_import_results(job, &options).await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.imported(), 0);
        let old = store.find_subscriber_by_email("old@example.com").await.unwrap().unwrap();
        assert_eq!(old.first_name, None);
    }
}
