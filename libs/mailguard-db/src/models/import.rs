use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImportJobStatus {
    #[serde(alias = "pending")]
    Created,
    Processing,
    Completed,
    Failed,
}

impl ImportJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportJobStatus::Created => "created",
            ImportJobStatus::Processing => "processing",
            ImportJobStatus::Completed => "completed",
            ImportJobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => ImportJobStatus::Processing,
            "completed" => ImportJobStatus::Completed,
            "failed" => ImportJobStatus::Failed,
            _ => ImportJobStatus::Created,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ImportJobStatus::Completed | ImportJobStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ImportResultStatus {
    Valid,
    Risky,
    Invalid,
    Duplicate,
}

impl ImportResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportResultStatus::Valid => "valid",
            ImportResultStatus::Risky => "risky",
            ImportResultStatus::Invalid => "invalid",
            ImportResultStatus::Duplicate => "duplicate",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "valid" => ImportResultStatus::Valid,
            "risky" => ImportResultStatus::Risky,
            "duplicate" => ImportResultStatus::Duplicate,
            _ => ImportResultStatus::Invalid,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateHandling {
    #[default]
    Skip,
    Update,
    Replace,
}

/// Column name in the CSV mapped to a subscriber field key.
pub type ColumnMapping = BTreeMap<String, String>;

fn default_threshold() -> u8 {
    70
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImportOptions {
    #[serde(default)]
    pub column_mapping: ColumnMapping,
    #[serde(default)]
    pub duplicate_handling: DuplicateHandling,
    #[serde(default = "default_threshold")]
    pub validation_threshold: u8,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub group_ids: Vec<String>,
    #[serde(default)]
    pub segment_ids: Vec<String>,
    #[serde(default)]
    pub sender_ip: Option<String>,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            column_mapping: ColumnMapping::new(),
            duplicate_handling: DuplicateHandling::Skip,
            validation_threshold: default_threshold(),
            batch_size: None,
            group_ids: Vec::new(),
            segment_ids: Vec::new(),
            sender_ip: None,
        }
    }
}

impl ImportOptions {
    /// CSV column that feeds the `email` field.
    pub fn email_column(&self) -> Option<&str> {
        self.column_mapping
            .iter()
            .find(|(_, field)| field.as_str() == "email")
            .map(|(col, _)| col.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImportCounts {
    pub total: i64,
    pub processed: i64,
    pub valid: i64,
    pub invalid: i64,
    pub risky: i64,
    pub duplicate: i64,
}

impl ImportCounts {
    pub fn record(&mut self, status: ImportResultStatus) {
        self.processed += 1;
        match status {
            ImportResultStatus::Valid => self.valid += 1,
            ImportResultStatus::Risky => self.risky += 1,
            ImportResultStatus::Invalid => self.invalid += 1,
            ImportResultStatus::Duplicate => self.duplicate += 1,
        }
    }

    pub fn classified(&self) -> i64 {
        self.valid + self.invalid + self.risky + self.duplicate
    }

    pub fn progress_percentage(&self) -> i32 {
        if self.total <= 0 {
            return 100;
        }
        ((self.processed * 100) / self.total).clamp(0, 100) as i32
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationSummary {
    pub total_processed: i64,
    pub valid: i64,
    pub invalid: i64,
    pub risky: i64,
    pub duplicates: i64,
    pub average_confidence: f64,
    pub processing_time_ms: u64,
    pub created: i64,
    pub updated: i64,
    pub skipped: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportJob {
    pub id: Uuid,
    pub file_name: String,
    pub original_file_name: String,
    pub file_path: String,
    pub status: ImportJobStatus,
    pub total_records: i64,
    pub processed_records: i64,
    pub valid_records: i64,
    pub invalid_records: i64,
    pub risky_records: i64,
    pub duplicate_records: i64,
    pub imported_records: i64,
    pub options: ImportOptions,
    pub column_mapping: ColumnMapping,
    pub validation_summary: Option<ValidationSummary>,
    pub error: Option<String>,
    pub user_id: Option<String>,
    pub progress_percentage: i32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ImportJob {
    pub fn counts(&self) -> ImportCounts {
        ImportCounts {
            total: self.total_records,
            processed: self.processed_records,
            valid: self.valid_records,
            invalid: self.invalid_records,
            risky: self.risky_records,
            duplicate: self.duplicate_records,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewImportJob {
    pub file_name: String,
    pub original_file_name: String,
    pub file_path: String,
    pub total_records: i64,
    pub options: ImportOptions,
    pub user_id: Option<String>,
}

impl NewImportJob {
    pub fn into_job(self) -> ImportJob {
        ImportJob {
            id: Uuid::new_v4(),
            file_name: self.file_name,
            original_file_name: self.original_file_name,
            file_path: self.file_path,
            status: ImportJobStatus::Created,
            total_records: self.total_records,
            processed_records: 0,
            valid_records: 0,
            invalid_records: 0,
            risky_records: 0,
            duplicate_records: 0,
            imported_records: 0,
            column_mapping: self.options.column_mapping.clone(),
            options: self.options,
            validation_summary: None,
            error: None,
            user_id: self.user_id,
            progress_percentage: 0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub id: Uuid,
    pub import_job_id: Uuid,
    pub row_number: i64,
    pub email: String,
    pub status: ImportResultStatus,
    pub confidence_score: i32,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
    pub original_data: serde_json::Value,
    pub mailer_check: Option<String>,
    pub imported: bool,
    pub subscriber_id: Option<Uuid>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewImportResult {
    pub import_job_id: Uuid,
    pub row_number: i64,
    pub email: String,
    pub status: ImportResultStatus,
    pub confidence_score: i32,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
    pub original_data: serde_json::Value,
    pub mailer_check: Option<String>,
}

impl NewImportResult {
    pub fn into_result(self) -> ImportResult {
        ImportResult {
            id: Uuid::new_v4(),
            import_job_id: self.import_job_id,
            row_number: self.row_number,
            email: self.email,
            status: self.status,
            confidence_score: self.confidence_score,
            issues: self.issues,
            suggestions: self.suggestions,
            original_data: self.original_data,
            mailer_check: self.mailer_check,
            imported: false,
            subscriber_id: None,
            error: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobFilter {
    pub user_id: Option<String>,
    pub status: Option<ImportJobStatus>,
    pub page: u32,
    pub limit: u32,
}

/// Raw aggregates over import jobs.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobAggregates {
    pub total_jobs: i64,
    pub completed_jobs: i64,
    pub failed_jobs: i64,
    pub total_records_processed: i64,
    pub total_valid_records: i64,
    pub average_success_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_is_accepted_as_created() {
        let s: ImportJobStatus = serde_json::from_str("\"pending\"").unwrap();
        assert_eq!(s, ImportJobStatus::Created);
        assert_eq!(serde_json::to_string(&s).unwrap(), "\"created\"");
    }

    #[test]
    fn counts_track_every_classification() {
        let mut c = ImportCounts {
            total: 4,
            ..Default::default()
        };
        for s in [
            ImportResultStatus::Valid,
            ImportResultStatus::Risky,
            ImportResultStatus::Invalid,
            ImportResultStatus::Duplicate,
        ] {
            c.record(s);
        }
        assert_eq!(c.classified(), c.total);
        assert_eq!(c.progress_percentage(), 100);
    }

    #[test]
    fn options_default_when_fields_missing() {
        let opts: ImportOptions =
            serde_json::from_str(r#"{"columnMapping":{"E-mail":"email"}}"#).unwrap();
        assert_eq!(opts.validation_threshold, 70);
        assert_eq!(opts.duplicate_handling, DuplicateHandling::Skip);
        assert_eq!(opts.email_column(), Some("E-mail"));
    }
}
