use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use mailguard_db::models::ColumnMapping;
use serde::Serialize;
use tracing::info;

use crate::services::email_validation_service::is_basic_email_shape;

pub type CsvRow = BTreeMap<String, String>;

pub const STANDARD_FIELDS: [&str; 8] = [
    "email",
    "firstName",
    "lastName",
    "company",
    "phone",
    "location",
    "customerStatus",
    "subscriptionType",
];

const ALLOWED_EXTENSIONS: [&str; 4] = ["csv", "txt", "xls", "xlsx"];

/// Header patterns as `(prefix, suffix)`; an empty suffix means exact match.
const FIELD_PATTERNS: [(&str, &[(&str, &str)]); 5] = [
    (
        "email",
        &[
            ("mail", ""),
            ("email", ""),
            ("e-mail", ""),
            ("-mail", ""),
            ("email", "address"),
            ("contact", "email"),
            ("user", "email"),
            ("subscriber", "email"),
        ],
    ),
    (
        "firstName",
        &[("first", "name"), ("fname", ""), ("given", "name"), ("forename", "")],
    ),
    (
        "lastName",
        &[("last", "name"), ("lname", ""), ("surname", ""), ("family", "name")],
    ),
    (
        "phone",
        &[
            ("phone", ""),
            ("telephone", ""),
            ("mobile", ""),
            ("cell", ""),
            ("contact", "number"),
        ],
    ),
    (
        "company",
        &[
            ("company", ""),
            ("organization", ""),
            ("org", ""),
            ("business", ""),
            ("employer", ""),
        ],
    ),
];

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ParseError {
    pub row: usize,
    pub message: String,
    pub code: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedCsv {
    pub headers: Vec<String>,
    pub rows: Vec<CsvRow>,
    pub errors: Vec<ParseError>,
}

impl ParsedCsv {
    pub fn total_rows(&self) -> usize {
        self.rows.len()
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Email,
    Number,
    Date,
    Text,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    pub samples: Vec<String>,
    pub null_count: usize,
    pub unique_count: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ColumnSuggestion {
    pub csv_column: String,
    pub suggested_field: String,
    pub confidence: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDetection {
    pub detected_columns: Vec<DetectedColumn>,
    pub suggestions: Vec<ColumnSuggestion>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTypeCheck {
    pub is_valid: bool,
    pub file_type: String,
    pub file_size: u64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

pub fn parse_csv_bytes(bytes: &[u8]) -> Result<ParsedCsv> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(bytes);

    let headers: Vec<String> = reader
        .headers()
        .context("Failed to read CSV header row")?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut parsed = ParsedCsv {
        headers,
        ..Default::default()
    };

    for (idx, record) in reader.records().enumerate() {
        let row = idx + 1;
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                parsed.errors.push(ParseError {
                    row,
                    message: e.to_string(),
                    code: "PARSE_ERROR".to_string(),
                });
                continue;
            }
        };
        if record.iter().all(|v| v.is_empty()) {
            continue;
        }
        if record.len() != parsed.headers.len() {
            parsed.errors.push(ParseError {
                row,
                message: format!(
                    "Expected {} fields but found {}",
                    parsed.headers.len(),
                    record.len()
                ),
                code: if record.len() < parsed.headers.len() {
                    "TOO_FEW_FIELDS".to_string()
                } else {
                    "TOO_MANY_FIELDS".to_string()
                },
            });
            continue;
        }
        parsed.rows.push(
            parsed
                .headers
                .iter()
                .cloned()
                .zip(record.iter().map(str::to_string))
                .collect(),
        );
    }

    Ok(parsed)
}

pub async fn parse_csv_file(path: &Path) -> Result<ParsedCsv> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read CSV file {}", path.display()))?;
    let parsed = parse_csv_bytes(&bytes)?;
    info!(
        "CSV parsing completed: {} rows, {} columns, {} errors",
        parsed.total_rows(),
        parsed.headers.len(),
        parsed.errors.len()
    );
    Ok(parsed)
}

fn mime_compatible(declared: &str, detected: &str) -> bool {
    declared == detected
        || match declared {
            "text/csv" => detected == "text/plain",
            "application/csv" => matches!(detected, "text/plain" | "text/csv"),
            "text/plain" => matches!(detected, "text/csv" | "application/csv"),
            _ => false,
        }
}

pub fn validate_file_type(
    file_name: &str,
    declared_mime: &str,
    size: u64,
    max_size: u64,
    allowed_mime_types: &[String],
) -> FileTypeCheck {
    let mut check = FileTypeCheck {
        is_valid: true,
        file_type: declared_mime.to_string(),
        file_size: size,
        errors: Vec::new(),
        warnings: Vec::new(),
    };

    if size > max_size {
        check.errors.push(format!(
            "File size {size} bytes exceeds maximum allowed size of {max_size} bytes"
        ));
    }
    if !allowed_mime_types.iter().any(|m| m == declared_mime) {
        check.errors.push(format!(
            "File type {declared_mime} is not allowed. Allowed types: {}",
            allowed_mime_types.join(", ")
        ));
    }

    if let Some(guessed) = mime_guess::from_path(file_name).first() {
        let guessed = guessed.essence_str();
        if !mime_compatible(declared_mime, guessed) {
            check.warnings.push(format!(
                "Detected file type {guessed} differs from declared type {declared_mime}"
            ));
        }
    }

    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    if !ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
        check
            .warnings
            .push(format!("File extension .{ext} may not be compatible"));
    }

    check.is_valid = check.errors.is_empty();
    check
}

fn looks_like_date(value: &str) -> bool {
    DateTime::parse_from_rfc3339(value).is_ok()
        || DateTime::parse_from_rfc2822(value).is_ok()
        || ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"]
            .iter()
            .any(|f| NaiveDateTime::parse_from_str(value, f).is_ok())
        || ["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d", "%d.%m.%Y", "%b %d %Y", "%d %b %Y"]
            .iter()
            .any(|f| NaiveDate::parse_from_str(value, f).is_ok())
}

fn mostly(values: &[&str], pred: impl Fn(&str) -> bool) -> bool {
    if values.is_empty() {
        return false;
    }
    let hits = values.iter().filter(|v| pred(v)).count();
    hits as f64 / values.len() as f64 > 0.8
}

fn analyze_column(name: &str, rows: &[CsvRow]) -> DetectedColumn {
    let values: Vec<&str> = rows
        .iter()
        .filter_map(|r| r.get(name))
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .collect();

    let column_type = if mostly(&values, is_basic_email_shape) {
        ColumnType::Email
    } else if mostly(&values, |v| v.parse::<f64>().is_ok()) {
        ColumnType::Number
    } else if mostly(&values, looks_like_date) {
        ColumnType::Date
    } else {
        ColumnType::Text
    };

    DetectedColumn {
        name: name.to_string(),
        column_type,
        samples: values.iter().take(5).map(|v| v.to_string()).collect(),
        null_count: rows.len() - values.len(),
        unique_count: values.iter().collect::<HashSet<_>>().len(),
    }
}

fn header_matches(header: &str, prefix: &str, suffix: &str) -> bool {
    let h = header.to_lowercase();
    if suffix.is_empty() {
        h == prefix
    } else {
        h.len() >= prefix.len() + suffix.len() && h.starts_with(prefix) && h.ends_with(suffix)
    }
}

fn suggest_field(column: &DetectedColumn) -> Option<ColumnSuggestion> {
    for (field, patterns) in FIELD_PATTERNS {
        if patterns
            .iter()
            .any(|(p, s)| header_matches(&column.name, p, s))
        {
            return Some(ColumnSuggestion {
                csv_column: column.name.clone(),
                suggested_field: field.to_string(),
                confidence: 0.9,
                reason: format!("Column name matches {field} pattern"),
            });
        }
    }
    (column.column_type == ColumnType::Email).then(|| ColumnSuggestion {
        csv_column: column.name.clone(),
        suggested_field: "email".to_string(),
        confidence: 0.8,
        reason: "Column contains email addresses".to_string(),
    })
}

pub fn detect_columns(headers: &[String], rows: &[CsvRow]) -> ColumnDetection {
    if rows.is_empty() || headers.is_empty() {
        return ColumnDetection::default();
    }
    let detected_columns: Vec<DetectedColumn> =
        headers.iter().map(|h| analyze_column(h, rows)).collect();
    let suggestions: Vec<ColumnSuggestion> =
        detected_columns.iter().filter_map(suggest_field).collect();
    let strong = suggestions.iter().filter(|s| s.confidence > 0.7).count();
    ColumnDetection {
        confidence: strong as f64 / headers.len() as f64,
        detected_columns,
        suggestions,
    }
}

/// Errors for a CSV-column -> field mapping; empty when usable.
pub fn validate_column_mapping(mapping: &ColumnMapping, headers: &[String]) -> Vec<String> {
    let mut errors = Vec::new();
    if !mapping.values().any(|f| f == "email") {
        errors.push("Required field 'email' is not mapped".to_string());
    }
    for (column, field) in mapping {
        let known = STANDARD_FIELDS.contains(&field.as_str())
            || field.strip_prefix("custom_").is_some_and(|n| !n.is_empty());
        if !known {
            errors.push(format!("Invalid field mapping: '{field}' is not a valid field"));
        }
        if !headers.is_empty() && !headers.contains(column) {
            errors.push(format!("Mapped column '{column}' does not exist in the file"));
        }
    }
    errors
}
