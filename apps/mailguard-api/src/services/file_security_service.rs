use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::config::UploadConfig;

const MAX_SCAN_SIZE: u64 = 100 * 1024 * 1024;
const MAX_FIRST_LINE: usize = 1000;
const ENTROPY_LIMIT: f64 = 7.5;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    fn label(&self) -> &'static str {
        match self {
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Threat {
    pub name: String,
    pub risk: RiskLevel,
}

impl Threat {
    fn new(name: impl Into<String>, risk: RiskLevel) -> Self {
        Self {
            name: name.into(),
            risk,
        }
    }

    pub fn describe(&self) -> String {
        format!("{} ({} risk)", self.name, self.risk.label())
    }

    pub fn is_blocking(&self) -> bool {
        self.risk >= RiskLevel::High
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    pub is_clean: bool,
    pub threats: Vec<Threat>,
    pub warnings: Vec<String>,
    pub entropy: f64,
    pub size: u64,
}

impl ScanReport {
    fn from_threats(threats: Vec<Threat>, entropy: f64, size: u64) -> Self {
        let warnings = threats
            .iter()
            .filter(|t| !t.is_blocking())
            .map(Threat::describe)
            .collect();
        Self {
            is_clean: !threats.iter().any(Threat::is_blocking),
            threats,
            warnings,
            entropy,
            size,
        }
    }

    pub fn blocking_descriptions(&self) -> Vec<String> {
        self.threats
            .iter()
            .filter(|t| t.is_blocking())
            .map(Threat::describe)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityReport {
    pub file_path: String,
    pub is_secure: bool,
    pub scan: Option<ScanReport>,
    pub integrity_hash: Option<String>,
    pub permissions_set: bool,
    pub quarantined: Option<PathBuf>,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub cleaned_files: u64,
    pub total_size: u64,
    pub errors: Vec<String>,
}

impl CleanupReport {
    fn absorb(&mut self, other: CleanupReport) {
        self.cleaned_files += other.cleaned_files;
        self.total_size += other.total_size;
        self.errors.extend(other.errors);
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QuarantineMetadata<'a> {
    original_path: String,
    job_id: &'a str,
    quarantine_time: chrono::DateTime<Utc>,
    threats: &'a [String],
    file_size: u64,
}

const SIGNATURES: [(&[u8], &str, RiskLevel); 8] = [
    (b"MZ", "PE Executable", RiskLevel::High),
    (b"\x7fELF", "ELF Executable", RiskLevel::High),
    (b"\xca\xfe\xba\xbe", "Mach-O Executable", RiskLevel::High),
    (b"PK\x03\x04", "ZIP Archive", RiskLevel::Medium),
    (b"Rar!", "RAR Archive", RiskLevel::Medium),
    (b"#!/bin/sh", "Shell Script", RiskLevel::High),
    (b"#!/bin/bash", "Bash Script", RiskLevel::High),
    (b"<?php", "PHP Script", RiskLevel::Medium),
];

pub fn scan_signatures(bytes: &[u8]) -> Vec<Threat> {
    SIGNATURES
        .iter()
        .filter(|(sig, _, _)| bytes.starts_with(sig))
        .map(|(_, name, risk)| Threat::new(*name, *risk))
        .collect()
}

/// Content patterns, case-insensitive. Keyword patterns require word boundaries
/// so ordinary prose in CSV cells does not match.
const CONTENT_PATTERNS: [(&str, &str, RiskLevel); 15] = [
    (r"(?i)<script[^>]*>", "Script Tag", RiskLevel::High),
    (r"(?i)javascript:", "JavaScript Protocol", RiskLevel::High),
    (r"(?i)vbscript:", "VBScript Protocol", RiskLevel::High),
    (r"(?i)\bon\w+\s*=", "Event Handler", RiskLevel::Medium),
    (r"(?i)\beval\s*\(", "Eval Function", RiskLevel::High),
    (r"(?i)document\.write", "Document Write", RiskLevel::Medium),
    (r"\$\([^)]+\)", "Command Substitution", RiskLevel::High),
    (r"`[^`]+`", "Backtick Command", RiskLevel::High),
    (r"(?i);\s*(rm|del|format|fdisk)\b", "Destructive Command", RiskLevel::Critical),
    (
        r"(?i)\b(union\s+(all\s+)?select|select\s+.+?\s+from|insert\s+into|delete\s+from|drop\s+(table|database))\b",
        "SQL Statement",
        RiskLevel::High,
    ),
    (r"(?i)'\s*(or|and)\s*'?\d", "SQL Injection Pattern", RiskLevel::High),
    (r"\.\.[/\\]", "Path Traversal", RiskLevel::High),
    (r"(?i)[/\\]etc[/\\]passwd", "System File Access", RiskLevel::Critical),
    (r"(?i)%[0-9a-f]{2}", "URL Encoded Content", RiskLevel::Medium),
    (r"(?i)\\x[0-9a-f]{2}", "Hex Encoded Content", RiskLevel::Medium),
];

static COMPILED_PATTERNS: LazyLock<Vec<(Regex, &'static str, RiskLevel)>> = LazyLock::new(|| {
    CONTENT_PATTERNS
        .iter()
        .filter_map(|(pattern, name, risk)| match Regex::new(pattern) {
            Ok(re) => Some((re, *name, *risk)),
            Err(e) => {
                error!("Invalid content pattern for {}: {}", name, e);
                None
            }
        })
        .collect()
});

pub fn scan_patterns(text: &str) -> Vec<Threat> {
    COMPILED_PATTERNS
        .iter()
        .filter(|(re, _, _)| re.is_match(text))
        .map(|(_, name, risk)| Threat::new(*name, *risk))
        .collect()
}

pub fn scan_behavior(path: &Path, bytes: &[u8], size: u64) -> Vec<Threat> {
    let mut threats = Vec::new();
    if size == 0 {
        threats.push(Threat::new("Empty file (potential placeholder)", RiskLevel::High));
    } else if size > MAX_SCAN_SIZE {
        threats.push(Threat::new("Unusually large file size", RiskLevel::High));
    }

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase);
    if matches!(ext.as_deref(), Some("csv") | Some("txt")) {
        let first_line = bytes.split(|b| *b == b'\n').next().unwrap_or_default();
        if String::from_utf8_lossy(first_line).chars().count() > MAX_FIRST_LINE {
            threats.push(Threat::new(
                "Suspicious line length for CSV/text file",
                RiskLevel::High,
            ));
        }
    }
    threats
}

/// Shannon entropy in bits per byte.
pub fn shannon_entropy(bytes: &[u8]) -> f64 {
    if bytes.is_empty() {
        return 0.0;
    }
    let mut freq = [0u64; 256];
    for b in bytes {
        freq[*b as usize] += 1;
    }
    let len = bytes.len() as f64;
    freq.iter()
        .filter(|f| **f > 0)
        .map(|f| {
            let p = *f as f64 / len;
            -p * p.log2()
        })
        .sum()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub(crate) async fn collect_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(mut entries) = fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            match entry.file_type().await {
                Ok(t) if t.is_dir() => stack.push(path),
                Ok(_) => files.push(path),
                Err(_) => {}
            }
        }
    }
    files
}

/// Remove empty directories below and including `root`, deepest first.
async fn prune_empty_dirs(root: &Path, keep_root: bool) {
    let mut dirs = vec![root.to_path_buf()];
    let mut i = 0;
    while i < dirs.len() {
        if let Ok(mut entries) = fs::read_dir(&dirs[i]).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                    dirs.push(entry.path());
                }
            }
        }
        i += 1;
    }
    for dir in dirs.iter().rev() {
        if keep_root && dir == root {
            continue;
        }
        // fails when not empty
        let _ = fs::remove_dir(dir).await;
    }
}

pub struct FileSecurityService {
    upload_dir: PathBuf,
    quarantine_dir: PathBuf,
    temp_root: PathBuf,
    enable_clamav: bool,
    quarantine_retention: Duration,
}

impl FileSecurityService {
    pub fn new(config: &UploadConfig) -> Self {
        Self {
            upload_dir: config.upload_dir.clone(),
            quarantine_dir: config.quarantine_dir.clone(),
            temp_root: config.temp_root.clone(),
            enable_clamav: config.enable_clamav,
            quarantine_retention: Duration::from_secs(config.quarantine_retention_days * 24 * 3600),
        }
    }

    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.quarantine_dir)
            .await
            .context("Failed to create quarantine directory")?;
        fs::create_dir_all(self.temp_root.join("integrity"))
            .await
            .context("Failed to create integrity directory")?;
        Ok(())
    }

    fn integrity_file(&self, job_id: &str) -> PathBuf {
        self.temp_root
            .join("integrity")
            .join(format!("{job_id}.hashes.json"))
    }

    fn sensitive_roots(&self) -> Vec<PathBuf> {
        vec![
            self.upload_dir.join("imports"),
            self.temp_root.join("imports"),
            self.temp_root.join("exports"),
            self.temp_root.join("uploads"),
        ]
    }

    pub async fn scan_file(&self, path: &Path) -> Result<ScanReport> {
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("Failed to read {} for scanning", path.display()))?;
        let size = bytes.len() as u64;

        let mut threats = scan_signatures(&bytes);
        threats.extend(scan_patterns(&String::from_utf8_lossy(&bytes)));
        threats.extend(scan_behavior(path, &bytes, size));
        if self.enable_clamav {
            threats.extend(self.external_scan(path).await);
        }
        let entropy = shannon_entropy(&bytes);
        if entropy > ENTROPY_LIMIT {
            threats.push(Threat::new(
                "High entropy content (possible encryption/compression)",
                RiskLevel::High,
            ));
        }

        let report = ScanReport::from_threats(threats, entropy, size);
        if report.is_clean {
            info!("Malware scan completed for {}: CLEAN", path.display());
        } else {
            warn!(
                "Threats detected in {}: {}",
                path.display(),
                report.blocking_descriptions().join(", ")
            );
        }
        Ok(report)
    }

    async fn external_scan(&self, path: &Path) -> Vec<Threat> {
        match tokio::process::Command::new("clamscan")
            .arg("--no-summary")
            .arg(path)
            .output()
            .await
        {
            Ok(out) if String::from_utf8_lossy(&out.stdout).contains("FOUND") => vec![Threat::new(
                "External scanner detected threat",
                RiskLevel::Critical,
            )],
            Ok(_) => Vec::new(),
            Err(e) => {
                debug!("clamscan unavailable: {}", e);
                Vec::new()
            }
        }
    }

    /// Scan, then either quarantine or lock down and fingerprint the file.
    pub async fn secure_file_storage(&self, path: &Path, job_id: &str) -> SecurityReport {
        let mut report = SecurityReport {
            file_path: path.display().to_string(),
            is_secure: false,
            scan: None,
            integrity_hash: None,
            permissions_set: false,
            quarantined: None,
            issues: Vec::new(),
        };

        let scan = match self.scan_file(path).await {
            Ok(scan) => scan,
            Err(e) => {
                error!("File security process failed for {}: {:#}", path.display(), e);
                report
                    .issues
                    .push("Scan failed - file treated as suspicious".to_string());
                return report;
            }
        };

        if !scan.is_clean {
            let threats = scan.blocking_descriptions();
            report.issues.extend(threats.iter().cloned());
            match self.quarantine_file(path, job_id, &threats).await {
                Ok(dest) => {
                    report.quarantined = Some(dest);
                    report
                        .issues
                        .push("File quarantined due to security threats".to_string());
                }
                Err(e) => report.issues.push(format!("Quarantine failed: {e:#}")),
            }
            report.scan = Some(scan);
            return report;
        }
        report.scan = Some(scan);

        if let Err(e) = set_owner_only(path).await {
            report.issues.push(format!("Security process failed: {e:#}"));
            return report;
        }
        report.permissions_set = true;

        match self.store_integrity_hash(path, job_id).await {
            Ok(hash) => report.integrity_hash = Some(hash),
            Err(e) => {
                warn!("Failed to store integrity hash for {}: {:#}", path.display(), e);
            }
        }

        report.is_secure = true;
        info!("File secured: {}", path.display());
        report
    }

    pub async fn quarantine_file(
        &self,
        path: &Path,
        job_id: &str,
        threats: &[String],
    ) -> Result<PathBuf> {
        fs::create_dir_all(&self.quarantine_dir)
            .await
            .context("Failed to create quarantine directory")?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unnamed");
        let dest = self.quarantine_dir.join(format!(
            "{}-{}-{}",
            Utc::now().timestamp_millis(),
            job_id,
            name
        ));

        if fs::rename(path, &dest).await.is_err() {
            fs::copy(path, &dest)
                .await
                .context("Failed to copy file into quarantine")?;
            fs::remove_file(path)
                .await
                .context("Failed to remove quarantined original")?;
        }

        let size = fs::metadata(&dest).await.map(|m| m.len()).unwrap_or(0);
        let metadata = QuarantineMetadata {
            original_path: path.display().to_string(),
            job_id,
            quarantine_time: Utc::now(),
            threats,
            file_size: size,
        };
        let meta_path = PathBuf::from(format!("{}.metadata.json", dest.display()));
        fs::write(&meta_path, serde_json::to_vec_pretty(&metadata)?)
            .await
            .context("Failed to write quarantine metadata")?;

        warn!("File quarantined: {} -> {}", path.display(), dest.display());
        Ok(dest)
    }

    async fn read_hashes(&self, job_id: &str) -> BTreeMap<String, String> {
        match fs::read(self.integrity_file(job_id)).await {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_default(),
            Err(_) => BTreeMap::new(),
        }
    }

    async fn store_integrity_hash(&self, path: &Path, job_id: &str) -> Result<String> {
        let bytes = fs::read(path).await.context("Failed to read file for hashing")?;
        let hash = sha256_hex(&bytes);
        let file = self.integrity_file(job_id);
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut hashes = self.read_hashes(job_id).await;
        hashes.insert(path.display().to_string(), hash.clone());
        fs::write(&file, serde_json::to_vec_pretty(&hashes)?)
            .await
            .context("Failed to write integrity hashes")?;
        Ok(hash)
    }

    /// False when no hash is stored or the content changed. A changed file is quarantined.
    pub async fn verify_file_integrity(&self, path: &Path, job_id: &str) -> bool {
        let hashes = self.read_hashes(job_id).await;
        let Some(stored) = hashes.get(&path.display().to_string()) else {
            warn!("No integrity hash found for {}", path.display());
            return false;
        };
        let current = match fs::read(path).await {
            Ok(bytes) => sha256_hex(&bytes),
            Err(e) => {
                error!("Integrity verification failed for {}: {}", path.display(), e);
                return false;
            }
        };
        if &current == stored {
            return true;
        }
        error!("File integrity check failed for {}", path.display());
        if let Err(e) = self
            .quarantine_file(path, job_id, &["File integrity violation".to_string()])
            .await
        {
            error!("Failed to quarantine tampered file: {:#}", e);
        }
        false
    }

    pub async fn automatic_sensitive_file_cleanup(
        &self,
        job_id: Option<&str>,
        max_age: Duration,
    ) -> CleanupReport {
        let mut report = CleanupReport::default();
        match job_id {
            Some(job) => {
                for root in self.sensitive_roots() {
                    let job_dir = root.join(job);
                    report.absorb(cleanup_directory(&job_dir, None).await);
                    prune_empty_dirs(&job_dir, false).await;
                }
                let hashes = self.integrity_file(job);
                if fs::remove_file(&hashes).await.is_ok() {
                    report.cleaned_files += 1;
                }
            }
            None => {
                for root in self.sensitive_roots() {
                    report.absorb(cleanup_directory(&root, Some(max_age)).await);
                    prune_empty_dirs(&root, true).await;
                }
            }
        }

        report.absorb(cleanup_directory(&self.quarantine_dir, Some(self.quarantine_retention)).await);

        info!(
            "Cleanup completed: {} files cleaned, {} bytes freed",
            report.cleaned_files, report.total_size
        );
        if !report.errors.is_empty() {
            warn!("Cleanup errors: {}", report.errors.join(", "));
        }
        report
    }
}

/// `max_age` of `None` removes everything under `dir`.
async fn cleanup_directory(dir: &Path, max_age: Option<Duration>) -> CleanupReport {
    let mut report = CleanupReport::default();
    let now = SystemTime::now();
    for file in collect_files(dir).await {
        let meta = match fs::metadata(&file).await {
            Ok(m) => m,
            Err(e) => {
                report
                    .errors
                    .push(format!("Failed to clean {}: {}", file.display(), e));
                continue;
            }
        };
        let expired = match max_age {
            None => true,
            Some(age) => meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .is_some_and(|elapsed| elapsed > age),
        };
        if !expired {
            continue;
        }
        match fs::remove_file(&file).await {
            Ok(()) => {
                report.cleaned_files += 1;
                report.total_size += meta.len();
            }
            Err(e) => report
                .errors
                .push(format!("Failed to clean {}: {}", file.display(), e)),
        }
    }
    report
}

#[cfg(unix)]
pub async fn set_owner_only(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .await
        .with_context(|| format!("Failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
pub async fn set_owner_only(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(root: &Path) -> UploadConfig {
        UploadConfig {
            upload_dir: root.join("uploads"),
            quarantine_dir: root.join("quarantine"),
            temp_root: root.join("temp"),
            ..UploadConfig::default()
        }
    }

    fn names(threats: &[Threat]) -> Vec<&str> {
        threats.iter().map(|t| t.name.as_str()).collect()
    }

    #[test]
    fn detects_executable_signatures() {
        assert_eq!(names(&scan_signatures(b"MZ\x90\x00")), vec!["PE Executable"]);
        assert_eq!(names(&scan_signatures(b"\x7fELF\x02")), vec!["ELF Executable"]);
        assert_eq!(
            names(&scan_signatures(b"#!/bin/bash\necho hi")),
            vec!["Bash Script"]
        );
        assert!(scan_signatures(b"email,name\n").is_empty());
    }

    #[test]
    fn every_content_pattern_compiles() {
        assert_eq!(COMPILED_PATTERNS.len(), CONTENT_PATTERNS.len());
    }

    #[test]
    fn php_signature_is_a_warning() {
        let hits = scan_signatures(b"<?php echo 1;");
        assert_eq!(names(&hits), vec!["PHP Script"]);
        assert!(!hits[0].is_blocking());
    }

    #[test]
    fn catches_compact_payload_forms() {
        let hits = scan_patterns("email\n<script/src=//evil.example/x.js></script>\n");
        assert!(names(&hits).contains(&"Script Tag"), "{hits:?}");

        let hits = scan_patterns("name\nx'or1=1\n");
        assert!(names(&hits).contains(&"SQL Injection Pattern"), "{hits:?}");

        let hits = scan_patterns("note\nUNION ALL SELECT password FROM users\n");
        assert!(names(&hits).contains(&"SQL Statement"), "{hits:?}");
    }

    #[test]
    fn keyword_patterns_need_word_boundaries() {
        let hits = scan_patterns("email,notes\na@b.com,medieval(1400s); delivery pending\n");
        assert!(hits.is_empty(), "{hits:?}");
    }

    #[test]
    fn ordinary_csv_has_no_patterns() {
        let csv = "email,first_name,notes\njane@example.com,Jane,Please update me on delivery\n\
                   bob@example.org,Bob,Selected from the spring list\n";
        assert!(scan_patterns(csv).is_empty(), "{:?}", scan_patterns(csv));
    }

    #[test]
    fn detects_injection_patterns() {
        let hits = scan_patterns("a@b.com,<script>alert(1)</script>");
        assert!(names(&hits).contains(&"Script Tag"));

        let hits = scan_patterns("x@y.com,'; DROP TABLE users; --");
        assert!(names(&hits).contains(&"SQL Statement"));

        let hits = scan_patterns("x@y.com,' OR '1'='1");
        assert!(names(&hits).contains(&"SQL Injection Pattern"));

        let hits = scan_patterns("x@y.com,foo; rm -rf /");
        assert!(names(&hits).contains(&"Destructive Command"));

        let hits = scan_patterns("x@y.com,../../etc/passwd");
        assert!(names(&hits).contains(&"Path Traversal"));
        assert!(names(&hits).contains(&"System File Access"));

        let hits = scan_patterns("x@y.com,$(whoami)");
        assert!(names(&hits).contains(&"Command Substitution"));

        let hits = scan_patterns("x@y.com,`id`");
        assert!(names(&hits).contains(&"Backtick Command"));
    }

    #[test]
    fn medium_findings_are_warnings_only() {
        let report = ScanReport::from_threats(scan_patterns("name%20here,onload = x"), 4.0, 10);
        assert!(report.is_clean);
        assert_eq!(report.warnings.len(), 2);
    }

    #[test]
    fn entropy_bounds() {
        assert_eq!(shannon_entropy(b""), 0.0);
        assert_eq!(shannon_entropy(b"aaaa"), 0.0);
        let all: Vec<u8> = (0..=255u8).collect();
        assert!((shannon_entropy(&all) - 8.0).abs() < 1e-9);
    }

    #[test]
    fn long_first_line_is_flagged_for_csv() {
        let line = "a".repeat(1001);
        let hits = scan_behavior(Path::new("x.csv"), line.as_bytes(), 1001);
        assert_eq!(names(&hits), vec!["Suspicious line length for CSV/text file"]);
        assert!(scan_behavior(Path::new("x.bin"), line.as_bytes(), 1001).is_empty());
        assert_eq!(
            names(&scan_behavior(Path::new("x.csv"), b"", 0)),
            vec!["Empty file (potential placeholder)"]
        );
    }

    #[tokio::test]
    async fn infected_file_is_quarantined_with_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let svc = FileSecurityService::new(&config(dir.path()));
        svc.init().await.unwrap();
        let file = dir.path().join("payload.csv");
        fs::write(&file, b"email\nx@y.com,<script>evil()</script>\n")
            .await
            .unwrap();

        let report = svc.secure_file_storage(&file, "job1").await;
        assert!(!report.is_secure);
        let dest = report.quarantined.unwrap();
        assert!(dest.exists());
        assert!(!file.exists());
        let meta = PathBuf::from(format!("{}.metadata.json", dest.display()));
        let meta: serde_json::Value =
            serde_json::from_slice(&std::fs::read(meta).unwrap()).unwrap();
        assert_eq!(meta["jobId"], "job1");
    }

    #[tokio::test]
    async fn clean_file_gets_integrity_hash_and_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let svc = FileSecurityService::new(&config(dir.path()));
        svc.init().await.unwrap();
        let file = dir.path().join("list.csv");
        fs::write(&file, b"email\njane@example.com\n").await.unwrap();

        let report = svc.secure_file_storage(&file, "job2").await;
        assert!(report.is_secure, "{:?}", report.issues);
        assert!(report.permissions_set);
        assert!(svc.verify_file_integrity(&file, "job2").await);

        fs::write(&file, b"email\nmallory@example.com\n").await.unwrap();
        assert!(!svc.verify_file_integrity(&file, "job2").await);
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn job_cleanup_removes_job_directory_only() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let svc = FileSecurityService::new(&cfg);
        let job_dir = cfg.upload_dir.join("imports").join("job3");
        let other_dir = cfg.upload_dir.join("imports").join("job4");
        fs::create_dir_all(&job_dir).await.unwrap();
        fs::create_dir_all(&other_dir).await.unwrap();
        fs::write(job_dir.join("a.csv"), b"12345").await.unwrap();
        fs::write(other_dir.join("b.csv"), b"1").await.unwrap();

        let report = svc
            .automatic_sensitive_file_cleanup(Some("job3"), Duration::from_secs(3600))
            .await;
        assert_eq!(report.cleaned_files, 1);
        assert_eq!(report.total_size, 5);
        assert!(!job_dir.exists());
        assert!(other_dir.join("b.csv").exists());

        let report = svc
            .automatic_sensitive_file_cleanup(None, Duration::from_secs(3600))
            .await;
        assert_eq!(report.cleaned_files, 0);
    }
}
