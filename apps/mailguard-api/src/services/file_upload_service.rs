use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use crate::config::UploadConfig;
use crate::error::{AppError, AppResult};
use crate::services::csv_service::{FileTypeCheck, validate_file_type};
use crate::services::file_security_service::{FileSecurityService, collect_files};

const MAX_NAME_LEN: usize = 100;

/// A file received from a client, fully buffered.
#[derive(Debug, Clone)]
pub struct IncomingFile {
    pub original_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl IncomingFile {
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub custom_path: Option<String>,
    pub generate_job_id: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            custom_path: None,
            generate_job_id: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub job_id: String,
    pub file_name: String,
    pub original_file_name: String,
    pub file_path: PathBuf,
    pub file_size: u64,
    pub mime_type: String,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_readable: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStats {
    pub total_files: u64,
    pub total_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_file: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_file: Option<DateTime<Utc>>,
}

pub fn is_file_name_secure(name: &str) -> bool {
    !name.trim().is_empty()
        && !name.contains("..")
        && !name.contains('/')
        && !name.contains('\\')
        && !name
            .chars()
            .any(|c| matches!(c, '\u{0000}'..='\u{001f}' | '\u{007f}'..='\u{009f}'))
}

pub fn sanitize_file_name(name: &str) -> String {
    let replaced: String = name
        .replace("..", "_")
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            _ => c,
        })
        .collect();
    let trimmed = replaced.trim_start_matches('.');

    let mut out = String::with_capacity(trimmed.len());
    let mut in_space = false;
    for c in trimmed.chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push('_');
            }
            in_space = true;
        } else {
            out.push(c);
            in_space = false;
        }
    }
    out.chars().take(MAX_NAME_LEN).collect()
}

fn sanitize_path(custom: &str) -> PathBuf {
    custom
        .split(['/', '\\'])
        .map(sanitize_file_name)
        .filter(|part| !part.is_empty())
        .collect()
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::new();
    while n > 0 {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8_lossy(&buf).into_owned()
}

pub fn generate_job_id() -> String {
    let millis = Utc::now().timestamp_millis().max(0) as u64;
    format!(
        "{}-{}",
        to_base36(millis),
        hex::encode(rand::random::<[u8; 6]>())
    )
}

/// True when `path` stays below `root` without any `..` component.
pub fn is_path_within(root: &Path, path: &Path) -> bool {
    !path.components().any(|c| matches!(c, Component::ParentDir)) && path.starts_with(root)
}

fn timestamp(meta: &std::fs::Metadata) -> Option<DateTime<Utc>> {
    meta.created()
        .or_else(|_| meta.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

async fn remove_upload(upload_dir: &Path, path: &Path) -> bool {
    if !is_path_within(upload_dir, path) {
        error!("Refusing to delete {}: path is not secure", path.display());
        return false;
    }
    match fs::remove_file(path).await {
        Ok(()) => {
            info!("File deleted: {}", path.display());
            true
        }
        Err(e) => {
            warn!("Failed to delete file {}: {}", path.display(), e);
            false
        }
    }
}

pub struct FileUploadService {
    config: UploadConfig,
    security: Arc<FileSecurityService>,
}

impl FileUploadService {
    pub fn new(config: &UploadConfig, security: Arc<FileSecurityService>) -> Self {
        Self {
            config: config.clone(),
            security,
        }
    }

    pub fn upload_dir(&self) -> &Path {
        &self.config.upload_dir
    }

    pub async fn init(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.config.upload_dir)
            .await
            .context("Upload directory initialization failed")?;
        self.security.init().await
    }

    fn validate_uploaded_file(&self, file: &IncomingFile) -> AppResult<()> {
        let max = self.config.max_file_size;
        if file.size() > max {
            return Err(AppError::validation(format!(
                "File size {} bytes exceeds maximum allowed size of {} bytes",
                file.size(),
                max
            )));
        }
        if !self.config.allowed_mime_types.contains(&file.mime_type) {
            return Err(AppError::validation(format!(
                "File type {} is not allowed. Allowed types: {}",
                file.mime_type,
                self.config.allowed_mime_types.join(", ")
            )));
        }
        if !is_file_name_secure(&file.original_name) {
            return Err(AppError::validation("File name contains invalid characters"));
        }
        let check = validate_file_type(
            &file.original_name,
            &file.mime_type,
            file.size(),
            max,
            &self.config.allowed_mime_types,
        );
        if !check.is_valid {
            return Err(AppError::validation(format!(
                "File validation failed: {}",
                check.errors.join(", ")
            )));
        }
        for warning in &check.warnings {
            warn!("{}: {}", file.original_name, warning);
        }
        Ok(())
    }

    fn secure_file_path(&self, original: &str, job_id: &str, custom: Option<&str>) -> PathBuf {
        let name = format!(
            "{}-{}-{}",
            Utc::now().timestamp_millis(),
            hex::encode(rand::random::<[u8; 4]>()),
            sanitize_file_name(original)
        );
        let dir = match custom {
            Some(custom) => self.config.upload_dir.join(sanitize_path(custom)),
            None if !job_id.is_empty() => self.config.upload_dir.join("imports").join(job_id),
            None => self.config.upload_dir.join("general"),
        };
        dir.join(name)
    }

    async fn save_file_securely(&self, bytes: &[u8], path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut out = options
            .open(path)
            .await
            .with_context(|| format!("Failed to save file {}", path.display()))?;
        out.write_all(bytes).await.context("Failed to save file")?;
        out.flush().await.context("Failed to save file")?;
        Ok(())
    }

    pub async fn upload_file(
        &self,
        file: &IncomingFile,
        options: &UploadOptions,
    ) -> AppResult<UploadResult> {
        let job_id = if options.generate_job_id {
            generate_job_id()
        } else {
            String::new()
        };

        let result = self.store(file, options, &job_id).await;
        if let Err(e) = &result {
            error!("File upload failed for {}: {}", file.original_name, e);
        }
        result
    }

    async fn store(
        &self,
        file: &IncomingFile,
        options: &UploadOptions,
        job_id: &str,
    ) -> AppResult<UploadResult> {
        self.validate_uploaded_file(file)?;

        let path = self.secure_file_path(&file.original_name, job_id, options.custom_path.as_deref());
        self.save_file_securely(&file.bytes, &path).await?;

        if self.config.enable_malware_scanning {
            let report = self.security.secure_file_storage(&path, job_id).await;
            if !report.is_secure {
                if report.quarantined.is_none() {
                    let _ = fs::remove_file(&path).await;
                }
                return Err(AppError::validation(format!(
                    "File failed security validation: {}",
                    report.issues.join(", ")
                )));
            }
            info!("File security validation passed for {}", file.original_name);
        }

        info!(
            "File uploaded successfully: {} -> {}",
            file.original_name,
            path.display()
        );
        self.schedule_file_cleanup(path.clone());

        Ok(UploadResult {
            job_id: job_id.to_string(),
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            original_file_name: file.original_name.clone(),
            file_path: path,
            file_size: file.size(),
            mime_type: file.mime_type.clone(),
            uploaded_at: Utc::now(),
        })
    }

    fn schedule_file_cleanup(&self, path: PathBuf) {
        let upload_dir = self.config.upload_dir.clone();
        let delay = Duration::from_secs(self.config.auto_cleanup_hours * 3600);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if fs::try_exists(&path).await.unwrap_or(false) {
                remove_upload(&upload_dir, &path).await;
            }
        });
    }

    /// Fails only when every file fails.
    pub async fn upload_multiple_files(
        &self,
        files: &[IncomingFile],
        options: &UploadOptions,
    ) -> AppResult<Vec<UploadResult>> {
        let mut results = Vec::new();
        let mut errors = Vec::new();
        for file in files {
            match self.upload_file(file, options).await {
                Ok(r) => results.push(r),
                Err(e) => errors.push(format!("{}: {}", file.original_name, e)),
            }
        }
        if !errors.is_empty() && results.is_empty() {
            return Err(AppError::validation(format!(
                "All file uploads failed: {}",
                errors.join(", ")
            )));
        }
        if !errors.is_empty() {
            warn!("Some files failed to upload: {}", errors.join(", "));
        }
        Ok(results)
    }

    /// Type and size check against the configured limits, without storing anything.
    pub fn check_file_type(&self, file: &IncomingFile) -> FileTypeCheck {
        let mut check = validate_file_type(
            &file.original_name,
            &file.mime_type,
            file.size(),
            self.config.max_file_size,
            &self.config.allowed_mime_types,
        );
        if !is_file_name_secure(&file.original_name) {
            check.errors.push("File name contains invalid characters".to_string());
        }
        check.is_valid = check.errors.is_empty();
        check
    }

    /// Location of an uploaded import file, rejecting names that could leave the upload directory.
    pub fn import_file_path(&self, job_id: &str, file_name: &str) -> AppResult<PathBuf> {
        if !is_file_name_secure(job_id) || !is_file_name_secure(file_name) {
            return Err(AppError::validation("Invalid job id or file name"));
        }
        let path = self.config.upload_dir.join("imports").join(job_id).join(file_name);
        if !self.is_path_secure(&path) {
            return Err(AppError::validation("File path is not secure"));
        }
        Ok(path)
    }

    pub async fn get_file_info(&self, path: &Path) -> FileInfo {
        let Ok(meta) = fs::metadata(path).await else {
            return FileInfo::default();
        };
        FileInfo {
            exists: true,
            size: Some(meta.len()),
            created_at: timestamp(&meta),
            is_readable: Some(fs::File::open(path).await.is_ok()),
        }
    }

    pub async fn delete_file(&self, path: &Path) -> bool {
        remove_upload(&self.config.upload_dir, path).await
    }

    pub fn is_path_secure(&self, path: &Path) -> bool {
        is_path_within(&self.config.upload_dir, path)
    }

    pub async fn cleanup_old_files(&self, max_age: Duration) -> u64 {
        let now = SystemTime::now();
        let mut cleaned = 0;
        for path in collect_files(&self.config.upload_dir).await {
            let Ok(meta) = fs::metadata(&path).await else {
                continue;
            };
            let old = meta
                .created()
                .or_else(|_| meta.modified())
                .ok()
                .and_then(|t| now.duration_since(t).ok())
                .is_some_and(|age| age > max_age);
            if old && fs::remove_file(&path).await.is_ok() {
                cleaned += 1;
            }
        }
        info!("Cleaned up {} old files", cleaned);
        cleaned
    }

    pub async fn get_upload_stats(&self) -> UploadStats {
        let mut stats = UploadStats::default();
        for path in collect_files(&self.config.upload_dir).await {
            stats.total_files += 1;
            let Ok(meta) = fs::metadata(&path).await else {
                continue;
            };
            stats.total_size += meta.len();
            if let Some(ts) = timestamp(&meta) {
                if stats.oldest_file.is_none_or(|o| ts < o) {
                    stats.oldest_file = Some(ts);
                }
                if stats.newest_file.is_none_or(|n| ts > n) {
                    stats.newest_file = Some(ts);
                }
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(root: &Path) -> FileUploadService {
        let cfg = UploadConfig {
            upload_dir: root.join("uploads"),
            quarantine_dir: root.join("quarantine"),
            temp_root: root.join("temp"),
            max_file_size: 1024,
            ..UploadConfig::default()
        };
        FileUploadService::new(&cfg, Arc::new(FileSecurityService::new(&cfg)))
    }

    fn csv(name: &str, body: &[u8]) -> IncomingFile {
        IncomingFile {
            original_name: name.to_string(),
            mime_type: "text/csv".to_string(),
            bytes: body.to_vec(),
        }
    }

    #[test]
    fn file_name_rules() {
        assert!(is_file_name_secure("subscribers 2024.csv"));
        assert!(!is_file_name_secure("../etc/passwd"));
        assert!(!is_file_name_secure("a\\b.csv"));
        assert!(!is_file_name_secure("bad\u{0007}.csv"));
        assert!(!is_file_name_secure("bad\u{0085}.csv"));

        assert_eq!(sanitize_file_name("..hidden list?.csv"), "_hidden_list_.csv");
        assert_eq!(sanitize_file_name(".profile"), "profile");
        assert_eq!(sanitize_file_name(&"x".repeat(300)).len(), MAX_NAME_LEN);
    }

    #[test]
    fn job_ids_are_base36_and_hex() {
        let id = generate_job_id();
        let (ts, rand) = id.split_once('-').unwrap();
        assert!(ts.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
        assert_eq!(rand.len(), 12);
        assert!(rand.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
    }

    #[test]
    fn import_paths_reject_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let path = svc.import_file_path("job-1", "list.csv").unwrap();
        assert_eq!(path, dir.path().join("uploads").join("imports").join("job-1").join("list.csv"));
        assert!(svc.import_file_path("..", "list.csv").is_err());
        assert!(svc.import_file_path("job-1", "../../etc/passwd").is_err());
        assert!(svc.import_file_path("job-1", "").is_err());
    }

    #[test]
    fn type_check_reports_every_problem() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        assert!(svc.check_file_type(&csv("list.csv", b"email\n")).is_valid);

        let mut bad = csv("bad\u{0007}.exe", &[b'x'; 2048]);
        bad.mime_type = "application/x-msdownload".to_string();
        let check = svc.check_file_type(&bad);
        assert!(!check.is_valid);
        assert_eq!(check.errors.len(), 3, "{:?}", check.errors);
    }

    #[test]
    fn paths_must_stay_in_upload_dir() {
        let root = Path::new("/srv/uploads");
        assert!(is_path_within(root, Path::new("/srv/uploads/imports/a.csv")));
        assert!(!is_path_within(root, Path::new("/srv/uploads/../secrets")));
        assert!(!is_path_within(root, Path::new("/etc/passwd")));
    }

    #[tokio::test]
    async fn stores_clean_upload_under_job_directory() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        svc.init().await.unwrap();

        let upload = svc
            .upload_file(&csv("my list.csv", b"email\njane@example.com\n"), &UploadOptions::default())
            .await
            .unwrap();
        assert!(upload.file_path.exists());
        assert!(upload.file_name.ends_with("-my_list.csv"));
        assert!(
            upload
                .file_path
                .starts_with(dir.path().join("uploads").join("imports").join(&upload.job_id))
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&upload.file_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let info = svc.get_file_info(&upload.file_path).await;
        assert!(info.exists);
        assert_eq!(info.size, Some(upload.file_size));

        let stats = svc.get_upload_stats().await;
        assert_eq!(stats.total_files, 1);

        assert!(svc.delete_file(&upload.file_path).await);
        assert!(!svc.get_file_info(&upload.file_path).await.exists);
    }

    #[tokio::test]
    async fn rejects_invalid_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        svc.init().await.unwrap();
        let opts = UploadOptions::default();

        let big = csv("big.csv", &vec![b'a'; 2048]);
        assert!(matches!(svc.upload_file(&big, &opts).await, Err(AppError::Validation(_))));

        let mut exe = csv("tool.csv", b"MZ\x90\x00");
        exe.mime_type = "application/x-msdownload".into();
        assert!(matches!(svc.upload_file(&exe, &opts).await, Err(AppError::Validation(_))));

        let traversal = csv("../x.csv", b"email\n");
        assert!(matches!(
            svc.upload_file(&traversal, &opts).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn malicious_upload_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        svc.init().await.unwrap();

        let err = svc
            .upload_file(&csv("list.csv", b"MZ\x90\x00email\n"), &UploadOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("PE Executable"));
        assert_eq!(svc.get_upload_stats().await.total_files, 0);
        let quarantined = collect_files(&dir.path().join("quarantine")).await;
        assert_eq!(quarantined.len(), 2);
    }

    #[tokio::test]
    async fn multiple_uploads_fail_only_when_all_fail() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        svc.init().await.unwrap();
        let opts = UploadOptions::default();

        let ok = svc
            .upload_multiple_files(&[csv("a.csv", b"email\na@b.com\n"), csv("../b.csv", b"x")], &opts)
            .await
            .unwrap();
        assert_eq!(ok.len(), 1);

        assert!(
            svc.upload_multiple_files(&[csv("../b.csv", b"x")], &opts)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn delete_refuses_paths_outside_upload_dir() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let outside = dir.path().join("keep.txt");
        std::fs::write(&outside, b"keep").unwrap();
        assert!(!svc.delete_file(&outside).await);
        assert!(outside.exists());
        assert!(!svc.is_path_secure(&outside));
    }
}
