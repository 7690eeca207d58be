use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_DNSBL_ZONES: [&str; 8] = [
    "zen.spamhaus.org",
    "bl.spamcop.net",
    "b.barracudacentral.org",
    "dnsbl-1.uceprotect.net",
    "dnsbl-2.uceprotect.net",
    "dnsbl-3.uceprotect.net",
    "spam.dnsbl.sorbs.net",
    "dnsbl.dronebl.org",
];

pub const DEFAULT_ALLOWED_MIME_TYPES: [&str; 5] = [
    "text/csv",
    "application/csv",
    "text/plain",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default)]
    pub reputation: ReputationConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub import: ImportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationConfig {
    #[serde(default = "default_zones")]
    pub dnsbl_zones: Vec<String>,
    #[serde(default = "default_dns_timeout_ms")]
    pub dns_timeout_ms: u64,
    /// TTL for definitive answers.
    #[serde(default = "default_day_secs")]
    pub cache_ttl_secs: u64,
    /// TTL when a lookup errored.
    #[serde(default = "default_hour_secs")]
    pub error_cache_ttl_secs: u64,
    #[serde(default = "default_hour_secs")]
    pub email_cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    #[serde(default = "default_quarantine_dir")]
    pub quarantine_dir: PathBuf,
    #[serde(default = "default_temp_root")]
    pub temp_root: PathBuf,
    #[serde(default = "default_max_upload_bytes")]
    pub max_file_size: u64,
    #[serde(default = "default_mime_types")]
    pub allowed_mime_types: Vec<String>,
    #[serde(default = "default_true")]
    pub enable_malware_scanning: bool,
    #[serde(default)]
    pub enable_clamav: bool,
    #[serde(default = "default_cleanup_hours")]
    pub auto_cleanup_hours: u64,
    #[serde(default = "default_quarantine_days")]
    pub quarantine_retention_days: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_pause_ms")]
    pub batch_pause_ms: u64,
    /// Confidence below this is risky even when above the job threshold.
    #[serde(default = "default_risky_threshold")]
    pub risky_threshold: u8,
    #[serde(default = "default_job_retention_days")]
    pub job_retention_days: i64,
}

fn default_port() -> u16 {
    8080
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}
fn default_zones() -> Vec<String> {
    DEFAULT_DNSBL_ZONES.iter().map(|z| z.to_string()).collect()
}
fn default_dns_timeout_ms() -> u64 {
    5000
}
fn default_day_secs() -> u64 {
    24 * 3600
}
fn default_hour_secs() -> u64 {
    3600
}
fn default_upload_dir() -> PathBuf {
    PathBuf::from("uploads")
}
fn default_quarantine_dir() -> PathBuf {
    PathBuf::from("quarantine")
}
fn default_temp_root() -> PathBuf {
    PathBuf::from("temp")
}
fn default_max_upload_bytes() -> u64 {
    50 * 1024 * 1024
}
fn default_mime_types() -> Vec<String> {
    DEFAULT_ALLOWED_MIME_TYPES
        .iter()
        .map(|m| m.to_string())
        .collect()
}
fn default_true() -> bool {
    true
}
fn default_cleanup_hours() -> u64 {
    24
}
fn default_quarantine_days() -> u64 {
    30
}
fn default_batch_size() -> usize {
    100
}
fn default_batch_pause_ms() -> u64 {
    100
}
fn default_risky_threshold() -> u8 {
    80
}
fn default_job_retention_days() -> i64 {
    30
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            dnsbl_zones: default_zones(),
            dns_timeout_ms: default_dns_timeout_ms(),
            cache_ttl_secs: default_day_secs(),
            error_cache_ttl_secs: default_hour_secs(),
            email_cache_ttl_secs: default_hour_secs(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            upload_dir: default_upload_dir(),
            quarantine_dir: default_quarantine_dir(),
            temp_root: default_temp_root(),
            max_file_size: default_max_upload_bytes(),
            allowed_mime_types: default_mime_types(),
            enable_malware_scanning: true,
            enable_clamav: false,
            auto_cleanup_hours: default_cleanup_hours(),
            quarantine_retention_days: default_quarantine_days(),
        }
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_pause_ms: default_batch_pause_ms(),
            risky_threshold: default_risky_threshold(),
            job_retention_days: default_job_retention_days(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_port: default_port(),
            database_url: None,
            redis_url: None,
            log_dir: default_log_dir(),
            reputation: ReputationConfig::default(),
            upload: UploadConfig::default(),
            import: ImportConfig::default(),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl ServiceConfig {
    pub fn load() -> Result<Self> {
        let config_paths = vec!["/etc/mailguard/mailguard.toml", "./mailguard.toml"];

        for path in config_paths {
            if let Ok(contents) = fs::read_to_string(path) {
                tracing::info!("Loading config from {}", path);
                return Ok(toml::from_str(&contents)?);
            }
        }

        tracing::info!("Loading config from environment");
        Ok(Self::from_env())
    }

    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(port) = env_parse("LISTEN_PORT") {
            cfg.listen_port = port;
        }
        cfg.database_url = env_non_empty("DATABASE_URL");
        cfg.redis_url = env_non_empty("REDIS_URL");
        if let Some(dir) = env_non_empty("LOG_DIR") {
            cfg.log_dir = dir.into();
        }
        if let Some(ms) = env_parse("DNS_TIMEOUT_MS") {
            cfg.reputation.dns_timeout_ms = ms;
        }
        if let Some(dir) = env_non_empty("UPLOAD_DIR") {
            cfg.upload.upload_dir = dir.into();
        }
        if let Some(dir) = env_non_empty("QUARANTINE_DIR") {
            cfg.upload.quarantine_dir = dir.into();
        }
        if let Some(bytes) = env_parse("MAX_UPLOAD_BYTES") {
            cfg.upload.max_file_size = bytes;
        }
        if let Some(flag) = env_parse("ENABLE_MALWARE_SCANNING") {
            cfg.upload.enable_malware_scanning = flag;
        }
        if let Some(flag) = env_parse("ENABLE_CLAMAV") {
            cfg.upload.enable_clamav = flag;
        }
        if let Some(hours) = env_parse("AUTO_CLEANUP_HOURS") {
            cfg.upload.auto_cleanup_hours = hours;
        }
        if let Some(size) = env_parse::<usize>("IMPORT_BATCH_SIZE") {
            cfg.import.batch_size = size.max(1);
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: ServiceConfig = toml::from_str(
            r#"
            listen_port = 9000

            [upload]
            upload_dir = "/var/lib/mailguard/uploads"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.listen_port, 9000);
        assert_eq!(cfg.upload.max_file_size, 50 * 1024 * 1024);
        assert_eq!(cfg.upload.auto_cleanup_hours, 24);
        assert_eq!(cfg.reputation.dnsbl_zones.len(), 8);
        assert_eq!(cfg.reputation.dns_timeout_ms, 5000);
        assert_eq!(cfg.import.batch_size, 100);
        assert!(cfg.database_url.is_none());
    }
}
