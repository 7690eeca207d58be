use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::Result;
use mailguard_shared::reputation::{
    CheckOutcome, DomainReputation, DomainReputationCheck, EmailChecks, EmailStatus,
    EmailValidationResult, IpReputation, SenderRating, SenderReputationCheck, TypoCheck,
};
use regex::Regex;
use tracing::{debug, error};

use crate::cache::Cache;
use crate::dns::{DnsError, DnsLookup, MxRecord};
use crate::services::reputation_service::ReputationService;

const MAX_EMAIL_LEN: usize = 254;
const DAY: Duration = Duration::from_secs(24 * 3600);
const HOUR: Duration = Duration::from_secs(3600);

const DISPOSABLE_DOMAINS: [&str; 8] = [
    "mailinator.com",
    "guerrillamail.com",
    "tempmail.com",
    "throwawaymail.com",
    "10minutemail.com",
    "yopmail.com",
    "temp-mail.org",
    "maildrop.cc",
];

const ROLE_ACCOUNTS: [&str; 11] = [
    "admin",
    "info",
    "support",
    "sales",
    "contact",
    "help",
    "service",
    "webmaster",
    "postmaster",
    "hostmaster",
    "abuse",
];

const COMMON_TYPOS: [(&str, &str); 8] = [
    ("gmial.com", "gmail.com"),
    ("gamil.com", "gmail.com"),
    ("gmal.com", "gmail.com"),
    ("hotmial.com", "hotmail.com"),
    ("hotmal.com", "hotmail.com"),
    ("yaho.com", "yahoo.com"),
    ("outloo.com", "outlook.com"),
    ("iclou.com", "icloud.com"),
];

fn compile(name: &str, pattern: &str) -> Option<Regex> {
    Regex::new(pattern)
        .map_err(|e| error!("Invalid {} pattern: {}", name, e))
        .ok()
}

static ADDRESS_SYNTAX: LazyLock<Option<Regex>> = LazyLock::new(|| {
    compile(
        "address",
        r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$",
    )
});

static BASIC_SHAPE: LazyLock<Option<Regex>> =
    LazyLock::new(|| compile("basic address", r"^[^\s@]+@[^\s@]+\.[^\s@]+$"));

/// RFC 5322 style address check: permissive local part, LDH domain labels.
pub fn is_valid_syntax(email: &str) -> bool {
    email.len() <= MAX_EMAIL_LEN && ADDRESS_SYNTAX.as_ref().is_some_and(|re| re.is_match(email))
}

/// Loose `x@y.z` shape used to pre-filter import rows.
pub fn is_basic_email_shape(email: &str) -> bool {
    BASIC_SHAPE.as_ref().is_some_and(|re| re.is_match(email))
}

pub fn typo_suggestion(domain: &str) -> Option<&'static str> {
    let lower = domain.to_lowercase();
    COMMON_TYPOS
        .iter()
        .find(|(typo, _)| *typo == lower)
        .map(|(_, fix)| *fix)
}

pub fn is_disposable_domain(domain: &str) -> bool {
    DISPOSABLE_DOMAINS.contains(&domain.to_lowercase().as_str())
}

pub fn is_role_account(local: &str) -> bool {
    ROLE_ACCOUNTS.contains(&local.to_lowercase().as_str())
}

pub fn calculate_confidence(checks: &EmailChecks) -> u8 {
    let mut score: i32 = 100;
    if !checks.syntax.is_valid {
        score -= 100;
    }
    if !checks.domain.is_valid {
        score -= 50;
    }
    if !checks.mx.is_valid {
        score -= 40;
    }
    if checks.disposable.as_ref().is_some_and(|c| !c.is_valid) {
        score -= 30;
    }
    if checks.role_account.as_ref().is_some_and(|c| !c.is_valid) {
        score -= 20;
    }
    if checks.typo.as_ref().is_some_and(|c| !c.is_valid) {
        score -= 25;
    }
    if let Some(ip) = &checks.ip_reputation {
        match ip.reputation {
            SenderRating::Poor => score -= 40,
            SenderRating::Neutral => score -= 20,
            _ => {}
        }
    }
    if let Some(dr) = &checks.domain_reputation {
        if dr.reputation == DomainReputation::Poor {
            score -= 35;
        } else if dr.is_suspicious {
            score -= 20;
        }
    }
    score.clamp(0, 100) as u8
}

pub fn status_for_confidence(confidence: u8) -> EmailStatus {
    if confidence < 30 {
        EmailStatus::Invalid
    } else if confidence < 70 {
        EmailStatus::Risky
    } else {
        EmailStatus::Valid
    }
}

/// First failing signal, as stored on subscribers.
pub fn mailer_check(result: &EmailValidationResult) -> &'static str {
    let Some(checks) = &result.checks else {
        return "unknown";
    };
    let failed = |c: &Option<CheckOutcome>| c.as_ref().is_some_and(|c| !c.is_valid);
    if !checks.syntax.is_valid {
        "invalid_syntax"
    } else if !checks.domain.is_valid {
        "domain_not_found"
    } else if !checks.mx.is_valid {
        "no_mx_record"
    } else if failed(&checks.disposable) {
        "disposable"
    } else if failed(&checks.role_account) {
        "role_account"
    } else if checks.typo.as_ref().is_some_and(|t| !t.is_valid) {
        "typo_detected"
    } else if checks
        .ip_reputation
        .as_ref()
        .is_some_and(|r| r.reputation == SenderRating::Poor)
        || checks
            .domain_reputation
            .as_ref()
            .is_some_and(|r| r.reputation == DomainReputation::Poor)
    {
        "poor_reputation"
    } else if result.status == EmailStatus::Valid {
        "valid"
    } else {
        "risky"
    }
}

pub struct EmailValidationService {
    dns: Arc<dyn DnsLookup>,
    cache: Cache,
    reputation: Arc<ReputationService>,
    result_ttl: Duration,
}

impl EmailValidationService {
    pub fn new(
        dns: Arc<dyn DnsLookup>,
        cache: Cache,
        reputation: Arc<ReputationService>,
        result_ttl: Duration,
    ) -> Self {
        Self {
            dns,
            cache,
            reputation,
            result_ttl,
        }
    }

    pub async fn validate_email(&self, email: &str, sender_ip: Option<&str>) -> EmailValidationResult {
        match self.run_checks(email, sender_ip).await {
            Ok(result) => result,
            Err(e) => {
                error!("Email validation failed for {}: {:#}", email, e);
                EmailValidationResult {
                    email: email.to_string(),
                    is_valid: false,
                    status: EmailStatus::Unknown,
                    confidence: 0,
                    checks: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn run_checks(&self, email: &str, sender_ip: Option<&str>) -> Result<EmailValidationResult> {
        let cache_key = match sender_ip {
            Some(ip) => format!("email_validation_{email}_{ip}"),
            None => format!("email_validation_{email}"),
        };
        if let Some(cached) = self
            .cache
            .get_json::<EmailValidationResult>(&cache_key)
            .await?
        {
            debug!("Email validation cache hit for {}", email);
            return Ok(cached);
        }

        let result = self.evaluate(email, sender_ip).await?;
        self.cache
            .set_json(&cache_key, &result, self.result_ttl)
            .await?;
        Ok(result)
    }

    async fn evaluate(&self, email: &str, sender_ip: Option<&str>) -> Result<EmailValidationResult> {
        let rejected = |checks: EmailChecks, confidence: u8| EmailValidationResult {
            email: email.to_string(),
            is_valid: false,
            status: EmailStatus::Invalid,
            confidence,
            checks: Some(checks),
            error: None,
        };

        if !is_valid_syntax(email) {
            return Ok(rejected(
                EmailChecks {
                    syntax: CheckOutcome::fail("Invalid email format"),
                    domain: CheckOutcome::fail("Syntax validation failed"),
                    mx: CheckOutcome::fail("Syntax validation failed"),
                    disposable: None,
                    role_account: None,
                    typo: None,
                    ip_reputation: None,
                    domain_reputation: None,
                },
                0,
            ));
        }
        let syntax = CheckOutcome::pass("Valid email format");
        let Some((local, domain)) = email.split_once('@') else {
            anyhow::bail!("address without domain passed syntax check");
        };

        let domain_check = self.check_domain(domain).await?;
        if !domain_check.is_valid {
            return Ok(rejected(
                EmailChecks {
                    syntax,
                    domain: domain_check,
                    mx: CheckOutcome::fail("Domain validation failed"),
                    disposable: None,
                    role_account: None,
                    typo: None,
                    ip_reputation: None,
                    domain_reputation: None,
                },
                20,
            ));
        }

        let mx_check = self.check_mx(domain).await?;
        if !mx_check.is_valid {
            return Ok(rejected(
                EmailChecks {
                    syntax,
                    domain: domain_check,
                    mx: mx_check,
                    disposable: None,
                    role_account: None,
                    typo: None,
                    ip_reputation: None,
                    domain_reputation: None,
                },
                30,
            ));
        }

        let disposable = if is_disposable_domain(domain) {
            CheckOutcome::fail("Disposable email domain detected")
        } else {
            CheckOutcome::pass("Not a disposable domain")
        };
        let role_account = if is_role_account(local) {
            CheckOutcome::fail("Role-based email address detected")
        } else {
            CheckOutcome::pass("Not a role-based address")
        };
        let typo = match typo_suggestion(domain) {
            Some(fix) => TypoCheck {
                is_valid: false,
                details: "Common typo detected".to_string(),
                suggestion: Some(fix.to_string()),
            },
            None => TypoCheck {
                is_valid: true,
                details: "No common typos detected".to_string(),
                suggestion: None,
            },
        };

        let ip_reputation = match sender_ip {
            Some(ip) => {
                let r = self.reputation.check_ip_reputation(ip).await;
                Some(SenderReputationCheck {
                    is_valid: r.reputation != IpReputation::Listed,
                    details: r.details,
                    reputation: r.reputation.into(),
                    confidence: r.confidence,
                })
            }
            None => None,
        };

        let dr = self.reputation.check_domain_reputation(domain).await;
        let domain_reputation = DomainReputationCheck {
            is_valid: dr.reputation != DomainReputation::Poor,
            details: dr.details,
            reputation: dr.reputation,
            is_suspicious: dr.is_suspicious,
            confidence: dr.confidence,
        };

        let checks = EmailChecks {
            syntax,
            domain: domain_check,
            mx: mx_check,
            disposable: Some(disposable),
            role_account: Some(role_account),
            typo: Some(typo),
            ip_reputation,
            domain_reputation: Some(domain_reputation),
        };
        let confidence = calculate_confidence(&checks);
        let status = status_for_confidence(confidence);

        Ok(EmailValidationResult {
            email: email.to_string(),
            is_valid: status != EmailStatus::Invalid,
            status,
            confidence,
            checks: Some(checks),
            error: None,
        })
    }

    async fn check_domain(&self, domain: &str) -> Result<CheckOutcome> {
        let cache_key = format!("domain_check_{domain}");
        if let Some(exists) = self.cache.get_json::<bool>(&cache_key).await? {
            return Ok(if exists {
                CheckOutcome::pass("Domain exists")
            } else {
                CheckOutcome::fail("Domain does not exist")
            });
        }

        let outcome = match self.dns.host_exists(domain).await {
            Ok(true) => CheckOutcome::pass("Domain exists"),
            Ok(false) => CheckOutcome::fail("Domain lookup failed: no address records"),
            Err(e) => CheckOutcome::fail(format!("Domain lookup failed: {e}")),
        };
        let ttl = if outcome.is_valid { DAY } else { HOUR };
        self.cache.set_json(&cache_key, &outcome.is_valid, ttl).await?;
        Ok(outcome)
    }

    async fn check_mx(&self, domain: &str) -> Result<CheckOutcome> {
        let describe = |records: &[MxRecord]| {
            if records.is_empty() {
                CheckOutcome::fail("No MX records found")
            } else {
                CheckOutcome::pass(format!("Found {} MX records", records.len()))
            }
        };

        let cache_key = format!("mx_check_{domain}");
        if let Some(records) = self.cache.get_json::<Vec<MxRecord>>(&cache_key).await? {
            return Ok(describe(&records));
        }

        match self.dns.mx_lookup(domain).await {
            Ok(mut records) => {
                records.sort_by_key(|r| r.priority);
                self.cache.set_json(&cache_key, &records, DAY).await?;
                Ok(describe(&records))
            }
            Err(DnsError::NoRecords) => Ok(CheckOutcome::fail("No MX records found")),
            Err(e) => Ok(CheckOutcome::fail(format!("MX record lookup failed: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReputationConfig;
    use crate::dns::testing::{FakeAnswer, FakeDns};

    fn service(dns: Arc<FakeDns>) -> EmailValidationService {
        let cache = Cache::memory();
        let reputation = Arc::new(ReputationService::new(
            dns.clone(),
            cache.clone(),
            &ReputationConfig::default(),
        ));
        EmailValidationService::new(dns, cache, reputation, HOUR)
    }

    #[test]
    fn syntax_rules() {
        assert!(is_valid_syntax("john.doe+tag@example.com"));
        assert!(is_valid_syntax("a@localhost"));
        assert!(!is_valid_syntax("no-at-sign.example.com"));
        assert!(!is_valid_syntax("two@@example.com"));
        assert!(!is_valid_syntax("space in@example.com"));
        assert!(!is_valid_syntax("a@-bad.com"));
        assert!(!is_valid_syntax("a@bad-.com"));
        assert!(!is_valid_syntax("a@example..com"));
        let long = format!("{}@example.com", "a".repeat(250));
        assert!(!is_valid_syntax(&long));
        assert!(!is_valid_syntax("a@example.com\nb@example.com"));
        assert!(!is_valid_syntax("a@exa_mple.com"));
    }

    #[test]
    fn basic_shape_rules() {
        assert!(is_basic_email_shape("a@b.co"));
        assert!(!is_basic_email_shape("a@b"));
        assert!(!is_basic_email_shape("a b@c.de"));
        assert!(!is_basic_email_shape("@c.de"));
        assert!(!is_basic_email_shape("a@.de"));
    }

    #[test]
    fn typo_lookup_is_case_insensitive() {
        assert_eq!(typo_suggestion("GMIAL.com"), Some("gmail.com"));
        assert_eq!(typo_suggestion("gmail.com"), None);
    }

    #[test]
    fn status_thresholds() {
        assert_eq!(status_for_confidence(29), EmailStatus::Invalid);
        assert_eq!(status_for_confidence(30), EmailStatus::Risky);
        assert_eq!(status_for_confidence(69), EmailStatus::Risky);
        assert_eq!(status_for_confidence(70), EmailStatus::Valid);
    }

    #[tokio::test]
    async fn bad_syntax_is_invalid_with_zero_confidence() {
        let dns = Arc::new(FakeDns::new());
        let svc = service(dns.clone());
        let r = svc.validate_email("not-an-email", None).await;
        assert_eq!(r.status, EmailStatus::Invalid);
        assert_eq!(r.confidence, 0);
        assert_eq!(mailer_check(&r), "invalid_syntax");
        assert_eq!(dns.call_count(), 0);
    }

    #[tokio::test]
    async fn missing_domain_and_mx_short_circuit() {
        let dns = Arc::new(FakeDns::new());
        dns.host_only("nomx.example");
        let svc = service(dns);

        let r = svc.validate_email("a@ghost.example", None).await;
        assert_eq!((r.status, r.confidence), (EmailStatus::Invalid, 20));
        assert_eq!(mailer_check(&r), "domain_not_found");

        let r = svc.validate_email("a@nomx.example", None).await;
        assert_eq!((r.status, r.confidence), (EmailStatus::Invalid, 30));
        assert_eq!(mailer_check(&r), "no_mx_record");
    }

    #[tokio::test]
    async fn clean_address_is_valid() {
        let dns = Arc::new(FakeDns::new());
        dns.mail_domain("example.com");
        let svc = service(dns);
        let r = svc.validate_email("jane@example.com", None).await;
        assert_eq!(r.status, EmailStatus::Valid);
        assert_eq!(r.confidence, 100);
        assert!(r.is_valid);
        assert_eq!(mailer_check(&r), "valid");
    }

    #[tokio::test]
    async fn penalties_accumulate() {
        let dns = Arc::new(FakeDns::new());
        dns.mail_domain("gmial.com");
        dns.mail_domain("mailinator.com");
        let svc = service(dns);

        // role -20, typo -25
        let r = svc.validate_email("admin@gmial.com", None).await;
        assert_eq!(r.confidence, 55);
        assert_eq!(r.status, EmailStatus::Risky);
        assert_eq!(r.suggestion(), Some("gmail.com"));
        assert_eq!(mailer_check(&r), "role_account");

        // disposable -30, poor domain reputation -35
        let r = svc.validate_email("bob@mailinator.com", None).await;
        assert_eq!(r.confidence, 35);
        assert_eq!(mailer_check(&r), "disposable");
    }

    #[tokio::test]
    async fn listed_sender_ip_lowers_confidence() {
        let dns = Arc::new(FakeDns::new());
        dns.mail_domain("example.com");
        dns.answer("9.9.9.9.zen.spamhaus.org", FakeAnswer::Listed);
        let svc = service(dns);
        let r = svc
            .validate_email("jane@example.com", Some("9.9.9.9"))
            .await;
        assert_eq!(r.confidence, 60);
        assert_eq!(r.status, EmailStatus::Risky);
        assert_eq!(mailer_check(&r), "poor_reputation");
    }

    #[tokio::test]
    async fn results_are_cached() {
        let dns = Arc::new(FakeDns::new());
        dns.mail_domain("example.com");
        let svc = service(dns.clone());
        svc.validate_email("jane@example.com", None).await;
        let calls = dns.call_count();
        svc.validate_email("jane@example.com", None).await;
        assert_eq!(dns.call_count(), calls);
    }
}
