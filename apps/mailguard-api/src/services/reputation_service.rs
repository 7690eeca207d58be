use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use mailguard_shared::reputation::{
    DomainReputation, DomainReputationResult, IpReputation, IpReputationResult,
};
use tracing::{debug, error, info, warn};

use crate::cache::Cache;
use crate::config::ReputationConfig;
use crate::dns::{DnsError, DnsLookup};

const SUSPICIOUS_DOMAINS: [&str; 6] = [
    "tempmail.com",
    "guerrillamail.com",
    "mailinator.com",
    "10minutemail.com",
    "yopmail.com",
    "temp-mail.org",
];

/// Dotted quad with every octet in 0..=255.
pub fn is_valid_ip_address(ip: &str) -> bool {
    let parts: Vec<&str> = ip.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|p| {
            !p.is_empty()
                && p.len() <= 3
                && p.bytes().all(|b| b.is_ascii_digit())
                && p.parse::<u16>().is_ok_and(|n| n <= 255)
        })
}

pub fn reverse_ip(ip: &str) -> String {
    ip.split('.').rev().collect::<Vec<_>>().join(".")
}

/// Share of zones reporting a listing, as a rounded percentage.
pub fn listing_confidence(listed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (listed as f64 / total as f64 * 100.0).round();
    pct.min(100.0) as u8
}

#[derive(Debug, Clone, PartialEq)]
enum ZoneOutcome {
    Listed,
    NotListed,
    Failed(String),
}

pub struct ReputationService {
    dns: Arc<dyn DnsLookup>,
    cache: Cache,
    zones: Vec<String>,
    timeout: Duration,
    ttl: Duration,
    error_ttl: Duration,
}

impl ReputationService {
    pub fn new(dns: Arc<dyn DnsLookup>, cache: Cache, config: &ReputationConfig) -> Self {
        Self {
            dns,
            cache,
            zones: config.dnsbl_zones.clone(),
            timeout: Duration::from_millis(config.dns_timeout_ms),
            ttl: Duration::from_secs(config.cache_ttl_secs),
            error_ttl: Duration::from_secs(config.error_cache_ttl_secs),
        }
    }

    pub fn zones(&self) -> &[String] {
        &self.zones
    }

    pub async fn check_ip_reputation(&self, ip: &str) -> IpReputationResult {
        if !is_valid_ip_address(ip) {
            return IpReputationResult::unknown(ip, "Invalid IP address format");
        }
        match self.lookup_ip(ip).await {
            Ok(result) => result,
            Err(e) => {
                error!("IP reputation check failed for {}: {:#}", ip, e);
                IpReputationResult::unknown(ip, format!("IP reputation check failed: {e}"))
            }
        }
    }

    async fn lookup_ip(&self, ip: &str) -> Result<IpReputationResult> {
        let cache_key = format!("ip_reputation_{ip}");
        if let Some(cached) = self.cache.get_json::<IpReputationResult>(&cache_key).await? {
            debug!("IP reputation cache hit for {}", ip);
            return Ok(cached);
        }

        let reversed = reverse_ip(ip);
        let outcomes = join_all(
            self.zones
                .iter()
                .map(|zone| self.query_zone(&reversed, zone)),
        )
        .await;

        let mut listed_on = Vec::new();
        let mut errors = Vec::new();
        for (zone, outcome) in self.zones.iter().zip(outcomes) {
            match outcome {
                ZoneOutcome::Listed => listed_on.push(zone.clone()),
                ZoneOutcome::NotListed => {}
                ZoneOutcome::Failed(msg) => errors.push(msg),
            }
        }

        let listed = listed_on.len();
        let is_listed = listed > 0;
        let result = IpReputationResult {
            ip: ip.to_string(),
            is_listed,
            reputation: if is_listed {
                IpReputation::Listed
            } else {
                IpReputation::Clean
            },
            confidence: listing_confidence(listed, self.zones.len()),
            details: if is_listed {
                format!("IP listed on {listed} blacklists")
            } else {
                "IP not listed on any major blacklists".to_string()
            },
            listed_on: Some(listed_on),
            errors: (!errors.is_empty()).then_some(errors),
        };

        let ttl = if result.errors.is_some() {
            self.error_ttl
        } else {
            self.ttl
        };
        self.cache.set_json(&cache_key, &result, ttl).await?;

        if is_listed {
            warn!("IP {} listed on {} DNSBL zones", ip, listed);
        } else {
            info!("IP {} not listed on any DNSBL zone", ip);
        }
        Ok(result)
    }

    async fn query_zone(&self, reversed: &str, zone: &str) -> ZoneOutcome {
        let query = format!("{reversed}.{zone}");
        let cache_key = format!("dnsbl_{query}");

        match self.cache.get_json::<bool>(&cache_key).await {
            Ok(Some(true)) => return ZoneOutcome::Listed,
            Ok(Some(false)) => return ZoneOutcome::NotListed,
            Ok(None) => {}
            Err(e) => debug!("DNSBL cache read failed for {}: {:#}", query, e),
        }

        let (outcome, cache_for) =
            match tokio::time::timeout(self.timeout, self.dns.ipv4_lookup(&query)).await {
                Ok(Ok(addrs)) if !addrs.is_empty() => (ZoneOutcome::Listed, Some((true, self.ttl))),
                Ok(Ok(_)) | Ok(Err(DnsError::NoRecords)) => {
                    (ZoneOutcome::NotListed, Some((false, self.ttl)))
                }
                Ok(Err(DnsError::Other(e))) => {
                    debug!("DNSBL query {} failed: {}", query, e);
                    (
                        ZoneOutcome::Failed(format!("{zone}: {e}")),
                        Some((false, self.error_ttl)),
                    )
                }
                Err(_) => {
                    warn!("DNSBL query {} timed out", query);
                    (ZoneOutcome::Failed(format!("{zone}: DNS query timeout")), None)
                }
            };

        if let Some((listed, ttl)) = cache_for {
            if let Err(e) = self.cache.set_json(&cache_key, &listed, ttl).await {
                debug!("DNSBL cache write failed for {}: {:#}", query, e);
            }
        }
        outcome
    }

    pub async fn check_domain_reputation(&self, domain: &str) -> DomainReputationResult {
        match self.lookup_domain(domain).await {
            Ok(result) => result,
            Err(e) => {
                error!("Domain reputation check failed for {}: {:#}", domain, e);
                DomainReputationResult {
                    domain: domain.to_string(),
                    is_suspicious: false,
                    reputation: DomainReputation::Unknown,
                    confidence: 0,
                    details: format!("Domain reputation check failed: {e}"),
                }
            }
        }
    }

    async fn lookup_domain(&self, domain: &str) -> Result<DomainReputationResult> {
        let domain = domain.trim().to_lowercase();
        let cache_key = format!("domain_reputation_{domain}");
        if let Some(cached) = self
            .cache
            .get_json::<DomainReputationResult>(&cache_key)
            .await?
        {
            return Ok(cached);
        }

        let is_suspicious = SUSPICIOUS_DOMAINS.iter().any(|s| domain.contains(s));
        let result = if is_suspicious {
            DomainReputationResult {
                domain: domain.clone(),
                is_suspicious,
                reputation: DomainReputation::Poor,
                confidence: 90,
                details: "Domain associated with temporary email services".to_string(),
            }
        } else {
            DomainReputationResult {
                domain: domain.clone(),
                is_suspicious,
                reputation: DomainReputation::Good,
                confidence: 80,
                details: "Domain appears legitimate".to_string(),
            }
        };

        self.cache.set_json(&cache_key, &result, self.ttl).await?;
        Ok(result)
    }
}
