use std::net::Ipv4Addr;

use async_trait::async_trait;
use hickory_resolver::{Resolver, TokioResolver};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DnsError {
    /// NXDOMAIN or NODATA.
    #[error("no records found")]
    NoRecords,
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MxRecord {
    pub exchange: String,
    pub priority: u16,
}

#[async_trait]
pub trait DnsLookup: Send + Sync {
    async fn ipv4_lookup(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError>;
    async fn host_exists(&self, domain: &str) -> Result<bool, DnsError>;
    async fn mx_lookup(&self, domain: &str) -> Result<Vec<MxRecord>, DnsError>;
}

pub struct HickoryDns {
    resolver: TokioResolver,
}

impl HickoryDns {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            resolver: Resolver::builder_tokio()?.build(),
        })
    }
}

fn map_err(e: hickory_resolver::ResolveError) -> DnsError {
    match e.is_no_records_found() {
        true => DnsError::NoRecords,
        false => DnsError::Other(e.to_string()),
    }
}

#[async_trait]
impl DnsLookup for HickoryDns {
    async fn ipv4_lookup(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
        let lookup = self.resolver.ipv4_lookup(name).await.map_err(map_err)?;
        Ok(lookup.iter().map(|a| a.0).collect())
    }

    async fn host_exists(&self, domain: &str) -> Result<bool, DnsError> {
        match self.resolver.lookup_ip(domain).await {
            Ok(lookup) => Ok(lookup.iter().next().is_some()),
            Err(e) => match map_err(e) {
                DnsError::NoRecords => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn mx_lookup(&self, domain: &str) -> Result<Vec<MxRecord>, DnsError> {
        let lookup = self.resolver.mx_lookup(domain).await.map_err(map_err)?;
        let mut records: Vec<MxRecord> = lookup
            .iter()
            .map(|mx| MxRecord {
                exchange: mx.exchange().to_utf8().trim_end_matches('.').to_string(),
                priority: mx.preference(),
            })
            .collect();
        records.sort_by_key(|r| r.priority);
        Ok(records)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Clone)]
    pub enum FakeAnswer {
        Listed,
        Error(String),
        Hang,
    }

    /// Scriptable resolver. Anything not scripted resolves as "no records".
    #[derive(Default)]
    pub struct FakeDns {
        pub a_answers: Mutex<HashMap<String, FakeAnswer>>,
        pub hosts: Mutex<HashMap<String, bool>>,
        pub mx: Mutex<HashMap<String, Vec<MxRecord>>>,
        pub calls: AtomicUsize,
    }

    impl FakeDns {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn answer(&self, name: &str, answer: FakeAnswer) {
            self.a_answers
                .lock()
                .unwrap()
                .insert(name.to_string(), answer);
        }

        /// Domain resolves and has a single MX.
        pub fn mail_domain(&self, domain: &str) {
            self.hosts.lock().unwrap().insert(domain.to_string(), true);
            self.mx.lock().unwrap().insert(
                domain.to_string(),
                vec![MxRecord {
                    exchange: format!("mx.{domain}"),
                    priority: 10,
                }],
            );
        }

        pub fn host_only(&self, domain: &str) {
            self.hosts.lock().unwrap().insert(domain.to_string(), true);
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DnsLookup for FakeDns {
        async fn ipv4_lookup(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let answer = self.a_answers.lock().unwrap().get(name).cloned();
            match answer {
                Some(FakeAnswer::Listed) => Ok(vec![Ipv4Addr::new(127, 0, 0, 2)]),
                Some(FakeAnswer::Error(msg)) => Err(DnsError::Other(msg)),
                Some(FakeAnswer::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(DnsError::NoRecords)
                }
                None => Err(DnsError::NoRecords),
            }
        }

        async fn host_exists(&self, domain: &str) -> Result<bool, DnsError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .hosts
                .lock()
                .unwrap()
                .get(domain)
                .copied()
                .unwrap_or(false))
        }

        async fn mx_lookup(&self, domain: &str) -> Result<Vec<MxRecord>, DnsError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.mx.lock().unwrap().get(domain) {
                Some(records) => Ok(records.clone()),
                None => Err(DnsError::NoRecords),
            }
        }
    }
}
