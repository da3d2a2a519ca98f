use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use thiserror::Error;
use tracing::{debug, trace};

/// Outcome of a failed DNS query.
///
/// `NxDomain` and `NoRecords` are soft misses: the name (or the record type)
/// simply is not there. Every other variant is a hard failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DnsError {
    #[error("NXDOMAIN: domain does not exist")]
    NxDomain,
    #[error("no records of the requested type")]
    NoRecords,
    #[error("SERVFAIL: server failure")]
    ServFail,
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("DNS error: {0}")]
    Other(String),
}

impl DnsError {
    /// True for NXDOMAIN / NODATA. Timeouts are never a miss.
    pub fn is_miss(&self) -> bool {
        matches!(self, DnsError::NxDomain | DnsError::NoRecords)
    }
}

/// TXT resolution abstraction. Implementations flatten multi-segment TXT
/// records into one string per record.
pub trait DnsResolver: Clone + Send + Sync + 'static {
    fn query_txt(&self, name: &str) -> impl Future<Output = Result<Vec<String>, DnsError>> + Send;
}

/// Hickory DNS resolver implementation
#[derive(Clone)]
pub struct HickoryResolver {
    resolver: TokioResolver,
    timeout: Duration,
}

impl HickoryResolver {
    /// Resolver using hickory's default upstreams.
    pub fn new(timeout: Duration, attempts: usize) -> Self {
        let resolver = TokioResolver::builder_with_config(
            ResolverConfig::default(),
            TokioConnectionProvider::default(),
        )
        .with_options(Self::options(timeout, attempts))
        .build();
        Self { resolver, timeout }
    }

    /// Resolver configured from the host's system configuration (resolv.conf).
    pub fn from_system_conf(timeout: Duration, attempts: usize) -> Result<Self, DnsError> {
        let resolver = TokioResolver::builder_tokio()
            .map_err(|e| DnsError::Other(e.to_string()))?
            .with_options(Self::options(timeout, attempts))
            .build();
        Ok(Self { resolver, timeout })
    }

    fn options(timeout: Duration, attempts: usize) -> ResolverOpts {
        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;
        opts.attempts = attempts;
        opts
    }

    fn classify_error(&self, e: &hickory_resolver::ResolveError) -> DnsError {
        let msg = e.to_string().to_lowercase();
        if msg.contains("nxdomain") || msg.contains("no such domain") {
            DnsError::NxDomain
        } else if msg.contains("no records") || msg.contains("no record found") {
            DnsError::NoRecords
        } else if msg.contains("timed out") || msg.contains("timeout") {
            DnsError::Timeout(self.timeout)
        } else if msg.contains("servfail") {
            DnsError::ServFail
        } else {
            DnsError::Other(e.to_string())
        }
    }
}

impl DnsResolver for HickoryResolver {
    async fn query_txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        trace!(name, "TXT query");
        // Outer bound on top of the resolver's own per-attempt timeout.
        let lookup = tokio::time::timeout(self.timeout * 2, self.resolver.txt_lookup(name))
            .await
            .map_err(|_| DnsError::Timeout(self.timeout * 2))?;

        match lookup {
            Ok(lookup) => {
                let records: Vec<String> = lookup
                    .iter()
                    .map(|txt| {
                        txt.txt_data()
                            .iter()
                            .map(|segment| String::from_utf8_lossy(segment))
                            .collect::<String>()
                    })
                    .collect();
                Ok(records)
            }
            Err(e) => {
                let err = self.classify_error(&e);
                debug!(name, error = %err, "TXT query failed");
                Err(err)
            }
        }
    }
}

/// Scripted resolver for tests.
///
/// Unknown names answer with an empty record set. Every query is logged so
/// tests can assert that no lookup happened.
#[derive(Clone, Default)]
pub struct MockResolver {
    txt_records: Arc<Mutex<HashMap<String, Vec<String>>>>,
    failures: Arc<Mutex<HashMap<String, DnsError>>>,
    queries: Arc<Mutex<Vec<String>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_txt(&self, name: &str, records: Vec<String>) {
        lock(&self.txt_records).insert(name.to_lowercase(), records);
    }

    pub fn add_txt_err(&self, name: &str, err: DnsError) {
        lock(&self.failures).insert(name.to_lowercase(), err);
    }

    pub fn set_nxdomain(&self, name: &str) {
        self.add_txt_err(name, DnsError::NxDomain);
    }

    pub fn set_timeout(&self, name: &str) {
        self.add_txt_err(name, DnsError::Timeout(Duration::from_secs(5)));
    }

    /// Names queried so far, in order.
    pub fn queries(&self) -> Vec<String> {
        lock(&self.queries).clone()
    }

    pub fn query_count(&self) -> usize {
        lock(&self.queries).len()
    }
}

impl DnsResolver for MockResolver {
    async fn query_txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        let name = name.to_lowercase();
        lock(&self.queries).push(name.clone());
        if let Some(err) = lock(&self.failures).get(&name) {
            return Err(err.clone());
        }
        Ok(lock(&self.txt_records).get(&name).cloned().unwrap_or_default())
    }
}
