//! Domain ownership verification and cached record refresh.
//!
//! A domain starts unverified with a one-time token. The owner publishes the
//! token as a TXT record at `_dmarc-verify.<domain>`; once it is seen the
//! domain is verified for good.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::common::dns::{DnsError, DnsResolver};
use crate::error::{EngineError, Result};
use crate::record::{fetch_txt, RecordKind};
use crate::OrgId;

pub const TOKEN_PREFIX: &str = "dmarc-verify=";
pub const VERIFY_LABEL: &str = "_dmarc-verify";
const TOKEN_BYTES: usize = 16;

/// `dmarc-verify=` followed by 32 random hex characters.
pub fn generate_verification_token() -> String {
    let bytes: [u8; TOKEN_BYTES] = rand::random();
    format!("{TOKEN_PREFIX}{}", hex::encode(bytes))
}

pub fn verification_host(domain: &str) -> String {
    format!("{VERIFY_LABEL}.{domain}")
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("{domain} is already verified")]
    AlreadyVerified { domain: String },

    #[error("{domain} has no verification token on record")]
    MissingToken { domain: String },

    #[error("{}", mismatch_message(.domain, .expected, .found))]
    Mismatch {
        domain: String,
        expected: String,
        found: Vec<String>,
    },

    #[error("DNS lookup for {host} failed: {source}")]
    Dns {
        host: String,
        #[source]
        source: DnsError,
    },
}

fn mismatch_message(domain: &str, expected: &str, found: &[String]) -> String {
    let found = if found.is_empty() {
        "no records".to_string()
    } else {
        found
            .iter()
            .map(|r| format!("\"{r}\""))
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!(
        "Verification failed: expected TXT record \"{expected}\" at {}, found: {found}",
        verification_host(domain)
    )
}

/// A domain under monitoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainRecord {
    pub id: Uuid,
    pub organization_id: OrgId,
    pub domain: String,
    verification_token: Option<String>,
    verified_at: Option<DateTime<Utc>>,
    verified_by: Option<String>,
    pub spf_record: Option<String>,
    pub dmarc_record: Option<String>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DomainRecord {
    /// New unverified record. `domain` is expected to be validated already.
    pub fn new(organization_id: OrgId, domain: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id,
            domain: domain.into(),
            verification_token: Some(generate_verification_token()),
            verified_at: None,
            verified_by: None,
            spf_record: None,
            dmarc_record: None,
            last_checked_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn verification_token(&self) -> Option<&str> {
        self.verification_token.as_deref()
    }

    pub fn verified_at(&self) -> Option<DateTime<Utc>> {
        self.verified_at
    }

    pub fn verified_by(&self) -> Option<&str> {
        self.verified_by.as_deref()
    }

    pub fn is_verified(&self) -> bool {
        self.verified_at.is_some()
    }

    /// Take over `stored`'s verification if it has one. Verification is
    /// never undone by writing an older copy of the record.
    pub(crate) fn keep_verification_of(&mut self, stored: &DomainRecord) {
        if stored.is_verified() {
            self.verified_at = stored.verified_at;
            self.verified_by = stored.verified_by.clone();
        }
    }

    #[cfg(test)]
    pub(crate) fn without_token(mut self) -> Self {
        self.verification_token = None;
        self
    }
}

/// Runs the `unverified -> verified` transition.
pub struct DomainVerifier<'a, R: DnsResolver> {
    resolver: &'a R,
}

impl<'a, R: DnsResolver> DomainVerifier<'a, R> {
    pub fn new(resolver: &'a R) -> Self {
        Self { resolver }
    }

    /// Check the published token and mark `record` verified by `actor`.
    ///
    /// Preconditions (already verified, no token) fail without touching DNS.
    /// After a successful check the current DMARC record is cached; a failure
    /// of that second lookup is logged and otherwise ignored.
    pub async fn verify(
        &self,
        record: &mut DomainRecord,
        actor: &str,
    ) -> std::result::Result<(), VerifyError> {
        if record.is_verified() {
            return Err(VerifyError::AlreadyVerified {
                domain: record.domain.clone(),
            });
        }
        let expected = record
            .verification_token
            .clone()
            .ok_or_else(|| VerifyError::MissingToken {
                domain: record.domain.clone(),
            })?;

        let host = verification_host(&record.domain);
        let found = match self.resolver.query_txt(&host).await {
            Ok(records) => records,
            Err(e) if e.is_miss() => Vec::new(),
            Err(source) => return Err(VerifyError::Dns { host, source }),
        };

        if !found.iter().any(|r| r.trim() == expected) {
            info!(domain = %record.domain, found = found.len(), "domain verification failed");
            return Err(VerifyError::Mismatch {
                domain: record.domain.clone(),
                expected,
                found,
            });
        }

        let now = Utc::now();
        record.verified_at = Some(now);
        record.verified_by = Some(actor.to_string());
        info!(domain = %record.domain, actor, "domain verified");

        let dmarc_host = format!("_dmarc.{}", record.domain);
        match fetch_txt(self.resolver, &dmarc_host, RecordKind::Dmarc).await {
            Ok(lookup) => {
                record.dmarc_record = lookup.matched;
                record.last_checked_at = Some(now);
            }
            Err(e) => {
                warn!(domain = %record.domain, error = %e, "DMARC snapshot after verification failed");
            }
        }
        Ok(())
    }
}

/// Re-fetch SPF and DMARC for `record` and update the cached values.
///
/// Each record type is updated independently; the first hard failure is
/// returned after the other one has been applied.
pub async fn refresh_records<R: DnsResolver>(
    resolver: &R,
    record: &mut DomainRecord,
) -> Result<()> {
    let dmarc_host = format!("_dmarc.{}", record.domain);
    let (spf, dmarc) = tokio::join!(
        fetch_txt(resolver, &record.domain, RecordKind::Spf),
        fetch_txt(resolver, &dmarc_host, RecordKind::Dmarc),
    );

    let mut failure = None;
    match spf {
        Ok(lookup) => record.spf_record = lookup.matched,
        Err(e) => failure = Some((record.domain.clone(), e)),
    }
    match dmarc {
        Ok(lookup) => record.dmarc_record = lookup.matched,
        Err(e) => failure = failure.or(Some((dmarc_host, e))),
    }
    record.last_checked_at = Some(Utc::now());

    match failure {
        Some((host, source)) => {
            warn!(domain = %record.domain, host = %host, error = %source, "DNS refresh incomplete");
            Err(EngineError::dns(host, source))
        }
        None => Ok(()),
    }
}
