//! Domain DNS status: SPF, DMARC and DKIM gathered in one pass.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::common::dns::{DnsError, DnsResolver};
use crate::common::domain::validate_domain;
use crate::config::EngineConfig;
use crate::dkim::{candidate_selectors, probe_selectors, DkimStatus};
use crate::error::{EngineError, Result};
use crate::record::{fetch_txt, RecordKind, TxtLookup};

/// State of one TXT-published record.
///
/// `error` carries a hard DNS failure; a plain miss is `valid: false` with
/// no error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordStatus {
    pub valid: bool,
    pub record: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RecordStatus {
    fn from_lookup(host: &str, lookup: std::result::Result<TxtLookup, DnsError>) -> Self {
        match lookup {
            Ok(lookup) => Self {
                valid: lookup.found,
                record: lookup.matched,
                error: None,
            },
            Err(e) => {
                warn!(host, error = %e, "status lookup failed");
                Self {
                    valid: false,
                    record: None,
                    error: Some(EngineError::dns(host, e).to_string()),
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainStatus {
    pub domain: String,
    pub spf: RecordStatus,
    pub dkim: DkimStatus,
    pub dmarc: RecordStatus,
}

/// Look up SPF, DMARC and the DKIM selector batch concurrently.
///
/// The call returns once every branch has finished. Only an invalid domain
/// fails the call; per-branch DNS failures are reported inside the result.
pub async fn domain_status<R: DnsResolver>(
    resolver: &R,
    domain: &str,
    config: &EngineConfig,
) -> Result<DomainStatus> {
    let domain =
        validate_domain(domain).ok_or_else(|| EngineError::InvalidDomain(domain.to_string()))?;
    let dmarc_host = format!("_dmarc.{domain}");
    let candidates = candidate_selectors(&config.dkim);

    let (spf, dmarc, dkim) = tokio::join!(
        fetch_txt(resolver, &domain, RecordKind::Spf),
        fetch_txt(resolver, &dmarc_host, RecordKind::Dmarc),
        probe_selectors(resolver, &domain, &candidates),
    );

    let status = DomainStatus {
        spf: RecordStatus::from_lookup(&domain, spf),
        dmarc: RecordStatus::from_lookup(&dmarc_host, dmarc),
        dkim,
        domain,
    };
    info!(
        domain = %status.domain,
        spf = status.spf.valid,
        dmarc = status.dmarc.valid,
        dkim_selectors = status.dkim.selectors.len(),
        "domain status checked"
    );
    Ok(status)
}
