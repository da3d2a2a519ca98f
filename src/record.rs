//! TXT record lookup for SPF, DMARC and DKIM.
//!
//! A lookup distinguishes three outcomes: a matching record, a soft miss
//! (NXDOMAIN / NODATA / no record with the expected marker) and a hard DNS
//! failure. Only the last one is an error.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::common::dns::{DnsError, DnsResolver};
use crate::common::domain::{validate_domain, validate_selector};
use crate::error::{EngineError, Result};

/// The record types the engine knows how to look up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Dmarc,
    Spf,
    Dkim,
}

impl RecordKind {
    /// Whether a flattened TXT string is a record of this kind.
    pub fn matches(&self, txt: &str) -> bool {
        let lower = txt.trim().to_ascii_lowercase();
        match self {
            RecordKind::Spf => lower == "v=spf1" || lower.starts_with("v=spf1 "),
            RecordKind::Dmarc => {
                lower
                    .strip_prefix("v=dmarc1")
                    .is_some_and(|rest| rest.is_empty() || rest.starts_with([';', ' ']))
            }
            RecordKind::Dkim => is_dkim_key(&lower),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Dmarc => "dmarc",
            RecordKind::Spf => "spf",
            RecordKind::Dkim => "dkim",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dmarc" => Ok(RecordKind::Dmarc),
            "spf" => Ok(RecordKind::Spf),
            "dkim" => Ok(RecordKind::Dkim),
            other => Err(EngineError::UnsupportedRecordType(other.to_string())),
        }
    }
}

/// A DKIM key record starts with `v=DKIM1` or carries a `k=rsa` / `p=` tag.
pub(crate) fn is_dkim_key(txt: &str) -> bool {
    let lower = txt.trim().to_ascii_lowercase();
    lower.starts_with("v=dkim1") || lower.contains("k=rsa") || lower.contains("p=")
}

/// Raw TXT answer for one host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxtLookup {
    pub records: Vec<String>,
    pub matched: Option<String>,
    pub found: bool,
}

/// Query TXT at `host` and pick the first record of `kind`.
///
/// NXDOMAIN and NODATA come back as `found = false`; any other DNS failure
/// is returned as an error.
pub async fn fetch_txt<R: DnsResolver>(
    resolver: &R,
    host: &str,
    kind: RecordKind,
) -> std::result::Result<TxtLookup, DnsError> {
    let records = match resolver.query_txt(host).await {
        Ok(records) => records,
        Err(e) if e.is_miss() => {
            debug!(host, kind = %kind, "no TXT records");
            return Ok(TxtLookup::default());
        }
        Err(e) => return Err(e),
    };

    let matched = records.iter().find(|r| kind.matches(r)).cloned();
    let found = matched.is_some();
    debug!(host, kind = %kind, records = records.len(), found, "TXT lookup");
    Ok(TxtLookup {
        records,
        matched,
        found,
    })
}

/// A validated lookup: the domain is normalized and the selector is present
/// exactly when the kind is DKIM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupRequest {
    domain: String,
    kind: RecordKind,
    selector: Option<String>,
}

impl LookupRequest {
    pub fn new(domain: &str, kind: RecordKind, selector: Option<&str>) -> Result<Self> {
        let domain =
            validate_domain(domain).ok_or_else(|| EngineError::InvalidDomain(domain.to_string()))?;
        let selector = match (kind, selector) {
            (RecordKind::Dkim, Some(sel)) => Some(
                validate_selector(sel).ok_or_else(|| EngineError::InvalidSelector(sel.to_string()))?,
            ),
            (RecordKind::Dkim, None) => return Err(EngineError::SelectorRequired),
            (other, Some(_)) => return Err(EngineError::SelectorNotAllowed(other)),
            (_, None) => None,
        };
        Ok(Self {
            domain,
            kind,
            selector,
        })
    }

    /// Parse the record type from a string, as received from a request layer.
    pub fn parse(domain: &str, kind: &str, selector: Option<&str>) -> Result<Self> {
        Self::new(domain, kind.parse()?, selector)
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn selector(&self) -> Option<&str> {
        self.selector.as_deref()
    }

    /// The DNS name to query.
    pub fn host(&self) -> String {
        match (self.kind, &self.selector) {
            (RecordKind::Dmarc, _) => format!("_dmarc.{}", self.domain),
            (RecordKind::Spf, _) => self.domain.clone(),
            (RecordKind::Dkim, Some(sel)) => format!("{}._domainkey.{}", sel, self.domain),
            (RecordKind::Dkim, None) => format!("_domainkey.{}", self.domain),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupResponse {
    pub domain: String,
    pub record: Option<String>,
    pub all_records: Vec<String>,
    pub found: bool,
}

/// Run a validated lookup.
pub async fn lookup_record<R: DnsResolver>(
    resolver: &R,
    request: &LookupRequest,
) -> Result<LookupResponse> {
    let host = request.host();
    let lookup = fetch_txt(resolver, &host, request.kind)
        .await
        .map_err(|e| EngineError::dns(&host, e))?;
    Ok(LookupResponse {
        domain: request.domain.clone(),
        record: lookup.matched,
        all_records: lookup.records,
        found: lookup.found,
    })
}
