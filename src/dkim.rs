//! DKIM selector discovery.
//!
//! Selectors cannot be enumerated through DNS, so discovery probes a table of
//! well-known provider selectors. Only a short prefix of the table is probed
//! per request to bound the query fan-out.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::common::dns::DnsResolver;
use crate::common::domain::validate_selector;
use crate::config::DkimConfig;
use crate::record::is_dkim_key;

/// Well-known selectors, most common first.
pub const KNOWN_SELECTORS: &[&str] = &[
    "google._domainkey",       // Google Workspace
    "selector1._domainkey",    // Microsoft 365
    "selector2._domainkey",    // Microsoft 365
    "k1._domainkey",           // Mailchimp / Mandrill
    "k2._domainkey",           // Mailchimp
    "pm._domainkey",           // Postmark
    "s1._domainkey",           // SendGrid
    "s2._domainkey",           // SendGrid
    "default._domainkey",
    "dkim._domainkey",
    "mail._domainkey",
    "smtp._domainkey",
    "mandrill._domainkey",
    "mxvault._domainkey",
    "zendesk1._domainkey",
    "zendesk2._domainkey",
    "sig1._domainkey",         // iCloud
    "protonmail._domainkey",
    "everlytickey1._domainkey",
    "everlytickey2._domainkey",
    "cm._domainkey",           // Campaign Monitor
    "mailjet._domainkey",
];

/// Result of probing a domain's selectors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkimStatus {
    pub valid: bool,
    pub selectors: Vec<String>,
}

/// Candidate list for one probe run: the built-in table plus configured
/// extras, deduplicated and cut to `max_selector_probes`.
pub fn candidate_selectors(config: &DkimConfig) -> Vec<String> {
    let extras = config
        .extra_selectors
        .iter()
        .filter_map(|s| validate_selector(s))
        .map(|s| format!("{s}._domainkey"));

    let mut candidates: Vec<String> = Vec::new();
    for selector in KNOWN_SELECTORS.iter().map(|s| s.to_string()).chain(extras) {
        if !candidates.contains(&selector) {
            candidates.push(selector);
        }
    }
    candidates.truncate(config.max_selector_probes);
    candidates
}

/// Probe `<selector>.<domain>` for every candidate concurrently.
///
/// A selector is a hit when any of its TXT strings looks like a DKIM key.
/// Misses and DNS failures of individual selectors are dropped silently.
pub async fn probe_selectors<R: DnsResolver>(
    resolver: &R,
    domain: &str,
    candidates: &[String],
) -> DkimStatus {
    let probes = candidates.iter().map(|selector| async move {
        let host = format!("{selector}.{domain}");
        match resolver.query_txt(&host).await {
            Ok(records) if records.iter().any(|r| is_dkim_key(r)) => Some(selector.clone()),
            Ok(_) => None,
            Err(e) => {
                debug!(host = %host, error = %e, "DKIM selector probe failed");
                None
            }
        }
    });

    let selectors: Vec<String> = join_all(probes).await.into_iter().flatten().collect();
    debug!(domain, probed = candidates.len(), hits = selectors.len(), "DKIM selectors probed");
    DkimStatus {
        valid: !selectors.is_empty(),
        selectors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::dns::{DnsError, MockResolver};

    #[test]
    fn default_candidates_are_first_eight() {
        let candidates = candidate_selectors(&DkimConfig::default());
        assert_eq!(candidates.len(), 8);
        assert_eq!(candidates[0], "google._domainkey");
        assert_eq!(candidates, KNOWN_SELECTORS[..8].iter().map(|s| s.to_string()).collect::<Vec<_>>());
    }

    #[test]
    fn extras_are_appended_and_deduplicated() {
        let config = DkimConfig {
            max_selector_probes: 100,
            extra_selectors: vec!["Acme".into(), "google._domainkey".into(), "bad selector".into()],
        };
        let candidates = candidate_selectors(&config);
        assert_eq!(candidates.len(), KNOWN_SELECTORS.len() + 1);
        assert_eq!(candidates.last().map(String::as_str), Some("acme._domainkey"));
    }

    #[tokio::test]
    async fn only_responding_selector_is_reported() {
        let resolver = MockResolver::new();
        resolver.add_txt(
            "google._domainkey.example.com",
            vec!["v=DKIM1; k=rsa; p=MIIBIjANBgkqhkiG9w0BAQEFAAOCAQ8AMIIBCgKCAQEA".into()],
        );
        resolver.set_nxdomain("selector1._domainkey.example.com");
        resolver.set_timeout("selector2._domainkey.example.com");
        resolver.add_txt_err("k1._domainkey.example.com", DnsError::ServFail);
        resolver.add_txt("k2._domainkey.example.com", vec!["v=spf1 -all".into()]);

        let candidates = candidate_selectors(&DkimConfig::default());
        let status = probe_selectors(&resolver, "example.com", &candidates).await;

        assert_eq!(
            status,
            DkimStatus {
                valid: true,
                selectors: vec!["google._domainkey".into()]
            }
        );
        assert_eq!(resolver.query_count(), 8);
    }

    #[tokio::test]
    async fn no_hits_is_invalid_not_error() {
        let resolver = MockResolver::new();
        let candidates = candidate_selectors(&DkimConfig::default());
        let status = probe_selectors(&resolver, "example.com", &candidates).await;
        assert!(!status.valid);
        assert!(status.selectors.is_empty());
    }

    #[tokio::test]
    async fn hits_keep_candidate_order() {
        let resolver = MockResolver::new();
        resolver.add_txt("s1._domainkey.example.com", vec!["k=rsa; p=MIGf".into()]);
        resolver.add_txt("selector1._domainkey.example.com", vec!["v=DKIM1; p=MIGf".into()]);

        let candidates = candidate_selectors(&DkimConfig::default());
        let status = probe_selectors(&resolver, "example.com", &candidates).await;
        assert_eq!(status.selectors, vec!["selector1._domainkey", "s1._domainkey"]);
    }
}
