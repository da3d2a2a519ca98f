//! Matching SPF mechanisms against the known-sender catalog.
//!
//! Include matching is a deliberately loose heuristic: a mechanism matches a
//! sender when either string contains the other (case-insensitive). That
//! lets `include:_spf.google.com` match a `google.com` pattern, at the price
//! of occasional false positives between unrelated providers that share a
//! substring. The first sender in catalog order wins; there is no scoring.

use serde::{Deserialize, Serialize};

use crate::catalog::{KnownSender, SenderRef};
use crate::common::cidr::cidr_within;
use crate::spf::{scan_terms, SpfTerm};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MechanismType {
    Include,
    Ip4,
    Ip6,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationMatch {
    #[serde(rename = "type")]
    pub kind: MechanismType,
    pub value: String,
    pub sender: Option<SenderRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub matches: Vec<ClassificationMatch>,
}

impl Classification {
    pub fn unmatched(&self) -> impl Iterator<Item = &ClassificationMatch> {
        self.matches.iter().filter(|m| m.sender.is_none())
    }
}

/// Bidirectional, case-insensitive substring test. Empty strings never match.
pub fn include_matches(mechanism: &str, pattern: &str) -> bool {
    let mechanism = mechanism.trim().to_ascii_lowercase();
    let pattern = pattern.trim().to_ascii_lowercase();
    if mechanism.is_empty() || pattern.is_empty() {
        return false;
    }
    mechanism.contains(&pattern) || pattern.contains(&mechanism)
}

fn match_include<'a>(domain: &str, senders: &'a [KnownSender]) -> Option<&'a KnownSender> {
    senders.iter().find(|s| {
        s.spf_include
            .as_deref()
            .is_some_and(|pattern| include_matches(domain, pattern))
    })
}

/// An ip4 mechanism belongs to a sender when its whole network lies inside
/// one of the sender's ranges.
fn match_ip4<'a>(value: &str, senders: &'a [KnownSender]) -> Option<&'a KnownSender> {
    senders
        .iter()
        .find(|s| s.ip_ranges.iter().any(|range| cidr_within(value, range)))
}

/// One match per `include:`, `ip4:` and `ip6:` mechanism of `spf_record`, in
/// record order. `senders` is the visible catalog in precedence order.
///
/// `ip4:` matching is stricter than [`ip_in_range`] on the mechanism's base
/// address: the mechanism's whole network must fit inside a sender range, so
/// `ip4:167.89.0.0/16` does not match a `167.89.0.0/17` range.
///
/// [`ip_in_range`]: crate::common::cidr::ip_in_range
pub fn classify(spf_record: &str, senders: &[KnownSender]) -> Classification {
    let matches = scan_terms(spf_record)
        .into_iter()
        .filter_map(|term| match term {
            SpfTerm::Include { domain, .. } => Some(ClassificationMatch {
                kind: MechanismType::Include,
                sender: match_include(&domain, senders).map(KnownSender::descriptor),
                value: domain,
            }),
            SpfTerm::Ip4 { value, .. } => Some(ClassificationMatch {
                kind: MechanismType::Ip4,
                sender: match_ip4(&value, senders).map(KnownSender::descriptor),
                value,
            }),
            // no IPv6 containment support
            SpfTerm::Ip6 { value, .. } => Some(ClassificationMatch {
                kind: MechanismType::Ip6,
                value,
                sender: None,
            }),
            SpfTerm::Redirect(_) | SpfTerm::Other(_) => None,
        })
        .collect();
    Classification { matches }
}
