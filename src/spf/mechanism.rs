//! SPF term scanning (RFC 7208 Section 4.6).
//!
//! This is a tolerant scanner, not a validating parser: it pulls out the
//! terms the engine cares about (`include`, `ip4`, `ip6`, `redirect=`) and
//! keeps everything else as an opaque term. Malformed terms never abort a scan.

/// Qualifier prefix on a directive. Defaults to Pass if omitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qualifier {
    Pass,     // +
    Fail,     // -
    SoftFail, // ~
    Neutral,  // ?
}

impl Qualifier {
    /// Parse a single-char qualifier prefix. Returns (Qualifier, remaining str).
    pub fn parse_prefix(s: &str) -> (Qualifier, &str) {
        match s.as_bytes().first() {
            Some(b'+') => (Qualifier::Pass, &s[1..]),
            Some(b'-') => (Qualifier::Fail, &s[1..]),
            Some(b'~') => (Qualifier::SoftFail, &s[1..]),
            Some(b'?') => (Qualifier::Neutral, &s[1..]),
            _ => (Qualifier::Pass, s),
        }
    }
}

/// One term of an SPF record. Values are kept verbatim, except include and
/// redirect targets which are lowercased with any trailing dot removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpfTerm {
    /// `include:<domain>`
    Include { qualifier: Qualifier, domain: String },
    /// `ip4:<addr>[/prefix]`
    Ip4 { qualifier: Qualifier, value: String },
    /// `ip6:<addr>[/prefix]`
    Ip6 { qualifier: Qualifier, value: String },
    /// `redirect=<domain>`
    Redirect(String),
    /// Any other mechanism or modifier (`a`, `mx`, `all`, `exp=`, ...).
    Other(String),
}

/// Split an SPF record into terms. The `v=spf1` version tag is skipped.
pub fn scan_terms(record: &str) -> Vec<SpfTerm> {
    record
        .split_whitespace()
        .filter(|t| !t.eq_ignore_ascii_case("v=spf1"))
        .map(scan_term)
        .collect()
}

fn scan_term(raw: &str) -> SpfTerm {
    let (qualifier, body) = Qualifier::parse_prefix(raw);
    let (name, arg) = match body.split_once(':') {
        Some((name, arg)) => (name, Some(arg)),
        None => (body, None),
    };

    match (name.to_ascii_lowercase().as_str(), arg) {
        ("include", Some(domain)) if !domain.is_empty() => SpfTerm::Include {
            qualifier,
            domain: normalize_target(domain),
        },
        ("ip4", Some(value)) if !value.is_empty() => SpfTerm::Ip4 {
            qualifier,
            value: value.to_string(),
        },
        ("ip6", Some(value)) if !value.is_empty() => SpfTerm::Ip6 {
            qualifier,
            value: value.to_string(),
        },
        _ => match body.split_once('=') {
            Some((key, value)) if key.eq_ignore_ascii_case("redirect") && !value.is_empty() => {
                SpfTerm::Redirect(normalize_target(value))
            }
            _ => SpfTerm::Other(raw.to_string()),
        },
    }
}

fn normalize_target(domain: &str) -> String {
    let d = domain.to_ascii_lowercase();
    d.strip_suffix('.').unwrap_or(&d).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_includes_and_ranges() {
        let terms = scan_terms("v=spf1 include:sendgrid.net ip4:167.89.0.0/17 -all");
        assert_eq!(
            terms,
            vec![
                SpfTerm::Include {
                    qualifier: Qualifier::Pass,
                    domain: "sendgrid.net".into()
                },
                SpfTerm::Ip4 {
                    qualifier: Qualifier::Pass,
                    value: "167.89.0.0/17".into()
                },
                SpfTerm::Other("-all".into()),
            ]
        );
    }

    #[test]
    fn qualifiers_are_kept() {
        let terms = scan_terms("v=spf1 ~include:_spf.Google.com. ?ip6:2001:db8::/32");
        assert_eq!(
            terms,
            vec![
                SpfTerm::Include {
                    qualifier: Qualifier::SoftFail,
                    domain: "_spf.google.com".into()
                },
                SpfTerm::Ip6 {
                    qualifier: Qualifier::Neutral,
                    value: "2001:db8::/32".into()
                },
            ]
        );
    }

    #[test]
    fn redirect_modifier() {
        let terms = scan_terms("v=spf1 redirect=_spf.Example.net");
        assert_eq!(terms, vec![SpfTerm::Redirect("_spf.example.net".into())]);
    }

    #[test]
    fn malformed_terms_are_opaque() {
        let terms = scan_terms("V=SPF1 include: ip4: a mx:mail.example.com exp=explain.example.com");
        assert_eq!(
            terms,
            vec![
                SpfTerm::Other("include:".into()),
                SpfTerm::Other("ip4:".into()),
                SpfTerm::Other("a".into()),
                SpfTerm::Other("mx:mail.example.com".into()),
                SpfTerm::Other("exp=explain.example.com".into()),
            ]
        );
    }

    #[test]
    fn extra_whitespace_is_ignored() {
        let terms = scan_terms("  v=spf1   ip4:192.0.2.1 \t -all  ");
        assert_eq!(terms.len(), 2);
    }
}
