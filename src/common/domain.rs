use once_cell::sync::Lazy;
use regex::Regex;

/// Letters/digits/hyphens per label, no leading or trailing hyphen, alphabetic TLD of 2+ chars.
static DOMAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z]{2,63}$")
        .expect("domain pattern is valid")
});

/// DKIM selectors may carry underscores (`google._domainkey`, `s1._domainkey`).
static SELECTOR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9_](?:[a-z0-9_-]{0,61}[a-z0-9_])?(?:\.[a-z0-9_](?:[a-z0-9_-]{0,61}[a-z0-9_])?)*$")
        .expect("selector pattern is valid")
});

/// Like [`DOMAIN_RE`] but labels may carry underscores (`_spf.google.com`).
static HOSTNAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[a-z0-9_](?:[a-z0-9_-]{0,61}[a-z0-9_])?\.)+[a-z]{2,63}$")
        .expect("hostname pattern is valid")
});

/// Normalize a domain: trim, lowercase + strip trailing dot.
pub fn normalize(domain: &str) -> String {
    let d = domain.trim().to_ascii_lowercase();
    d.strip_suffix('.').unwrap_or(&d).to_string()
}

/// Normalize and validate a domain argument. Returns the normalized form.
pub fn validate_domain(domain: &str) -> Option<String> {
    let normalized = normalize(domain);
    if normalized.len() > 253 || !DOMAIN_RE.is_match(&normalized) {
        return None;
    }
    Some(normalized)
}

/// Normalize and validate a DNS owner name such as an SPF include target,
/// where service labels (`_spf`, `_netblocks`) are allowed.
pub fn validate_hostname(host: &str) -> Option<String> {
    let normalized = normalize(host);
    if normalized.len() > 253 || !HOSTNAME_RE.is_match(&normalized) {
        return None;
    }
    Some(normalized)
}

pub fn is_valid_domain(domain: &str) -> bool {
    validate_domain(domain).is_some()
}

/// Validate a DKIM selector, accepting it with or without the `._domainkey`
/// suffix. Returns the bare selector, lowercased.
pub fn validate_selector(selector: &str) -> Option<String> {
    let s = selector.trim().to_ascii_lowercase();
    let bare = s.strip_suffix("._domainkey").unwrap_or(&s);
    if bare.is_empty() || bare.len() > 253 || !SELECTOR_RE.is_match(bare) {
        return None;
    }
    Some(bare.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_combined() {
        assert_eq!(normalize(" Mail.EXAMPLE.COM. "), "mail.example.com");
    }

    #[test]
    fn accepts_ordinary_hosts() {
        for d in ["example.com", "mail.example.co.uk", "a-b.example.io", "xn--bcher-kva.example", "EXAMPLE.COM."] {
            assert!(is_valid_domain(d), "{d}");
        }
        assert_eq!(validate_domain("Example.COM.").as_deref(), Some("example.com"));
    }

    #[test]
    fn rejects_malformed_hosts() {
        for d in [
            "",
            "localhost",
            "example.c",
            "example.123",
            "-bad.example.com",
            "bad-.example.com",
            "exa mple.com",
            "example..com",
            "_dmarc.example.com",
            "example.com/path",
            "user@example.com",
        ] {
            assert!(!is_valid_domain(d), "{d}");
        }
    }

    #[test]
    fn rejects_overlong_labels() {
        let label = "a".repeat(64);
        assert!(!is_valid_domain(&format!("{label}.com")));
        let label = "a".repeat(63);
        assert!(is_valid_domain(&format!("{label}.com")));
    }

    #[test]
    fn hostnames_allow_service_labels() {
        assert_eq!(validate_hostname("_spf.Google.com").as_deref(), Some("_spf.google.com"));
        assert_eq!(validate_hostname("_netblocks3.google.com.").as_deref(), Some("_netblocks3.google.com"));
        assert!(validate_hostname("%{i}._spf.example.com").is_none());
        assert!(validate_hostname("sendgrid").is_none());
    }

    #[test]
    fn selector_strips_domainkey_suffix() {
        assert_eq!(validate_selector("google._domainkey").as_deref(), Some("google"));
        assert_eq!(validate_selector("Selector1").as_deref(), Some("selector1"));
        assert_eq!(validate_selector("s1.mail").as_deref(), Some("s1.mail"));
    }

    #[test]
    fn selector_rejects_garbage() {
        assert!(validate_selector("").is_none());
        assert!(validate_selector("._domainkey").is_none());
        assert!(validate_selector("bad selector").is_none());
        assert!(validate_selector("a/b").is_none());
    }
}
