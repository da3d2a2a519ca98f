//! `PostureEngine`: one entry point for every posture operation.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::{ensure_writable, CatalogActor, CatalogError, KnownSender, SenderCatalog};
use crate::classify::{classify, Classification};
use crate::common::dns::{DnsResolver, HickoryResolver};
use crate::common::domain::validate_domain;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::record::{fetch_txt, lookup_record, LookupRequest, LookupResponse, RecordKind};
use crate::spf::{resolve_include, SpfResolution};
use crate::status::{domain_status, DomainStatus};
use crate::store::{CachedRecords, DomainStore, StoreError};
use crate::verify::{refresh_records, DomainRecord, DomainVerifier};
use crate::OrgId;

/// Outcome of refreshing a sender's ranges from its SPF include.
#[derive(Debug, Clone)]
pub struct RangeRefresh {
    pub sender: KnownSender,
    pub resolution: SpfResolution,
}

// ---------------------------------------------------------------------------
// PostureEngine
// ---------------------------------------------------------------------------

pub struct PostureEngine<R: DnsResolver> {
    resolver: R,
    config: EngineConfig,
    domains: Arc<dyn DomainStore>,
    catalog: Arc<dyn SenderCatalog>,
}

impl PostureEngine<HickoryResolver> {
    /// Engine backed by a real resolver built from `config.dns`.
    pub fn from_config(
        config: EngineConfig,
        domains: Arc<dyn DomainStore>,
        catalog: Arc<dyn SenderCatalog>,
    ) -> Result<Self> {
        config.validate()?;
        let dns = &config.dns;
        let resolver = if dns.use_system_config {
            HickoryResolver::from_system_conf(dns.timeout(), dns.attempts)
                .map_err(|e| EngineError::dns("system resolver configuration", e))?
        } else {
            HickoryResolver::new(dns.timeout(), dns.attempts)
        };
        Ok(Self::new(resolver, config, domains, catalog))
    }
}

impl<R: DnsResolver> PostureEngine<R> {
    pub fn new(
        resolver: R,
        config: EngineConfig,
        domains: Arc<dyn DomainStore>,
        catalog: Arc<dyn SenderCatalog>,
    ) -> Self {
        Self {
            resolver,
            config,
            domains,
            catalog,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -- DNS lookups --------------------------------------------------------

    /// Fetch one authentication record. A missing record is `found: false`.
    pub async fn lookup_record(
        &self,
        domain: &str,
        kind: RecordKind,
        selector: Option<&str>,
    ) -> Result<LookupResponse> {
        let request = LookupRequest::new(domain, kind, selector)?;
        lookup_record(&self.resolver, &request).await
    }

    pub async fn domain_status(&self, domain: &str) -> Result<DomainStatus> {
        domain_status(&self.resolver, domain, &self.config).await
    }

    pub async fn resolve_spf_include(&self, include: &str) -> Result<SpfResolution> {
        resolve_include(&self.resolver, include, &self.config.spf).await
    }

    // -- Domain lifecycle ---------------------------------------------------

    /// Register `domain` for `org` with a fresh verification token.
    pub async fn add_domain(&self, org: OrgId, domain: &str) -> Result<DomainRecord> {
        let domain =
            validate_domain(domain).ok_or_else(|| EngineError::InvalidDomain(domain.to_string()))?;
        let record = DomainRecord::new(org, domain);
        self.domains.insert(record.clone()).await?;
        info!(org = %org, domain = %record.domain, "domain added");
        Ok(record)
    }

    async fn load_domain(&self, org: OrgId, domain: &str) -> Result<DomainRecord> {
        let domain =
            validate_domain(domain).ok_or_else(|| EngineError::InvalidDomain(domain.to_string()))?;
        match self.domains.get(org, &domain).await? {
            Some(record) => Ok(record),
            None => Err(StoreError::NotFound { domain }.into()),
        }
    }

    /// Check the published token and persist the verified state.
    ///
    /// Nothing is written when verification fails.
    pub async fn verify_domain(&self, org: OrgId, domain: &str, actor: &str) -> Result<DomainRecord> {
        let mut record = self.load_domain(org, domain).await?;
        DomainVerifier::new(&self.resolver).verify(&mut record, actor).await?;
        self.domains.save(&record).await?;
        Ok(record)
    }

    /// Re-fetch the cached SPF and DMARC records of a stored domain.
    ///
    /// Partial results are persisted before a DNS failure is returned. Only
    /// the cached fields are written, so a verification that lands while the
    /// lookups run is kept.
    pub async fn refresh_domain(&self, org: OrgId, domain: &str) -> Result<DomainRecord> {
        let mut record = self.load_domain(org, domain).await?;
        let refreshed = refresh_records(&self.resolver, &mut record).await;
        let cached = CachedRecords {
            checked_at: record.last_checked_at.unwrap_or_else(Utc::now),
            spf_record: record.spf_record,
            dmarc_record: record.dmarc_record,
        };
        let stored = self
            .domains
            .update_cached_records(org, &record.domain, cached)
            .await?;
        refreshed.map(|()| stored)
    }

    // -- Known senders ------------------------------------------------------

    /// Resolve a sender's SPF include and store the flattened ranges.
    ///
    /// When the resolution yields no ranges and reported errors, the stored
    /// ranges are left untouched.
    pub async fn refresh_sender_ranges(&self, actor: CatalogActor, id: Uuid) -> Result<RangeRefresh> {
        let sender = self.catalog.get(id).await?.ok_or(CatalogError::NotFound(id))?;
        if let CatalogActor::Organization(org) = actor {
            if !sender.is_visible_to(org) {
                return Err(CatalogError::NotFound(id).into());
            }
        }
        ensure_writable(&sender, actor)?;
        let include = sender
            .spf_include
            .clone()
            .ok_or(CatalogError::NoSpfInclude(id))?;

        let resolution = resolve_include(&self.resolver, &include, &self.config.spf).await?;
        if resolution.ip_ranges.is_empty() && !resolution.errors.is_empty() {
            warn!(
                sender = %sender.name,
                include = %include,
                errors = resolution.errors.len(),
                "SPF include resolved to nothing, keeping stored ranges"
            );
            return Ok(RangeRefresh { sender, resolution });
        }

        let sender = self
            .catalog
            .store_ip_ranges(actor, id, resolution.ip_ranges.clone(), Utc::now())
            .await?;
        info!(
            sender = %sender.name,
            ranges = sender.ip_ranges.len(),
            errors = resolution.errors.len(),
            "sender ranges refreshed"
        );
        Ok(RangeRefresh { sender, resolution })
    }

    /// Classify a caller-supplied SPF record against the catalog visible to `org`.
    pub async fn classify_record(&self, org: OrgId, spf_record: &str) -> Result<Classification> {
        let senders = self.catalog.visible_to(org).await?;
        Ok(classify(spf_record, &senders))
    }

    /// Fetch `domain`'s live SPF record and classify it. A domain without
    /// SPF yields no matches.
    pub async fn classify_domain(&self, org: OrgId, domain: &str) -> Result<Classification> {
        let domain =
            validate_domain(domain).ok_or_else(|| EngineError::InvalidDomain(domain.to_string()))?;
        let lookup = fetch_txt(&self.resolver, &domain, RecordKind::Spf)
            .await
            .map_err(|e| EngineError::dns(&domain, e))?;
        match lookup.matched {
            Some(record) => self.classify_record(org, &record).await,
            None => Ok(Classification::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{MemoryCatalog, SenderCategory};
    use crate::classify::MechanismType;
    use crate::common::dns::{DnsError, MockResolver};
    use crate::store::MemoryDomainStore;
    use crate::verify::VerifyError;

    fn engine(resolver: &MockResolver) -> PostureEngine<MockResolver> {
        PostureEngine::new(
            resolver.clone(),
            EngineConfig::default(),
            Arc::new(MemoryDomainStore::new()),
            Arc::new(MemoryCatalog::with_builtin()),
        )
    }

    #[tokio::test]
    async fn dmarc_lookup_miss_is_not_an_error() {
        let resolver = MockResolver::new();
        resolver.set_nxdomain("_dmarc.example.com");
        let response = engine(&resolver)
            .lookup_record("example.com", RecordKind::Dmarc, None)
            .await
            .unwrap();
        assert_eq!(response.record, None);
        assert!(!response.found);
    }

    #[tokio::test]
    async fn dkim_lookup_needs_selector_before_any_query() {
        let resolver = MockResolver::new();
        let err = engine(&resolver)
            .lookup_record("example.com", RecordKind::Dkim, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SelectorRequired));
        assert_eq!(resolver.query_count(), 0);
    }

    #[tokio::test]
    async fn lookup_hard_failure_is_retryable() {
        let resolver = MockResolver::new();
        resolver.set_timeout("example.com");
        let err = engine(&resolver)
            .lookup_record("example.com", RecordKind::Spf, None)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn add_then_verify_domain() {
        let resolver = MockResolver::new();
        let engine = engine(&resolver);
        let org = Uuid::new_v4();

        let added = engine.add_domain(org, "Example.com").await.unwrap();
        assert_eq!(added.domain, "example.com");
        let token = added.verification_token().unwrap().to_string();

        let err = engine.verify_domain(org, "example.com", "alice").await.unwrap_err();
        assert!(matches!(err, EngineError::Verification(VerifyError::Mismatch { .. })));
        let stored = engine.domains.get(org, "example.com").await.unwrap().unwrap();
        assert!(!stored.is_verified());

        resolver.add_txt("_dmarc-verify.example.com", vec![token.clone()]);
        let verified = engine.verify_domain(org, "example.com", "alice").await.unwrap();
        assert!(verified.is_verified());
        assert_eq!(verified.verification_token(), Some(token.as_str()));

        let stored = engine.domains.get(org, "example.com").await.unwrap().unwrap();
        assert_eq!(stored.verified_by(), Some("alice"));

        let err = engine.verify_domain(org, "example.com", "bob").await.unwrap_err();
        assert!(matches!(err, EngineError::Verification(VerifyError::AlreadyVerified { .. })));
    }

    #[tokio::test]
    async fn duplicate_domain_is_rejected() {
        let resolver = MockResolver::new();
        let engine = engine(&resolver);
        let org = Uuid::new_v4();
        engine.add_domain(org, "example.com").await.unwrap();

        let err = engine.add_domain(org, "EXAMPLE.com.").await.unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::Duplicate { .. })));
    }

    #[tokio::test]
    async fn unknown_domain_cannot_be_verified() {
        let resolver = MockResolver::new();
        let err = engine(&resolver)
            .verify_domain(Uuid::new_v4(), "example.com", "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn refresh_domain_persists_partial_results() {
        let resolver = MockResolver::new();
        let engine = engine(&resolver);
        let org = Uuid::new_v4();
        engine.add_domain(org, "example.com").await.unwrap();
        resolver.add_txt("example.com", vec!["v=spf1 include:sendgrid.net -all".into()]);
        resolver.add_txt_err("_dmarc.example.com", DnsError::ServFail);

        let err = engine.refresh_domain(org, "example.com").await.unwrap_err();
        assert!(err.is_retryable());
        let stored = engine.domains.get(org, "example.com").await.unwrap().unwrap();
        assert_eq!(stored.spf_record.as_deref(), Some("v=spf1 include:sendgrid.net -all"));
        assert!(stored.last_checked_at.is_some());
    }

    /// Delays answers for one host so a concurrent task can finish first.
    #[derive(Clone)]
    struct SlowHost {
        inner: MockResolver,
        host: &'static str,
    }

    impl DnsResolver for SlowHost {
        async fn query_txt(&self, name: &str) -> std::result::Result<Vec<String>, DnsError> {
            if name.eq_ignore_ascii_case(self.host) {
                for _ in 0..5 {
                    tokio::task::yield_now().await;
                }
            }
            self.inner.query_txt(name).await
        }
    }

    #[tokio::test]
    async fn refresh_racing_verify_keeps_verification() {
        let inner = MockResolver::new();
        let engine = PostureEngine::new(
            SlowHost {
                inner: inner.clone(),
                host: "example.com",
            },
            EngineConfig::default(),
            Arc::new(MemoryDomainStore::new()),
            Arc::new(MemoryCatalog::new()),
        );
        let org = Uuid::new_v4();
        let added = engine.add_domain(org, "example.com").await.unwrap();
        inner.add_txt("_dmarc-verify.example.com", vec![added.verification_token().unwrap().to_string()]);
        inner.add_txt("example.com", vec!["v=spf1 -all".into()]);

        let (refreshed, verified) = tokio::join!(
            engine.refresh_domain(org, "example.com"),
            engine.verify_domain(org, "example.com", "alice"),
        );
        refreshed.unwrap();
        verified.unwrap();

        let stored = engine.domains.get(org, "example.com").await.unwrap().unwrap();
        assert!(stored.is_verified());
        assert_eq!(stored.verified_by(), Some("alice"));
        assert_eq!(stored.spf_record.as_deref(), Some("v=spf1 -all"));
    }

    #[tokio::test]
    async fn system_refreshes_global_sender_ranges() {
        let resolver = MockResolver::new();
        resolver.add_txt("sendgrid.net", vec!["v=spf1 ip4:167.89.0.0/17 ip4:149.72.0.0/16 ~all".into()]);
        let engine = engine(&resolver);
        let id = KnownSender::global("SendGrid", SenderCategory::Transactional).id;

        let refresh = engine.refresh_sender_ranges(CatalogActor::System, id).await.unwrap();
        assert_eq!(refresh.sender.ip_ranges, vec!["167.89.0.0/17", "149.72.0.0/16"]);
        assert!(refresh.sender.ip_ranges_updated_at.is_some());
        assert!(refresh.resolution.is_clean());
    }

    #[tokio::test]
    async fn org_cannot_refresh_global_sender() {
        let resolver = MockResolver::new();
        let engine = engine(&resolver);
        let id = KnownSender::global("SendGrid", SenderCategory::Transactional).id;

        let err = engine
            .refresh_sender_ranges(CatalogActor::Organization(Uuid::new_v4()), id)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Catalog(CatalogError::GlobalImmutable(_))));
        assert_eq!(resolver.query_count(), 0);
    }

    #[tokio::test]
    async fn org_refreshes_its_own_sender() {
        let resolver = MockResolver::new();
        resolver.add_txt("relay.example.net", vec!["v=spf1 ip4:192.0.2.0/24 -all".into()]);
        let engine = engine(&resolver);
        let org = Uuid::new_v4();
        let sender = engine
            .catalog
            .save_org_sender(
                org,
                KnownSender::for_organization(org, "Relay", SenderCategory::Other).spf_include("relay.example.net"),
            )
            .await
            .unwrap();

        let refresh = engine
            .refresh_sender_ranges(CatalogActor::Organization(org), sender.id)
            .await
            .unwrap();
        assert_eq!(refresh.sender.ip_ranges, vec!["192.0.2.0/24"]);

        let err = engine
            .refresh_sender_ranges(CatalogActor::Organization(Uuid::new_v4()), sender.id)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Catalog(CatalogError::NotFound(_))));
    }

    #[tokio::test]
    async fn failed_resolution_keeps_stored_ranges() {
        let resolver = MockResolver::new();
        resolver.set_timeout("sendgrid.net");
        let engine = engine(&resolver);
        let id = KnownSender::global("SendGrid", SenderCategory::Transactional).id;
        let before = engine.catalog.get(id).await.unwrap().unwrap();

        let refresh = engine.refresh_sender_ranges(CatalogActor::System, id).await.unwrap();
        assert!(!refresh.resolution.errors.is_empty());
        let after = engine.catalog.get(id).await.unwrap().unwrap();
        assert_eq!(after.ip_ranges, before.ip_ranges);
        assert_eq!(after.ip_ranges_updated_at, None);
    }

    #[tokio::test]
    async fn sender_without_include_is_rejected() {
        let resolver = MockResolver::new();
        let engine = engine(&resolver);
        let org = Uuid::new_v4();
        let sender = engine
            .catalog
            .save_org_sender(org, KnownSender::for_organization(org, "Bare", SenderCategory::Other))
            .await
            .unwrap();

        let err = engine
            .refresh_sender_ranges(CatalogActor::Organization(org), sender.id)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Catalog(CatalogError::NoSpfInclude(_))));
    }

    #[tokio::test]
    async fn classify_domain_uses_live_spf() {
        let resolver = MockResolver::new();
        resolver.add_txt(
            "example.com",
            vec!["v=spf1 include:sendgrid.net ip4:167.89.0.0/17 ip6:2001:db8::/32 -all".into()],
        );
        let classification = engine(&resolver)
            .classify_domain(Uuid::new_v4(), "example.com")
            .await
            .unwrap();

        let kinds: Vec<MechanismType> = classification.matches.iter().map(|m| m.kind).collect();
        assert_eq!(kinds, vec![MechanismType::Include, MechanismType::Ip4, MechanismType::Ip6]);
        assert_eq!(classification.unmatched().count(), 1);
        assert_eq!(classification.matches[0].sender.as_ref().unwrap().name, "SendGrid");
    }

    #[tokio::test]
    async fn classify_domain_without_spf_is_empty() {
        let resolver = MockResolver::new();
        resolver.set_nxdomain("example.com");
        let classification = engine(&resolver)
            .classify_domain(Uuid::new_v4(), "example.com")
            .await
            .unwrap();
        assert!(classification.matches.is_empty());
    }

    #[tokio::test]
    async fn org_senders_only_classify_for_their_owner() {
        let resolver = MockResolver::new();
        let engine = engine(&resolver);
        let owner = Uuid::new_v4();
        engine
            .catalog
            .save_org_sender(
                owner,
                KnownSender::for_organization(owner, "Relay", SenderCategory::Other).spf_include("relay.example.net"),
            )
            .await
            .unwrap();

        let record = "v=spf1 include:relay.example.net -all";
        let mine = engine.classify_record(owner, record).await.unwrap();
        let theirs = engine.classify_record(Uuid::new_v4(), record).await.unwrap();
        assert_eq!(mine.matches[0].sender.as_ref().unwrap().name, "Relay");
        assert!(theirs.matches[0].sender.is_none());
    }
}
