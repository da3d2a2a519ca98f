//! Catalog of known sending services.
//!
//! The catalog has two tiers: global entries seeded at deployment and visible
//! to everyone, and entries owned by a single organization. Reads return the
//! union. Admin edits are only accepted against the organization tier.

use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::OrgId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderCategory {
    EmailProvider,
    Transactional,
    Marketing,
    Support,
    Crm,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderScope {
    Global,
    Organization(OrgId),
}

/// Who is asking for a catalog write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogActor {
    /// Deployment tasks (seeding, scheduled range refresh).
    System,
    /// An organization admin.
    Organization(OrgId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownSender {
    pub id: Uuid,
    pub name: String,
    pub category: SenderCategory,
    pub scope: SenderScope,
    /// SPF include pattern, e.g. `sendgrid.net`.
    pub spf_include: Option<String>,
    pub ip_ranges: Vec<String>,
    pub dkim_domains: Vec<String>,
    pub logo_url: Option<String>,
    pub website: Option<String>,
    pub ip_ranges_updated_at: Option<DateTime<Utc>>,
}

impl KnownSender {
    /// Global entry. The id is derived from the name so seeds are stable
    /// across deployments.
    pub fn global(name: &str, category: SenderCategory) -> Self {
        Self::with_scope(
            Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("mailposture:sender:{name}").as_bytes()),
            name,
            category,
            SenderScope::Global,
        )
    }

    pub fn for_organization(org: OrgId, name: &str, category: SenderCategory) -> Self {
        Self::with_scope(Uuid::new_v4(), name, category, SenderScope::Organization(org))
    }

    fn with_scope(id: Uuid, name: &str, category: SenderCategory, scope: SenderScope) -> Self {
        Self {
            id,
            name: name.to_string(),
            category,
            scope,
            spf_include: None,
            ip_ranges: Vec::new(),
            dkim_domains: Vec::new(),
            logo_url: None,
            website: None,
            ip_ranges_updated_at: None,
        }
    }

    pub fn spf_include(mut self, include: &str) -> Self {
        self.spf_include = Some(include.to_ascii_lowercase());
        self
    }

    pub fn ip_ranges<I, S>(mut self, ranges: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ip_ranges = ranges.into_iter().map(Into::into).collect();
        self
    }

    pub fn dkim_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dkim_domains = domains.into_iter().map(Into::into).collect();
        self
    }

    pub fn website(mut self, url: &str) -> Self {
        self.website = Some(url.to_string());
        self
    }

    pub fn logo_url(mut self, url: &str) -> Self {
        self.logo_url = Some(url.to_string());
        self
    }

    pub fn is_global(&self) -> bool {
        self.scope == SenderScope::Global
    }

    pub fn is_visible_to(&self, org: OrgId) -> bool {
        match self.scope {
            SenderScope::Global => true,
            SenderScope::Organization(owner) => owner == org,
        }
    }

    /// Whether `actor` may change this entry's data.
    pub fn is_writable_by(&self, actor: CatalogActor) -> bool {
        match (actor, self.scope) {
            (CatalogActor::System, _) => true,
            (CatalogActor::Organization(org), SenderScope::Organization(owner)) => org == owner,
            (CatalogActor::Organization(_), SenderScope::Global) => false,
        }
    }

    pub fn descriptor(&self) -> SenderRef {
        SenderRef {
            id: self.id,
            name: self.name.clone(),
            category: self.category,
            logo: self.logo_url.clone(),
            website: self.website.clone(),
        }
    }
}

/// Minimal sender description attached to classification matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderRef {
    pub id: Uuid,
    pub name: String,
    pub category: SenderCategory,
    pub logo: Option<String>,
    pub website: Option<String>,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("known sender {0} not found")]
    NotFound(Uuid),

    #[error("known sender {0} is global and cannot be modified by an organization")]
    GlobalImmutable(Uuid),

    #[error("known sender {0} belongs to another organization")]
    ForeignSender(Uuid),

    #[error("known sender {0} has no SPF include to resolve")]
    NoSpfInclude(Uuid),

    #[error("catalog backend error: {0}")]
    Backend(String),
}

/// Persistence interface for the sender catalog.
#[async_trait]
pub trait SenderCatalog: Send + Sync {
    /// Global entries followed by the entries owned by `org`.
    async fn visible_to(&self, org: OrgId) -> Result<Vec<KnownSender>, CatalogError>;

    async fn get(&self, id: Uuid) -> Result<Option<KnownSender>, CatalogError>;

    /// Insert or replace global entries. Deployment-time only.
    async fn seed_global(&self, senders: Vec<KnownSender>) -> Result<(), CatalogError>;

    /// Create or update an entry owned by `org`. The stored scope is always `org`.
    async fn save_org_sender(
        &self,
        org: OrgId,
        sender: KnownSender,
    ) -> Result<KnownSender, CatalogError>;

    async fn delete_org_sender(&self, org: OrgId, id: Uuid) -> Result<(), CatalogError>;

    /// Replace the resolved ranges of an entry and stamp the refresh time.
    async fn store_ip_ranges(
        &self,
        actor: CatalogActor,
        id: Uuid,
        ranges: Vec<String>,
        at: DateTime<Utc>,
    ) -> Result<KnownSender, CatalogError>;
}

/// In-memory catalog. Entries keep insertion order, which is also the
/// classifier's first-match order within a tier.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    senders: RwLock<Vec<KnownSender>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog pre-seeded with [`builtin_senders`].
    pub fn with_builtin() -> Self {
        Self {
            senders: RwLock::new(builtin_senders()),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Vec<KnownSender>>, CatalogError> {
        self.senders
            .read()
            .map_err(|e| CatalogError::Backend(e.to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Vec<KnownSender>>, CatalogError> {
        self.senders
            .write()
            .map_err(|e| CatalogError::Backend(e.to_string()))
    }
}

#[async_trait]
impl SenderCatalog for MemoryCatalog {
    async fn visible_to(&self, org: OrgId) -> Result<Vec<KnownSender>, CatalogError> {
        let senders = self.read()?;
        let global = senders.iter().filter(|s| s.is_global());
        let owned = senders
            .iter()
            .filter(|s| s.scope == SenderScope::Organization(org));
        Ok(global.chain(owned).cloned().collect())
    }

    async fn get(&self, id: Uuid) -> Result<Option<KnownSender>, CatalogError> {
        Ok(self.read()?.iter().find(|s| s.id == id).cloned())
    }

    async fn seed_global(&self, seeds: Vec<KnownSender>) -> Result<(), CatalogError> {
        let mut senders = self.write()?;
        for mut seed in seeds {
            seed.scope = SenderScope::Global;
            match senders.iter_mut().find(|s| s.id == seed.id) {
                Some(existing) => *existing = seed,
                None => senders.push(seed),
            }
        }
        Ok(())
    }

    async fn save_org_sender(
        &self,
        org: OrgId,
        mut sender: KnownSender,
    ) -> Result<KnownSender, CatalogError> {
        let mut senders = self.write()?;
        sender.scope = SenderScope::Organization(org);
        match senders.iter_mut().find(|s| s.id == sender.id) {
            Some(existing) if existing.is_global() => Err(CatalogError::GlobalImmutable(sender.id)),
            Some(existing) if !existing.is_visible_to(org) => {
                Err(CatalogError::ForeignSender(sender.id))
            }
            Some(existing) => {
                *existing = sender.clone();
                info!(org = %org, sender = %sender.name, "known sender updated");
                Ok(sender)
            }
            None => {
                senders.push(sender.clone());
                info!(org = %org, sender = %sender.name, "known sender created");
                Ok(sender)
            }
        }
    }

    async fn delete_org_sender(&self, org: OrgId, id: Uuid) -> Result<(), CatalogError> {
        let mut senders = self.write()?;
        let pos = senders
            .iter()
            .position(|s| s.id == id)
            .ok_or(CatalogError::NotFound(id))?;
        let sender = &senders[pos];
        if sender.is_global() {
            return Err(CatalogError::GlobalImmutable(id));
        }
        if !sender.is_visible_to(org) {
            return Err(CatalogError::ForeignSender(id));
        }
        let removed = senders.remove(pos);
        info!(org = %org, sender = %removed.name, "known sender deleted");
        Ok(())
    }

    async fn store_ip_ranges(
        &self,
        actor: CatalogActor,
        id: Uuid,
        ranges: Vec<String>,
        at: DateTime<Utc>,
    ) -> Result<KnownSender, CatalogError> {
        let mut senders = self.write()?;
        let sender = senders
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(CatalogError::NotFound(id))?;
        ensure_writable(sender, actor)?;
        sender.ip_ranges = ranges;
        sender.ip_ranges_updated_at = Some(at);
        Ok(sender.clone())
    }
}

/// Reject writes the actor is not entitled to.
pub fn ensure_writable(sender: &KnownSender, actor: CatalogActor) -> Result<(), CatalogError> {
    if sender.is_writable_by(actor) {
        Ok(())
    } else if sender.is_global() {
        Err(CatalogError::GlobalImmutable(sender.id))
    } else {
        Err(CatalogError::ForeignSender(sender.id))
    }
}

/// Global entries seeded at deployment. Ranges are a starting point and are
/// replaced by the include resolver on refresh.
pub fn builtin_senders() -> Vec<KnownSender> {
    use SenderCategory::*;

    vec![
        KnownSender::global("Google Workspace", EmailProvider)
            .spf_include("_spf.google.com")
            .ip_ranges(["35.190.247.0/24", "64.233.160.0/19", "66.102.0.0/20", "74.125.0.0/16", "209.85.128.0/17"])
            .dkim_domains(["google.com"])
            .website("https://workspace.google.com"),
        KnownSender::global("Microsoft 365", EmailProvider)
            .spf_include("spf.protection.outlook.com")
            .ip_ranges(["40.92.0.0/15", "40.107.0.0/16", "52.100.0.0/14", "104.47.0.0/17"])
            .dkim_domains(["onmicrosoft.com"])
            .website("https://www.microsoft.com/microsoft-365"),
        KnownSender::global("SendGrid", Transactional)
            .spf_include("sendgrid.net")
            .ip_ranges(["167.89.0.0/17", "149.72.0.0/16", "208.117.48.0/20", "50.31.32.0/19"])
            .dkim_domains(["sendgrid.net"])
            .website("https://sendgrid.com"),
        KnownSender::global("Mailgun", Transactional)
            .spf_include("mailgun.org")
            .ip_ranges(["209.61.151.0/24", "166.78.68.0/22", "198.61.254.0/23"])
            .dkim_domains(["mailgun.org"])
            .website("https://www.mailgun.com"),
        KnownSender::global("Amazon SES", Transactional)
            .spf_include("amazonses.com")
            .ip_ranges(["54.240.0.0/18", "199.255.192.0/22"])
            .dkim_domains(["amazonses.com"])
            .website("https://aws.amazon.com/ses"),
        KnownSender::global("Mailchimp", Marketing)
            .spf_include("servers.mcsv.net")
            .ip_ranges(["205.201.128.0/20", "198.2.128.0/18", "148.105.8.0/21"])
            .dkim_domains(["mcsv.net", "mandrillapp.com"])
            .website("https://mailchimp.com"),
        KnownSender::global("Postmark", Transactional)
            .spf_include("spf.mtasv.net")
            .ip_ranges(["50.31.156.96/27", "104.245.209.192/26"])
            .dkim_domains(["mtasv.net"])
            .website("https://postmarkapp.com"),
        KnownSender::global("SparkPost", Transactional)
            .spf_include("sparkpostmail.com")
            .ip_ranges(["192.174.80.0/20"])
            .dkim_domains(["sparkpostmail.com"])
            .website("https://www.sparkpost.com"),
        KnownSender::global("Zendesk", Support)
            .spf_include("mail.zendesk.com")
            .ip_ranges(["192.161.144.0/20", "216.198.0.0/18"])
            .dkim_domains(["zendesk.com"])
            .website("https://www.zendesk.com"),
        KnownSender::global("Salesforce", Crm)
            .spf_include("_spf.salesforce.com")
            .ip_ranges(["13.110.208.0/21", "13.111.0.0/16"])
            .dkim_domains(["salesforce.com"])
            .website("https://www.salesforce.com"),
    ]
}
