//! Persistence interface for monitored domains.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use crate::verify::DomainRecord;
use crate::OrgId;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("domain {domain} is not registered")]
    NotFound { domain: String },

    #[error("domain {domain} is already registered for this organization")]
    Duplicate { domain: String },

    #[error("domain store backend error: {0}")]
    Backend(String),
}

/// Domain records keyed by organization and normalized domain name.
#[async_trait]
pub trait DomainStore: Send + Sync {
    async fn get(&self, org: OrgId, domain: &str) -> Result<Option<DomainRecord>, StoreError>;

    /// Store a new record. Fails with [`StoreError::Duplicate`] when the
    /// organization already has the domain.
    async fn insert(&self, record: DomainRecord) -> Result<(), StoreError>;

    /// Overwrite an existing record. A stored verification is kept even
    /// when `record` is an unverified copy.
    async fn save(&self, record: &DomainRecord) -> Result<(), StoreError>;

    /// Replace only the cached DNS fields of a stored record and return it.
    async fn update_cached_records(
        &self,
        org: OrgId,
        domain: &str,
        cached: CachedRecords,
    ) -> Result<DomainRecord, StoreError>;

    async fn list(&self, org: OrgId) -> Result<Vec<DomainRecord>, StoreError>;
}

/// Result of a DNS refresh, written without touching verification state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedRecords {
    pub spf_record: Option<String>,
    pub dmarc_record: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct MemoryDomainStore {
    records: RwLock<HashMap<(OrgId, String), DomainRecord>>,
}

impl MemoryDomainStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[async_trait]
impl DomainStore for MemoryDomainStore {
    async fn get(&self, org: OrgId, domain: &str) -> Result<Option<DomainRecord>, StoreError> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records.get(&(org, domain.to_string())).cloned())
    }

    async fn insert(&self, record: DomainRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(poisoned)?;
        let key = (record.organization_id, record.domain.clone());
        if records.contains_key(&key) {
            return Err(StoreError::Duplicate {
                domain: record.domain,
            });
        }
        debug!(org = %record.organization_id, domain = %record.domain, "domain stored");
        records.insert(key, record);
        Ok(())
    }

    async fn save(&self, record: &DomainRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(poisoned)?;
        match records.get_mut(&(record.organization_id, record.domain.clone())) {
            Some(existing) => {
                let mut record = record.clone();
                record.keep_verification_of(existing);
                *existing = record;
                Ok(())
            }
            None => Err(StoreError::NotFound {
                domain: record.domain.clone(),
            }),
        }
    }

    async fn update_cached_records(
        &self,
        org: OrgId,
        domain: &str,
        cached: CachedRecords,
    ) -> Result<DomainRecord, StoreError> {
        let mut records = self.records.write().map_err(poisoned)?;
        let record = records
            .get_mut(&(org, domain.to_string()))
            .ok_or_else(|| StoreError::NotFound {
                domain: domain.to_string(),
            })?;
        record.spf_record = cached.spf_record;
        record.dmarc_record = cached.dmarc_record;
        record.last_checked_at = Some(cached.checked_at);
        Ok(record.clone())
    }

    async fn list(&self, org: OrgId) -> Result<Vec<DomainRecord>, StoreError> {
        let records = self.records.read().map_err(poisoned)?;
        let mut owned: Vec<DomainRecord> = records
            .values()
            .filter(|r| r.organization_id == org)
            .cloned()
            .collect();
        owned.sort_by(|a, b| a.domain.cmp(&b.domain));
        Ok(owned)
    }
}
