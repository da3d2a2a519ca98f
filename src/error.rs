use thiserror::Error;

use crate::catalog::CatalogError;
use crate::common::dns::DnsError;
use crate::config::ConfigError;
use crate::record::RecordKind;
use crate::store::StoreError;
use crate::verify::VerifyError;

/// Crate-level failure. Soft misses and "no match" never show up here.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid domain: {0:?}")]
    InvalidDomain(String),

    #[error("invalid DKIM selector: {0:?}")]
    InvalidSelector(String),

    #[error("a selector is required for DKIM lookups")]
    SelectorRequired,

    #[error("a selector is only allowed for DKIM lookups, not {0}")]
    SelectorNotAllowed(RecordKind),

    #[error("unsupported record type: {0:?}")]
    UnsupportedRecordType(String),

    #[error("DNS lookup for {host} failed: {source}")]
    Dns {
        host: String,
        #[source]
        source: DnsError,
    },

    #[error(transparent)]
    Verification(#[from] VerifyError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EngineError {
    pub(crate) fn dns(host: impl Into<String>, source: DnsError) -> Self {
        EngineError::Dns {
            host: host.into(),
            source,
        }
    }

    /// Input rejected before any network call.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidDomain(_)
                | EngineError::InvalidSelector(_)
                | EngineError::SelectorRequired
                | EngineError::SelectorNotAllowed(_)
                | EngineError::UnsupportedRecordType(_)
        )
    }

    /// Transport failures the caller may retry as a whole.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Dns { source, .. } => !source.is_miss(),
            EngineError::Verification(VerifyError::Dns { source, .. }) => !source.is_miss(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
