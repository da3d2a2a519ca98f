//! Email authentication posture for monitored domains: SPF, DKIM and DMARC
//! record lookup, domain ownership verification, SPF include flattening and
//! known-sender classification.
//!
//! DNS access goes through the `DnsResolver` trait. Persistence goes through
//! `DomainStore` and `SenderCatalog`; in-memory implementations of both ship
//! with the crate.

pub mod catalog;
pub mod classify;
pub mod common;
pub mod config;
pub mod dkim;
pub mod engine;
pub mod error;
pub mod record;
pub mod spf;
pub mod status;
pub mod store;
pub mod verify;

/// Organization identifier used to scope domains and catalog entries.
pub type OrgId = uuid::Uuid;

pub use catalog::{builtin_senders, CatalogActor, KnownSender, MemoryCatalog, SenderCatalog};
pub use classify::{classify, Classification, ClassificationMatch, MechanismType};
pub use common::dns::{DnsError, DnsResolver, HickoryResolver, MockResolver};
pub use config::EngineConfig;
pub use engine::{PostureEngine, RangeRefresh};
pub use error::{EngineError, Result};
pub use record::{LookupRequest, LookupResponse, RecordKind};
pub use spf::SpfResolution;
pub use status::DomainStatus;
pub use store::{DomainStore, MemoryDomainStore};
pub use verify::DomainRecord;
