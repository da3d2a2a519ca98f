//! SPF term scanning and include flattening.

pub mod mechanism;
pub mod resolve;

pub use mechanism::{scan_terms, Qualifier, SpfTerm};
pub use resolve::{resolve_include, SpfResolution};
