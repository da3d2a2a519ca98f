//! Common infrastructure shared by the resolvers, the verifier and the classifier.

pub mod cidr;
pub mod dns;
pub mod domain;
