//! Dynamic Datadog key issuance: roles, admin configuration, and the lease lifecycle.

pub mod models;
pub mod service;
pub mod store;

pub use models::{IssuedCredentialSet, KeyType, Lease, ProviderConfig, Role, RoleRequest};
pub use service::KeyEngine;
pub use store::{ConfigStore, RoleStore};
