//! Request extractors

pub mod tenant;

pub use tenant::{TenantId, TENANT_HEADER};
