//! Request snapshot and the validated types it is built from

pub mod request;
pub mod types;

pub use request::{
    CacheDirectives, ProviderTarget, ProxyRequest, RequestFlags, TokenLimitHandler,
};
pub use types::{BucketSize, EscrowHold, OrganizationId, ProviderName, RequestId};
