//! Validated newtypes shared across the pipeline
//!
//! Values enter through the inbound mapper or configuration and are
//! validated once at that boundary.

use nutype::nutype;
#[allow(unused_imports)] // These are used by nutype derive macros
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Largest number of parallel cache slots a request identity may use
pub const MAX_BUCKET_SIZE: u8 = 20;

/// Correlates the client response, the deferred log record and billing
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    AsRef
))]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::generate()
    }
}

/// Tenant identifier; namespaces every cache entry and rate-limit segment
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 256),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        AsRef,
        Display
    )
)]
pub struct OrganizationId(String);

/// Registry name of an upstream provider, e.g. `openai`
#[nutype(
    sanitize(trim, lowercase),
    validate(not_empty, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        AsRef,
        Display
    )
)]
pub struct ProviderName(String);

/// Number of cache slots for one request identity
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 20),
    default = 1,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Serialize,
        Deserialize,
        Display,
        Default
    )
)]
pub struct BucketSize(u8);

impl BucketSize {
    pub fn slots(&self) -> usize {
        usize::from(self.into_inner())
    }
}

/// Billing hold placed before the provider call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowHold {
    pub escrow_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique() {
        assert_ne!(RequestId::generate(), RequestId::generate());
    }

    #[test]
    fn organization_id_is_trimmed_and_required() {
        let org = OrganizationId::try_new("  org-1 ").unwrap();
        assert_eq!(org.as_ref(), "org-1");
        assert!(OrganizationId::try_new("   ").is_err());
    }

    #[test]
    fn provider_name_is_lowercased() {
        let name = ProviderName::try_new("OpenAI").unwrap();
        assert_eq!(name.as_ref(), "openai");
    }

    #[test]
    fn bucket_size_bounds() {
        assert!(BucketSize::try_new(0).is_err());
        assert!(BucketSize::try_new(MAX_BUCKET_SIZE + 1).is_err());
        assert_eq!(BucketSize::try_new(MAX_BUCKET_SIZE).unwrap().slots(), 20);
        assert_eq!(BucketSize::default().slots(), 1);
    }
}
