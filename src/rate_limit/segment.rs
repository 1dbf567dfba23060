//! Resolves which counter a request is charged against

use super::policy::{RateLimitPolicy, Segment};
use super::RateLimitError;
use crate::domain::types::OrganizationId;
use std::collections::BTreeMap;

/// Value identifying the segment instance, e.g. `user=alice`
pub fn segment_value(
    segment: &Segment,
    user_id: Option<&str>,
    properties: &BTreeMap<String, String>,
) -> Result<String, RateLimitError> {
    match segment {
        Segment::Global => Ok("global".to_string()),
        Segment::User => user_id
            .filter(|id| !id.is_empty())
            .map(|id| format!("user={id}"))
            .ok_or(RateLimitError::MissingUserId),
        Segment::Property(name) => properties
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| format!("{}={value}", name.to_ascii_lowercase()))
            .ok_or_else(|| RateLimitError::MissingHeader {
                property: name.clone(),
            }),
    }
}

/// Deterministic counter key; never shared across organizations
pub fn segment_key(
    organization_id: &OrganizationId,
    policy: &RateLimitPolicy,
    user_id: Option<&str>,
    properties: &BTreeMap<String, String>,
) -> Result<String, RateLimitError> {
    let value = segment_value(&policy.segment, user_id, properties)?;
    Ok(format!("{}:{}:{value}", organization_id.as_ref(), policy.unit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::policy::RateLimitUnit;

    fn org() -> OrganizationId {
        OrganizationId::try_new("org-1").unwrap()
    }

    #[test]
    fn global_segment() {
        let policy = RateLimitPolicy::new(10.0, 60, RateLimitUnit::Request, Segment::Global);
        let key = segment_key(&org(), &policy, None, &BTreeMap::new()).unwrap();
        assert_eq!(key, "org-1:request:global");
    }

    #[test]
    fn user_segment_requires_user_id() {
        let policy = RateLimitPolicy::new(10.0, 60, RateLimitUnit::Cents, Segment::User);
        assert!(matches!(
            segment_key(&org(), &policy, None, &BTreeMap::new()),
            Err(RateLimitError::MissingUserId)
        ));
        let key = segment_key(&org(), &policy, Some("alice"), &BTreeMap::new()).unwrap();
        assert_eq!(key, "org-1:cents:user=alice");
    }

    #[test]
    fn property_segment_requires_header() {
        let policy = RateLimitPolicy::new(
            10.0,
            60,
            RateLimitUnit::Request,
            Segment::Property("Tenant".to_string()),
        );
        assert!(matches!(
            segment_value(&policy.segment, None, &BTreeMap::new()),
            Err(RateLimitError::MissingHeader { .. })
        ));

        let properties = BTreeMap::from([("tenant".to_string(), "acme".to_string())]);
        let key = segment_key(&org(), &policy, None, &properties).unwrap();
        assert_eq!(key, "org-1:request:tenant=acme");
    }

    #[test]
    fn organizations_never_share_keys() {
        let policy = RateLimitPolicy::new(10.0, 60, RateLimitUnit::Request, Segment::Global);
        let other = OrganizationId::try_new("org-2").unwrap();
        assert_ne!(
            segment_key(&org(), &policy, None, &BTreeMap::new()).unwrap(),
            segment_key(&other, &policy, None, &BTreeMap::new()).unwrap()
        );
    }
}
