//! Rate-limit policy strings and account-level policy selection
//!
//! Format: `<quota>;w=<window_seconds>[;u=request|token|cents|dollar][;s=<segment>]`

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// What one unit of usage measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitUnit {
    Request,
    Token,
    Cents,
}

impl RateLimitUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Token => "token",
            Self::Cents => "cents",
        }
    }

    /// Cost-based units only know their cost after the provider responds
    pub fn is_cost_based(&self) -> bool {
        !matches!(self, Self::Request)
    }
}

impl fmt::Display for RateLimitUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Partition a policy counts against
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Segment {
    Global,
    User,
    /// Named custom request property
    Property(String),
}

impl Segment {
    fn tier(&self) -> u8 {
        match self {
            Self::Property(_) => 0,
            Self::User => 1,
            Self::Global => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub quota: f64,
    pub window_seconds: u64,
    pub unit: RateLimitUnit,
    pub segment: Segment,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyParseError {
    #[error("Malformed rate limit policy: {0}")]
    Malformed(String),

    #[error("Invalid quota: {0}")]
    InvalidQuota(String),

    #[error("Invalid window: {0}")]
    InvalidWindow(String),

    #[error("Unknown unit: {0}")]
    UnknownUnit(String),

    #[error("Invalid segment: {0}")]
    InvalidSegment(String),

    #[error("Unknown policy parameter: {0}")]
    UnknownParameter(String),
}

fn is_plain_decimal(text: &str) -> bool {
    let mut parts = text.splitn(2, '.');
    let whole = parts.next().unwrap_or_default();
    let fraction = parts.next();
    !whole.is_empty()
        && whole.chars().all(|c| c.is_ascii_digit())
        && fraction.is_none_or(|f| !f.is_empty() && f.chars().all(|c| c.is_ascii_digit()))
}

fn parse_segment(raw: &str) -> Result<Segment, PolicyParseError> {
    if raw.eq_ignore_ascii_case("user") {
        return Ok(Segment::User);
    }
    if raw.eq_ignore_ascii_case("global") {
        return Ok(Segment::Global);
    }
    let valid = !raw.is_empty()
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(Segment::Property(raw.to_string()))
    } else {
        Err(PolicyParseError::InvalidSegment(raw.to_string()))
    }
}

impl FromStr for RateLimitPolicy {
    type Err = PolicyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let policy = s.trim();
        if policy.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(PolicyParseError::Malformed(policy.to_string()));
        }

        let mut parts = policy.split(';');
        let quota_text = parts.next().unwrap_or_default();
        if !is_plain_decimal(quota_text) {
            return Err(PolicyParseError::InvalidQuota(quota_text.to_string()));
        }
        let mut quota: f64 = quota_text
            .parse()
            .map_err(|_| PolicyParseError::InvalidQuota(quota_text.to_string()))?;

        let mut window_seconds = None;
        let mut unit = None;
        let mut segment = None;

        for part in parts {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| PolicyParseError::Malformed(part.to_string()))?;
            match key {
                "w" if window_seconds.is_none() => {
                    let window = value
                        .parse::<u64>()
                        .ok()
                        .filter(|w| *w > 0)
                        .ok_or_else(|| PolicyParseError::InvalidWindow(value.to_string()))?;
                    window_seconds = Some(window);
                }
                "u" if unit.is_none() => {
                    let parsed = match value.to_ascii_lowercase().as_str() {
                        "request" => RateLimitUnit::Request,
                        "token" => RateLimitUnit::Token,
                        "cents" => RateLimitUnit::Cents,
                        "dollar" => {
                            quota *= 100.0;
                            RateLimitUnit::Cents
                        }
                        _ => return Err(PolicyParseError::UnknownUnit(value.to_string())),
                    };
                    unit = Some(parsed);
                }
                "s" if segment.is_none() => segment = Some(parse_segment(value)?),
                other => return Err(PolicyParseError::UnknownParameter(other.to_string())),
            }
        }

        let window_seconds = window_seconds
            .ok_or_else(|| PolicyParseError::Malformed(format!("missing window in '{policy}'")))?;

        Ok(Self {
            quota,
            window_seconds,
            unit: unit.unwrap_or(RateLimitUnit::Request),
            segment: segment.unwrap_or(Segment::Global),
        })
    }
}

impl RateLimitPolicy {
    pub fn new(quota: f64, window_seconds: u64, unit: RateLimitUnit, segment: Segment) -> Self {
        Self {
            quota,
            window_seconds,
            unit,
            segment,
        }
    }

    pub fn window_ms(&self) -> i64 {
        i64::try_from(self.window_seconds.saturating_mul(1000)).unwrap_or(i64::MAX)
    }

    /// Canonical policy string echoed in the `Helicone-RateLimit-Policy` header
    pub fn to_policy_string(&self) -> String {
        let mut policy = if self.quota.fract() == 0.0 {
            format!("{};w={}", self.quota as u64, self.window_seconds)
        } else {
            format!("{};w={}", self.quota, self.window_seconds)
        };
        if self.unit != RateLimitUnit::Request {
            policy.push_str(";u=");
            policy.push_str(self.unit.as_str());
        }
        match &self.segment {
            Segment::Global => {}
            Segment::User => policy.push_str(";s=user"),
            Segment::Property(name) => {
                policy.push_str(";s=");
                policy.push_str(name);
            }
        }
        policy
    }

    /// Requests per minute this policy allows, used to rank competing policies
    pub fn effective_rpm(&self) -> f64 {
        if self.quota <= 0.0 {
            0.0
        } else if self.window_seconds == 0 {
            f64::INFINITY
        } else {
            self.quota / self.window_seconds as f64 * 60.0
        }
    }

    fn applies_to(&self, user_id: Option<&str>, properties: &BTreeMap<String, String>) -> bool {
        match &self.segment {
            Segment::Global => true,
            Segment::User => user_id.is_some_and(|id| !id.is_empty()),
            Segment::Property(name) => properties.keys().any(|key| key.eq_ignore_ascii_case(name)),
        }
    }
}

/// Picks the account-level policy for a request.
///
/// Property policies win over user policies, which win over global ones.
/// Within a tier the most restrictive (lowest requests-per-minute) policy is used.
pub fn select_policy<'a>(
    policies: &'a [RateLimitPolicy],
    user_id: Option<&str>,
    properties: &BTreeMap<String, String>,
) -> Option<&'a RateLimitPolicy> {
    policies
        .iter()
        .filter(|policy| policy.applies_to(user_id, properties))
        .min_by(|a, b| {
            a.segment
                .tier()
                .cmp(&b.segment.tier())
                .then(a.effective_rpm().total_cmp(&b.effective_rpm()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("1000;w=3600", 1000.0, 3600, RateLimitUnit::Request, Segment::Global)]
    #[case("500;w=60;u=request", 500.0, 60, RateLimitUnit::Request, Segment::Global)]
    #[case("5000;w=86400;u=cents", 5000.0, 86400, RateLimitUnit::Cents, Segment::Global)]
    #[case("20;w=60;u=dollar", 2000.0, 60, RateLimitUnit::Cents, Segment::Global)]
    #[case("100000;w=60;u=token", 100000.0, 60, RateLimitUnit::Token, Segment::Global)]
    #[case("100;w=60;s=USER", 100.0, 60, RateLimitUnit::Request, Segment::User)]
    #[case(
        "5000;w=3600;u=cents;s=tenant-id",
        5000.0,
        3600,
        RateLimitUnit::Cents,
        Segment::Property("tenant-id".to_string())
    )]
    #[case("0.5;w=60;u=CENTS", 0.5, 60, RateLimitUnit::Cents, Segment::Global)]
    #[case("  1000;w=3600  ", 1000.0, 3600, RateLimitUnit::Request, Segment::Global)]
    fn parses_valid_policies(
        #[case] input: &str,
        #[case] quota: f64,
        #[case] window: u64,
        #[case] unit: RateLimitUnit,
        #[case] segment: Segment,
    ) {
        let policy: RateLimitPolicy = input.parse().unwrap();
        assert_eq!(policy, RateLimitPolicy::new(quota, window, unit, segment));
    }

    #[rstest]
    #[case(";w=3600")]
    #[case("1000")]
    #[case("abc;w=3600")]
    #[case("-100;w=3600")]
    #[case("1e10;w=60")]
    #[case("100;w=0")]
    #[case("100;w=1.5")]
    #[case("100;w=60;u=tokens")]
    #[case("100;w=60;x=extra")]
    #[case("100;w=60;w=120")]
    #[case("100:w=60")]
    #[case("100;w=60\n;s=user")]
    #[case("100;w=60;s=../../../etc/passwd")]
    #[case("100;w=60;s='; DROP TABLE users;--")]
    fn rejects_malformed_policies(#[case] input: &str) {
        assert!(input.parse::<RateLimitPolicy>().is_err(), "{input}");
    }

    #[rstest]
    #[case("1000;w=3600")]
    #[case("5000;w=86400;u=cents")]
    #[case("100;w=60;s=user")]
    #[case("5000;w=3600;u=cents;s=tenant")]
    #[case("0.5;w=60;u=cents")]
    fn policy_string_is_canonical(#[case] input: &str) {
        let policy: RateLimitPolicy = input.parse().unwrap();
        assert_eq!(policy.to_policy_string(), input);
    }

    #[test]
    fn effective_rpm_edge_cases() {
        let unlimited = RateLimitPolicy::new(10.0, 0, RateLimitUnit::Request, Segment::Global);
        assert!(unlimited.effective_rpm().is_infinite());

        let blocked = RateLimitPolicy::new(0.0, 0, RateLimitUnit::Request, Segment::Global);
        assert_eq!(blocked.effective_rpm(), 0.0);

        let hourly = RateLimitPolicy::new(600.0, 3600, RateLimitUnit::Request, Segment::Global);
        assert_eq!(hourly.effective_rpm(), 10.0);
    }

    #[test]
    fn selection_prefers_property_then_user_then_global() {
        let policies = vec![
            RateLimitPolicy::new(10.0, 60, RateLimitUnit::Request, Segment::Global),
            RateLimitPolicy::new(100.0, 60, RateLimitUnit::Request, Segment::User),
            RateLimitPolicy::new(
                1000.0,
                60,
                RateLimitUnit::Request,
                Segment::Property("tenant".to_string()),
            ),
        ];
        let mut properties = BTreeMap::new();

        let selected = select_policy(&policies, None, &properties).unwrap();
        assert_eq!(selected.segment, Segment::Global);

        let selected = select_policy(&policies, Some("u-1"), &properties).unwrap();
        assert_eq!(selected.segment, Segment::User);

        properties.insert("Tenant".to_string(), "acme".to_string());
        let selected = select_policy(&policies, Some("u-1"), &properties).unwrap();
        assert_eq!(selected.segment, Segment::Property("tenant".to_string()));
    }

    #[test]
    fn selection_breaks_ties_by_lowest_rpm() {
        let policies = vec![
            RateLimitPolicy::new(100.0, 60, RateLimitUnit::Request, Segment::Global),
            RateLimitPolicy::new(600.0, 3600, RateLimitUnit::Request, Segment::Global),
            RateLimitPolicy::new(5.0, 0, RateLimitUnit::Request, Segment::Global),
        ];
        let selected = select_policy(&policies, None, &BTreeMap::new()).unwrap();
        assert_eq!(selected.window_seconds, 3600);
    }

    #[test]
    fn no_applicable_policy() {
        let policies = vec![RateLimitPolicy::new(
            1.0,
            60,
            RateLimitUnit::Request,
            Segment::User,
        )];
        assert!(select_policy(&policies, None, &BTreeMap::new()).is_none());
    }
}
