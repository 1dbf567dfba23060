//! Pure admission decision shared by every rate-limit backend

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Ok,
    RateLimited,
}

/// Window state as seen by a backend at the moment of the call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionInput {
    pub current_usage: f64,
    pub unit_count: f64,
    pub quota: f64,
    /// Oldest usage timestamp still inside the window, if any
    pub oldest_timestamp_ms: Option<i64>,
    pub window_ms: i64,
    pub now_ms: i64,
    pub check_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Decision {
    pub status: DecisionStatus,
    pub limit: f64,
    pub remaining: f64,
    /// Seconds until the oldest entry leaves the window
    pub reset_secs: Option<u64>,
    pub current_usage: f64,
}

impl Decision {
    pub fn is_rate_limited(&self) -> bool {
        self.status == DecisionStatus::RateLimited
    }

    /// Decision reported when enforcement could not be reached
    pub fn fail_open(quota: f64) -> Self {
        Self {
            status: DecisionStatus::Ok,
            limit: quota,
            remaining: 0.0,
            reset_secs: None,
            current_usage: 0.0,
        }
    }

    /// Whether the caller must record usage for this call
    pub fn records_usage(&self, input: &DecisionInput) -> bool {
        !input.check_only && !self.is_rate_limited()
    }
}

/// Applies the sliding-window rule to one call.
///
/// Reaching the quota exactly counts as exceeding it. `remaining` reflects
/// the window before this call unless the call is admitted and recorded.
pub fn evaluate(input: &DecisionInput) -> Decision {
    let would_exceed = input.current_usage + input.unit_count >= input.quota;
    let remaining_before = (input.quota - input.current_usage).max(0.0);

    let reset_secs = input.oldest_timestamp_ms.map(|oldest| {
        let millis = oldest.saturating_add(input.window_ms) - input.now_ms;
        let secs = (millis as f64 / 1000.0).ceil();
        if secs > 0.0 {
            secs as u64
        } else {
            0
        }
    });

    if would_exceed {
        return Decision {
            status: DecisionStatus::RateLimited,
            limit: input.quota,
            remaining: remaining_before,
            reset_secs,
            current_usage: input.current_usage,
        };
    }

    let (remaining, current_usage) = if input.check_only {
        (remaining_before, input.current_usage)
    } else {
        (
            (remaining_before - input.unit_count).max(0.0),
            input.current_usage + input.unit_count,
        )
    };

    Decision {
        status: DecisionStatus::Ok,
        limit: input.quota,
        remaining,
        reset_secs,
        current_usage,
    }
}
