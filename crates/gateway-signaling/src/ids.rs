//! Gateway-assigned numeric ids.
//!
//! Session and handle ids are large integers. Some gateway builds encode them
//! as floating point, so a parsed id may be one more than the id the gateway
//! actually means; the raw frame is consulted to undo that.

use serde_json::Value;

pub fn parse_id(value: &Value) -> Option<u64> {
    if let Some(id) = value.as_u64() {
        return Some(id);
    }
    let float = value.as_f64()?;
    if !float.is_finite() || float < 0.0 || float > u64::MAX as f64 {
        return None;
    }
    Some(float.round() as u64)
}

/// If `raw` does not contain the digits of `parsed` but does contain those of
/// `parsed - 1`, the smaller value is the real id.
pub fn reconcile_id(raw: &str, parsed: u64) -> u64 {
    if parsed == 0 || raw.contains(&parsed.to_string()) {
        return parsed;
    }
    let lower = parsed - 1;
    if raw.contains(&lower.to_string()) {
        tracing::debug!(
            target: "hub_remote::gateway",
            parsed,
            corrected = lower,
            "corrected rounded gateway id"
        );
        lower
    } else {
        parsed
    }
}

/// Unsolicited events are matched with one unit of slack either way.
pub fn matches_with_slack(stored: u64, incoming: u64) -> bool {
    stored.abs_diff(incoming) <= 1
}
