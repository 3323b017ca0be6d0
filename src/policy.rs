use tracing::warn;

use crate::limits::{MAX_LINE_ITEM_CENTS, MAX_POLICY_SPAN_MS};
use crate::model::{Cents, Ms, Tier};

const SECOND: Ms = 1000;
const MINUTE: Ms = 60 * SECOND;
const HOUR: Ms = 60 * MINUTE;

/// Charge applied once checkout is at least `after_ms` past the scheduled end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LateFeeTier {
    pub after_ms: Ms,
    pub fee: Cents,
}

/// Business rules for one deployment. Shared by every site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    /// Length of the initial check-in block and of each renewal.
    pub block_ms: Ms,
    /// Upper bound on a visit's total span, renewals included.
    pub max_stay_ms: Ms,
    /// How long a lane keeps a resource reserved for the customer at the desk.
    pub lane_hold_ms: Ms,
    /// How long a waitlisted customer has to accept an upgrade offer.
    pub offer_hold_ms: Ms,
    pub session_ttl_ms: Ms,
    pub prices: [Cents; 4],
    /// Sorted by `after_ms`, ascending.
    pub late_fees: Vec<LateFeeTier>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            block_ms: 6 * HOUR,
            max_stay_ms: 24 * HOUR,
            lane_hold_ms: 3 * MINUTE,
            offer_hold_ms: 10 * MINUTE,
            session_ttl_ms: 12 * HOUR,
            prices: [1500, 3500, 5000, 7500],
            late_fees: vec![
                LateFeeTier { after_ms: 15 * MINUTE, fee: 1500 },
                LateFeeTier { after_ms: 60 * MINUTE, fee: 3500 },
                LateFeeTier { after_ms: 120 * MINUTE, fee: 5000 },
            ],
        }
    }
}

impl Policy {
    /// Defaults overridden by `CLUBDESK_*` environment variables.
    pub fn from_env() -> Self {
        let mut policy = Self::default();
        if let Some(ms) = env_duration("CLUBDESK_BLOCK_HOURS", HOUR) {
            policy.block_ms = ms;
        }
        if let Some(ms) = env_duration("CLUBDESK_MAX_STAY_HOURS", HOUR) {
            policy.max_stay_ms = ms;
        }
        if let Some(ms) = env_duration("CLUBDESK_LANE_HOLD_SECS", SECOND) {
            policy.lane_hold_ms = ms;
        }
        if let Some(ms) = env_duration("CLUBDESK_OFFER_HOLD_SECS", SECOND) {
            policy.offer_hold_ms = ms;
        }
        if let Some(ms) = env_duration("CLUBDESK_SESSION_HOURS", HOUR) {
            policy.session_ttl_ms = ms;
        }
        for tier in Tier::ALL {
            let var = format!("CLUBDESK_PRICE_{}", tier.as_str().to_uppercase());
            match env_i64(&var) {
                Some(cents) if cents <= MAX_LINE_ITEM_CENTS => policy.prices[tier as usize] = cents,
                Some(cents) => warn!("ignoring {var}={cents}: above {MAX_LINE_ITEM_CENTS}"),
                None => {}
            }
        }
        if let Ok(raw) = std::env::var("CLUBDESK_LATE_FEES") {
            match parse_late_fees(&raw) {
                Ok(tiers) => policy.late_fees = tiers,
                Err(e) => warn!("ignoring CLUBDESK_LATE_FEES: {e}"),
            }
        }
        if policy.block_ms <= 0 || policy.max_stay_ms < policy.block_ms {
            warn!("invalid block/max stay configuration, using defaults");
            let defaults = Self::default();
            policy.block_ms = defaults.block_ms;
            policy.max_stay_ms = defaults.max_stay_ms;
        }
        policy
    }

    pub fn price(&self, tier: Tier) -> Cents {
        self.prices[tier as usize]
    }
}

fn env_i64(var: &str) -> Option<i64> {
    let raw = std::env::var(var).ok()?;
    match raw.trim().parse::<i64>() {
        Ok(v) if v >= 0 => Some(v),
        _ => {
            warn!("ignoring {var}={raw}: expected a non-negative integer");
            None
        }
    }
}

/// `value` units of `unit` ms, if positive and no longer than `MAX_POLICY_SPAN_MS`.
fn scale_duration(value: i64, unit: Ms) -> Option<Ms> {
    value
        .checked_mul(unit)
        .filter(|ms| (1..=MAX_POLICY_SPAN_MS).contains(ms))
}

fn env_duration(var: &str, unit: Ms) -> Option<Ms> {
    let value = env_i64(var)?;
    let ms = scale_duration(value, unit);
    if ms.is_none() {
        warn!("ignoring {var}={value}: out of range, using default");
    }
    ms
}

/// Parse `minutes:cents,minutes:cents,...` into a sorted fee table.
pub fn parse_late_fees(raw: &str) -> Result<Vec<LateFeeTier>, String> {
    let mut tiers = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (minutes, cents) = part
            .split_once(':')
            .ok_or_else(|| format!("expected minutes:cents, got {part:?}"))?;
        let minutes: Ms = minutes
            .trim()
            .parse()
            .map_err(|e| format!("bad minutes in {part:?}: {e}"))?;
        let fee: Cents = cents
            .trim()
            .parse()
            .map_err(|e| format!("bad cents in {part:?}: {e}"))?;
        if minutes < 0 || fee < 0 {
            return Err(format!("negative value in {part:?}"));
        }
        if fee > MAX_LINE_ITEM_CENTS {
            return Err(format!("fee too large in {part:?}"));
        }
        let after_ms = minutes
            .checked_mul(MINUTE)
            .filter(|ms| *ms <= MAX_POLICY_SPAN_MS)
            .ok_or_else(|| format!("minutes out of range in {part:?}"))?;
        tiers.push(LateFeeTier { after_ms, fee });
    }
    tiers.sort_by_key(|t| t.after_ms);
    Ok(tiers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_prices_rise_with_tier() {
        let p = Policy::default();
        assert!(p.price(Tier::Locker) < p.price(Tier::Standard));
        assert!(p.price(Tier::Standard) < p.price(Tier::Double));
        assert!(p.price(Tier::Double) < p.price(Tier::Special));
        assert!(p.max_stay_ms >= p.block_ms);
    }

    #[test]
    fn parse_late_fees_sorts_tiers() {
        let tiers = parse_late_fees("60:3500, 15:1500").unwrap();
        assert_eq!(
            tiers,
            vec![
                LateFeeTier { after_ms: 15 * MINUTE, fee: 1500 },
                LateFeeTier { after_ms: 60 * MINUTE, fee: 3500 },
            ]
        );
    }

    #[test]
    fn parse_late_fees_empty_means_no_fees() {
        assert!(parse_late_fees("").unwrap().is_empty());
    }

    #[test]
    fn parse_late_fees_rejects_garbage() {
        assert!(parse_late_fees("15").is_err());
        assert!(parse_late_fees("x:100").is_err());
        assert!(parse_late_fees("15:-1").is_err());
    }

    #[test]
    fn parse_late_fees_rejects_overflowing_minutes() {
        assert!(parse_late_fees("153722867280912931:100").is_err());
        assert!(parse_late_fees("15:99999999999").is_err());
    }

    #[test]
    fn durations_out_of_range_are_rejected() {
        assert_eq!(scale_duration(180, SECOND), Some(180_000));
        assert_eq!(scale_duration(9_223_372_036_854_775, SECOND), None);
        assert_eq!(scale_duration(i64::MAX, HOUR), None);
        assert_eq!(scale_duration(0, HOUR), None);
        assert_eq!(scale_duration(24 * 366, HOUR), Some(MAX_POLICY_SPAN_MS));
        assert_eq!(scale_duration(24 * 366 + 1, HOUR), None);
    }
}
