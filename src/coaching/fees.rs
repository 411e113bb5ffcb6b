//! Platform fee computation.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::{CoachingError, CoachingResult};

const BASIS_POINTS_PER_PERCENT: u32 = 100;
const MAX_BASIS_POINTS: u32 = 100 * BASIS_POINTS_PER_PERCENT;

/// Platform fee rate, stored in basis points so fractional percentages stay exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct FeePercent(u32);

impl FeePercent {
    /// The standard 15% platform fee.
    pub const DEFAULT: Self = Self(15 * BASIS_POINTS_PER_PERCENT);

    /// A whole-number percentage (e.g. `15` for 15%).
    pub fn from_percent(percent: u32) -> CoachingResult<Self> {
        percent
            .checked_mul(BASIS_POINTS_PER_PERCENT)
            .ok_or_else(|| CoachingError::invalid("fee_percent", "must be between 0 and 100"))
            .and_then(Self::from_basis_points)
    }

    /// A rate in basis points (e.g. `1250` for 12.5%).
    pub fn from_basis_points(bps: u32) -> CoachingResult<Self> {
        if bps > MAX_BASIS_POINTS {
            return Err(CoachingError::invalid("fee_percent", "must be between 0 and 100"));
        }
        Ok(Self(bps))
    }

    /// The rate in basis points.
    #[must_use]
    pub fn basis_points(&self) -> u32 {
        self.0
    }
}

impl Default for FeePercent {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<u32> for FeePercent {
    type Error = CoachingError;

    fn try_from(bps: u32) -> Result<Self, Self::Error> {
        Self::from_basis_points(bps)
    }
}

impl From<FeePercent> for u32 {
    fn from(fee: FeePercent) -> Self {
        fee.0
    }
}

impl FromStr for FeePercent {
    type Err = CoachingError;

    /// Parse `"15"`, `"12.5"` or `"12.25"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CoachingError::invalid("fee_percent", format!("'{}' is not a percentage", s));
        let s = s.trim().trim_end_matches('%');
        let (whole, frac) = s.split_once('.').unwrap_or((s, ""));
        if frac.len() > 2 {
            return Err(invalid());
        }
        let whole: u32 = whole.parse().map_err(|_| invalid())?;
        let frac: u32 = if frac.is_empty() {
            0
        } else {
            format!("{:0<2}", frac).parse().map_err(|_| invalid())?
        };
        whole
            .checked_mul(BASIS_POINTS_PER_PERCENT)
            .and_then(|w| w.checked_add(frac))
            .ok_or_else(invalid)
            .and_then(Self::from_basis_points)
    }
}

impl std::fmt::Display for FeePercent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let whole = self.0 / BASIS_POINTS_PER_PERCENT;
        let frac = self.0 % BASIS_POINTS_PER_PERCENT;
        if frac == 0 {
            write!(f, "{}%", whole)
        } else {
            write!(f, "{}.{:02}%", whole, frac)
        }
    }
}

/// Split of a gross amount between platform and provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSplit {
    /// Amount charged to the player.
    pub gross: i64,
    /// Platform's share.
    pub platform_fee: i64,
    /// Provider's share.
    pub net_amount: i64,
}

/// Compute the platform fee and provider net for a gross amount.
///
/// `platform_fee = round_half_up(gross * rate)` and
/// `net_amount = gross - platform_fee`, so the two always sum to `gross`.
pub fn compute_fee(gross: i64, fee: FeePercent) -> CoachingResult<FeeSplit> {
    if gross < 0 {
        return Err(CoachingError::invalid("gross_amount", "must not be negative"));
    }

    let scaled = i128::from(gross) * i128::from(fee.basis_points());
    let denominator = i128::from(MAX_BASIS_POINTS);
    let platform_fee = (scaled + denominator / 2) / denominator;
    let platform_fee = i64::try_from(platform_fee)
        .map_err(|_| CoachingError::invalid("gross_amount", "too large"))?;

    Ok(FeeSplit {
        gross,
        platform_fee,
        net_amount: gross - platform_fee,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifteen_percent_rounds_half_up() {
        let split = compute_fee(4725, FeePercent::from_percent(15).unwrap()).unwrap();
        assert_eq!(split.platform_fee, 709);
        assert_eq!(split.net_amount, 4016);
    }

    #[test]
    fn test_exact_half_rounds_up() {
        // 10 * 5% = 0.5
        let split = compute_fee(10, FeePercent::from_percent(5).unwrap()).unwrap();
        assert_eq!(split.platform_fee, 1);
        assert_eq!(split.net_amount, 9);
    }

    #[test]
    fn test_split_always_sums_to_gross() {
        for pct in [0u32, 1, 7, 10, 12, 15, 20, 33, 50, 99, 100] {
            let fee = FeePercent::from_percent(pct).unwrap();
            for gross in (0..5_000).chain([99_999, 1_000_001, i64::from(u32::MAX)]) {
                let split = compute_fee(gross, fee).unwrap();
                assert_eq!(split.platform_fee + split.net_amount, gross);

                // round_half_up(gross * pct / 100) in exact integer arithmetic
                let expected = (gross * i64::from(pct) * 2 + 100) / 200;
                assert_eq!(split.platform_fee, expected, "gross={} pct={}", gross, pct);
            }
        }
    }

    #[test]
    fn test_fractional_percent() {
        let fee: FeePercent = "12.5".parse().unwrap();
        assert_eq!(fee.basis_points(), 1250);
        assert_eq!(fee.to_string(), "12.50%");
        let split = compute_fee(1000, fee).unwrap();
        assert_eq!(split.platform_fee, 125);
    }

    #[test]
    fn test_rejects_invalid_inputs() {
        assert!(FeePercent::from_percent(101).is_err());
        assert!("abc".parse::<FeePercent>().is_err());
        assert!("12.345".parse::<FeePercent>().is_err());
        let err = compute_fee(-1, FeePercent::from_percent(15).unwrap()).unwrap_err();
        assert!(matches!(err, CoachingError::InvalidInput { .. }));
    }

    #[test]
    fn test_deserialize_validates_range() {
        let fee: FeePercent = serde_json::from_str("1500").unwrap();
        assert_eq!(fee, FeePercent::DEFAULT);
        assert!(serde_json::from_str::<FeePercent>("10001").is_err());
    }
}
