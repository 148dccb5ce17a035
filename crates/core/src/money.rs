//! Fixed-point money: minor units, currencies and basis-point fees.
//!
//! Amounts are `i64` minor units end to end. Nothing in the core produces a
//! floating point value; `format_minor` renders a decimal string for display.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Amount in the smallest unit of a currency (e.g. cents for FC).
pub type MinorUnits = i64;

const BPS_DENOMINATOR: i128 = 10_000;

/// Supported ledger currencies.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Fc,
    Usdc,
}

impl Currency {
    /// Display scale of the currency.
    pub fn decimals(self) -> u8 {
        match self {
            Currency::Fc => 2,
            Currency::Usdc => 6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Currency::Fc => "FC",
            Currency::Usdc => "USDC",
        }
    }
}

impl core::fmt::Display for Currency {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Currency {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FC" => Ok(Currency::Fc),
            "USDC" => Ok(Currency::Usdc),
            other => Err(DomainError::validation(format!("unknown currency '{other}'"))),
        }
    }
}

/// Platform fee expressed in basis points (1 bps = 0.01%).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeeBps(u32);

impl FeeBps {
    /// 5% platform fee.
    pub const DEFAULT: FeeBps = FeeBps(500);

    pub fn new(bps: u32) -> DomainResult<Self> {
        if i128::from(bps) > BPS_DENOMINATOR {
            return Err(DomainError::validation(format!(
                "fee must be at most {BPS_DENOMINATOR} bps, got {bps}"
            )));
        }
        Ok(Self(bps))
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// Fee owed on `pot`, rounded half-up to the nearest minor unit.
    ///
    /// Computed as `(pot * bps + 5000) / 10000` in i128, so it never overflows
    /// and never exceeds `pot`.
    pub fn fee_on(self, pot: MinorUnits) -> DomainResult<MinorUnits> {
        if pot < 0 {
            return Err(DomainError::validation("pot must not be negative"));
        }
        let scaled = i128::from(pot) * i128::from(self.0) + BPS_DENOMINATOR / 2;
        let fee = scaled / BPS_DENOMINATOR;
        MinorUnits::try_from(fee).map_err(|_| DomainError::invariant("fee overflow"))
    }
}

impl Default for FeeBps {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Checked addition that reports overflow as an invariant violation.
pub fn checked_add(a: MinorUnits, b: MinorUnits) -> DomainResult<MinorUnits> {
    a.checked_add(b)
        .ok_or_else(|| DomainError::invariant("minor unit overflow"))
}

/// Render minor units as a decimal string (`1234`, 2 decimals → `"12.34"`).
pub fn format_minor(amount: MinorUnits, decimals: u8) -> String {
    if decimals == 0 {
        return amount.to_string();
    }
    let sign = if amount < 0 { "-" } else { "" };
    let abs = i128::from(amount).unsigned_abs();
    let scale = 10u128.pow(u32::from(decimals));
    format!(
        "{sign}{}.{:0width$}",
        abs / scale,
        abs % scale,
        width = usize::from(decimals)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_fee_on_example_pot() {
        assert_eq!(FeeBps::DEFAULT.fee_on(1000).unwrap(), 50);
    }

    #[test]
    fn fee_rounds_half_up() {
        let fee = FeeBps::new(500).unwrap();
        // 5% of 10 = 0.5 -> 1
        assert_eq!(fee.fee_on(10).unwrap(), 1);
        // 5% of 9 = 0.45 -> 0
        assert_eq!(fee.fee_on(9).unwrap(), 0);
        // 2.5% of 20 = 0.5 -> 1
        assert_eq!(FeeBps::new(250).unwrap().fee_on(20).unwrap(), 1);
    }

    #[test]
    fn fee_above_one_hundred_percent_is_rejected() {
        assert!(FeeBps::new(10_001).is_err());
        assert!(FeeBps::new(10_000).is_ok());
    }

    #[test]
    fn currency_scales() {
        assert_eq!(Currency::Fc.decimals(), 2);
        assert_eq!(Currency::Usdc.decimals(), 6);
        assert_eq!("usdc".parse::<Currency>().unwrap(), Currency::Usdc);
    }

    #[test]
    fn format_minor_pads_fraction() {
        assert_eq!(format_minor(1234, 2), "12.34");
        assert_eq!(format_minor(5, 2), "0.05");
        assert_eq!(format_minor(-150, 2), "-1.50");
        assert_eq!(format_minor(1_000_000, 6), "1.000000");
    }

    proptest! {
        /// The fee never exceeds the pot and the winner's share stays non-negative.
        #[test]
        fn fee_is_bounded_by_pot(pot in 0i64..i64::MAX / 2, bps in 0u32..=10_000u32) {
            let fee = FeeBps::new(bps).unwrap().fee_on(pot).unwrap();
            prop_assert!(fee >= 0);
            prop_assert!(fee <= pot);
        }
    }
}
