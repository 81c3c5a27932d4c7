use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// View of one (user, type, year) balance used by quota arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BalanceView {
    pub allowance: f64,
    pub carried_over: f64,
    pub used: f64,
    pub pending: f64,
}

impl BalanceView {
    /// Days still available for new requests.
    pub fn remaining(&self) -> f64 {
        self.allowance + self.carried_over - self.used - self.pending
    }
}

/// Configured conversion between two leave types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRule {
    pub from_type: String,
    pub to_type: String,
    pub conversion_rate: f64,
    pub max_days_per_year: Option<f64>,
    pub max_source_fraction: Option<f64>,
    pub requires_approval: bool,
}

/// Result of validating a transfer request against its rule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TransferPlan {
    pub requested_days: f64,
    pub converted_days: f64,
}

/// Errors raised while planning a quota transfer.
#[derive(Debug, Error, PartialEq)]
pub enum QuotaError {
    #[error("requested days must be positive")]
    NonPositiveDays,
    #[error("insufficient balance: {remaining} days remaining")]
    InsufficientBalance { remaining: f64 },
    #[error("transfer exceeds the yearly cap of {max} days")]
    ExceedsMaxDays { max: f64 },
    #[error("transfer exceeds {max_percent}% of the source allowance")]
    ExceedsMaxFraction { max_percent: f64 },
}

/// Validates a transfer request and computes the converted amount.
///
/// `already_transferred` is the sum of days already moved through this rule
/// in the same year, counted against `max_days_per_year`.
pub fn plan_transfer(
    rule: &TransferRule,
    source: &BalanceView,
    requested_days: f64,
    already_transferred: f64,
) -> Result<TransferPlan, QuotaError> {
    if requested_days <= 0.0 {
        return Err(QuotaError::NonPositiveDays);
    }

    let remaining = source.remaining();
    if requested_days > remaining {
        return Err(QuotaError::InsufficientBalance { remaining });
    }

    if let Some(max) = rule.max_days_per_year {
        if already_transferred + requested_days > max {
            return Err(QuotaError::ExceedsMaxDays { max });
        }
    }

    if let Some(fraction) = rule.max_source_fraction {
        let cap = source.allowance * fraction;
        if requested_days > cap {
            return Err(QuotaError::ExceedsMaxFraction {
                max_percent: fraction * 100.0,
            });
        }
    }

    Ok(TransferPlan {
        requested_days,
        converted_days: round_to_half(requested_days * rule.conversion_rate),
    })
}

/// How the carry-over amount is derived from the remaining balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CarryOverKind {
    Percentage,
    Fixed,
    All,
}

impl CarryOverKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Percentage => "PERCENTAGE",
            Self::Fixed => "FIXED",
            Self::All => "ALL",
        }
    }
}

impl std::str::FromStr for CarryOverKind {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "PERCENTAGE" => Ok(Self::Percentage),
            "FIXED" => Ok(Self::Fixed),
            "ALL" => Ok(Self::All),
            _ => Err(()),
        }
    }
}

/// Configured year-close carry-over for one leave type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarryOverRule {
    pub kind: CarryOverKind,
    /// Percentage (0..100) for `PERCENTAGE`, day count for `FIXED`, unused for `ALL`.
    pub value: f64,
    pub max_days: Option<f64>,
    pub expires_after_days: Option<u64>,
}

/// Computed carry-over credited to the next year's balance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CarryOverPlan {
    pub days: f64,
    pub expires_on: Option<NaiveDate>,
}

/// Computes the carry-over for a closing year.
///
/// `remaining` is the unused balance at year close; negative balances carry
/// nothing. The expiry date is counted from January 1st of `next_year`.
pub fn plan_carry_over(rule: &CarryOverRule, remaining: f64, next_year: i32) -> CarryOverPlan {
    let remaining = remaining.max(0.0);
    let carryable = match rule.kind {
        CarryOverKind::Percentage => remaining * (rule.value / 100.0),
        CarryOverKind::Fixed => rule.value.min(remaining),
        CarryOverKind::All => remaining,
    };
    let capped = match rule.max_days {
        Some(max) => carryable.min(max),
        None => carryable,
    };

    let expires_on = rule.expires_after_days.and_then(|days| {
        NaiveDate::from_ymd_opt(next_year, 1, 1)
            .and_then(|jan_first| jan_first.checked_add_days(Days::new(days)))
    });

    CarryOverPlan {
        days: round_to_half(capped),
        expires_on,
    }
}

/// Rounds to the nearest half day, the granularity balances are kept in.
pub fn round_to_half(value: f64) -> f64 {
    (value * 2.0).round() / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(rate: f64) -> TransferRule {
        TransferRule {
            from_type: "RECOVERY".to_string(),
            to_type: "ANNUAL".to_string(),
            conversion_rate: rate,
            max_days_per_year: Some(10.0),
            max_source_fraction: Some(0.5),
            requires_approval: false,
        }
    }

    fn balance(allowance: f64, used: f64, pending: f64) -> BalanceView {
        BalanceView {
            allowance,
            carried_over: 0.0,
            used,
            pending,
        }
    }

    #[test]
    fn transfer_converts_and_rounds_to_half_days() {
        let plan = plan_transfer(&rule(0.8), &balance(20.0, 0.0, 0.0), 3.0, 0.0).unwrap();
        assert_eq!(plan.requested_days, 3.0);
        // 3 * 0.8 = 2.4, rounded to 2.5.
        assert_eq!(plan.converted_days, 2.5);
    }

    #[test]
    fn transfer_requires_positive_amount() {
        let err = plan_transfer(&rule(1.0), &balance(20.0, 0.0, 0.0), 0.0, 0.0).unwrap_err();
        assert_eq!(err, QuotaError::NonPositiveDays);
    }

    #[test]
    fn transfer_rejects_overdraw() {
        let err = plan_transfer(&rule(1.0), &balance(10.0, 6.0, 2.0), 3.0, 0.0).unwrap_err();
        assert_eq!(err, QuotaError::InsufficientBalance { remaining: 2.0 });
    }

    #[test]
    fn transfer_honours_yearly_cap_cumulatively() {
        let err = plan_transfer(&rule(1.0), &balance(40.0, 0.0, 0.0), 4.0, 7.0).unwrap_err();
        assert_eq!(err, QuotaError::ExceedsMaxDays { max: 10.0 });
    }

    #[test]
    fn transfer_honours_source_fraction() {
        // Half of a 10-day allowance is 5; asking for 6 fails.
        let err = plan_transfer(&rule(1.0), &balance(10.0, 0.0, 0.0), 6.0, 0.0).unwrap_err();
        assert_eq!(
            err,
            QuotaError::ExceedsMaxFraction { max_percent: 50.0 }
        );
    }

    #[test]
    fn carry_over_percentage() {
        let rule = CarryOverRule {
            kind: CarryOverKind::Percentage,
            value: 50.0,
            max_days: Some(5.0),
            expires_after_days: Some(120),
        };
        let plan = plan_carry_over(&rule, 8.0, 2025);
        assert_eq!(plan.days, 4.0);
        assert_eq!(
            plan.expires_on,
            NaiveDate::from_ymd_opt(2025, 5, 1)
        );
    }

    #[test]
    fn carry_over_caps_at_max_days() {
        let rule = CarryOverRule {
            kind: CarryOverKind::All,
            value: 0.0,
            max_days: Some(5.0),
            expires_after_days: None,
        };
        let plan = plan_carry_over(&rule, 12.0, 2025);
        assert_eq!(plan.days, 5.0);
        assert_eq!(plan.expires_on, None);
    }

    #[test]
    fn carry_over_fixed_cannot_exceed_remaining() {
        let rule = CarryOverRule {
            kind: CarryOverKind::Fixed,
            value: 6.0,
            max_days: None,
            expires_after_days: None,
        };
        assert_eq!(plan_carry_over(&rule, 3.5, 2025).days, 3.5);
        assert_eq!(plan_carry_over(&rule, 10.0, 2025).days, 6.0);
        assert_eq!(plan_carry_over(&rule, -2.0, 2025).days, 0.0);
    }
}
