use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::PaymentError;

/// Политика депозита помещения. Все суммы в минимальных единицах валюты.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DepositPolicy {
    Disabled,
    Percentage { percent: u32 },
    Fixed { amount: i64 },
    /// Большее из минимума и процента от суммы.
    MinimumOrPercentage { minimum: i64, percent: u32 },
}

impl DepositPolicy {
    /// Сумма депозита для брони на `total`. `None` означает, что депозит не нужен.
    /// Депозит никогда не превышает стоимость брони.
    pub fn deposit_for(&self, total: i64) -> Result<Option<i64>, PaymentError> {
        let amount = match *self {
            Self::Disabled => return Ok(None),
            Self::Percentage { percent } => percent_of(total, percent)?,
            Self::Fixed { amount } => amount,
            Self::MinimumOrPercentage { minimum, percent } => minimum.max(percent_of(total, percent)?),
        };
        let amount = amount.min(total);
        Ok((amount > 0).then_some(amount))
    }
}

// Округление половины вверх, чтобы 12.5 копейки не терялись
fn percent_of(total: i64, percent: u32) -> Result<i64, PaymentError> {
    total
        .checked_mul(i64::from(percent))
        .and_then(|scaled| scaled.checked_add(50))
        .map(|scaled| scaled / 100)
        .ok_or_else(|| PaymentError::Validation(format!("deposit of {percent}% on {total} is out of range")))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Space {
    pub id: Uuid,
    pub name: String,
    pub deposit_policy: DepositPolicy,
}

#[derive(Debug, Clone, FromRow)]
pub struct SpaceRow {
    pub id: Uuid,
    pub name: String,
    pub deposit_kind: String,
    pub deposit_percent: Option<i32>,
    pub deposit_amount: Option<i64>,
}

impl TryFrom<SpaceRow> for Space {
    type Error = PaymentError;

    fn try_from(row: SpaceRow) -> Result<Self, Self::Error> {
        let percent = || -> Result<u32, PaymentError> {
            row.deposit_percent
                .and_then(|p| u32::try_from(p).ok())
                .filter(|p| *p <= 100)
                .ok_or_else(|| PaymentError::Validation(format!("space {} has an invalid deposit percent", row.id)))
        };
        let amount = || -> Result<i64, PaymentError> {
            row.deposit_amount
                .filter(|a| *a >= 0)
                .ok_or_else(|| PaymentError::Validation(format!("space {} has an invalid deposit amount", row.id)))
        };

        let deposit_policy = match row.deposit_kind.as_str() {
            "disabled" => DepositPolicy::Disabled,
            "percentage" => DepositPolicy::Percentage { percent: percent()? },
            "fixed" => DepositPolicy::Fixed { amount: amount()? },
            "minimum_or_percentage" => DepositPolicy::MinimumOrPercentage {
                minimum: amount()?,
                percent: percent()?,
            },
            other => {
                return Err(PaymentError::Validation(format!("unknown deposit policy: {other}")));
            }
        };

        Ok(Space {
            id: row.id,
            name: row.name,
            deposit_policy,
        })
    }
}
