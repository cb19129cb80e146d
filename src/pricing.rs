use serde::Serialize;

use crate::model::{Minutes, TierKind, TierSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Quote {
    pub billable_minutes: Minutes,
    pub free_minutes_applied: Minutes,
    /// Smallest currency unit.
    pub amount: u64,
}

/// Price `requested` minutes for a payer who has already used
/// `month_to_date_free` minutes of free quota in the booking's month.
pub fn price(tier: &TierSnapshot, requested: Minutes, month_to_date_free: Minutes) -> Quote {
    let free = match tier.kind {
        TierKind::NonMember | TierKind::Standard => 0,
        TierKind::Quota => {
            let remaining = tier.free_minutes_per_month.saturating_sub(month_to_date_free);
            requested.min(remaining)
        }
    };
    let billable = requested - free;
    Quote {
        billable_minutes: billable,
        free_minutes_applied: free,
        amount: charge(billable, tier.hourly_rate),
    }
}

/// `ceil(minutes * rate / 60)`, rounded once at the end.
fn charge(minutes: Minutes, hourly_rate: u64) -> u64 {
    let cents = (u128::from(minutes) * u128::from(hourly_rate)).div_ceil(60);
    u64::try_from(cents).unwrap_or(u64::MAX)
}
