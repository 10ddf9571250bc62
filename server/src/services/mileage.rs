use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::store::UnitOfWork;
use crate::utils::error::AppError;

/// Mileage earned on a payment: `floor(amount * percent / 100)`.
pub fn accrual(amount: Decimal, percent: Decimal) -> Result<i64, AppError> {
    (amount * percent / Decimal::ONE_HUNDRED)
        .floor()
        .to_i64()
        .ok_or_else(|| AppError::InternalServerError(format!("mileage accrual overflow on {amount}")))
}

/// Add `delta` to a member's balance under the member row lock.
/// A balance that would go negative is refused, not clamped.
pub async fn apply_delta_in(
    uow: &mut dyn UnitOfWork,
    member_id: Uuid,
    delta: i64,
) -> Result<i64, AppError> {
    let member = uow
        .member_for_update(member_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("member {member_id}")))?;
    if delta == 0 {
        return Ok(member.mileage);
    }

    let balance = member.mileage + delta;
    if balance < 0 {
        return Err(AppError::InsufficientMileage {
            required: -delta,
            balance: member.mileage,
        });
    }
    uow.set_mileage(member_id, balance).await?;
    tracing::debug!(%member_id, delta, balance, "Mileage adjusted");
    Ok(balance)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accrual_floors() {
        assert_eq!(accrual(Decimal::from(29_550), Decimal::ONE).unwrap(), 295);
        assert_eq!(accrual(Decimal::from(99), Decimal::ONE).unwrap(), 0);
        assert_eq!(
            accrual(Decimal::from(10_000), "2.5".parse().unwrap()).unwrap(),
            250
        );
    }
}
