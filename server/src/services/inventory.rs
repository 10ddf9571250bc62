//! Remaining-quantity ledger for tickets.
//!
//! Both operations are single conditional updates inside the caller's unit of
//! work, so concurrent buyers of the last seats serialize on the ticket row and
//! the loser sees [`AppError::InsufficientInventory`].

use std::sync::Arc;
use uuid::Uuid;

use crate::store::{finish, Store, UnitOfWork};
use crate::utils::error::AppError;

pub struct InventoryLedger {
    store: Arc<dyn Store>,
}

impl InventoryLedger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Take `quantity` seats inside an existing unit of work. Returns the new remaining count.
    pub async fn decrement_in(
        uow: &mut dyn UnitOfWork,
        ticket_id: Uuid,
        quantity: i32,
    ) -> Result<i32, AppError> {
        validate_quantity(quantity)?;

        match uow.try_decrement_inventory(ticket_id, quantity).await? {
            Some(remaining) => {
                tracing::debug!(%ticket_id, quantity, remaining, "Inventory decremented");
                Ok(remaining)
            }
            None => {
                let ticket = uow
                    .ticket(ticket_id)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("ticket {ticket_id}")))?;
                Err(AppError::InsufficientInventory {
                    requested: quantity,
                    remaining: ticket.remaining_quantity,
                })
            }
        }
    }

    /// Give back `quantity` seats. Going past total capacity means the caller
    /// restored more than was sold and is reported, never clamped.
    pub async fn restore_in(
        uow: &mut dyn UnitOfWork,
        ticket_id: Uuid,
        quantity: i32,
    ) -> Result<i32, AppError> {
        validate_quantity(quantity)?;

        match uow.try_restore_inventory(ticket_id, quantity).await? {
            Some(remaining) => {
                tracing::debug!(%ticket_id, quantity, remaining, "Inventory restored");
                Ok(remaining)
            }
            None => {
                uow.ticket(ticket_id)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("ticket {ticket_id}")))?;
                tracing::error!(%ticket_id, quantity, "Inventory restore exceeds capacity");
                Err(AppError::InventoryOverflow {
                    ticket_id,
                    quantity,
                })
            }
        }
    }

    /// Standalone decrement in its own unit of work.
    pub async fn decrement(&self, ticket_id: Uuid, quantity: i32) -> Result<i32, AppError> {
        let mut uow = self.store.begin().await?;
        let outcome = Self::decrement_in(uow.as_mut(), ticket_id, quantity).await;
        finish(uow, outcome).await
    }

    /// Standalone restore in its own unit of work.
    pub async fn restore(&self, ticket_id: Uuid, quantity: i32) -> Result<i32, AppError> {
        let mut uow = self.store.begin().await?;
        let outcome = Self::restore_in(uow.as_mut(), ticket_id, quantity).await;
        finish(uow, outcome).await
    }
}

fn validate_quantity(quantity: i32) -> Result<(), AppError> {
    if quantity <= 0 {
        return Err(AppError::ValidationError(format!(
            "quantity must be positive, got {quantity}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::test_support::{expo_fixture, ticket_fixture};
    use chrono::Utc;

    async fn ledger_with_ticket(capacity: i32) -> (MemoryStore, InventoryLedger, Uuid) {
        let store = MemoryStore::new();
        let expo = expo_fixture(Utc::now());
        let ticket = ticket_fixture(&expo, capacity);
        let ticket_id = ticket.id;
        store.insert_expo(expo).await;
        store.insert_ticket(ticket).await;
        let ledger = InventoryLedger::new(Arc::new(store.clone()));
        (store, ledger, ticket_id)
    }

    #[tokio::test]
    async fn test_decrement_refuses_to_go_negative() {
        let (store, ledger, ticket_id) = ledger_with_ticket(2).await;

        assert_eq!(ledger.decrement(ticket_id, 2).await.unwrap(), 0);
        let err = ledger.decrement(ticket_id, 1).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::InsufficientInventory {
                requested: 1,
                remaining: 0
            }
        ));
        assert_eq!(store.snapshot().await.tickets[&ticket_id].remaining_quantity, 0);
    }

    #[tokio::test]
    async fn test_restore_past_capacity_is_an_error() {
        let (_store, ledger, ticket_id) = ledger_with_ticket(3).await;

        ledger.decrement(ticket_id, 1).await.unwrap();
        let err = ledger.restore(ticket_id, 2).await.unwrap_err();
        assert!(matches!(err, AppError::InventoryOverflow { quantity: 2, .. }));
        assert_eq!(ledger.restore(ticket_id, 1).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_non_positive_quantities_rejected() {
        let (_store, ledger, ticket_id) = ledger_with_ticket(3).await;
        assert!(matches!(
            ledger.decrement(ticket_id, 0).await,
            Err(AppError::ValidationError(_))
        ));
        assert!(matches!(
            ledger.restore(ticket_id, -1).await,
            Err(AppError::ValidationError(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_ticket_is_not_found() {
        let (_store, ledger, _) = ledger_with_ticket(3).await;
        assert!(matches!(
            ledger.decrement(Uuid::new_v4(), 1).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_decrement_and_restore_keep_ledger_balanced() {
        let capacity = 10;
        let (store, ledger, ticket_id) = ledger_with_ticket(capacity).await;
        let ledger = Arc::new(ledger);

        let mut handles = Vec::new();
        for i in 0..40 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                if i % 3 == 0 {
                    ledger.restore(ticket_id, 1).await.map(|_| -1)
                } else {
                    ledger.decrement(ticket_id, 1).await.map(|_| 1)
                }
            }));
        }

        let mut net_sold = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(delta) => net_sold += delta,
                Err(AppError::InsufficientInventory { .. })
                | Err(AppError::InventoryOverflow { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        let remaining = store.snapshot().await.tickets[&ticket_id].remaining_quantity;
        assert!(remaining >= 0 && remaining <= capacity);
        assert_eq!(capacity - remaining, net_sold);
    }
}
