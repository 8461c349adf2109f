use async_trait::async_trait;

use crate::models::{Order, OrderStatus, StatusFilter};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Order not found: {0}")]
    NotFound(String),

    #[error("Order already exists: {0}")]
    AlreadyExists(String),

    #[error("Order {id} is {actual}, expected {expected}")]
    StatusMismatch {
        id: String,
        expected: OrderStatus,
        actual: OrderStatus,
    },

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Keyed storage for orders.
///
/// Atomicity contract every backend must honour:
/// - `insert` checks for an existing id and writes in one atomic step, so two
///   concurrent inserts of the same explicit id never both succeed.
/// - `set_status` is a blind keyed write; it never validates the transition.
/// - `transition_status` is a conditional write ("set `to` only if the
///   current status is `from`"). Backends that can express it natively must
///   override the default, which is only safe behind the engine's per-order
///   lock.
///
/// There is no generic update: every change is a creation or a status move.
/// Every method is cancel-safe: a dropped future leaves no partial write.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Fetch one order, `NotFound` if absent
    async fn get(&self, id: &str) -> Result<Order, StoreError>;

    /// All orders matching the filter, empty when nothing matches
    async fn list(&self, filter: StatusFilter) -> Result<Vec<Order>, StoreError>;

    /// Persist a new order, assigning a fresh id when `order.id` is empty.
    /// Returns the id the order was stored under.
    async fn insert(&self, order: Order) -> Result<String, StoreError>;

    async fn set_status(&self, id: &str, status: OrderStatus) -> Result<(), StoreError>;

    async fn transition_status(
        &self,
        id: &str,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<(), StoreError> {
        let current = self.get(id).await?;
        if current.status != from {
            return Err(StoreError::StatusMismatch {
                id: id.to_string(),
                expected: from,
                actual: current.status,
            });
        }
        self.set_status(id, to).await
    }
}
