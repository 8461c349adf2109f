//! In-memory order store.
//!
//! Orders live in a map behind a single read-write lock. Every mutation,
//! including the existence check in `insert` and the status comparison in
//! `transition_status`, happens under the write guard, which makes them
//! atomic. No await point sits inside a critical section, so dropping a call
//! can never leave a half-applied write.

use async_trait::async_trait;
use orderup_core::{Order, OrderStatus, OrderStore, StatusFilter, StoreError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Clone, Default)]
pub struct MemoryOrderStore {
    orders: Arc<RwLock<HashMap<String, Order>>>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.orders.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.orders.read().await.is_empty()
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn get(&self, id: &str) -> Result<Order, StoreError> {
        let orders = self.orders.read().await;
        orders
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list(&self, filter: StatusFilter) -> Result<Vec<Order>, StoreError> {
        let orders = self.orders.read().await;
        let mut matching: Vec<Order> = orders
            .values()
            .filter(|order| filter.matches(order.status))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(matching)
    }

    async fn insert(&self, mut order: Order) -> Result<String, StoreError> {
        let mut orders = self.orders.write().await;

        if order.id.is_empty() {
            let mut id = Uuid::new_v4().to_string();
            while orders.contains_key(&id) {
                id = Uuid::new_v4().to_string();
            }
            order.id = id;
        } else if orders.contains_key(&order.id) {
            return Err(StoreError::AlreadyExists(order.id));
        }

        let id = order.id.clone();
        orders.insert(id.clone(), order);
        Ok(id)
    }

    async fn set_status(&self, id: &str, status: OrderStatus) -> Result<(), StoreError> {
        let mut orders = self.orders.write().await;
        let order = orders
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        order.status = status;
        Ok(())
    }

    async fn transition_status(
        &self,
        id: &str,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<(), StoreError> {
        let mut orders = self.orders.write().await;
        let order = orders
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if order.status != from {
            return Err(StoreError::StatusMismatch {
                id: id.to_string(),
                expected: from,
                actual: order.status,
            });
        }
        order.status = to;
        Ok(())
    }
}
