use serde::{Deserialize, Serialize};

/// Lifecycle events emitted after a status change has been committed.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderEvent {
    Created(OrderCreatedEvent),
    Charged(OrderChargedEvent),
    Fulfilled(OrderFulfilledEvent),
}

impl OrderEvent {
    pub fn order_id(&self) -> &str {
        match self {
            OrderEvent::Created(e) => &e.order_id,
            OrderEvent::Charged(e) => &e.order_id,
            OrderEvent::Fulfilled(e) => &e.order_id,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct OrderCreatedEvent {
    pub order_id: String,
    pub total_cents: i64,
    pub line_items: usize,
    pub timestamp: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct OrderChargedEvent {
    pub order_id: String,
    pub charged_cents: i64,
    /// Gateway charge reference; `None` when nothing had to be charged
    pub charge_reference: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct OrderFulfilledEvent {
    pub order_id: String,
    pub shipped_items: usize,
    pub timestamp: i64,
}

pub fn now_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}
