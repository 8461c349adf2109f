use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::CoreError;

/// Order status in the lifecycle.
///
/// The only legal moves are `Pending → Charged → Fulfilled`. The external
/// string form is the lowercase variant name and the mapping is total in both
/// directions: unknown strings are rejected instead of defaulted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Customer has not been charged yet
    Pending,
    /// Payment captured (or nothing to capture)
    Charged,
    /// Every physical line item was handed to fulfillment
    Fulfilled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Charged => "charged",
            OrderStatus::Fulfilled => "fulfilled",
        }
    }

    /// Whether `self → next` is a legal forward transition.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (OrderStatus::Pending, OrderStatus::Charged) | (OrderStatus::Charged, OrderStatus::Fulfilled)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == OrderStatus::Fulfilled
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "charged" => Ok(OrderStatus::Charged),
            "fulfilled" => Ok(OrderStatus::Fulfilled),
            other => Err(CoreError::ValidationError(format!(
                "unknown value for status: {}",
                other
            ))),
        }
    }
}

/// Filter applied when listing orders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusFilter {
    #[default]
    Any,
    Only(OrderStatus),
}

impl StatusFilter {
    pub fn matches(&self, status: OrderStatus) -> bool {
        match self {
            StatusFilter::Any => true,
            StatusFilter::Only(wanted) => *wanted == status,
        }
    }
}

impl From<OrderStatus> for StatusFilter {
    fn from(status: OrderStatus) -> Self {
        StatusFilter::Only(status)
    }
}

impl FromStr for StatusFilter {
    type Err = CoreError;

    /// An empty string or `any` selects every order.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "any" => Ok(StatusFilter::Any),
            other => other.parse().map(StatusFilter::Only),
        }
    }
}

/// A single priced entry on an order: a product, or a discount when the
/// unit price is zero or negative.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    /// Product ID or discount ID
    pub description: String,
    #[serde(alias = "priceCents")]
    pub unit_price_cents: i64,
    pub quantity: i64,
}

impl LineItem {
    pub fn new(description: impl Into<String>, unit_price_cents: i64, quantity: i64) -> Self {
        Self {
            description: description.into(),
            unit_price_cents,
            quantity,
        }
    }

    pub fn line_total_cents(&self) -> i64 {
        self.unit_price_cents * self.quantity
    }

    /// Discounts and zero-priced entries are never shipped.
    pub fn is_physical(&self) -> bool {
        self.unit_price_cents > 0
    }
}

/// A customer's request to purchase one or more line items
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    /// Empty until the store assigns one on insert; immutable afterwards.
    #[serde(default)]
    pub id: String,
    pub customer_email: String,
    pub line_items: Vec<LineItem>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn new(customer_email: String, line_items: Vec<LineItem>) -> Self {
        Self {
            id: String::new(),
            customer_email,
            line_items,
            status: OrderStatus::Pending,
            created_at: Utc::now(),
        }
    }

    /// Signed sum of every line total. Always recomputed, never stored.
    pub fn total_cents(&self) -> i64 {
        self.line_items.iter().map(LineItem::line_total_cents).sum()
    }

    /// Same as [`Order::total_cents`] but `None` on overflow.
    pub fn checked_total_cents(&self) -> Option<i64> {
        self.line_items.iter().try_fold(0i64, |acc, item| {
            item.unit_price_cents
                .checked_mul(item.quantity)
                .and_then(|line| acc.checked_add(line))
        })
    }

    /// Line items that have to go through fulfillment
    pub fn physical_items(&self) -> impl Iterator<Item = &LineItem> {
        self.line_items.iter().filter(|item| item.is_physical())
    }
}
