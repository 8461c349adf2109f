pub mod models;
pub mod repository;
pub mod payment;
pub mod supplier;

use std::time::Duration;

pub use models::{LineItem, Order, OrderStatus, StatusFilter};
pub use payment::{ChargeGateway, ChargeReceipt, ChargeRequest};
pub use repository::{OrderStore, StoreError};
pub use supplier::{FulfillmentGateway, FulfillmentRequest};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    ValidationError(String),
}

/// Failure talking to one of the external collaborators (charge or fulfillment).
///
/// A gateway error never carries partial-success information: callers treat
/// it as "the remote side did not act".
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Gateway request failed: {0}")]
    Transport(String),
    #[error("Gateway rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("Gateway call timed out after {0:?}")]
    Timeout(Duration),
    /// Refused locally because the gateway's circuit is open
    #[error("Gateway unavailable: {0}")]
    Unavailable(String),
}
