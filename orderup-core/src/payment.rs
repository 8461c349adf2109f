use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::GatewayError;

/// Request to capture a payment.
///
/// `amount_cents` is always strictly positive: zero-total orders never reach
/// the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChargeRequest {
    #[serde(rename = "cardToken")]
    pub payment_token: String,
    pub amount_cents: i64,
}

/// Acknowledgment returned once the gateway created the charge
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChargeReceipt {
    /// Gateway-side charge reference, when the gateway returns one
    #[serde(default)]
    pub reference: Option<String>,
}

#[async_trait]
pub trait ChargeGateway: Send + Sync {
    /// Capture `amount_cents` using `payment_token`.
    ///
    /// An error means no money moved.
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, GatewayError>;
}
