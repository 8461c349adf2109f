use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::GatewayError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FulfillmentRequest {
    pub description: String,
    pub quantity: i64,
    #[serde(rename = "orderID")]
    pub order_id: String,
}

#[async_trait]
pub trait FulfillmentGateway: Send + Sync {
    /// Ship a single line item.
    ///
    /// The remote side de-duplicates on `(order_id, description)`, so calling
    /// this again for an item that already shipped succeeds without shipping
    /// it twice.
    async fn fulfill(&self, request: &FulfillmentRequest) -> Result<(), GatewayError>;
}
