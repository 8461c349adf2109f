//! HTTP clients for the charge and fulfillment services.

use async_trait::async_trait;
use orderup_core::payment::{ChargeGateway, ChargeReceipt, ChargeRequest};
use orderup_core::supplier::{FulfillmentGateway, FulfillmentRequest};
use orderup_core::GatewayError;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

fn build_client(timeout: Duration) -> Result<reqwest::Client, GatewayError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| GatewayError::Transport(format!("failed to build HTTP client: {}", e)))
}

fn transport_error(err: reqwest::Error, timeout: Duration) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout(timeout)
    } else {
        GatewayError::Transport(err.to_string())
    }
}

/// Body is read opportunistically; an unreadable body is not worth a second error.
async fn rejected(response: reqwest::Response) -> GatewayError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    GatewayError::Rejected { status, body }
}

/// `POST {base_url}/charge`; the charge exists only on `201 Created`.
pub struct HttpChargeGateway {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpChargeGateway {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, GatewayError> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }
}

#[async_trait]
impl ChargeGateway for HttpChargeGateway {
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, GatewayError> {
        let url = format!("{}/charge", self.base_url);
        debug!(%url, amount_cents = request.amount_cents, "POST charge");

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;

        if response.status() != StatusCode::CREATED {
            return Err(rejected(response).await);
        }

        // The service may answer with an empty body
        let body = response.bytes().await.map_err(|e| transport_error(e, self.timeout))?;
        Ok(serde_json::from_slice(&body).unwrap_or_default())
    }
}

/// `PUT {base_url}/fulfill`; any 2xx is success.
pub struct HttpFulfillmentGateway {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpFulfillmentGateway {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, GatewayError> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }
}

#[async_trait]
impl FulfillmentGateway for HttpFulfillmentGateway {
    async fn fulfill(&self, request: &FulfillmentRequest) -> Result<(), GatewayError> {
        let url = format!("{}/fulfill", self.base_url);
        debug!(%url, order_id = %request.order_id, description = %request.description, "PUT fulfill");

        let response = self
            .client
            .put(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;

        if !response.status().is_success() {
            return Err(rejected(response).await);
        }
        Ok(())
    }
}
