use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use orderup_core::{LineItem, Order, StatusFilter};
use orderup_order::OrderError;
use orderup_shared::Masked;
use serde::{Deserialize, Serialize};
use crate::error::AppError;
use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    #[serde(flatten)]
    pub order: Order,
    pub total_cents: i64,
}

impl From<Order> for OrderResponse {
    fn from(order: Order) -> Self {
        let total_cents = order.total_cents();
        Self { order, total_cents }
    }
}

#[derive(Debug, Serialize)]
pub struct OrderEnvelope {
    pub order: OrderResponse,
}

impl From<Order> for OrderEnvelope {
    fn from(order: Order) -> Self {
        Self { order: order.into() }
    }
}

#[derive(Debug, Serialize)]
pub struct OrderListResponse {
    pub orders: Vec<OrderResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub customer_email: Masked<String>,
    pub line_items: Vec<LineItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeOrderRequest {
    pub card_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeOrderResponse {
    pub charged_cents: i64,
}

#[derive(Debug, Deserialize)]
pub struct ListOrdersQuery {
    pub status: Option<String>,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /orders?status=
/// List orders, optionally restricted to one status
pub async fn list_orders(
    State(state): State<AppState>,
    Query(query): Query<ListOrdersQuery>,
) -> Result<Json<OrderListResponse>, AppError> {
    let filter = query
        .status
        .as_deref()
        .unwrap_or_default()
        .parse::<StatusFilter>()
        .map_err(OrderError::from)?;

    let orders = state.manager.list_orders(filter).await?;

    Ok(Json(OrderListResponse {
        orders: orders.into_iter().map(OrderResponse::from).collect(),
    }))
}

/// POST /orders
/// Create a pending order
pub async fn create_order(
    State(state): State<AppState>,
    Json(req): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<OrderEnvelope>), AppError> {
    let customer_email = req.customer_email.into_inner();
    let order = match req.id {
        Some(id) => {
            state
                .manager
                .create_order_with_id(id, customer_email, req.line_items)
                .await?
        }
        None => state.manager.create_order(customer_email, req.line_items).await?,
    };

    Ok((StatusCode::CREATED, Json(order.into())))
}

/// GET /orders/{id}
/// Retrieve order details
pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<Json<OrderEnvelope>, AppError> {
    let order = state.manager.get_order(&order_id).await?;
    Ok(Json(order.into()))
}

/// POST /orders/{id}/charge
/// Capture payment for a pending order
pub async fn charge_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
    Json(req): Json<ChargeOrderRequest>,
) -> Result<Json<ChargeOrderResponse>, AppError> {
    let charged_cents = state.manager.charge_order(&order_id, &req.card_token).await?;
    Ok(Json(ChargeOrderResponse { charged_cents }))
}

/// POST /orders/{id}/fulfill
/// Ship a charged order; repeating it on a fulfilled order is a no-op
pub async fn fulfill_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<Json<OrderEnvelope>, AppError> {
    state.manager.fulfill_order(&order_id).await?;
    let order = state.manager.get_order(&order_id).await?;
    Ok(Json(order.into()))
}
