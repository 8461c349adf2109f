use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use orderup_order::{ErrorKind, OrderError};
use serde_json::json;

#[derive(Debug)]
pub enum AppError {
    ValidationError(String),
    NotFoundError(String),
    ConflictError(String),
    GatewayError(String),
    ServiceUnavailable(String),
    InternalServerError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFoundError(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::ConflictError(msg) => (StatusCode::CONFLICT, msg),
            AppError::GatewayError(msg) => {
                tracing::warn!("Upstream gateway failed: {}", msg);
                (StatusCode::BAD_GATEWAY, msg)
            },
            AppError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            AppError::InternalServerError(msg) => {
                tracing::error!("Internal Server Error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_string())
            },
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

impl From<OrderError> for AppError {
    fn from(err: OrderError) -> Self {
        let msg = err.to_string();
        match err.kind() {
            ErrorKind::NotFound => AppError::NotFoundError(msg),
            ErrorKind::AlreadyExists | ErrorKind::InvalidTransition => AppError::ConflictError(msg),
            ErrorKind::Validation => AppError::ValidationError(msg),
            ErrorKind::Gateway => AppError::GatewayError(msg),
            ErrorKind::Unavailable => AppError::ServiceUnavailable(msg),
            ErrorKind::InvalidState | ErrorKind::Storage => AppError::InternalServerError(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orderup_core::OrderStatus;

    fn status_of(err: OrderError) -> StatusCode {
        AppError::from(err).into_response().status()
    }

    #[test]
    fn test_order_errors_map_to_statuses() {
        assert_eq!(status_of(OrderError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_of(OrderError::AlreadyExists("x".into())), StatusCode::CONFLICT);
        assert_eq!(
            status_of(OrderError::InvalidTransition {
                from: OrderStatus::Pending,
                to: OrderStatus::Fulfilled,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(status_of(OrderError::Validation("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(OrderError::Gateway("x".into())), StatusCode::BAD_GATEWAY);
        assert_eq!(status_of(OrderError::Unavailable("x".into())), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_of(OrderError::InvalidState("x".into())), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(status_of(OrderError::Storage("x".into())), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
