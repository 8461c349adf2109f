use crate::breaker::{BreakerSettings, CircuitBreaker, CircuitState};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use orderup_core::supplier::{FulfillmentGateway, FulfillmentRequest};
use orderup_core::{GatewayError, Order};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Fans an order's physical line items out to the fulfillment gateway.
pub struct FulfillmentService {
    gateway: Arc<dyn FulfillmentGateway>,
    timeout: Duration,
    max_concurrency: usize,
    breaker: CircuitBreaker,
}

impl FulfillmentService {
    pub fn new(
        gateway: Arc<dyn FulfillmentGateway>,
        timeout: Duration,
        max_concurrency: usize,
        breaker: BreakerSettings,
    ) -> Self {
        Self {
            gateway,
            timeout,
            max_concurrency: max_concurrency.max(1),
            breaker: CircuitBreaker::new("fulfillment", breaker),
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Requests for every line item with a strictly positive unit price
    pub fn build_requests(order: &Order) -> Vec<FulfillmentRequest> {
        order
            .physical_items()
            .map(|item| FulfillmentRequest {
                description: item.description.clone(),
                quantity: item.quantity,
                order_id: order.id.clone(),
            })
            .collect()
    }

    /// Ship every physical item, at most `max_concurrency` at a time.
    ///
    /// Succeeds only when every call succeeded. On the first failure the
    /// in-flight calls are dropped; that is safe because the gateway
    /// de-duplicates, so the whole order can simply be retried.
    /// Returns the number of items handed to the gateway.
    pub async fn fulfill_items(&self, order: &Order) -> Result<usize, FulfillmentError> {
        let requests = Self::build_requests(order);
        let count = requests.len();

        debug!(order_id = %order.id, items = count, "Dispatching fulfillment");

        stream::iter(requests)
            .map(|request| self.fulfill_one(request))
            .buffer_unordered(self.max_concurrency)
            .try_collect::<Vec<()>>()
            .await?;

        info!(order_id = %order.id, items = count, "All line items fulfilled");
        Ok(count)
    }

    async fn fulfill_one(&self, request: FulfillmentRequest) -> Result<(), FulfillmentError> {
        let outcome = match self.breaker.admit() {
            Ok(permit) => {
                let outcome = match tokio::time::timeout(self.timeout, self.gateway.fulfill(&request)).await {
                    Ok(result) => result,
                    Err(_) => Err(GatewayError::Timeout(self.timeout)),
                };
                permit.record(&outcome);
                outcome
            }
            Err(refused) => Err(refused),
        };

        outcome.map_err(|source| {
            warn!(
                order_id = %request.order_id,
                description = %request.description,
                error = %source,
                "Line item fulfillment failed"
            );
            FulfillmentError::ItemFailed {
                description: request.description,
                source,
            }
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FulfillmentError {
    #[error("Fulfillment of line item {description} failed: {source}")]
    ItemFailed {
        description: String,
        #[source]
        source: GatewayError,
    },
}

/// In-process fulfillment gateway.
///
/// Behaves like the real service: a repeated `(order_id, description)` pair is
/// acknowledged without shipping again.
#[derive(Default)]
pub struct MockFulfillmentGateway {
    calls: AtomicUsize,
    shipped: Mutex<HashSet<(String, String)>>,
    failing_descriptions: Mutex<HashSet<String>>,
    delay: Option<Duration>,
}

impl MockFulfillmentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Make every request for `description` fail until cleared
    pub fn fail_on(&self, description: &str) {
        if let Ok(mut failing) = self.failing_descriptions.lock() {
            failing.insert(description.to_string());
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut failing) = self.failing_descriptions.lock() {
            failing.clear();
        }
    }

    /// Every request received, including duplicates and failures
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Distinct items actually shipped
    pub fn shipped_count(&self) -> usize {
        self.shipped.lock().map(|s| s.len()).unwrap_or_default()
    }

    pub fn was_shipped(&self, order_id: &str, description: &str) -> bool {
        self.shipped
            .lock()
            .map(|s| s.contains(&(order_id.to_string(), description.to_string())))
            .unwrap_or(false)
    }
}

#[async_trait::async_trait]
impl FulfillmentGateway for MockFulfillmentGateway {
    async fn fulfill(&self, request: &FulfillmentRequest) -> Result<(), GatewayError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.calls.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failing_descriptions
            .lock()
            .map(|f| f.contains(&request.description))
            .unwrap_or(false);
        if failing {
            return Err(GatewayError::Rejected {
                status: 503,
                body: format!("warehouse cannot ship {}", request.description),
            });
        }

        let mut shipped = self
            .shipped
            .lock()
            .map_err(|_| GatewayError::Transport("mock state poisoned".into()))?;
        shipped.insert((request.order_id.clone(), request.description.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orderup_core::LineItem;

    fn charged_order() -> Order {
        let mut order = Order::new(
            "test@test".to_string(),
            vec![
                LineItem::new("item 1", 1000, 1),
                LineItem::new("item 2", 5000, 10),
                LineItem::new("discount", -1000, 1),
            ],
        );
        order.id = "order-1".to_string();
        order
    }

    #[test]
    fn test_requests_skip_discounts() {
        let requests = FulfillmentService::build_requests(&charged_order());

        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|r| r.order_id == "order-1"));
        assert!(requests.iter().all(|r| r.description != "discount"));
        assert_eq!(requests[1].quantity, 10);
    }

    #[tokio::test]
    async fn test_fulfill_items_ships_each_physical_item() {
        let gateway = Arc::new(MockFulfillmentGateway::new());
        let service = FulfillmentService::new(gateway.clone(), Duration::from_secs(1), 4, BreakerSettings::default());

        let shipped = service.fulfill_items(&charged_order()).await.unwrap();

        assert_eq!(shipped, 2);
        assert_eq!(gateway.call_count(), 2);
        assert!(gateway.was_shipped("order-1", "item 1"));
        assert!(gateway.was_shipped("order-1", "item 2"));
        assert!(!gateway.was_shipped("order-1", "discount"));
    }

    #[tokio::test]
    async fn test_repeated_fulfillment_does_not_ship_twice() {
        let gateway = Arc::new(MockFulfillmentGateway::new());
        let service = FulfillmentService::new(gateway.clone(), Duration::from_secs(1), 4, BreakerSettings::default());
        let order = charged_order();

        service.fulfill_items(&order).await.unwrap();
        service.fulfill_items(&order).await.unwrap();

        assert_eq!(gateway.call_count(), 4);
        assert_eq!(gateway.shipped_count(), 2);
    }

    #[tokio::test]
    async fn test_single_failure_fails_the_whole_batch() {
        let gateway = Arc::new(MockFulfillmentGateway::new());
        gateway.fail_on("item 2");
        let service = FulfillmentService::new(gateway.clone(), Duration::from_secs(1), 1, BreakerSettings::default());

        let err = service.fulfill_items(&charged_order()).await.unwrap_err();

        let FulfillmentError::ItemFailed { description, .. } = err;
        assert_eq!(description, "item 2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_gateway_times_out() {
        let gateway = Arc::new(MockFulfillmentGateway::with_delay(Duration::from_secs(60)));
        let service = FulfillmentService::new(gateway, Duration::from_secs(5), 4, BreakerSettings::default());

        let err = service.fulfill_items(&charged_order()).await.unwrap_err();

        assert!(matches!(
            err,
            FulfillmentError::ItemFailed { source: GatewayError::Timeout(_), .. }
        ));
    }

    #[tokio::test]
    async fn test_open_circuit_stops_calling_the_warehouse() {
        let gateway = Arc::new(MockFulfillmentGateway::new());
        gateway.fail_on("item 1");
        let settings = BreakerSettings {
            failure_threshold: 1,
            reset_timeout: Duration::from_secs(60),
        };
        let service = FulfillmentService::new(gateway.clone(), Duration::from_secs(1), 1, settings);

        service.fulfill_items(&charged_order()).await.unwrap_err();
        assert_eq!(service.circuit_state(), CircuitState::Open);
        let calls = gateway.call_count();

        gateway.clear_failures();
        let err = service.fulfill_items(&charged_order()).await.unwrap_err();

        assert!(matches!(
            err,
            FulfillmentError::ItemFailed { source: GatewayError::Unavailable(_), .. }
        ));
        assert_eq!(gateway.call_count(), calls);
    }
}
