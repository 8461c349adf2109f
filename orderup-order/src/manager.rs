use crate::breaker::{BreakerSettings, CircuitState};
use crate::fulfillment::{FulfillmentError, FulfillmentService};
use crate::locks::OrderLocks;
use crate::orchestrator::PaymentOrchestrator;
use orderup_core::payment::ChargeGateway;
use orderup_core::supplier::FulfillmentGateway;
use orderup_core::{
    CoreError, GatewayError, LineItem, Order, OrderStatus, OrderStore, StatusFilter, StoreError,
};
use orderup_shared::models::events::{
    now_timestamp, OrderChargedEvent, OrderCreatedEvent, OrderEvent, OrderFulfilledEvent,
};
use orderup_shared::Masked;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, OwnedMutexGuard};
use tracing::{debug, error, info, instrument, Instrument};

/// Tunables for the lifecycle engine
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Deadline for a single charge or fulfillment call
    pub gateway_timeout: Duration,
    /// Upper bound on concurrent fulfillment calls for one order
    pub max_concurrent_fulfillments: usize,
    /// Applied separately to the charge and the fulfillment gateway
    pub circuit_breaker: BreakerSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            gateway_timeout: Duration::from_secs(10),
            max_concurrent_fulfillments: 8,
            circuit_breaker: BreakerSettings::default(),
        }
    }
}

/// Manages order lifecycle and state transitions.
///
/// Every transition runs inside the per-order lock, from the status read to
/// the status write, and the write itself is a conditional update on the
/// store. Gateway calls happen before the write, so a gateway failure (or a
/// caller dropping the future) leaves the stored status untouched.
///
/// Once the charge gateway has taken the money, the `Charged` write runs on
/// its own task holding the order lock, so a caller that goes away (client
/// disconnect, timeout) cannot abandon it and a retry waits for it.
///
/// Known gap: if the process dies, or the store write fails, after the
/// gateway succeeded, the customer has been charged while the order still
/// reads `Pending`. Closing it needs a durable intermediate marker holding the
/// gateway's charge reference. A failed write is logged at error level with
/// that reference; a crash leaves only the gateway's own record.
pub struct OrderManager {
    store: Arc<dyn OrderStore>,
    payments: PaymentOrchestrator,
    fulfillment: FulfillmentService,
    locks: OrderLocks,
    events: Option<broadcast::Sender<OrderEvent>>,
}

impl OrderManager {
    pub fn new(
        store: Arc<dyn OrderStore>,
        charge_gateway: Arc<dyn ChargeGateway>,
        fulfillment_gateway: Arc<dyn FulfillmentGateway>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            payments: PaymentOrchestrator::new(
                charge_gateway,
                settings.gateway_timeout,
                settings.circuit_breaker.clone(),
            ),
            fulfillment: FulfillmentService::new(
                fulfillment_gateway,
                settings.gateway_timeout,
                settings.max_concurrent_fulfillments,
                settings.circuit_breaker,
            ),
            locks: OrderLocks::new(),
            events: None,
        }
    }

    /// Publish lifecycle events on `tx` after each committed change
    pub fn with_events(mut self, tx: broadcast::Sender<OrderEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Create a new `Pending` order with a store-assigned id
    pub async fn create_order(
        &self,
        customer_email: String,
        line_items: Vec<LineItem>,
    ) -> Result<Order, OrderError> {
        self.insert_new(Order::new(customer_email, line_items)).await
    }

    /// Create a new `Pending` order under a caller-chosen id.
    /// Fails with `AlreadyExists` if the id is taken. An empty id lets the
    /// store assign one, like [`OrderManager::create_order`]; an id of only
    /// whitespace is rejected.
    pub async fn create_order_with_id(
        &self,
        id: String,
        customer_email: String,
        line_items: Vec<LineItem>,
    ) -> Result<Order, OrderError> {
        if !id.is_empty() && id.trim().is_empty() {
            return Err(OrderError::Validation("order id cannot be blank".to_string()));
        }
        let mut order = Order::new(customer_email, line_items);
        order.id = id;
        self.insert_new(order).await
    }

    async fn insert_new(&self, mut order: Order) -> Result<Order, OrderError> {
        let total = validate_new_order(&order)?;

        let id = self.store.insert(order.clone()).await?;
        order.id = id;

        info!(
            order_id = %order.id,
            customer = %Masked::new(order.customer_email.clone()).email_hint(),
            total_cents = total,
            "Order created"
        );
        self.publish(OrderEvent::Created(OrderCreatedEvent {
            order_id: order.id.clone(),
            total_cents: total,
            line_items: order.line_items.len(),
            timestamp: now_timestamp(),
        }));

        Ok(order)
    }

    /// Get an order by ID
    pub async fn get_order(&self, order_id: &str) -> Result<Order, OrderError> {
        Ok(self.store.get(order_id).await?)
    }

    /// All orders matching `filter`; empty when nothing matches
    pub async fn list_orders(&self, filter: StatusFilter) -> Result<Vec<Order>, OrderError> {
        Ok(self.store.list(filter).await?)
    }

    /// Circuit states of the charge and fulfillment gateways
    pub fn circuit_states(&self) -> (CircuitState, CircuitState) {
        (self.payments.circuit_state(), self.fulfillment.circuit_state())
    }

    /// Transition: Pending → Charged (payment captured).
    ///
    /// Returns the amount charged. Zero-total orders are moved to `Charged`
    /// without contacting the gateway.
    #[instrument(skip_all, fields(order_id = %order_id))]
    pub async fn charge_order(&self, order_id: &str, payment_token: &str) -> Result<i64, OrderError> {
        let guard = self.locks.acquire(order_id).await;

        let order = self.store.get(order_id).await?;
        ensure_transition(&order, OrderStatus::Charged)?;

        let amount = order.total_cents();
        let receipt = match amount.cmp(&0) {
            Ordering::Greater => {
                if payment_token.trim().is_empty() {
                    return Err(OrderError::Validation("payment token is required".to_string()));
                }
                Some(self.payments.capture(order_id, payment_token, amount).await?)
            }
            Ordering::Equal => {
                debug!("Order total is zero, skipping charge gateway");
                None
            }
            Ordering::Less => {
                error!(total_cents = amount, "Stored order has a negative total");
                return Err(OrderError::InvalidState(format!(
                    "order {} has negative total {}",
                    order_id, amount
                )));
            }
        };
        let reference = receipt.and_then(|r| r.reference);

        // Past this point dropping the caller must not drop the commit
        let commit = tokio::spawn(
            commit_charge(
                self.store.clone(),
                self.events.clone(),
                guard,
                order_id.to_string(),
                amount,
                reference,
            )
            .in_current_span(),
        );
        commit.await.map_err(|e| {
            error!(charged_cents = amount, error = %e, "Charge commit task failed");
            OrderError::InvalidState(format!("charge commit for order {} did not finish", order_id))
        })?
    }

    /// Transition: Charged → Fulfilled (all physical items handed off).
    ///
    /// Calling it on an already fulfilled order succeeds without side effects.
    #[instrument(skip_all, fields(order_id = %order_id))]
    pub async fn fulfill_order(&self, order_id: &str) -> Result<(), OrderError> {
        let _guard = self.locks.acquire(order_id).await;

        let order = self.store.get(order_id).await?;
        if order.status == OrderStatus::Fulfilled {
            debug!("Order already fulfilled");
            return Ok(());
        }
        ensure_transition(&order, OrderStatus::Fulfilled)?;

        let shipped = self.fulfillment.fulfill_items(&order).await?;

        self.store
            .transition_status(order_id, OrderStatus::Charged, OrderStatus::Fulfilled)
            .await
            .map_err(|e| transition_error(e, OrderStatus::Fulfilled))?;

        info!(shipped_items = shipped, "Order fulfilled");
        self.publish(OrderEvent::Fulfilled(OrderFulfilledEvent {
            order_id: order_id.to_string(),
            shipped_items: shipped,
            timestamp: now_timestamp(),
        }));

        Ok(())
    }

    fn publish(&self, event: OrderEvent) {
        publish(&self.events, event);
    }
}

fn publish(events: &Option<broadcast::Sender<OrderEvent>>, event: OrderEvent) {
    if let Some(tx) = events {
        // No subscribers is fine
        if tx.send(event).is_err() {
            debug!("No lifecycle event subscribers");
        }
    }
}

/// Persist `Pending → Charged` and announce it. Holds the order lock until done.
async fn commit_charge(
    store: Arc<dyn OrderStore>,
    events: Option<broadcast::Sender<OrderEvent>>,
    _guard: OwnedMutexGuard<()>,
    order_id: String,
    amount: i64,
    reference: Option<String>,
) -> Result<i64, OrderError> {
    if let Err(e) = store
        .transition_status(&order_id, OrderStatus::Pending, OrderStatus::Charged)
        .await
    {
        if amount > 0 {
            error!(
                charged_cents = amount,
                charge_reference = reference.as_deref().unwrap_or("-"),
                error = %e,
                "Charge captured but order status was not persisted"
            );
        }
        return Err(transition_error(e, OrderStatus::Charged));
    }

    info!(charged_cents = amount, "Order charged");
    publish(
        &events,
        OrderEvent::Charged(OrderChargedEvent {
            order_id,
            charged_cents: amount,
            charge_reference: reference,
            timestamp: now_timestamp(),
        }),
    );

    Ok(amount)
}

fn validate_new_order(order: &Order) -> Result<i64, OrderError> {
    if !order.customer_email.contains('@') {
        return Err(OrderError::Validation("invalid customerEmail".to_string()));
    }
    if order.line_items.is_empty() {
        return Err(OrderError::Validation(
            "an order must contain at least one line item".to_string(),
        ));
    }
    if let Some(item) = order.line_items.iter().find(|item| item.quantity < 1) {
        return Err(OrderError::Validation(format!(
            "line item {} must have a quantity of at least 1",
            item.description
        )));
    }

    let total = order
        .checked_total_cents()
        .ok_or_else(|| OrderError::Validation("order total is out of range".to_string()))?;
    if total < 0 {
        return Err(OrderError::Validation(
            "an order's total cannot be less than 0".to_string(),
        ));
    }
    Ok(total)
}

fn ensure_transition(order: &Order, to: OrderStatus) -> Result<(), OrderError> {
    if order.status.can_transition_to(to) {
        Ok(())
    } else {
        Err(OrderError::InvalidTransition {
            from: order.status,
            to,
        })
    }
}

fn transition_error(err: StoreError, to: OrderStatus) -> OrderError {
    match err {
        StoreError::StatusMismatch { actual, .. } => OrderError::InvalidTransition { from: actual, to },
        other => other.into(),
    }
}

/// Stable error kind the request surface maps to a transport status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidTransition,
    Validation,
    Gateway,
    /// The gateway's circuit is open; nothing was sent
    Unavailable,
    InvalidState,
    Storage,
}

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("Order not found: {0}")]
    NotFound(String),

    #[error("Order already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition {
        from: OrderStatus,
        to: OrderStatus,
    },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Gateway unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid order state: {0}")]
    InvalidState(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl OrderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrderError::NotFound(_) => ErrorKind::NotFound,
            OrderError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            OrderError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            OrderError::Validation(_) => ErrorKind::Validation,
            OrderError::Gateway(_) => ErrorKind::Gateway,
            OrderError::Unavailable(_) => ErrorKind::Unavailable,
            OrderError::InvalidState(_) => ErrorKind::InvalidState,
            OrderError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Only gateway failures are safe for the caller to retry as-is
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Gateway | ErrorKind::Unavailable)
    }
}

impl From<StoreError> for OrderError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => OrderError::NotFound(id),
            StoreError::AlreadyExists(id) => OrderError::AlreadyExists(id),
            StoreError::StatusMismatch { id, expected, actual } => OrderError::InvalidState(format!(
                "order {} changed from {} to {} outside the engine",
                id, expected, actual
            )),
            StoreError::Backend(msg) => OrderError::Storage(msg),
        }
    }
}

impl From<GatewayError> for OrderError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Unavailable(_) => OrderError::Unavailable(err.to_string()),
            other => OrderError::Gateway(other.to_string()),
        }
    }
}

impl From<FulfillmentError> for OrderError {
    fn from(err: FulfillmentError) -> Self {
        match err {
            FulfillmentError::ItemFailed {
                source: GatewayError::Unavailable(_),
                ..
            } => OrderError::Unavailable(err.to_string()),
            other => OrderError::Gateway(other.to_string()),
        }
    }
}

impl From<CoreError> for OrderError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ValidationError(msg) => OrderError::Validation(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fulfillment::MockFulfillmentGateway;
    use crate::orchestrator::MockChargeGateway;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Mutex;

    /// Minimal store double; the real backends live in orderup-store.
    #[derive(Default)]
    struct TestStore {
        orders: Mutex<HashMap<String, Order>>,
        inserts: AtomicUsize,
        next_id: AtomicUsize,
        write_delay: Option<Duration>,
    }

    impl TestStore {
        fn seed(&self, id: &str, status: OrderStatus, items: Vec<LineItem>) {
            let mut order = Order::new("test@test".to_string(), items);
            order.id = id.to_string();
            order.status = status;
            self.orders.lock().unwrap().insert(id.to_string(), order);
        }

        fn status_of(&self, id: &str) -> OrderStatus {
            self.orders.lock().unwrap()[id].status
        }
    }

    #[async_trait]
    impl OrderStore for TestStore {
        async fn get(&self, id: &str) -> Result<Order, StoreError> {
            self.orders
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(id.to_string()))
        }

        async fn list(&self, filter: StatusFilter) -> Result<Vec<Order>, StoreError> {
            Ok(self
                .orders
                .lock()
                .unwrap()
                .values()
                .filter(|o| filter.matches(o.status))
                .cloned()
                .collect())
        }

        async fn insert(&self, mut order: Order) -> Result<String, StoreError> {
            self.inserts.fetch_add(1, AtomicOrdering::SeqCst);
            let mut orders = self.orders.lock().unwrap();
            if order.id.is_empty() {
                order.id = format!("gen-{}", self.next_id.fetch_add(1, AtomicOrdering::SeqCst));
            } else if orders.contains_key(&order.id) {
                return Err(StoreError::AlreadyExists(order.id));
            }
            let id = order.id.clone();
            orders.insert(id.clone(), order);
            Ok(id)
        }

        async fn set_status(&self, id: &str, status: OrderStatus) -> Result<(), StoreError> {
            if let Some(delay) = self.write_delay {
                tokio::time::sleep(delay).await;
            }
            let mut orders = self.orders.lock().unwrap();
            let order = orders
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            order.status = status;
            Ok(())
        }
    }

    struct Harness {
        store: Arc<TestStore>,
        charges: Arc<MockChargeGateway>,
        shipments: Arc<MockFulfillmentGateway>,
        manager: Arc<OrderManager>,
    }

    fn harness_with(charges: MockChargeGateway) -> Harness {
        harness_from(TestStore::default(), charges, EngineSettings::default())
    }

    fn harness_from(store: TestStore, charges: MockChargeGateway, settings: EngineSettings) -> Harness {
        let store = Arc::new(store);
        let charges = Arc::new(charges);
        let shipments = Arc::new(MockFulfillmentGateway::new());
        let manager = Arc::new(OrderManager::new(
            store.clone(),
            charges.clone(),
            shipments.clone(),
            settings,
        ));
        Harness {
            store,
            charges,
            shipments,
            manager,
        }
    }

    fn harness() -> Harness {
        harness_with(MockChargeGateway::new())
    }

    #[tokio::test]
    async fn test_create_order_assigns_id_and_pending_status() {
        let h = harness();

        let order = h
            .manager
            .create_order("test@test".to_string(), vec![LineItem::new("item", 100, 2)])
            .await
            .unwrap();

        assert!(!order.id.is_empty());
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.total_cents(), 200);
        assert_eq!(h.manager.get_order(&order.id).await.unwrap(), order);
    }

    #[tokio::test]
    async fn test_create_order_validation_happens_before_store_write() {
        let h = harness();

        let cases = vec![
            ("no-at-sign", vec![LineItem::new("item", 100, 1)]),
            ("test@test", vec![]),
            ("test@test", vec![LineItem::new("item", 100, 0)]),
            (
                "test@test",
                vec![LineItem::new("item", 100, 1), LineItem::new("discount", -200, 1)],
            ),
        ];

        for (email, items) in cases {
            let err = h.manager.create_order(email.to_string(), items).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{:?}", err);
        }
        assert_eq!(h.store.inserts.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_create_order_with_duplicate_id() {
        let h = harness();
        let items = vec![LineItem::new("item", 100, 1)];

        h.manager
            .create_order_with_id("fixed".to_string(), "a@b".to_string(), items.clone())
            .await
            .unwrap();
        let err = h
            .manager
            .create_order_with_id("fixed".to_string(), "other@b".to_string(), items)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(
            h.manager.get_order("fixed").await.unwrap().customer_email,
            "a@b"
        );
    }

    #[tokio::test]
    async fn test_create_order_with_empty_id_lets_store_assign() {
        let h = harness();
        let items = vec![LineItem::new("item", 100, 1)];

        let order = h
            .manager
            .create_order_with_id(String::new(), "a@b".to_string(), items.clone())
            .await
            .unwrap();
        assert!(order.id.starts_with("gen-"));

        let err = h
            .manager
            .create_order_with_id("   ".to_string(), "a@b".to_string(), items)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_get_and_list() {
        let h = harness();
        h.store.seed("p", OrderStatus::Pending, vec![LineItem::new("a", 1, 1)]);
        h.store.seed("c", OrderStatus::Charged, vec![LineItem::new("a", 1, 1)]);

        let err = h.manager.get_order("missing").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        assert_eq!(h.manager.list_orders(StatusFilter::Any).await.unwrap().len(), 2);
        let charged = h
            .manager
            .list_orders(OrderStatus::Charged.into())
            .await
            .unwrap();
        assert_eq!(charged.len(), 1);
        assert_eq!(charged[0].id, "c");
        assert!(h
            .manager
            .list_orders(OrderStatus::Fulfilled.into())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_charge_pending_order() {
        let h = harness();
        h.store.seed("o", OrderStatus::Pending, vec![LineItem::new("item", 100, 1)]);

        let charged = h.manager.charge_order("o", "tok").await.unwrap();

        assert_eq!(charged, 100);
        assert_eq!(h.charges.call_count(), 1);
        assert_eq!(h.charges.calls()[0].amount_cents, 100);
        assert_eq!(h.store.status_of("o"), OrderStatus::Charged);
    }

    #[tokio::test]
    async fn test_charge_zero_total_skips_gateway() {
        let h = harness();
        h.store.seed(
            "o",
            OrderStatus::Pending,
            vec![LineItem::new("item", 100, 1), LineItem::new("discount", -100, 1)],
        );

        let charged = h.manager.charge_order("o", "").await.unwrap();

        assert_eq!(charged, 0);
        assert_eq!(h.charges.call_count(), 0);
        assert_eq!(h.store.status_of("o"), OrderStatus::Charged);
    }

    #[tokio::test]
    async fn test_charge_rejects_non_pending_orders() {
        let h = harness();
        h.store.seed("c", OrderStatus::Charged, vec![LineItem::new("item", 100, 1)]);
        h.store.seed("f", OrderStatus::Fulfilled, vec![LineItem::new("item", 100, 1)]);

        for id in ["c", "f"] {
            let err = h.manager.charge_order(id, "tok").await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidTransition);
        }
        assert_eq!(h.charges.call_count(), 0);
        assert_eq!(h.store.status_of("f"), OrderStatus::Fulfilled);
    }

    #[tokio::test]
    async fn test_charge_missing_order() {
        let h = harness();
        let err = h.manager.charge_order("nope", "tok").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_charge_gateway_failure_leaves_order_pending() {
        let h = harness_with(MockChargeGateway::failing());
        h.store.seed("o", OrderStatus::Pending, vec![LineItem::new("item", 100, 1)]);

        let err = h.manager.charge_order("o", "tok").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Gateway);
        assert!(err.is_retryable());
        assert_eq!(h.store.status_of("o"), OrderStatus::Pending);

        // Retry after the gateway recovers
        h.charges.set_failing(false);
        assert_eq!(h.manager.charge_order("o", "tok").await.unwrap(), 100);
        assert_eq!(h.store.status_of("o"), OrderStatus::Charged);
    }

    #[tokio::test]
    async fn test_charge_negative_total_is_invalid_state() {
        let h = harness();
        h.store.seed("o", OrderStatus::Pending, vec![LineItem::new("refund", -100, 1)]);

        let err = h.manager.charge_order("o", "tok").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(h.charges.call_count(), 0);
        assert_eq!(h.store.status_of("o"), OrderStatus::Pending);
    }

    #[tokio::test]
    async fn test_charge_requires_token_for_positive_total() {
        let h = harness();
        h.store.seed("o", OrderStatus::Pending, vec![LineItem::new("item", 100, 1)]);

        let err = h.manager.charge_order("o", "  ").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(h.charges.call_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_charges_hit_gateway_once() {
        let h = harness_with(MockChargeGateway::with_delay(Duration::from_millis(20)));
        h.store.seed("o", OrderStatus::Pending, vec![LineItem::new("item", 100, 1)]);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let manager = h.manager.clone();
            handles.push(tokio::spawn(async move { manager.charge_order("o", "tok").await }));
        }

        let mut successes = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(amount) => {
                    assert_eq!(amount, 100);
                    successes += 1;
                }
                Err(e) => {
                    assert_eq!(e.kind(), ErrorKind::InvalidTransition);
                    conflicts += 1;
                }
            }
        }

        assert_eq!(successes, 1);
        assert_eq!(conflicts, 9);
        assert_eq!(h.charges.call_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_charges_on_different_orders_run_in_parallel() {
        let h = harness_with(MockChargeGateway::with_delay(Duration::from_millis(200)));
        for i in 0..5 {
            h.store.seed(&format!("o{}", i), OrderStatus::Pending, vec![LineItem::new("x", 10, 1)]);
        }

        let started = std::time::Instant::now();
        let mut handles = Vec::new();
        for i in 0..5 {
            let manager = h.manager.clone();
            handles.push(tokio::spawn(async move {
                manager.charge_order(&format!("o{}", i), "tok").await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // Serialized this would take at least a second
        assert!(started.elapsed() < Duration::from_millis(900));
        assert_eq!(h.charges.call_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_charge_commits_nothing() {
        let h = harness_with(MockChargeGateway::with_delay(Duration::from_secs(5)));
        h.store.seed("o", OrderStatus::Pending, vec![LineItem::new("item", 100, 1)]);

        let attempt =
            tokio::time::timeout(Duration::from_secs(1), h.manager.charge_order("o", "tok")).await;

        assert!(attempt.is_err());
        assert_eq!(h.store.status_of("o"), OrderStatus::Pending);
        assert_eq!(h.charges.call_count(), 0);

        // The dropped future released the order lock
        assert_eq!(h.manager.charge_order("o", "tok").await.unwrap(), 100);
        assert_eq!(h.charges.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_dropped_after_capture_still_commits() {
        let store = TestStore {
            write_delay: Some(Duration::from_secs(5)),
            ..TestStore::default()
        };
        let h = harness_from(store, MockChargeGateway::new(), EngineSettings::default());
        h.store.seed("o", OrderStatus::Pending, vec![LineItem::new("item", 100, 1)]);

        let attempt =
            tokio::time::timeout(Duration::from_secs(1), h.manager.charge_order("o", "tok")).await;
        assert!(attempt.is_err());
        assert_eq!(h.charges.call_count(), 1);

        // The retry queues behind the commit and sees the charged order
        let err = h.manager.charge_order("o", "tok").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
        assert_eq!(h.store.status_of("o"), OrderStatus::Charged);
        assert_eq!(h.charges.call_count(), 1);
    }

    #[tokio::test]
    async fn test_open_charge_circuit_only_blocks_gateway_calls() {
        let settings = EngineSettings {
            circuit_breaker: BreakerSettings {
                failure_threshold: 1,
                reset_timeout: Duration::from_secs(60),
            },
            ..EngineSettings::default()
        };
        let h = harness_from(TestStore::default(), MockChargeGateway::unreachable(), settings);
        h.store.seed("o", OrderStatus::Pending, vec![LineItem::new("item", 100, 1)]);
        h.store.seed(
            "free",
            OrderStatus::Pending,
            vec![LineItem::new("item", 100, 1), LineItem::new("voucher", -100, 1)],
        );

        let err = h.manager.charge_order("o", "tok").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Gateway);
        assert_eq!(h.manager.circuit_states().0, CircuitState::Open);

        let err = h.manager.charge_order("o", "tok").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert!(err.is_retryable());
        assert_eq!(h.charges.call_count(), 1);
        assert_eq!(h.store.status_of("o"), OrderStatus::Pending);

        // Nothing to charge, so the open circuit is irrelevant
        assert_eq!(h.manager.charge_order("free", "").await.unwrap(), 0);
        assert_eq!(h.store.status_of("free"), OrderStatus::Charged);
    }

    #[tokio::test]
    async fn test_fulfill_twice_is_idempotent() {
        let h = harness();
        h.store.seed(
            "o",
            OrderStatus::Charged,
            vec![
                LineItem::new("item 1", 1000, 1),
                LineItem::new("item 2", 5000, 10),
                LineItem::new("discount", -1000, 1),
            ],
        );

        h.manager.fulfill_order("o").await.unwrap();
        assert_eq!(h.shipments.call_count(), 2);
        assert_eq!(h.store.status_of("o"), OrderStatus::Fulfilled);

        h.manager.fulfill_order("o").await.unwrap();
        assert_eq!(h.shipments.call_count(), 2);
        assert!(!h.shipments.was_shipped("o", "discount"));
    }

    #[tokio::test]
    async fn test_fulfill_requires_charged_order() {
        let h = harness();
        h.store.seed("o", OrderStatus::Pending, vec![LineItem::new("item", 100, 1)]);

        let err = h.manager.fulfill_order("o").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
        assert_eq!(h.shipments.call_count(), 0);
        assert_eq!(
            h.manager.fulfill_order("missing").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_fulfill_failure_leaves_order_charged() {
        let h = harness();
        h.store.seed(
            "o",
            OrderStatus::Charged,
            vec![LineItem::new("item 1", 100, 1), LineItem::new("item 2", 100, 1)],
        );
        h.shipments.fail_on("item 2");

        let err = h.manager.fulfill_order("o").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Gateway);
        assert_eq!(h.store.status_of("o"), OrderStatus::Charged);

        // Full retry; the gateway de-duplicates item 1
        h.shipments.clear_failures();
        h.manager.fulfill_order("o").await.unwrap();
        assert_eq!(h.store.status_of("o"), OrderStatus::Fulfilled);
        assert_eq!(h.shipments.shipped_count(), 2);
    }

    #[tokio::test]
    async fn test_full_lifecycle_publishes_events() {
        let h = harness();
        let (tx, mut rx) = broadcast::channel(16);
        let manager = OrderManager::new(
            h.store.clone(),
            h.charges.clone(),
            h.shipments.clone(),
            EngineSettings::default(),
        )
        .with_events(tx);

        let order = manager
            .create_order("test@test".to_string(), vec![LineItem::new("item", 250, 2)])
            .await
            .unwrap();
        assert_eq!(manager.charge_order(&order.id, "tok").await.unwrap(), 500);
        manager.fulfill_order(&order.id).await.unwrap();

        let created = rx.recv().await.unwrap();
        assert!(matches!(created, OrderEvent::Created(ref e) if e.total_cents == 500));
        let charged = rx.recv().await.unwrap();
        assert!(matches!(
            charged,
            OrderEvent::Charged(ref e) if e.charge_reference.as_deref() == Some("mock_ch_1")
        ));
        let fulfilled = rx.recv().await.unwrap();
        assert!(matches!(fulfilled, OrderEvent::Fulfilled(ref e) if e.shipped_items == 1));
        assert_eq!(fulfilled.order_id(), order.id);
    }
}
