use crate::breaker::{BreakerSettings, CircuitBreaker, CircuitState};
use orderup_core::payment::{ChargeGateway, ChargeReceipt, ChargeRequest};
use orderup_core::GatewayError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Wraps the charge gateway with a deadline, a circuit breaker and logging.
pub struct PaymentOrchestrator {
    gateway: Arc<dyn ChargeGateway>,
    timeout: Duration,
    breaker: CircuitBreaker,
}

impl PaymentOrchestrator {
    pub fn new(gateway: Arc<dyn ChargeGateway>, timeout: Duration, breaker: BreakerSettings) -> Self {
        Self {
            gateway,
            timeout,
            breaker: CircuitBreaker::new("charge", breaker),
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Capture `amount_cents` for an order.
    ///
    /// Only returns `Ok` once the gateway acknowledged the charge. A timeout is
    /// reported as a gateway failure; the remote outcome is then unknown.
    pub async fn capture(
        &self,
        order_id: &str,
        payment_token: &str,
        amount_cents: i64,
    ) -> Result<ChargeReceipt, GatewayError> {
        let request = ChargeRequest {
            payment_token: payment_token.to_string(),
            amount_cents,
        };

        let permit = self.breaker.admit().inspect_err(|e| {
            warn!(order_id, amount_cents, error = %e, "Charge refused");
        })?;
        debug!(order_id, amount_cents, "Submitting charge");

        let outcome = match tokio::time::timeout(self.timeout, self.gateway.charge(&request)).await {
            Ok(Ok(receipt)) => {
                info!(
                    order_id,
                    amount_cents,
                    reference = receipt.reference.as_deref().unwrap_or("-"),
                    "Charge captured"
                );
                Ok(receipt)
            }
            Ok(Err(e)) => {
                warn!(order_id, amount_cents, error = %e, "Charge failed");
                Err(e)
            }
            Err(_) => {
                warn!(order_id, amount_cents, timeout = ?self.timeout, "Charge timed out");
                Err(GatewayError::Timeout(self.timeout))
            }
        };
        permit.record(&outcome);
        outcome
    }
}

/// In-process charge gateway that records every request.
#[derive(Default)]
pub struct MockChargeGateway {
    calls: Mutex<Vec<ChargeRequest>>,
    failing: AtomicBool,
    unreachable: AtomicBool,
    delay: Option<Duration>,
}

impl MockChargeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every charge is declined
    pub fn failing() -> Self {
        let gateway = Self::default();
        gateway.set_failing(true);
        gateway
    }

    /// Every charge fails at the transport level, as if the service were down
    pub fn unreachable() -> Self {
        let gateway = Self::default();
        gateway.set_unreachable(true);
        gateway
    }

    /// Every charge takes `delay` before answering
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<ChargeRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl ChargeGateway for MockChargeGateway {
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, GatewayError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let attempt = {
            let mut calls = self
                .calls
                .lock()
                .map_err(|_| GatewayError::Transport("mock state poisoned".into()))?;
            calls.push(request.clone());
            calls.len()
        };

        if self.unreachable.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("connection refused".to_string()));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(GatewayError::Rejected {
                status: 402,
                body: "card declined".to_string(),
            });
        }

        Ok(ChargeReceipt {
            reference: Some(format!("mock_ch_{}", attempt)),
        })
    }
}
