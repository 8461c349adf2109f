pub mod breaker;
pub mod manager;
pub mod fulfillment;
pub mod orchestrator;
pub mod locks;

pub use breaker::{BreakerSettings, CircuitBreaker, CircuitState};
pub use manager::{EngineSettings, ErrorKind, OrderError, OrderManager};
pub use fulfillment::{FulfillmentError, FulfillmentService, MockFulfillmentGateway};
pub use locks::OrderLocks;
pub use orchestrator::{MockChargeGateway, PaymentOrchestrator};
