use std::sync::Arc;
use orderup_order::OrderManager;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<OrderManager>,
}

impl AppState {
    pub fn new(manager: Arc<OrderManager>) -> Self {
        Self { manager }
    }
}
