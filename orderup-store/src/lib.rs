pub mod app_config;
pub mod database;
pub mod gateways;
pub mod memory;
pub mod order_repo;

pub use database::DbClient;
pub use gateways::{HttpChargeGateway, HttpFulfillmentGateway};
pub use memory::MemoryOrderStore;
pub use order_repo::PgOrderStore;
