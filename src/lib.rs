pub mod api;
pub mod config;
pub mod db;
pub mod gateway;
pub mod models;
pub mod service;

pub use config::AppConfig;
pub use db::{create_pool, InMemoryInvoiceStore, InvoiceStore, PgInvoiceStore};
pub use gateway::{FacturamaClient, InvoicingGateway};
pub use service::{InvoiceOrchestrator, InvoiceRequest};
