pub mod handlers;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower::ServiceBuilder;

use crate::db::InvoiceStore;
use crate::gateway::InvoicingGateway;
use crate::service::{InvoiceOrchestrator, RateLimitStore};

pub use handlers::*;

/// 上传表格大小上限
const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

/// 共享状态
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<InvoiceOrchestrator>,
    pub store: Arc<dyn InvoiceStore>,
    pub gateway: Arc<dyn InvoicingGateway>,
    pub rate_limiter: Arc<dyn RateLimitStore>,
    /// 表单未指定 serie 时使用
    pub default_serie: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/invoices", get(list_invoices).post(create_invoice))
        .route("/api/invoices/reconcile", post(reconcile_pending))
        .route("/api/invoices/:id", get(get_invoice))
        .route("/api/invoices/:id/download/:kind", get(download_artifact))
        .route("/api/errors/:file", get(download_error_sheet))
        .route("/api/series", get(list_series))
        .route("/api/cfdis", get(list_cfdis))
        .layer(ServiceBuilder::new().layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)))
        .with_state(state)
}
