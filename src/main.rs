use chrono::Duration;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

use factura_global::api::{self, AppState};
use factura_global::db::run_migrations;
use factura_global::service::{ArtifactStore, InMemoryRateLimiter, InvoiceOrchestrator};
use factura_global::{create_pool, AppConfig, FacturamaClient, InvoiceStore, PgInvoiceStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化日志 - 本地时间, RUST_LOG 控制级别
    tracing_subscriber::fmt()
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string()))
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .with_level(true)
        .init();

    // 加载配置 (APP_CONFIG 指向可选的 TOML 文件)
    let config_file = std::env::var("APP_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"));
    let config = AppConfig::load(Some(&config_file))?;
    info!("Starting server with config: {:?}", config);

    // 数据库
    let pool = create_pool(&config.database.url).await?;
    run_migrations(&pool).await?;
    info!("Database pool created, migrations applied");

    let store: Arc<dyn InvoiceStore> = Arc::new(PgInvoiceStore::new(pool));
    store
        .ensure_series(&config.invoicing.default_serie, "Serie por defecto")
        .await?;

    // 文件目录
    let artifacts = ArtifactStore::new(&config.storage.dir);
    artifacts.ensure_dirs().await?;

    let gateway = Arc::new(FacturamaClient::new(&config.gateway)?);
    let orchestrator = InvoiceOrchestrator::new(store.clone(), gateway.clone(), artifacts)
        .with_reconcile_after(Duration::minutes(config.invoicing.reconcile_after_minutes));

    let rate_limiter = Arc::new(InMemoryRateLimiter::new(
        config.rate_limit.submit_count,
        Duration::seconds(config.rate_limit.submit_window_secs as i64),
    ));

    let state = AppState {
        orchestrator: Arc::new(orchestrator),
        store,
        gateway,
        rate_limiter,
        default_serie: config.invoicing.default_serie.clone(),
    };
    let app = api::router(state);

    // 启动服务器
    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Server listening on {}", addr);
    info!("API Endpoints:");
    info!("  POST /api/invoices                    - upload + timbrado");
    info!("  GET  /api/invoices/:id/download/:kind - pdf | xml | zip");
    info!("  POST /api/invoices/reconcile          - resolve stale pending");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
