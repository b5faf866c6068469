//! 持久化抽象。
//!
//! `InvoiceStore` 是流水线唯一依赖的存储接口; `PgInvoiceStore` 用于生产,
//! `InMemoryInvoiceStore` 用于测试与本地调试。两者对 (serie, folio) 的唯一性
//! 规则一致: 只有非 failed 的记录占用 folio。

pub mod memory;
pub mod pool;
pub mod queries;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    ArtifactPaths, InvoiceDetail, InvoiceFilter, InvoiceLineItem, InvoiceRecord, NewInvoice,
    SeriesDefinition, SeriesSummary, SubmissionUpdate,
};

pub use memory::InMemoryInvoiceStore;
pub use pool::{create_pool, run_migrations};
pub use queries::PgInvoiceStore;

/// 存储层错误
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// (serie, folio) 唯一约束冲突
    #[error("El folio {folio} de la serie {serie} ya existe. Intenta de nuevo.")]
    FolioConflict { serie: String, folio: i64 },

    /// 记录不存在或已离开 pending 状态
    #[error("la factura {0} no existe o ya no está pendiente")]
    NotPending(i64),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait InvoiceStore: Send + Sync {
    async fn get_series(&self, code: &str) -> Result<Option<SeriesDefinition>, StoreError>;

    /// 不存在时创建 (启动时的默认系列)
    async fn ensure_series(&self, code: &str, description: &str) -> Result<(), StoreError>;

    async fn list_series(&self) -> Result<Vec<SeriesSummary>, StoreError>;

    async fn counter_last_folio(&self, code: &str) -> Result<Option<i64>, StoreError>;

    /// 该系列非 failed 记录中的最大 folio
    async fn max_invoice_folio(&self, code: &str) -> Result<Option<i64>, StoreError>;

    /// 条件更新: 仅当 folio 大于当前值时抬高计数器, 返回更新后的 last_folio
    async fn raise_counter(&self, code: &str, folio: i64) -> Result<i64, StoreError>;

    /// 写入 pending 记录, 冲突时返回 `StoreError::FolioConflict`
    async fn insert_pending(&self, invoice: &NewInvoice) -> Result<i64, StoreError>;

    /// pending -> success, 同一事务内写入明细
    async fn record_submission(
        &self,
        id: i64,
        update: &SubmissionUpdate,
        items: &[InvoiceLineItem],
    ) -> Result<(), StoreError>;

    async fn attach_artifacts(&self, id: i64, paths: &ArtifactPaths) -> Result<(), StoreError>;

    /// pending -> failed
    async fn mark_failed(
        &self,
        id: i64,
        error_message: &str,
        response_json: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn get_invoice(&self, id: i64) -> Result<Option<InvoiceDetail>, StoreError>;

    /// 按创建时间倒序
    async fn list_invoices(&self, filter: &InvoiceFilter) -> Result<Vec<InvoiceRecord>, StoreError>;

    async fn list_stale_pending(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<InvoiceRecord>, StoreError>;
}
