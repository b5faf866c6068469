use std::sync::Arc;

use crate::db::{InvoiceStore, StoreError};

/// 系列校验/分配失败
#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    #[error("La serie {0} no existe")]
    SeriesNotFound(String),

    #[error("La serie {0} está inactiva")]
    SeriesInactive(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Folio 分配器
///
/// `reserve` 只读: 候选值 = max(计数器, 已有非 failed 记录的最大 folio) + 1,
/// 不修改计数器, 因此提交失败不会消耗 folio。并发下两个请求可能拿到同一候选,
/// 由写入 pending 记录时的唯一约束兜底 (`StoreError::FolioConflict`)。
/// `commit` 只在提交成功后调用, 单调递增、可重复调用。
#[derive(Clone)]
pub struct SequenceAllocator {
    store: Arc<dyn InvoiceStore>,
}

impl SequenceAllocator {
    pub fn new(store: Arc<dyn InvoiceStore>) -> Self {
        Self { store }
    }

    pub async fn reserve(&self, serie: &str) -> Result<i64, AllocationError> {
        let series = self
            .store
            .get_series(serie)
            .await?
            .ok_or_else(|| AllocationError::SeriesNotFound(serie.to_string()))?;
        if !series.is_active {
            return Err(AllocationError::SeriesInactive(serie.to_string()));
        }

        let counter = self.store.counter_last_folio(serie).await?.unwrap_or(0);
        let max_recorded = self.store.max_invoice_folio(serie).await?.unwrap_or(0);
        let candidate = counter.max(max_recorded) + 1;

        tracing::debug!(
            "serie {}: contador {}, máximo registrado {}, candidato {}",
            serie, counter, max_recorded, candidate
        );
        Ok(candidate)
    }

    pub async fn commit(&self, serie: &str, folio: i64) -> Result<i64, StoreError> {
        let last = self.store.raise_counter(serie, folio).await?;
        tracing::info!("serie {}: folio {} confirmado (contador {})", serie, folio, last);
        Ok(last)
    }
}
