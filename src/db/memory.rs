use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::{InvoiceStore, StoreError};
use crate::models::{
    ArtifactPaths, InvoiceDetail, InvoiceFilter, InvoiceLineItem, InvoiceRecord, InvoiceStatus,
    NewInvoice, SeriesDefinition, SeriesSummary, SubmissionUpdate,
};

#[derive(Debug, Default)]
struct State {
    series: HashMap<String, SeriesDefinition>,
    counters: HashMap<String, i64>,
    invoices: Vec<InvoiceRecord>,
    items: HashMap<i64, Vec<InvoiceLineItem>>,
    next_id: i64,
}

/// 内存存储, 用于测试与本地调试
#[derive(Debug, Default)]
pub struct InMemoryInvoiceStore {
    state: RwLock<State>,
}

fn poisoned() -> StoreError {
    StoreError::Storage("lock poisoned".to_string())
}

impl InMemoryInvoiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// 写入或覆盖系列定义
    pub fn put_series(&self, code: &str, description: &str, is_active: bool) {
        if let Ok(mut state) = self.state.write() {
            state.series.insert(
                code.to_string(),
                SeriesDefinition {
                    code: code.to_string(),
                    description: description.to_string(),
                    is_active,
                },
            );
        }
    }

    /// 直接设置计数器 (模拟历史数据)
    pub fn set_counter(&self, code: &str, last_folio: i64) {
        if let Ok(mut state) = self.state.write() {
            state.counters.insert(code.to_string(), last_folio);
        }
    }

    /// 直接写入一条已有记录 (模拟导入的历史发票)
    pub fn seed_invoice(&self, serie: &str, folio: i64, status: InvoiceStatus) -> i64 {
        let Ok(mut state) = self.state.write() else {
            return 0;
        };
        state.next_id += 1;
        let id = state.next_id;
        state.invoices.push(InvoiceRecord {
            id,
            created_at: Utc::now(),
            status,
            serie: serie.to_string(),
            folio,
            facturama_id: None,
            uuid: None,
            issue_date: Utc::now().date_naive(),
            excel_filename: "historico.csv".to_string(),
            request_json: "{}".to_string(),
            response_json: None,
            error_message: None,
            pdf_path: None,
            xml_path: None,
            zip_path: None,
        });
        id
    }

    /// 调整创建时间 (对账测试)
    pub fn backdate(&self, id: i64, created_at: DateTime<Utc>) {
        if let Ok(mut state) = self.state.write() {
            if let Some(inv) = state.invoices.iter_mut().find(|i| i.id == id) {
                inv.created_at = created_at;
            }
        }
    }

    pub fn invoice_count(&self) -> usize {
        self.state.read().map(|s| s.invoices.len()).unwrap_or(0)
    }
}

#[async_trait]
impl InvoiceStore for InMemoryInvoiceStore {
    async fn get_series(&self, code: &str) -> Result<Option<SeriesDefinition>, StoreError> {
        let state = self.state.read().map_err(|_| poisoned())?;
        Ok(state.series.get(code).cloned())
    }

    async fn ensure_series(&self, code: &str, description: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        state
            .series
            .entry(code.to_string())
            .or_insert_with(|| SeriesDefinition {
                code: code.to_string(),
                description: description.to_string(),
                is_active: true,
            });
        Ok(())
    }

    async fn list_series(&self) -> Result<Vec<SeriesSummary>, StoreError> {
        let state = self.state.read().map_err(|_| poisoned())?;
        let mut rows: Vec<SeriesSummary> = state
            .series
            .values()
            .map(|s| SeriesSummary {
                code: s.code.clone(),
                description: s.description.clone(),
                is_active: s.is_active,
                last_folio: state.counters.get(&s.code).copied(),
            })
            .collect();
        rows.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(rows)
    }

    async fn counter_last_folio(&self, code: &str) -> Result<Option<i64>, StoreError> {
        let state = self.state.read().map_err(|_| poisoned())?;
        Ok(state.counters.get(code).copied())
    }

    async fn max_invoice_folio(&self, code: &str) -> Result<Option<i64>, StoreError> {
        let state = self.state.read().map_err(|_| poisoned())?;
        Ok(state
            .invoices
            .iter()
            .filter(|i| i.serie == code && i.status != InvoiceStatus::Failed)
            .map(|i| i.folio)
            .max())
    }

    async fn raise_counter(&self, code: &str, folio: i64) -> Result<i64, StoreError> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        let last = state.counters.entry(code.to_string()).or_insert(folio);
        if folio > *last {
            *last = folio;
        }
        Ok(*last)
    }

    async fn insert_pending(&self, invoice: &NewInvoice) -> Result<i64, StoreError> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        let taken = state.invoices.iter().any(|i| {
            i.serie == invoice.serie && i.folio == invoice.folio && i.status != InvoiceStatus::Failed
        });
        if taken {
            return Err(StoreError::FolioConflict {
                serie: invoice.serie.clone(),
                folio: invoice.folio,
            });
        }

        state.next_id += 1;
        let id = state.next_id;
        state.invoices.push(InvoiceRecord {
            id,
            created_at: Utc::now(),
            status: InvoiceStatus::Pending,
            serie: invoice.serie.clone(),
            folio: invoice.folio,
            facturama_id: None,
            uuid: None,
            issue_date: invoice.issue_date,
            excel_filename: invoice.excel_filename.clone(),
            request_json: invoice.request_json.clone(),
            response_json: None,
            error_message: None,
            pdf_path: None,
            xml_path: None,
            zip_path: None,
        });
        Ok(id)
    }

    async fn record_submission(
        &self,
        id: i64,
        update: &SubmissionUpdate,
        items: &[InvoiceLineItem],
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        let inv = state
            .invoices
            .iter_mut()
            .find(|i| i.id == id && i.status == InvoiceStatus::Pending)
            .ok_or(StoreError::NotPending(id))?;

        inv.status = InvoiceStatus::Success;
        inv.facturama_id = update.facturama_id.clone();
        inv.uuid = update.uuid.clone();
        inv.response_json = Some(update.response_json.clone());
        state.items.insert(id, items.to_vec());
        Ok(())
    }

    async fn attach_artifacts(&self, id: i64, paths: &ArtifactPaths) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        if let Some(inv) = state.invoices.iter_mut().find(|i| i.id == id) {
            if paths.pdf_path.is_some() {
                inv.pdf_path = paths.pdf_path.clone();
            }
            if paths.xml_path.is_some() {
                inv.xml_path = paths.xml_path.clone();
            }
            if paths.zip_path.is_some() {
                inv.zip_path = paths.zip_path.clone();
            }
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: i64,
        error_message: &str,
        response_json: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        let inv = state
            .invoices
            .iter_mut()
            .find(|i| i.id == id && i.status == InvoiceStatus::Pending)
            .ok_or(StoreError::NotPending(id))?;

        inv.status = InvoiceStatus::Failed;
        inv.error_message = Some(error_message.to_string());
        if let Some(resp) = response_json {
            inv.response_json = Some(resp.to_string());
        }
        Ok(())
    }

    async fn get_invoice(&self, id: i64) -> Result<Option<InvoiceDetail>, StoreError> {
        let state = self.state.read().map_err(|_| poisoned())?;
        Ok(state
            .invoices
            .iter()
            .find(|i| i.id == id)
            .map(|record| InvoiceDetail {
                record: record.clone(),
                items: state.items.get(&id).cloned().unwrap_or_default(),
            }))
    }

    async fn list_invoices(&self, filter: &InvoiceFilter) -> Result<Vec<InvoiceRecord>, StoreError> {
        let state = self.state.read().map_err(|_| poisoned())?;
        let mut rows: Vec<InvoiceRecord> = state
            .invoices
            .iter()
            .filter(|i| {
                let created = i.created_at.date_naive();
                filter.date_start.map_or(true, |d| created >= d)
                    && filter.date_end.map_or(true, |d| created <= d)
                    && filter.serie.as_deref().map_or(true, |s| i.serie == s)
                    && filter.status.map_or(true, |s| i.status == s)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(rows)
    }

    async fn list_stale_pending(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<InvoiceRecord>, StoreError> {
        let state = self.state.read().map_err(|_| poisoned())?;
        let mut rows: Vec<InvoiceRecord> = state
            .invoices
            .iter()
            .filter(|i| i.status == InvoiceStatus::Pending && i.created_at < created_before)
            .cloned()
            .collect();
        rows.sort_by_key(|i| i.created_at);
        Ok(rows)
    }
}
