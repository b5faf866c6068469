//! 开票流水线。
//!
//! 顺序: 预留 folio -> 校验表格 -> 写 pending -> 提交 Facturama -> 确认 folio/落明细
//! -> 下载文件 (尽力而为)。调用方只看到 `ProcessOutcome`, 不会拿到 `Err`。

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use crate::db::{InvoiceStore, StoreError};
use crate::gateway::{DocumentFormat, GatewayError, InvoicingGateway, SubmitResponse};
use crate::models::{
    ArtifactPaths, CfdiPayload, FailureKind, InvoiceRecord, NewInvoice, ProcessOutcome,
    SubmissionUpdate,
};
use crate::service::artifacts::{ArtifactKind, ArtifactStore};
use crate::service::folio::{AllocationError, SequenceAllocator};
use crate::service::spreadsheet::{SpreadsheetInput, SpreadsheetValidator};

/// 面向用户的通用错误 (细节只写入记录和日志)
pub const INTERNAL_ERROR_MESSAGE: &str = "Error inesperado, revisa logs";
pub const RECONCILE_NOT_FOUND: &str = "Sin registro en el servicio de timbrado tras reconciliación";

/// 一次开票请求
#[derive(Debug, Clone)]
pub struct InvoiceRequest {
    pub serie: String,
    pub issue_date: NaiveDate,
    pub expedition_place: Option<String>,
    pub observations: Option<String>,
    /// 上传时的原始文件名
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// pending 清理结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub resolved: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct InvoiceOrchestrator {
    store: Arc<dyn InvoiceStore>,
    allocator: SequenceAllocator,
    validator: SpreadsheetValidator,
    gateway: Arc<dyn InvoicingGateway>,
    artifacts: ArtifactStore,
    reconcile_after: Duration,
}

impl InvoiceOrchestrator {
    pub fn new(
        store: Arc<dyn InvoiceStore>,
        gateway: Arc<dyn InvoicingGateway>,
        artifacts: ArtifactStore,
    ) -> Self {
        Self {
            allocator: SequenceAllocator::new(store.clone()),
            store,
            validator: SpreadsheetValidator::new(),
            gateway,
            artifacts,
            reconcile_after: Duration::minutes(30),
        }
    }

    pub fn with_validator(mut self, validator: SpreadsheetValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_reconcile_after(mut self, age: Duration) -> Self {
        self.reconcile_after = age;
        self
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub async fn process(&self, request: &InvoiceRequest) -> ProcessOutcome {
        let serie = request.serie.trim();

        // 1. 预留
        let folio = match self.allocator.reserve(serie).await {
            Ok(folio) => folio,
            Err(AllocationError::Store(e)) => {
                tracing::error!("No se pudo calcular el folio de {}: {}", serie, e);
                return ProcessOutcome::failure(
                    FailureKind::Internal,
                    serie,
                    vec![INTERNAL_ERROR_MESSAGE.to_string()],
                );
            }
            Err(e) => {
                tracing::info!("serie {} rechazada: {}", serie, e);
                return ProcessOutcome::failure(FailureKind::Precondition, serie, vec![e.to_string()]);
            }
        };
        tracing::info!("procesando {} con serie {} folio {}", request.file_name, serie, folio);

        // 2. 校验
        let report = self.validator.process(&SpreadsheetInput {
            bytes: &request.bytes,
            serie,
            folio,
            issue_date: request.issue_date,
            expedition_place: request.expedition_place.as_deref(),
            observations: request.observations.as_deref(),
        });
        let payload = match report.payload {
            Some(payload) if report.valid => payload,
            _ => {
                let error_excel = match &report.annotated {
                    Some(bytes) => self.save_error_sheet(&request.file_name, bytes).await,
                    None => None,
                };
                return ProcessOutcome::failure(FailureKind::Validation, serie, report.errors)
                    .with_error_excel(error_excel);
            }
        };

        // 3. 写 pending
        let request_json = match serde_json::to_string(&payload) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("No se pudo serializar el CFDI {}-{}: {}", serie, folio, e);
                return ProcessOutcome::failure(
                    FailureKind::Internal,
                    serie,
                    vec![INTERNAL_ERROR_MESSAGE.to_string()],
                );
            }
        };
        let new_invoice = NewInvoice {
            serie: serie.to_string(),
            folio,
            issue_date: request.issue_date,
            excel_filename: request.file_name.clone(),
            request_json,
        };
        let invoice_id = match self.store.insert_pending(&new_invoice).await {
            Ok(id) => id,
            Err(e @ StoreError::FolioConflict { .. }) => {
                tracing::warn!("{}", e);
                let mut outcome =
                    ProcessOutcome::failure(FailureKind::FolioConflict, serie, vec![e.to_string()]);
                outcome.folio = Some(folio);
                return outcome;
            }
            Err(e) => {
                tracing::error!("No se pudo registrar la factura {}-{}: {}", serie, folio, e);
                return ProcessOutcome::failure(
                    FailureKind::Internal,
                    serie,
                    vec![INTERNAL_ERROR_MESSAGE.to_string()],
                );
            }
        };

        // 4. 提交
        match self.gateway.submit(&payload).await {
            Ok(response) => self.finish_success(invoice_id, &payload, response).await,
            Err(err) => self.fail_gateway(invoice_id, serie, folio, err).await,
        }
    }

    /// Facturama 已接受: 先确认 folio, 再落明细, 最后尽力下载文件。
    /// 已签发的 folio 不得再被预留。
    async fn finish_success(
        &self,
        invoice_id: i64,
        payload: &CfdiPayload,
        response: SubmitResponse,
    ) -> ProcessOutcome {
        let serie = payload.serie.as_str();
        let folio = payload.folio;

        let committed = match self.allocator.commit(serie, folio).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!("No se pudo confirmar el folio {}-{}: {}", serie, folio, e);
                false
            }
        };

        let update = SubmissionUpdate {
            facturama_id: response.external_id.clone(),
            uuid: response.fiscal_uuid.clone(),
            response_json: response.raw.to_string(),
        };
        if let Err(e) = self
            .store
            .record_submission(invoice_id, &update, &payload.line_items())
            .await
        {
            if committed {
                return self
                    .fail_internal(invoice_id, serie, folio, &e.to_string(), Some(&update.response_json))
                    .await;
            }
            // 计数器也没抬高: 保持 pending, 由 folio 唯一约束占住并等待对账
            tracing::error!(
                "Error inesperado en {}-{}: {}; la factura {} queda pendiente",
                serie,
                folio,
                e,
                invoice_id
            );
            return ProcessOutcome::failure(
                FailureKind::Internal,
                serie,
                vec![INTERNAL_ERROR_MESSAGE.to_string()],
            )
            .with_invoice(invoice_id, folio);
        }
        tracing::info!(
            "CFDI {}-{} timbrado (id {:?}, uuid {:?})",
            serie,
            folio,
            response.external_id,
            response.fiscal_uuid
        );

        if let Some(external_id) = &response.external_id {
            self.retrieve_artifacts(invoice_id, serie, folio, external_id)
                .await;
        }
        ProcessOutcome::success(
            invoice_id,
            serie,
            folio,
            response.external_id,
            response.fiscal_uuid,
        )
    }

    async fn fail_gateway(
        &self,
        invoice_id: i64,
        serie: &str,
        folio: i64,
        err: GatewayError,
    ) -> ProcessOutcome {
        tracing::warn!("Facturama rechazó {}-{}: {}", serie, folio, err);
        let details = err.details.to_json().to_string();
        if let Err(e) = self
            .store
            .mark_failed(invoice_id, &err.message, Some(&details))
            .await
        {
            tracing::error!("No se pudo marcar la factura {} como fallida: {}", invoice_id, e);
        }
        ProcessOutcome::failure(FailureKind::Gateway, serie, err.user_messages())
            .with_invoice(invoice_id, folio)
    }

    async fn fail_internal(
        &self,
        invoice_id: i64,
        serie: &str,
        folio: i64,
        cause: &str,
        response_json: Option<&str>,
    ) -> ProcessOutcome {
        tracing::error!("Error inesperado en {}-{}: {}", serie, folio, cause);
        if let Err(e) = self.store.mark_failed(invoice_id, cause, response_json).await {
            tracing::error!("No se pudo marcar la factura {} como fallida: {}", invoice_id, e);
        }
        ProcessOutcome::failure(
            FailureKind::Internal,
            serie,
            vec![INTERNAL_ERROR_MESSAGE.to_string()],
        )
        .with_invoice(invoice_id, folio)
    }

    async fn save_error_sheet(&self, file_name: &str, bytes: &[u8]) -> Option<PathBuf> {
        match self.artifacts.save_error_sheet(file_name, bytes).await {
            Ok(path) => {
                tracing::info!("Archivo de errores generado: {}", path.display());
                Some(path)
            }
            Err(e) => {
                tracing::error!("No se pudo guardar el archivo de errores: {}", e);
                None
            }
        }
    }

    async fn fetch_artifact(
        &self,
        external_id: &str,
        kind: ArtifactKind,
    ) -> Result<Option<Vec<u8>>, GatewayError> {
        match kind {
            ArtifactKind::Pdf => self.gateway.fetch_document(external_id, DocumentFormat::Pdf).await,
            ArtifactKind::Xml => self.gateway.fetch_document(external_id, DocumentFormat::Xml).await,
            ArtifactKind::Zip => self.gateway.fetch_archive(external_id).await,
        }
    }

    /// 逐个下载 PDF/XML/ZIP; 任何失败只记日志, 不影响已成功的开票
    async fn retrieve_artifacts(&self, invoice_id: i64, serie: &str, folio: i64, external_id: &str) {
        let mut paths = ArtifactPaths::default();
        for kind in ArtifactKind::ALL {
            let bytes = match self.fetch_artifact(external_id, kind).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    tracing::warn!("{} no disponible para {}-{}", kind, serie, folio);
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Error descargando {} de {}-{}: {}", kind, serie, folio, e);
                    continue;
                }
            };
            let saved = match self.artifacts.save_invoice_file(serie, folio, kind, &bytes).await {
                Ok(path) => path.to_string_lossy().into_owned(),
                Err(e) => {
                    tracing::error!("{}", e);
                    continue;
                }
            };
            match kind {
                ArtifactKind::Pdf => paths.pdf_path = Some(saved),
                ArtifactKind::Xml => paths.xml_path = Some(saved),
                ArtifactKind::Zip => paths.zip_path = Some(saved),
            }
        }

        if paths == ArtifactPaths::default() {
            return;
        }
        if let Err(e) = self.store.attach_artifacts(invoice_id, &paths).await {
            tracing::error!("No se pudieron registrar los archivos de {}: {}", invoice_id, e);
        }
    }

    /// 处理超过 `reconcile_after` 仍为 pending 的记录
    pub async fn reconcile_pending(&self, now: DateTime<Utc>) -> Result<ReconcileSummary, StoreError> {
        let stale = self.store.list_stale_pending(now - self.reconcile_after).await?;
        let mut summary = ReconcileSummary::default();
        if stale.is_empty() {
            return Ok(summary);
        }
        tracing::info!("reconciliando {} facturas pendientes", stale.len());

        for record in stale {
            let start = record.issue_date - Duration::days(1);
            let end = record.issue_date + Duration::days(1);
            let issued = match self.gateway.list(start, end).await {
                Ok(list) => list,
                Err(e) => {
                    tracing::warn!("No se pudo consultar Facturama para {}-{}: {}", record.serie, record.folio, e);
                    summary.skipped += 1;
                    continue;
                }
            };

            let found = issued
                .into_iter()
                .find(|c| c.matches(&record.serie, record.folio));
            let result = match found {
                Some(found) => {
                    let response = SubmitResponse {
                        external_id: Some(found.id.clone()),
                        fiscal_uuid: found.uuid.clone(),
                        raw: serde_json::to_value(&found).unwrap_or_default(),
                    };
                    self.resolve_found(&record, &response).await.map(|_| true)
                }
                None => {
                    tracing::warn!("{}-{} no existe en Facturama", record.serie, record.folio);
                    self.store
                        .mark_failed(record.id, RECONCILE_NOT_FOUND, None)
                        .await
                        .map(|_| false)
                }
            };

            match result {
                Ok(true) => summary.resolved += 1,
                Ok(false) => summary.failed += 1,
                Err(e) => {
                    tracing::error!("Reconciliación de {} fallida: {}", record.id, e);
                    summary.skipped += 1;
                }
            }
        }

        tracing::info!(
            "reconciliación: {} resueltas, {} fallidas, {} omitidas",
            summary.resolved,
            summary.failed,
            summary.skipped
        );
        Ok(summary)
    }

    async fn resolve_found(
        &self,
        record: &InvoiceRecord,
        response: &SubmitResponse,
    ) -> Result<(), StoreError> {
        let items = match serde_json::from_str::<CfdiPayload>(&record.request_json) {
            Ok(payload) => payload.line_items(),
            Err(e) => {
                tracing::warn!("request_json ilegible en factura {}: {}", record.id, e);
                Vec::new()
            }
        };
        let update = SubmissionUpdate {
            facturama_id: response.external_id.clone(),
            uuid: response.fiscal_uuid.clone(),
            response_json: response.raw.to_string(),
        };
        self.allocator.commit(&record.serie, record.folio).await?;
        self.store.record_submission(record.id, &update, &items).await?;
        tracing::info!("factura {} ({}-{}) recuperada", record.id, record.serie, record.folio);

        if let Some(external_id) = &response.external_id {
            self.retrieve_artifacts(record.id, &record.serie, record.folio, external_id)
                .await;
        }
        Ok(())
    }
}
