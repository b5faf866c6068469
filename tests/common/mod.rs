#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio::sync::Barrier;

use factura_global::db::{InMemoryInvoiceStore, InvoiceStore, StoreError};
use factura_global::gateway::{
    DocumentFormat, ExternalCfdi, GatewayError, InvoicingGateway, SubmitResponse,
};
use factura_global::models::{
    ArtifactPaths, CfdiPayload, InvoiceDetail, InvoiceFilter, InvoiceLineItem, InvoiceRecord,
    NewInvoice, SeriesDefinition, SeriesSummary, SubmissionUpdate,
};
use factura_global::service::spreadsheet::EXPECTED_COLUMNS;
use factura_global::service::{ArtifactStore, InvoiceOrchestrator, InvoiceRequest, SpreadsheetValidator};

pub fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 16).unwrap()
}

/// 一行合法数据, `overrides` 覆盖指定列
pub fn row(overrides: &[(&str, &str)]) -> Vec<String> {
    EXPECTED_COLUMNS
        .iter()
        .map(|col| {
            if let Some((_, v)) = overrides.iter().find(|(c, _)| c == col) {
                return v.to_string();
            }
            match *col {
                "Razon Social" => "PUBLICO EN GENERAL",
                "RFC" => "XAXX010101000",
                "Fiscal Regime" => "616",
                "UsoCFDI" => "S01",
                "CP" => "64000",
                "Forma de Pago" => "01",
                "Metodo de Pago" => "PUE",
                "ClaveProdServ" => "01010101",
                "Concepto" => "Venta",
                "ClaveUnidad" => "ACT",
                "Unidad" => "Actividad",
                "Cantidad" => "1",
                "Precio Unitario" => "100",
                "Objeto Impuesto" => "02",
                "Subtotal del Concepto" => "100",
                "IVA del Concepto" => "16",
                "Total del Concepto" => "116",
                "Pedido" => "PED-1",
                "Periodicidad" => "04",
                "Mes" => "10",
                "Year" => "2026",
                "Mail" => "ventas@example.com",
                _ => "",
            }
            .to_string()
        })
        .collect()
}

pub fn csv_with(columns: &[&str], rows: &[Vec<String>]) -> Vec<u8> {
    let mut w = csv::Writer::from_writer(Vec::new());
    w.write_record(columns).unwrap();
    for r in rows {
        w.write_record(r).unwrap();
    }
    w.into_inner().unwrap()
}

pub fn sheet(rows: &[Vec<String>]) -> Vec<u8> {
    csv_with(&EXPECTED_COLUMNS, rows)
}

pub fn request(serie: &str, bytes: Vec<u8>) -> InvoiceRequest {
    InvoiceRequest {
        serie: serie.to_string(),
        issue_date: today(),
        expedition_place: None,
        observations: None,
        file_name: "ventas_octubre.csv".to_string(),
        bytes,
    }
}

/// 可编排的 Facturama 替身
#[derive(Default)]
pub struct FakeGateway {
    pub submit_error: Option<GatewayError>,
    pub missing_pdf: bool,
    pub artifact_error: bool,
    pub list_error: bool,
    pub issued: Vec<ExternalCfdi>,
    pub submitted: Mutex<Vec<CfdiPayload>>,
}

impl FakeGateway {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn rejecting(err: GatewayError) -> Self {
        Self {
            submit_error: Some(err),
            ..Self::default()
        }
    }

    pub fn submitted(&self) -> Vec<CfdiPayload> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl InvoicingGateway for FakeGateway {
    async fn submit(&self, payload: &CfdiPayload) -> Result<SubmitResponse, GatewayError> {
        self.submitted.lock().unwrap().push(payload.clone());
        if let Some(err) = &self.submit_error {
            return Err(err.clone());
        }
        let raw = json!({
            "Id": format!("ext-{}-{}", payload.serie, payload.folio),
            "Uuid": format!("uuid-{}", payload.folio),
        });
        Ok(SubmitResponse::from_json(raw))
    }

    async fn fetch_document(
        &self,
        _external_id: &str,
        format: DocumentFormat,
    ) -> Result<Option<Vec<u8>>, GatewayError> {
        if self.artifact_error {
            return Err(GatewayError::transport("operation timed out"));
        }
        match format {
            DocumentFormat::Pdf if self.missing_pdf => Ok(None),
            DocumentFormat::Pdf => Ok(Some(b"%PDF-1.4".to_vec())),
            DocumentFormat::Xml => Ok(Some(b"<cfdi:Comprobante/>".to_vec())),
        }
    }

    async fn fetch_archive(&self, _external_id: &str) -> Result<Option<Vec<u8>>, GatewayError> {
        if self.artifact_error {
            return Err(GatewayError::transport("operation timed out"));
        }
        Ok(Some(b"PK\x03\x04".to_vec()))
    }

    async fn list(
        &self,
        _date_start: NaiveDate,
        _date_end: NaiveDate,
    ) -> Result<Vec<ExternalCfdi>, GatewayError> {
        if self.list_error {
            return Err(GatewayError::from_response(503, "Service Unavailable"));
        }
        Ok(self.issued.clone())
    }
}

/// 包装内存存储: 可让并发请求在读取最大 folio 后汇合, 或让落明细/抬高计数器失败
pub struct ScriptedStore {
    pub inner: Arc<InMemoryInvoiceStore>,
    pub rendezvous: Option<Barrier>,
    pub fail_record_submission: bool,
    pub fail_raise_counter: bool,
}

impl ScriptedStore {
    pub fn wrap(inner: Arc<InMemoryInvoiceStore>) -> Self {
        Self {
            inner,
            rendezvous: None,
            fail_record_submission: false,
            fail_raise_counter: false,
        }
    }
}

#[async_trait]
impl InvoiceStore for ScriptedStore {
    async fn get_series(&self, code: &str) -> Result<Option<SeriesDefinition>, StoreError> {
        self.inner.get_series(code).await
    }

    async fn ensure_series(&self, code: &str, description: &str) -> Result<(), StoreError> {
        self.inner.ensure_series(code, description).await
    }

    async fn list_series(&self) -> Result<Vec<SeriesSummary>, StoreError> {
        self.inner.list_series().await
    }

    async fn counter_last_folio(&self, code: &str) -> Result<Option<i64>, StoreError> {
        self.inner.counter_last_folio(code).await
    }

    async fn max_invoice_folio(&self, code: &str) -> Result<Option<i64>, StoreError> {
        let max = self.inner.max_invoice_folio(code).await?;
        if let Some(barrier) = &self.rendezvous {
            barrier.wait().await;
        }
        Ok(max)
    }

    async fn raise_counter(&self, code: &str, folio: i64) -> Result<i64, StoreError> {
        if self.fail_raise_counter {
            return Err(StoreError::Storage("counter offline".to_string()));
        }
        self.inner.raise_counter(code, folio).await
    }

    async fn insert_pending(&self, invoice: &NewInvoice) -> Result<i64, StoreError> {
        self.inner.insert_pending(invoice).await
    }

    async fn record_submission(
        &self,
        id: i64,
        update: &SubmissionUpdate,
        items: &[InvoiceLineItem],
    ) -> Result<(), StoreError> {
        if self.fail_record_submission {
            return Err(StoreError::Storage("disk full".to_string()));
        }
        self.inner.record_submission(id, update, items).await
    }

    async fn attach_artifacts(&self, id: i64, paths: &ArtifactPaths) -> Result<(), StoreError> {
        self.inner.attach_artifacts(id, paths).await
    }

    async fn mark_failed(
        &self,
        id: i64,
        error_message: &str,
        response_json: Option<&str>,
    ) -> Result<(), StoreError> {
        self.inner.mark_failed(id, error_message, response_json).await
    }

    async fn get_invoice(&self, id: i64) -> Result<Option<InvoiceDetail>, StoreError> {
        self.inner.get_invoice(id).await
    }

    async fn list_invoices(&self, filter: &InvoiceFilter) -> Result<Vec<InvoiceRecord>, StoreError> {
        self.inner.list_invoices(filter).await
    }

    async fn list_stale_pending(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<InvoiceRecord>, StoreError> {
        self.inner.list_stale_pending(created_before).await
    }
}

/// 组装流水线: 内存存储 + 替身网关 + 临时目录
pub struct Harness {
    pub store: Arc<InMemoryInvoiceStore>,
    pub gateway: Arc<FakeGateway>,
    pub orchestrator: InvoiceOrchestrator,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub fn new(gateway: FakeGateway) -> Self {
        let store = InMemoryInvoiceStore::arc();
        store.put_series("ML", "Mercado Libre", true);
        Self::with_store(store.clone(), store, gateway)
    }

    pub fn with_store(
        store: Arc<InMemoryInvoiceStore>,
        backend: Arc<dyn InvoiceStore>,
        gateway: FakeGateway,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(gateway);
        let orchestrator =
            InvoiceOrchestrator::new(backend, gateway.clone(), ArtifactStore::new(dir.path()))
                .with_validator(SpreadsheetValidator::with_today(today()));
        Self {
            store,
            gateway,
            orchestrator,
            dir,
        }
    }
}
