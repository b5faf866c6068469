use axum::extract::{Json, Multipart, Path, Query, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE, RETRY_AFTER};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::AppState;
use crate::db::StoreError;
use crate::models::{FailureKind, InvoiceFilter, ProcessOutcome};
use crate::service::{ArtifactKind, ArtifactStore, InvoiceRequest, RateDecision};

const OPERATOR_HEADER: &str = "x-operator";

/// 统一错误体 `{ "error": code, "message": ... }`
pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

fn store_error(e: StoreError) -> Response {
    tracing::error!("store error: {}", e);
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", "Error inesperado, revisa logs")
}

/// 开票结果 + 错误表格下载地址
#[derive(Debug, Serialize)]
pub struct InvoiceResponse {
    #[serde(flatten)]
    pub outcome: ProcessOutcome,
    pub error_excel_url: Option<String>,
}

impl InvoiceResponse {
    fn from_outcome(outcome: ProcessOutcome) -> Self {
        let error_excel_url = outcome
            .error_excel
            .as_deref()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .map(|n| format!("/api/errors/{n}"));
        Self {
            outcome,
            error_excel_url,
        }
    }
}

pub fn outcome_status(outcome: &ProcessOutcome) -> StatusCode {
    match outcome.failure {
        None => StatusCode::OK,
        Some(FailureKind::Precondition) => StatusCode::BAD_REQUEST,
        Some(FailureKind::Validation) => StatusCode::UNPROCESSABLE_ENTITY,
        Some(FailureKind::FolioConflict) => StatusCode::CONFLICT,
        Some(FailureKind::Gateway) => StatusCode::BAD_GATEWAY,
        Some(FailureKind::Internal) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// 健康检查
pub async fn health_check() -> &'static str {
    "OK"
}

/// multipart 表单
#[derive(Debug, Default)]
struct InvoiceForm {
    serie: Option<String>,
    issue_date: Option<String>,
    expedition_place: Option<String>,
    observations: Option<String>,
    file: Option<(String, Vec<u8>)>,
}

async fn read_form(multipart: &mut Multipart) -> Result<InvoiceForm, Response> {
    let bad_request = |e: axum::extract::multipart::MultipartError| {
        json_error(StatusCode::BAD_REQUEST, "invalid_form", e.to_string())
    };

    let mut form = InvoiceForm::default();
    while let Some(field) = multipart.next_field().await.map_err(bad_request)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "excel_file" => {
                let file_name = field.file_name().unwrap_or("archivo.csv").to_string();
                let bytes = field.bytes().await.map_err(bad_request)?;
                form.file = Some((file_name, bytes.to_vec()));
            }
            "serie" | "issue_date" | "expedition_place" | "observations" => {
                let value = field.text().await.map_err(bad_request)?;
                let value = Some(value.trim().to_string()).filter(|v| !v.is_empty());
                match name.as_str() {
                    "serie" => form.serie = value,
                    "issue_date" => form.issue_date = value,
                    "expedition_place" => form.expedition_place = value,
                    _ => form.observations = value,
                }
            }
            other => tracing::debug!("campo ignorado: {}", other),
        }
    }
    Ok(form)
}

/// 上传表格并开票
pub async fn create_invoice(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let operator = headers
        .get(OPERATOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("anonymous");
    let now = Utc::now();

    if let RateDecision::Limited { retry_after } =
        state.rate_limiter.hit(&format!("submit:{operator}"), now)
    {
        let secs = retry_after.num_seconds().max(1);
        let mut response = json_error(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            format!("Demasiados envíos. Intenta de nuevo en {secs} segundos."),
        );
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from(secs));
        return response;
    }

    let form = match read_form(&mut multipart).await {
        Ok(form) => form,
        Err(response) => return response,
    };
    let Some((file_name, bytes)) = form.file else {
        return json_error(StatusCode::BAD_REQUEST, "missing_file", "Debes adjuntar el archivo (excel_file)");
    };
    let issue_date = match form.issue_date.as_deref() {
        Some(raw) => match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            Ok(date) => date,
            Err(_) => {
                return json_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_issue_date",
                    format!("Fecha de emisión inválida: {raw}"),
                )
            }
        },
        None => Local::now().date_naive(),
    };

    let artifacts = state.orchestrator.artifacts();
    match artifacts.save_upload(&file_name, &bytes, now).await {
        Ok(path) => tracing::info!("archivo recibido de {}: {}", operator, path.display()),
        Err(e) => {
            tracing::error!("No se pudo guardar el archivo subido: {}", e);
            return json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage_error",
                "No se pudo guardar el archivo",
            );
        }
    }

    let request = InvoiceRequest {
        serie: form.serie.unwrap_or_else(|| state.default_serie.clone()),
        issue_date,
        expedition_place: form.expedition_place,
        observations: form.observations,
        file_name,
        bytes,
    };
    let outcome = state.orchestrator.process(&request).await;
    let status = outcome_status(&outcome);
    (status, Json(InvoiceResponse::from_outcome(outcome))).into_response()
}

/// 开票历史, 按创建时间倒序
pub async fn list_invoices(
    State(state): State<AppState>,
    Query(filter): Query<InvoiceFilter>,
) -> Response {
    match state.store.list_invoices(&filter).await {
        Ok(records) => Json(records).into_response(),
        Err(e) => store_error(e),
    }
}

pub async fn get_invoice(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.store.get_invoice(id).await {
        Ok(Some(detail)) => Json(detail).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "not_found", "Factura no encontrada"),
        Err(e) => store_error(e),
    }
}

/// 下载 PDF/XML/ZIP
pub async fn download_artifact(
    State(state): State<AppState>,
    Path((id, kind)): Path<(i64, String)>,
) -> Response {
    let Ok(kind) = kind.parse::<ArtifactKind>() else {
        return json_error(StatusCode::BAD_REQUEST, "invalid_kind", "Tipo debe ser pdf, xml o zip");
    };
    let record = match state.store.get_invoice(id).await {
        Ok(Some(detail)) => detail.record,
        Ok(None) => return json_error(StatusCode::NOT_FOUND, "not_found", "Factura no encontrada"),
        Err(e) => return store_error(e),
    };
    let stored = match kind {
        ArtifactKind::Pdf => record.pdf_path.as_deref(),
        ArtifactKind::Xml => record.xml_path.as_deref(),
        ArtifactKind::Zip => record.zip_path.as_deref(),
    };
    let Some(stored) = stored else {
        return json_error(StatusCode::NOT_FOUND, "not_available", "Archivo no disponible");
    };

    let download_name = ArtifactStore::file_name(&record.serie, record.folio, kind);
    match state.orchestrator.artifacts().read(std::path::Path::new(stored)).await {
        Ok(Some(bytes)) => file_response(kind.content_type(), &download_name, bytes),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "not_available", "Archivo no disponible"),
        Err(e) => {
            tracing::error!("{}", e);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", "No se pudo leer el archivo")
        }
    }
}

/// 下载标注后的错误表格
pub async fn download_error_sheet(State(state): State<AppState>, Path(file): Path<String>) -> Response {
    let artifacts = state.orchestrator.artifacts();
    let path = match artifacts.error_sheet_path(&file) {
        Ok(path) => path,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, "invalid_name", e.to_string()),
    };
    match artifacts.read(&path).await {
        Ok(Some(bytes)) => file_response("text/csv; charset=utf-8", &file, bytes),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "not_found", "Archivo no encontrado"),
        Err(e) => {
            tracing::error!("{}", e);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", "No se pudo leer el archivo")
        }
    }
}

fn file_response(content_type: &'static str, file_name: &str, bytes: Vec<u8>) -> Response {
    let disposition = format!("attachment; filename=\"{}\"", file_name.replace('"', ""));
    let mut response = (StatusCode::OK, bytes).into_response();
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(CONTENT_DISPOSITION, value);
    }
    response
}

/// 系列及其计数器 (只读)
pub async fn list_series(State(state): State<AppState>) -> Response {
    match state.store.list_series().await {
        Ok(series) => Json(series).into_response(),
        Err(e) => store_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct DateRangeQuery {
    pub date_start: NaiveDate,
    pub date_end: NaiveDate,
}

/// Facturama 已开具 CFDI 查询
pub async fn list_cfdis(State(state): State<AppState>, Query(range): Query<DateRangeQuery>) -> Response {
    if range.date_end < range.date_start {
        return json_error(
            StatusCode::BAD_REQUEST,
            "invalid_range",
            "date_end no puede ser anterior a date_start",
        );
    }
    match state.gateway.list(range.date_start, range.date_end).await {
        Ok(list) => Json(list).into_response(),
        Err(e) => json_error(StatusCode::BAD_GATEWAY, "gateway_error", e.message),
    }
}

/// 手动触发 pending 清理
pub async fn reconcile_pending(State(state): State<AppState>) -> Response {
    match state.orchestrator.reconcile_pending(Utc::now()).await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => store_error(e),
    }
}
