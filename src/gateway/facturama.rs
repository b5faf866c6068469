use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::NaiveDate;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method};
use serde_json::{json, Value};
use std::time::Duration;

use super::{DocumentFormat, ExternalCfdi, GatewayError, InvoicingGateway, SubmitResponse};
use crate::config::GatewayConfig;
use crate::models::CfdiPayload;

const CFDI_TYPE: &str = "issued";

/// Facturama REST 客户端 (Basic Auth)
#[derive(Clone)]
pub struct FacturamaClient {
    http: Client,
    base_url: String,
    user: String,
    password: String,
}

impl FacturamaClient {
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(GatewayError::transport)?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }

    /// 发送请求; 非 2xx 转成 `GatewayError`, 非 JSON 的成功响应包装为 `{"raw": ...}`
    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&CfdiPayload>,
    ) -> Result<Value, GatewayError> {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self
            .http
            .request(method, &url)
            .basic_auth(&self.user, Some(&self.password));
        if !query.is_empty() {
            builder = builder.query(query);
        }
        if let Some(payload) = body {
            builder = builder.json(payload);
        }

        let response = builder.send().await.map_err(|e| {
            tracing::error!("HTTP request error to Facturama {}: {}", url, e);
            GatewayError::transport(e)
        })?;

        let status = response.status();
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |ct| ct.contains("application/json"));
        let text = response.text().await.map_err(GatewayError::transport)?;

        if !status.is_success() {
            let err = GatewayError::from_response(status.as_u16(), &text);
            tracing::warn!("Facturama API error {}: {}", status.as_u16(), text);
            return Err(err);
        }

        if is_json {
            serde_json::from_str(&text)
                .map_err(|e| GatewayError::other(format!("Respuesta JSON inválida de Facturama: {e}")))
        } else {
            Ok(json!({ "raw": text }))
        }
    }

    /// 下载并解码 base64 内容; 404 或空内容视为不存在
    async fn download(
        &self,
        path: &str,
        query: &[(&str, &str)],
        what: &str,
        external_id: &str,
    ) -> Result<Option<Vec<u8>>, GatewayError> {
        let data = match self.request(Method::GET, path, query, None).await {
            Ok(data) => data,
            Err(e) if e.is_not_found() => {
                tracing::warn!("No se encontró {} para CFDI {} (404)", what, external_id);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let content = ["Content", "content"]
            .iter()
            .filter_map(|k| data.get(*k).and_then(Value::as_str))
            .find(|c| !c.is_empty());
        let Some(content) = content else {
            tracing::warn!("Facturama no devolvió contenido {} para {}", what, external_id);
            return Ok(None);
        };

        BASE64
            .decode(content)
            .map(Some)
            .map_err(|e| GatewayError::other(format!("Contenido {what} inválido: {e}")))
    }
}

#[async_trait]
impl InvoicingGateway for FacturamaClient {
    async fn submit(&self, payload: &CfdiPayload) -> Result<SubmitResponse, GatewayError> {
        let raw = self
            .request(Method::POST, "/3/cfdis", &[], Some(payload))
            .await?;
        Ok(SubmitResponse::from_json(raw))
    }

    async fn fetch_document(
        &self,
        external_id: &str,
        format: DocumentFormat,
    ) -> Result<Option<Vec<u8>>, GatewayError> {
        let path = format!("/api/Cfdi/{}/{}/{}", format.as_str(), CFDI_TYPE, external_id);
        let what = format.as_str().to_uppercase();
        self.download(&path, &[], &what, external_id).await
    }

    async fn fetch_archive(&self, external_id: &str) -> Result<Option<Vec<u8>>, GatewayError> {
        self.download(
            "/cfdi/zip",
            &[("id", external_id), ("type", CFDI_TYPE)],
            "ZIP",
            external_id,
        )
        .await
    }

    async fn list(
        &self,
        date_start: NaiveDate,
        date_end: NaiveDate,
    ) -> Result<Vec<ExternalCfdi>, GatewayError> {
        let start = date_start.format("%Y-%m-%d").to_string();
        let end = date_end.format("%Y-%m-%d").to_string();
        let data = self
            .request(
                Method::GET,
                "/cfdi",
                &[("type", CFDI_TYPE), ("dateStart", start.as_str()), ("dateEnd", end.as_str())],
                None,
            )
            .await?;

        Ok(match data {
            Value::Array(list) => list.iter().filter_map(ExternalCfdi::from_json).collect(),
            _ => Vec::new(),
        })
    }
}
