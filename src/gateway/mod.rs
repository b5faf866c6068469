//! 外部开票服务 (Facturama) 的调用契约。
//!
//! 所有调用都是单次请求/响应, 带固定超时, 不做重试。
//! 文档/压缩包下载遇到 404 视为 "尚未生成", 返回 `Ok(None)`。

pub mod error;
pub mod facturama;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

use crate::models::CfdiPayload;

pub use error::{ErrorDetails, GatewayError};
pub use facturama::FacturamaClient;

/// 可下载的文档格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentFormat {
    Pdf,
    Xml,
}

impl DocumentFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Xml => "xml",
        }
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 提交成功的响应
#[derive(Debug, Clone)]
pub struct SubmitResponse {
    pub external_id: Option<String>,
    pub fiscal_uuid: Option<String>,
    pub raw: Value,
}

impl SubmitResponse {
    /// 兼容 `Id`/`id`、`Uuid`/`uuid` 两种大小写
    pub fn from_json(raw: Value) -> Self {
        let pick = |keys: [&str; 2]| {
            keys.iter()
                .filter_map(|k| raw.get(*k))
                .find_map(|v| match v {
                    Value::String(s) if !s.is_empty() => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
        };
        let external_id = pick(["Id", "id"]);
        let fiscal_uuid = pick(["Uuid", "uuid"]);
        Self {
            external_id,
            fiscal_uuid,
            raw,
        }
    }
}

/// 外部服务查询到的已开具 CFDI
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExternalCfdi {
    pub id: String,
    pub serie: Option<String>,
    pub folio: Option<String>,
    pub uuid: Option<String>,
    pub date: Option<String>,
    pub status: Option<String>,
}

impl ExternalCfdi {
    pub fn from_json(v: &Value) -> Option<Self> {
        let field = |keys: [&str; 2]| {
            keys.iter().filter_map(|k| v.get(*k)).find_map(|x| match x {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
        };
        Some(Self {
            id: field(["Id", "id"])?,
            serie: field(["Serie", "serie"]),
            folio: field(["Folio", "folio"]),
            uuid: field(["Uuid", "uuid"]),
            date: field(["Date", "date"]),
            status: field(["Status", "status"]),
        })
    }

    /// 是否对应指定的 serie/folio
    pub fn matches(&self, serie: &str, folio: i64) -> bool {
        self.serie.as_deref() == Some(serie)
            && self
                .folio
                .as_deref()
                .and_then(|f| f.parse::<i64>().ok())
                == Some(folio)
    }
}

#[async_trait]
pub trait InvoicingGateway: Send + Sync {
    async fn submit(&self, payload: &CfdiPayload) -> Result<SubmitResponse, GatewayError>;

    async fn fetch_document(
        &self,
        external_id: &str,
        format: DocumentFormat,
    ) -> Result<Option<Vec<u8>>, GatewayError>;

    async fn fetch_archive(&self, external_id: &str) -> Result<Option<Vec<u8>>, GatewayError>;

    async fn list(
        &self,
        date_start: NaiveDate,
        date_end: NaiveDate,
    ) -> Result<Vec<ExternalCfdi>, GatewayError>;
}
