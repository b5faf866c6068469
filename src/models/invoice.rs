use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

/// 发票记录生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Pending,
    Success,
    Failed,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("estado desconocido: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for InvoiceStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// 发票主表 (invoices)
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    #[sqlx(try_from = "String")]
    pub status: InvoiceStatus,
    pub serie: String,
    pub folio: i64,
    pub facturama_id: Option<String>,  // 外部文档ID
    pub uuid: Option<String>,          // 税局 UUID
    pub issue_date: NaiveDate,
    pub excel_filename: String,
    pub request_json: String,
    pub response_json: Option<String>,
    pub error_message: Option<String>,
    pub pdf_path: Option<String>,
    pub xml_path: Option<String>,
    pub zip_path: Option<String>,
}

impl TryFrom<String> for InvoiceStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// 发票明细表 (invoice_items)
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct InvoiceLineItem {
    pub product_code: String,
    pub description: String,
    pub unit_code: String,
    pub unit: String,
    pub quantity: BigDecimal,
    pub unit_price: BigDecimal,
    pub subtotal: BigDecimal,
    pub tax_object: String,
    pub tax_total: Option<BigDecimal>,
    pub total: BigDecimal,
    pub identification_number: String,
}

/// 待写入的 pending 记录
#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub serie: String,
    pub folio: i64,
    pub issue_date: NaiveDate,
    pub excel_filename: String,
    pub request_json: String,
}

/// 外部服务受理成功后回写的字段
#[derive(Debug, Clone, Default)]
pub struct SubmissionUpdate {
    pub facturama_id: Option<String>,
    pub uuid: Option<String>,
    pub response_json: String,
}

/// 已下载的文件路径
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub pdf_path: Option<String>,
    pub xml_path: Option<String>,
    pub zip_path: Option<String>,
}

/// 历史查询条件
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoiceFilter {
    pub date_start: Option<NaiveDate>,
    pub date_end: Option<NaiveDate>,
    pub serie: Option<String>,
    pub status: Option<InvoiceStatus>,
}

/// 记录 + 明细
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceDetail {
    #[serde(flatten)]
    pub record: InvoiceRecord,
    pub items: Vec<InvoiceLineItem>,
}
