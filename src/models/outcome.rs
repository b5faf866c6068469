use serde::Serialize;
use std::path::PathBuf;

/// 失败类别, 供 HTTP 层选择状态码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 系列不存在或停用
    Precondition,
    /// 表格校验未通过
    Validation,
    /// 并发下同一 folio 已被占用, 可重试
    FolioConflict,
    /// Facturama 拒绝或网络失败
    Gateway,
    Internal,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::FolioConflict)
    }
}

/// 一次开票尝试的统一结果
#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutcome {
    pub success: bool,
    pub invoice_id: Option<i64>,
    pub serie: String,
    pub folio: Option<i64>,
    pub facturama_id: Option<String>,
    pub uuid: Option<String>,
    pub errors: Vec<String>,
    pub error_excel: Option<PathBuf>,
    pub failure: Option<FailureKind>,
    pub retryable: bool,
}

impl ProcessOutcome {
    pub fn success(
        invoice_id: i64,
        serie: &str,
        folio: i64,
        facturama_id: Option<String>,
        uuid: Option<String>,
    ) -> Self {
        Self {
            success: true,
            invoice_id: Some(invoice_id),
            serie: serie.to_string(),
            folio: Some(folio),
            facturama_id,
            uuid,
            errors: Vec::new(),
            error_excel: None,
            failure: None,
            retryable: false,
        }
    }

    pub fn failure(kind: FailureKind, serie: &str, errors: Vec<String>) -> Self {
        Self {
            success: false,
            invoice_id: None,
            serie: serie.to_string(),
            folio: None,
            facturama_id: None,
            uuid: None,
            errors,
            error_excel: None,
            failure: Some(kind),
            retryable: kind.is_retryable(),
        }
    }

    pub fn with_invoice(mut self, invoice_id: i64, folio: i64) -> Self {
        self.invoice_id = Some(invoice_id);
        self.folio = Some(folio);
        self
    }

    pub fn with_error_excel(mut self, path: Option<PathBuf>) -> Self {
        self.error_excel = path;
        self
    }
}
