use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// 系列定义 (series)
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct SeriesDefinition {
    pub code: String,
    pub description: String,
    pub is_active: bool,
}

/// 系列 + 计数器, 用于列表展示
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SeriesSummary {
    pub code: String,
    pub description: String,
    pub is_active: bool,
    pub last_folio: Option<i64>,
}
