//! 提交给 Facturama 的 CFDI 报文 (`POST /3/cfdis`)。
//!
//! 金额字段均为 6 位小数的 `BigDecimal`, 序列化为十进制字符串, 不经过浮点。

use bigdecimal::{BigDecimal, Zero};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::models::InvoiceLineItem;

/// 报文头
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CfdiPayload {
    pub serie: String,
    pub folio: i64,
    pub cfdi_type: String,
    pub payment_form: String,
    pub payment_method: String,
    pub expedition_place: String,
    pub currency: String,
    pub date: NaiveDate,
    pub observations: String,
    pub receiver: Receiver,
    pub global_information: GlobalInformation,
    pub items: Vec<CfdiItem>,
}

/// 受票方
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Receiver {
    pub rfc: String,
    pub name: String,
    pub cfdi_use: String,
    pub fiscal_regime: String,
    pub tax_zip_code: String,
    pub email: String,
}

/// 全局发票信息 (周期/月份/年度)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GlobalInformation {
    pub periodicity: String,
    pub months: String,
    pub year: i32,
}

/// 明细行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CfdiItem {
    pub product_code: String,
    pub description: String,
    pub identification_number: String,
    pub unit_code: String,
    pub unit: String,
    pub quantity: BigDecimal,
    pub unit_price: BigDecimal,
    pub subtotal: BigDecimal,
    pub tax_object: String,
    pub taxes: Vec<TaxEntry>,
    pub total: BigDecimal,
}

/// 税项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaxEntry {
    pub name: String,
    pub rate: BigDecimal,
    pub is_retention: bool,
    pub base: BigDecimal,
    pub total: BigDecimal,
}

/// 文档级合计
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentTotals {
    pub subtotal: BigDecimal,
    pub tax: BigDecimal,
    pub total: BigDecimal,
}

impl CfdiPayload {
    /// 按明细累加的合计
    pub fn totals(&self) -> DocumentTotals {
        let mut subtotal = BigDecimal::zero();
        let mut tax = BigDecimal::zero();
        let mut total = BigDecimal::zero();
        for item in &self.items {
            subtotal += &item.subtotal;
            tax += item.tax_total();
            total += &item.total;
        }
        DocumentTotals { subtotal, tax, total }
    }

    /// 明细的落库副本
    pub fn line_items(&self) -> Vec<InvoiceLineItem> {
        self.items.iter().map(CfdiItem::to_line_item).collect()
    }
}

impl CfdiItem {
    pub fn tax_total(&self) -> BigDecimal {
        self.taxes
            .iter()
            .fold(BigDecimal::zero(), |acc, t| acc + &t.total)
    }

    /// 只保留第一条税项的金额作为 tax_total
    pub fn to_line_item(&self) -> InvoiceLineItem {
        InvoiceLineItem {
            product_code: self.product_code.clone(),
            description: self.description.clone(),
            unit_code: self.unit_code.clone(),
            unit: self.unit.clone(),
            quantity: self.quantity.clone(),
            unit_price: self.unit_price.clone(),
            subtotal: self.subtotal.clone(),
            tax_object: self.tax_object.clone(),
            tax_total: self.taxes.first().map(|t| t.total.clone()),
            total: self.total.clone(),
            identification_number: self.identification_number.clone(),
        }
    }
}
