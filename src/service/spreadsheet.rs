//! 开票表格校验。
//!
//! 输入为带表头的 CSV。逐行校验 (错误累积, 不提前退出), 全部行通过后再做
//! 文档级校验。行级失败时额外生成带 `Errores` 列的标注副本供用户下载。
//! 金额一律解析为 6 位小数的 `BigDecimal`, 四舍五入 (half-up)。

use bigdecimal::{BigDecimal, RoundingMode, ToPrimitive, Zero};
use chrono::{Duration, Local, NaiveDate};
use csv::{ReaderBuilder, StringRecord, Trim, WriterBuilder};
use std::collections::HashMap;
use std::str::FromStr;

use crate::models::{CfdiItem, CfdiPayload, GlobalInformation, Receiver, TaxEntry};

/// 必需列 (名称即协议, 不可配置)
pub const EXPECTED_COLUMNS: [&str; 32] = [
    "Folio",
    "No. Factura",
    "Razon Social",
    "RFC",
    "Fiscal Regime",
    "UsoCFDI",
    "Calle",
    "Colonia",
    "No. Exterior",
    "No. Interior",
    "CP",
    "Municipio",
    "Estado",
    "Forma de Pago",
    "Condiciones de Pago",
    "Metodo de Pago",
    "Observaciones",
    "ClaveProdServ",
    "Concepto",
    "ClaveUnidad",
    "Unidad",
    "Cantidad",
    "Precio Unitario",
    "Objeto Impuesto",
    "Subtotal del Concepto",
    "IVA del Concepto",
    "Total del Concepto",
    "Pedido",
    "Periodicidad",
    "Mes",
    "Year",
    "Mail",
];

pub const ERROR_COLUMN: &str = "Errores";
pub const PAYMENT_METHODS: [&str; 2] = ["PUE", "PPD"];

const DECIMAL_SCALE: i64 = 6;
const MAX_ISSUE_AGE_DAYS: i64 = 2;
const CFDI_TYPE: &str = "I";
const CURRENCY: &str = "MXN";

/// ZIP (xlsx) 与 OLE2 (xls) 文件头
const XLSX_MAGIC: &[u8] = b"PK\x03\x04";
const XLS_MAGIC: &[u8] = b"\xD0\xCF\x11\xE0";
pub const EXCEL_UPLOAD_MESSAGE: &str =
    "El archivo es un libro de Excel; exporta la hoja como CSV (UTF-8) y súbelo de nuevo";

/// 一次校验的输入
#[derive(Debug, Clone)]
pub struct SpreadsheetInput<'a> {
    pub bytes: &'a [u8],
    pub serie: &'a str,
    pub folio: i64,
    pub issue_date: NaiveDate,
    pub expedition_place: Option<&'a str>,
    pub observations: Option<&'a str>,
}

/// 校验结果; `payload` 仅在 `valid` 时存在
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub payload: Option<CfdiPayload>,
    /// 行级失败时的标注 CSV
    pub annotated: Option<Vec<u8>>,
}

impl ValidationReport {
    fn invalid(errors: Vec<String>) -> Self {
        Self {
            valid: false,
            errors,
            payload: None,
            annotated: None,
        }
    }
}

/// 按 6 位小数 half-up 解析; 空单元格视为 0
pub fn to_decimal(raw: &str) -> Result<BigDecimal, String> {
    let value = raw.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("nan") {
        return Ok(BigDecimal::zero().with_scale(DECIMAL_SCALE));
    }
    BigDecimal::from_str(value)
        .map(|d| d.with_scale_round(DECIMAL_SCALE, RoundingMode::HalfUp))
        .map_err(|_| format!("No es un número válido: {value}"))
}

/// 支付方式补零到两位 ("3" / "3.0" -> "03")
pub fn normalize_payment_form(raw: &str) -> String {
    let value = raw.trim();
    if value.is_empty() {
        return String::new();
    }
    let head = value.split('.').next().unwrap_or(value);
    match head.parse::<i64>() {
        Ok(n) => format!("{n:02}"),
        Err(_) => value.to_string(),
    }
}

/// 邮编补零到五位 ("1234" / "1234.0" -> "01234")
pub fn normalize_cp(raw: &str) -> String {
    let value = raw.trim();
    if value.is_empty() {
        return String::new();
    }
    let head = value.split('.').next().unwrap_or(value);
    match head.parse::<u64>() {
        Ok(n) => format!("{n:05}"),
        Err(_) => value.to_string(),
    }
}

fn tolerance() -> BigDecimal {
    BigDecimal::new(2.into(), 2)
}

fn iva_rate() -> BigDecimal {
    BigDecimal::new(16.into(), 2).with_scale(DECIMAL_SCALE)
}

/// 表格中的一条记录; `line` 为文件中的行号 (表头为 1)
struct SheetRow {
    line: u64,
    record: StringRecord,
    blank: bool,
}

/// 已解析的表格, 空行保留以便原样回显
struct Sheet {
    headers: StringRecord,
    index: HashMap<String, usize>,
    rows: Vec<SheetRow>,
}

impl Sheet {
    fn parse(bytes: &[u8]) -> Result<Self, csv::Error> {
        let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
        let mut reader = ReaderBuilder::new()
            .flexible(true)
            .trim(Trim::All)
            .from_reader(bytes);

        let headers = reader.headers()?.clone();
        let mut index = HashMap::new();
        for (i, name) in headers.iter().enumerate() {
            index.entry(name.to_string()).or_insert(i);
        }

        let mut rows = Vec::new();
        for (idx, record) in reader.records().enumerate() {
            let record = record?;
            let line = record
                .position()
                .map(|p| p.line())
                .unwrap_or(idx as u64 + 2);
            let blank = record.iter().all(|f| f.trim().is_empty());
            rows.push(SheetRow {
                line,
                record,
                blank,
            });
        }
        Ok(Self {
            headers,
            index,
            rows,
        })
    }

    /// 非空数据行
    fn data_rows(&self) -> impl Iterator<Item = &SheetRow> {
        self.rows.iter().filter(|r| !r.blank)
    }

    fn missing_columns(&self) -> Vec<&'static str> {
        EXPECTED_COLUMNS
            .iter()
            .copied()
            .filter(|c| !self.index.contains_key(*c))
            .collect()
    }

    fn cell<'r>(&self, row: &'r StringRecord, column: &str) -> &'r str {
        self.index
            .get(column)
            .and_then(|&i| row.get(i))
            .map(str::trim)
            .unwrap_or("")
    }
}

/// 表格校验器
#[derive(Debug, Clone, Default)]
pub struct SpreadsheetValidator {
    today: Option<NaiveDate>,
}

impl SpreadsheetValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 固定 "今天" (测试用)
    pub fn with_today(today: NaiveDate) -> Self {
        Self { today: Some(today) }
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Local::now().date_naive())
    }

    pub fn process(&self, input: &SpreadsheetInput<'_>) -> ValidationReport {
        // .xlsx / .xls 是二进制容器, 不是 CSV
        if input.bytes.starts_with(XLSX_MAGIC) || input.bytes.starts_with(XLS_MAGIC) {
            tracing::warn!("archivo de Excel recibido en lugar de CSV");
            return ValidationReport::invalid(vec![EXCEL_UPLOAD_MESSAGE.to_string()]);
        }
        let sheet = match Sheet::parse(input.bytes) {
            Ok(sheet) => sheet,
            Err(e) => {
                tracing::warn!("No se pudo leer el archivo: {}", e);
                return ValidationReport::invalid(vec![format!(
                    "No se pudo leer el archivo (se espera CSV UTF-8 exportado desde Excel): {e}"
                )]);
            }
        };

        let missing = sheet.missing_columns();
        if !missing.is_empty() {
            return ValidationReport::invalid(vec![format!(
                "Faltan columnas requeridas: {}",
                missing.join(", ")
            )]);
        }
        let Some(first) = sheet.data_rows().next() else {
            return ValidationReport::invalid(vec!["El archivo no contiene partidas".to_string()]);
        };
        let first = &first.record;

        // 逐行校验; 行号取自文件, 空行不参与校验但仍占行号
        let mut row_errors: Vec<(u64, Vec<String>)> = Vec::with_capacity(sheet.rows.len());
        let mut items = Vec::with_capacity(sheet.rows.len());
        for row in sheet.data_rows() {
            let (item, errors) = validate_row(&sheet, &row.record);
            items.push(item);
            row_errors.push((row.line, errors));
        }

        let errors: Vec<String> = row_errors
            .iter()
            .filter(|(_, errs)| !errs.is_empty())
            .map(|(line, errs)| format!("Fila {}: {}", line, errs.join("; ")))
            .collect();

        if !errors.is_empty() {
            tracing::info!("{} filas con errores", errors.len());
            return ValidationReport {
                valid: false,
                errors,
                payload: None,
                annotated: annotate(&sheet, &row_errors),
            };
        }

        self.build_payload(&sheet, first, input, items)
    }

    /// 文档级校验 + 组装报文 (表头字段取第一行)
    fn build_payload(
        &self,
        sheet: &Sheet,
        first: &StringRecord,
        input: &SpreadsheetInput<'_>,
        items: Vec<CfdiItem>,
    ) -> ValidationReport {
        let mut errors = Vec::new();

        let payment_form = normalize_payment_form(sheet.cell(first, "Forma de Pago"));
        let payment_method = sheet.cell(first, "Metodo de Pago").to_uppercase();
        if !PAYMENT_METHODS.contains(&payment_method.as_str()) {
            errors.push("Metodo de Pago debe ser PUE o PPD".to_string());
        }

        let expedition_source = input
            .expedition_place
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| sheet.cell(first, "CP"));
        let expedition_place = normalize_cp(expedition_source);
        if expedition_place.is_empty() {
            errors.push("Código Postal (Lugar de expedición) requerido".to_string());
        } else if expedition_place.len() != 5 || !expedition_place.bytes().all(|b| b.is_ascii_digit()) {
            errors.push("Código Postal (Lugar de expedición) debe tener 5 dígitos".to_string());
        }

        if input.issue_date < self.today() - Duration::days(MAX_ISSUE_AGE_DAYS) {
            errors.push("Fecha de emisión no puede ser mayor a 2 días atrás".to_string());
        }

        let year_raw = sheet.cell(first, "Year");
        let year = match to_decimal(year_raw).map(|d| d.to_i32()) {
            Ok(Some(y)) => y,
            _ => {
                errors.push(format!("Year: No es un número válido: {year_raw}"));
                0
            }
        };

        if !errors.is_empty() {
            return ValidationReport::invalid(errors);
        }

        let observations = input
            .observations
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .unwrap_or_else(|| sheet.cell(first, "Observaciones"))
            .to_string();

        let payload = CfdiPayload {
            serie: input.serie.to_string(),
            folio: input.folio,
            cfdi_type: CFDI_TYPE.to_string(),
            payment_form,
            payment_method,
            expedition_place,
            currency: CURRENCY.to_string(),
            date: input.issue_date,
            observations,
            receiver: Receiver {
                rfc: sheet.cell(first, "RFC").to_string(),
                name: sheet.cell(first, "Razon Social").to_string(),
                cfdi_use: sheet.cell(first, "UsoCFDI").to_string(),
                fiscal_regime: sheet.cell(first, "Fiscal Regime").to_string(),
                tax_zip_code: normalize_cp(sheet.cell(first, "CP")),
                email: sheet.cell(first, "Mail").to_string(),
            },
            global_information: GlobalInformation {
                periodicity: sheet.cell(first, "Periodicidad").to_string(),
                months: sheet.cell(first, "Mes").to_string(),
                year,
            },
            items,
        };

        ValidationReport {
            valid: true,
            errors: Vec::new(),
            payload: Some(payload),
            annotated: None,
        }
    }
}

/// 单行校验, 返回明细与该行的错误列表
fn validate_row(sheet: &Sheet, row: &StringRecord) -> (CfdiItem, Vec<String>) {
    let mut errors = Vec::new();
    let mut dec = |column: &str| match to_decimal(sheet.cell(row, column)) {
        Ok(d) => d,
        Err(e) => {
            errors.push(format!("{column}: {e}"));
            BigDecimal::zero().with_scale(DECIMAL_SCALE)
        }
    };

    let quantity = dec("Cantidad");
    let unit_price = dec("Precio Unitario");
    let subtotal = dec("Subtotal del Concepto");
    let iva = dec("IVA del Concepto");
    let total = dec("Total del Concepto");

    let zero = BigDecimal::zero();
    if quantity <= zero {
        errors.push("Cantidad debe ser mayor a 0".to_string());
    }
    if subtotal < zero || iva < zero || total < zero {
        errors.push("Importes no pueden ser negativos".to_string());
    }
    if (&total - (&subtotal + &iva)).abs() > tolerance() {
        errors.push("Total no cuadra con Subtotal + IVA (tolerancia 0.02)".to_string());
    }

    let identification_number = sheet.cell(row, "Pedido");
    if identification_number.is_empty() {
        errors.push("Pedido es obligatorio (IdentificationNumber)".to_string());
    }
    let product_code = sheet.cell(row, "ClaveProdServ");
    let unit_code = sheet.cell(row, "ClaveUnidad");
    let tax_object = sheet.cell(row, "Objeto Impuesto");
    if product_code.is_empty() {
        errors.push("ClaveProdServ requerida".to_string());
    }
    if unit_code.is_empty() {
        errors.push("ClaveUnidad requerida".to_string());
    }
    if tax_object.is_empty() {
        errors.push("Objeto Impuesto requerido".to_string());
    }

    let mut taxes = Vec::new();
    if iva > zero {
        taxes.push(TaxEntry {
            name: "IVA".to_string(),
            rate: iva_rate(),
            is_retention: false,
            base: subtotal.clone(),
            total: iva,
        });
    }

    let item = CfdiItem {
        product_code: product_code.to_string(),
        description: sheet.cell(row, "Concepto").to_string(),
        identification_number: identification_number.to_string(),
        unit_code: unit_code.to_string(),
        unit: sheet.cell(row, "Unidad").to_string(),
        quantity,
        unit_price,
        subtotal,
        tax_object: tax_object.to_string(),
        taxes,
        total,
    };
    (item, errors)
}

/// 生成标注副本: 原表头 + `Errores` 列
fn annotate(sheet: &Sheet, row_errors: &[(u64, Vec<String>)]) -> Option<Vec<u8>> {
    let build = || -> Result<Vec<u8>, csv::Error> {
        let mut writer = WriterBuilder::new().flexible(true).from_writer(Vec::new());

        let mut header = sheet.headers.clone();
        header.push_field(ERROR_COLUMN);
        writer.write_record(&header)?;

        let mut errors = row_errors.iter();
        for row in &sheet.rows {
            let mut record = row.record.clone();
            // 短行补齐, 保证错误列对齐
            while record.len() < sheet.headers.len() {
                record.push_field("");
            }
            let message = if row.blank {
                String::new()
            } else {
                errors.next().map(|(_, e)| e.join("; ")).unwrap_or_default()
            };
            record.push_field(&message);
            writer.write_record(&record)?;
        }

        writer
            .into_inner()
            .map_err(|e| csv::Error::from(e.into_error()))
    };

    match build() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::error!("No se pudo generar el archivo de errores: {}", e);
            None
        }
    }
}
