use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::{InvoiceStore, StoreError};
use crate::models::{
    ArtifactPaths, InvoiceDetail, InvoiceFilter, InvoiceLineItem, InvoiceRecord, InvoiceStatus,
    NewInvoice, SeriesDefinition, SeriesSummary, SubmissionUpdate,
};

const INVOICE_COLUMNS: &str = r#"
    id, created_at, status, serie, folio, facturama_id, uuid, issue_date,
    excel_filename, request_json, response_json, error_message,
    pdf_path, xml_path, zip_path
"#;

/// PostgreSQL 实现
#[derive(Clone)]
pub struct PgInvoiceStore {
    pool: PgPool,
}

impl PgInvoiceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// 唯一约束冲突 (SQLSTATE 23505)
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

#[async_trait]
impl InvoiceStore for PgInvoiceStore {
    async fn get_series(&self, code: &str) -> Result<Option<SeriesDefinition>, StoreError> {
        let series = sqlx::query_as::<_, SeriesDefinition>(
            r#"
            SELECT code, description, is_active
            FROM series
            WHERE code = $1
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(series)
    }

    async fn ensure_series(&self, code: &str, description: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO series (code, description, is_active)
            VALUES ($1, $2, TRUE)
            ON CONFLICT (code) DO NOTHING
            "#,
        )
        .bind(code)
        .bind(description)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_series(&self) -> Result<Vec<SeriesSummary>, StoreError> {
        let rows = sqlx::query_as::<_, SeriesSummary>(
            r#"
            SELECT s.code, s.description, s.is_active, c.last_folio
            FROM series s
            LEFT JOIN series_counters c ON c.series_code = s.code
            ORDER BY s.code
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn counter_last_folio(&self, code: &str) -> Result<Option<i64>, StoreError> {
        let last = sqlx::query_scalar::<_, i64>(
            "SELECT last_folio FROM series_counters WHERE series_code = $1",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(last)
    }

    async fn max_invoice_folio(&self, code: &str) -> Result<Option<i64>, StoreError> {
        let max = sqlx::query_scalar::<_, Option<i64>>(
            r#"
            SELECT max(folio)
            FROM invoices
            WHERE serie = $1
              AND status <> 'failed'
            "#,
        )
        .bind(code)
        .fetch_one(&self.pool)
        .await?;
        Ok(max)
    }

    async fn raise_counter(&self, code: &str, folio: i64) -> Result<i64, StoreError> {
        let last = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO series_counters (series_code, last_folio)
            VALUES ($1, $2)
            ON CONFLICT (series_code) DO UPDATE
            SET last_folio = GREATEST(series_counters.last_folio, EXCLUDED.last_folio)
            RETURNING last_folio
            "#,
        )
        .bind(code)
        .bind(folio)
        .fetch_one(&self.pool)
        .await?;
        Ok(last)
    }

    async fn insert_pending(&self, invoice: &NewInvoice) -> Result<i64, StoreError> {
        let result = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO invoices (status, serie, folio, issue_date, excel_filename, request_json)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(InvoiceStatus::Pending.as_str())
        .bind(&invoice.serie)
        .bind(invoice.folio)
        .bind(invoice.issue_date)
        .bind(&invoice.excel_filename)
        .bind(&invoice.request_json)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(id) => Ok(id),
            Err(e) if is_unique_violation(&e) => Err(StoreError::FolioConflict {
                serie: invoice.serie.clone(),
                folio: invoice.folio,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn record_submission(
        &self,
        id: i64,
        update: &SubmissionUpdate,
        items: &[InvoiceLineItem],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE invoices
            SET status = $2, facturama_id = $3, uuid = $4, response_json = $5
            WHERE id = $1
              AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(InvoiceStatus::Success.as_str())
        .bind(&update.facturama_id)
        .bind(&update.uuid)
        .bind(&update.response_json)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::NotPending(id));
        }

        if !items.is_empty() {
            let mut query_builder = sqlx::QueryBuilder::new(
                "INSERT INTO invoice_items (
                    invoice_id, product_code, description, unit_code, unit,
                    quantity, unit_price, subtotal, tax_object, tax_total, total,
                    identification_number
                ) ",
            );
            query_builder.push_values(items, |mut b, item| {
                b.push_bind(id)
                    .push_bind(&item.product_code)
                    .push_bind(&item.description)
                    .push_bind(&item.unit_code)
                    .push_bind(&item.unit)
                    .push_bind(item.quantity.clone())
                    .push_bind(item.unit_price.clone())
                    .push_bind(item.subtotal.clone())
                    .push_bind(&item.tax_object)
                    .push_bind(item.tax_total.clone())
                    .push_bind(item.total.clone())
                    .push_bind(&item.identification_number);
            });
            query_builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        tracing::debug!("factura {} registrada con {} partidas", id, items.len());
        Ok(())
    }

    async fn attach_artifacts(&self, id: i64, paths: &ArtifactPaths) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE invoices
            SET pdf_path = COALESCE($2, pdf_path),
                xml_path = COALESCE($3, xml_path),
                zip_path = COALESCE($4, zip_path)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&paths.pdf_path)
        .bind(&paths.xml_path)
        .bind(&paths.zip_path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: i64,
        error_message: &str,
        response_json: Option<&str>,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE invoices
            SET status = $2, error_message = $3, response_json = COALESCE($4, response_json)
            WHERE id = $1
              AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(InvoiceStatus::Failed.as_str())
        .bind(error_message)
        .bind(response_json)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::NotPending(id));
        }
        Ok(())
    }

    async fn get_invoice(&self, id: i64) -> Result<Option<InvoiceDetail>, StoreError> {
        let sql = format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = $1");
        let Some(record) = sqlx::query_as::<_, InvoiceRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let items = sqlx::query_as::<_, InvoiceLineItem>(
            r#"
            SELECT product_code, description, unit_code, unit, quantity, unit_price,
                   subtotal, tax_object, tax_total, total, identification_number
            FROM invoice_items
            WHERE invoice_id = $1
            ORDER BY id
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(InvoiceDetail { record, items }))
    }

    async fn list_invoices(&self, filter: &InvoiceFilter) -> Result<Vec<InvoiceRecord>, StoreError> {
        let sql = format!(
            r#"
            SELECT {INVOICE_COLUMNS}
            FROM invoices
            WHERE ($1::date IS NULL OR created_at >= $1::date)
              AND ($2::date IS NULL OR created_at < $2::date + 1)
              AND ($3::varchar IS NULL OR serie = $3)
              AND ($4::varchar IS NULL OR status = $4)
            ORDER BY created_at DESC, id DESC
            "#
        );
        let rows = sqlx::query_as::<_, InvoiceRecord>(&sql)
            .bind(filter.date_start)
            .bind(filter.date_end)
            .bind(filter.serie.as_deref())
            .bind(filter.status.map(|s| s.as_str()))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn list_stale_pending(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<InvoiceRecord>, StoreError> {
        let sql = format!(
            r#"
            SELECT {INVOICE_COLUMNS}
            FROM invoices
            WHERE status = 'pending'
              AND created_at < $1
            ORDER BY created_at
            "#
        );
        let rows = sqlx::query_as::<_, InvoiceRecord>(&sql)
            .bind(created_before)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}
