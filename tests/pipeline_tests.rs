mod common;

use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio::sync::Barrier;

use common::{request, row, sheet, today, FakeGateway, Harness, ScriptedStore};
use factura_global::db::{InMemoryInvoiceStore, InvoiceStore};
use factura_global::gateway::{ExternalCfdi, GatewayError};
use factura_global::models::{FailureKind, InvoiceStatus, NewInvoice};
use factura_global::service::spreadsheet::EXPECTED_COLUMNS;
use factura_global::service::{ArtifactStore, InvoiceOrchestrator, SpreadsheetValidator};

#[tokio::test]
async fn successful_submission_persists_everything() {
    let h = Harness::new(FakeGateway::ok());
    h.store.set_counter("ML", 9);

    let bytes = sheet(&[row(&[]), row(&[("Pedido", "PED-2"), ("IVA del Concepto", "0"), ("Total del Concepto", "100")])]);
    let outcome = h.orchestrator.process(&request("ML", bytes)).await;

    assert!(outcome.success, "{:?}", outcome.errors);
    assert_eq!(outcome.folio, Some(10));
    assert_eq!(outcome.facturama_id.as_deref(), Some("ext-ML-10"));
    assert_eq!(outcome.uuid.as_deref(), Some("uuid-10"));
    assert!(outcome.errors.is_empty());

    let detail = h.store.get_invoice(outcome.invoice_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(detail.record.status, InvoiceStatus::Success);
    assert_eq!(detail.items.len(), 2);
    assert_eq!(detail.items[0].tax_total.as_ref().map(|t| t.to_string()), Some("16.000000".to_string()));
    assert_eq!(detail.items[1].tax_total, None);
    assert_eq!(h.store.counter_last_folio("ML").await.unwrap(), Some(10));

    for (path, ext) in [
        (&detail.record.pdf_path, "pdf"),
        (&detail.record.xml_path, "xml"),
        (&detail.record.zip_path, "zip"),
    ] {
        let path = path.as_deref().expect("artifact path");
        assert!(path.ends_with(&format!("ML-10.{ext}")));
        assert!(std::path::Path::new(path).is_file());
    }

    let submitted = h.gateway.submitted();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].folio, 10);
    assert_eq!(submitted[0].expedition_place, "64000");
}

#[tokio::test]
async fn missing_column_stops_before_any_record() {
    let h = Harness::new(FakeGateway::ok());
    let columns: Vec<&str> = EXPECTED_COLUMNS.iter().copied().filter(|c| *c != "RFC").collect();
    let bytes = common::csv_with(&columns, &[]);

    let outcome = h.orchestrator.process(&request("ML", bytes)).await;

    assert!(!outcome.success);
    assert_eq!(outcome.failure, Some(FailureKind::Validation));
    assert!(outcome.errors[0].contains("RFC"));
    assert!(outcome.error_excel.is_none());
    assert_eq!(h.store.invoice_count(), 0);
    assert!(h.gateway.submitted().is_empty());
}

#[tokio::test]
async fn row_errors_produce_annotated_sheet() {
    let h = Harness::new(FakeGateway::ok());
    let bytes = sheet(&[row(&[]), row(&[("Cantidad", "0")])]);

    let outcome = h.orchestrator.process(&request("ML", bytes)).await;

    assert_eq!(outcome.failure, Some(FailureKind::Validation));
    assert_eq!(outcome.errors, vec!["Fila 3: Cantidad debe ser mayor a 0"]);
    assert!(!outcome.retryable);

    let path = outcome.error_excel.expect("annotated sheet");
    assert!(path.ends_with("errores/ventas_octubre_errores.csv"));
    let content = std::fs::read_to_string(&path).unwrap();
    assert!(content.lines().next().unwrap().ends_with("Errores"));
    assert!(content.contains("Cantidad debe ser mayor a 0"));
    assert_eq!(h.store.invoice_count(), 0);
}

#[tokio::test]
async fn inactive_series_is_a_precondition_failure() {
    let h = Harness::new(FakeGateway::ok());
    h.store.put_series("OLD", "Histórica", false);

    let outcome = h.orchestrator.process(&request("OLD", sheet(&[row(&[])]))).await;
    assert_eq!(outcome.failure, Some(FailureKind::Precondition));
    assert_eq!(outcome.errors, vec!["La serie OLD está inactiva"]);

    let outcome = h.orchestrator.process(&request("NOPE", sheet(&[row(&[])]))).await;
    assert_eq!(outcome.errors, vec!["La serie NOPE no existe"]);
    assert_eq!(h.store.invoice_count(), 0);
}

#[tokio::test]
async fn folio_continues_after_highest_existing_invoice() {
    let h = Harness::new(FakeGateway::ok());
    h.store.set_counter("ML", 41);
    h.store.seed_invoice("ML", 42, InvoiceStatus::Success);

    let outcome = h.orchestrator.process(&request("ML", sheet(&[row(&[])]))).await;
    assert_eq!(outcome.folio, Some(43));
    assert_eq!(h.store.counter_last_folio("ML").await.unwrap(), Some(43));
}

#[tokio::test]
async fn gateway_rejection_marks_failed_and_frees_folio() {
    let body = r#"{"Message":"RFC invalido","ModelState":{"Receiver.Rfc":["formato incorrecto"]}}"#;
    let h = Harness::new(FakeGateway::rejecting(GatewayError::from_response(400, body)));
    h.store.set_counter("ML", 41);

    let outcome = h.orchestrator.process(&request("ML", sheet(&[row(&[])]))).await;

    assert!(!outcome.success);
    assert_eq!(outcome.failure, Some(FailureKind::Gateway));
    assert_eq!(
        outcome.errors,
        vec![
            "Error al timbrar factura (HTTP 400)",
            "RFC invalido",
            "Receiver.Rfc: formato incorrecto",
        ]
    );
    assert_eq!(outcome.folio, Some(42));

    let detail = h.store.get_invoice(outcome.invoice_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(detail.record.status, InvoiceStatus::Failed);
    assert_eq!(detail.record.error_message.as_deref(), Some("RFC invalido"));
    assert!(detail.record.response_json.unwrap().contains("ModelState"));
    assert!(detail.items.is_empty());
    assert_eq!(h.store.counter_last_folio("ML").await.unwrap(), Some(41));

    // 下一次尝试复用同一个 folio
    let retry = Harness::with_store(h.store.clone(), h.store.clone(), FakeGateway::ok());
    let outcome = retry.orchestrator.process(&request("ML", sheet(&[row(&[])]))).await;
    assert!(outcome.success);
    assert_eq!(outcome.folio, Some(42));
    assert_eq!(h.store.counter_last_folio("ML").await.unwrap(), Some(42));
}

#[tokio::test]
async fn transport_failure_is_terminal() {
    let h = Harness::new(FakeGateway::rejecting(GatewayError::transport("connection refused")));

    let outcome = h.orchestrator.process(&request("ML", sheet(&[row(&[])]))).await;

    assert_eq!(outcome.failure, Some(FailureKind::Gateway));
    assert_eq!(outcome.errors, vec!["Error al timbrar factura", "connection refused"]);
    let detail = h.store.get_invoice(outcome.invoice_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(detail.record.status, InvoiceStatus::Failed);
    assert_eq!(detail.record.error_message.as_deref(), Some("No se pudo contactar Facturama"));
}

#[tokio::test]
async fn missing_pdf_does_not_fail_the_invoice() {
    let h = Harness::new(FakeGateway {
        missing_pdf: true,
        ..FakeGateway::default()
    });

    let outcome = h.orchestrator.process(&request("ML", sheet(&[row(&[])]))).await;

    assert!(outcome.success);
    let record = h.store.get_invoice(outcome.invoice_id.unwrap()).await.unwrap().unwrap().record;
    assert_eq!(record.status, InvoiceStatus::Success);
    assert!(record.pdf_path.is_none());
    assert!(record.xml_path.is_some());
    assert!(record.zip_path.is_some());
}

#[tokio::test]
async fn artifact_errors_are_swallowed() {
    let h = Harness::new(FakeGateway {
        artifact_error: true,
        ..FakeGateway::default()
    });

    let outcome = h.orchestrator.process(&request("ML", sheet(&[row(&[])]))).await;

    assert!(outcome.success);
    let record = h.store.get_invoice(outcome.invoice_id.unwrap()).await.unwrap().unwrap().record;
    assert_eq!(record.status, InvoiceStatus::Success);
    assert!(record.pdf_path.is_none() && record.xml_path.is_none() && record.zip_path.is_none());
}

#[tokio::test]
async fn concurrent_attempts_collide_on_same_folio() {
    let inner = InMemoryInvoiceStore::arc();
    inner.put_series("ML", "Mercado Libre", true);
    inner.set_counter("ML", 43);
    let scripted = Arc::new(ScriptedStore {
        rendezvous: Some(Barrier::new(2)),
        ..ScriptedStore::wrap(inner.clone())
    });
    let h = Harness::with_store(inner.clone(), scripted, FakeGateway::ok());

    let req = request("ML", sheet(&[row(&[])]));
    let (a, b) = tokio::join!(h.orchestrator.process(&req), h.orchestrator.process(&req));

    let (won, lost) = if a.success { (a, b) } else { (b, a) };
    assert!(won.success);
    assert_eq!(won.folio, Some(44));
    assert_eq!(lost.failure, Some(FailureKind::FolioConflict));
    assert!(lost.retryable);
    assert_eq!(lost.folio, Some(44));
    assert_eq!(
        lost.errors,
        vec!["El folio 44 de la serie ML ya existe. Intenta de nuevo."]
    );
    assert!(lost.invoice_id.is_none());

    assert_eq!(inner.invoice_count(), 1);
    assert_eq!(h.gateway.submitted().len(), 1);
}

#[tokio::test]
async fn unexpected_store_failure_hides_details() {
    let inner = InMemoryInvoiceStore::arc();
    inner.put_series("ML", "Mercado Libre", true);
    let scripted = Arc::new(ScriptedStore {
        fail_record_submission: true,
        ..ScriptedStore::wrap(inner.clone())
    });
    let h = Harness::with_store(inner.clone(), scripted, FakeGateway::ok());

    let outcome = h.orchestrator.process(&request("ML", sheet(&[row(&[])]))).await;

    assert_eq!(outcome.failure, Some(FailureKind::Internal));
    assert_eq!(outcome.errors, vec!["Error inesperado, revisa logs"]);
    let record = inner.get_invoice(outcome.invoice_id.unwrap()).await.unwrap().unwrap().record;
    assert_eq!(record.status, InvoiceStatus::Failed);
    assert!(record.error_message.unwrap().contains("disk full"));
    assert!(record.response_json.unwrap().contains("ext-ML-1"));
    // Facturama ya emitió el folio 1
    assert_eq!(inner.counter_last_folio("ML").await.unwrap(), Some(1));
}

#[tokio::test]
async fn issued_folio_is_not_reused_after_store_failure() {
    let inner = InMemoryInvoiceStore::arc();
    inner.put_series("ML", "Mercado Libre", true);
    let scripted = Arc::new(ScriptedStore {
        fail_record_submission: true,
        ..ScriptedStore::wrap(inner.clone())
    });
    let broken = Harness::with_store(inner.clone(), scripted, FakeGateway::ok());
    let first = broken.orchestrator.process(&request("ML", sheet(&[row(&[])]))).await;
    assert_eq!(first.failure, Some(FailureKind::Internal));
    assert_eq!(first.folio, Some(1));

    let healthy = Harness::with_store(inner.clone(), inner.clone(), FakeGateway::ok());
    let second = healthy.orchestrator.process(&request("ML", sheet(&[row(&[])]))).await;

    assert!(second.success, "{:?}", second.errors);
    assert_eq!(second.folio, Some(2));
    let folios: Vec<i64> = healthy.gateway.submitted().iter().map(|p| p.folio).collect();
    assert_eq!(folios, vec![2]);
}

#[tokio::test]
async fn counter_failure_after_acceptance_still_reports_success() {
    let inner = InMemoryInvoiceStore::arc();
    inner.put_series("ML", "Mercado Libre", true);
    let scripted = Arc::new(ScriptedStore {
        fail_raise_counter: true,
        ..ScriptedStore::wrap(inner.clone())
    });
    let h = Harness::with_store(inner.clone(), scripted, FakeGateway::ok());

    let outcome = h.orchestrator.process(&request("ML", sheet(&[row(&[])]))).await;

    assert!(outcome.success, "{:?}", outcome.errors);
    assert_eq!(outcome.folio, Some(1));
    assert_eq!(outcome.facturama_id.as_deref(), Some("ext-ML-1"));
    let record = inner.get_invoice(outcome.invoice_id.unwrap()).await.unwrap().unwrap().record;
    assert_eq!(record.status, InvoiceStatus::Success);

    // el registro exitoso sigue ocupando el folio
    let next = Harness::with_store(inner.clone(), inner.clone(), FakeGateway::ok());
    let second = next.orchestrator.process(&request("ML", sheet(&[row(&[])]))).await;
    assert_eq!(second.folio, Some(2));
}

#[tokio::test]
async fn unrecorded_acceptance_stays_pending_and_holds_its_folio() {
    let inner = InMemoryInvoiceStore::arc();
    inner.put_series("ML", "Mercado Libre", true);
    let scripted = Arc::new(ScriptedStore {
        fail_record_submission: true,
        fail_raise_counter: true,
        ..ScriptedStore::wrap(inner.clone())
    });
    let h = Harness::with_store(inner.clone(), scripted, FakeGateway::ok());

    let outcome = h.orchestrator.process(&request("ML", sheet(&[row(&[])]))).await;

    assert_eq!(outcome.failure, Some(FailureKind::Internal));
    assert_eq!(outcome.errors, vec!["Error inesperado, revisa logs"]);
    let record = inner.get_invoice(outcome.invoice_id.unwrap()).await.unwrap().unwrap().record;
    assert_eq!(record.status, InvoiceStatus::Pending);

    let next = Harness::with_store(inner.clone(), inner.clone(), FakeGateway::ok());
    let second = next.orchestrator.process(&request("ML", sheet(&[row(&[])]))).await;
    assert_eq!(second.folio, Some(2));
}

fn pending_invoice(folio: i64, request_json: String) -> NewInvoice {
    NewInvoice {
        serie: "ML".to_string(),
        folio,
        issue_date: today(),
        excel_filename: "ventas.csv".to_string(),
        request_json,
    }
}

#[tokio::test]
async fn reconcile_resolves_stale_pending_records() {
    let store = InMemoryInvoiceStore::arc();
    store.put_series("ML", "Mercado Libre", true);

    // 用真实报文作为 request_json
    let payload = SpreadsheetValidator::with_today(today())
        .process(&factura_global::service::SpreadsheetInput {
            bytes: &sheet(&[row(&[])]),
            serie: "ML",
            folio: 50,
            issue_date: today(),
            expedition_place: None,
            observations: None,
        })
        .payload
        .unwrap();
    let now = Utc::now();
    let found = store
        .insert_pending(&pending_invoice(50, serde_json::to_string(&payload).unwrap()))
        .await
        .unwrap();
    let orphan = store.insert_pending(&pending_invoice(51, "{}".to_string())).await.unwrap();
    let fresh = store.insert_pending(&pending_invoice(52, "{}".to_string())).await.unwrap();
    store.backdate(found, now - Duration::hours(2));
    store.backdate(orphan, now - Duration::hours(2));

    let gateway = FakeGateway {
        issued: vec![ExternalCfdi {
            id: "ext-50".to_string(),
            serie: Some("ML".to_string()),
            folio: Some("50".to_string()),
            uuid: Some("uuid-50".to_string()),
            date: None,
            status: Some("active".to_string()),
        }],
        ..FakeGateway::default()
    };
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = InvoiceOrchestrator::new(store.clone(), Arc::new(gateway), ArtifactStore::new(dir.path()))
        .with_reconcile_after(Duration::minutes(30));

    let summary = orchestrator.reconcile_pending(now).await.unwrap();
    assert_eq!((summary.resolved, summary.failed, summary.skipped), (1, 1, 0));

    let resolved = store.get_invoice(found).await.unwrap().unwrap();
    assert_eq!(resolved.record.status, InvoiceStatus::Success);
    assert_eq!(resolved.record.facturama_id.as_deref(), Some("ext-50"));
    assert_eq!(resolved.record.uuid.as_deref(), Some("uuid-50"));
    assert_eq!(resolved.items.len(), 1);
    assert!(resolved.record.pdf_path.is_some());
    assert_eq!(store.counter_last_folio("ML").await.unwrap(), Some(50));

    let failed = store.get_invoice(orphan).await.unwrap().unwrap().record;
    assert_eq!(failed.status, InvoiceStatus::Failed);
    assert_eq!(
        failed.error_message.as_deref(),
        Some("Sin registro en el servicio de timbrado tras reconciliación")
    );

    let untouched = store.get_invoice(fresh).await.unwrap().unwrap().record;
    assert_eq!(untouched.status, InvoiceStatus::Pending);
}

#[tokio::test]
async fn reconcile_leaves_pending_when_gateway_unavailable() {
    let store = InMemoryInvoiceStore::arc();
    store.put_series("ML", "Mercado Libre", true);
    let now = Utc::now();
    let id = store.insert_pending(&pending_invoice(7, "{}".to_string())).await.unwrap();
    store.backdate(id, now - Duration::hours(1));

    let dir = tempfile::tempdir().unwrap();
    let gateway = FakeGateway {
        list_error: true,
        ..FakeGateway::default()
    };
    let orchestrator = InvoiceOrchestrator::new(store.clone(), Arc::new(gateway), ArtifactStore::new(dir.path()));

    let summary = orchestrator.reconcile_pending(now).await.unwrap();
    assert_eq!(summary.skipped, 1);
    let record = store.get_invoice(id).await.unwrap().unwrap().record;
    assert_eq!(record.status, InvoiceStatus::Pending);
}
