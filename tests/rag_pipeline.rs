//! Library-level pipeline tests: spreadsheet bytes in, grounded answers
//! out, with stub embedding and generation backends so nothing needs a
//! live model server.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use retail_rag::config::ColumnsConfig;
use retail_rag::dataset::dataset_from_workbook;
use retail_rag::documents::{build_documents, Document, EntityKind};
use retail_rag::embedding::EmbeddingProvider;
use retail_rag::generate::Generator;
use retail_rag::index::{self, VectorIndex};
use retail_rag::pipeline::{RagEngine, REFUSAL};
use retail_rag::workbook::read_workbook_bytes;

/// Deterministic content-hash embedder with a call counter.
struct CountingEmbedder {
    calls: AtomicUsize,
}

impl CountingEmbedder {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    fn vector_for(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; 16];
        for (i, b) in text.bytes().enumerate() {
            v[i % 16] += f32::from(b);
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for CountingEmbedder {
    fn model_name(&self) -> &str {
        "counting-stub"
    }
    fn dims(&self) -> usize {
        16
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::vector_for(t)).collect())
    }
}

/// Honors the grounding contract: answers only when the prompt context
/// mentions the asked-about entity, refuses otherwise.
struct GroundedStubGenerator;

#[async_trait]
impl Generator for GroundedStubGenerator {
    fn model_name(&self) -> &str {
        "grounded-stub"
    }
    async fn generate(&self, prompt: &str) -> Result<String> {
        let context = prompt
            .split("CONTEXTO:")
            .nth(1)
            .and_then(|s| s.split("PREGUNTA:").next())
            .unwrap_or("");
        let question = prompt
            .split("PREGUNTA:")
            .nth(1)
            .and_then(|s| s.split("RESPUESTA:").next())
            .unwrap_or("");

        let asked_entity = question.split_whitespace().last().unwrap_or("").trim_end_matches('?');
        if !asked_entity.is_empty() && context.contains(asked_entity) {
            Ok(format!("Según los datos: {}", asked_entity))
        } else {
            Ok(REFUSAL.to_string())
        }
    }
    async fn is_reachable(&self) -> bool {
        true
    }
}

fn fixture_documents() -> Vec<Document> {
    let wb = read_workbook_bytes(&common::sales_fixture()).unwrap();
    let dataset = dataset_from_workbook(&wb, &ColumnsConfig::default()).unwrap();
    build_documents(&dataset)
}

async fn fixture_engine() -> RagEngine {
    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(CountingEmbedder::new());
    let index = VectorIndex::build(fixture_documents(), embedder.as_ref(), 64)
        .await
        .unwrap();
    // Retrieve everything so the stub generator sees the full dataset and
    // the grounded/ungrounded distinction does not depend on ranking.
    RagEngine::new(index, embedder, Arc::new(GroundedStubGenerator), 7)
}

#[test]
fn documents_cover_every_row() {
    let documents = fixture_documents();
    // 2 products + 2 customers + 3 sales
    assert_eq!(documents.len(), 7);
    let sales = documents
        .iter()
        .filter(|d| d.metadata.kind == EntityKind::Venta)
        .count();
    assert_eq!(sales, 3);
}

#[test]
fn joined_sale_carries_names_and_total() {
    let documents = fixture_documents();
    let sale1 = documents
        .iter()
        .find(|d| d.metadata.kind == EntityKind::Venta && d.metadata.id == "1")
        .expect("sale 1 document");

    assert!(sale1.text.starts_with("[VENTA]\n"), "text: {}", sale1.text);
    assert!(sale1.text.contains("Cliente: Ana\n"), "text: {}", sale1.text);
    assert!(sale1.text.contains("\nProducto: Mouse\n"), "text: {}", sale1.text);
    assert!(sale1.text.contains("Cantidad: 3\n"), "text: {}", sale1.text);
    assert!(sale1.text.contains("Total: 30\n"), "text: {}", sale1.text);
    assert!(sale1.text.contains("Año: 2024\n"), "text: {}", sale1.text);
    assert_eq!(sale1.metadata.id_cliente.as_deref(), Some("7"));
    assert_eq!(sale1.metadata.id_producto.as_deref(), Some("2"));
}

#[test]
fn missing_customers_sheet_is_not_fatal() {
    let bytes = common::build_xlsx(&[
        (
            "Productos",
            vec![
                vec!["IdProducto", "NombreProducto", "Categoria", "Precio"],
                vec!["1", "Teclado", "Perifericos", "25.5"],
            ],
        ),
        (
            "Ventas",
            vec![
                vec!["IdVenta", "FechaVenta", "IdCliente", "IdProducto", "Cantidad"],
                vec!["1", "45292", "7", "1", "2"],
            ],
        ),
    ]);
    let wb = read_workbook_bytes(&bytes).unwrap();
    let dataset = dataset_from_workbook(&wb, &ColumnsConfig::default()).unwrap();
    let documents = build_documents(&dataset);

    // 1 product + 1 sale; customer fields render as the None marker
    assert_eq!(documents.len(), 2);
    let sale = documents
        .iter()
        .find(|d| d.metadata.kind == EntityKind::Venta)
        .unwrap();
    assert!(sale.text.contains("Cliente: None\n"), "text: {}", sale.text);
}

#[tokio::test]
async fn engine_answers_with_sources() {
    let engine = fixture_engine().await;
    let answer = engine.answer("¿Qué compró Ana?", &[]).await.unwrap();

    assert_eq!(answer.answer, "Según los datos: Ana");
    assert_eq!(answer.sources.len(), 7);
}

#[tokio::test]
async fn ungrounded_question_yields_refusal() {
    let engine = fixture_engine().await;
    let answer = engine
        .answer("¿Cuántos empleados tiene Zaraza?", &[])
        .await
        .unwrap();

    assert_eq!(answer.answer, REFUSAL);
}

#[tokio::test]
async fn persisted_index_is_reused_without_reembedding() {
    let tmp = tempfile::tempdir().unwrap();
    let embedder = CountingEmbedder::new();

    let first = index::load_or_build(fixture_documents(), &embedder, tmp.path(), 64)
        .await
        .unwrap();
    let embeds_after_build = embedder.calls.load(Ordering::SeqCst);
    assert_eq!(embeds_after_build, 7);

    let second = index::load_or_build(fixture_documents(), &embedder, tmp.path(), 64)
        .await
        .unwrap();
    assert_eq!(
        embedder.calls.load(Ordering::SeqCst),
        embeds_after_build,
        "reload must not re-embed"
    );

    // Identical ranking before and after the round trip
    let query = CountingEmbedder::vector_for("Cliente: Ana");
    let ids = |idx: &VectorIndex| -> Vec<String> {
        idx.search(&query, 3)
            .into_iter()
            .map(|h| h.document.metadata.id.clone())
            .collect()
    };
    assert_eq!(ids(&first), ids(&second));
}

#[tokio::test]
async fn corrupted_artifacts_trigger_transparent_rebuild() {
    let tmp = tempfile::tempdir().unwrap();
    let embedder = CountingEmbedder::new();

    index::load_or_build(fixture_documents(), &embedder, tmp.path(), 64)
        .await
        .unwrap();
    std::fs::write(tmp.path().join("documents.json"), b"{ not json").unwrap();

    let rebuilt = index::load_or_build(fixture_documents(), &embedder, tmp.path(), 64)
        .await
        .unwrap();
    assert_eq!(rebuilt.len(), 7);
}
