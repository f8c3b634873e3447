//! Retrieval-augmented answering over the sales index.
//!
//! [`RagEngine`] owns an immutable snapshot of the vector index plus the
//! embedding and generation backends. A query embeds the question, retrieves
//! the top-k documents, renders them into a fixed Spanish grounding prompt,
//! and runs one completion. The prompt instructs the model to answer from
//! the provided context only and to emit [`REFUSAL`] verbatim when the
//! context does not contain the answer.
//!
//! Engines are cheap to share (`Arc`) and never mutated; a rebuild creates a
//! whole new engine which the server swaps in atomically.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::dataset::load_dataset;
use crate::documents::{build_documents, DocMetadata, Document, EntityKind};
use crate::embedding::{self, EmbeddingProvider};
use crate::generate::Generator;
use crate::index::{self, VectorIndex};

/// Fixed refusal answer the model is instructed to use when the retrieved
/// context cannot support an answer.
pub const REFUSAL: &str =
    "No tengo suficiente información en los datos para responder esa pregunta.";

/// Grounding prompt. `{context}` and `{question}` are substituted verbatim.
const PROMPT_TEMPLATE: &str = "\
Sos un asistente que responde sobre un dataset de ventas de Retail 360.

Usa EXCLUSIVAMENTE la información del siguiente CONTEXTO para responder la pregunta.
Si la respuesta no está en el contexto, respondé explícitamente \"No tengo suficiente información en los datos para responder esa pregunta.\"
NO inventes números, clientes, productos ni datos que no estén en el contexto.

CONTEXTO:
{context}

PREGUNTA: {question}

RESPUESTA:";

/// One prior conversational turn, as sent by clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

/// A retrieved document reference returned alongside the answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EntityKind,
    pub metadata: DocMetadata,
}

/// The unified answer contract: `sources` is always present and empty only
/// when retrieval returned nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub answer: String,
    pub sources: Vec<Source>,
}

/// An immutable, query-ready RAG snapshot.
pub struct RagEngine {
    index: VectorIndex,
    embedder: Arc<dyn EmbeddingProvider>,
    generator: Arc<dyn Generator>,
    top_k: usize,
}

impl RagEngine {
    pub fn new(
        index: VectorIndex,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn Generator>,
        top_k: usize,
    ) -> Self {
        Self {
            index,
            embedder,
            generator,
            top_k,
        }
    }

    /// Number of indexed documents.
    pub fn document_count(&self) -> usize {
        self.index.len()
    }

    /// Generation model identifier, for health reporting.
    pub fn generator_model(&self) -> &str {
        self.generator.model_name()
    }

    /// Probe whether the generation backend is up.
    pub async fn generator_reachable(&self) -> bool {
        self.generator.is_reachable().await
    }

    /// Answer a question against the indexed documents.
    ///
    /// `history` is accepted for API compatibility; retrieval and generation
    /// key off the current question only.
    pub async fn answer(&self, question: &str, _history: &[ChatTurn]) -> Result<Answer> {
        let question = question.trim();
        if question.is_empty() {
            bail!("Question must not be empty");
        }

        let query_vec = embedding::embed_query(self.embedder.as_ref(), question).await?;
        let hits = self.index.search(&query_vec, self.top_k);
        info!(question = %truncate(question, 100), retrieved = hits.len(), "Retrieval complete");

        let docs: Vec<&Document> = hits.iter().map(|h| h.document).collect();
        let context = format_docs(&docs);
        let prompt = render_prompt(&context, question);

        let raw = self.generator.generate(&prompt).await?;

        let sources = docs
            .iter()
            .map(|d| Source {
                id: d.metadata.id.clone(),
                kind: d.metadata.kind,
                metadata: d.metadata.clone(),
            })
            .collect();

        Ok(Answer {
            answer: raw.trim().to_string(),
            sources,
        })
    }
}

/// Join document texts with blank lines to form the prompt context.
pub fn format_docs(docs: &[&Document]) -> String {
    docs.iter()
        .map(|d| d.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn render_prompt(context: &str, question: &str) -> String {
    PROMPT_TEMPLATE
        .replace("{context}", context)
        .replace("{question}", question)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Load the spreadsheet, build documents, and load-or-build the index into a
/// query-ready engine. `force_rebuild` bypasses any persisted artifacts.
pub async fn build_engine(
    config: &Config,
    embedder: Arc<dyn EmbeddingProvider>,
    generator: Arc<dyn Generator>,
    force_rebuild: bool,
) -> Result<RagEngine> {
    let dataset = load_dataset(&config.data.spreadsheet, &config.columns)?;
    let documents = build_documents(&dataset);
    if documents.is_empty() {
        bail!(
            "Spreadsheet {} produced zero documents; nothing to index",
            config.data.spreadsheet.display()
        );
    }
    info!(documents = documents.len(), "Documents built from spreadsheet");

    let batch_size = config.embedding.batch_size;
    let index = if force_rebuild {
        index::rebuild(documents, embedder.as_ref(), &config.index.dir, batch_size).await?
    } else {
        index::load_or_build(documents, embedder.as_ref(), &config.index.dir, batch_size).await?
    };

    Ok(RagEngine::new(
        index,
        embedder,
        generator,
        config.index.top_k,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FixedEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FixedEmbedder {
        fn model_name(&self) -> &str {
            "stub"
        }
        fn dims(&self) -> usize {
            4
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0f32; 4];
                    for (i, b) in t.bytes().enumerate() {
                        v[i % 4] += f32::from(b);
                    }
                    crate::embedding::l2_normalize(&mut v);
                    v
                })
                .collect())
        }
    }

    /// Echoes the refusal when the prompt context is empty-ish, otherwise a
    /// canned answer; records the prompt it saw.
    struct ScriptedGenerator {
        seen: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        fn model_name(&self) -> &str {
            "scripted"
        }
        async fn generate(&self, prompt: &str) -> Result<String> {
            self.seen.lock().unwrap().push(prompt.to_string());
            if prompt.contains("Cliente: Ana") {
                Ok("  Ana compró un Mouse.  ".to_string())
            } else {
                Ok(REFUSAL.to_string())
            }
        }
        async fn is_reachable(&self) -> bool {
            true
        }
    }

    fn doc(kind: EntityKind, id: &str, text: &str) -> Document {
        Document {
            text: text.to_string(),
            metadata: DocMetadata {
                kind,
                id: id.to_string(),
                id_producto: None,
                id_cliente: None,
            },
        }
    }

    async fn engine_with(docs: Vec<Document>) -> (RagEngine, Arc<ScriptedGenerator>) {
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(FixedEmbedder);
        let generator = Arc::new(ScriptedGenerator {
            seen: std::sync::Mutex::new(Vec::new()),
        });
        let index = VectorIndex::build(docs, embedder.as_ref(), 8).await.unwrap();
        let generator_dyn: Arc<dyn Generator> = generator.clone();
        let engine = RagEngine::new(index, embedder, generator_dyn, 2);
        (engine, generator)
    }

    #[test]
    fn prompt_contains_context_and_question() {
        let prompt = render_prompt("[VENTA]\nTotal: 30", "¿Cuál fue el total?");
        assert!(prompt.contains("CONTEXTO:\n[VENTA]\nTotal: 30"));
        assert!(prompt.contains("PREGUNTA: ¿Cuál fue el total?"));
        assert!(prompt.ends_with("RESPUESTA:"));
        assert!(prompt.contains(REFUSAL));
    }

    #[test]
    fn format_docs_joins_with_blank_lines() {
        let a = doc(EntityKind::Venta, "1", "uno");
        let b = doc(EntityKind::Venta, "2", "dos");
        assert_eq!(format_docs(&[&a, &b]), "uno\n\ndos");
        assert_eq!(format_docs(&[]), "");
    }

    #[tokio::test]
    async fn answer_carries_sources_and_trims() {
        let docs = vec![
            doc(EntityKind::Venta, "1", "[VENTA]\nCliente: Ana\nTotal: 30\n"),
            doc(EntityKind::Cliente, "7", "[CLIENTE]\nNombreCliente: Ana\n"),
        ];
        let (engine, generator) = engine_with(docs).await;

        let answer = engine.answer("¿Qué compró Ana?", &[]).await.unwrap();
        assert_eq!(answer.answer, "Ana compró un Mouse.");
        assert_eq!(answer.sources.len(), 2);
        assert!(answer.sources.iter().any(|s| s.id == "1"));

        let prompts = generator.seen.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("CONTEXTO:"));
    }

    #[tokio::test]
    async fn ungrounded_question_gets_refusal() {
        let docs = vec![doc(EntityKind::Producto, "3", "[PRODUCTO]\nNombreProducto: Teclado\n")];
        let (engine, _) = engine_with(docs).await;

        let answer = engine.answer("¿Cuántos empleados hay?", &[]).await.unwrap();
        assert_eq!(answer.answer, REFUSAL);
        // sources still reported; the caller decides how to present a refusal
        assert_eq!(answer.sources.len(), 1);
    }

    #[tokio::test]
    async fn empty_question_is_rejected() {
        let docs = vec![doc(EntityKind::Venta, "1", "x")];
        let (engine, _) = engine_with(docs).await;
        assert!(engine.answer("   ", &[]).await.is_err());
    }
}
