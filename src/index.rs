//! Vector index: build, persist, load, and query document embeddings.
//!
//! The index is two co-located artifacts under the configured directory:
//!
//! - `index.bin` — a binary blob of little-endian f32 vectors behind a small
//!   header (magic, version, dims, count).
//! - `documents.json` — a sidecar mapping internal numeric ids back to
//!   document content and metadata, plus the embedding model name.
//!
//! Both files must exist for a load attempt to be considered valid; a
//! missing or corrupt artifact makes the index *absent* and triggers a full
//! rebuild — a stale-index error is never propagated to the caller.
//!
//! One entry per document, insertion order = document order. Vectors are
//! L2-normalized by the providers, so similarity is a plain dot product and
//! search ties break by insertion order (stable).

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

use crate::documents::Document;
use crate::embedding::{self, EmbeddingProvider};

pub const INDEX_FILE: &str = "index.bin";
pub const SIDECAR_FILE: &str = "documents.json";

const INDEX_MAGIC: &[u8; 8] = b"RRAGIDX1";
const INDEX_VERSION: u32 = 1;

/// A document paired with its embedding; owned by the index once created.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub document: Document,
    pub vector: Vec<f32>,
}

/// A search hit: a borrowed document and its similarity score.
#[derive(Debug, Clone)]
pub struct SearchHit<'a> {
    pub document: &'a Document,
    pub score: f32,
}

/// In-memory similarity index over document embeddings.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    model: String,
    dims: usize,
    entries: Vec<IndexEntry>,
}

/// Serialized form of the sidecar file.
#[derive(Serialize, Deserialize)]
struct Sidecar {
    model: String,
    dims: usize,
    documents: Vec<Document>,
}

impl VectorIndex {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Embedding model the index was built with.
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.entries.iter().map(|e| &e.document)
    }

    /// Embed all documents and construct a fresh in-memory index.
    pub async fn build(
        documents: Vec<Document>,
        embedder: &dyn EmbeddingProvider,
        batch_size: usize,
    ) -> Result<Self> {
        if documents.is_empty() {
            bail!("Cannot build an index from zero documents");
        }

        let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(documents.len());
        let texts: Vec<String> = documents.iter().map(|d| d.text.clone()).collect();
        for batch in texts.chunks(batch_size.max(1)) {
            let embedded = embedder.embed(batch).await?;
            vectors.extend(embedded);
        }

        if vectors.len() != documents.len() {
            bail!(
                "Embedder returned {} vectors for {} documents",
                vectors.len(),
                documents.len()
            );
        }

        let dims = vectors[0].len();
        if dims == 0 || vectors.iter().any(|v| v.len() != dims) {
            bail!("Embedder returned vectors of inconsistent dimensionality");
        }

        let entries = documents
            .into_iter()
            .zip(vectors)
            .map(|(document, vector)| IndexEntry { document, vector })
            .collect();

        Ok(Self {
            model: embedder.model_name().to_string(),
            dims,
            entries,
        })
    }

    /// Top-k entries by similarity, descending; ties keep insertion order.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<SearchHit<'_>> {
        let mut scored: Vec<(usize, f32)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (i, embedding::dot(query, &e.vector)))
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(k);

        scored
            .into_iter()
            .map(|(i, score)| SearchHit {
                document: &self.entries[i].document,
                score,
            })
            .collect()
    }

    /// Persist both artifacts under `dir`, creating it if needed.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create index directory {}", dir.display()))?;

        let mut blob = Vec::with_capacity(20 + self.entries.len() * self.dims * 4);
        blob.extend_from_slice(INDEX_MAGIC);
        blob.extend_from_slice(&INDEX_VERSION.to_le_bytes());
        blob.extend_from_slice(&(self.dims as u32).to_le_bytes());
        blob.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for entry in &self.entries {
            blob.extend_from_slice(&embedding::vec_to_blob(&entry.vector));
        }
        std::fs::write(dir.join(INDEX_FILE), blob)
            .with_context(|| "Failed to write index blob")?;

        let sidecar = Sidecar {
            model: self.model.clone(),
            dims: self.dims,
            documents: self.entries.iter().map(|e| e.document.clone()).collect(),
        };
        let json = serde_json::to_vec_pretty(&sidecar)?;
        std::fs::write(dir.join(SIDECAR_FILE), json)
            .with_context(|| "Failed to write index sidecar")?;

        info!(dir = %dir.display(), documents = self.entries.len(), "Vector index saved");
        Ok(())
    }

    /// Load the index from `dir`. `Ok(None)` means absent (either artifact
    /// missing); a present-but-unreadable artifact is an error the caller
    /// may treat as corruption.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let blob_path = dir.join(INDEX_FILE);
        let sidecar_path = dir.join(SIDECAR_FILE);
        if !blob_path.exists() || !sidecar_path.exists() {
            return Ok(None);
        }

        let blob = std::fs::read(&blob_path)?;
        if blob.len() < 20 || &blob[..8] != INDEX_MAGIC {
            bail!("Index blob has an invalid header");
        }
        let version = u32::from_le_bytes(blob[8..12].try_into().unwrap());
        if version != INDEX_VERSION {
            bail!("Unsupported index version: {}", version);
        }
        let dims = u32::from_le_bytes(blob[12..16].try_into().unwrap()) as usize;
        let count = u32::from_le_bytes(blob[16..20].try_into().unwrap()) as usize;
        let body = &blob[20..];
        if dims == 0 || body.len() != dims * count * 4 {
            bail!(
                "Index blob size mismatch: {} bytes for {} x {} dims",
                body.len(),
                count,
                dims
            );
        }

        let sidecar_bytes = std::fs::read(&sidecar_path)?;
        let sidecar: Sidecar =
            serde_json::from_slice(&sidecar_bytes).with_context(|| "Invalid index sidecar")?;
        if sidecar.documents.len() != count {
            bail!(
                "Sidecar lists {} documents but blob holds {}",
                sidecar.documents.len(),
                count
            );
        }
        if sidecar.dims != dims {
            bail!("Sidecar dims {} != blob dims {}", sidecar.dims, dims);
        }

        let entries = sidecar
            .documents
            .into_iter()
            .enumerate()
            .map(|(i, document)| IndexEntry {
                document,
                vector: embedding::blob_to_vec(&body[i * dims * 4..(i + 1) * dims * 4]),
            })
            .collect();

        Ok(Some(Self {
            model: sidecar.model,
            dims,
            entries,
        }))
    }
}

/// Load the persisted index, falling back to a full build on absence or any
/// deserialization failure. A valid artifact is never re-embedded.
pub async fn load_or_build(
    documents: Vec<Document>,
    embedder: &dyn EmbeddingProvider,
    dir: &Path,
    batch_size: usize,
) -> Result<VectorIndex> {
    match VectorIndex::load(dir) {
        Ok(Some(index)) => {
            info!(dir = %dir.display(), documents = index.len(), "Vector index loaded from disk");
            return Ok(index);
        }
        Ok(None) => {
            info!(dir = %dir.display(), "No index artifacts found; building");
        }
        Err(e) => {
            warn!(error = %e, "Failed to load vector index; rebuilding");
        }
    }

    rebuild(documents, embedder, dir, batch_size).await
}

/// Unconditionally re-embed, re-index, and persist.
pub async fn rebuild(
    documents: Vec<Document>,
    embedder: &dyn EmbeddingProvider,
    dir: &Path,
    batch_size: usize,
) -> Result<VectorIndex> {
    let index = VectorIndex::build(documents, embedder, batch_size).await?;
    index.save(dir)?;
    Ok(index)
}
