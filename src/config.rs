use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub data: DataConfig,
    pub index: IndexConfig,
    pub db: DbConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    pub generation: GenerationConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub columns: ColumnsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DataConfig {
    /// Path to the multi-sheet sales spreadsheet (.xlsx).
    pub spreadsheet: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Directory holding the two index artifacts (`index.bin` + `documents.json`).
    pub dir: PathBuf,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_top_k() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    /// SQLite database for chat sessions.
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the `ollama` provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_embedding_provider() -> String {
    "local".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_url")]
    pub url: String,
    pub model: String,
    /// Low by default: answers should favor precision over creativity.
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_generation_retries")]
    pub max_retries: u32,
}

fn default_generation_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_temperature() -> f64 {
    0.1
}
fn default_generation_timeout() -> u64 {
    120
}
fn default_generation_retries() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

/// Declarative column mappings per sheet kind.
///
/// When a mapping is present it is validated against the sheet header at load
/// time; when absent the loader falls back to case-insensitive substring
/// matching (compatibility mode for ad-hoc spreadsheets).
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ColumnsConfig {
    pub sales: Option<SalesColumns>,
    pub products: Option<ProductColumns>,
    pub customers: Option<CustomerColumns>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SalesColumns {
    pub id: String,
    pub date: String,
    pub quantity: String,
    pub customer_id: String,
    pub product_id: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProductColumns {
    pub id: String,
    pub name: String,
    pub category: String,
    pub price: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CustomerColumns {
    pub id: String,
    pub name: String,
    pub city: String,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate retrieval
    if config.index.top_k == 0 {
        anyhow::bail!("index.top_k must be >= 1");
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "local" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be local or ollama.",
            other
        ),
    }
    if config.embedding.provider == "ollama" {
        if config.embedding.model.is_none() {
            anyhow::bail!("embedding.model must be specified when provider is 'ollama'");
        }
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!("embedding.dims must be > 0 when provider is 'ollama'");
        }
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be >= 1");
    }

    // Validate generation
    if config.generation.model.trim().is_empty() {
        anyhow::bail!("generation.model must not be empty");
    }
    if !(0.0..=2.0).contains(&config.generation.temperature) {
        anyhow::bail!("generation.temperature must be in [0.0, 2.0]");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    const BASE: &str = r#"
[data]
spreadsheet = "/data/dataset.xlsx"

[index]
dir = "/data/index"

[db]
path = "/data/chats.sqlite"

[generation]
model = "llama3"

[server]
bind = "127.0.0.1:8000"
"#;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let f = write_config(BASE);
        let cfg = load_config(f.path()).unwrap();
        assert_eq!(cfg.index.top_k, 5);
        assert_eq!(cfg.embedding.provider, "local");
        assert_eq!(cfg.generation.url, "http://localhost:11434");
        assert!((cfg.generation.temperature - 0.1).abs() < 1e-9);
        assert!(cfg.columns.sales.is_none());
    }

    #[test]
    fn unknown_embedding_provider_rejected() {
        let body = format!("{}\n[embedding]\nprovider = \"faiss\"\n", BASE);
        let f = write_config(&body);
        let err = load_config(f.path()).unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn ollama_provider_requires_model_and_dims() {
        let body = format!("{}\n[embedding]\nprovider = \"ollama\"\n", BASE);
        let f = write_config(&body);
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn zero_top_k_rejected() {
        let body = BASE.replace("dir = \"/data/index\"", "dir = \"/data/index\"\ntop_k = 0");
        let f = write_config(&body);
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn column_mapping_parses() {
        let body = format!(
            "{}\n[columns.sales]\nid = \"IdVenta\"\ndate = \"FechaVenta\"\nquantity = \"Cantidad\"\ncustomer_id = \"IdCliente\"\nproduct_id = \"IdProducto\"\n",
            BASE
        );
        let f = write_config(&body);
        let cfg = load_config(f.path()).unwrap();
        assert_eq!(cfg.columns.sales.unwrap().date, "FechaVenta");
    }
}
