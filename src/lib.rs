//! # Retail RAG
//!
//! A retrieval-augmented question-answering backend over a multi-sheet
//! retail sales spreadsheet.
//!
//! The pipeline loads an `.xlsx` workbook (products, customers, sales),
//! normalizes and joins the tables, renders one labeled text document per
//! row, embeds the documents into a persistent vector index, and answers
//! natural-language questions by retrieving the closest documents and
//! prompting a local LLM with a strict grounding contract.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌────────────┐   ┌───────────┐   ┌───────────┐
//! │  Workbook  │──▶│  Dataset   │──▶│ Documents │──▶│  Vector    │
//! │  (.xlsx)   │   │ joins+Total│   │ [VENTA]…  │   │  Index     │
//! └───────────┘   └────────────┘   └───────────┘   └────┬──────┘
//!                                                       │
//!                                   ┌───────────────────┤
//!                                   ▼                   ▼
//!                              ┌──────────┐       ┌──────────┐
//!                              │   CLI    │       │   HTTP   │
//!                              │  (rrag)  │       │  (axum)  │
//!                              └──────────┘       └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! rrag init                          # create chat database
//! rrag ingest                       # load spreadsheet, build the index
//! rrag ask "¿Cuál fue la venta más grande?"
//! rrag serve                        # start the HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`workbook`] | Raw `.xlsx` reading (ZIP + OOXML) |
//! | [`dataset`] | Typed tables, normalization, left joins, `Total` |
//! | [`documents`] | One labeled text document per row |
//! | [`embedding`] | Embedding provider abstraction (Ollama, fastembed) |
//! | [`index`] | Vector index build/save/load/search |
//! | [`generate`] | LLM generation client |
//! | [`pipeline`] | Retrieval + grounded generation |
//! | [`chats`] | Chat-session persistence |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chats;
pub mod config;
pub mod dataset;
pub mod db;
pub mod documents;
pub mod embedding;
pub mod generate;
pub mod index;
pub mod migrate;
pub mod pipeline;
pub mod server;
pub mod workbook;
