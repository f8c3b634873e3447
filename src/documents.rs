//! Document builder: one self-describing text fragment per table row.
//!
//! Each row of the four tables becomes an immutable [`Document`] whose text
//! is a fixed-template labeled block (`[PRODUCTO]`, `[CLIENTE]`, `[VENTA]`)
//! and whose metadata carries the entity type and natural keys for
//! provenance. Building is pure and deterministic: no chunking, no I/O.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dataset::{Dataset, Table, Value};

/// Entity type of a document, used for provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Producto,
    Cliente,
    Venta,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Producto => "producto",
            EntityKind::Cliente => "cliente",
            EntityKind::Venta => "venta",
        }
    }
}

/// Provenance metadata attached to every document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocMetadata {
    #[serde(rename = "tipo")]
    pub kind: EntityKind,
    pub id: String,
    /// Resolved foreign keys, present on sale documents only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_producto: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_cliente: Option<String>,
}

/// An immutable (text, metadata) pair ready for embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub text: String,
    pub metadata: DocMetadata,
}

/// Build one document per row, independently per table.
///
/// The joined sales view is preferred; when the join produced nothing the raw
/// sales table is rendered with the short template instead. Missing fields
/// render as the `None` marker, never an error.
pub fn build_documents(dataset: &Dataset) -> Vec<Document> {
    let mut documents = Vec::new();

    for row in &dataset.products.rows {
        documents.push(product_document(&dataset.products, row));
    }
    for row in &dataset.customers.rows {
        documents.push(customer_document(&dataset.customers, row));
    }

    if !dataset.joined.is_empty() {
        for row in &dataset.joined.rows {
            documents.push(sale_document(&dataset.joined, row));
        }
    } else {
        for row in &dataset.sales.rows {
            documents.push(raw_sale_document(&dataset.sales, row));
        }
    }

    info!(count = documents.len(), "Documents built from dataset");
    documents
}

/// First non-null value among the named columns; `Null` when none resolves.
fn field<'a>(table: &Table, row: &'a [Value], names: &[&str]) -> &'a Value {
    for name in names {
        let v = table.get(row, name);
        if !v.is_null() {
            return v;
        }
    }
    &Value::Null
}

fn product_document(table: &Table, row: &[Value]) -> Document {
    let id = table.get(row, "IdProducto");
    let text = format!(
        "[PRODUCTO]\nIdProducto: {}\nNombreProducto: {}\nCategoria: {}\nPrecio: {}\n",
        id,
        table.get(row, "NombreProducto"),
        table.get(row, "Categoria"),
        table.get(row, "Precio"),
    );
    Document {
        text,
        metadata: DocMetadata {
            kind: EntityKind::Producto,
            id: id.to_string(),
            id_producto: None,
            id_cliente: None,
        },
    }
}

fn customer_document(table: &Table, row: &[Value]) -> Document {
    let id = table.get(row, "IdCliente");
    let text = format!(
        "[CLIENTE]\nIdCliente: {}\nNombreCliente: {}\nCiudad: {}\n",
        id,
        table.get(row, "NombreCliente"),
        table.get(row, "Ciudad"),
    );
    Document {
        text,
        metadata: DocMetadata {
            kind: EntityKind::Cliente,
            id: id.to_string(),
            id_producto: None,
            id_cliente: None,
        },
    }
}

/// Enriched sale document from the joined view. Foreign keys may live under
/// suffixed names after the join, so both spellings are consulted.
fn sale_document(table: &Table, row: &[Value]) -> Document {
    let id = table.get(row, "IdVenta");
    let product_id = field(table, row, &["IdProducto", "IdProducto_producto"]);
    let customer_id = field(table, row, &["IdCliente", "IdClient", "IdCliente_cliente"]);
    let fecha = field(table, row, &["FechaVenta", "fecha"]);

    let text = format!(
        "[VENTA]\nIdVenta: {}\nIdProducto: {}\nIdCliente: {}\nProducto: {}\nCategoriaProducto: {}\nCliente: {}\nCiudadCliente: {}\nCantidad: {}\nFechaVenta: {}\nAño: {}\nMes: {}\nDia: {}\nTotal: {}\n",
        id,
        product_id,
        customer_id,
        table.get(row, "NombreProducto"),
        table.get(row, "Categoria"),
        table.get(row, "NombreCliente"),
        table.get(row, "Ciudad"),
        table.get(row, "Cantidad"),
        fecha,
        table.get(row, "año"),
        table.get(row, "mes"),
        table.get(row, "dia"),
        table.get(row, "Total"),
    );
    Document {
        text,
        metadata: DocMetadata {
            kind: EntityKind::Venta,
            id: id.to_string(),
            id_producto: Some(product_id.to_string()),
            id_cliente: Some(customer_id.to_string()),
        },
    }
}

/// Fallback template when the join produced no rows.
fn raw_sale_document(table: &Table, row: &[Value]) -> Document {
    let id = table.get(row, "IdVenta");
    let text = format!(
        "[VENTA]\nIdVenta: {}\nIdProducto: {}\nIdCliente: {}\nCantidad: {}\nFechaVenta: {}\n",
        id,
        table.get(row, "IdProducto"),
        field(table, row, &["IdCliente", "IdClient"]),
        table.get(row, "Cantidad"),
        table.get(row, "FechaVenta"),
    );
    Document {
        text,
        metadata: DocMetadata {
            kind: EntityKind::Venta,
            id: id.to_string(),
            id_producto: None,
            id_cliente: None,
        },
    }
}
