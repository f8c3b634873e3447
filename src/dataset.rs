//! Tabular loader: typed tables, column normalization, and the sales join.
//!
//! Reads the three logical sheets (products, customers, sales) from a
//! workbook, tolerating missing sheets and name variants, normalizes date and
//! quantity columns, and produces the denormalized joined sales view used by
//! the document builder.
//!
//! Column resolution prefers the explicit `[columns.*]` config mapping and
//! falls back to case-insensitive substring matching (`fecha`/`date`,
//! `cantidad`/`quantity`, `precio`/`price`, `idcliente`, `idproducto`).

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use std::fmt;
use std::path::Path;
use tracing::{info, warn};

use crate::config::ColumnsConfig;
use crate::workbook::{self, Cell, Sheet, Workbook};

/// Name variants tried per logical sheet, in order.
const PRODUCT_SHEETS: [&str; 3] = ["Productos", "productos", "Products"];
const CUSTOMER_SHEETS: [&str; 3] = ["Clientes", "clientes", "Customers"];
const SALES_SHEETS: [&str; 3] = ["Ventas", "ventas", "Sales"];

/// Excel serial date epoch (1900 date system, with the Lotus leap-year bug
/// folded in by using December 30th).
const EXCEL_EPOCH: (i32, u32, u32) = (1899, 12, 30);

/// A normalized scalar value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Number(f64),
    DateTime(NaiveDateTime),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    /// Textual rendering used in document templates. Missing values render
    /// as the literal `None` marker rather than failing.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "None"),
            Value::Text(s) => write!(f, "{}", s),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{}", n)
                }
            }
            Value::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}

/// A named-column table. Rows are dense: one `Value` per column.
#[derive(Debug, Clone, Default)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Exact column name lookup.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// First column whose name contains `needle`, case-insensitively.
    pub fn find_column(&self, needle: &str) -> Option<usize> {
        let needle = needle.to_lowercase();
        self.columns
            .iter()
            .position(|c| c.to_lowercase().contains(&needle))
    }

    /// All columns whose names contain any of the needles, case-insensitively.
    pub fn find_columns(&self, needles: &[&str]) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| {
                let lower = c.to_lowercase();
                needles.iter().any(|n| lower.contains(n))
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Value of `name` in `row`, `Null` when the column does not exist.
    pub fn get<'a>(&self, row: &'a [Value], name: &str) -> &'a Value {
        self.column_index(name)
            .and_then(|i| row.get(i))
            .unwrap_or(&Value::Null)
    }

    fn push_column(&mut self, name: &str, values: Vec<Value>) {
        debug_assert_eq!(values.len(), self.rows.len());
        self.columns.push(name.to_string());
        for (row, v) in self.rows.iter_mut().zip(values) {
            row.push(v);
        }
    }
}

/// The four tables passed downstream: raw sheets plus the joined sales view.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub products: Table,
    pub customers: Table,
    pub sales: Table,
    pub joined: Table,
}

/// Load and normalize the dataset from a spreadsheet on disk.
///
/// A totally unreadable file is a fatal error; individual missing sheets are
/// substituted with empty tables and logged.
pub fn load_dataset(path: &Path, columns: &ColumnsConfig) -> Result<Dataset> {
    let wb = workbook::read_workbook(path)
        .with_context(|| format!("Failed to load spreadsheet {}", path.display()))?;
    dataset_from_workbook(&wb, columns)
}

/// Build the dataset from an already-parsed workbook.
pub fn dataset_from_workbook(wb: &Workbook, columns: &ColumnsConfig) -> Result<Dataset> {
    let mut products = sheet_to_table(resolve_sheet(wb, &PRODUCT_SHEETS), "Productos");
    let customers = sheet_to_table(resolve_sheet(wb, &CUSTOMER_SHEETS), "Clientes");

    let sales_sheet = resolve_sheet(wb, &SALES_SHEETS).or_else(|| {
        // No sales-like sheet at all: fall back to the first sheet in the file.
        let first = wb.sheets.first();
        if let Some(s) = first {
            warn!(sheet = %s.name, "No Ventas sheet found; using first sheet");
        }
        first
    });
    let mut sales = sheet_to_table(sales_sheet, "Ventas");

    validate_mappings(columns, &products, &customers, &sales)?;

    normalize_products(&mut products, columns);
    normalize_sales(&mut sales, columns);

    let joined = join_tables(&sales, &customers, &products, columns);

    info!(
        products = products.rows.len(),
        customers = customers.rows.len(),
        sales = sales.rows.len(),
        joined = joined.rows.len(),
        "Dataset loaded"
    );

    Ok(Dataset {
        products,
        customers,
        sales,
        joined,
    })
}

fn resolve_sheet<'a>(wb: &'a Workbook, variants: &[&str]) -> Option<&'a Sheet> {
    for name in variants {
        if let Some(s) = wb.sheet(name) {
            return Some(s);
        }
    }
    // Any-case match as a last resort (e.g. "VENTAS")
    variants.iter().find_map(|name| wb.sheet_ignore_case(name))
}

/// First sheet row becomes the header; remaining rows become values.
fn sheet_to_table(sheet: Option<&Sheet>, logical: &str) -> Table {
    let sheet = match sheet {
        Some(s) => s,
        None => {
            warn!(sheet = logical, "Sheet missing; substituting empty table");
            return Table::empty();
        }
    };

    let mut rows_iter = sheet.rows.iter();
    let header = match rows_iter.next() {
        Some(h) => h,
        None => {
            warn!(sheet = %sheet.name, "Sheet has no rows");
            return Table::empty();
        }
    };

    let columns: Vec<String> = header
        .iter()
        .enumerate()
        .map(|(i, c)| match c {
            Cell::Text(s) if !s.trim().is_empty() => s.trim().to_string(),
            Cell::Number(n) => Value::Number(*n).to_string(),
            _ => format!("Columna{}", i + 1),
        })
        .collect();

    let rows: Vec<Vec<Value>> = rows_iter
        .filter(|r| !r.iter().all(Cell::is_empty))
        .map(|r| {
            (0..columns.len())
                .map(|i| match r.get(i) {
                    Some(Cell::Text(s)) => Value::Text(s.clone()),
                    Some(Cell::Number(n)) => Value::Number(*n),
                    Some(Cell::Bool(b)) => Value::Text(b.to_string()),
                    Some(Cell::Empty) | None => Value::Null,
                })
                .collect()
        })
        .collect();

    Table { columns, rows }
}

/// Explicit column mappings must match the sheet headers they describe.
fn validate_mappings(
    columns: &ColumnsConfig,
    products: &Table,
    customers: &Table,
    sales: &Table,
) -> Result<()> {
    let check = |table: &Table, sheet: &str, names: &[&String]| -> Result<()> {
        if table.is_empty() {
            return Ok(());
        }
        for name in names {
            if table.column_index(name).is_none() {
                anyhow::bail!(
                    "Configured column '{}' not present in sheet {} (columns: {})",
                    name,
                    sheet,
                    table.columns.join(", ")
                );
            }
        }
        Ok(())
    };

    if let Some(m) = &columns.sales {
        check(
            sales,
            "Ventas",
            &[&m.id, &m.date, &m.quantity, &m.customer_id, &m.product_id],
        )?;
    }
    if let Some(m) = &columns.products {
        check(products, "Productos", &[&m.id, &m.name, &m.category, &m.price])?;
    }
    if let Some(m) = &columns.customers {
        check(customers, "Clientes", &[&m.id, &m.name, &m.city])?;
    }
    Ok(())
}

fn normalize_products(products: &mut Table, columns: &ColumnsConfig) {
    if products.is_empty() {
        return;
    }
    let price_cols: Vec<usize> = match &columns.products {
        Some(m) => products.column_index(&m.price).into_iter().collect(),
        None => products.find_columns(&["precio", "price"]),
    };
    for col in price_cols {
        coerce_numeric(products, col);
    }
}

fn normalize_sales(sales: &mut Table, columns: &ColumnsConfig) {
    if sales.is_empty() {
        return;
    }

    let date_cols: Vec<usize> = match &columns.sales {
        Some(m) => sales.column_index(&m.date).into_iter().collect(),
        None => sales.find_columns(&["fecha", "date"]),
    };

    for col in date_cols {
        let mut parse_failures = 0usize;
        for row in &mut sales.rows {
            let parsed = parse_date(&row[col]);
            if parsed.is_null() && !row[col].is_null() {
                parse_failures += 1;
            }
            row[col] = parsed;
        }
        if parse_failures > 0 {
            warn!(
                column = %sales.columns[col],
                failures = parse_failures,
                "Unparsable date cells set to null"
            );
        }

        // Derived calendar fields from the parsed date column.
        let mut years = Vec::with_capacity(sales.rows.len());
        let mut months = Vec::with_capacity(sales.rows.len());
        let mut days = Vec::with_capacity(sales.rows.len());
        let mut month_names = Vec::with_capacity(sales.rows.len());
        for row in &sales.rows {
            match &row[col] {
                Value::DateTime(dt) => {
                    use chrono::Datelike;
                    years.push(Value::Number(f64::from(dt.year())));
                    months.push(Value::Number(f64::from(dt.month())));
                    days.push(Value::Number(f64::from(dt.day())));
                    month_names.push(Value::Text(dt.format("%B").to_string()));
                }
                _ => {
                    years.push(Value::Null);
                    months.push(Value::Null);
                    days.push(Value::Null);
                    month_names.push(Value::Null);
                }
            }
        }
        set_or_push_column(sales, "año", years);
        set_or_push_column(sales, "mes", months);
        set_or_push_column(sales, "dia", days);
        set_or_push_column(sales, "mes_nombre", month_names);
    }

    let qty_cols: Vec<usize> = match &columns.sales {
        Some(m) => sales.column_index(&m.quantity).into_iter().collect(),
        None => sales.find_columns(&["cantidad", "quantity"]),
    };
    for col in qty_cols {
        coerce_numeric(sales, col);
    }
}

fn set_or_push_column(table: &mut Table, name: &str, values: Vec<Value>) {
    match table.column_index(name) {
        Some(i) => {
            for (row, v) in table.rows.iter_mut().zip(values) {
                row[i] = v;
            }
        }
        None => table.push_column(name, values),
    }
}

/// Coerce a column to numbers; unparsable cells become null (non-fatal).
fn coerce_numeric(table: &mut Table, col: usize) {
    for row in &mut table.rows {
        row[col] = match &row[col] {
            Value::Number(n) => Value::Number(*n),
            Value::Text(s) => s
                .trim()
                .replace(',', ".")
                .parse::<f64>()
                .map(Value::Number)
                .unwrap_or(Value::Null),
            _ => Value::Null,
        };
    }
}

/// Parse a cell into a datetime. Numbers are Excel serials; strings are tried
/// against the common date formats. Anything else becomes null.
fn parse_date(value: &Value) -> Value {
    match value {
        Value::DateTime(dt) => Value::DateTime(*dt),
        Value::Number(serial) => excel_serial_to_datetime(*serial)
            .map(Value::DateTime)
            .unwrap_or(Value::Null),
        Value::Text(s) => parse_date_str(s.trim()).map(Value::DateTime).unwrap_or(Value::Null),
        Value::Null => Value::Null,
    }
}

fn parse_date_str(s: &str) -> Option<NaiveDateTime> {
    const DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%d/%m/%Y %H:%M:%S"];
    const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y"];

    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return d.and_hms_opt(0, 0, 0);
        }
    }
    None
}

fn excel_serial_to_datetime(serial: f64) -> Option<NaiveDateTime> {
    // Serial 1 = 1900-01-01; values outside Excel's representable range are
    // ordinary numbers, not dates.
    if !(1.0..=2_958_465.0).contains(&serial) {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(EXCEL_EPOCH.0, EXCEL_EPOCH.1, EXCEL_EPOCH.2)?
        .and_hms_opt(0, 0, 0)?;
    let days = serial.trunc() as i64;
    let secs = (serial.fract() * 86_400.0).round() as i64;
    epoch
        .checked_add_signed(Duration::days(days))?
        .checked_add_signed(Duration::seconds(secs))
}

/// Key used to match join columns: numbers and their textual forms compare equal.
fn join_key(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        other => Some(other.to_string().trim().to_string()),
    }
}

/// Sales LEFT JOIN customers LEFT JOIN products, plus the derived `Total`.
///
/// A missing id column on either side skips that join silently. Right-hand
/// columns whose names collide get a `_cliente` / `_producto` suffix.
fn join_tables(
    sales: &Table,
    customers: &Table,
    products: &Table,
    columns: &ColumnsConfig,
) -> Table {
    if sales.is_empty() {
        warn!("No sales rows to join");
        return Table::empty();
    }

    let mut result = sales.clone();

    // JOIN with customers
    if !customers.is_empty() {
        let left_key = match &columns.sales {
            Some(m) => result.column_index(&m.customer_id),
            None => result.find_column("idcliente"),
        };
        let right_key = match &columns.customers {
            Some(m) => customers.column_index(&m.id),
            None => customers.find_column("idcliente"),
        };
        if let (Some(lk), Some(rk)) = (left_key, right_key) {
            result = left_join(&result, customers, lk, rk, "_cliente");
            info!(rows = result.rows.len(), "Joined sales with customers");
        }
    }

    // JOIN with products
    if !products.is_empty() {
        let left_key = match &columns.sales {
            Some(m) => result.column_index(&m.product_id),
            None => result.find_column("idproducto"),
        };
        let right_key = match &columns.products {
            Some(m) => products.column_index(&m.id),
            None => products.find_column("idproducto"),
        };
        if let (Some(lk), Some(rk)) = (left_key, right_key) {
            result = left_join(&result, products, lk, rk, "_producto");
            info!(rows = result.rows.len(), "Joined sales with products");
        }
    }

    // Total = Cantidad × Precio. The price column must not be a
    // product-internal price-like field (name containing "producto").
    let qty_col = result.find_column("cantidad").or_else(|| result.find_column("quantity"));
    let price_col = result.columns.iter().position(|c| {
        let lower = c.to_lowercase();
        (lower.contains("precio") || lower.contains("price")) && !lower.contains("producto")
    });

    if let (Some(qc), Some(pc)) = (qty_col, price_col) {
        let totals: Vec<Value> = result
            .rows
            .iter()
            .map(|row| match (row[qc].as_number(), row[pc].as_number()) {
                (Some(q), Some(p)) => Value::Number(q * p),
                _ => Value::Null,
            })
            .collect();
        result.push_column("Total", totals);
    }

    result
}

fn left_join(left: &Table, right: &Table, left_key: usize, right_key: usize, suffix: &str) -> Table {
    // Right-hand column names, suffixed on collision (join key included,
    // mirroring a dataframe merge with suffixes).
    let right_names: Vec<String> = right
        .columns
        .iter()
        .map(|c| {
            if left.columns.contains(c) {
                format!("{}{}", c, suffix)
            } else {
                c.clone()
            }
        })
        .collect();

    let mut columns = left.columns.clone();
    columns.extend(right_names);

    let rows = left
        .rows
        .iter()
        .map(|lrow| {
            let mut out = lrow.clone();
            let matched = join_key(&lrow[left_key]).and_then(|key| {
                right
                    .rows
                    .iter()
                    .find(|rrow| join_key(&rrow[right_key]).as_deref() == Some(key.as_str()))
            });
            match matched {
                Some(rrow) => out.extend(rrow.iter().cloned()),
                None => out.extend(std::iter::repeat(Value::Null).take(right.columns.len())),
            }
            out
        })
        .collect();

    Table { columns, rows }
}
