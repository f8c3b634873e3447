//! Raw `.xlsx` workbook reading.
//!
//! Parses the OOXML spreadsheet package (a ZIP of XML parts) into named
//! sheets of typed cells. Only the parts the loader needs are touched:
//! `xl/workbook.xml` for sheet names, `xl/_rels/workbook.xml.rels` for the
//! name → worksheet-part mapping, `xl/sharedStrings.xml` for the shared
//! string pool, and each worksheet's cell grid.
//!
//! Dates are not resolved here: Excel stores them as serial numbers, and
//! which columns are dates is a schema concern handled by [`crate::dataset`].

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// A single spreadsheet cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
}

impl Cell {
    pub fn is_empty(&self) -> bool {
        matches!(self, Cell::Empty)
    }
}

/// One worksheet: its tab name and a dense row grid.
#[derive(Debug, Clone)]
pub struct Sheet {
    pub name: String,
    pub rows: Vec<Vec<Cell>>,
}

/// All worksheets of a workbook, in file order.
#[derive(Debug, Clone)]
pub struct Workbook {
    pub sheets: Vec<Sheet>,
}

impl Workbook {
    /// Look up a sheet by exact tab name.
    pub fn sheet(&self, name: &str) -> Option<&Sheet> {
        self.sheets.iter().find(|s| s.name == name)
    }

    /// Look up a sheet by case-insensitive tab name.
    pub fn sheet_ignore_case(&self, name: &str) -> Option<&Sheet> {
        self.sheets
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
    }
}

/// Read a workbook from disk. An unreadable or non-xlsx file is a hard error.
pub fn read_workbook(path: &Path) -> Result<Workbook> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read spreadsheet: {}", path.display()))?;
    read_workbook_bytes(&bytes)
}

/// Read a workbook from in-memory bytes.
pub fn read_workbook_bytes(bytes: &[u8]) -> Result<Workbook> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| anyhow!("Not a valid xlsx package: {}", e))?;

    let shared_strings = read_shared_strings(&mut archive)?;
    let sheet_refs = read_sheet_refs(&mut archive)?;
    let rels = read_workbook_rels(&mut archive)?;

    let mut sheets = Vec::with_capacity(sheet_refs.len());
    for (name, rid) in sheet_refs {
        let part = rels
            .get(&rid)
            .ok_or_else(|| anyhow!("Worksheet relationship {} not found for sheet '{}'", rid, name))?
            .clone();
        let xml = read_zip_entry_bounded(&mut archive, &part, MAX_XML_ENTRY_BYTES)?;
        let rows = read_sheet_rows(&xml, &shared_strings)?;
        sheets.push(Sheet { name, rows });
    }

    Ok(Workbook { sheets })
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>> {
    let entry = archive
        .by_name(name)
        .map_err(|e| anyhow!("Missing xlsx part {}: {}", name, e))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .with_context(|| format!("Failed to decompress xlsx part {}", name))?;
    if out.len() as u64 >= max_bytes {
        anyhow::bail!("xlsx part {} exceeds size limit ({} bytes)", name, max_bytes);
    }
    Ok(out)
}

/// Shared string pool. Rich-text runs within one `<si>` are concatenated.
fn read_shared_strings(archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>) -> Result<Vec<String>> {
    if archive.by_name("xl/sharedStrings.xml").is_err() {
        return Ok(Vec::new());
    }
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES)?;

    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut in_si = false;
    let mut in_t = false;
    let mut current = String::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => {
                    in_si = true;
                    current.clear();
                }
                b"t" if in_si => in_t = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(te)) if in_t => {
                current.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" => {
                    in_si = false;
                    strings.push(std::mem::take(&mut current));
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => anyhow::bail!("sharedStrings.xml parse error: {}", e),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Sheet tab names with their relationship ids, in workbook order.
fn read_sheet_refs(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
) -> Result<Vec<(String, String)>> {
    let xml = read_zip_entry_bounded(archive, "xl/workbook.xml", MAX_XML_ENTRY_BYTES)?;

    let mut refs = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) | Ok(quick_xml::events::Event::Empty(e)) => {
                if e.local_name().as_ref() == b"sheet" {
                    let mut name = None;
                    let mut rid = None;
                    for attr in e.attributes().flatten() {
                        let key = attr.key.as_ref();
                        // The r:id attribute may or may not carry its namespace prefix.
                        if key == b"name" {
                            name = Some(attr_value(&attr)?);
                        } else if key == b"r:id" || key == b"id" {
                            rid = Some(attr_value(&attr)?);
                        }
                    }
                    if let (Some(name), Some(rid)) = (name, rid) {
                        refs.push((name, rid));
                    }
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => anyhow::bail!("workbook.xml parse error: {}", e),
            _ => {}
        }
        buf.clear();
    }

    if refs.is_empty() {
        anyhow::bail!("Workbook declares no sheets");
    }
    Ok(refs)
}

/// Relationship id → worksheet part path (normalized under `xl/`).
fn read_workbook_rels(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
) -> Result<HashMap<String, String>> {
    let xml = read_zip_entry_bounded(archive, "xl/_rels/workbook.xml.rels", MAX_XML_ENTRY_BYTES)?;

    let mut rels = HashMap::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) | Ok(quick_xml::events::Event::Empty(e)) => {
                if e.local_name().as_ref() == b"Relationship" {
                    let mut id = None;
                    let mut target = None;
                    for attr in e.attributes().flatten() {
                        match attr.key.as_ref() {
                            b"Id" => id = Some(attr_value(&attr)?),
                            b"Target" => target = Some(attr_value(&attr)?),
                            _ => {}
                        }
                    }
                    if let (Some(id), Some(target)) = (id, target) {
                        rels.insert(id, normalize_target(&target));
                    }
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => anyhow::bail!("workbook.xml.rels parse error: {}", e),
            _ => {}
        }
        buf.clear();
    }
    Ok(rels)
}

fn attr_value(attr: &quick_xml::events::attributes::Attribute<'_>) -> Result<String> {
    Ok(attr
        .unescape_value()
        .map_err(|e| anyhow!("Bad XML attribute: {}", e))?
        .into_owned())
}

/// Relationship targets are relative to `xl/` unless rooted.
fn normalize_target(target: &str) -> String {
    let t = target.trim_start_matches('/');
    if t.starts_with("xl/") {
        t.to_string()
    } else {
        format!("xl/{}", t)
    }
}

/// Parse one worksheet's `<row>`/`<c>` grid into dense rows.
fn read_sheet_rows(xml: &[u8], shared_strings: &[String]) -> Result<Vec<Vec<Cell>>> {
    let mut rows: Vec<Vec<Cell>> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();

    let mut current_row: Vec<Cell> = Vec::new();
    let mut in_row = false;
    // Per-cell state
    let mut cell_type: Vec<u8> = b"n".to_vec();
    let mut cell_col: usize = 0;
    let mut in_v = false;
    let mut in_is_t = false;
    let mut pending: Option<Cell> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => {
                    in_row = true;
                    current_row.clear();
                }
                b"c" if in_row => {
                    cell_type = b"n".to_vec();
                    cell_col = current_row.len();
                    pending = None;
                    for attr in e.attributes().flatten() {
                        match attr.key.as_ref() {
                            b"t" => cell_type = attr.value.to_vec(),
                            b"r" => {
                                if let Some(col) = column_of_ref(&attr.value) {
                                    cell_col = col;
                                }
                            }
                            _ => {}
                        }
                    }
                }
                b"v" => in_v = true,
                b"t" if cell_type == b"inlineStr" => in_is_t = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Empty(e)) => {
                // An empty <c/> leaves a gap; nothing to record.
                if e.local_name().as_ref() == b"row" {
                    rows.push(Vec::new());
                }
            }
            Ok(quick_xml::events::Event::Text(te)) => {
                let raw = te.unescape().unwrap_or_default();
                if in_v {
                    pending = Some(parse_cell_value(raw.trim(), &cell_type, shared_strings));
                } else if in_is_t {
                    pending = Some(Cell::Text(raw.into_owned()));
                }
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"v" => in_v = false,
                b"t" => in_is_t = false,
                b"c" if in_row => {
                    if let Some(cell) = pending.take() {
                        while current_row.len() < cell_col {
                            current_row.push(Cell::Empty);
                        }
                        current_row.push(cell);
                    }
                }
                b"row" => {
                    in_row = false;
                    rows.push(std::mem::take(&mut current_row));
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => anyhow::bail!("Worksheet parse error: {}", e),
            _ => {}
        }
        buf.clear();
    }

    // Drop trailing fully-empty rows
    while rows
        .last()
        .map(|r| r.iter().all(Cell::is_empty))
        .unwrap_or(false)
    {
        rows.pop();
    }

    Ok(rows)
}

fn parse_cell_value(raw: &str, cell_type: &[u8], shared_strings: &[String]) -> Cell {
    if cell_type == b"s" {
        raw.parse::<usize>()
            .ok()
            .and_then(|i| shared_strings.get(i))
            .map(|s| Cell::Text(s.clone()))
            .unwrap_or(Cell::Empty)
    } else if cell_type == b"str" {
        Cell::Text(raw.to_string())
    } else if cell_type == b"b" {
        Cell::Bool(raw == "1")
    } else {
        // "n", "d" and untyped cells hold numbers (dates are serials)
        raw.parse::<f64>().map(Cell::Number).unwrap_or_else(|_| {
            if raw.is_empty() {
                Cell::Empty
            } else {
                Cell::Text(raw.to_string())
            }
        })
    }
}

/// Column index from a cell reference like `B2` (A → 0).
fn column_of_ref(cell_ref: &[u8]) -> Option<usize> {
    let mut col: usize = 0;
    let mut seen = false;
    for &b in cell_ref {
        if b.is_ascii_uppercase() {
            col = col * 26 + (b - b'A' + 1) as usize;
            seen = true;
        } else {
            break;
        }
    }
    if seen {
        Some(col - 1)
    } else {
        None
    }
}
