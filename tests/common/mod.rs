//! Shared fixtures for integration tests: a minimal in-memory xlsx builder.

use std::io::Write;

/// Build a minimal xlsx package with the given sheets. Numeric-looking
/// values become number cells, everything else inline strings, empty
/// strings leave a gap.
pub fn build_xlsx(sheets: &[(&str, Vec<Vec<&str>>)]) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut zw = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        let opts = zip::write::SimpleFileOptions::default();

        let mut workbook_xml = String::from(
            "<?xml version=\"1.0\"?><workbook xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\" xmlns:r=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships\"><sheets>",
        );
        let mut rels_xml = String::from(
            "<?xml version=\"1.0\"?><Relationships xmlns=\"http://schemas.openxmlformats.org/package/2006/relationships\">",
        );
        for (i, (name, _)) in sheets.iter().enumerate() {
            workbook_xml.push_str(&format!(
                "<sheet name=\"{}\" sheetId=\"{}\" r:id=\"rId{}\"/>",
                name,
                i + 1,
                i + 1
            ));
            rels_xml.push_str(&format!(
                "<Relationship Id=\"rId{}\" Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet\" Target=\"worksheets/sheet{}.xml\"/>",
                i + 1,
                i + 1
            ));
        }
        workbook_xml.push_str("</sheets></workbook>");
        rels_xml.push_str("</Relationships>");

        zw.start_file("xl/workbook.xml", opts).unwrap();
        zw.write_all(workbook_xml.as_bytes()).unwrap();
        zw.start_file("xl/_rels/workbook.xml.rels", opts).unwrap();
        zw.write_all(rels_xml.as_bytes()).unwrap();

        for (i, (_, rows)) in sheets.iter().enumerate() {
            let mut sheet_xml = String::from(
                "<?xml version=\"1.0\"?><worksheet xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\"><sheetData>",
            );
            for (r, row) in rows.iter().enumerate() {
                sheet_xml.push_str(&format!("<row r=\"{}\">", r + 1));
                for (c, value) in row.iter().enumerate() {
                    let cell_ref = format!("{}{}", col_letter(c), r + 1);
                    if value.parse::<f64>().is_ok() {
                        sheet_xml
                            .push_str(&format!("<c r=\"{}\"><v>{}</v></c>", cell_ref, value));
                    } else if value.is_empty() {
                        sheet_xml.push_str(&format!("<c r=\"{}\"/>", cell_ref));
                    } else {
                        sheet_xml.push_str(&format!(
                            "<c r=\"{}\" t=\"inlineStr\"><is><t>{}</t></is></c>",
                            cell_ref, value
                        ));
                    }
                }
                sheet_xml.push_str("</row>");
            }
            sheet_xml.push_str("</sheetData></worksheet>");
            zw.start_file(format!("xl/worksheets/sheet{}.xml", i + 1), opts)
                .unwrap();
            zw.write_all(sheet_xml.as_bytes()).unwrap();
        }

        zw.finish().unwrap();
    }
    buf
}

fn col_letter(mut idx: usize) -> String {
    let mut s = String::new();
    loop {
        s.insert(0, (b'A' + (idx % 26) as u8) as char);
        if idx < 26 {
            break;
        }
        idx = idx / 26 - 1;
    }
    s
}

/// The standard three-sheet sales fixture: two products, two customers,
/// three sales. Sale 1 is Ana (IdCliente 7) buying 3 Mouse (IdProducto 2,
/// price 10) on serial date 45292 (2024-01-01), so its Total is 30.
pub fn sales_fixture() -> Vec<u8> {
    build_xlsx(&[
        (
            "Productos",
            vec![
                vec!["IdProducto", "NombreProducto", "Categoria", "Precio"],
                vec!["1", "Teclado", "Perifericos", "25.5"],
                vec!["2", "Mouse", "Perifericos", "10"],
            ],
        ),
        (
            "Clientes",
            vec![
                vec!["IdCliente", "NombreCliente", "Ciudad"],
                vec!["7", "Ana", "Córdoba"],
                vec!["8", "Luis", "Rosario"],
            ],
        ),
        (
            "Ventas",
            vec![
                vec!["IdVenta", "FechaVenta", "IdCliente", "IdProducto", "Cantidad"],
                vec!["1", "45292", "7", "2", "3"],
                vec!["2", "45321", "8", "1", "1"],
                vec!["3", "45350", "7", "1", "2"],
            ],
        ),
    ])
}
