// SPDX-License-Identifier: MIT OR Apache-2.0
//! Table row parsing (CSV).

use ppl_core::config::TextColumn;
use ppl_core::{Document, EngineError, Row, identity};
use tracing::warn;

/// Deduplicate header names deterministically: the first occurrence keeps
/// its name, the k-th duplicate becomes `name__k` (k starting at 2).
fn dedupe_headers(raw: &[String]) -> Vec<String> {
    let mut seen: std::collections::BTreeMap<String, usize> = std::collections::BTreeMap::new();
    raw.iter()
        .map(|name| {
            let count = seen.entry(name.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                name.clone()
            } else {
                format!("{name}__{count}")
            }
        })
        .collect()
}

fn column_index(headers: &[String], name: &str, uri: &str) -> Result<usize, EngineError> {
    headers
        .iter()
        .position(|h| h == name)
        .ok_or_else(|| EngineError::processing(format!("unknown column '{name}' in {uri}")))
}

/// Parse a tabular document into rows.
///
/// Row indices are 0-based after the header. Empty text rows are yielded
/// with `text = ""`; downstream may skip them. Under `continue_on_error`,
/// a record-level parse failure yields a row carrying
/// `{parse_error, raw}` in its values instead of halting the table.
///
/// # Errors
///
/// Returns [`EngineError::Processing`] naming the source URI when the table
/// itself is unreadable, when a configured column is missing, or when a
/// record fails to parse without `continue_on_error`.
pub fn rows_from_document(
    doc: &Document,
    text_column: &TextColumn,
    pass_through: &[String],
    header_row: bool,
    continue_on_error: bool,
) -> Result<Vec<Row>, EngineError> {
    let uri = &doc.source_uri;
    let body = doc
        .text
        .as_deref()
        .ok_or_else(|| EngineError::processing(format!("unreadable table (no text): {uri}")))?;

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(body.as_bytes());
    let mut records = reader.records();

    let headers: Vec<String> = if header_row {
        match records.next() {
            Some(Ok(record)) => dedupe_headers(
                &record.iter().map(str::to_string).collect::<Vec<_>>(),
            ),
            Some(Err(e)) => {
                return Err(EngineError::processing(format!(
                    "unreadable table header in {uri}: {e}"
                )));
            }
            None => return Ok(Vec::new()),
        }
    } else {
        Vec::new()
    };

    let filename = doc
        .metadata
        .get("filename")
        .and_then(|v| v.as_str())
        .map(String::from)
        .unwrap_or_else(|| uri.rsplit('/').next().unwrap_or(uri).to_string());

    // Headered tables address columns by (deduplicated) name; headerless
    // tables use positional `col_<i>` names. Missing cells read as empty.
    let resolve = |name: &str| -> Result<usize, EngineError> {
        if header_row {
            column_index(&headers, name, uri)
        } else {
            name.strip_prefix("col_")
                .and_then(|n| n.parse::<usize>().ok())
                .ok_or_else(|| {
                    EngineError::processing(format!("unknown column '{name}' in {uri}"))
                })
        }
    };

    let text_columns: Vec<String> = match text_column {
        TextColumn::Single(name) => vec![name.clone()],
        TextColumn::Joined(names) => names.clone(),
    };
    if text_columns.is_empty() {
        return Err(EngineError::processing(format!(
            "text_column must name at least one column for {uri}"
        )));
    }

    let mut rows = Vec::new();
    let mut row_index: u64 = 0;

    for record in records {
        match record {
            Ok(record) => {
                let cell = |idx: usize| record.get(idx).unwrap_or("").to_string();

                let mut text_parts = Vec::with_capacity(text_columns.len());
                let mut values = serde_json::Map::new();
                let mut row_err: Option<EngineError> = None;

                for name in &text_columns {
                    match resolve(name) {
                        Ok(idx) => text_parts.push(cell(idx)),
                        Err(e) => {
                            row_err = Some(e);
                            break;
                        }
                    }
                }
                if row_err.is_none() {
                    for name in pass_through {
                        match resolve(name) {
                            Ok(idx) => {
                                values.insert(name.clone(), serde_json::Value::String(cell(idx)));
                            }
                            Err(e) => {
                                row_err = Some(e);
                                break;
                            }
                        }
                    }
                }
                if let Some(e) = row_err {
                    // A misconfigured column fails the whole table.
                    return Err(e);
                }

                let text = text_parts.join(" ");
                rows.push(Row {
                    id: identity::row_id(uri, row_index, &text),
                    row_index,
                    values,
                    source_uri: uri.clone(),
                    filename: filename.clone(),
                    text,
                });
                row_index += 1;
            }
            Err(e) if continue_on_error => {
                warn!(
                    target: "ppl.units",
                    uri = %uri,
                    row = row_index,
                    error = %e,
                    "row parse error, continuing"
                );
                // The failing record's text, recovered from the document
                // body at the error position (first physical line for
                // multi-line quoted records).
                let raw = e
                    .position()
                    .and_then(|p| body.lines().nth(p.line().saturating_sub(1) as usize))
                    .unwrap_or_default()
                    .to_string();
                let mut values = serde_json::Map::new();
                values.insert(
                    "parse_error".into(),
                    serde_json::Value::String(e.to_string()),
                );
                values.insert("raw".into(), serde_json::Value::String(raw));
                rows.push(Row {
                    id: identity::row_id(uri, row_index, ""),
                    row_index,
                    values,
                    source_uri: uri.clone(),
                    filename: filename.clone(),
                    text: String::new(),
                });
                row_index += 1;
            }
            Err(e) => {
                return Err(EngineError::processing(format!(
                    "row parse error in {uri}: {e}"
                )));
            }
        }
    }

    Ok(rows)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ppl_core::identity;
    use std::collections::BTreeMap;

    fn csv_doc(body: &str) -> Document {
        let canonical = ppl_core::text::canonicalize_text(body);
        let mut metadata = BTreeMap::new();
        metadata.insert(
            "filename".to_string(),
            serde_json::Value::String("t.csv".into()),
        );
        Document {
            id: identity::document_id("text/csv", canonical.as_bytes()),
            source_uri: "mem://data/t.csv".into(),
            text: Some(canonical),
            blobs: Vec::new(),
            metadata,
        }
    }

    fn single(name: &str) -> TextColumn {
        TextColumn::Single(name.into())
    }

    // -- Basic parsing --

    #[test]
    fn parses_rows_in_order_with_pass_through() {
        let doc = csv_doc("id,comment\n1,ok\n2,bad\n3,ok\n");
        let rows =
            rows_from_document(&doc, &single("comment"), &["id".into()], true, false).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].row_index, 0);
        assert_eq!(rows[2].row_index, 2);
        assert_eq!(rows[0].text, "ok");
        assert_eq!(rows[1].text, "bad");
        assert_eq!(rows[0].values["id"], "1");
        assert_eq!(rows[0].filename, "t.csv");
        assert_eq!(rows[0].source_uri, "mem://data/t.csv");
    }

    #[test]
    fn joined_text_columns() {
        let doc = csv_doc("title,body\nHello,World\n");
        let rows = rows_from_document(
            &doc,
            &TextColumn::Joined(vec!["title".into(), "body".into()]),
            &[],
            true,
            false,
        )
        .unwrap();
        assert_eq!(rows[0].text, "Hello World");
    }

    #[test]
    fn empty_text_cells_yield_empty_text() {
        let doc = csv_doc("id,comment\n1,\n");
        let rows = rows_from_document(&doc, &single("comment"), &[], true, false).unwrap();
        assert_eq!(rows[0].text, "");
    }

    #[test]
    fn empty_table_yields_no_rows() {
        let doc = csv_doc("");
        let rows = rows_from_document(&doc, &single("comment"), &[], true, false).unwrap();
        assert!(rows.is_empty());
    }

    // -- Headers --

    #[test]
    fn duplicate_headers_are_deduplicated() {
        assert_eq!(
            dedupe_headers(&["a".into(), "a".into(), "b".into(), "a".into()]),
            vec!["a", "a__2", "b", "a__3"]
        );
    }

    #[test]
    fn deduplicated_header_is_addressable() {
        let doc = csv_doc("x,x\nfirst,second\n");
        let rows = rows_from_document(&doc, &single("x__2"), &["x".into()], true, false).unwrap();
        assert_eq!(rows[0].text, "second");
        assert_eq!(rows[0].values["x"], "first");
    }

    #[test]
    fn headerless_tables_use_positional_names() {
        let doc = csv_doc("1,ok\n2,bad\n");
        let rows =
            rows_from_document(&doc, &single("col_1"), &["col_0".into()], false, false).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].text, "ok");
        assert_eq!(rows[0].values["col_0"], "1");
    }

    // -- Failures --

    #[test]
    fn unknown_column_is_processing_error_with_uri() {
        let doc = csv_doc("id,comment\n1,ok\n");
        let err = rows_from_document(&doc, &single("absent"), &[], true, false).unwrap_err();
        assert!(matches!(err, EngineError::Processing { .. }));
        assert!(err.to_string().contains("mem://data/t.csv"));
    }

    #[test]
    fn textless_document_is_processing_error() {
        let mut doc = csv_doc("id\n1\n");
        doc.text = None;
        let err = rows_from_document(&doc, &single("id"), &[], true, false).unwrap_err();
        assert!(err.to_string().contains("unreadable table"));
    }

    #[test]
    fn short_records_read_missing_cells_as_empty() {
        let doc = csv_doc("id,comment\n1\n2,ok\n");
        let rows =
            rows_from_document(&doc, &single("comment"), &["id".into()], true, false).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].text, "");
        assert_eq!(rows[1].text, "ok");
    }

    // -- Determinism --

    #[test]
    fn row_ids_are_stable() {
        let doc = csv_doc("id,comment\n1,ok\n");
        let a = rows_from_document(&doc, &single("comment"), &[], true, false).unwrap();
        let b = rows_from_document(&doc, &single("comment"), &[], true, false).unwrap();
        assert_eq!(a[0].id, b[0].id);
        assert!(a[0].id.starts_with("row_"));
    }

    #[test]
    fn pass_through_preserves_declared_order() {
        let doc = csv_doc("a,b,c\n1,2,3\n");
        let rows = rows_from_document(
            &doc,
            &single("a"),
            &["c".into(), "b".into()],
            true,
            false,
        )
        .unwrap();
        let keys: Vec<_> = rows[0].values.keys().cloned().collect();
        assert_eq!(keys, vec!["c", "b"]);
    }
}
