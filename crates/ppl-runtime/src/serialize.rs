// SPDX-License-Identifier: MIT OR Apache-2.0
//! Output serialisation: JSONL, CSV, columnar, and compression pass-through.

use flate2::Compression as GzLevel;
use flate2::write::GzEncoder;
use ppl_core::EngineError;
use ppl_core::config::{Compression, OutputFormat};
use ppl_core::text::canonical_string;
use serde_json::Value;
use std::io::Write;

/// Caller-supplied encoder for columnar byte buffers.
pub trait ColumnarEncoder: Send + Sync {
    /// Encode the ordered record buffer into a columnar byte buffer.
    fn encode(&self, records: &[Value]) -> Result<Vec<u8>, EngineError>;
}

/// Serialise records as one compact JSON object per line.
///
/// # Errors
///
/// Returns [`EngineError::Export`] when a record cannot be serialised.
pub fn to_jsonl(records: &[Value]) -> Result<Vec<u8>, EngineError> {
    let mut buf = Vec::new();
    for record in records {
        let line = serde_json::to_string(record)
            .map_err(|e| EngineError::Export(format!("jsonl serialisation: {e}")))?;
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
    }
    Ok(buf)
}

/// Serialise records as CSV.
///
/// The header is the union of record keys in first-seen order; cells are
/// stringified canonically (scalars verbatim, containers compact JSON).
/// Non-object records occupy a single `value` column.
///
/// # Errors
///
/// Returns [`EngineError::Export`] on writer failure.
pub fn to_csv(records: &[Value]) -> Result<Vec<u8>, EngineError> {
    let mut header: Vec<String> = Vec::new();
    let mut objects = true;
    for record in records {
        match record {
            Value::Object(map) => {
                for key in map.keys() {
                    if !header.iter().any(|h| h == key) {
                        header.push(key.clone());
                    }
                }
            }
            _ => objects = false,
        }
    }
    if !objects {
        header = vec!["value".to_string()];
    }

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(&header)
        .map_err(|e| EngineError::Export(format!("csv header: {e}")))?;
    for record in records {
        let row: Vec<String> = match record {
            Value::Object(map) if objects => header
                .iter()
                .map(|key| map.get(key).map(canonical_string).unwrap_or_default())
                .collect(),
            other => vec![canonical_string(other)],
        };
        writer
            .write_record(&row)
            .map_err(|e| EngineError::Export(format!("csv row: {e}")))?;
    }
    writer
        .into_inner()
        .map_err(|e| EngineError::Export(format!("csv flush: {e}")))
}

/// Apply the configured pass-through compression after serialisation.
///
/// # Errors
///
/// Returns [`EngineError::Export`] on encoder failure.
pub fn compress(bytes: Vec<u8>, compression: Compression) -> Result<Vec<u8>, EngineError> {
    match compression {
        Compression::None => Ok(bytes),
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
            encoder
                .write_all(&bytes)
                .map_err(|e| EngineError::Export(format!("gzip: {e}")))?;
            encoder
                .finish()
                .map_err(|e| EngineError::Export(format!("gzip finish: {e}")))
        }
    }
}

/// Serialise the ordered record buffer per the configured format, then
/// apply compression.
///
/// # Errors
///
/// Returns [`EngineError::Config`] when the columnar format is requested
/// without an encoder, and [`EngineError::Export`] on serialisation failure.
pub fn serialize_records(
    records: &[Value],
    format: OutputFormat,
    compression: Compression,
    columnar: Option<&dyn ColumnarEncoder>,
) -> Result<Vec<u8>, EngineError> {
    let bytes = match format {
        OutputFormat::Jsonl => to_jsonl(records)?,
        OutputFormat::Csv => to_csv(records)?,
        OutputFormat::Columnar => {
            let encoder = columnar.ok_or_else(|| {
                EngineError::Config("columnar output requires a columnar encoder".into())
            })?;
            encoder.encode(records)?
        }
    };
    compress(bytes, compression)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn jsonl_one_line_per_record() {
        let bytes = to_jsonl(&[json!({"a": 1}), json!({"b": 2})]).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text, "{\"a\":1}\n{\"b\":2}\n");
    }

    #[test]
    fn csv_header_is_first_seen_union() {
        let bytes = to_csv(&[
            json!({"id": "1", "tag": "x"}),
            json!({"id": "2", "score": 3}),
        ])
        .unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), "id,tag,score");
        assert_eq!(lines.next().unwrap(), "1,x,");
        assert_eq!(lines.next().unwrap(), "2,,3");
    }

    #[test]
    fn csv_cells_stringify_canonically() {
        let bytes = to_csv(&[json!({"nested": {"a": 1}, "flag": true})]).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("\"{\"\"a\"\":1}\""));
        assert!(text.contains("true"));
    }

    #[test]
    fn csv_scalar_records_use_value_column() {
        let bytes = to_csv(&[json!("plain"), json!(7)]).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text.lines().next().unwrap(), "value");
        assert!(text.contains("plain"));
    }

    #[test]
    fn gzip_roundtrips() {
        use std::io::Read;
        let original = to_jsonl(&[json!({"a": 1})]).unwrap();
        let compressed = compress(original.clone(), Compression::Gzip).unwrap();
        assert_ne!(compressed, original);
        let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
        let mut restored = Vec::new();
        decoder.read_to_end(&mut restored).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn none_compression_is_identity() {
        let bytes = vec![1, 2, 3];
        assert_eq!(compress(bytes.clone(), Compression::None).unwrap(), bytes);
    }

    #[test]
    fn columnar_without_encoder_is_config_error() {
        let err = serialize_records(&[], OutputFormat::Columnar, Compression::None, None)
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn columnar_encoder_is_used() {
        struct CountEncoder;
        impl ColumnarEncoder for CountEncoder {
            fn encode(&self, records: &[Value]) -> Result<Vec<u8>, EngineError> {
                Ok(vec![records.len() as u8])
            }
        }
        let out = serialize_records(
            &[json!(1), json!(2)],
            OutputFormat::Columnar,
            Compression::None,
            Some(&CountEncoder),
        )
        .unwrap();
        assert_eq!(out, vec![2]);
    }
}
