// SPDX-License-Identifier: MIT OR Apache-2.0
//! Document loading: normalise connector resources into [`Document`]s.

use ppl_core::contract::Connector;
use ppl_core::{Blob, Document, EngineError, identity, text};
use std::collections::BTreeMap;
use tokio::io::AsyncReadExt;
use tracing::debug;

fn filename_of(uri: &str) -> String {
    uri.rsplit('/').next().unwrap_or(uri).to_string()
}

fn is_textual(mime: &str) -> bool {
    mime.starts_with("text/")
        || mime == "application/json"
        || mime == "application/x-ndjson"
        || mime == "application/csv"
}

/// List resources through the connector and normalise each into a document.
///
/// Textual resources become canonical text (NFC, LF); image resources become
/// a single-blob document; other binary payloads become blob documents with
/// their reported MIME type. Metadata carries `source_uri`, `filename`, and
/// the connector's `etag` when present.
///
/// # Errors
///
/// Propagates connector failures; returns [`EngineError::Processing`] when a
/// textual resource is not valid UTF-8.
pub async fn load_documents(
    connector: &dyn Connector,
    selectors: &[String],
) -> Result<Vec<Document>, EngineError> {
    let resources = connector.list(selectors).await?;
    let mut docs = Vec::with_capacity(resources.len());

    for resource in &resources {
        let mut reader = connector.open(resource).await?;
        let mut bytes = Vec::with_capacity(resource.size_bytes as usize);
        reader
            .read_to_end(&mut bytes)
            .await
            .map_err(|e| EngineError::Connector {
                kind: ppl_core::error::ConnectorErrorKind::Transient,
                message: format!("read {}: {e}", resource.uri),
            })?;

        let mut metadata: BTreeMap<String, serde_json::Value> = BTreeMap::new();
        metadata.insert(
            "filename".into(),
            serde_json::Value::String(filename_of(&resource.uri)),
        );
        if let Some(etag) = &resource.etag_or_hash {
            metadata.insert("etag".into(), serde_json::Value::String(etag.clone()));
        }

        let doc = if is_textual(&resource.mime) {
            let raw = String::from_utf8(bytes).map_err(|_| {
                EngineError::processing(format!("resource is not valid UTF-8: {}", resource.uri))
            })?;
            let canonical = text::canonicalize_text(&raw);
            Document {
                id: identity::document_id(&resource.mime, canonical.as_bytes()),
                source_uri: resource.uri.clone(),
                text: Some(canonical),
                blobs: Vec::new(),
                metadata,
            }
        } else {
            let blob = Blob {
                id: identity::blob_id(&resource.mime, &bytes),
                mime: resource.mime.clone(),
                bytes,
                metadata: BTreeMap::new(),
            };
            Document {
                id: identity::document_id(&resource.mime, &blob.bytes),
                source_uri: resource.uri.clone(),
                text: None,
                blobs: vec![blob],
                metadata,
            }
        };

        debug!(
            target: "ppl.units",
            uri = %resource.uri,
            doc_id = %doc.id,
            textual = doc.text.is_some(),
            "normalised resource"
        );
        docs.push(doc);
    }

    Ok(docs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_extraction() {
        assert_eq!(filename_of("mem://dir/file.csv"), "file.csv");
        assert_eq!(filename_of("bare"), "bare");
    }

    #[test]
    fn textual_mime_detection() {
        assert!(is_textual("text/plain"));
        assert!(is_textual("text/csv"));
        assert!(is_textual("application/json"));
        assert!(!is_textual("image/png"));
        assert!(!is_textual("application/octet-stream"));
    }
}
