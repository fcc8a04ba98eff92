// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deterministic content-hash identity.
//!
//! Ids take the form `<prefix>_<hex>` where `<hex>` is a 64-bit hash over
//! the concatenation of the id namespace, discriminating fields, the payload
//! length, and the canonical payload bytes. Rebuilding the same inputs
//! yields the same ids on every platform.

use crate::error::EngineError;
use blake2::digest::consts::U8;
use blake2::{Blake2b, Digest};
use std::sync::OnceLock;

/// BLAKE2b with an 8-byte digest, the default id hash.
type Blake2b64 = Blake2b<U8>;

// ---------------------------------------------------------------------------
// Algorithm selection
// ---------------------------------------------------------------------------

/// Supported id hash algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgo {
    /// 64-bit truncated BLAKE2b (default).
    Blake2b,
    /// xxHash64.
    Xxh64,
}

impl HashAlgo {
    /// Parse a configured algorithm name.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] for unrecognised names.
    pub fn parse(name: &str) -> Result<Self, EngineError> {
        match name {
            "blake2b" => Ok(Self::Blake2b),
            "xxh64" => Ok(Self::Xxh64),
            other => Err(EngineError::Config(format!(
                "unrecognised hash algorithm: {other}"
            ))),
        }
    }

    /// Stable configuration name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blake2b => "blake2b",
            Self::Xxh64 => "xxh64",
        }
    }
}

static HASH_ALGO: OnceLock<HashAlgo> = OnceLock::new();

/// Set the process-wide id hash algorithm. The first call wins; later calls
/// are ignored and return `false`.
pub fn configure_hashing(algo: HashAlgo) -> bool {
    HASH_ALGO.set(algo).is_ok()
}

/// The active id hash algorithm (defaults to [`HashAlgo::Blake2b`]).
pub fn active_algo() -> HashAlgo {
    *HASH_ALGO.get().unwrap_or(&HashAlgo::Blake2b)
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

fn digest64(algo: HashAlgo, parts: &[&[u8]]) -> u64 {
    match algo {
        HashAlgo::Blake2b => {
            let mut hasher = Blake2b64::new();
            for part in parts {
                hasher.update(part);
            }
            u64::from_be_bytes(hasher.finalize().into())
        }
        HashAlgo::Xxh64 => {
            let mut buf = Vec::new();
            for part in parts {
                buf.extend_from_slice(part);
            }
            xxhash_rust::xxh64::xxh64(&buf, 0)
        }
    }
}

fn make_id(prefix: &str, parts: &[&[u8]]) -> String {
    let hex = digest64(active_algo(), parts);
    format!("{prefix}_{hex:016x}")
}

/// Id for a document over its canonical bytes.
pub fn document_id(mime: &str, canonical_bytes: &[u8]) -> String {
    let len = (canonical_bytes.len() as u64).to_le_bytes();
    make_id(
        "doc",
        &[b"doc", mime.as_bytes(), &len, canonical_bytes],
    )
}

/// Id for a blob; includes the MIME type.
pub fn blob_id(mime: &str, bytes: &[u8]) -> String {
    let len = (bytes.len() as u64).to_le_bytes();
    make_id("blob", &[b"blob", mime.as_bytes(), &len, bytes])
}

/// Id for a chunk; covers the owning document id, byte offset, and length.
pub fn chunk_id(doc_id: &str, offset: u64, text: &str) -> String {
    let off = offset.to_le_bytes();
    let len = (text.len() as u64).to_le_bytes();
    make_id(
        "chunk",
        &[b"chunk", doc_id.as_bytes(), &off, &len, text.as_bytes()],
    )
}

/// Id for a table row; covers the source URI, row index, and derived text.
pub fn row_id(source_uri: &str, row_index: u64, text: &str) -> String {
    let idx = row_index.to_le_bytes();
    let len = (text.len() as u64).to_le_bytes();
    make_id(
        "row",
        &[b"row", source_uri.as_bytes(), &idx, &len, text.as_bytes()],
    )
}

/// Stable id for an image group, derived from its member blob ids.
pub fn group_id(blob_ids: &[String]) -> String {
    let joined = blob_ids.join(",");
    let len = (joined.len() as u64).to_le_bytes();
    make_id("grp", &[b"grp", &len, joined.as_bytes()])
}

/// Content hash of a prompt template.
pub fn prompt_hash(template: &str) -> String {
    let len = (template.len() as u64).to_le_bytes();
    make_id("prompt", &[b"prompt", &len, template.as_bytes()])
}

/// Content hash of a pipeline description, over its canonical JSON form.
///
/// # Errors
///
/// Returns [`EngineError::Config`] if the description cannot be serialised.
pub fn config_hash<T: serde::Serialize>(config: &T) -> Result<String, EngineError> {
    let json = serde_json::to_string(config)
        .map_err(|e| EngineError::Config(format!("unserialisable pipeline description: {e}")))?;
    let len = (json.len() as u64).to_le_bytes();
    Ok(make_id("cfg", &[b"cfg", &len, json.as_bytes()]))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_algorithms() {
        assert_eq!(HashAlgo::parse("blake2b").unwrap(), HashAlgo::Blake2b);
        assert_eq!(HashAlgo::parse("xxh64").unwrap(), HashAlgo::Xxh64);
    }

    #[test]
    fn parse_unknown_algorithm_is_config_error() {
        let err = HashAlgo::parse("md5").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
        assert!(err.to_string().contains("md5"));
    }

    #[test]
    fn ids_are_deterministic() {
        let a = document_id("text/plain", b"hello world");
        let b = document_id("text/plain", b"hello world");
        assert_eq!(a, b);
        assert!(a.starts_with("doc_"));
        assert_eq!(a.len(), "doc_".len() + 16);
    }

    #[test]
    fn mime_discriminates_ids() {
        let a = document_id("text/plain", b"same");
        let b = document_id("text/markdown", b"same");
        assert_ne!(a, b);
    }

    #[test]
    fn offset_discriminates_chunk_ids() {
        let a = chunk_id("doc_00", 0, "body");
        let b = chunk_id("doc_00", 4, "body");
        assert_ne!(a, b);
        assert!(a.starts_with("chunk_"));
    }

    #[test]
    fn row_ids_cover_index_and_text() {
        let a = row_id("mem://t.csv", 0, "ok");
        let b = row_id("mem://t.csv", 1, "ok");
        let c = row_id("mem://t.csv", 0, "bad");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn group_id_depends_on_member_order() {
        let ab = group_id(&["blob_a".into(), "blob_b".into()]);
        let ba = group_id(&["blob_b".into(), "blob_a".into()]);
        assert_ne!(ab, ba);
        assert!(ab.starts_with("grp_"));
    }

    #[test]
    fn both_algorithms_produce_well_formed_hex() {
        for algo in [HashAlgo::Blake2b, HashAlgo::Xxh64] {
            let hex = digest64(algo, &[b"abc"]);
            let formatted = format!("{hex:016x}");
            assert_eq!(formatted.len(), 16);
        }
    }

    #[test]
    fn config_hash_is_stable() {
        let value = serde_json::json!({"steps": [], "concurrency": 4});
        let a = config_hash(&value).unwrap();
        let b = config_hash(&value).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("cfg_"));
    }
}
