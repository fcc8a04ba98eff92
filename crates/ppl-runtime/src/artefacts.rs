// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deterministic artefact writing under a run directory.
//!
//! Every file is written to a temporary sibling and atomically renamed into
//! place, so readers never observe partial content. Writes are serialised
//! per path by construction: each artefact is written exactly once, by the
//! orchestrator.

use ppl_core::EngineError;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Writes run artefacts and remembers every path it wrote.
#[derive(Debug)]
pub struct ArtifactWriter {
    run_dir: PathBuf,
    written: Mutex<Vec<String>>,
}

impl ArtifactWriter {
    /// Create the run directory `<artefacts_dir>/<run_id>` and a writer
    /// rooted there.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Export`] when the directory cannot be created.
    pub fn new(artefacts_dir: &Path, run_id: &str) -> Result<Self, EngineError> {
        let run_dir = artefacts_dir.join(run_id);
        std::fs::create_dir_all(&run_dir).map_err(|e| {
            EngineError::Export(format!("create run dir {}: {e}", run_dir.display()))
        })?;
        Ok(Self {
            run_dir,
            written: Mutex::new(Vec::new()),
        })
    }

    /// The run directory this writer is rooted at.
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Relative paths of every artefact written so far, in write order.
    pub fn paths(&self) -> Vec<String> {
        self.written.lock().expect("artefact lock poisoned").clone()
    }

    /// Write raw bytes to `rel` atomically (temp sibling, then rename).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Export`] on any I/O failure.
    pub fn write_bytes(&self, rel: &str, bytes: &[u8]) -> Result<PathBuf, EngineError> {
        let path = self.run_dir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::Export(format!("create {}: {e}", parent.display()))
            })?;
        }
        let tmp = path.with_extension(match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{ext}.tmp"),
            None => "tmp".to_string(),
        });
        std::fs::write(&tmp, bytes)
            .map_err(|e| EngineError::Export(format!("write {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| EngineError::Export(format!("rename {}: {e}", path.display())))?;
        self.written
            .lock()
            .expect("artefact lock poisoned")
            .push(rel.to_string());
        debug!(target: "ppl.artefacts", path = %path.display(), bytes = bytes.len(), "artefact written");
        Ok(path)
    }

    /// Write one JSON object per line.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Export`] on serialisation or I/O failure.
    pub fn write_jsonl<T: Serialize>(
        &self,
        rel: &str,
        items: &[T],
    ) -> Result<PathBuf, EngineError> {
        let mut buf = Vec::new();
        for item in items {
            let line = serde_json::to_string(item)
                .map_err(|e| EngineError::Export(format!("serialise {rel}: {e}")))?;
            buf.extend_from_slice(line.as_bytes());
            buf.push(b'\n');
        }
        self.write_bytes(rel, &buf)
    }

    /// Write a pretty-printed JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Export`] on serialisation or I/O failure.
    pub fn write_json<T: Serialize>(&self, rel: &str, value: &T) -> Result<PathBuf, EngineError> {
        let json = serde_json::to_string_pretty(value)
            .map_err(|e| EngineError::Export(format!("serialise {rel}: {e}")))?;
        self.write_bytes(rel, json.as_bytes())
    }

    /// Write a YAML document.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Export`] on serialisation or I/O failure.
    pub fn write_yaml<T: Serialize>(&self, rel: &str, value: &T) -> Result<PathBuf, EngineError> {
        let yaml = serde_yaml::to_string(value)
            .map_err(|e| EngineError::Export(format!("serialise {rel}: {e}")))?;
        self.write_bytes(rel, yaml.as_bytes())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn writes_are_atomic_and_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path(), "20260101T000000Z").unwrap();
        writer.write_bytes("outputs.jsonl", b"{}\n").unwrap();

        let path = writer.run_dir().join("outputs.jsonl");
        assert_eq!(std::fs::read(&path).unwrap(), b"{}\n");
        // No temp leftovers.
        let leftovers: Vec<_> = std::fs::read_dir(writer.run_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("tmp"))
            .collect();
        assert!(leftovers.is_empty());
        assert_eq!(writer.paths(), vec!["outputs.jsonl"]);
    }

    #[test]
    fn rewrite_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path(), "run").unwrap();
        writer.write_bytes("manifest.json", b"one").unwrap();
        writer.write_bytes("manifest.json", b"two").unwrap();
        let body = std::fs::read(writer.run_dir().join("manifest.json")).unwrap();
        assert_eq!(body, b"two");
    }

    #[test]
    fn nested_paths_create_parents() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path(), "run").unwrap();
        writer.write_bytes("rag/kb.jsonl", b"x\n").unwrap();
        assert!(writer.run_dir().join("rag/kb.jsonl").exists());
    }

    #[test]
    fn jsonl_writes_one_line_per_item() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path(), "run").unwrap();
        writer
            .write_jsonl("docs.jsonl", &[json!({"id": 1}), json!({"id": 2})])
            .unwrap();
        let body = std::fs::read_to_string(writer.run_dir().join("docs.jsonl")).unwrap();
        assert_eq!(body.lines().count(), 2);
        assert!(body.ends_with('\n'));
    }

    #[test]
    fn identical_inputs_yield_identical_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let a = ArtifactWriter::new(dir.path(), "a").unwrap();
        let b = ArtifactWriter::new(dir.path(), "b").unwrap();
        let items = vec![json!({"z": 1, "a": 2})];
        a.write_jsonl("docs.jsonl", &items).unwrap();
        b.write_jsonl("docs.jsonl", &items).unwrap();
        let left = std::fs::read(a.run_dir().join("docs.jsonl")).unwrap();
        let right = std::fs::read(b.run_dir().join("docs.jsonl")).unwrap();
        assert_eq!(left, right);
    }
}
