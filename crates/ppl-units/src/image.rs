// SPDX-License-Identifier: MIT OR Apache-2.0
//! Image grouping for multimodal calls.

use ppl_core::{Document, ImageGroup, identity};

/// Group a document's blobs into batches of `group_size`, preserving
/// document order. A smaller tail group is emitted as-is. A document's text,
/// when present, becomes each group's caption.
pub fn group_blobs(doc: &Document, group_size: usize) -> Vec<ImageGroup> {
    if doc.blobs.is_empty() || group_size == 0 {
        return Vec::new();
    }
    doc.blobs
        .chunks(group_size)
        .map(|blobs| {
            let blob_ids: Vec<String> = blobs.iter().map(|b| b.id.clone()).collect();
            ImageGroup {
                id: identity::group_id(&blob_ids),
                doc_id: doc.id.clone(),
                blobs: blobs.to_vec(),
                caption: doc.text.clone(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ppl_core::Blob;
    use std::collections::BTreeMap;

    fn doc_with_blobs(n: usize) -> Document {
        let blobs: Vec<Blob> = (0..n)
            .map(|i| {
                let bytes = vec![i as u8; 4];
                Blob {
                    id: identity::blob_id("image/png", &bytes),
                    mime: "image/png".into(),
                    bytes,
                    metadata: BTreeMap::new(),
                }
            })
            .collect();
        Document {
            id: "doc_0000000000000000".into(),
            source_uri: "mem://imgs".into(),
            text: None,
            blobs,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn groups_preserve_order_and_tail() {
        let doc = doc_with_blobs(5);
        let groups = group_blobs(&doc, 2);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].blobs.len(), 2);
        assert_eq!(groups[2].blobs.len(), 1);
        assert_eq!(groups[0].blobs[0].id, doc.blobs[0].id);
        assert_eq!(groups[2].blobs[0].id, doc.blobs[4].id);
    }

    #[test]
    fn default_group_size_one() {
        let doc = doc_with_blobs(3);
        let groups = group_blobs(&doc, 1);
        assert_eq!(groups.len(), 3);
    }

    #[test]
    fn group_ids_are_stable_and_distinct() {
        let doc = doc_with_blobs(4);
        let a = group_blobs(&doc, 2);
        let b = group_blobs(&doc, 2);
        assert_eq!(a, b);
        assert_ne!(a[0].id, a[1].id);
    }

    #[test]
    fn blobless_document_yields_nothing() {
        let doc = doc_with_blobs(0);
        assert!(group_blobs(&doc, 2).is_empty());
    }

    #[test]
    fn caption_comes_from_document_text() {
        let mut doc = doc_with_blobs(1);
        doc.text = Some("diagram set".into());
        let groups = group_blobs(&doc, 1);
        assert_eq!(groups[0].caption.as_deref(), Some("diagram set"));
    }
}
