// SPDX-License-Identifier: MIT OR Apache-2.0
//! Text chunking with sentence/paragraph/none splitters.

use ppl_core::config::Splitter;
use ppl_core::{Chunk, Document, identity, text};

/// Chunking options.
#[derive(Debug, Clone)]
pub struct ChunkOptions {
    /// Splitting strategy.
    pub splitter: Splitter,
    /// Approximate token budget per chunk.
    pub max_tokens: u32,
    /// Words of trailing context carried from the previous chunk.
    pub overlap: u32,
    /// Token-estimate multiplier over the whitespace word count.
    pub token_multiplier: f64,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            splitter: Splitter::ByParagraph,
            max_tokens: 512,
            overlap: 0,
            token_multiplier: text::DEFAULT_TOKEN_MULTIPLIER,
        }
    }
}

/// A source segment with its byte offset in the document text.
struct Segment<'a> {
    offset: usize,
    text: &'a str,
}

/// Split a document's canonical text into chunks.
///
/// A document without text yields no chunks. `Splitter::None` yields exactly
/// one chunk per document. Segments longer than `max_tokens` are emitted as
/// their own oversized chunk; this splitter never cuts inside a segment.
pub fn chunk_document(doc: &Document, opts: &ChunkOptions) -> Vec<Chunk> {
    let Some(doc_text) = doc.text.as_deref() else {
        return Vec::new();
    };
    if doc_text.is_empty() {
        return Vec::new();
    }

    if matches!(opts.splitter, Splitter::None) {
        return vec![make_chunk(doc, doc_text, 0, opts)];
    }

    let segments = match opts.splitter {
        Splitter::ByParagraph => split_paragraphs(doc_text),
        Splitter::BySentence => split_sentences(doc_text),
        Splitter::None => unreachable!(),
    };
    let joiner = match opts.splitter {
        Splitter::ByParagraph => "\n\n",
        _ => " ",
    };

    let mut chunks: Vec<Chunk> = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_offset = 0usize;
    let mut current_tokens = 0u32;
    let mut carry: String = String::new();

    for segment in &segments {
        let seg_tokens = text::estimate_tokens(segment.text, opts.token_multiplier);
        let over_budget =
            !current.is_empty() && current_tokens + seg_tokens > opts.max_tokens;
        if over_budget {
            let body = current.join(joiner);
            let chunk_text = prepend_carry(&carry, &body, joiner);
            chunks.push(make_chunk(doc, &chunk_text, current_offset as u64, opts));
            carry = tail_words(&body, opts.overlap);
            current.clear();
            current_tokens = 0;
        }
        if current.is_empty() {
            current_offset = segment.offset;
        }
        current.push(segment.text);
        current_tokens += seg_tokens;
    }

    if !current.is_empty() {
        let body = current.join(joiner);
        let chunk_text = prepend_carry(&carry, &body, joiner);
        chunks.push(make_chunk(doc, &chunk_text, current_offset as u64, opts));
    }

    chunks
}

fn make_chunk(doc: &Document, chunk_text: &str, offset: u64, opts: &ChunkOptions) -> Chunk {
    Chunk {
        id: identity::chunk_id(&doc.id, offset, chunk_text),
        doc_id: doc.id.clone(),
        text: chunk_text.to_string(),
        tokens_estimate: text::estimate_tokens(chunk_text, opts.token_multiplier),
        offset,
        metadata: doc.metadata.clone(),
    }
}

fn prepend_carry(carry: &str, body: &str, joiner: &str) -> String {
    if carry.is_empty() {
        body.to_string()
    } else {
        format!("{carry}{joiner}{body}")
    }
}

/// The last `n` whitespace words of a chunk, for overlap carry.
fn tail_words(body: &str, n: u32) -> String {
    if n == 0 {
        return String::new();
    }
    let words: Vec<&str> = body.split_whitespace().collect();
    let start = words.len().saturating_sub(n as usize);
    words[start..].join(" ")
}

fn split_paragraphs(doc_text: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut cursor = 0usize;
    for para in doc_text.split("\n\n") {
        let trimmed = para.trim_matches('\n');
        if !trimmed.is_empty() {
            // Offset of the trimmed paragraph within the document.
            let inner = para.find(trimmed).unwrap_or(0);
            segments.push(Segment {
                offset: cursor + inner,
                text: trimmed,
            });
        }
        cursor += para.len() + 2;
    }
    segments
}

fn split_sentences(doc_text: &str) -> Vec<Segment<'_>> {
    let bytes = doc_text.as_bytes();
    let mut segments = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if matches!(c, '.' | '!' | '?') {
            let next_is_break = bytes
                .get(i + 1)
                .map(|b| (*b as char).is_whitespace())
                .unwrap_or(true);
            if next_is_break {
                let sentence = doc_text[start..=i].trim();
                if !sentence.is_empty() {
                    let inner = doc_text[start..=i].find(sentence).unwrap_or(0);
                    segments.push(Segment {
                        offset: start + inner,
                        text: &doc_text[start + inner..start + inner + sentence.len()],
                    });
                }
                start = i + 1;
            }
        }
        i += 1;
    }
    let tail = doc_text[start..].trim();
    if !tail.is_empty() {
        let inner = doc_text[start..].find(tail).unwrap_or(0);
        segments.push(Segment {
            offset: start + inner,
            text: &doc_text[start + inner..start + inner + tail.len()],
        });
    }
    segments
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
