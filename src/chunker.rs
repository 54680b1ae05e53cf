//! Heading-aware, token-bounded text chunker.
//!
//! Splits a document's normalized text into ordered, overlapping chunks
//! sized for embedding and retrieval. Sections are cut at the two
//! shallowest heading levels used in the document; oversized sections are
//! subdivided at paragraph breaks, then sentence breaks, and as a last
//! resort hard-split at a token boundary. The tail of each chunk is
//! carried onto the head of the next as overlap.
//!
//! Each chunk records the heading stack active at its start offset, a
//! SHA-256 hash of its text for staleness detection, and a deterministic
//! citation anchor. Re-running over unchanged input reproduces identical
//! boundaries, hashes, and anchors.

use sha2::{Digest, Sha256};

use crate::anchor::derive_anchor;
use crate::config::ChunkingConfig;
use crate::models::Heading;
use crate::token::{estimate_tokens, tail_words};

/// Chunk produced by the chunker, before it is given database identity.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkDraft {
    pub chunk_index: i64,
    pub anchor: String,
    pub heading_path: Vec<String>,
    pub text: String,
    pub hash: String,
    pub start_offset: i64,
    pub end_offset: i64,
    pub token_estimate: i64,
}

/// Byte range into the source text.
#[derive(Debug, Clone, Copy)]
struct Span {
    start: usize,
    end: usize,
}

/// Split a document into ordered chunk drafts.
///
/// Empty or whitespace-only text yields zero chunks. A document whose
/// whole text fits under the target yields exactly one chunk.
pub fn chunk_document(
    content_id: &str,
    text: &str,
    headings: &[Heading],
    config: &ChunkingConfig,
) -> Vec<ChunkDraft> {
    let Some(full) = trim_span(
        text,
        Span {
            start: 0,
            end: text.len(),
        },
    ) else {
        return Vec::new();
    };

    let mut spans: Vec<Span> = Vec::new();
    for section in section_spans(text, full, headings) {
        spans.extend(split_section(text, section, config));
    }

    let mut drafts = Vec::with_capacity(spans.len());
    let mut carry = String::new();

    for (index, span) in spans.into_iter().enumerate() {
        let core = &text[span.start..span.end];
        let chunk_text = if carry.is_empty() {
            core.to_string()
        } else {
            format!("{} {}", carry, core)
        };

        let heading_path = heading_path_at(headings, span.start);
        let anchor = derive_anchor(content_id, &heading_path, index as i64);

        let mut hasher = Sha256::new();
        hasher.update(chunk_text.as_bytes());
        let hash = format!("{:x}", hasher.finalize());

        let token_estimate = estimate_tokens(&chunk_text) as i64;

        drafts.push(ChunkDraft {
            chunk_index: index as i64,
            anchor,
            heading_path,
            text: chunk_text,
            hash,
            start_offset: span.start as i64,
            end_offset: span.end as i64,
            token_estimate,
        });

        carry = tail_words(core, config.overlap_tokens);
    }

    drafts
}

/// Cut the document into sections at headings of the two shallowest levels
/// present. Text before the first heading forms its own section.
fn section_spans(text: &str, full: Span, headings: &[Heading]) -> Vec<Span> {
    let mut levels: Vec<u8> = headings.iter().map(|h| h.level).collect();
    levels.sort_unstable();
    levels.dedup();
    levels.truncate(2);

    let mut boundaries: Vec<usize> = headings
        .iter()
        .filter(|h| levels.contains(&h.level))
        .map(|h| h.offset)
        .filter(|&off| off > full.start && off < full.end)
        .collect();
    boundaries.sort_unstable();
    boundaries.dedup();

    let mut sections = Vec::with_capacity(boundaries.len() + 1);
    let mut start = full.start;
    for boundary in boundaries {
        if let Some(span) = trim_span(
            text,
            Span {
                start,
                end: boundary,
            },
        ) {
            sections.push(span);
        }
        start = boundary;
    }
    if let Some(span) = trim_span(
        text,
        Span {
            start,
            end: full.end,
        },
    ) {
        sections.push(span);
    }
    sections
}

/// Subdivide one section into chunk-sized spans.
fn split_section(text: &str, section: Span, config: &ChunkingConfig) -> Vec<Span> {
    if span_tokens(text, section) <= config.target_tokens {
        return vec![section];
    }

    // Atomic pieces: paragraphs, sentences of oversized paragraphs, and
    // hard-split fragments of boundary-free runs.
    let mut pieces: Vec<Span> = Vec::new();
    for para in paragraph_spans(text, section) {
        if span_tokens(text, para) <= config.target_tokens {
            pieces.push(para);
            continue;
        }
        let sentences = sentence_spans(text, para);
        if sentences.len() <= 1 {
            pieces.extend(hard_split(text, para, config.target_tokens));
            continue;
        }
        for sentence in sentences {
            if span_tokens(text, sentence) > config.max_tokens {
                pieces.extend(hard_split(text, sentence, config.target_tokens));
            } else {
                pieces.push(sentence);
            }
        }
    }

    pack(text, pieces, config)
}

/// Greedily accumulate contiguous pieces: keep merging while the result
/// stays under max and the accumulator has not reached the target, so
/// chunks land near the target without ever exceeding the hard bound.
fn pack(text: &str, pieces: Vec<Span>, config: &ChunkingConfig) -> Vec<Span> {
    let mut out: Vec<Span> = Vec::new();
    let mut current: Option<Span> = None;

    for piece in pieces {
        match current {
            None => current = Some(piece),
            Some(acc) => {
                let merged = Span {
                    start: acc.start,
                    end: piece.end,
                };
                if span_tokens(text, acc) >= config.target_tokens
                    || span_tokens(text, merged) > config.max_tokens
                {
                    out.push(acc);
                    current = Some(piece);
                } else {
                    current = Some(merged);
                }
            }
        }
    }
    if let Some(acc) = current {
        out.push(acc);
    }

    // Fold an undersized trailing fragment into its predecessor.
    if out.len() >= 2 && span_tokens(text, out[out.len() - 1]) < config.min_tokens {
        let end = out[out.len() - 1].end;
        out.truncate(out.len() - 1);
        if let Some(prev) = out.last_mut() {
            prev.end = end;
        }
    }

    out
}

/// Paragraph ranges within `span`, separated by blank lines.
fn paragraph_spans(text: &str, span: Span) -> Vec<Span> {
    let slice = &text[span.start..span.end];
    let mut spans = Vec::new();
    let mut cursor = 0;
    for (pos, _) in slice.match_indices("\n\n") {
        if pos > cursor {
            if let Some(trimmed) = trim_span(
                text,
                Span {
                    start: span.start + cursor,
                    end: span.start + pos,
                },
            ) {
                spans.push(trimmed);
            }
        }
        cursor = pos + 2;
    }
    if cursor < slice.len() {
        if let Some(trimmed) = trim_span(
            text,
            Span {
                start: span.start + cursor,
                end: span.end,
            },
        ) {
            spans.push(trimmed);
        }
    }
    spans
}

/// Sentence ranges within `span`. Boundaries fall after `.`, `!`, or `?`
/// followed by whitespace, and at line breaks.
fn sentence_spans(text: &str, span: Span) -> Vec<Span> {
    let slice = &text[span.start..span.end];
    let chars: Vec<(usize, char)> = slice.char_indices().collect();
    let mut spans = Vec::new();
    let mut start = 0;

    for (k, &(i, c)) in chars.iter().enumerate() {
        let at_break = c == '\n'
            || (matches!(c, '.' | '!' | '?')
                && chars.get(k + 1).is_none_or(|&(_, next)| next.is_whitespace()));
        if at_break {
            let end = i + c.len_utf8();
            if let Some(trimmed) = trim_span(
                text,
                Span {
                    start: span.start + start,
                    end: span.start + end,
                },
            ) {
                spans.push(trimmed);
            }
            start = end;
        }
    }
    if start < slice.len() {
        if let Some(trimmed) = trim_span(
            text,
            Span {
                start: span.start + start,
                end: span.end,
            },
        ) {
            spans.push(trimmed);
        }
    }
    spans
}

/// Split a boundary-free run at word boundaries into fragments of at most
/// `target` estimated tokens.
fn hard_split(text: &str, span: Span, target: usize) -> Vec<Span> {
    let words = word_spans(text, span);
    if words.is_empty() {
        return Vec::new();
    }
    // Invert the words→tokens ratio: target tokens cover about 3/4 as many words.
    let word_budget = ((target * 3) / 4).max(1);

    let mut out = Vec::new();
    for group in words.chunks(word_budget) {
        out.push(Span {
            start: group[0].start,
            end: group[group.len() - 1].end,
        });
    }
    out
}

/// Word ranges within `span`.
fn word_spans(text: &str, span: Span) -> Vec<Span> {
    let slice = &text[span.start..span.end];
    let mut spans = Vec::new();
    let mut start: Option<usize> = None;
    for (i, c) in slice.char_indices() {
        if c.is_whitespace() {
            if let Some(s) = start.take() {
                spans.push(Span {
                    start: span.start + s,
                    end: span.start + i,
                });
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        spans.push(Span {
            start: span.start + s,
            end: span.end,
        });
    }
    spans
}

/// Heading stack active at `offset`, outermost first.
fn heading_path_at(headings: &[Heading], offset: usize) -> Vec<String> {
    let mut stack: Vec<&Heading> = Vec::new();
    for heading in headings.iter().filter(|h| h.offset <= offset) {
        while stack.last().is_some_and(|top| top.level >= heading.level) {
            stack.pop();
        }
        stack.push(heading);
    }
    stack.into_iter().map(|h| h.text.clone()).collect()
}

fn span_tokens(text: &str, span: Span) -> usize {
    estimate_tokens(&text[span.start..span.end])
}

/// Shrink a span to its non-whitespace extent; None when nothing remains.
fn trim_span(text: &str, span: Span) -> Option<Span> {
    let slice = &text[span.start..span.end];
    let without_lead = slice.trim_start();
    let lead = slice.len() - without_lead.len();
    let trimmed = without_lead.trim_end();
    if trimmed.is_empty() {
        return None;
    }
    Some(Span {
        start: span.start + lead,
        end: span.start + lead + trimmed.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ChunkingConfig {
        ChunkingConfig {
            target_tokens: 450,
            overlap_tokens: 60,
            min_tokens: 40,
            max_tokens: 600,
        }
    }

    fn heading(level: u8, text: &str, offset: usize) -> Heading {
        Heading {
            level,
            text: text.to_string(),
            offset,
        }
    }

    /// 1000 words split into five 200-word paragraphs.
    fn thousand_words() -> String {
        (0..5)
            .map(|p| {
                (0..200)
                    .map(|w| format!("word{}x{}", p, w))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    #[test]
    fn empty_document_yields_no_chunks() {
        assert!(chunk_document("doc", "", &[], &config()).is_empty());
        assert!(chunk_document("doc", "  \n\n  \t", &[], &config()).is_empty());
    }

    #[test]
    fn short_document_yields_single_chunk() {
        let chunks = chunk_document("doc", "Just a few words here.", &[], &config());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].text, "Just a few words here.");
        assert_eq!(chunks[0].start_offset, 0);
    }

    #[test]
    fn thousand_word_document_chunks_with_overlap() {
        let text = thousand_words();
        let chunks = chunk_document("doc", &text, &[], &config());

        assert!(
            (2..=3).contains(&chunks.len()),
            "expected 2-3 chunks, got {}",
            chunks.len()
        );
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i as i64);
        }
        // Each later chunk starts with the tail of the previous core text.
        for pair in chunks.windows(2) {
            let head: String = pair[1].text.chars().take(40).collect();
            assert!(
                pair[0].text.contains(head.trim_end()),
                "chunk head not carried from previous tail"
            );
        }
        // Offsets strictly increase.
        for pair in chunks.windows(2) {
            assert!(pair[1].start_offset > pair[0].start_offset);
        }
    }

    #[test]
    fn first_chunk_has_no_overlap_prefix() {
        let text = thousand_words();
        let chunks = chunk_document("doc", &text, &[], &config());
        assert!(chunks[0].text.starts_with("word0x0 "));
    }

    #[test]
    fn deterministic() {
        let text = thousand_words();
        let headings = vec![heading(1, "Title", 0)];
        let a = chunk_document("doc", &text, &headings, &config());
        let b = chunk_document("doc", &text, &headings, &config());
        assert_eq!(a, b);
    }

    #[test]
    fn sections_split_at_two_shallowest_levels() {
        // H1 at 0, H2 mid-document, H3 must not split.
        let part = vec!["alpha"; 120].join(" ");
        let text = format!(
            "# One\n\n{}\n\n## Two\n\n{}\n\n### Three\n\n{}",
            part, part, part
        );
        let h2_offset = text.find("## Two").unwrap();
        let h3_offset = text.find("### Three").unwrap();
        let headings = vec![
            heading(1, "One", 0),
            heading(2, "Two", h2_offset),
            heading(3, "Three", h3_offset),
        ];

        let mut small = config();
        small.target_tokens = 200;
        small.max_tokens = 260;
        small.overlap_tokens = 0;

        let chunks = chunk_document("doc", &text, &headings, &small);
        // A chunk begins exactly at the H2 boundary; none begins at H3.
        assert!(chunks.iter().any(|c| c.start_offset == h2_offset as i64));
        assert!(chunks.iter().all(|c| c.start_offset != h3_offset as i64));
    }

    #[test]
    fn heading_path_tracks_active_stack() {
        let part = vec!["beta"; 150].join(" ");
        let text = format!("# Guide\n\n{}\n\n## Install\n\n{}", part, part);
        let h2_offset = text.find("## Install").unwrap();
        let headings = vec![heading(1, "Guide", 0), heading(2, "Install", h2_offset)];

        let mut small = config();
        small.target_tokens = 220;
        small.max_tokens = 280;

        let chunks = chunk_document("doc", &text, &headings, &small);
        let under_install: Vec<_> = chunks
            .iter()
            .filter(|c| c.start_offset >= h2_offset as i64)
            .collect();
        assert!(!under_install.is_empty());
        for chunk in under_install {
            assert_eq!(chunk.heading_path, vec!["Guide", "Install"]);
        }
        assert_eq!(chunks[0].heading_path, vec!["Guide"]);
    }

    #[test]
    fn boundary_free_run_hard_splits() {
        // 2000 words, no sentence punctuation, no paragraph breaks.
        let text = vec!["token"; 2000].join(" ");
        let chunks = chunk_document("doc", &text, &[], &config());
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(
                chunk.token_estimate <= config().max_tokens as i64 + config().overlap_tokens as i64,
                "chunk exceeds max: {}",
                chunk.token_estimate
            );
        }
    }

    #[test]
    fn anchors_unique_and_stable() {
        let text = thousand_words();
        let chunks = chunk_document("doc", &text, &[], &config());
        let mut anchors: Vec<&str> = chunks.iter().map(|c| c.anchor.as_str()).collect();
        anchors.sort_unstable();
        anchors.dedup();
        assert_eq!(anchors.len(), chunks.len());
    }

    #[test]
    fn hashes_differ_between_chunks() {
        let text = thousand_words();
        let chunks = chunk_document("doc", &text, &[], &config());
        assert!(chunks.len() > 1);
        assert_ne!(chunks[0].hash, chunks[1].hash);
    }
}
