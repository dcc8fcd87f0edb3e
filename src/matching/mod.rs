//! Entity-to-geometry matching.
//!
//! PHI detection yields character offsets; masking needs pixel
//! rectangles. This module bridges the two, surviving the three ways
//! the text domains drift apart: OCR misreads (S/5, O/0, l/1),
//! whitespace divergence between the word stream and the transcript,
//! and detector offsets that are shifted relative to the transcript.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::models::{MaskRegion, MatchedEntity, OcrResult, OcrWord, PhiEntity};

/// An OCR word anchored to its character span in the transcript.
#[derive(Debug, Clone)]
pub struct WordSpan {
    pub word: OcrWord,
    /// Start char offset in `full_text` (inclusive).
    pub start: usize,
    /// End char offset in `full_text` (exclusive).
    pub end: usize,
}

impl WordSpan {
    /// Whether this word's span intersects the half-open range.
    pub fn overlaps_range(&self, start: usize, end: usize) -> bool {
        self.start < end && start < self.end
    }
}

/// Maps PHI character spans to merged pixel boxes.
#[derive(Debug, Clone)]
pub struct EntityMatcher {
    fuzzy_threshold: usize,
    confidence_threshold: f64,
    pad_px: f64,
}

impl Default for EntityMatcher {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 2,
            confidence_threshold: 0.0,
            pad_px: 5.0,
        }
    }
}

impl EntityMatcher {
    pub fn new(fuzzy_threshold: usize, confidence_threshold: f64, pad_px: u32) -> Self {
        Self {
            fuzzy_threshold,
            confidence_threshold,
            pad_px: pad_px as f64,
        }
    }

    /// Resolve each entity to zero or more mask regions (one per page
    /// the entity's words land on). Entities below the confidence gate
    /// are dropped entirely; entities that cannot be located keep an
    /// empty region list so the caller can report them without guessing
    /// at coordinates.
    pub fn match_entities(
        &self,
        ocr: &OcrResult,
        entities: &[PhiEntity],
    ) -> Vec<MatchedEntity> {
        let offset_map = self.build_offset_map(ocr);
        let full_text_lower = ocr.full_text.to_lowercase();

        let mut matched = Vec::with_capacity(entities.len());
        for entity in entities {
            if entity.confidence < self.confidence_threshold {
                debug!(
                    text = %entity.text,
                    confidence = entity.confidence,
                    "skipping low-confidence entity"
                );
                continue;
            }

            let span_indices = self.locate_entity(entity, &offset_map, &full_text_lower);
            let regions = self.merge_regions(entity, &span_indices, &offset_map);
            if regions.is_empty() {
                warn!(
                    text = %entity.text,
                    offset = entity.offset,
                    length = entity.length,
                    "could not match entity to any OCR words; it may be in an image or OCR quality is too poor"
                );
            }
            matched.push(MatchedEntity {
                entity: entity.clone(),
                regions,
            });
        }
        matched
    }

    /// Build the offset map: walk the transcript left to right,
    /// consuming the flattened word stream. Words that cannot be
    /// located are dropped from the index without advancing the text
    /// position, which tolerates OCR words absent from the transcript.
    /// Rebuilt per document, never cached across calls.
    pub fn build_offset_map(&self, ocr: &OcrResult) -> Vec<WordSpan> {
        let chars: Vec<char> = ocr.full_text.chars().collect();
        let mut map = Vec::new();
        let mut pos = 0usize;

        for word in ocr.pages.iter().flat_map(|p| p.words.iter()) {
            let normalized = word.text.trim();
            if normalized.is_empty() {
                continue;
            }
            while pos < chars.len() && chars[pos].is_whitespace() {
                pos += 1;
            }
            if pos >= chars.len() {
                break;
            }
            match self.match_word_at(&chars, normalized, pos) {
                Some(matched_len) => {
                    map.push(WordSpan {
                        word: word.clone(),
                        start: pos,
                        end: pos + matched_len,
                    });
                    pos += matched_len;
                }
                None => {
                    debug!(word = %word.text, pos, "OCR word not found in transcript; dropping from index");
                }
            }
        }
        map
    }

    /// Try to match `word` at `pos`: exact first, then candidate
    /// lengths around the word length, accepting the shortest candidate
    /// within the fuzzy threshold. Returns the matched length.
    fn match_word_at(&self, chars: &[char], word: &str, pos: usize) -> Option<usize> {
        let word_len = word.chars().count();
        let remaining = chars.len() - pos;

        if word_len <= remaining {
            let exact: String = chars[pos..pos + word_len].iter().collect();
            if exact == word {
                return Some(word_len);
            }
        }

        let min_len = word_len.saturating_sub(2).max(1);
        let max_len = (word_len + 2).min(remaining);
        for len in min_len..=max_len {
            let candidate: String = chars[pos..pos + len].iter().collect();
            if candidate.trim().is_empty() {
                continue;
            }
            if strsim::levenshtein(word, &candidate) <= self.fuzzy_threshold {
                return Some(len);
            }
        }
        None
    }

    /// Primary offset matching with validation, falling back to a
    /// content search when offsets point nowhere useful.
    fn locate_entity(
        &self,
        entity: &PhiEntity,
        offset_map: &[WordSpan],
        full_text_lower: &str,
    ) -> Vec<usize> {
        let overlapping: Vec<usize> = offset_map
            .iter()
            .enumerate()
            .filter(|(_, span)| span.overlaps_range(entity.offset, entity.end_offset()))
            .map(|(i, _)| i)
            .collect();

        let validated = self.validate_overlap(entity, &overlapping, offset_map);
        if !validated.is_empty() {
            return validated;
        }

        // Fallback only when the entity text actually occurs in the
        // transcript; otherwise the detector is talking about text this
        // document does not contain, and masking anything would hide
        // the wrong words.
        let entity_lower = entity.text.trim().to_lowercase();
        if full_text_lower.contains(&entity_lower) {
            return self.fallback_by_text(entity, offset_map);
        }
        Vec::new()
    }

    /// Reject offset matches whose text is nothing like the entity's.
    /// Coincidentally aligned offsets (gateway prefixes, re-basing bugs)
    /// would otherwise mask unrelated text.
    fn validate_overlap(
        &self,
        entity: &PhiEntity,
        indices: &[usize],
        offset_map: &[WordSpan],
    ) -> Vec<usize> {
        if indices.is_empty() {
            return Vec::new();
        }
        let combined = indices
            .iter()
            .map(|&i| offset_map[i].word.text.trim())
            .collect::<Vec<_>>()
            .join(" ");
        let entity_text = entity.text.trim();
        let max_distance = (entity_text.chars().count() / 3).max(self.fuzzy_threshold);
        let distance =
            strsim::levenshtein(&combined.to_lowercase(), &entity_text.to_lowercase());
        if distance > max_distance {
            debug!(
                entity = %entity_text,
                found = %combined,
                distance,
                max_distance,
                "rejecting offset match; texts too different"
            );
            return Vec::new();
        }
        indices.to_vec()
    }

    /// Content fallback: the first contiguous run of words whose joined
    /// text is within the fuzzy threshold of the entity text.
    /// Single-character entities are rejected outright (otherwise "J"
    /// would mask every J on the page), and only the first run is
    /// returned.
    fn fallback_by_text(&self, entity: &PhiEntity, offset_map: &[WordSpan]) -> Vec<usize> {
        let target = entity.text.trim().to_lowercase();
        if target.chars().count() <= 1 {
            debug!(entity = %entity.text, "single-character entity rejected by fallback");
            return Vec::new();
        }
        let run_len = target.split_whitespace().count().max(1);
        if run_len > offset_map.len() {
            return Vec::new();
        }

        for start in 0..=(offset_map.len() - run_len) {
            let joined = offset_map[start..start + run_len]
                .iter()
                .map(|span| span.word.text.trim())
                .collect::<Vec<_>>()
                .join(" ")
                .to_lowercase();
            if strsim::levenshtein(&joined, &target) <= self.fuzzy_threshold {
                debug!(
                    entity = %entity.text,
                    start,
                    run_len,
                    "located entity by content fallback"
                );
                return (start..start + run_len).collect();
            }
        }
        Vec::new()
    }

    /// Group matched words by page and union each page's boxes into one
    /// padded region. A multi-page entity yields one region per page.
    fn merge_regions(
        &self,
        entity: &PhiEntity,
        indices: &[usize],
        offset_map: &[WordSpan],
    ) -> Vec<MaskRegion> {
        let mut by_page: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for &i in indices {
            by_page
                .entry(offset_map[i].word.bounding_box.page)
                .or_default()
                .push(i);
        }

        by_page
            .into_values()
            .map(|page_indices| {
                let mut merged = offset_map[page_indices[0]].word.bounding_box;
                for &i in &page_indices[1..] {
                    merged = merged.union(&offset_map[i].word.bounding_box);
                }
                MaskRegion::for_box(
                    merged.padded(self.pad_px),
                    entity.category.clone(),
                    entity.confidence,
                )
            })
            .collect()
    }
}
