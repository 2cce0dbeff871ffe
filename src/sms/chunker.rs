//! Outbound message classification and chunk planning

use crate::core::constants::{
    GSM7_CHUNK_LIMIT, GSM7_SINGLE_LIMIT, UCS2_CHUNK_LIMIT, UCS2_SINGLE_LIMIT,
};
use crate::sms::gsm7;
use std::ops::Range;

/// Character encoding selected for a whole message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmsEncoding {
    /// Every character maps into the 7-bit default alphabet
    Gsm7,
    /// At least one character fell outside the GSM-7 repertoire
    Ucs2,
}

/// Chunk layout for one outbound message
///
/// Spans are byte ranges into the original text, so each chunk can be
/// re-sliced from the retained message without copying up front.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPlan {
    pub encoding: SmsEncoding,
    pub spans: Vec<Range<usize>>,
}

impl ChunkPlan {
    pub fn is_multipart(&self) -> bool {
        self.spans.len() > 1
    }

    pub fn chunk_count(&self) -> usize {
        self.spans.len()
    }
}

/// Decide the encoding of a whole message
///
/// A single character outside the GSM-7 repertoire switches the entire
/// message to UCS-2; mixing encodings across chunks is not possible.
pub fn classify(text: &str) -> SmsEncoding {
    if gsm7::septet_len(text).is_some() {
        SmsEncoding::Gsm7
    } else {
        SmsEncoding::Ucs2
    }
}

/// Compute the chunk spans for a message
///
/// Messages within the single-part limit produce exactly one span (no
/// multipart header); longer messages split greedily at the multipart
/// chunk limit. A two-septet extension character is never split across
/// a chunk boundary.
pub fn plan(text: &str) -> ChunkPlan {
    let encoding = classify(text);
    let (single_limit, chunk_limit) = match encoding {
        SmsEncoding::Gsm7 => (GSM7_SINGLE_LIMIT, GSM7_CHUNK_LIMIT),
        SmsEncoding::Ucs2 => (UCS2_SINGLE_LIMIT, UCS2_CHUNK_LIMIT),
    };

    let total: usize = text
        .chars()
        .map(|c| char_units(c, encoding))
        .sum();
    if total <= single_limit {
        return ChunkPlan {
            encoding,
            spans: vec![0..text.len()],
        };
    }

    let mut spans = Vec::new();
    let mut start = 0;
    let mut used = 0;
    for (pos, c) in text.char_indices() {
        let cost = char_units(c, encoding);
        if used + cost > chunk_limit {
            spans.push(start..pos);
            start = pos;
            used = 0;
        }
        used += cost;
    }
    if start < text.len() {
        spans.push(start..text.len());
    }
    ChunkPlan { encoding, spans }
}

fn char_units(c: char, encoding: SmsEncoding) -> usize {
    match encoding {
        SmsEncoding::Gsm7 => gsm7::septet_cost(c),
        SmsEncoding::Ucs2 => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gsm7_boundary_is_160_characters() {
        let text = "a".repeat(160);
        let plan = plan(&text);
        assert_eq!(plan.encoding, SmsEncoding::Gsm7);
        assert_eq!(plan.chunk_count(), 1);

        let text = "a".repeat(161);
        let plan = super::plan(&text);
        assert_eq!(plan.chunk_count(), 2);
        for span in &plan.spans {
            assert!(span.len() <= 152);
        }
        assert_eq!(plan.spans[0].end, plan.spans[1].start);
        assert_eq!(plan.spans[1].end, 161);
    }

    #[test]
    fn ucs2_boundary_is_70_characters() {
        let text = "中".repeat(70);
        let plan = plan(&text);
        assert_eq!(plan.encoding, SmsEncoding::Ucs2);
        assert_eq!(plan.chunk_count(), 1);

        let text = "中".repeat(71);
        let plan = super::plan(&text);
        assert_eq!(plan.chunk_count(), 2);
        for span in &plan.spans {
            let chars = text[span.clone()].chars().count();
            assert!(chars <= 67);
        }
    }

    #[test]
    fn one_foreign_character_switches_whole_message() {
        assert_eq!(classify("everything fine here"), SmsEncoding::Gsm7);
        assert_eq!(classify("everything fine 中"), SmsEncoding::Ucs2);
    }

    #[test]
    fn extension_characters_count_double_in_gsm7() {
        // 80 euro signs occupy exactly 160 septets: still single-part
        let text = "€".repeat(80);
        assert_eq!(plan(&text).chunk_count(), 1);
        // one more forces multipart, 76 per chunk at most
        let text = "€".repeat(81);
        let plan = super::plan(&text);
        assert!(plan.is_multipart());
        for span in &plan.spans {
            let septets: usize = text[span.clone()]
                .chars()
                .map(crate::sms::gsm7::septet_cost)
                .sum();
            assert!(septets <= 152);
        }
    }

    #[test]
    fn spans_cover_the_text_without_gaps() {
        let text = "chunk planning keeps every byte ".repeat(12);
        let plan = plan(&text);
        let mut expected_start = 0;
        for span in &plan.spans {
            assert_eq!(span.start, expected_start);
            expected_start = span.end;
        }
        assert_eq!(expected_start, text.len());
    }
}
