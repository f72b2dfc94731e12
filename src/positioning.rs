//! Character-based position handling for prompts
//!
//! Subject spans are stored as byte offsets into the prompt string and
//! resolved to token indices at runtime via the tokenizer's offset map.
//! This keeps prompts model-agnostic: the same dataset works for any
//! tokenizer without precomputed token positions.

/// Encoding result with token ids, decoded token strings, and byte offsets
#[derive(Debug, Clone)]
pub struct EncodingWithOffsets {
    /// Token IDs
    pub ids: Vec<u32>,
    /// Token strings
    pub tokens: Vec<String>,
    /// Byte offset for each token: (start, end)
    pub offsets: Vec<(usize, usize)>,
}

impl EncodingWithOffsets {
    pub fn new(ids: Vec<u32>, tokens: Vec<String>, offsets: Vec<(usize, usize)>) -> Self {
        Self {
            ids,
            tokens,
            offsets,
        }
    }

    /// Find the token index that contains the given byte position
    pub fn char_to_token(&self, char_pos: usize) -> Option<usize> {
        self.offsets
            .iter()
            .position(|(start, end)| char_pos >= *start && char_pos < *end)
    }

    /// All token indices overlapping the byte range `[start_char, end_char)`
    ///
    /// A token overlaps when any of its bytes fall inside the range, so a
    /// subject that starts mid-token still claims that token.
    pub fn char_range_to_tokens(&self, start_char: usize, end_char: usize) -> Vec<usize> {
        self.offsets
            .iter()
            .enumerate()
            .filter_map(|(idx, (start, end))| {
                if *end > start_char && *start < end_char {
                    Some(idx)
                } else {
                    None
                }
            })
            .collect()
    }

    /// Byte range for a token index
    pub fn token_to_char_range(&self, token_idx: usize) -> Option<(usize, usize)> {
        self.offsets.get(token_idx).copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
