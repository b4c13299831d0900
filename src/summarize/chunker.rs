use crate::summarize::tokenizer::Tokenizer;
use serde::Serialize;
use std::ops::Range;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
    pub token_count: usize,
}

/// Token windows of at most `chunk_size`, each starting
/// `floor(chunk_size * overlap)` tokens before the previous end. The start
/// always advances, so an overlap that would not move forward falls back to
/// starting at the previous end.
pub fn split_ranges(total_tokens: usize, chunk_size: usize, overlap_fraction: f64) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    if total_tokens == 0 || chunk_size == 0 {
        return ranges;
    }

    let overlap_fraction = overlap_fraction.max(0.0);
    let overlap_tokens = (chunk_size as f64 * overlap_fraction).floor() as usize;
    let mut start = 0usize;
    while start < total_tokens {
        let end = (start + chunk_size).min(total_tokens);
        ranges.push(start..end);
        let next = end.saturating_sub(overlap_tokens);
        start = if next > start { next } else { end };
    }
    ranges
}

pub struct Chunker<'a> {
    tokenizer: &'a dyn Tokenizer,
    chunk_size: usize,
    overlap_fraction: f64,
}

impl<'a> Chunker<'a> {
    pub fn new(tokenizer: &'a dyn Tokenizer, chunk_size: usize, overlap_fraction: f64) -> Self {
        Self {
            tokenizer,
            chunk_size,
            overlap_fraction,
        }
    }

    pub fn split(&self, text: &str) -> Vec<Chunk> {
        let tokens = self.tokenizer.encode(text);
        split_ranges(tokens.len(), self.chunk_size, self.overlap_fraction)
            .into_iter()
            .enumerate()
            .map(|(index, range)| Chunk {
                index,
                token_count: range.len(),
                text: self.tokenizer.decode(&tokens[range]),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{Chunker, split_ranges};
    use crate::summarize::testing::CharTokenizer;

    #[test]
    fn worked_example_yields_five_windows() {
        let ranges = split_ranges(1000, 300, 0.2);
        assert_eq!(ranges, vec![0..300, 240..540, 480..780, 720..1000, 940..1000]);
    }

    #[test]
    fn zero_overlap_tiles_exactly() {
        assert_eq!(split_ranges(10, 4, 0.0), vec![0..4, 4..8, 8..10]);
    }

    #[test]
    fn short_input_is_a_single_chunk() {
        assert_eq!(split_ranges(5, 300, 0.2), vec![0..5]);
        assert!(split_ranges(0, 300, 0.2).is_empty());
    }

    #[test]
    fn single_trailing_token_is_its_own_chunk() {
        assert_eq!(split_ranges(5, 4, 0.0), vec![0..4, 4..5]);
    }

    #[test]
    fn ranges_cover_every_token_with_dense_progress() {
        for total in [1usize, 7, 99, 300, 301, 1000, 4097] {
            for size in [1usize, 2, 3, 50, 300] {
                for overlap in [0.0, 0.1, 0.2, 0.5, 0.9, 0.99] {
                    let ranges = split_ranges(total, size, overlap);
                    let mut covered = vec![false; total];
                    for range in &ranges {
                        assert!(range.end <= total);
                        assert!(range.len() <= size);
                        for idx in range.clone() {
                            covered[idx] = true;
                        }
                    }
                    assert!(covered.iter().all(|seen| *seen), "total={total} size={size}");
                    assert_eq!(ranges.first().map(|r| r.start), Some(0));
                    assert_eq!(ranges.last().map(|r| r.end), Some(total));

                    let stride = size as f64 * (1.0 - overlap);
                    let bound = (total as f64 / stride).ceil() as usize;
                    // The window that reaches the end still steps back by the
                    // overlap, leaving one tail window inside it (1000 tokens at
                    // 300/0.2 ends with 720..1000 and then 940..1000).
                    assert!(
                        ranges.len() <= bound + 1,
                        "total={total} size={size} overlap={overlap} steps={} bound={bound}",
                        ranges.len()
                    );
                }
            }
        }
    }

    #[test]
    fn overlap_near_one_still_terminates() {
        let ranges = split_ranges(20, 4, 0.999);
        assert!(ranges.windows(2).all(|pair| pair[1].start > pair[0].start));
    }

    #[test]
    fn split_decodes_windows_with_dense_indices() {
        let tok = CharTokenizer;
        let chunker = Chunker::new(&tok, 4, 0.25);
        let chunks = chunker.split("abcdefghij");
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["abcd", "defg", "ghij", "j"]);
        for (pos, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, pos);
            assert_eq!(chunk.token_count, chunk.text.chars().count());
        }
    }
}
