//! Page-range chunking.
//!
//! A document of `P` pages is split into `ceil(P / C)` contiguous chunks of
//! `C` pages; only the last chunk may be shorter. Ranges are 1-based and
//! inclusive, matching the `--- PAGE n ---` delimiters sent to the model.

use std::ops::RangeInclusive;

/// A contiguous run of pages submitted as one conversational turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// 0-based position in the chunk sequence.
    pub index: usize,
    /// First page, 1-based.
    pub start_page: usize,
    /// Last page, 1-based, inclusive.
    pub end_page: usize,
}

impl Chunk {
    pub fn pages(&self) -> RangeInclusive<usize> {
        self.start_page..=self.end_page
    }

    pub fn page_count(&self) -> usize {
        self.end_page + 1 - self.start_page
    }
}

/// Number of chunks for `total_pages` pages, `ceil(total_pages / chunk_size)`.
pub fn chunk_count(total_pages: usize, chunk_size: usize) -> usize {
    if chunk_size == 0 {
        return 0;
    }
    total_pages.div_ceil(chunk_size)
}

/// Split `1..=total_pages` into chunks of `chunk_size` pages.
pub fn plan_chunks(total_pages: usize, chunk_size: usize) -> Vec<Chunk> {
    (0..chunk_count(total_pages, chunk_size))
        .map(|index| {
            let start_page = index * chunk_size + 1;
            let end_page = ((index + 1) * chunk_size).min(total_pages);
            Chunk {
                index,
                start_page,
                end_page,
            }
        })
        .collect()
}

/// Pages covered by the first `chunks` chunks.
pub fn pages_before_chunk(chunks: usize, chunk_size: usize, total_pages: usize) -> usize {
    chunks.saturating_mul(chunk_size).min(total_pages)
}
