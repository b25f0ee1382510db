//! Output types returned by the conversion entry points.

use serde::Serialize;

/// Result of a completed conversion.
#[derive(Debug, Clone)]
pub struct ConversionOutput {
    /// The EPUB archive.
    pub epub: Vec<u8>,
    /// Title written into the package metadata.
    pub title: String,
    /// Markup returned by the finalize turn, before packaging.
    pub markup: String,
    pub stats: ConversionStats,
}

/// Aggregate statistics for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConversionStats {
    pub total_pages: usize,
    pub total_chunks: usize,
    /// First chunk submitted by this run; 0 for a fresh conversion.
    pub resumed_from_chunk: usize,
    /// Chunks submitted by this run.
    pub chunks_submitted: usize,
    /// Images in the document-wide sequence.
    pub images_extracted: usize,
    /// Image files written into the archive.
    pub images_packaged: usize,
    pub epub_bytes: usize,
    /// Wall-clock time of this run.
    pub duration_ms: u64,
}

impl ConversionStats {
    pub fn resumed(&self) -> bool {
        self.resumed_from_chunk > 0
    }
}
