//! Progress reporting: the callback trait and the percent/ETA estimator.
//!
//! Inject an [`Arc<dyn ConversionProgressCallback>`] via
//! [`crate::config::ConversionConfigBuilder::progress_callback`] to receive
//! events as the pipeline works through the document.
//!
//! # How the percentage is built
//!
//! | Share | Driven by |
//! |-------|-----------|
//! | 80 %  | pages extracted |
//! | 15 %  | chunks acknowledged by the service |
//! | 5 %   | finalize + packaging (jumps to 100 on completion) |
//!
//! The ETA divides the time spent *since this run started* by the pages
//! extracted *since this run started*. After a resume the pages processed by
//! an earlier run are excluded, so their (unknown) timing doesn't bias it.
//!
//! # Example
//!
//! ```rust
//! use edgequake_pdf2epub::{ConversionConfig, ConversionProgressCallback, Progress};
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! impl ConversionProgressCallback for Printer {
//!     fn on_progress(&self, p: &Progress) {
//!         eprintln!("{:.0}% (ETA {})", p.percent, p.eta_text);
//!     }
//! }
//!
//! let config = ConversionConfig::builder()
//!     .progress_callback(Arc::new(Printer))
//!     .build()
//!     .unwrap();
//! ```

use crate::pipeline::chunk::Chunk;
use std::sync::Arc;
use std::time::Duration;

const EXTRACTION_WEIGHT: f64 = 80.0;
const ACKNOWLEDGE_WEIGHT: f64 = 15.0;

/// Derived, never persisted view of how far a conversion has come.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    /// 0.0 – 100.0
    pub percent: f64,
    /// Human-readable remaining time, e.g. `"2m 05s"`.
    pub eta_text: String,
    /// Human-readable time since this run started.
    pub elapsed_text: String,
}

/// Called by the conversion pipeline as it moves through the document.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
pub trait ConversionProgressCallback: Send + Sync {
    /// Called once, after the page count is known.
    ///
    /// `resume_from_chunk` is 0 for a fresh conversion.
    fn on_conversion_start(&self, total_pages: usize, total_chunks: usize, resume_from_chunk: usize) {
        let _ = (total_pages, total_chunks, resume_from_chunk);
    }

    /// Called whenever the progress estimate changes.
    fn on_progress(&self, progress: &Progress) {
        let _ = progress;
    }

    /// Called when the service has acknowledged a chunk.
    fn on_chunk_acknowledged(&self, chunk: &Chunk, total_chunks: usize) {
        let _ = (chunk, total_chunks);
    }

    /// Called before the finalize turn is sent.
    fn on_finalize_start(&self) {}

    /// Called once the archive has been produced.
    fn on_conversion_complete(&self, epub_bytes: usize) {
        let _ = epub_bytes;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ConversionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ConversionConfig`].
pub type ProgressCallback = Arc<dyn ConversionProgressCallback>;

/// Percent/ETA estimator for one run of the pipeline.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total_pages: usize,
    total_chunks: usize,
    pages_at_start: usize,
    pages_extracted: usize,
    chunks_acknowledged: usize,
}

impl ProgressTracker {
    /// `pages_at_start` / `chunks_at_start` are the work already done by an
    /// earlier run (zero for a fresh conversion).
    pub fn new(
        total_pages: usize,
        total_chunks: usize,
        pages_at_start: usize,
        chunks_at_start: usize,
    ) -> Self {
        Self {
            total_pages,
            total_chunks,
            pages_at_start,
            pages_extracted: pages_at_start,
            chunks_acknowledged: chunks_at_start,
        }
    }

    pub fn page_extracted(&mut self) {
        self.pages_extracted = (self.pages_extracted + 1).min(self.total_pages);
    }

    pub fn chunk_acknowledged(&mut self) {
        self.chunks_acknowledged = (self.chunks_acknowledged + 1).min(self.total_chunks);
    }

    pub fn pages_extracted(&self) -> usize {
        self.pages_extracted
    }

    pub fn percent(&self) -> f64 {
        let pages = ratio(self.pages_extracted, self.total_pages);
        let chunks = ratio(self.chunks_acknowledged, self.total_chunks);
        (pages * EXTRACTION_WEIGHT + chunks * ACKNOWLEDGE_WEIGHT).min(100.0)
    }

    /// Remaining time, or `None` until this run has extracted a page.
    pub fn eta(&self, elapsed: Duration) -> Option<Duration> {
        let done = self.pages_extracted.saturating_sub(self.pages_at_start);
        if done == 0 {
            return None;
        }
        let remaining = self.total_pages.saturating_sub(self.pages_extracted);
        let per_page = elapsed.as_secs_f64() / done as f64;
        Some(Duration::from_secs_f64(per_page * remaining as f64))
    }

    /// The current view, given the time since this run started.
    pub fn snapshot(&self, elapsed: Duration) -> Progress {
        Progress {
            percent: self.percent(),
            eta_text: self
                .eta(elapsed)
                .map(format_duration)
                .unwrap_or_else(|| "calculating…".to_string()),
            elapsed_text: format_duration(elapsed),
        }
    }

    /// The view once finalize has started: everything but the last 5 %.
    pub fn finalizing(&self, elapsed: Duration) -> Progress {
        Progress {
            percent: EXTRACTION_WEIGHT + ACKNOWLEDGE_WEIGHT,
            eta_text: "finishing…".to_string(),
            elapsed_text: format_duration(elapsed),
        }
    }

    pub fn complete(&self, elapsed: Duration) -> Progress {
        Progress {
            percent: 100.0,
            eta_text: format_duration(Duration::ZERO),
            elapsed_text: format_duration(elapsed),
        }
    }
}

fn ratio(done: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        done as f64 / total as f64
    }
}

/// `"42s"`, `"3m 07s"`, `"1h 02m"`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60)
    }
}
