//! Conversion orchestration: the resumable chunk loop and its entry points.
//!
//! ## The durability boundary
//!
//! For every chunk `i` the orchestrator
//!
//! 1. extracts the chunk's pages (text + images),
//! 2. saves a session with `currentChunk = i`,
//! 3. submits the chunk,
//! 4. saves a session with `currentChunk = i + 1`.
//!
//! The snapshot in step 2 carries the image sequence as it was *before* the
//! chunk was extracted, so a run that resumes at `i` extracts the same pages
//! again and their images land on the same indices (and placeholders).
//!
//! Any failure propagates. The orchestrator never retries; the conversation
//! client already did, and the last saved snapshot lets the user resume.

use crate::config::ConversionConfig;
use crate::epub::{self, PackageOptions};
use crate::error::Pdf2EpubError;
use crate::output::{ConversionOutput, ConversionStats};
use crate::pipeline::chunk::{pages_before_chunk, plan_chunks, Chunk};
use crate::pipeline::encode::{encode_raster, ExtractedImage};
use crate::pipeline::extract::{DocumentExtractor, PdfiumExtractor};
use crate::pipeline::input::{self, Document};
use crate::pipeline::llm::{resolve_provider, ChatBackend, ConversationClient, LlmBackend};
use crate::progress::{ProgressCallback, ProgressTracker};
use crate::prompts::{chunk_message, page_delimiter, placeholder_token};
use crate::session::{FileSessionStore, Session, SessionStore};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Where a conversion starts.
#[derive(Debug, Clone)]
pub enum ResumeDecision {
    /// Continue from a stored session, usually one returned by
    /// [`Converter::check_resume`].
    Resume(Session),
    /// Discard any stored session and start from the first chunk.
    StartOver,
}

/// Drives one document through extraction, the conversation and packaging.
pub struct Converter {
    extractor: Arc<dyn DocumentExtractor>,
    client: ConversationClient,
    store: Arc<dyn SessionStore>,
    config: ConversionConfig,
}

impl Converter {
    pub fn new(
        extractor: Arc<dyn DocumentExtractor>,
        backend: Arc<dyn ChatBackend>,
        store: Arc<dyn SessionStore>,
        config: ConversionConfig,
    ) -> Self {
        let client = ConversationClient::from_config(backend, &config);
        Self {
            extractor,
            client,
            store,
            config,
        }
    }

    /// Production wiring: pdfium extraction, the configured LLM provider
    /// and a file-backed session store.
    pub fn from_config(document: &Document, config: &ConversionConfig) -> Result<Self, Pdf2EpubError> {
        let extractor = PdfiumExtractor::new(
            document.name(),
            Arc::clone(document.bytes()),
            config.password.clone(),
        );
        let provider = resolve_provider(config)?;
        debug!(
            "Provider resolved (requested provider={:?}, model={:?})",
            config.provider_name, config.model
        );
        let backend = LlmBackend::new(provider, config);
        let store = open_store(config)?;
        Ok(Self::new(
            Arc::new(extractor),
            Arc::new(backend),
            Arc::new(store),
            config.clone(),
        ))
    }

    /// A stored session for `document` that can be resumed, if any.
    ///
    /// A session is offered only when its page count matches the document and
    /// its chunk position and history fit the chunk plan. Anything else is
    /// deleted and reported as absent.
    pub async fn check_resume(&self, document: &Document) -> Result<Option<Session>, Pdf2EpubError> {
        let key = document.session_key();
        let Some(session) = self.store.load(&key)? else {
            return Ok(None);
        };

        let total_pages = self.extractor.page_count().await?;
        let num_chunks = plan_chunks(total_pages, self.config.chunk_size).len();
        match session_problem(&session, total_pages, self.config.chunk_size, num_chunks) {
            None => {
                info!(
                    "Found session for '{}' at chunk {}/{}",
                    document.name(),
                    session.next_chunk_index,
                    num_chunks
                );
                Ok(Some(session))
            }
            Some(problem) => {
                warn!("Discarding session '{}': {}", key, problem);
                self.store.delete(&key)?;
                Ok(None)
            }
        }
    }

    /// Delete the stored session for `document`.
    pub fn reset(&self, document: &Document) -> Result<(), Pdf2EpubError> {
        self.store.delete(&document.session_key())
    }

    /// Convert `document`, starting where `decision` says.
    pub async fn convert(
        &self,
        document: &Document,
        decision: ResumeDecision,
    ) -> Result<ConversionOutput, Pdf2EpubError> {
        let run_start = Instant::now();
        let key = document.session_key();
        let chunk_size = self.config.chunk_size;

        let total_pages = self.extractor.page_count().await?;
        if total_pages == 0 {
            return Err(Pdf2EpubError::EmptyDocument {
                name: document.name().to_string(),
            });
        }
        let chunks = plan_chunks(total_pages, chunk_size);

        let (start_chunk, mut images, prior) = match decision {
            ResumeDecision::Resume(session) => {
                if let Some(problem) = session_problem(&session, total_pages, chunk_size, chunks.len()) {
                    return Err(Pdf2EpubError::InvalidConfig(format!(
                        "session for '{}' cannot be resumed: {}",
                        document.name(),
                        problem
                    )));
                }
                info!(
                    "Resuming '{}' at chunk {}/{}",
                    document.name(),
                    session.next_chunk_index + 1,
                    chunks.len()
                );
                (session.next_chunk_index, session.images, Some(session.conversation))
            }
            ResumeDecision::StartOver => {
                self.store.delete(&key)?;
                info!(
                    "Converting '{}': {} pages in {} chunks",
                    document.name(),
                    total_pages,
                    chunks.len()
                );
                (0, Vec::new(), None)
            }
        };

        let callback = self.config.progress_callback.as_ref();
        if let Some(cb) = callback {
            cb.on_conversion_start(total_pages, chunks.len(), start_chunk);
        }

        let mut tracker = ProgressTracker::new(
            total_pages,
            chunks.len(),
            pages_before_chunk(start_chunk, chunk_size, total_pages),
            start_chunk,
        );
        let mut conversation = self.client.start(prior);

        let remaining = &chunks[start_chunk..];
        for (n, chunk) in remaining.iter().enumerate() {
            let images_before = images.len();
            let text = self
                .extract_chunk(chunk, total_pages, &mut images, &mut tracker, callback, run_start)
                .await?;

            self.store.save(
                &key,
                &Session {
                    next_chunk_index: chunk.index,
                    total_pages,
                    chunk_size,
                    conversation: conversation.state().clone(),
                    images: images[..images_before].to_vec(),
                },
            )?;

            self.client
                .submit_chunk(&mut conversation, &text, &images[images_before..], chunk)
                .await?;
            tracker.chunk_acknowledged();

            self.store.save(
                &key,
                &Session {
                    next_chunk_index: chunk.index + 1,
                    total_pages,
                    chunk_size,
                    conversation: conversation.state().clone(),
                    images: images.clone(),
                },
            )?;
            info!(
                "Chunk {}/{} acknowledged (pages {}-{})",
                chunk.index + 1,
                chunks.len(),
                chunk.start_page,
                chunk.end_page
            );
            if let Some(cb) = callback {
                cb.on_chunk_acknowledged(chunk, chunks.len());
                cb.on_progress(&tracker.snapshot(run_start.elapsed()));
            }

            if n + 1 < remaining.len() && !self.config.throttle().is_zero() {
                debug!("Throttling for {}ms", self.config.throttle_ms);
                tokio::time::sleep(self.config.throttle()).await;
            }
        }

        if let Some(cb) = callback {
            cb.on_finalize_start();
            cb.on_progress(&tracker.finalizing(run_start.elapsed()));
        }
        info!("All chunks acknowledged, requesting the final document");
        let markup = self.client.finalize(&conversation).await?;

        let options = PackageOptions {
            default_title: self.default_title(document).await,
            language: self.config.language.clone(),
        };
        let archive = epub::package_epub(&markup, &images, &options)?;

        self.store.delete(&key)?;

        if let Some(cb) = callback {
            cb.on_progress(&tracker.complete(run_start.elapsed()));
            cb.on_conversion_complete(archive.bytes.len());
        }

        let stats = ConversionStats {
            total_pages,
            total_chunks: chunks.len(),
            resumed_from_chunk: start_chunk,
            chunks_submitted: remaining.len(),
            images_extracted: images.len(),
            images_packaged: archive.image_count,
            epub_bytes: archive.bytes.len(),
            duration_ms: run_start.elapsed().as_millis() as u64,
        };
        info!(
            "Conversion complete: '{}', {} bytes, {}ms",
            archive.title, stats.epub_bytes, stats.duration_ms
        );

        Ok(ConversionOutput {
            epub: archive.bytes,
            title: archive.title,
            markup,
            stats,
        })
    }

    /// Extract every page of `chunk` and build its message text.
    ///
    /// The chunk's pages are extracted in one batch. New images are appended
    /// to `images` page by page, only once the whole batch has succeeded.
    /// A page's placeholders are listed after its text.
    async fn extract_chunk(
        &self,
        chunk: &Chunk,
        total_pages: usize,
        images: &mut Vec<ExtractedImage>,
        tracker: &mut ProgressTracker,
        callback: Option<&ProgressCallback>,
        run_start: Instant,
    ) -> Result<String, Pdf2EpubError> {
        let mut body = String::new();
        let contents = self.extractor.extract_pages(chunk.pages()).await?;
        if contents.len() != chunk.page_count() {
            return Err(Pdf2EpubError::Internal(format!(
                "extractor returned {} pages for pages {}-{}",
                contents.len(),
                chunk.start_page,
                chunk.end_page
            )));
        }

        for (page, content) in chunk.pages().zip(contents) {
            let mut page_images = Vec::with_capacity(content.images.len());
            for (i, raster) in content.images.iter().enumerate() {
                match encode_raster(raster) {
                    Ok(image) => page_images.push(image),
                    Err(e) => warn!("Page {}: skipping image {}: {}", page, i + 1, e),
                }
            }

            body.push_str(&page_delimiter(page));
            body.push('\n');
            body.push_str(content.text.trim_end());
            body.push('\n');
            for offset in 0..page_images.len() {
                body.push_str(&placeholder_token(images.len() + offset));
                body.push('\n');
            }
            body.push('\n');
            images.extend(page_images);

            tracker.page_extracted();
            if let Some(cb) = callback {
                cb.on_progress(&tracker.snapshot(run_start.elapsed()));
            }
        }

        Ok(chunk_message(chunk, total_pages, &body))
    }

    async fn default_title(&self, document: &Document) -> String {
        if let Some(ref title) = self.config.default_title {
            return title.clone();
        }
        match self.extractor.title().await {
            Ok(Some(title)) => title,
            Ok(None) => document.stem().to_string(),
            Err(e) => {
                debug!("Could not read document title: {}", e);
                document.stem().to_string()
            }
        }
    }
}

/// Why `session` cannot be resumed against a plan of `num_chunks` chunks.
fn session_problem(
    session: &Session,
    total_pages: usize,
    chunk_size: usize,
    num_chunks: usize,
) -> Option<String> {
    if session.total_pages != total_pages {
        return Some(format!(
            "it was made for {} pages, the document has {}",
            session.total_pages, total_pages
        ));
    }
    if session.chunk_size != chunk_size {
        return Some(format!(
            "it was made with {} pages per chunk, the configuration has {}",
            session.chunk_size, chunk_size
        ));
    }
    if session.next_chunk_index > num_chunks {
        return Some(format!(
            "it is at chunk {} of a {}-chunk plan",
            session.next_chunk_index, num_chunks
        ));
    }
    if session.conversation.len() != session.next_chunk_index * 2 {
        return Some(format!(
            "its history has {} turns for {} chunks",
            session.conversation.len(),
            session.next_chunk_index
        ));
    }
    None
}

/// The file-backed session store `config` points at.
pub fn open_store(config: &ConversionConfig) -> Result<FileSessionStore, Pdf2EpubError> {
    let dir = match config.session_dir {
        Some(ref dir) => dir.clone(),
        None => FileSessionStore::default_dir()?,
    };
    Ok(FileSessionStore::new(dir))
}

/// Convert a PDF file to EPUB.
///
/// With `resume`, a well-formed stored session for the same file (same name
/// and size) is continued; otherwise the conversion starts over.
///
/// # Example
/// ```rust,no_run
/// use edgequake_pdf2epub::{convert, ConversionConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ConversionConfig::default();
/// let output = convert("book.pdf", &config, true).await?;
/// std::fs::write("book.epub", &output.epub)?;
/// # Ok(())
/// # }
/// ```
pub async fn convert(
    input_path: impl AsRef<Path>,
    config: &ConversionConfig,
    resume: bool,
) -> Result<ConversionOutput, Pdf2EpubError> {
    let document = input::load_document(input_path)?;
    convert_document(&document, config, resume).await
}

/// Convert PDF bytes held in memory. `name` is the session identity
/// together with the byte size.
pub async fn convert_from_bytes(
    name: impl Into<String>,
    bytes: Vec<u8>,
    config: &ConversionConfig,
    resume: bool,
) -> Result<ConversionOutput, Pdf2EpubError> {
    let document = input::document_from_bytes(name, bytes)?;
    convert_document(&document, config, resume).await
}

async fn convert_document(
    document: &Document,
    config: &ConversionConfig,
    resume: bool,
) -> Result<ConversionOutput, Pdf2EpubError> {
    let converter = Converter::from_config(document, config)?;
    let decision = if resume {
        match converter.check_resume(document).await? {
            Some(session) => ResumeDecision::Resume(session),
            None => ResumeDecision::StartOver,
        }
    } else {
        ResumeDecision::StartOver
    };
    converter.convert(document, decision).await
}

/// Convert a PDF and write the EPUB directly to a file.
///
/// Uses atomic write (temp file + rename) to prevent partial files.
pub async fn convert_to_file(
    input_path: impl AsRef<Path>,
    output_path: impl AsRef<Path>,
    config: &ConversionConfig,
    resume: bool,
) -> Result<ConversionStats, Pdf2EpubError> {
    let output = convert(input_path, config, resume).await?;
    write_output(output_path.as_ref(), &output.epub).await?;
    Ok(output.stats)
}

/// Write `bytes` to `path` atomically.
pub async fn write_output(path: &Path, bytes: &[u8]) -> Result<(), Pdf2EpubError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Pdf2EpubError::OutputWriteFailed {
                path: path.to_path_buf(),
                source: e,
            })?;
    }

    let tmp_path = path.with_extension("epub.tmp");
    tokio::fs::write(&tmp_path, bytes)
        .await
        .map_err(|e| Pdf2EpubError::OutputWriteFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Pdf2EpubError::OutputWriteFailed {
            path: path.to_path_buf(),
            source: e,
        })
}

/// Delete the stored session for a PDF file. Needs no provider.
pub fn reset_session(input_path: impl AsRef<Path>, config: &ConversionConfig) -> Result<(), Pdf2EpubError> {
    let document = input::load_document(input_path)?;
    open_store(config)?.delete(&document.session_key())
}

/// The stored session for a PDF file, without validating it against the
/// document's page count.
pub fn stored_session(
    input_path: impl AsRef<Path>,
    config: &ConversionConfig,
) -> Result<Option<Session>, Pdf2EpubError> {
    let document = input::load_document(input_path)?;
    open_store(config)?.load(&document.session_key())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::llm::{ConversationState, Part, Turn};

    fn session(next: usize, pages: usize, turns: usize) -> Session {
        let mut history = Vec::new();
        for _ in 0..turns / 2 {
            history.push(Turn::user(vec![Part::text("p")]));
            history.push(Turn::model("OK"));
        }
        Session {
            next_chunk_index: next,
            total_pages: pages,
            chunk_size: 5,
            conversation: ConversationState::from_turns(history),
            images: vec![],
        }
    }

    #[test]
    fn well_formed_sessions_pass() {
        assert_eq!(session_problem(&session(0, 12, 0), 12, 5, 3), None);
        assert_eq!(session_problem(&session(3, 12, 6), 12, 5, 3), None);
    }

    #[test]
    fn page_count_mismatch_is_rejected() {
        assert!(session_problem(&session(1, 10, 2), 12, 5, 3).is_some());
    }

    #[test]
    fn chunk_beyond_plan_is_rejected() {
        assert!(session_problem(&session(4, 12, 8), 12, 5, 3).is_some());
    }

    #[test]
    fn history_must_match_chunk_position() {
        assert!(session_problem(&session(2, 12, 2), 12, 5, 3).is_some());
    }

    #[test]
    fn chunk_size_change_is_rejected() {
        // 12 pages make 3 chunks at both 5 and 4 pages per chunk.
        let problem = session_problem(&session(1, 12, 2), 12, 4, 3).unwrap();
        assert!(problem.contains("5 pages per chunk"), "{problem}");
    }

    #[tokio::test]
    async fn write_output_is_atomic() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out").join("book.epub");
        write_output(&path, b"PK").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"PK");
        assert!(!path.with_extension("epub.tmp").exists());
    }
}
