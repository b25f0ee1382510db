//! # edgequake-pdf2epub
//!
//! Convert PDF documents to reflowable EPUB books through a multi-turn LLM
//! conversation.
//!
//! ## Why this crate?
//!
//! A PDF is a page-layout format: text comes out of it in fragments, split
//! across columns, running headers and hyphenated line ends. This crate
//! feeds the extracted text and images of the whole document to a language
//! model a few pages at a time, in a single conversation, then asks it to
//! write the finished book as one semantic XHTML document. That document is
//! packaged as an EPUB, with the images restored from the PDF.
//!
//! Long documents take many turns and hosted models enforce quotas, so the
//! conversation is **resumable**: after every chunk a session snapshot is
//! saved, and a rerun on the same file continues from the last acknowledged
//! chunk.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Input     read the file, check the %PDF magic, derive the session key
//!  ├─ 2. Plan      split pages into fixed-size chunks
//!  ├─ 3. Extract   page text + embedded images via pdfium (spawn_blocking)
//!  ├─ 4. Converse  one user/model turn per chunk, retried with backoff
//!  │                └─ session saved before and after every chunk
//!  ├─ 5. Finalize  one more turn: the whole book as {"html": "..."}
//!  └─ 6. Package   markup + images → XHTML, OPF, NCX, ZIP
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pdf2epub::{convert, ConversionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = ConversionConfig::default();
//!     // `true`: continue a stored session for this file if there is one
//!     let output = convert("book.pdf", &config, true).await?;
//!     std::fs::write("book.epub", &output.epub)?;
//!     eprintln!("{} chunks, {} images", output.stats.total_chunks, output.stats.images_packaged);
//!     Ok(())
//! }
//! ```
//!
//! [`Converter`] exposes the individual steps (for example to ask the user
//! before resuming) and accepts any [`ChatBackend`], [`SessionStore`] and
//! [`DocumentExtractor`](pipeline::extract::DocumentExtractor).
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2epub` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only deps:
//! ```toml
//! edgequake-pdf2epub = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod epub;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod session;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ConversionConfig, ConversionConfigBuilder};
pub use convert::{
    convert, convert_from_bytes, convert_to_file, reset_session, stored_session, write_output,
    Converter, ResumeDecision,
};
pub use epub::{package_epub, EpubArchive, PackageOptions};
pub use error::Pdf2EpubError;
pub use output::{ConversionOutput, ConversionStats};
pub use pipeline::input::{load_document, Document};
pub use pipeline::llm::{ChatBackend, ConversationClient, RetryPolicy};
pub use progress::{ConversionProgressCallback, NoopProgressCallback, Progress, ProgressCallback};
pub use session::{FileSessionStore, MemorySessionStore, Session, SessionStore};
