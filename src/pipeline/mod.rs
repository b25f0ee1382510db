//! Pipeline stages for PDF-to-EPUB conversion.
//!
//! Each submodule implements exactly one step. Keeping stages separate makes
//! each independently testable and lets us swap implementations (e.g. the PDF
//! backend or the chat service) without touching the orchestrator.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ chunk ──▶ extract ──▶ encode ──▶ llm ──▶ postprocess
//! (path)    (ranges)  (pdfium)    (PNG b64)  (chat)  (cleanup)
//! ```
//!
//! 1. [`input`]   validate and read the PDF into a [`input::Document`]
//! 2. [`chunk`]   split the page range into fixed-size chunks
//! 3. [`extract`] page text and embedded images; runs in `spawn_blocking`
//!    because pdfium is not async-safe
//! 4. [`encode`]  normalise image pixels to RGBA and PNG/base64 them
//! 5. [`llm`]     the multi-turn conversation with retry/backoff; the only
//!    stage with network I/O
//! 6. [`postprocess`] deterministic cleanup of the final JSON response

pub mod chunk;
pub mod encode;
pub mod extract;
pub mod input;
pub mod llm;
pub mod postprocess;
