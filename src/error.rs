//! Error types for the edgequake-pdf2epub library.
//!
//! A single fatal error type, [`Pdf2EpubError`], covers every way a
//! conversion can stop. Some of those stops are final (bad input file, wrong
//! password) and some only pause the work: the session snapshot written at the
//! last durability boundary stays on disk, so rerunning the same conversion
//! resumes where it left off. [`Pdf2EpubError::is_resumable`] tells the two
//! apart and [`Pdf2EpubError::user_hint`] carries the advice shown to users.
//!
//! The conversation-service variants mirror how the client classifies a
//! failed call:
//!
//! | Variant | Retried by the client? | What the user should do |
//! |---------|------------------------|-------------------------|
//! | [`QuotaExceeded`](Pdf2EpubError::QuotaExceeded) | never | wait for the next quota period |
//! | [`RateLimited`](Pdf2EpubError::RateLimited) | yes, until attempts run out | wait a few minutes |
//! | [`TransientServer`](Pdf2EpubError::TransientServer) | yes, until attempts run out | retry now |
//! | [`MalformedResponse`](Pdf2EpubError::MalformedResponse) | no | retry; report if persistent |
//! | [`Unclassified`](Pdf2EpubError::Unclassified) | no | read the message |

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-pdf2epub library.
#[derive(Debug, Error)]
pub enum Pdf2EpubError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    /// The document declares zero pages; there is nothing to convert.
    #[error("Document '{name}' has no pages")]
    EmptyDocument { name: String },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{name}' is corrupt: {detail}")]
    CorruptPdf { name: String, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{name}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { name: String },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{name}'")]
    WrongPassword { name: String },

    /// Page number outside `1..=total`.
    #[error("Page {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: usize, total: usize },

    /// Text extraction failed for a page.
    #[error("Extraction failed for page {page}: {detail}")]
    ExtractionFailed { page: usize, detail: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
PDFium is normally downloaded automatically on first run.\n\
If the auto-download failed, you can:\n\
  • Check your internet connection and try again.\n\
  • Set PDFIUM_LIB_PATH=/path/to/libpdfium to use an existing copy.\n"
    )]
    PdfiumBindingFailed(String),

    // ── Conversation service errors ───────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// Daily or total quota is exhausted. Never retried by the client.
    #[error("Quota exceeded: {message}")]
    QuotaExceeded { message: String },

    /// Still rate limited after every allowed attempt.
    #[error("Rate limited after {attempts} attempts: {message}")]
    RateLimited { attempts: u32, message: String },

    /// 5xx, transport or unknown failure, still failing after every attempt.
    #[error("Service unavailable after {attempts} attempts: {message}")]
    TransientServer { attempts: u32, message: String },

    /// The final structured response did not have the expected shape.
    #[error("Malformed response from the model: {detail}")]
    MalformedResponse { detail: String },

    /// A service error that matches no known category.
    #[error("{message}")]
    Unclassified { message: String },

    // ── Session store errors ──────────────────────────────────────────────
    /// Reading, writing or deleting a session snapshot failed.
    #[error("Session store error for '{key}': {detail}")]
    SessionStore { key: String, detail: String },

    // ── Packaging errors ──────────────────────────────────────────────────
    /// The generated markup has no parseable document content.
    #[error("Generated markup could not be parsed: {detail}")]
    MalformedMarkup { detail: String },

    /// The EPUB container could not be assembled.
    #[error("EPUB packaging failed: {0}")]
    Packaging(String),

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output EPUB file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Pdf2EpubError {
    /// `true` when rerunning the same conversion will pick up from the saved
    /// session instead of starting over.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            Pdf2EpubError::QuotaExceeded { .. }
                | Pdf2EpubError::RateLimited { .. }
                | Pdf2EpubError::TransientServer { .. }
                | Pdf2EpubError::MalformedResponse { .. }
                | Pdf2EpubError::Unclassified { .. }
                | Pdf2EpubError::ExtractionFailed { .. }
        )
    }

    /// `true` for failures where an immediate retry is a reasonable offer.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Pdf2EpubError::TransientServer { .. } | Pdf2EpubError::MalformedResponse { .. }
        )
    }

    /// Advice to show next to the error message, if the category has any.
    pub fn user_hint(&self) -> Option<&'static str> {
        match self {
            Pdf2EpubError::QuotaExceeded { .. } => Some(
                "The service quota for this period is used up. Wait until it resets \
                 (usually the next day), then rerun to resume.",
            ),
            Pdf2EpubError::RateLimited { .. } => {
                Some("The service is rate limiting requests. Wait a few minutes, then rerun to resume.")
            }
            Pdf2EpubError::TransientServer { .. } => {
                Some("The service is temporarily unavailable. Retry now; progress has been saved.")
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_display() {
        let e = Pdf2EpubError::RateLimited {
            attempts: 7,
            message: "429 Too Many Requests".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("7 attempts"), "got: {msg}");
        assert!(msg.contains("429"), "got: {msg}");
    }

    #[test]
    fn unclassified_is_verbatim() {
        let e = Pdf2EpubError::Unclassified {
            message: "invalid argument: bad image".into(),
        };
        assert_eq!(e.to_string(), "invalid argument: bad image");
        assert!(e.user_hint().is_none());
    }

    #[test]
    fn hints_follow_category() {
        let quota = Pdf2EpubError::QuotaExceeded {
            message: "daily quota".into(),
        };
        assert!(quota.user_hint().unwrap().contains("resets"));
        assert!(quota.is_resumable());
        assert!(!quota.is_retriable());

        let transient = Pdf2EpubError::TransientServer {
            attempts: 7,
            message: "503".into(),
        };
        assert!(transient.is_retriable());
        assert!(transient.user_hint().unwrap().contains("Retry"));
    }

    #[test]
    fn input_errors_are_not_resumable() {
        let e = Pdf2EpubError::FileNotFound {
            path: PathBuf::from("/nope.pdf"),
        };
        assert!(!e.is_resumable());
    }
}
