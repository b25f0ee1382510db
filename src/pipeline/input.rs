//! Input resolution: turn a user-supplied path into an in-memory [`Document`].
//!
//! The file is validated and read once up front. Every later stage works on
//! the same bytes, so the session identity (name + byte size) cannot drift
//! between the resume check and the conversion. We check the PDF magic bytes
//! (`%PDF`) before returning so callers get a meaningful error rather than a
//! pdfium failure.

use crate::error::Pdf2EpubError;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Prefix of every session identity key.
pub const SESSION_KEY_PREFIX: &str = "epub-session";

/// An immutable input document.
#[derive(Debug, Clone)]
pub struct Document {
    name: String,
    bytes: Arc<[u8]>,
}

impl Document {
    pub fn new(name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bytes(&self) -> &Arc<[u8]> {
        &self.bytes
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// `epub-session-<name>-<size>`: the key its session is stored under.
    pub fn session_key(&self) -> String {
        format!("{}-{}-{}", SESSION_KEY_PREFIX, self.name, self.size())
    }

    /// File stem of the name, used for default output and title.
    pub fn stem(&self) -> &str {
        Path::new(&self.name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.name)
    }
}

/// Validate and read a local PDF.
pub fn load_document(path: impl AsRef<Path>) -> Result<Document, Pdf2EpubError> {
    let path = path.as_ref();
    let path_buf = PathBuf::from(path);

    if !path.exists() {
        return Err(Pdf2EpubError::FileNotFound { path: path_buf });
    }

    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            return Err(Pdf2EpubError::PermissionDenied { path: path_buf });
        }
        Err(_) => return Err(Pdf2EpubError::FileNotFound { path: path_buf }),
    };

    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).map_err(|e| match e.kind() {
        ErrorKind::PermissionDenied => Pdf2EpubError::PermissionDenied {
            path: path_buf.clone(),
        },
        _ => Pdf2EpubError::Internal(format!("Failed to read '{}': {}", path.display(), e)),
    })?;

    check_magic(&bytes, &path_buf)?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document.pdf".to_string());

    debug!("Loaded PDF '{}' ({} bytes)", name, bytes.len());
    Ok(Document::new(name, bytes))
}

/// Wrap bytes that did not come from the file system.
pub fn document_from_bytes(
    name: impl Into<String>,
    bytes: Vec<u8>,
) -> Result<Document, Pdf2EpubError> {
    let name = name.into();
    check_magic(&bytes, Path::new(&name))?;
    Ok(Document::new(name, bytes))
}

fn check_magic(bytes: &[u8], path: &Path) -> Result<(), Pdf2EpubError> {
    let mut magic = [0u8; 4];
    let n = bytes.len().min(4);
    magic[..n].copy_from_slice(&bytes[..n]);
    if &magic != b"%PDF" {
        return Err(Pdf2EpubError::NotAPdf {
            path: path.to_path_buf(),
            magic,
        });
    }
    Ok(())
}
