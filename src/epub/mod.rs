//! Archive packaging: generated markup + extracted images → EPUB bytes.
//!
//! ## Layout
//!
//! ```text
//! mimetype                  (first entry, stored, "application/epub+zip")
//! META-INF/container.xml
//! OEBPS/content.opf         package document (metadata, manifest, spine)
//! OEBPS/toc.ncx             navigation from the markup's table of contents
//! OEBPS/style.css
//! OEBPS/content.xhtml       the whole book as one document
//! OEBPS/images/imageN.ext   N = 1, 2, ... in order of first reference
//! ```
//!
//! The package identifier is a UUID v5 of the markup, so the same markup
//! and images always produce byte-identical archives.

pub mod markup;
pub mod package;

use crate::error::Pdf2EpubError;
use crate::pipeline::encode::ExtractedImage;
use markup::{ImageRegistry, CONTENT_HREF};
use package::{NavPoint, PackageContents};
use tracing::{debug, info};
use uuid::Uuid;

/// Title used when neither the markup nor the caller provides one.
pub const FALLBACK_TITLE: &str = "Untitled";

/// Metadata the markup itself cannot supply.
#[derive(Debug, Clone)]
pub struct PackageOptions {
    /// Used when the markup has no non-empty `<title>`.
    pub default_title: String,
    /// BCP 47 language tag, e.g. `"en"`.
    pub language: String,
}

impl Default for PackageOptions {
    fn default() -> Self {
        Self {
            default_title: FALLBACK_TITLE.to_string(),
            language: "en".to_string(),
        }
    }
}

/// A finished EPUB.
#[derive(Debug, Clone)]
pub struct EpubArchive {
    pub bytes: Vec<u8>,
    pub title: String,
    /// Image files written under `OEBPS/images/`.
    pub image_count: usize,
    pub nav_points: Vec<NavPoint>,
}

/// Build an EPUB from the final markup and the document's image sequence.
///
/// `images` is the sequence `[[IMAGE_n]]` placeholders index into.
pub fn package_epub(
    markup: &str,
    images: &[ExtractedImage],
    options: &PackageOptions,
) -> Result<EpubArchive, Pdf2EpubError> {
    let dom = markup::parse_markup(markup)?;

    let title = markup::document_title(&dom).unwrap_or_else(|| {
        let fallback = options.default_title.trim();
        if fallback.is_empty() {
            FALLBACK_TITLE.to_string()
        } else {
            fallback.to_string()
        }
    });

    let mut nav_points: Vec<NavPoint> = markup::toc_links(&dom).into_iter().map(NavPoint::from).collect();
    if nav_points.is_empty() {
        debug!("Markup has no table of contents, using a single entry");
        nav_points.push(NavPoint {
            label: title.clone(),
            href: CONTENT_HREF.to_string(),
        });
    }

    let mut registry = ImageRegistry::new(images);
    let xhtml = markup::write_xhtml(&dom, &title, &options.language, &mut registry);
    let files = registry.into_files();

    let identifier = format!(
        "urn:uuid:{}",
        Uuid::new_v5(&Uuid::NAMESPACE_OID, markup.as_bytes())
    );

    let bytes = package::write_archive(&PackageContents {
        identifier: &identifier,
        title: &title,
        language: &options.language,
        xhtml: &xhtml,
        images: &files,
        nav_points: &nav_points,
    })
    .map_err(|e| Pdf2EpubError::Packaging(e.to_string()))?;

    info!(
        "Packaged '{}': {} bytes, {} images, {} navigation entries",
        title,
        bytes.len(),
        files.len(),
        nav_points.len()
    );

    Ok(EpubArchive {
        bytes,
        title,
        image_count: files.len(),
        nav_points,
    })
}
