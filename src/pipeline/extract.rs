//! Document extraction: page count, page text and embedded page images.
//!
//! The pipeline only talks to the [`DocumentExtractor`] trait, so the PDF
//! backend can be swapped (or faked in tests) without touching the
//! orchestrator. [`PdfiumExtractor`] is the production implementation.
//!
//! ## Why spawn_blocking?
//!
//! pdfium is a C++ library with thread-local state and is not safe to call
//! from async contexts. Every call moves onto tokio's blocking pool, loads the
//! document from the in-memory bytes, does its work and drops the handle again,
//! so no pdfium object ever crosses an `.await`. The orchestrator asks for a
//! whole chunk at a time through [`DocumentExtractor::extract_pages`], so the
//! library is bound and the document parsed once per chunk.

use crate::error::Pdf2EpubError;
use async_trait::async_trait;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tracing::{debug, warn};

/// Raw pixels of one embedded image as the PDF stored them.
///
/// `pixels` holds 1 (gray), 3 (RGB) or 4 (RGBA) bytes per pixel, row-major.
/// Buffers of any other length are still accepted downstream, see
/// [`crate::pipeline::encode::normalize_to_rgba`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// Everything extracted from one page, in discovery order.
///
/// Text and images are separate: an image's place within the text is not
/// recovered, so callers list a page's images after its text.
#[derive(Debug, Clone, Default)]
pub struct PageContent {
    pub text: String,
    pub images: Vec<RasterImage>,
}

/// Turns a page number into its text and raster images.
///
/// Page numbers are 1-based.
#[async_trait]
pub trait DocumentExtractor: Send + Sync {
    async fn page_count(&self) -> Result<usize, Pdf2EpubError>;

    async fn page_text(&self, page: usize) -> Result<String, Pdf2EpubError>;

    /// Images that fail to decode are skipped, not reported as errors.
    async fn page_images(&self, page: usize) -> Result<Vec<RasterImage>, Pdf2EpubError>;

    /// Text and images of one page. Backends that can do both in a single
    /// pass should override this.
    async fn extract_page(&self, page: usize) -> Result<PageContent, Pdf2EpubError> {
        let text = self.page_text(page).await?;
        let images = self.page_images(page).await?;
        Ok(PageContent { text, images })
    }

    /// Pages `pages`, in order. The first failing page fails the batch.
    async fn extract_pages(
        &self,
        pages: RangeInclusive<usize>,
    ) -> Result<Vec<PageContent>, Pdf2EpubError> {
        let mut contents = Vec::with_capacity(pages.clone().count());
        for page in pages {
            contents.push(self.extract_page(page).await?);
        }
        Ok(contents)
    }

    /// Title from the document's own metadata, if it declares one.
    async fn title(&self) -> Result<Option<String>, Pdf2EpubError> {
        Ok(None)
    }
}

/// [`DocumentExtractor`] backed by pdfium-render.
#[derive(Clone)]
pub struct PdfiumExtractor {
    name: String,
    bytes: Arc<[u8]>,
    password: Option<String>,
}

impl PdfiumExtractor {
    pub fn new(name: impl Into<String>, bytes: Arc<[u8]>, password: Option<String>) -> Self {
        Self {
            name: name.into(),
            bytes,
            password,
        }
    }

    async fn blocking<T, F>(&self, work: F) -> Result<T, Pdf2EpubError>
    where
        T: Send + 'static,
        F: FnOnce(&PdfDocument<'_>) -> Result<T, Pdf2EpubError> + Send + 'static,
    {
        let bytes = Arc::clone(&self.bytes);
        let name = self.name.clone();
        let password = self.password.clone();

        tokio::task::spawn_blocking(move || {
            let pdfium = pdfium_auto::bind_pdfium_silent()
                .map_err(|e| Pdf2EpubError::PdfiumBindingFailed(e.to_string()))?;
            let document = pdfium
                .load_pdf_from_byte_slice(&bytes, password.as_deref())
                .map_err(|e| map_load_error(&name, password.is_some(), e))?;
            work(&document)
        })
        .await
        .map_err(|e| Pdf2EpubError::Internal(format!("Extraction task panicked: {}", e)))?
    }
}

#[async_trait]
impl DocumentExtractor for PdfiumExtractor {
    async fn page_count(&self) -> Result<usize, Pdf2EpubError> {
        self.blocking(|doc| Ok(doc.pages().len() as usize)).await
    }

    async fn page_text(&self, page: usize) -> Result<String, Pdf2EpubError> {
        self.blocking(move |doc| {
            let pdf_page = load_page(doc, page)?;
            page_text_blocking(&pdf_page, page)
        })
        .await
    }

    async fn page_images(&self, page: usize) -> Result<Vec<RasterImage>, Pdf2EpubError> {
        self.blocking(move |doc| {
            let pdf_page = load_page(doc, page)?;
            Ok(page_images_blocking(&pdf_page, page))
        })
        .await
    }

    async fn extract_page(&self, page: usize) -> Result<PageContent, Pdf2EpubError> {
        self.blocking(move |doc| page_content_blocking(doc, page)).await
    }

    async fn extract_pages(
        &self,
        pages: RangeInclusive<usize>,
    ) -> Result<Vec<PageContent>, Pdf2EpubError> {
        self.blocking(move |doc| pages.map(|page| page_content_blocking(doc, page)).collect())
            .await
    }

    async fn title(&self) -> Result<Option<String>, Pdf2EpubError> {
        self.blocking(|doc| {
            Ok(doc
                .metadata()
                .get(PdfDocumentMetadataTagType::Title)
                .map(|tag| tag.value().trim().to_string())
                .filter(|v| !v.is_empty()))
        })
        .await
    }
}

fn map_load_error(name: &str, had_password: bool, e: PdfiumError) -> Pdf2EpubError {
    let err_str = format!("{:?}", e);
    if err_str.contains("Password") || err_str.contains("password") {
        if had_password {
            Pdf2EpubError::WrongPassword {
                name: name.to_string(),
            }
        } else {
            Pdf2EpubError::PasswordRequired {
                name: name.to_string(),
            }
        }
    } else {
        Pdf2EpubError::CorruptPdf {
            name: name.to_string(),
            detail: err_str,
        }
    }
}

fn load_page<'a>(doc: &PdfDocument<'a>, page: usize) -> Result<PdfPage<'a>, Pdf2EpubError> {
    let total = doc.pages().len() as usize;
    if page == 0 || page > total {
        return Err(Pdf2EpubError::PageOutOfRange { page, total });
    }
    let index = u16::try_from(page - 1)
        .map_err(|_| Pdf2EpubError::PageOutOfRange { page, total })?;
    doc.pages()
        .get(index)
        .map_err(|e| Pdf2EpubError::ExtractionFailed {
            page,
            detail: format!("{:?}", e),
        })
}

fn page_content_blocking(doc: &PdfDocument<'_>, page: usize) -> Result<PageContent, Pdf2EpubError> {
    let pdf_page = load_page(doc, page)?;
    let text = page_text_blocking(&pdf_page, page)?;
    let images = page_images_blocking(&pdf_page, page);
    debug!(
        "Extracted page {}: {} chars, {} images",
        page,
        text.len(),
        images.len()
    );
    Ok(PageContent { text, images })
}

fn page_text_blocking(pdf_page: &PdfPage<'_>, page: usize) -> Result<String, Pdf2EpubError> {
    pdf_page
        .text()
        .map(|t| t.all())
        .map_err(|e| Pdf2EpubError::ExtractionFailed {
            page,
            detail: format!("text layer: {:?}", e),
        })
}

fn page_images_blocking(pdf_page: &PdfPage<'_>, page: usize) -> Vec<RasterImage> {
    let mut images = Vec::new();
    for object in pdf_page.objects().iter() {
        let Some(image_object) = object.as_image_object() else {
            continue;
        };
        match image_object.get_raw_image() {
            Ok(img) => images.push(raster_from_dynamic(img)),
            Err(e) => warn!("Page {}: skipping undecodable image: {:?}", page, e),
        }
    }
    images
}

/// Keep 1/3/4-channel 8-bit images as they are; anything else becomes RGBA.
pub(crate) fn raster_from_dynamic(img: DynamicImage) -> RasterImage {
    let (width, height) = (img.width(), img.height());
    let pixels = match img {
        DynamicImage::ImageLuma8(buf) => buf.into_raw(),
        DynamicImage::ImageRgb8(buf) => buf.into_raw(),
        DynamicImage::ImageRgba8(buf) => buf.into_raw(),
        other => other.to_rgba8().into_raw(),
    };
    RasterImage {
        width,
        height,
        pixels,
    }
}
