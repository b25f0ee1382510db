//! Generated-markup handling: parse, inspect and re-serialise as XHTML.
//!
//! The model's HTML is parsed with html5ever into an `RcDom`, which repairs
//! unbalanced tags the way a browser would. The tree is then written back
//! out by a small XHTML serialiser that, in the same pass:
//!
//! - replaces the `<title>` with the resolved book title,
//! - links the package stylesheet from `<head>`,
//! - rewrites inline `data:` images and `[[IMAGE_n]]` placeholders (as `src`
//!   or as bare text) to files under `images/`,
//! - drops scripts, comments and image references that cannot be resolved.

use crate::error::Pdf2EpubError;
use crate::pipeline::encode::ExtractedImage;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use html5ever::parse_document;
use html5ever::tendril::TendrilSink;
use html5ever::{namespace_url, ns, ParseOpts, QualName};
use markup5ever_rcdom::{Handle, NodeData, RcDom};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use tracing::warn;

/// Name of the content document inside the package.
pub const CONTENT_HREF: &str = "content.xhtml";

/// Name of the stylesheet inside the package.
pub const STYLESHEET_HREF: &str = "style.css";

const XHTML_NS: &str = "http://www.w3.org/1999/xhtml";
const SVG_NS: &str = "http://www.w3.org/2000/svg";
const XLINK_NS: &str = "http://www.w3.org/1999/xlink";

static RE_PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[\[IMAGE_(\d+)\]\]").unwrap());

static RE_DATA_URI: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^data:([A-Za-z0-9.+/-]+)(?:;[^,]*)?;base64,(.*)$").unwrap());

/// Parse generated markup.
///
/// Fails with [`Pdf2EpubError::MalformedMarkup`] when the body ends up with
/// no content at all.
pub fn parse_markup(markup: &str) -> Result<RcDom, Pdf2EpubError> {
    if markup.trim().is_empty() {
        return Err(Pdf2EpubError::MalformedMarkup {
            detail: "markup is empty".into(),
        });
    }

    let dom = parse_document(RcDom::default(), ParseOpts::default())
        .from_utf8()
        .one(markup.as_bytes());

    let has_content = find_first_element(&dom.document, "body")
        .map(|body| has_visible_content(&body))
        .unwrap_or(false);
    if !has_content {
        return Err(Pdf2EpubError::MalformedMarkup {
            detail: "document body has no content".into(),
        });
    }
    Ok(dom)
}

fn has_visible_content(handle: &Handle) -> bool {
    handle.children.borrow().iter().any(|child| match child.data {
        NodeData::Element { .. } => true,
        NodeData::Text { ref contents } => !contents.borrow().trim().is_empty(),
        _ => false,
    })
}

/// Find the first element with the given local name.
pub fn find_first_element(handle: &Handle, name: &str) -> Option<Handle> {
    if let NodeData::Element { name: ref qname, .. } = handle.data {
        if qname.local.as_ref() == name {
            return Some(handle.clone());
        }
    }

    for child in handle.children.borrow().iter() {
        if let Some(found) = find_first_element(child, name) {
            return Some(found);
        }
    }

    None
}

fn find_element_with_id(handle: &Handle, id: &str) -> Option<Handle> {
    if matches!(handle.data, NodeData::Element { .. }) && get_attribute(handle, "id").as_deref() == Some(id) {
        return Some(handle.clone());
    }
    for child in handle.children.borrow().iter() {
        if let Some(found) = find_element_with_id(child, id) {
            return Some(found);
        }
    }
    None
}

fn find_elements_by_name(handle: &Handle, name: &str, results: &mut Vec<Handle>) {
    if let NodeData::Element { name: ref qname, .. } = handle.data {
        if qname.local.as_ref() == name {
            results.push(handle.clone());
        }
    }
    for child in handle.children.borrow().iter() {
        find_elements_by_name(child, name, results);
    }
}

fn get_attribute(handle: &Handle, attr_name: &str) -> Option<String> {
    if let NodeData::Element { ref attrs, .. } = handle.data {
        for attr in attrs.borrow().iter() {
            if attr.name.local.as_ref() == attr_name {
                return Some(attr.value.to_string());
            }
        }
    }
    None
}

/// Text content of a node with runs of whitespace collapsed.
pub fn text_content(handle: &Handle) -> String {
    let mut text = String::new();
    collect_text(handle, &mut text);
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn collect_text(handle: &Handle, text: &mut String) {
    match handle.data {
        NodeData::Text { ref contents } => text.push_str(&contents.borrow()),
        NodeData::Element { .. } | NodeData::Document => {
            for child in handle.children.borrow().iter() {
                collect_text(child, text);
            }
        }
        _ => {}
    }
}

/// The document's own `<title>`, if non-empty.
pub fn document_title(dom: &RcDom) -> Option<String> {
    find_first_element(&dom.document, "title")
        .map(|t| text_content(&t))
        .filter(|t| !t.is_empty())
}

/// One table-of-contents link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TocLink {
    pub label: String,
    /// Target inside the package, e.g. `content.xhtml#chapter-1`.
    pub href: String,
}

/// Links of the document's table of contents: the anchors inside the
/// element with `id="toc"`, else inside the first `<nav>`, in list order.
pub fn toc_links(dom: &RcDom) -> Vec<TocLink> {
    let Some(container) = find_element_with_id(&dom.document, "toc")
        .or_else(|| find_first_element(&dom.document, "nav"))
    else {
        return Vec::new();
    };

    let mut anchors = Vec::new();
    find_elements_by_name(&container, "a", &mut anchors);
    anchors
        .iter()
        .filter_map(|a| {
            let href = get_attribute(a, "href")?;
            let href = href.trim();
            let label = text_content(a);
            if href.is_empty() || label.is_empty() {
                return None;
            }
            let target = match href.strip_prefix('#') {
                Some(fragment) if !fragment.is_empty() => format!("{CONTENT_HREF}#{fragment}"),
                Some(_) => CONTENT_HREF.to_string(),
                None => href.to_string(),
            };
            Some(TocLink {
                label,
                href: target,
            })
        })
        .collect()
}

// ── Image files ───────────────────────────────────────────────────────────

/// An image written into the package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFile {
    /// 1-based, in order of first reference.
    pub number: usize,
    pub media_type: String,
    pub data: Vec<u8>,
}

impl ImageFile {
    /// Path relative to the content document, e.g. `images/image3.png`.
    pub fn href(&self) -> String {
        format!("images/image{}.{}", self.number, extension_for(&self.media_type))
    }
}

/// File extension for a supported image media type.
pub fn extension_for(media_type: &str) -> &'static str {
    match media_type {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/svg+xml" => "svg",
        "image/webp" => "webp",
        _ => "png",
    }
}

fn is_supported_media_type(media_type: &str) -> bool {
    matches!(
        media_type,
        "image/png" | "image/jpeg" | "image/jpg" | "image/gif" | "image/svg+xml" | "image/webp"
    )
}

/// Assigns package files to image references as the serialiser meets them.
///
/// Numbers are handed out in order of first reference. A placeholder index
/// referenced more than once maps to the same file; each inline `data:`
/// image gets its own.
pub struct ImageRegistry<'a> {
    collected: &'a [ExtractedImage],
    files: Vec<ImageFile>,
    by_placeholder: HashMap<usize, usize>,
}

impl<'a> ImageRegistry<'a> {
    pub fn new(collected: &'a [ExtractedImage]) -> Self {
        Self {
            collected,
            files: Vec::new(),
            by_placeholder: HashMap::new(),
        }
    }

    pub fn into_files(self) -> Vec<ImageFile> {
        self.files
    }

    /// Package href for an `<img src>` value, or `None` when it cannot be
    /// resolved. Ordinary relative or remote URLs are returned unchanged.
    pub fn resolve_src(&mut self, src: &str) -> Option<String> {
        let src = src.trim();
        if let Some(caps) = RE_PLACEHOLDER.captures(src) {
            return caps[1].parse().ok().and_then(|i| self.resolve_placeholder(i));
        }
        if src.starts_with("data:") {
            return self.resolve_data_uri(src);
        }
        if src.is_empty() {
            return None;
        }
        Some(src.to_string())
    }

    /// Package href for the collected image at `index`.
    pub fn resolve_placeholder(&mut self, index: usize) -> Option<String> {
        if let Some(&pos) = self.by_placeholder.get(&index) {
            return Some(self.files[pos].href());
        }
        let Some(image) = self.collected.get(index) else {
            warn!(
                "Dropping reference to image {} ({} images were extracted)",
                index,
                self.collected.len()
            );
            return None;
        };
        let pos = self.push(&image.mime_type, &image.data, &format!("image {index}"))?;
        self.by_placeholder.insert(index, pos);
        Some(self.files[pos].href())
    }

    fn resolve_data_uri(&mut self, src: &str) -> Option<String> {
        let Some(caps) = RE_DATA_URI.captures(src) else {
            warn!("Dropping inline image that is not a base64 data URI");
            return None;
        };
        let media_type = caps[1].to_ascii_lowercase();
        let pos = self.push(&media_type, &caps[2], "inline image")?;
        Some(self.files[pos].href())
    }

    fn push(&mut self, media_type: &str, b64: &str, what: &str) -> Option<usize> {
        if !is_supported_media_type(media_type) {
            warn!("Dropping {} with unsupported media type '{}'", what, media_type);
            return None;
        }
        let compact: String = b64.chars().filter(|c| !c.is_whitespace()).collect();
        let data = match STANDARD.decode(compact.as_bytes()) {
            Ok(d) if !d.is_empty() => d,
            Ok(_) => {
                warn!("Dropping {}: empty payload", what);
                return None;
            }
            Err(e) => {
                warn!("Dropping {}: invalid base64: {}", what, e);
                return None;
            }
        };
        let media_type = if media_type == "image/jpg" {
            "image/jpeg".to_string()
        } else {
            media_type.to_string()
        };
        self.files.push(ImageFile {
            number: self.files.len() + 1,
            media_type,
            data,
        });
        Some(self.files.len() - 1)
    }
}

// ── XHTML serialisation ───────────────────────────────────────────────────

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

const SKIPPED_ELEMENTS: &[&str] = &["script", "noscript", "title"];

/// Write `dom` as a standalone XHTML document.
pub fn write_xhtml(dom: &RcDom, title: &str, language: &str, registry: &mut ImageRegistry<'_>) -> String {
    let mut writer = XhtmlWriter {
        out: String::with_capacity(4096),
        title,
        language,
        registry,
    };
    writer.out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<!DOCTYPE html>\n");
    writer.children(&dom.document, false);
    writer.out.push('\n');
    writer.out
}

struct XhtmlWriter<'w, 'a> {
    out: String,
    title: &'w str,
    language: &'w str,
    registry: &'w mut ImageRegistry<'a>,
}

impl XhtmlWriter<'_, '_> {
    fn children(&mut self, handle: &Handle, in_svg: bool) {
        for child in handle.children.borrow().iter() {
            self.node(child, in_svg);
        }
    }

    fn node(&mut self, handle: &Handle, in_svg: bool) {
        match handle.data {
            NodeData::Document => self.children(handle, in_svg),
            NodeData::Text { ref contents } => {
                let text = contents.borrow();
                self.text(&text);
            }
            NodeData::Element {
                ref name,
                ref attrs,
                ..
            } => {
                let local = name.local.as_ref();
                if name.ns == ns!(html) && SKIPPED_ELEMENTS.contains(&local) {
                    return;
                }

                let mut attributes: Vec<(String, String)> = attrs
                    .borrow()
                    .iter()
                    .filter(|a| !a.name.local.as_ref().starts_with("on"))
                    .map(|a| (attribute_name(&a.name), a.value.to_string()))
                    .filter(|(k, _)| !is_namespace_declaration(k))
                    .collect();

                let svg_root = name.ns == ns!(svg) && !in_svg;
                if local == "html" && name.ns == ns!(html) {
                    attributes.retain(|(k, _)| k != "lang" && k != "xml:lang");
                    attributes.insert(0, ("xmlns".into(), XHTML_NS.into()));
                    attributes.push(("lang".into(), self.language.into()));
                    attributes.push(("xml:lang".into(), self.language.into()));
                } else if svg_root {
                    attributes.insert(0, ("xmlns".into(), SVG_NS.into()));
                    attributes.insert(1, ("xmlns:xlink".into(), XLINK_NS.into()));
                }

                if local == "img" && name.ns == ns!(html) {
                    let src = attributes.iter().find(|(k, _)| k == "src").map(|(_, v)| v.clone());
                    let Some(href) = src.and_then(|s| self.registry.resolve_src(&s)) else {
                        return;
                    };
                    attributes.retain(|(k, _)| k != "src" && k != "srcset");
                    attributes.insert(0, ("src".into(), href));
                    if !attributes.iter().any(|(k, _)| k == "alt") {
                        attributes.push(("alt".into(), String::new()));
                    }
                }

                if local == "link" && get_attribute(handle, "href").as_deref() == Some(STYLESHEET_HREF) {
                    return;
                }

                let tag = qualified_tag(name);
                self.open_tag(&tag, &attributes);

                if name.ns == ns!(html) && VOID_ELEMENTS.contains(&local) {
                    self.out.push_str("/>");
                    return;
                }
                self.out.push('>');

                if local == "head" && name.ns == ns!(html) {
                    self.out.push_str("<title>");
                    self.out.push_str(&escape_text(self.title));
                    self.out.push_str("</title>");
                    self.out.push_str(&format!(
                        "<link rel=\"stylesheet\" type=\"text/css\" href=\"{STYLESHEET_HREF}\"/>"
                    ));
                }

                self.children(handle, in_svg || name.ns == ns!(svg));
                self.out.push_str("</");
                self.out.push_str(&tag);
                self.out.push('>');
            }
            // Doctype is written by the prologue; comments and
            // processing instructions are dropped.
            NodeData::Doctype { .. } | NodeData::Comment { .. } | NodeData::ProcessingInstruction { .. } => {}
        }
    }

    fn open_tag(&mut self, tag: &str, attributes: &[(String, String)]) {
        self.out.push('<');
        self.out.push_str(tag);
        for (key, value) in attributes {
            self.out.push(' ');
            self.out.push_str(key);
            self.out.push_str("=\"");
            self.out.push_str(&escape_attribute(value));
            self.out.push('"');
        }
    }

    /// Escape text, turning bare placeholder tokens into image elements.
    fn text(&mut self, text: &str) {
        let mut last = 0;
        for caps in RE_PLACEHOLDER.captures_iter(text) {
            let Some(whole) = caps.get(0) else { continue };
            self.out.push_str(&escape_text(&text[last..whole.start()]));
            last = whole.end();

            if let Some(href) = caps[1].parse().ok().and_then(|i| self.registry.resolve_placeholder(i)) {
                self.out.push_str(&format!("<img src=\"{}\" alt=\"\"/>", escape_attribute(&href)));
            }
        }
        self.out.push_str(&escape_text(&text[last..]));
    }
}

fn qualified_tag(name: &QualName) -> String {
    match name.prefix {
        Some(ref prefix) => format!("{}:{}", prefix.as_ref(), name.local.as_ref()),
        None => name.local.as_ref().to_string(),
    }
}

fn attribute_name(name: &QualName) -> String {
    if name.ns == ns!(xlink) {
        return format!("xlink:{}", name.local.as_ref());
    }
    if name.ns == ns!(xml) {
        return format!("xml:{}", name.local.as_ref());
    }
    qualified_tag(name)
}

/// Namespaces are declared by the writer itself, once per root.
fn is_namespace_declaration(key: &str) -> bool {
    key == "xmlns" || key.starts_with("xmlns:")
}

fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn escape_attribute(s: &str) -> String {
    escape_text(s).replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png(data: &str) -> ExtractedImage {
        ExtractedImage {
            mime_type: "image/png".into(),
            data: data.into(),
        }
    }

    fn render(markup: &str, images: &[ExtractedImage]) -> (String, Vec<ImageFile>) {
        let dom = parse_markup(markup).unwrap();
        let mut registry = ImageRegistry::new(images);
        let xhtml = write_xhtml(&dom, "Book", "en", &mut registry);
        (xhtml, registry.into_files())
    }

    #[test]
    fn title_comes_from_title_element() {
        let dom = parse_markup("<html><head><title> My  Book </title></head><body><p>x</p></body></html>").unwrap();
        assert_eq!(document_title(&dom).as_deref(), Some("My Book"));
        let dom = parse_markup("<p>no title</p>").unwrap();
        assert_eq!(document_title(&dom), None);
    }

    #[test]
    fn empty_body_is_malformed() {
        assert!(matches!(parse_markup(""), Err(Pdf2EpubError::MalformedMarkup { .. })));
        assert!(matches!(
            parse_markup("<html><head><title>t</title></head><body>  </body></html>"),
            Err(Pdf2EpubError::MalformedMarkup { .. })
        ));
    }

    #[test]
    fn output_is_xhtml_with_title_and_stylesheet() {
        let (xhtml, _) = render("<p>a<br>b &amp; c<hr></p><!-- note --><script>x()</script>", &[]);
        assert!(xhtml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<!DOCTYPE html>"));
        assert!(xhtml.contains("<html xmlns=\"http://www.w3.org/1999/xhtml\" lang=\"en\" xml:lang=\"en\">"));
        assert!(xhtml.contains("<title>Book</title><link rel=\"stylesheet\" type=\"text/css\" href=\"style.css\"/>"));
        assert!(xhtml.contains("a<br/>b &amp; c"));
        assert!(!xhtml.contains("note"));
        assert!(!xhtml.contains("<script"));
        assert_eq!(xhtml.matches("<title>").count(), 1);
    }

    #[test]
    fn placeholders_in_src_and_text_share_files() {
        let images = vec![png("iVBORw0KGgo="), png("AAAA")];
        let (xhtml, files) = render(
            "<p><img src=\"[[IMAGE_1]]\" alt=\"chart\"> see [[IMAGE_1]] and [[IMAGE_0]]</p>",
            &images,
        );
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].href(), "images/image1.png");
        assert_eq!(files[0].data, vec![0, 0, 0]);
        assert!(xhtml.contains("<img src=\"images/image1.png\" alt=\"chart\"/>"));
        assert!(xhtml.contains("see <img src=\"images/image1.png\" alt=\"\"/> and <img src=\"images/image2.png\" alt=\"\"/>"));
    }

    #[test]
    fn data_uris_become_files() {
        let (xhtml, files) = render(
            "<img src=\"data:image/jpeg;base64,/9j/4AAQ\"><img src=\"data:image/png;base64,iVBORw0KGgo=\">",
            &[],
        );
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].href(), "images/image1.jpg");
        assert_eq!(files[1].media_type, "image/png");
        assert!(!xhtml.contains("base64"));
    }

    #[test]
    fn unresolvable_images_are_dropped() {
        let (xhtml, files) = render(
            "<p>[[IMAGE_9]]<img src=\"[[IMAGE_5]]\"><img src=\"data:image/png;base64,@@@\"><img></p>",
            &[png("AAAA")],
        );
        assert!(files.is_empty());
        assert!(!xhtml.contains("<img"));
        assert!(!xhtml.contains("IMAGE_"));
    }

    #[test]
    fn remote_images_are_kept() {
        let (xhtml, files) = render("<img src=\"cover.png\">", &[]);
        assert!(files.is_empty());
        assert!(xhtml.contains("<img src=\"cover.png\" alt=\"\"/>"));
    }

    #[test]
    fn toc_links_from_toc_container() {
        let dom = parse_markup(
            "<body><nav id=\"toc\"><ol><li><a href=\"#c1\">One</a></li><li><a href=\"#c2\"> Two  </a></li><li><a href=\"\">x</a></li></ol></nav><h1 id=\"c1\">One</h1></body>",
        )
        .unwrap();
        let links = toc_links(&dom);
        assert_eq!(
            links,
            vec![
                TocLink { label: "One".into(), href: "content.xhtml#c1".into() },
                TocLink { label: "Two".into(), href: "content.xhtml#c2".into() },
            ]
        );
    }

    #[test]
    fn no_toc_yields_no_links() {
        let dom = parse_markup("<h1>Alone</h1><a href=\"#x\">x</a>").unwrap();
        assert!(toc_links(&dom).is_empty());
    }

    #[test]
    fn svg_gets_its_namespace() {
        let (xhtml, _) = render("<p><svg viewBox=\"0 0 1 1\"><rect width=\"1\"></rect></svg></p>", &[]);
        assert!(xhtml.contains("<svg xmlns=\"http://www.w3.org/2000/svg\""));
        assert!(xhtml.contains("<rect width=\"1\"></rect>"));
    }

    #[test]
    fn svg_namespace_declarations_are_not_duplicated() {
        let source = concat!(
            "<p><svg xmlns=\"http://www.w3.org/2000/svg\" ",
            "xmlns:xlink=\"http://www.w3.org/1999/xlink\" viewBox=\"0 0 1 1\">",
            "<use xlink:href=\"#dot\"></use></svg></p>"
        );
        let (xhtml, _) = render(source, &[]);
        assert_eq!(xhtml.matches("xmlns:xlink=").count(), 1);
        assert_eq!(xhtml.matches("xmlns=\"http://www.w3.org/2000/svg\"").count(), 1);
        assert!(xhtml.contains("<use xlink:href=\"#dot\"></use>"));
    }
}
