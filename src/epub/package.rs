//! EPUB 2 container writing: OPF package document, NCX table of contents,
//! stylesheet and the ZIP archive itself.

use super::markup::{ImageFile, TocLink, CONTENT_HREF, STYLESHEET_HREF};
use std::io::{Cursor, Write};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const MIMETYPE: &str = "application/epub+zip";

pub const CONTAINER_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;

/// Single-column, reflowable defaults. Readers override most of it.
pub const STYLESHEET: &str = r#"body {
  margin: 0 5%;
  line-height: 1.5;
  text-align: justify;
  hyphens: auto;
}
h1, h2, h3, h4 {
  line-height: 1.2;
  text-align: left;
  page-break-after: avoid;
}
h1 { font-size: 1.6em; margin: 1.5em 0 0.8em; page-break-before: always; }
h2 { font-size: 1.3em; margin: 1.2em 0 0.6em; }
h3 { font-size: 1.1em; margin: 1em 0 0.5em; }
p { margin: 0 0 0.8em; }
img { max-width: 100%; height: auto; display: block; margin: 1em auto; }
figure { margin: 1em 0; text-align: center; }
figcaption { font-size: 0.9em; font-style: italic; }
table { border-collapse: collapse; margin: 1em 0; max-width: 100%; }
th, td { border: 1px solid #999; padding: 0.3em 0.5em; }
pre, code { font-family: monospace; font-size: 0.9em; }
pre { white-space: pre-wrap; }
blockquote { margin: 1em 2em; font-style: italic; }
nav#toc ol { list-style: none; padding-left: 1em; }
"#;

/// One navPoint of the NCX.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavPoint {
    pub label: String,
    pub href: String,
}

impl From<TocLink> for NavPoint {
    fn from(link: TocLink) -> Self {
        Self {
            label: link.label,
            href: link.href,
        }
    }
}

/// Everything the container needs besides the XHTML itself.
pub struct PackageContents<'a> {
    pub identifier: &'a str,
    pub title: &'a str,
    pub language: &'a str,
    pub xhtml: &'a str,
    pub images: &'a [ImageFile],
    pub nav_points: &'a [NavPoint],
}

/// Write the EPUB archive into memory.
pub fn write_archive(contents: &PackageContents<'_>) -> zip::result::ZipResult<Vec<u8>> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));

    let options_stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    let options_deflate =
        SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    // mimetype must be first and uncompressed
    zip.start_file("mimetype", options_stored)?;
    zip.write_all(MIMETYPE.as_bytes())?;

    zip.start_file("META-INF/container.xml", options_deflate)?;
    zip.write_all(CONTAINER_XML.as_bytes())?;

    zip.start_file("OEBPS/content.opf", options_deflate)?;
    zip.write_all(generate_opf(contents).as_bytes())?;

    zip.start_file("OEBPS/toc.ncx", options_deflate)?;
    zip.write_all(generate_ncx(contents).as_bytes())?;

    zip.start_file(format!("OEBPS/{STYLESHEET_HREF}"), options_deflate)?;
    zip.write_all(STYLESHEET.as_bytes())?;

    zip.start_file(format!("OEBPS/{CONTENT_HREF}"), options_deflate)?;
    zip.write_all(contents.xhtml.as_bytes())?;

    // Already-compressed formats gain nothing from deflate.
    for image in contents.images {
        zip.start_file(format!("OEBPS/{}", image.href()), options_stored)?;
        zip.write_all(&image.data)?;
    }

    Ok(zip.finish()?.into_inner())
}

pub fn generate_opf(contents: &PackageContents<'_>) -> String {
    let mut opf = String::new();

    opf.push_str(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="2.0" unique-identifier="BookId">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:opf="http://www.idpf.org/2007/opf">
"#,
    );
    opf.push_str(&format!(
        "    <dc:title>{}</dc:title>\n",
        escape_xml(contents.title)
    ));
    opf.push_str(&format!(
        "    <dc:identifier id=\"BookId\">{}</dc:identifier>\n",
        escape_xml(contents.identifier)
    ));
    opf.push_str(&format!(
        "    <dc:language>{}</dc:language>\n",
        escape_xml(contents.language)
    ));
    opf.push_str(&format!(
        "    <meta name=\"generator\" content=\"edgequake-pdf2epub {}\"/>\n",
        env!("CARGO_PKG_VERSION")
    ));

    opf.push_str("  </metadata>\n  <manifest>\n");
    opf.push_str(
        "    <item id=\"ncx\" href=\"toc.ncx\" media-type=\"application/x-dtbncx+xml\"/>\n",
    );
    opf.push_str(&format!(
        "    <item id=\"css\" href=\"{STYLESHEET_HREF}\" media-type=\"text/css\"/>\n"
    ));
    opf.push_str(&format!(
        "    <item id=\"content\" href=\"{CONTENT_HREF}\" media-type=\"application/xhtml+xml\"/>\n"
    ));
    for image in contents.images {
        opf.push_str(&format!(
            "    <item id=\"image{}\" href=\"{}\" media-type=\"{}\"/>\n",
            image.number,
            escape_xml(&image.href()),
            escape_xml(&image.media_type)
        ));
    }

    opf.push_str("  </manifest>\n  <spine toc=\"ncx\">\n");
    opf.push_str("    <itemref idref=\"content\"/>\n");
    opf.push_str("  </spine>\n</package>\n");
    opf
}

pub fn generate_ncx(contents: &PackageContents<'_>) -> String {
    let mut ncx = String::new();

    ncx.push_str(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE ncx PUBLIC "-//NISO//DTD ncx 2005-1//EN" "http://www.daisy.org/z3986/2005/ncx-2005-1.dtd">
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
  <head>
    <meta name="dtb:uid" content=""#,
    );
    ncx.push_str(&escape_xml(contents.identifier));
    ncx.push_str(
        r#""/>
    <meta name="dtb:depth" content="1"/>
    <meta name="dtb:totalPageCount" content="0"/>
    <meta name="dtb:maxPageNumber" content="0"/>
  </head>
  <docTitle>
    <text>"#,
    );
    ncx.push_str(&escape_xml(contents.title));
    ncx.push_str(
        r#"</text>
  </docTitle>
  <navMap>
"#,
    );

    for (i, point) in contents.nav_points.iter().enumerate() {
        let play_order = i + 1;
        ncx.push_str(&format!(
            "    <navPoint id=\"navpoint-{play_order}\" playOrder=\"{play_order}\">\n"
        ));
        ncx.push_str(&format!(
            "      <navLabel>\n        <text>{}</text>\n      </navLabel>\n",
            escape_xml(&point.label)
        ));
        ncx.push_str(&format!(
            "      <content src=\"{}\"/>\n",
            escape_xml(&point.href)
        ));
        ncx.push_str("    </navPoint>\n");
    }

    ncx.push_str("  </navMap>\n</ncx>\n");
    ncx
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contents<'a>(images: &'a [ImageFile], nav: &'a [NavPoint]) -> PackageContents<'a> {
        PackageContents {
            identifier: "urn:uuid:0000",
            title: "Tom & Jerry",
            language: "fr",
            xhtml: "<html/>",
            images,
            nav_points: nav,
        }
    }

    #[test]
    fn opf_lists_every_file() {
        let images = vec![ImageFile {
            number: 1,
            media_type: "image/jpeg".into(),
            data: vec![1],
        }];
        let opf = generate_opf(&contents(&images, &[]));
        assert!(opf.contains("<dc:title>Tom &amp; Jerry</dc:title>"));
        assert!(opf.contains("<dc:language>fr</dc:language>"));
        assert!(opf.contains(r#"<item id="image1" href="images/image1.jpg" media-type="image/jpeg"/>"#));
        assert!(opf.contains(r#"<itemref idref="content"/>"#));
    }

    #[test]
    fn ncx_play_order_is_one_based() {
        let nav = vec![
            NavPoint { label: "A".into(), href: "content.xhtml#a".into() },
            NavPoint { label: "B <2>".into(), href: "content.xhtml#b".into() },
        ];
        let ncx = generate_ncx(&contents(&[], &nav));
        assert!(ncx.contains(r#"<navPoint id="navpoint-1" playOrder="1">"#));
        assert!(ncx.contains(r#"<navPoint id="navpoint-2" playOrder="2">"#));
        assert!(ncx.contains("<text>B &lt;2&gt;</text>"));
        assert!(ncx.contains(r#"<meta name="dtb:uid" content="urn:uuid:0000"/>"#));
    }
}
