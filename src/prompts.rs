//! Prompts for the chunked PDF-to-EPUB conversation.
//!
//! The conversation has two phases. While chunks are streamed in, the model
//! only absorbs content and replies with a short acknowledgement. The final
//! turn asks it to turn everything it has seen into one XHTML document.
//!
//! Keeping every prompt here lets tests inspect them directly, and callers
//! can replace the system instruction via
//! [`crate::config::ConversionConfig::system_prompt`].

use crate::pipeline::chunk::Chunk;

/// Default system instruction for the whole conversation.
///
/// Used when `ConversionConfig::system_prompt` is `None`.
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = r#"You are an expert book typesetter converting a PDF into a reflowable EPUB.

The document arrives in several messages, a few pages at a time. Each page
starts with a delimiter line of the form "--- PAGE n ---" followed by the
text extracted from that page.

Images embedded in the PDF are attached to the message that contains their
page. Each one is announced in the text by a placeholder token of the form
[[IMAGE_n]], where n is the image's position in the whole document. A
page's placeholders follow its text, in the order the images were found on
that page; they do not mark a position inside the text.

While the document is being sent:
- Read and remember every page, in order.
- Do NOT summarise, convert or comment on the content yet.
- Reply with exactly: OK

When you are asked to produce the final document, follow the instructions
in that message precisely."#;

/// Reply the model is asked to give for every chunk.
pub const ACKNOWLEDGEMENT: &str = "OK";

/// The transformation contract sent as the final turn.
pub const FINALIZE_PROMPT: &str = r##"You have now received the complete document. Convert ALL of it into a single well-formed XHTML document for an EPUB reader.

Follow these rules precisely:

1. TEXT PRESERVATION
   - Preserve ALL text content completely and accurately, in reading order
   - Join lines and words that were broken by the PDF layout
   - Drop page numbers, running headers and footers repeated on every page

2. STRUCTURE
   - Use semantic markup: <h1>-<h4>, <p>, <ul>/<ol>/<li>, <table>, <blockquote>, <pre>, <code>, <em>, <strong>
   - Put the book title in <title> inside <head>
   - Give every chapter and section heading a unique id attribute

3. TABLE OF CONTENTS
   - Start <body> with <nav id="toc"><ol>...</ol></nav>
   - One <li><a href="#heading-id">Heading text</a></li> per chapter or section heading, in document order

4. IMAGES
   - Replace every [[IMAGE_n]] placeholder with <img src="[[IMAGE_n]]" alt="short description"/>
   - Keep the placeholder text exactly as given inside src
   - Place each image within its page's content, next to the text it illustrates

5. LAYOUT
   - Single-column, reflowable layout
   - No fixed widths, absolute positioning, inline styles or scripts

6. OUTPUT FORMAT
   - Respond with a JSON object with exactly one string field: {"html": "<!DOCTYPE html>..."}
   - Do NOT wrap the JSON in code fences
   - Do NOT add commentary or explanations"##;

/// Placeholder token for the image at `index` in the document-wide sequence.
pub fn placeholder_token(index: usize) -> String {
    format!("[[IMAGE_{}]]", index)
}

/// Delimiter line that opens page `page` inside a chunk.
pub fn page_delimiter(page: usize) -> String {
    format!("--- PAGE {} ---", page)
}

/// Header line that introduces a chunk's pages.
pub fn chunk_header(chunk: &Chunk, total_pages: usize) -> String {
    format!(
        "Pages {}-{} of {}. Remember them and reply with {}.",
        chunk.start_page, chunk.end_page, total_pages, ACKNOWLEDGEMENT
    )
}

/// Assemble the user message for one chunk from its already delimited page
/// bodies.
pub fn chunk_message(chunk: &Chunk, total_pages: usize, body: &str) -> String {
    format!("{}\n\n{}", chunk_header(chunk, total_pages), body.trim_end())
}
