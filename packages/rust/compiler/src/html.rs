//! Single-pass serialization of the IR to self-contained HTML.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use folio_shared::PageSpec;

use crate::assets::PreparedImage;
use crate::ir::{Block, BlockContent, Document, PageBox, TRUNCATION_MARKER};

const BASE_CSS: &str = "\
* { box-sizing: border-box; }
html, body { margin: 0; padding: 0; }
body { font-family: Georgia, 'Times New Roman', serif; color: #111; }
.page { position: relative; overflow: visible; break-after: page; page-break-after: always; }
.page:last-child { break-after: auto; page-break-after: auto; }
h1, h2, h3, h4 { margin: 0 0 0.5em 0; line-height: 1.2; }
p { margin: 0 0 0.6em 0; line-height: 1.4; overflow-wrap: break-word; }
blockquote.epigraph { margin: 0 0 1em 0; font-style: italic; line-height: 1.4; }
pre { margin: 0 0 0.8em 0; padding: 4pt 0; line-height: 1.35; overflow: hidden; white-space: pre; font-family: 'DejaVu Sans Mono', monospace; }
img { display: block; margin: 0 0 0.8em 0; }
.truncation-marker, .elision { color: #666; }
.elision { font-style: italic; }
";

/// Format a point value compactly (`54`, `10.5`, `7.65`).
pub(crate) fn num(value: f64) -> String {
    let s = format!("{value:.2}");
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

pub(crate) fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Serialize the document. Writing into a `String` cannot fail, so the
/// `fmt::Result`s below are discarded.
pub(crate) fn serialize(
    doc: &Document,
    images: &BTreeMap<String, PreparedImage>,
    spec: &PageSpec,
    generation: u32,
) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "<!DOCTYPE html>");
    let _ = writeln!(out, "<html lang=\"en\">");
    let _ = writeln!(out, "<head>");
    let _ = writeln!(out, "<meta charset=\"utf-8\">");
    let _ = writeln!(out, "<meta name=\"generator\" content=\"folio\">");
    let _ = writeln!(out, "<title>{}</title>", escape(&doc.title));
    let _ = writeln!(
        out,
        "<style>\n@page {{ size: {}in {}in; margin: 0; }}\n{BASE_CSS}</style>",
        num(spec.trim.width_in),
        num(spec.trim.height_in),
    );
    let _ = writeln!(out, "</head>");
    let _ = writeln!(
        out,
        "<body data-generation=\"{generation}\" data-pages=\"{}\">",
        doc.pages.len()
    );

    for page in &doc.pages {
        write_page(&mut out, page, images);
    }

    let _ = writeln!(out, "</body>");
    let _ = writeln!(out, "</html>");
    out
}

fn write_page(out: &mut String, page: &PageBox, images: &BTreeMap<String, PreparedImage>) {
    let s = &page.style;
    let [top, right, bottom, left] = s.padding_pt;
    let margins = format!("{} {} {} {}", num(top), num(right), num(bottom), num(left));

    let _ = writeln!(
        out,
        "<section class=\"page\" data-page=\"{}\" data-role=\"{}\" data-width-pt=\"{}\" \
         data-height-pt=\"{}\" data-margins-pt=\"{margins}\" data-font-pt=\"{}\" style=\"width:{}pt;height:{}pt;\
         padding:{}pt {}pt {}pt {}pt;font-size:{}pt\">",
        page.index,
        page.role.as_str(),
        num(s.width_pt),
        num(s.height_pt),
        num(s.font_size_pt),
        num(s.width_pt),
        num(s.height_pt),
        num(top),
        num(right),
        num(bottom),
        num(left),
        num(s.font_size_pt),
    );
    for block in &page.blocks {
        write_block(out, block, images);
    }
    let _ = writeln!(out, "</section>");
}

fn font_attrs(block: &Block) -> String {
    match block.style.font_size_pt {
        Some(size) => format!(
            " data-font-pt=\"{}\" style=\"font-size:{}pt\"",
            num(size),
            num(size)
        ),
        None => String::new(),
    }
}

fn write_block(out: &mut String, block: &Block, images: &BTreeMap<String, PreparedImage>) {
    let id = &block.descriptor;
    let kind = block.kind().as_str();

    match &block.content {
        BlockContent::Heading { level, text } => {
            let level = (*level).clamp(1, 4);
            let _ = writeln!(
                out,
                "<h{level} data-el=\"{id}\" data-kind=\"{kind}\"{}>{}</h{level}>",
                font_attrs(block),
                escape(text)
            );
        }
        BlockContent::Paragraph { text, truncated } => {
            let mut chars = text.chars().count();
            let mut marker = String::new();
            let mut flag = "";
            if *truncated {
                chars += TRUNCATION_MARKER.chars().count();
                marker = format!(
                    "<span class=\"truncation-marker\">{}</span>",
                    TRUNCATION_MARKER
                );
                flag = " data-truncated=\"true\"";
            }
            let _ = writeln!(
                out,
                "<p data-el=\"{id}\" data-kind=\"{kind}\" data-chars=\"{chars}\"{flag}{}>{}{marker}</p>",
                font_attrs(block),
                escape(text)
            );
        }
        BlockContent::Epigraph { text } => {
            let _ = writeln!(
                out,
                "<blockquote class=\"epigraph\" data-el=\"{id}\" data-kind=\"{kind}\" \
                 data-chars=\"{}\"{}>{}</blockquote>",
                text.chars().count(),
                font_attrs(block),
                escape(text)
            );
        }
        BlockContent::Code {
            language,
            lines,
            elided_lines,
        } => {
            let shown = lines.len() + usize::from(*elided_lines > 0);
            let font = block.style.font_size_pt.unwrap_or_default();
            let max_height = block.style.max_height_pt.unwrap_or_default();
            let clipped = if *elided_lines > 0 {
                format!(" data-elided=\"{elided_lines}\"")
            } else {
                String::new()
            };
            let class = language
                .as_deref()
                .map(|l| format!(" class=\"language-{}\"", escape(l)))
                .unwrap_or_default();

            let _ = write!(
                out,
                "<pre data-el=\"{id}\" data-kind=\"{kind}\" data-lines=\"{shown}\" \
                 data-font-pt=\"{}\" data-max-height-pt=\"{}\"{clipped} \
                 style=\"font-size:{}pt;max-height:{}pt\"><code{class}>",
                num(font),
                num(max_height),
                num(font),
                num(max_height),
            );
            for (i, line) in lines.iter().enumerate() {
                if i > 0 {
                    out.push('\n');
                }
                out.push_str(&escape(line));
            }
            if *elided_lines > 0 {
                if !lines.is_empty() {
                    out.push('\n');
                }
                let _ = write!(
                    out,
                    "<span class=\"elision\">\u{2026} {elided_lines} more lines</span>"
                );
            }
            let _ = writeln!(out, "</code></pre>");
        }
        BlockContent::Image {
            asset,
            alt,
            natural_width_px,
            natural_height_px,
        } => {
            // Resolution already happened; an unknown asset cannot reach here.
            let Some(image) = images.get(asset) else {
                return;
            };
            let width = block.style.width_pt.unwrap_or_default();
            let height = block.style.height_pt.unwrap_or_default();
            let max_px = block.style.max_dimension_px.unwrap_or_default();
            let _ = writeln!(
                out,
                "<img data-el=\"{id}\" data-kind=\"{kind}\" data-asset=\"{}\" \
                 data-natural-width=\"{natural_width_px}\" data-natural-height=\"{natural_height_px}\" \
                 data-width-pt=\"{}\" data-height-pt=\"{}\" alt=\"{}\" \
                 style=\"width:{}pt;height:{}pt;max-width:{max_px}px;max-height:{max_px}px\" src=\"{}\">",
                escape(asset),
                num(width),
                num(height),
                escape(alt),
                num(width),
                num(height),
                image.data_uri(),
            );
        }
    }
}
