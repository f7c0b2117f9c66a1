//! Block segmentation of chapter bodies.
//!
//! Bodies arrive already authored; this only splits them into the block kinds
//! the page IR knows about. Inline formatting is passed through as text.

use std::sync::LazyLock;

use regex::Regex;

/// A block as written by the author, before any threshold is applied.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RawBlock {
    Heading { level: u8, text: String },
    Paragraph(String),
    Code { language: Option<String>, lines: Vec<String> },
    Image { alt: String, asset: String },
}

static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(#{1,3})\s+(.+?)\s*#*$").expect("valid regex"));

static IMAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^!\[([^\]]*)\]\(([^)\s]+)\)$").expect("valid regex"));

/// Split a chapter body into blocks.
pub(crate) fn segment(body: &str) -> Vec<RawBlock> {
    let mut blocks = Vec::new();
    let mut paragraph: Vec<&str> = Vec::new();
    let mut fence: Option<(Option<String>, Vec<String>)> = None;

    for line in body.lines() {
        let trimmed = line.trim();

        if let Some((language, lines)) = fence.as_mut() {
            if trimmed.starts_with("```") {
                blocks.push(RawBlock::Code {
                    language: language.take(),
                    lines: std::mem::take(lines),
                });
                fence = None;
            } else {
                lines.push(line.trim_end().to_string());
            }
            continue;
        }

        if let Some(info) = trimmed.strip_prefix("```") {
            flush_paragraph(&mut paragraph, &mut blocks);
            let language = info.trim();
            fence = Some((
                (!language.is_empty()).then(|| language.to_string()),
                Vec::new(),
            ));
            continue;
        }

        if trimmed.is_empty() {
            flush_paragraph(&mut paragraph, &mut blocks);
            continue;
        }

        if let Some(caps) = HEADING_RE.captures(trimmed) {
            flush_paragraph(&mut paragraph, &mut blocks);
            blocks.push(RawBlock::Heading {
                level: caps[1].len() as u8,
                text: caps[2].to_string(),
            });
            continue;
        }

        if let Some(caps) = IMAGE_RE.captures(trimmed) {
            flush_paragraph(&mut paragraph, &mut blocks);
            blocks.push(RawBlock::Image {
                alt: caps[1].to_string(),
                asset: caps[2].to_string(),
            });
            continue;
        }

        paragraph.push(trimmed);
    }

    // An unterminated fence still yields its code.
    if let Some((language, lines)) = fence {
        blocks.push(RawBlock::Code { language, lines });
    }
    flush_paragraph(&mut paragraph, &mut blocks);

    blocks
}

fn flush_paragraph(buffer: &mut Vec<&str>, blocks: &mut Vec<RawBlock>) {
    if buffer.is_empty() {
        return;
    }
    blocks.push(RawBlock::Paragraph(buffer.join(" ")));
    buffer.clear();
}
