//! Page/element IR.
//!
//! The document is built from the content model unconstrained, then
//! [`apply_thresholds`] adjusts typed style properties and content according
//! to the attempt's [`BuildConfig`]. Serialization happens once, afterwards.

use std::collections::{BTreeMap, HashMap};

use folio_shared::{BuildConfig, Chapter, ContentModel, ElementKind, POINTS_PER_INCH, PageSpec};

use crate::assets::PreparedImage;
use crate::blocks::RawBlock;

/// Appended to a truncated paragraph.
pub const TRUNCATION_MARKER: &str = " […]";

/// Code font size relative to body text.
pub const CODE_FONT_RATIO: f64 = 0.85;
/// Code line height relative to code font size.
pub const CODE_LINE_HEIGHT: f64 = 1.35;
/// Vertical padding inside a code block, per side.
pub const CODE_PADDING_PT: f64 = 4.0;

/// Frontmatter key holding an optional chapter epigraph.
const EPIGRAPH_KEY: &str = "epigraph";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageRole {
    Front,
    Chapter(u32),
    Back,
}

impl PageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Front => "front",
            Self::Chapter(_) => "chapter",
            Self::Back => "back",
        }
    }
}

/// Box geometry of one page, in points.
#[derive(Debug, Clone, PartialEq)]
pub struct PageStyle {
    pub width_pt: f64,
    pub height_pt: f64,
    /// Top, right, bottom, left.
    pub padding_pt: [f64; 4],
    pub font_size_pt: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageBox {
    pub index: usize,
    pub role: PageRole,
    pub style: PageStyle,
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlockContent {
    Heading {
        level: u8,
        text: String,
    },
    Paragraph {
        text: String,
        truncated: bool,
    },
    Epigraph {
        text: String,
    },
    Code {
        language: Option<String>,
        lines: Vec<String>,
        /// Lines removed to fit the height limit; shown as an elision line.
        elided_lines: usize,
    },
    Image {
        asset: String,
        alt: String,
        natural_width_px: u32,
        natural_height_px: u32,
    },
}

/// Typed style properties a threshold can adjust.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockStyle {
    pub font_size_pt: Option<f64>,
    pub max_height_pt: Option<f64>,
    pub width_pt: Option<f64>,
    pub height_pt: Option<f64>,
    pub max_dimension_px: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    /// Stable element descriptor, e.g. `p5-code-2`.
    pub descriptor: String,
    pub content: BlockContent,
    pub style: BlockStyle,
}

impl Block {
    pub fn kind(&self) -> ElementKind {
        match self.content {
            BlockContent::Heading { .. } => ElementKind::Heading,
            BlockContent::Paragraph { .. } => ElementKind::Paragraph,
            BlockContent::Epigraph { .. } => ElementKind::Epigraph,
            BlockContent::Code { .. } => ElementKind::Code,
            BlockContent::Image { .. } => ElementKind::Image,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub title: String,
    pub pages: Vec<PageBox>,
}

// ---------------------------------------------------------------------------
// Building
// ---------------------------------------------------------------------------

/// Hands out per-page, per-kind descriptors.
struct PageBuilder {
    index: usize,
    counters: HashMap<ElementKind, usize>,
    blocks: Vec<Block>,
}

impl PageBuilder {
    fn new(index: usize) -> Self {
        Self {
            index,
            counters: HashMap::new(),
            blocks: Vec::new(),
        }
    }

    fn push(&mut self, content: BlockContent) {
        let mut block = Block {
            descriptor: String::new(),
            content,
            style: BlockStyle::default(),
        };
        let kind = block.kind();
        let ordinal = self.counters.entry(kind).or_insert(0);
        *ordinal += 1;
        block.descriptor = format!("p{}-{}-{}", self.index, kind.as_str(), ordinal);
        self.blocks.push(block);
    }

    fn finish(self, role: PageRole, spec: &PageSpec) -> PageBox {
        let m = &spec.margins;
        PageBox {
            index: self.index,
            role,
            style: PageStyle {
                width_pt: spec.width_pt(),
                height_pt: spec.height_pt(),
                padding_pt: [
                    m.top_in * POINTS_PER_INCH,
                    m.right_in * POINTS_PER_INCH,
                    m.bottom_in * POINTS_PER_INCH,
                    m.left_in * POINTS_PER_INCH,
                ],
                font_size_pt: 0.0,
            },
            blocks: self.blocks,
        }
    }
}

fn image_block(
    images: &BTreeMap<String, PreparedImage>,
    asset: &str,
    alt: &str,
) -> Option<BlockContent> {
    images.get(asset).map(|img| BlockContent::Image {
        asset: asset.to_string(),
        alt: alt.to_string(),
        natural_width_px: img.width_px,
        natural_height_px: img.height_px,
    })
}

impl Document {
    /// Lay out the page plan: title page, one page per chapter, colophon.
    pub(crate) fn build(
        model: &ContentModel,
        chapters: &[(&Chapter, Vec<RawBlock>)],
        images: &BTreeMap<String, PreparedImage>,
        spec: &PageSpec,
    ) -> Self {
        let meta = &model.metadata;
        let mut pages = Vec::with_capacity(chapters.len() + 2);

        let mut front = PageBuilder::new(0);
        front.push(BlockContent::Heading {
            level: 1,
            text: meta.title.clone(),
        });
        if let Some(subtitle) = &meta.subtitle {
            front.push(BlockContent::Heading {
                level: 2,
                text: subtitle.clone(),
            });
        }
        if !meta.author.is_empty() {
            front.push(BlockContent::Paragraph {
                text: meta.author.clone(),
                truncated: false,
            });
        }
        if let Some(block) = meta
            .cover
            .as_deref()
            .and_then(|cover| image_block(images, cover, "Cover"))
        {
            front.push(block);
        }
        pages.push(front.finish(PageRole::Front, spec));

        for (chapter, raw_blocks) in chapters {
            let mut page = PageBuilder::new(pages.len());
            page.push(BlockContent::Heading {
                level: 1,
                text: format!("Chapter {}: {}", chapter.number, chapter.title),
            });
            if let Some(epigraph) = chapter.frontmatter.get(EPIGRAPH_KEY).and_then(|v| v.as_str())
            {
                page.push(BlockContent::Epigraph {
                    text: epigraph.to_string(),
                });
            }
            for raw in raw_blocks {
                let content = match raw {
                    // Chapter titles own h1; body headings shift down a level.
                    RawBlock::Heading { level, text } => BlockContent::Heading {
                        level: level + 1,
                        text: text.clone(),
                    },
                    RawBlock::Paragraph(text) => BlockContent::Paragraph {
                        text: text.clone(),
                        truncated: false,
                    },
                    RawBlock::Code { language, lines } => BlockContent::Code {
                        language: language.clone(),
                        lines: lines.clone(),
                        elided_lines: 0,
                    },
                    RawBlock::Image { alt, asset } => match image_block(images, asset, alt) {
                        Some(block) => block,
                        None => continue,
                    },
                };
                page.push(content);
            }
            pages.push(page.finish(PageRole::Chapter(chapter.number), spec));
        }

        let mut back = PageBuilder::new(pages.len());
        back.push(BlockContent::Heading {
            level: 2,
            text: "Colophon".into(),
        });
        let credit = if meta.author.is_empty() {
            format!("{}. Typeset with Folio.", meta.title)
        } else {
            format!("{} by {}. Typeset with Folio.", meta.title, meta.author)
        };
        back.push(BlockContent::Paragraph {
            text: credit,
            truncated: false,
        });
        pages.push(back.finish(PageRole::Back, spec));

        Self {
            title: meta.title.clone(),
            pages,
        }
    }
}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

fn heading_scale(level: u8) -> f64 {
    match level {
        1 => 2.0,
        2 => 1.5,
        3 => 1.25,
        _ => 1.1,
    }
}

/// Apply the attempt's thresholds to a freshly built document.
pub fn apply_thresholds(doc: &mut Document, config: &BuildConfig, spec: &PageSpec) {
    let body = config.body_font_size_pt;
    let px_to_pt = spec.px_to_pt();

    for page in &mut doc.pages {
        page.style.font_size_pt = body;

        for block in &mut page.blocks {
            match &mut block.content {
                BlockContent::Heading { level, .. } => {
                    block.style.font_size_pt = Some(body * heading_scale(*level));
                }
                BlockContent::Paragraph { text, truncated } => {
                    block.style.font_size_pt = Some(body);
                    if let Some(cut) = truncate_at_word(text, config.max_paragraph_chars) {
                        *text = cut;
                        *truncated = true;
                    }
                }
                BlockContent::Epigraph { .. } => {
                    block.style.font_size_pt = Some(body * 0.95);
                }
                BlockContent::Code {
                    lines,
                    elided_lines,
                    ..
                } => {
                    let font = body * CODE_FONT_RATIO;
                    let limit = config.max_code_block_height_pt;
                    block.style.font_size_pt = Some(font);
                    block.style.max_height_pt = Some(limit);

                    let (keep, elided) = fit_code_lines(lines.len(), font, limit);
                    if elided > 0 {
                        lines.truncate(keep);
                        *elided_lines += elided;
                    }
                }
                BlockContent::Image {
                    natural_width_px,
                    natural_height_px,
                    ..
                } => {
                    let max = config.max_image_dimension_px.max(1);
                    let (w, h) = fit_within(*natural_width_px, *natural_height_px, max);
                    block.style.max_dimension_px = Some(max);
                    block.style.width_pt = Some(w as f64 * px_to_pt);
                    block.style.height_pt = Some(h as f64 * px_to_pt);
                }
            }
        }
    }
}

/// Estimated rendered height of a code block with `line_count` lines.
pub fn code_block_height_pt(line_count: usize, font_size_pt: f64) -> f64 {
    line_count as f64 * font_size_pt * CODE_LINE_HEIGHT + 2.0 * CODE_PADDING_PT
}

/// Returns `(lines kept, lines elided)` so that the kept lines plus one
/// elision line fit in `limit_pt`.
fn fit_code_lines(line_count: usize, font_size_pt: f64, limit_pt: f64) -> (usize, usize) {
    if code_block_height_pt(line_count, font_size_pt) <= limit_pt {
        return (line_count, 0);
    }
    let per_line = font_size_pt * CODE_LINE_HEIGHT;
    let room = ((limit_pt - 2.0 * CODE_PADDING_PT) / per_line).floor().max(0.0) as usize;
    let keep = room.saturating_sub(1).min(line_count);
    (keep, line_count - keep)
}

/// Scale `(w, h)` down so neither side exceeds `max`.
fn fit_within(width: u32, height: u32, max: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max {
        return (width, height);
    }
    let ratio = max as f64 / longest as f64;
    (
        ((width as f64 * ratio).round() as u32).max(1),
        ((height as f64 * ratio).round() as u32).max(1),
    )
}

/// Cut `text` to at most `max_chars` characters, preferring a word boundary.
/// Returns `None` when the text already fits.
fn truncate_at_word(text: &str, max_chars: usize) -> Option<String> {
    if text.chars().count() <= max_chars {
        return None;
    }
    let byte_end = text
        .char_indices()
        .nth(max_chars)
        .map_or(text.len(), |(i, _)| i);
    let prefix = &text[..byte_end];

    // Back off to the last space unless that discards more than half.
    let cut = match prefix.rfind(char::is_whitespace) {
        Some(space) if space >= byte_end / 2 => &prefix[..space],
        _ => prefix,
    };
    Some(cut.trim_end().to_string())
}
