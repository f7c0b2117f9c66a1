//! Deterministic threshold tightening.
//!
//! Overflow kinds map to families, families are applied in table order, and
//! each threshold becomes `min(old, max(floor, stepped))`. A threshold never
//! rises, so consecutive violation-driven configs are monotonically tighter.
//!
//! A step that would compile to the same markup fixes nothing, so
//! [`tighten_effective`] keeps going down the table until one does.

use std::collections::BTreeSet;

use tracing::debug;

use folio_shared::{BuildConfig, ElementKind, OverflowReport};

pub const CODE_HEIGHT_FACTOR: f64 = 0.75;
pub const CODE_HEIGHT_FLOOR_PT: f64 = 36.0;

pub const PARAGRAPH_CHARS_FACTOR: f64 = 0.8;
pub const PARAGRAPH_CHARS_FLOOR: usize = 200;

pub const IMAGE_DIMENSION_FACTOR: f64 = 0.75;
pub const IMAGE_DIMENSION_FLOOR_PX: u32 = 64;

pub const BODY_FONT_STEP_PT: f64 = 0.5;
pub const BODY_FONT_FLOOR_PT: f64 = 7.0;

/// Threshold family, in application order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Family {
    Code,
    Paragraph,
    Image,
    Font,
}

impl Family {
    pub const ORDER: [Family; 4] = [Self::Code, Self::Paragraph, Self::Image, Self::Font];

    pub fn of(kind: ElementKind) -> Self {
        match kind {
            ElementKind::Code => Self::Code,
            ElementKind::Paragraph => Self::Paragraph,
            ElementKind::Image => Self::Image,
            ElementKind::Heading | ElementKind::Epigraph | ElementKind::Other => Self::Font,
        }
    }
}

/// Derive the next config from `config` for the kinds in `report`.
///
/// Always bumps the generation, even when every affected threshold is
/// already at its floor.
pub fn tighten(config: &BuildConfig, report: &OverflowReport) -> BuildConfig {
    let families: BTreeSet<Family> = report.kinds().into_iter().map(Family::of).collect();
    let mut next = config.clone();
    next.generation = config.generation.saturating_add(1);

    for family in &families {
        step(&mut next, config, *family);
    }

    debug!(
        generation = next.generation,
        families = ?families,
        code_pt = next.max_code_block_height_pt,
        paragraph_chars = next.max_paragraph_chars,
        image_px = next.max_image_dimension_px,
        font_pt = next.body_font_size_pt,
        "tightened build config"
    );
    next
}

/// Step one family of `next`, measured from `base`.
fn step(next: &mut BuildConfig, base: &BuildConfig, family: Family) {
    match family {
        Family::Code => {
            let stepped = (base.max_code_block_height_pt * CODE_HEIGHT_FACTOR).max(CODE_HEIGHT_FLOOR_PT);
            next.max_code_block_height_pt = base.max_code_block_height_pt.min(stepped);
        }
        Family::Paragraph => {
            let stepped = ((base.max_paragraph_chars as f64 * PARAGRAPH_CHARS_FACTOR).floor()
                as usize)
                .max(PARAGRAPH_CHARS_FLOOR);
            next.max_paragraph_chars = base.max_paragraph_chars.min(stepped);
        }
        Family::Image => {
            let stepped = ((base.max_image_dimension_px as f64 * IMAGE_DIMENSION_FACTOR).floor()
                as u32)
                .max(IMAGE_DIMENSION_FLOOR_PX);
            next.max_image_dimension_px = base.max_image_dimension_px.min(stepped);
        }
        Family::Font => {
            let stepped = (base.body_font_size_pt - BODY_FONT_STEP_PT).max(BODY_FONT_FLOOR_PT);
            next.body_font_size_pt = base.body_font_size_pt.min(stepped);
        }
    }
}

/// [`tighten`], then escalate while `changes_markup` says the candidate
/// would compile exactly like the current config.
///
/// Escalation walks the families after the last one in `report`, in table
/// order, stepping each once. The result is never looser than [`tighten`]'s.
pub fn tighten_effective(
    config: &BuildConfig,
    report: &OverflowReport,
    mut changes_markup: impl FnMut(&BuildConfig) -> bool,
) -> BuildConfig {
    let mut next = tighten(config, report);
    let last = report.kinds().into_iter().map(Family::of).max();
    let remaining = Family::ORDER
        .into_iter()
        .filter(|family| last.is_none_or(|seen| *family > seen));

    for family in remaining {
        if changes_markup(&next) {
            return next;
        }
        let base = next.clone();
        step(&mut next, &base, family);
        debug!(
            family = ?family,
            generation = next.generation,
            font_pt = next.body_font_size_pt,
            "tightening left markup unchanged, escalating"
        );
    }
    next
}
