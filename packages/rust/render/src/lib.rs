//! Artifact rendering and binary normalization.
//!
//! [`Renderer`] captures a page-exact PDF from a live engine;
//! [`normalize_or_degrade`] passes it through an external normalizer and
//! falls back to the raw capture when that fails.

pub mod normalizer;
pub mod renderer;

pub use normalizer::{GhostscriptNormalizer, NormalizedArtifact, Normalizer, normalize_or_degrade};
pub use renderer::{RenderError, RenderedArtifact, Renderer, check_pdf_header};
