//! Deterministic in-process engine for tests.
//!
//! [`SimulatedEngine`] lays pages out from the `data-*` attributes the
//! compiler emits, using fixed text metrics, and exports a real PDF with
//! `lopdf`. Faults can be injected per launcher; counters are shared across
//! every engine a launcher creates.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lopdf::{Document as LoDocument, Object as LoObject, Stream as LoStream, dictionary};
use scraper::{ElementRef, Html, Selector};

use folio_shared::{ElementKind, Rect};

use crate::engine::{
    AssetState, ElementGeometry, EngineLauncher, ExportReceipt, ExportRequest, ImageProbe,
    PageGeometry, RenderEngine,
};
use crate::error::EngineError;

/// Engine pixels per point (96 px / 72 pt).
const PX_PER_PT: f64 = 96.0 / 72.0;

/// Average glyph advance as a fraction of the font size.
const CHAR_WIDTH_EM: f64 = 0.5;

static PAGE_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("section.page").expect("valid selector"));
static ELEMENT_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("[data-el]").expect("valid selector"));

/// An element the engine always places past the content box, whatever
/// the markup says.
#[derive(Debug, Clone, PartialEq)]
pub struct PinnedOverflow {
    pub descriptor: String,
    pub exceeds_right_pt: f64,
    pub exceeds_bottom_pt: f64,
}

/// Injected misbehaviour.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// This many leading export calls hang until their timeout.
    pub hanging_exports: usize,
    /// This many leading measure calls report shifted geometry.
    pub jittered_measures: usize,
    /// Image descriptors that never finish loading.
    pub unloaded_images: BTreeSet<String>,
    pub pinned_overflow: Option<PinnedOverflow>,
}

/// Counters shared by a launcher and all engines it created.
#[derive(Debug, Default)]
pub struct EngineStats {
    launches: AtomicUsize,
    shutdowns: AtomicUsize,
    drops: AtomicUsize,
    loads: AtomicUsize,
    measures: AtomicUsize,
    exports: AtomicUsize,
}

impl EngineStats {
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Engines shut down gracefully through their lease.
    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Engines freed, whether or not they were shut down first.
    pub fn drops(&self) -> usize {
        self.drops.load(Ordering::SeqCst)
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn measures(&self) -> usize {
        self.measures.load(Ordering::SeqCst)
    }

    pub fn exports(&self) -> usize {
        self.exports.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedLauncher {
    faults: Arc<Mutex<Faults>>,
    stats: Arc<EngineStats>,
}

impl SimulatedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faults(faults: Faults) -> Self {
        Self {
            faults: Arc::new(Mutex::new(faults)),
            stats: Arc::default(),
        }
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        self.stats.clone()
    }
}

#[async_trait]
impl EngineLauncher for SimulatedLauncher {
    async fn launch(&self) -> Result<Box<dyn RenderEngine>, EngineError> {
        self.stats.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimulatedEngine {
            faults: self.faults.clone(),
            stats: self.stats.clone(),
            layout: None,
        }))
    }
}

pub struct SimulatedEngine {
    faults: Arc<Mutex<Faults>>,
    stats: Arc<EngineStats>,
    layout: Option<Vec<PageGeometry>>,
}

impl Drop for SimulatedEngine {
    fn drop(&mut self) {
        self.stats.drops.fetch_add(1, Ordering::SeqCst);
    }
}

impl SimulatedEngine {
    fn faults(&self) -> Faults {
        match self.faults.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Consume one unit of a countdown fault; true when it fired.
    fn take_fault(&self, pick: impl FnOnce(&mut Faults) -> &mut usize) -> bool {
        let mut guard = match self.faults.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let remaining = pick(&mut guard);
        if *remaining > 0 {
            *remaining -= 1;
            true
        } else {
            false
        }
    }

    fn loaded_layout(&self, operation: &'static str) -> Result<&Vec<PageGeometry>, EngineError> {
        self.layout.as_ref().ok_or_else(|| EngineError::Remote {
            operation,
            message: "no document loaded".into(),
        })
    }
}

#[async_trait]
impl RenderEngine for SimulatedEngine {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn load(&mut self, markup: &Path, _timeout: Duration) -> Result<(), EngineError> {
        self.stats.loads.fetch_add(1, Ordering::SeqCst);
        let html = std::fs::read_to_string(markup).map_err(|e| EngineError::Input {
            path: markup.to_path_buf(),
            message: e.to_string(),
        })?;
        self.layout = Some(layout(&html, &self.faults()));
        Ok(())
    }

    async fn await_assets(&mut self, _timeout: Duration) -> Result<AssetState, EngineError> {
        let layout = self.loaded_layout("await_assets")?;
        let probes = layout.iter().flat_map(|p| p.images.iter());
        let total = probes.clone().count();
        let complete = probes.filter(|p| p.is_loaded()).count();
        Ok(AssetState { total, complete })
    }

    async fn measure(&mut self, _timeout: Duration) -> Result<Vec<PageGeometry>, EngineError> {
        self.stats.measures.fetch_add(1, Ordering::SeqCst);
        let mut pages = self.loaded_layout("measure")?.clone();
        if self.take_fault(|f| &mut f.jittered_measures) {
            for page in &mut pages {
                for element in &mut page.elements {
                    element.rect.y += 3.0;
                }
            }
        }
        Ok(pages)
    }

    async fn export(
        &mut self,
        request: &ExportRequest,
        timeout: Duration,
    ) -> Result<ExportReceipt, EngineError> {
        self.stats.exports.fetch_add(1, Ordering::SeqCst);
        if self.take_fault(|f| &mut f.hanging_exports) {
            tokio::time::sleep(timeout).await;
            return Err(EngineError::timeout("export", timeout));
        }

        let pages = self.loaded_layout("export")?.len();
        let size = (request.width_in * 72.0, request.height_in * 72.0);
        write_test_pdf(&request.output, &vec![size; pages]).map_err(|message| {
            EngineError::Remote {
                operation: "export",
                message,
            }
        })?;
        let bytes = std::fs::metadata(&request.output)
            .map(|m| m.len())
            .map_err(|e| EngineError::Remote {
                operation: "export",
                message: e.to_string(),
            })?;

        Ok(ExportReceipt {
            path: request.output.clone(),
            bytes,
            pages,
        })
    }

    async fn shutdown(&mut self) -> Result<(), EngineError> {
        self.stats.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Layout model
// ---------------------------------------------------------------------------

fn attr_f64(el: &ElementRef<'_>, name: &str) -> f64 {
    el.value()
        .attr(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.0)
}

fn parse_kind(value: Option<&str>) -> ElementKind {
    match value {
        Some("heading") => ElementKind::Heading,
        Some("paragraph") => ElementKind::Paragraph,
        Some("code") => ElementKind::Code,
        Some("image") => ElementKind::Image,
        Some("epigraph") => ElementKind::Epigraph,
        _ => ElementKind::Other,
    }
}

/// Lay out every page of `html`. All returned geometry is in engine pixels.
fn layout(html: &str, faults: &Faults) -> Vec<PageGeometry> {
    let doc = Html::parse_document(html);
    let mut pages = Vec::new();
    let mut page_top_pt = 0.0;

    for page in doc.select(&PAGE_SELECTOR) {
        let width = attr_f64(&page, "data-width-pt");
        let height = attr_f64(&page, "data-height-pt");
        let page_font = attr_f64(&page, "data-font-pt");
        let margins: Vec<f64> = page
            .value()
            .attr("data-margins-pt")
            .unwrap_or_default()
            .split_whitespace()
            .filter_map(|v| v.parse().ok())
            .collect();
        let [top, right, bottom, left] = match margins.as_slice() {
            [t, r, b, l] => [*t, *r, *b, *l],
            _ => [0.0; 4],
        };
        let content_width = width - left - right;

        let mut elements = Vec::new();
        let mut images = Vec::new();
        let mut cursor = top;

        for el in page.select(&ELEMENT_SELECTOR) {
            let descriptor = el.value().attr("data-el").unwrap_or_default().to_string();
            let kind = parse_kind(el.value().attr("data-kind"));
            let font = attr_f64(&el, "data-font-pt");

            let (mut w, h, margin_after) = match kind {
                ElementKind::Heading => (content_width, font * 1.2, font * 0.5),
                ElementKind::Paragraph | ElementKind::Epigraph => {
                    let chars = attr_f64(&el, "data-chars");
                    let per_line = (content_width / (font * CHAR_WIDTH_EM)).floor().max(1.0);
                    let lines = (chars / per_line).ceil().max(1.0);
                    let gap = if kind == ElementKind::Epigraph { 1.0 } else { 0.6 };
                    (content_width, lines * font * 1.4, font * gap)
                }
                ElementKind::Code => {
                    let lines = attr_f64(&el, "data-lines");
                    let natural = lines * font * 1.35 + 8.0;
                    let max = attr_f64(&el, "data-max-height-pt");
                    let h = if max > 0.0 { natural.min(max) } else { natural };
                    (content_width, h, font * 0.8)
                }
                ElementKind::Image => {
                    let loaded = !faults.unloaded_images.contains(&descriptor);
                    images.push(ImageProbe {
                        descriptor: descriptor.clone(),
                        complete: loaded,
                        natural_width: if loaded {
                            attr_f64(&el, "data-natural-width") as u32
                        } else {
                            0
                        },
                        natural_height: if loaded {
                            attr_f64(&el, "data-natural-height") as u32
                        } else {
                            0
                        },
                    });
                    (
                        attr_f64(&el, "data-width-pt"),
                        attr_f64(&el, "data-height-pt"),
                        page_font * 0.8,
                    )
                }
                ElementKind::Other => (content_width, font * 1.4, 0.0),
            };

            let y = cursor;
            let mut h_out = h;
            if let Some(pin) = faults
                .pinned_overflow
                .as_ref()
                .filter(|p| p.descriptor == descriptor)
            {
                w = w.max(content_width + pin.exceeds_right_pt);
                if pin.exceeds_bottom_pt > 0.0 {
                    h_out = h_out.max(height - bottom + pin.exceeds_bottom_pt - y);
                }
            }

            let rect = Rect::new(left, page_top_pt + y, w, h_out);
            elements.push(ElementGeometry {
                descriptor,
                kind,
                rect: rect.scaled(PX_PER_PT),
            });
            cursor += h + margin_after;
        }

        pages.push(PageGeometry {
            index: pages.len(),
            rect: Rect::new(0.0, page_top_pt, width, height).scaled(PX_PER_PT),
            elements,
            images,
        });
        page_top_pt += height;
    }

    pages
}

// ---------------------------------------------------------------------------
// PDF synthesis
// ---------------------------------------------------------------------------

/// Write a PDF with one page per `(width_pt, height_pt)` entry. Every page
/// carries a line of text so rasterizers see ink.
pub fn write_test_pdf(path: &Path, pages: &[(f64, f64)]) -> Result<(), String> {
    let mut doc = LoDocument::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids: Vec<LoObject> = Vec::with_capacity(pages.len());
    for (i, (width, height)) in pages.iter().enumerate() {
        let content = format!("BT /F1 12 Tf 36 {} Td (Page {}) Tj ET", height - 48.0, i + 1);
        let content_id = doc.add_object(LoStream::new(dictionary! {}, content.into_bytes()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => resources_id,
            "MediaBox" => vec![
                0.into(),
                0.into(),
                LoObject::Real(*width as f32),
                LoObject::Real(*height as f32),
            ],
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        LoObject::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    doc.compress();
    doc.save(path).map(|_| ()).map_err(|e| e.to_string())
}
