//! In-process PDF parse and page-size probe.

use std::path::Path;

use lopdf::{Document as LoDocument, Object as LoObject, ObjectId as LoObjectId};

/// Page-tree nodes followed when looking for an inherited `MediaBox`.
const MAX_INHERITANCE_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageSize {
    /// 0-based page index.
    pub index: usize,
    pub width_pt: f64,
    pub height_pt: f64,
}

/// Parse `pdf` and report each page's MediaBox size, in page order.
pub fn page_sizes(pdf: &Path) -> Result<Vec<PageSize>, String> {
    let doc = LoDocument::load(pdf).map_err(|e| format!("unparsable PDF: {e}"))?;
    if doc.is_encrypted() {
        return Err("PDF is encrypted".into());
    }

    let pages = doc.get_pages();
    if pages.is_empty() {
        return Err("PDF has no pages".into());
    }

    pages
        .values()
        .enumerate()
        .map(|(index, id)| {
            let [x0, y0, x1, y1] =
                media_box(&doc, *id).map_err(|e| format!("page {}: {e}", index + 1))?;
            Ok(PageSize {
                index,
                width_pt: (x1 - x0).abs(),
                height_pt: (y1 - y0).abs(),
            })
        })
        .collect()
}

fn media_box(doc: &LoDocument, page: LoObjectId) -> Result<[f64; 4], String> {
    let mut node = page;
    for _ in 0..MAX_INHERITANCE_DEPTH {
        let dict = doc
            .get_object(node)
            .and_then(LoObject::as_dict)
            .map_err(|e| e.to_string())?;

        if let Ok(value) = dict.get(b"MediaBox") {
            let values = resolve(doc, value)?
                .as_array()
                .map_err(|_| "MediaBox is not an array".to_string())?;
            return parse_box(doc, values);
        }

        match dict.get(b"Parent") {
            Ok(LoObject::Reference(parent)) => node = *parent,
            _ => return Err("no MediaBox on the page or its ancestors".into()),
        }
    }
    Err("page tree too deep".into())
}

fn resolve<'a>(doc: &'a LoDocument, obj: &'a LoObject) -> Result<&'a LoObject, String> {
    match obj {
        LoObject::Reference(id) => doc.get_object(*id).map_err(|e| e.to_string()),
        other => Ok(other),
    }
}

fn parse_box(doc: &LoDocument, values: &[LoObject]) -> Result<[f64; 4], String> {
    if values.len() != 4 {
        return Err(format!("MediaBox has {} entries", values.len()));
    }
    let mut out = [0.0; 4];
    for (slot, value) in out.iter_mut().zip(values) {
        *slot = match resolve(doc, value)? {
            LoObject::Integer(i) => *i as f64,
            LoObject::Real(r) => f64::from(*r),
            _ => return Err("MediaBox entry is not a number".into()),
        };
    }
    Ok(out)
}
