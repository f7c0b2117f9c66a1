//! Static checks on compiled markup before it reaches an engine.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use scraper::{Html, Selector};

static PAGE_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("section.page").expect("valid selector"));
static IMG_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("img").expect("valid selector"));
static EXTERNAL_SELECTOR: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("link[href], script[src], iframe[src], object[data]").expect("valid selector")
});

/// What the markup promises, used to judge the engine's report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preflight {
    pub page_count: usize,
    pub images: BTreeSet<String>,
}

/// Check that the markup is self-contained and every image is addressable.
pub fn preflight(markup: &str) -> Result<Preflight, String> {
    let doc = Html::parse_document(markup);

    let page_count = doc.select(&PAGE_SELECTOR).count();
    if page_count == 0 {
        return Err("markup contains no pages".into());
    }

    if let Some(el) = doc.select(&EXTERNAL_SELECTOR).next() {
        return Err(format!(
            "markup references an external resource via <{}>",
            el.value().name()
        ));
    }

    let mut images = BTreeSet::new();
    for img in doc.select(&IMG_SELECTOR) {
        let descriptor = img
            .value()
            .attr("data-el")
            .ok_or_else(|| "image without a data-el descriptor".to_string())?;
        let src = img.value().attr("src").unwrap_or_default();
        if !src.starts_with("data:") {
            return Err(format!(
                "image {descriptor} is not inlined (src starts with {:?})",
                src.chars().take(32).collect::<String>()
            ));
        }
        images.insert(descriptor.to_string());
    }

    Ok(Preflight { page_count, images })
}
