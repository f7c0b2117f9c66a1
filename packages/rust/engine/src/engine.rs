//! The rendering-engine capability and its scoped lease.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use folio_shared::{ElementKind, Rect};

use crate::error::EngineError;

// ---------------------------------------------------------------------------
// Geometry reported by the engine, in engine pixels and document coordinates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementGeometry {
    pub descriptor: String,
    pub kind: ElementKind,
    pub rect: Rect,
}

/// Load state of one `<img>` as the engine sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageProbe {
    pub descriptor: String,
    pub complete: bool,
    pub natural_width: u32,
    pub natural_height: u32,
}

impl ImageProbe {
    pub fn is_loaded(&self) -> bool {
        self.complete && self.natural_width > 0 && self.natural_height > 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageGeometry {
    pub index: usize,
    /// The page box in document coordinates.
    pub rect: Rect,
    #[serde(default)]
    pub elements: Vec<ElementGeometry>,
    #[serde(default)]
    pub images: Vec<ImageProbe>,
}

/// Outcome of waiting for asset loading to settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetState {
    pub total: usize,
    pub complete: usize,
}

impl AssetState {
    pub fn all_complete(&self) -> bool {
        self.complete >= self.total
    }
}

/// Parameters of a binary export. Margins at the export boundary are always
/// zero; page padding lives in the markup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRequest {
    pub output: PathBuf,
    pub width_in: f64,
    pub height_in: f64,
    pub print_background: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportReceipt {
    pub path: PathBuf,
    pub bytes: u64,
    pub pages: usize,
}

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// One live rendering-engine instance.
///
/// Every call carries its own timeout; after a timeout the instance should
/// be treated as unusable and released.
#[async_trait]
pub trait RenderEngine: Send {
    fn name(&self) -> &str;

    async fn load(&mut self, markup: &Path, timeout: Duration) -> Result<(), EngineError>;

    async fn await_assets(&mut self, timeout: Duration) -> Result<AssetState, EngineError>;

    async fn measure(&mut self, timeout: Duration) -> Result<Vec<PageGeometry>, EngineError>;

    async fn export(
        &mut self,
        request: &ExportRequest,
        timeout: Duration,
    ) -> Result<ExportReceipt, EngineError>;

    /// Graceful shutdown. Dropping the instance must still free it.
    async fn shutdown(&mut self) -> Result<(), EngineError>;
}

/// Creates engine instances.
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn RenderEngine>, EngineError>;
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// Scoped ownership of an engine instance.
///
/// `release()` shuts the engine down gracefully. A lease dropped without
/// release (early return, panic) drops the instance, which frees it anyway.
pub struct EngineLease {
    engine: Box<dyn RenderEngine>,
    released: bool,
}

impl EngineLease {
    pub async fn acquire(launcher: &dyn EngineLauncher) -> Result<Self, EngineError> {
        let engine = launcher.launch().await?;
        debug!(engine = engine.name(), "engine acquired");
        Ok(Self {
            engine,
            released: false,
        })
    }

    pub fn engine(&mut self) -> &mut dyn RenderEngine {
        self.engine.as_mut()
    }

    pub async fn release(mut self) {
        self.released = true;
        if let Err(e) = self.engine.shutdown().await {
            warn!(engine = self.engine.name(), error = %e, "engine shutdown failed; dropping");
        } else {
            debug!(engine = self.engine.name(), "engine released");
        }
    }
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        if !self.released {
            warn!(engine = self.engine.name(), "engine lease dropped without release");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        shutdowns: AtomicUsize,
        drops: AtomicUsize,
    }

    struct NullEngine(Arc<Counters>);

    impl Drop for NullEngine {
        fn drop(&mut self) {
            self.0.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl RenderEngine for NullEngine {
        fn name(&self) -> &str {
            "null"
        }
        async fn load(&mut self, _: &Path, _: Duration) -> Result<(), EngineError> {
            Ok(())
        }
        async fn await_assets(&mut self, _: Duration) -> Result<AssetState, EngineError> {
            Ok(AssetState {
                total: 0,
                complete: 0,
            })
        }
        async fn measure(&mut self, _: Duration) -> Result<Vec<PageGeometry>, EngineError> {
            Ok(Vec::new())
        }
        async fn export(
            &mut self,
            request: &ExportRequest,
            _: Duration,
        ) -> Result<ExportReceipt, EngineError> {
            Ok(ExportReceipt {
                path: request.output.clone(),
                bytes: 0,
                pages: 0,
            })
        }
        async fn shutdown(&mut self) -> Result<(), EngineError> {
            self.0.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct NullLauncher(Arc<Counters>);

    #[async_trait]
    impl EngineLauncher for NullLauncher {
        async fn launch(&self) -> Result<Box<dyn RenderEngine>, EngineError> {
            Ok(Box::new(NullEngine(self.0.clone())))
        }
    }

    #[tokio::test]
    async fn release_shuts_down_and_drops() {
        let counters = Arc::new(Counters::default());
        let launcher = NullLauncher(counters.clone());

        let lease = EngineLease::acquire(&launcher).await.unwrap();
        lease.release().await;

        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(counters.drops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreleased_lease_still_frees_the_engine() {
        let counters = Arc::new(Counters::default());
        let launcher = NullLauncher(counters.clone());

        {
            let mut lease = EngineLease::acquire(&launcher).await.unwrap();
            lease.engine().measure(Duration::from_secs(1)).await.unwrap();
        }

        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 0);
        assert_eq!(counters.drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn image_probe_requires_natural_size() {
        let probe = ImageProbe {
            descriptor: "p0-image-1".into(),
            complete: true,
            natural_width: 0,
            natural_height: 10,
        };
        assert!(!probe.is_loaded());
    }

    #[test]
    fn page_geometry_deserializes_without_optional_lists() {
        let json = r#"{"index":2,"rect":{"x":0,"y":1728,"width":576,"height":864}}"#;
        let page: PageGeometry = serde_json::from_str(json).unwrap();
        assert_eq!(page.index, 2);
        assert!(page.elements.is_empty());
    }
}
