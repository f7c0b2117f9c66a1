//! Rendering-engine capability for Folio.
//!
//! The inspector and renderer only see [`RenderEngine`]; production builds
//! use the subprocess [`BridgeEngine`], tests use the simulated engine behind
//! the `testing` feature. Instances are always held through an
//! [`EngineLease`] so they are released on every exit path.

pub mod bridge;
pub mod engine;
pub mod error;
#[cfg(feature = "testing")]
pub mod testing;

pub use bridge::{BridgeEngine, BridgeLauncher};
pub use engine::{
    AssetState, ElementGeometry, EngineLauncher, EngineLease, ExportReceipt, ExportRequest,
    ImageProbe, PageGeometry, RenderEngine,
};
pub use error::EngineError;
