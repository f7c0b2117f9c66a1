//! Core orchestration for Folio.
//!
//! [`Supervisor::build`] drives compile, inspect, render, normalize and
//! validate attempts until one passes or a budget runs out, tightening the
//! [`folio_shared::BuildConfig`] after every visual violation.

pub mod finalize;
pub mod progress;
pub mod remediation;
pub mod run_log;
pub mod supervisor;

pub use finalize::{finalize_artifact, sidecar_path, write_attempt_history};
pub use progress::{BuildProgress, SilentProgress};
pub use remediation::{tighten, tighten_effective};
pub use run_log::RunLog;
pub use supervisor::{BuildOutcome, BuildRequest, BuildState, Supervisor};
