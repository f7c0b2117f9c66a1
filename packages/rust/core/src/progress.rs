use folio_shared::{AttemptRecord, BuildConfig};

use crate::supervisor::{BuildOutcome, BuildState};

/// Progress callback for reporting build status.
pub trait BuildProgress: Send + Sync {
    /// Called on every state-machine transition.
    fn state(&self, attempt: u32, state: BuildState);
    /// Called before an attempt starts compiling.
    fn attempt_started(&self, attempt: u32, config: &BuildConfig);
    /// Called once the attempt's record has been written.
    fn attempt_finished(&self, record: &AttemptRecord);
    /// Called once with the terminal outcome.
    fn done(&self, outcome: &BuildOutcome);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl BuildProgress for SilentProgress {
    fn state(&self, _attempt: u32, _state: BuildState) {}
    fn attempt_started(&self, _attempt: u32, _config: &BuildConfig) {}
    fn attempt_finished(&self, _record: &AttemptRecord) {}
    fn done(&self, _outcome: &BuildOutcome) {}
}
