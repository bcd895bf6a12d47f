//! Progress reporting hooks for long-running stages.

use linetag_shared::PassKind;

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new stage.
    fn phase(&self, name: &str);
    /// Called when a chunk finishes (successfully or not).
    fn chunk_finished(&self, pass: PassKind, done: usize, total: usize);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn chunk_finished(&self, _pass: PassKind, _done: usize, _total: usize) {}
}
