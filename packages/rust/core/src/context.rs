//! Explicit per-run context passed into every pipeline component.

use chrono::NaiveDate;
use linetag_artifacts::ArtifactLayout;
use linetag_shared::{BatchConfig, Result, RunId};

/// Identity, artifact layout and batch settings of one pipeline run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: RunId,
    pub layout: ArtifactLayout,
    pub batch: BatchConfig,
}

impl RunContext {
    /// Fresh context with a new run id. Rejects unusable batch settings.
    pub fn new(layout: ArtifactLayout, batch: BatchConfig) -> Result<Self> {
        batch.validate()?;
        Ok(Self {
            run_id: RunId::new(),
            layout,
            batch,
        })
    }

    pub fn run_date(&self) -> NaiveDate {
        self.layout.run_date()
    }

    pub fn run_date_str(&self) -> String {
        self.layout.run_date_str()
    }
}
