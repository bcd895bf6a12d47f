//! End-to-end weekly run: records → line pass → item pass → merge → publish.
//!
//! Each stage reports one notification. Chunk failures inside a pass are
//! isolated and turn the run into a partial success; whether that halts the
//! later stages is a policy flag. Reconciliation failures are always fatal
//! and nothing is published after one.

use std::sync::Arc;
use std::time::Instant;

use linetag_artifacts::ChunkOutput;
use linetag_classifier::Classifier;
use linetag_shared::{LinetagError, PassesConfig, Record, ReferenceTaxonomy, Result, RunId};
use linetag_storage::Storage;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::context::RunContext;
use crate::dispatch::{DispatchSettings, Dispatcher, PassStatus, StorageSink};
use crate::merger::{self, MergedTable};
use crate::notify::{self, Notifier, notify_best_effort};
use crate::pass::{ItemPass, LinePass, PassOutcome, PassReport, run_pass};
use crate::progress::ProgressReporter;
use crate::publish::Publisher;

/// Collaborators of one run.
#[derive(Clone)]
pub struct PipelineDeps {
    pub classifier: Arc<dyn Classifier>,
    pub taxonomy: Arc<ReferenceTaxonomy>,
    pub storage: Arc<Storage>,
    pub notifier: Arc<dyn Notifier>,
    /// Merged rows are only published when this is set.
    pub publisher: Option<Arc<dyn Publisher>>,
}

/// Behavioural settings of one run.
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub passes: PassesConfig,
    /// Stop after a pass that had failed chunks instead of continuing.
    pub halt_on_partial_failure: bool,
}

/// Final state of a run, as stored in the `runs` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    PartialSuccess,
    /// Stopped after a partially-failed pass by policy.
    Halted,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::PartialSuccess => "partial_success",
            Self::Halted => "halted",
            Self::Failed => "failed",
        }
    }
}

/// What a finished (or halted) run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub run_date: String,
    pub status: RunStatus,
    pub records: usize,
    pub line: PassReport,
    pub item: Option<PassReport>,
    pub merged_rows: Option<usize>,
    pub resolved: Option<usize>,
    pub unresolved: Option<usize>,
    pub published: Option<usize>,
    pub elapsed_ms: u64,
}

/// Run the full pipeline over `records`.
///
/// Returns `Err` only for fatal failures: storage errors, artifact I/O,
/// reconciliation and publish failures. The run row is marked `failed`
/// before such an error is returned.
#[instrument(skip_all, fields(run_id = %ctx.run_id, run_date = %ctx.run_date_str(), records = records.len()))]
pub async fn run_pipeline(
    ctx: &RunContext,
    deps: &PipelineDeps,
    options: &PipelineOptions,
    records: Vec<Record>,
    progress: &dyn ProgressReporter,
) -> Result<RunSummary> {
    let start = Instant::now();
    let run_date = ctx.run_date_str();
    let expected = records.len();

    deps.storage.insert_run(&ctx.run_id, &run_date).await?;
    info!(backend = deps.classifier.name(), "run started");
    notify_best_effort(deps.notifier.as_ref(), &notify::run_started(&run_date, expected)).await;

    let dispatcher = Dispatcher::new(deps.classifier.clone(), DispatchSettings::from(&ctx.batch))
        .with_sink(Arc::new(StorageSink::new(deps.storage.clone(), ctx.run_id.clone())));

    // --- Pass 1: Line assignment ---
    let line_pass = LinePass::from_config(&options.passes);
    let line = match run_pass(ctx, &line_pass, records, &dispatcher, progress).await {
        Ok(outcome) => outcome,
        Err(e) => return Err(fail(ctx, deps, "line pass", e).await),
    };
    notify_best_effort(deps.notifier.as_ref(), &notify::pass_finished(&run_date, &line.report)).await;

    let mut summary = RunSummary {
        run_id: ctx.run_id.clone(),
        run_date: run_date.clone(),
        status: RunStatus::Completed,
        records: expected,
        line: line.report.clone(),
        item: None,
        merged_rows: None,
        resolved: None,
        unresolved: None,
        published: None,
        elapsed_ms: 0,
    };
    if halts(options, &line) {
        return halt(ctx, deps, summary, start).await;
    }

    // --- Pass 2: Item refinement ---
    let item_pass = ItemPass::from_config(&options.passes, deps.taxonomy.clone());
    let item = match run_pass(ctx, &item_pass, line.records, &dispatcher, progress).await {
        Ok(outcome) => outcome,
        Err(e) => return Err(fail(ctx, deps, "item pass", e).await),
    };
    notify_best_effort(deps.notifier.as_ref(), &notify::pass_finished(&run_date, &item.report)).await;
    summary.item = Some(item.report.clone());
    if halts(options, &item) {
        return halt(ctx, deps, summary, start).await;
    }

    // --- Merge ---
    progress.phase("Merging chunk outputs");
    let table = match merge_and_write(ctx, item.outputs, expected) {
        Ok(table) => table,
        Err(e) => return Err(fail(ctx, deps, "merge", e).await),
    };
    summary.merged_rows = Some(table.len());
    summary.resolved = Some(table.resolved());
    summary.unresolved = Some(table.unresolved());

    // --- Publish ---
    if let Some(publisher) = &deps.publisher {
        progress.phase("Publishing merged table");
        match publisher.publish(&table).await {
            Ok(rows) => summary.published = Some(rows),
            Err(e) => return Err(fail(ctx, deps, "publish", e).await),
        }
    }

    let partial = summary.line.status == PassStatus::PartialSuccess
        || summary.item.as_ref().is_some_and(|r| r.status == PassStatus::PartialSuccess);
    summary.status = if partial {
        RunStatus::PartialSuccess
    } else {
        RunStatus::Completed
    };
    summary.elapsed_ms = start.elapsed().as_millis() as u64;

    finish(ctx, deps, &summary).await?;
    notify_best_effort(
        deps.notifier.as_ref(),
        &notify::run_succeeded(&run_date, &table, summary.published),
    )
    .await;
    info!(
        status = summary.status.as_str(),
        rows = table.len(),
        unresolved = table.unresolved(),
        elapsed_ms = summary.elapsed_ms,
        "run finished"
    );
    Ok(summary)
}

fn halts(options: &PipelineOptions, outcome: &PassOutcome) -> bool {
    options.halt_on_partial_failure && outcome.report.status == PassStatus::PartialSuccess
}

fn merge_and_write(
    ctx: &RunContext,
    outputs: Vec<ChunkOutput>,
    expected: usize,
) -> Result<MergedTable> {
    let table = merger::merge(&ctx.run_date_str(), outputs, expected)?;
    merger::write_merged_table(&ctx.layout, &table)?;
    Ok(table)
}

async fn halt(
    ctx: &RunContext,
    deps: &PipelineDeps,
    mut summary: RunSummary,
    start: Instant,
) -> Result<RunSummary> {
    summary.status = RunStatus::Halted;
    summary.elapsed_ms = start.elapsed().as_millis() as u64;
    warn!("pass finished with failed chunks, halting run");

    finish(ctx, deps, &summary).await?;
    notify_best_effort(
        deps.notifier.as_ref(),
        &format!(
            "linetag {}: halted after a partially failed pass, nothing merged or published",
            summary.run_date
        ),
    )
    .await;
    Ok(summary)
}

async fn finish(ctx: &RunContext, deps: &PipelineDeps, summary: &RunSummary) -> Result<()> {
    let stats = serde_json::to_string(summary)
        .map_err(|e| LinetagError::Storage(format!("failed to serialize run stats: {e}")))?;
    deps.storage
        .finish_run(&ctx.run_id, summary.status.as_str(), &stats)
        .await
}

/// Mark the run failed and notify; returns the original error.
async fn fail(ctx: &RunContext, deps: &PipelineDeps, stage: &str, error: LinetagError) -> LinetagError {
    warn!(stage, error = %error, fatal = error.is_fatal_integrity(), "run failed");

    let stats = serde_json::json!({ "stage": stage, "error": error.to_string() }).to_string();
    if let Err(e) = deps
        .storage
        .finish_run(&ctx.run_id, RunStatus::Failed.as_str(), &stats)
        .await
    {
        warn!(error = %e, "could not mark run as failed");
    }

    notify_best_effort(
        deps.notifier.as_ref(),
        &notify::run_failed(&ctx.run_date_str(), stage, &error),
    )
    .await;
    error
}
