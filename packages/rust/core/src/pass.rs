//! Pass controllers and the pass runner.
//!
//! A pass re-chunks the full record set, sends each chunk's eligible subset
//! to the dispatcher, validates the proposals it gets back and fills null
//! fields only. Every chunk gets an output file holding all of its records,
//! including the ones the pass carried without sending.

use std::collections::HashMap;
use std::sync::Arc;

use linetag_artifacts::{ChunkOutput, ChunkStatus};
use linetag_classifier::{Eligibility, PromptProfile, ValidationRule};
use linetag_shared::{
    Chunk, LinetagError, PassKind, PassesConfig, Proposal, Record, RecordId, ReferenceTaxonomy,
    ResolutionStatus, Result,
};
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::chunker;
use crate::context::RunContext;
use crate::dispatch::{BatchLog, ChunkFailure, ChunkSuccess, Dispatcher, PassStatus};
use crate::progress::ProgressReporter;
use crate::validate::{Verdict, validate};

// ---------------------------------------------------------------------------
// Controllers
// ---------------------------------------------------------------------------

/// Per-pass strategy: prompt profile, eligibility and reference data.
pub trait PassController: Send + Sync {
    fn kind(&self) -> PassKind;

    fn configure(&self) -> PromptProfile;

    fn eligible(&self, record: &Record) -> bool {
        self.configure().eligibility.admits(record)
    }

    /// Reference taxonomy sent with each call, if the pass uses one.
    fn reference(&self) -> Option<Arc<ReferenceTaxonomy>> {
        None
    }
}

/// Pass 1: Line assignment over every record.
#[derive(Debug, Clone)]
pub struct LinePass {
    instructions: String,
}

impl LinePass {
    pub fn new(instructions: impl Into<String>) -> Self {
        Self {
            instructions: instructions.into(),
        }
    }

    pub fn from_config(config: &PassesConfig) -> Self {
        Self::new(config.line_instructions.clone())
    }
}

impl PassController for LinePass {
    fn kind(&self) -> PassKind {
        PassKind::Line
    }

    fn configure(&self) -> PromptProfile {
        PromptProfile {
            pass: PassKind::Line,
            instructions: self.instructions.clone(),
            attach_reference: false,
            eligibility: Eligibility::All,
            validation: ValidationRule::None,
        }
    }

    fn eligible(&self, _record: &Record) -> bool {
        true
    }
}

/// Pass 2: Item refinement against the reference taxonomy.
#[derive(Debug, Clone)]
pub struct ItemPass {
    instructions: String,
    taxonomy: Arc<ReferenceTaxonomy>,
}

impl ItemPass {
    pub fn new(instructions: impl Into<String>, taxonomy: Arc<ReferenceTaxonomy>) -> Self {
        Self {
            instructions: instructions.into(),
            taxonomy,
        }
    }

    pub fn from_config(config: &PassesConfig, taxonomy: Arc<ReferenceTaxonomy>) -> Self {
        Self::new(config.item_instructions.clone(), taxonomy)
    }
}

impl PassController for ItemPass {
    fn kind(&self) -> PassKind {
        PassKind::Item
    }

    fn configure(&self) -> PromptProfile {
        PromptProfile {
            pass: PassKind::Item,
            instructions: self.instructions.clone(),
            attach_reference: true,
            eligibility: Eligibility::MissingLineOrItem,
            validation: ValidationRule::ItemWithinLine,
        }
    }

    fn eligible(&self, record: &Record) -> bool {
        Eligibility::MissingLineOrItem.admits(record)
    }

    fn reference(&self) -> Option<Arc<ReferenceTaxonomy>> {
        Some(self.taxonomy.clone())
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// A chunk that failed permanently in a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedChunk {
    pub index: usize,
    pub attempts: u32,
    pub error: String,
}

/// Counts describing one finished pass.
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub pass: PassKind,
    pub status: PassStatus,
    pub records_total: usize,
    /// Records sent to the backend.
    pub records_sent: usize,
    /// Records that gained at least one field.
    pub records_updated: usize,
    /// Records with no Line after the pass.
    pub unresolved: usize,
    pub line_only: usize,
    pub fully_resolved: usize,
    pub chunks_total: usize,
    /// Chunks with no eligible record; no backend call was made.
    pub chunks_skipped: usize,
    pub chunks_failed: Vec<FailedChunk>,
    pub downgrades: usize,
    /// Valid Items whose Line disagreed with the record's existing Line.
    pub line_conflicts: usize,
    #[serde(skip)]
    pub log: BatchLog,
}

impl PassReport {
    /// One-line summary for logs and notifications.
    pub fn summary(&self) -> String {
        format!(
            "{} pass {}: {} records, {} sent, {} updated, {} still unresolved, {} chunks failed, {} downgrades",
            self.pass,
            self.status.as_str(),
            self.records_total,
            self.records_sent,
            self.records_updated,
            self.unresolved,
            self.chunks_failed.len(),
            self.downgrades,
        )
    }
}

/// Records after a pass, in original order, plus what happened.
#[derive(Debug, Clone)]
pub struct PassOutcome {
    pub records: Vec<Record>,
    /// One per chunk, in chunk-index order.
    pub outputs: Vec<ChunkOutput>,
    pub report: PassReport,
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ApplyStats {
    updated: usize,
    downgrades: usize,
    line_conflicts: usize,
}

/// Run one pass over the full record set.
#[instrument(skip_all, fields(pass = %controller.kind(), records = records.len()))]
pub async fn run_pass(
    ctx: &RunContext,
    controller: &dyn PassController,
    records: Vec<Record>,
    dispatcher: &Dispatcher,
    progress: &dyn ProgressReporter,
) -> Result<PassOutcome> {
    let pass = controller.kind();
    let profile = controller.configure();
    let reference = controller.reference();
    if profile.attach_reference && reference.is_none() {
        return Err(LinetagError::validation(format!(
            "{pass} pass requires a reference taxonomy"
        )));
    }

    let records_total = records.len();
    let chunks = chunker::split(records, ctx.batch.chunk_size)?;
    let chunks_total = chunks.len();

    let to_send: Vec<Chunk> = chunks
        .iter()
        .filter_map(|chunk| {
            let eligible: Vec<Record> = chunk
                .records
                .iter()
                .filter(|r| controller.eligible(r))
                .cloned()
                .collect();
            (!eligible.is_empty()).then(|| Chunk {
                index: chunk.index,
                records: eligible,
            })
        })
        .collect();
    let records_sent: usize = to_send.iter().map(Chunk::len).sum();
    let chunks_skipped = chunks_total - to_send.len();

    info!(records_total, records_sent, chunks_total, chunks_skipped, "pass starting");
    progress.phase(&format!("{pass} pass: {records_sent} records in {} chunks", to_send.len()));

    ctx.layout.reset_pass_dir(pass)?;
    let validation = profile.validation;
    let dispatch = dispatcher
        .run(to_send, Arc::new(profile), reference.clone(), progress)
        .await;
    let status = dispatch.status();

    let mut successes: HashMap<usize, ChunkSuccess> =
        dispatch.successes.into_iter().map(|s| (s.index, s)).collect();
    let failures: HashMap<usize, ChunkFailure> =
        dispatch.failures.into_iter().map(|f| (f.index, f)).collect();

    let mut stats = ApplyStats::default();
    let mut outputs = Vec::with_capacity(chunks_total);
    let mut metas = Vec::with_capacity(chunks_total);
    let mut chunks_failed = Vec::new();

    for mut chunk in chunks {
        let output = if let Some(success) = successes.remove(&chunk.index) {
            apply_proposals(
                controller,
                validation,
                reference.as_deref(),
                &mut chunk,
                success.proposals,
                &mut stats,
            );
            ChunkOutput {
                pass,
                chunk_index: chunk.index,
                status: ChunkStatus::Completed,
                attempts: success.attempts,
                error: None,
                records: chunk.records,
            }
        } else if let Some(failure) = failures.get(&chunk.index) {
            chunks_failed.push(FailedChunk {
                index: failure.index,
                attempts: failure.attempts,
                error: failure.error.to_string(),
            });
            ChunkOutput {
                pass,
                chunk_index: chunk.index,
                status: ChunkStatus::Failed,
                attempts: failure.attempts,
                error: Some(failure.error.to_string()),
                records: chunk.records,
            }
        } else {
            ChunkOutput {
                pass,
                chunk_index: chunk.index,
                status: ChunkStatus::Completed,
                attempts: 0,
                error: None,
                records: chunk.records,
            }
        };

        metas.push(ctx.layout.write_chunk_output(&output)?);
        outputs.push(output);
    }
    ctx.layout.update_manifest(&format!("{pass}/"), &metas)?;

    let records: Vec<Record> = outputs
        .iter()
        .flat_map(|o| o.records.iter().cloned())
        .collect();
    let count = |status: ResolutionStatus| {
        records
            .iter()
            .filter(|r| r.status() == Some(status))
            .count()
    };

    let report = PassReport {
        pass,
        status,
        records_total,
        records_sent,
        records_updated: stats.updated,
        unresolved: count(ResolutionStatus::Unresolved),
        line_only: count(ResolutionStatus::LineOnly),
        fully_resolved: count(ResolutionStatus::FullyResolved),
        chunks_total,
        chunks_skipped,
        chunks_failed,
        downgrades: stats.downgrades,
        line_conflicts: stats.line_conflicts,
        log: dispatch.log,
    };
    info!(summary = %report.summary(), "pass finished");

    Ok(PassOutcome {
        records,
        outputs,
        report,
    })
}

/// Validate and apply one chunk's proposals to its eligible records.
fn apply_proposals(
    controller: &dyn PassController,
    validation: ValidationRule,
    reference: Option<&ReferenceTaxonomy>,
    chunk: &mut Chunk,
    proposals: Vec<Proposal>,
    stats: &mut ApplyStats,
) {
    let mut by_id: HashMap<RecordId, Proposal> =
        proposals.into_iter().map(|p| (p.id.clone(), p)).collect();

    for record in chunk.records.iter_mut() {
        if !controller.eligible(record) {
            continue;
        }
        let Some(proposal) = by_id.remove(&record.id) else {
            continue;
        };

        let verdict = validate(validation, &proposal, reference);
        if let Verdict::Downgraded { reason, .. } = &verdict {
            stats.downgrades += 1;
            info!(
                chunk = chunk.index,
                id = %record.id,
                keyword = %record.keyword,
                ?reason,
                proposed_line = ?proposal.line,
                proposed_item = ?proposal.item,
                "proposal downgraded"
            );
        }

        let (line, item) = verdict.values();
        let change = record.fill_from(line, item);
        if change.any() {
            stats.updated += 1;
        }
        if item.is_some() && record.item.is_none() {
            stats.line_conflicts += 1;
            debug!(
                chunk = chunk.index,
                id = %record.id,
                existing_line = ?record.line,
                proposed_line = ?line,
                "item ignored: proposed line differs from existing line"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchSettings;
    use crate::progress::SilentProgress;
    use crate::retry::RetryPolicy;
    use chrono::NaiveDate;
    use linetag_artifacts::ArtifactLayout;
    use linetag_classifier::{ClassifyError, MockClassifier};
    use linetag_shared::BatchConfig;
    use std::time::Duration;

    fn context(chunk_size: usize) -> RunContext {
        let root = std::env::temp_dir().join(format!("lt-pass-test-{}", uuid::Uuid::now_v7()));
        let date = NaiveDate::from_ymd_opt(2026, 10, 12).unwrap();
        let batch = BatchConfig {
            chunk_size,
            ..BatchConfig::default()
        };
        RunContext::new(ArtifactLayout::new(root, date), batch).unwrap()
    }

    fn dispatcher(mock: Arc<MockClassifier>) -> Dispatcher {
        Dispatcher::new(
            mock,
            DispatchSettings {
                concurrency: 2,
                retry: RetryPolicy::immediate(2, 1),
                call_timeout: Duration::from_secs(5),
            },
        )
    }

    fn taxonomy() -> Arc<ReferenceTaxonomy> {
        Arc::new(ReferenceTaxonomy::from_map([
            ("Pumps", vec!["Gear Pump", "Piston Pump"]),
            ("Valves", vec!["Ball Valve", "Gate Valve"]),
        ]))
    }

    fn record(id: usize, keyword: &str) -> Record {
        Record::new(RecordId::from_row(id), keyword)
    }

    #[tokio::test]
    async fn line_pass_fills_lines_and_writes_every_chunk() {
        let ctx = context(2);
        let mock = Arc::new(
            MockClassifier::new()
                .with_answer(PassKind::Line, "gear pump", Some("Pumps"), Some("Gear Pump"))
                .with_answer(PassKind::Line, "ball valve", Some("Valves"), None)
                .with_answer(PassKind::Line, "orphan", None, Some("Gear Pump")),
        );
        let records = vec![
            record(1, "gear pump"),
            record(2, "ball valve"),
            record(3, "orphan"),
        ];

        let outcome = run_pass(
            &ctx,
            &LinePass::new("Classify."),
            records,
            &dispatcher(mock),
            &SilentProgress,
        )
        .await
        .unwrap();

        let report = &outcome.report;
        assert_eq!(report.status, PassStatus::Success);
        assert_eq!(report.records_sent, 3);
        assert_eq!(report.fully_resolved, 1);
        assert_eq!(report.line_only, 1);
        assert_eq!(report.unresolved, 1);
        assert_eq!(report.downgrades, 1);
        assert_eq!(outcome.records[2].status(), Some(ResolutionStatus::Unresolved));

        let on_disk = ctx.layout.read_pass_outputs(PassKind::Line).unwrap();
        assert_eq!(on_disk, outcome.outputs);
        assert_eq!(on_disk.len(), 2);
    }

    #[tokio::test]
    async fn item_pass_skips_fully_resolved_records() {
        let ctx = context(2);
        let mock = Arc::new(
            MockClassifier::new()
                // Would overwrite if the record were ever sent.
                .with_answer(PassKind::Item, "done", Some("Valves"), Some("Gate Valve"))
                .with_answer(PassKind::Item, "partial", Some("Pumps"), Some("piston pump")),
        );
        let done = record(1, "done").with_labels(Some("Pumps"), Some("Gear Pump"));
        let done_too = record(2, "done too").with_labels(Some("Valves"), Some("Ball Valve"));
        let partial = record(3, "partial").with_labels(Some("Pumps"), None);

        let outcome = run_pass(
            &ctx,
            &ItemPass::new("Refine.", taxonomy()),
            vec![done.clone(), done_too.clone(), partial],
            &dispatcher(mock.clone()),
            &SilentProgress,
        )
        .await
        .unwrap();

        assert_eq!(mock.received(PassKind::Item), vec![RecordId::from_row(3)]);
        // Chunk 0 held only resolved records: no call at all.
        assert_eq!(mock.attempts(PassKind::Item, 0), 0);
        assert_eq!(outcome.report.chunks_skipped, 1);
        assert_eq!(outcome.records[0], done);
        assert_eq!(outcome.records[1], done_too);
        assert_eq!(outcome.records[2].item.as_deref(), Some("Piston Pump"));
    }

    #[tokio::test]
    async fn fields_never_overwritten_or_cleared() {
        let ctx = context(5);
        let mock = Arc::new(
            MockClassifier::new()
                .with_answer(PassKind::Item, "pump seal", Some("Valves"), Some("Ball Valve"))
                .with_answer(PassKind::Item, "valve kit", None, None),
        );
        let records = vec![
            record(1, "pump seal").with_labels(Some("Pumps"), None),
            record(2, "valve kit").with_labels(Some("Valves"), None),
        ];

        let outcome = run_pass(
            &ctx,
            &ItemPass::new("Refine.", taxonomy()),
            records.clone(),
            &dispatcher(mock),
            &SilentProgress,
        )
        .await
        .unwrap();

        for (before, after) in records.iter().zip(&outcome.records) {
            assert_eq!(before.line, after.line);
            if before.item.is_some() {
                assert_eq!(before.item, after.item);
            }
        }
        assert_eq!(outcome.records[0].item, None);
        assert_eq!(outcome.report.line_conflicts, 1);
        assert_eq!(outcome.report.records_updated, 0);
    }

    #[tokio::test]
    async fn failed_chunk_carries_records_unchanged() {
        let ctx = context(1);
        let mock = Arc::new(
            MockClassifier::new()
                .with_answer(PassKind::Line, "a", Some("Pumps"), None)
                .with_answer(PassKind::Line, "b", Some("Pumps"), None)
                .failing_always(PassKind::Line, 1, ClassifyError::backend("HTTP 401", false)),
        );

        let outcome = run_pass(
            &ctx,
            &LinePass::new("Classify."),
            vec![record(1, "a"), record(2, "b")],
            &dispatcher(mock),
            &SilentProgress,
        )
        .await
        .unwrap();

        assert_eq!(outcome.report.status, PassStatus::PartialSuccess);
        assert_eq!(outcome.report.chunks_failed.len(), 1);
        assert_eq!(outcome.report.chunks_failed[0].index, 1);
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.records[1].line, None);
        assert_eq!(outcome.outputs[1].status, ChunkStatus::Failed);
        assert!(outcome.outputs[1].error.as_deref().unwrap().contains("401"));
    }

    #[tokio::test]
    async fn rerun_replaces_previous_chunk_files() {
        let ctx = context(1);
        let mock = Arc::new(MockClassifier::new());
        let dispatcher = dispatcher(mock);
        let pass = LinePass::new("Classify.");

        let three = vec![record(1, "a"), record(2, "b"), record(3, "c")];
        run_pass(&ctx, &pass, three, &dispatcher, &SilentProgress)
            .await
            .unwrap();
        run_pass(&ctx, &pass, vec![record(1, "a")], &dispatcher, &SilentProgress)
            .await
            .unwrap();

        assert_eq!(ctx.layout.read_pass_outputs(PassKind::Line).unwrap().len(), 1);
        let manifest = ctx.layout.read_manifest().unwrap().unwrap();
        assert_eq!(manifest.artifacts.len(), 1);
    }

    struct NoTaxonomyPass;

    impl PassController for NoTaxonomyPass {
        fn kind(&self) -> PassKind {
            PassKind::Item
        }

        fn configure(&self) -> PromptProfile {
            PromptProfile {
                pass: PassKind::Item,
                instructions: String::new(),
                attach_reference: true,
                eligibility: Eligibility::MissingLineOrItem,
                validation: ValidationRule::ItemWithinLine,
            }
        }
    }

    #[tokio::test]
    async fn attached_reference_is_required() {
        let ctx = context(5);
        let err = run_pass(
            &ctx,
            &NoTaxonomyPass,
            vec![record(1, "a")],
            &dispatcher(Arc::new(MockClassifier::new())),
            &SilentProgress,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("reference taxonomy"));
    }
}
