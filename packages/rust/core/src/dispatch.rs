//! Batch dispatcher: runs a classifier over every chunk of a pass with
//! bounded concurrency, per-chunk retries and a single-writer batch log.
//!
//! One task per chunk is spawned in index order and gated by a semaphore of
//! size `concurrency`. Workers never touch the batch log directly; every
//! attempt is sent over a channel to one writer task, which appends it to the
//! in-memory [`BatchLog`] and forwards it to the optional [`LogSink`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use linetag_classifier::{ClassifyError, Classifier, PromptProfile};
use linetag_shared::{
    AttemptOutcome, BatchConfig, BatchLogEntry, Chunk, PassKind, Proposal, ReferenceTaxonomy,
    Result, RunId,
};
use linetag_storage::Storage;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, info, instrument, warn};

use crate::progress::ProgressReporter;
use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Concurrency, retry and timeout settings for one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    /// Maximum chunks in flight.
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Upper bound on one classification call.
    pub call_timeout: Duration,
}

impl From<&BatchConfig> for DispatchSettings {
    fn from(config: &BatchConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            retry: RetryPolicy::from(config),
            call_timeout: config.call_timeout,
        }
    }
}

// ---------------------------------------------------------------------------
// Batch log
// ---------------------------------------------------------------------------

/// Append-only record of every attempt of every chunk in a pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchLog {
    entries: Vec<BatchLogEntry>,
}

impl BatchLog {
    fn push(&mut self, entry: BatchLogEntry) {
        self.entries.push(entry);
    }

    /// Entries in arrival order.
    pub fn entries(&self) -> &[BatchLogEntry] {
        &self.entries
    }

    /// Entries sorted by (pass, chunk index, attempt).
    pub fn sorted(&self) -> Vec<BatchLogEntry> {
        let mut entries = self.entries.clone();
        entries.sort_by_key(|e| (e.pass, e.chunk_index, e.attempt));
        entries
    }

    /// Attempts logged for one chunk.
    pub fn attempts_for(&self, chunk_index: usize) -> u32 {
        self.entries
            .iter()
            .filter(|e| e.chunk_index == chunk_index)
            .count() as u32
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Persistent destination for batch log entries.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn append(&self, entry: &BatchLogEntry) -> Result<()>;
}

/// Writes batch log entries to the run database.
pub struct StorageSink {
    storage: Arc<Storage>,
    run_id: RunId,
}

impl StorageSink {
    pub fn new(storage: Arc<Storage>, run_id: RunId) -> Self {
        Self { storage, run_id }
    }
}

#[async_trait]
impl LogSink for StorageSink {
    async fn append(&self, entry: &BatchLogEntry) -> Result<()> {
        self.storage.append_batch_log(&self.run_id, entry).await
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// A chunk the backend answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSuccess {
    pub index: usize,
    pub attempts: u32,
    pub proposals: Vec<Proposal>,
}

/// A chunk that failed permanently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFailure {
    pub index: usize,
    pub attempts: u32,
    pub error: ClassifyError,
}

/// Whether every chunk of a dispatch succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassStatus {
    Success,
    PartialSuccess,
}

impl PassStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::PartialSuccess => "partial_success",
        }
    }
}

/// Result of dispatching every chunk of a pass.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    /// Sorted by chunk index.
    pub successes: Vec<ChunkSuccess>,
    /// Sorted by chunk index.
    pub failures: Vec<ChunkFailure>,
    pub log: BatchLog,
}

impl DispatchReport {
    pub fn status(&self) -> PassStatus {
        if self.failures.is_empty() {
            PassStatus::Success
        } else {
            PassStatus::PartialSuccess
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Runs a classifier over chunks with bounded concurrency and retries.
#[derive(Clone)]
pub struct Dispatcher {
    classifier: Arc<dyn Classifier>,
    settings: DispatchSettings,
    sink: Option<Arc<dyn LogSink>>,
}

impl Dispatcher {
    pub fn new(classifier: Arc<dyn Classifier>, settings: DispatchSettings) -> Self {
        Self {
            classifier,
            settings,
            sink: None,
        }
    }

    /// Forward every log entry to a persistent sink as well.
    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Dispatch every chunk. Never aborts on a single chunk's failure.
    #[instrument(skip_all, fields(pass = %profile.pass, chunks = chunks.len(), backend = self.classifier.name()))]
    pub async fn run(
        &self,
        chunks: Vec<Chunk>,
        profile: Arc<PromptProfile>,
        reference: Option<Arc<ReferenceTaxonomy>>,
        progress: &dyn ProgressReporter,
    ) -> DispatchReport {
        let pass = profile.pass;
        let total = chunks.len();
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let (log_tx, log_rx) = mpsc::unbounded_channel::<BatchLogEntry>();
        let writer = tokio::spawn(write_log(log_rx, self.sink.clone()));

        info!(
            concurrency = self.settings.concurrency,
            max_retries = self.settings.retry.max_retries,
            "dispatching chunks"
        );

        let mut handles = Vec::with_capacity(total);
        for chunk in chunks {
            let index = chunk.index;
            let worker = ChunkWorker {
                classifier: self.classifier.clone(),
                profile: profile.clone(),
                reference: reference.clone(),
                settings: self.settings,
                log_tx: log_tx.clone(),
            };
            // Taken before spawning: dispatch order follows chunk index.
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                handles.push((
                    index,
                    tokio::spawn(async move {
                        Err(ChunkFailure {
                            index,
                            attempts: 0,
                            error: ClassifyError::backend("dispatcher shut down", false),
                        })
                    }),
                ));
                continue;
            };

            handles.push((
                index,
                tokio::spawn(async move {
                    let _permit = permit;
                    worker.run(chunk).await
                }),
            ));
        }
        drop(log_tx);

        let mut report = DispatchReport::default();
        for (done, (index, handle)) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(Ok(success)) => report.successes.push(success),
                Ok(Err(failure)) => report.failures.push(failure),
                Err(e) => {
                    warn!(chunk = index, error = %e, "chunk worker panicked");
                    report.failures.push(ChunkFailure {
                        index,
                        attempts: 0,
                        error: ClassifyError::backend(format!("worker task failed: {e}"), false),
                    });
                }
            }
            progress.chunk_finished(pass, done + 1, total);
        }

        report.log = match writer.await {
            Ok(log) => log,
            Err(e) => {
                warn!(error = %e, "batch log writer failed");
                BatchLog::default()
            }
        };
        report.successes.sort_by_key(|s| s.index);
        report.failures.sort_by_key(|f| f.index);

        info!(
            succeeded = report.successes.len(),
            failed = report.failures.len(),
            attempts = report.log.len(),
            status = report.status().as_str(),
            "dispatch complete"
        );
        report
    }
}

/// Single writer: the only code that appends to the batch log.
async fn write_log(
    mut rx: mpsc::UnboundedReceiver<BatchLogEntry>,
    sink: Option<Arc<dyn LogSink>>,
) -> BatchLog {
    let mut log = BatchLog::default();
    while let Some(entry) = rx.recv().await {
        if let Some(sink) = &sink {
            if let Err(e) = sink.append(&entry).await {
                warn!(chunk = entry.chunk_index, attempt = entry.attempt, error = %e, "failed to persist batch log entry");
            }
        }
        log.push(entry);
    }
    log
}

/// Everything one chunk task needs, owned.
struct ChunkWorker {
    classifier: Arc<dyn Classifier>,
    profile: Arc<PromptProfile>,
    reference: Option<Arc<ReferenceTaxonomy>>,
    settings: DispatchSettings,
    log_tx: mpsc::UnboundedSender<BatchLogEntry>,
}

impl ChunkWorker {
    async fn run(self, chunk: Chunk) -> std::result::Result<ChunkSuccess, ChunkFailure> {
        let pass = self.profile.pass;
        let mut tracker = self.settings.retry.tracker();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let started = Instant::now();
            let call = self
                .classifier
                .classify(&chunk, &self.profile, self.reference.as_deref());
            let result = match tokio::time::timeout(self.settings.call_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(ClassifyError::Timeout(self.settings.call_timeout)),
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(proposals) => {
                    debug!(chunk = chunk.index, attempt, duration_ms, "chunk classified");
                    self.log(pass, &chunk, attempt, AttemptOutcome::Success, None, duration_ms);
                    return Ok(ChunkSuccess {
                        index: chunk.index,
                        attempts: attempt,
                        proposals,
                    });
                }
                Err(error) => {
                    let retry = tracker.should_retry(&error);
                    let outcome = if retry {
                        AttemptOutcome::Retry
                    } else {
                        AttemptOutcome::Failed
                    };
                    warn!(
                        chunk = chunk.index,
                        attempt,
                        kind = error.kind(),
                        error = %error,
                        will_retry = retry,
                        "classification attempt failed"
                    );
                    self.log(pass, &chunk, attempt, outcome, Some(&error), duration_ms);

                    if !retry {
                        return Err(ChunkFailure {
                            index: chunk.index,
                            attempts: attempt,
                            error,
                        });
                    }

                    let delay = self.settings.retry.delay_for(attempt);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    fn log(
        &self,
        pass: PassKind,
        chunk: &Chunk,
        attempt: u32,
        outcome: AttemptOutcome,
        error: Option<&ClassifyError>,
        duration_ms: u64,
    ) {
        let entry = BatchLogEntry {
            pass,
            chunk_index: chunk.index,
            attempt,
            outcome,
            records: chunk.len(),
            error_kind: error.map(|e| e.kind().to_string()),
            error: error.map(ToString::to_string),
            duration_ms,
        };
        // The writer outlives every worker; a send error means it already stopped.
        if self.log_tx.send(entry).is_err() {
            warn!(chunk = chunk.index, attempt, "batch log writer gone, entry dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::SilentProgress;
    use linetag_classifier::{Eligibility, MockClassifier, ValidationRule};
    use linetag_shared::{LinetagError, Record, RecordId};
    use std::sync::Mutex;

    fn profile() -> Arc<PromptProfile> {
        Arc::new(PromptProfile {
            pass: PassKind::Line,
            instructions: "Classify.".into(),
            attach_reference: false,
            eligibility: Eligibility::All,
            validation: ValidationRule::None,
        })
    }

    fn settings(concurrency: usize, max_retries: u32) -> DispatchSettings {
        DispatchSettings {
            concurrency,
            retry: RetryPolicy::immediate(max_retries, 1),
            call_timeout: Duration::from_secs(5),
        }
    }

    fn chunks(count: usize, size: usize) -> Vec<Chunk> {
        (0..count)
            .map(|index| Chunk {
                index,
                records: (0..size)
                    .map(|j| {
                        let row = index * size + j + 1;
                        Record::new(RecordId::from_row(row), format!("kw {row}"))
                    })
                    .collect(),
            })
            .collect()
    }

    #[tokio::test]
    async fn partial_failure_is_isolated() {
        let mock = Arc::new(MockClassifier::new().failing_always(
            PassKind::Line,
            5,
            ClassifyError::backend("HTTP 400 bad request", false),
        ));
        let dispatcher = Dispatcher::new(mock.clone(), settings(3, 3));

        let report = dispatcher
            .run(chunks(10, 2), profile(), None, &SilentProgress)
            .await;

        assert_eq!(report.status(), PassStatus::PartialSuccess);
        assert_eq!(report.successes.len(), 9);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].index, 5);
        assert_eq!(report.failures[0].attempts, 1);
        assert_eq!(mock.attempts(PassKind::Line, 5), 1);
        let indexes: Vec<usize> = report.successes.iter().map(|s| s.index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3, 4, 6, 7, 8, 9]);
    }

    #[tokio::test]
    async fn retry_exhaustion_makes_max_retries_plus_one_attempts() {
        let mock = Arc::new(MockClassifier::new().failing_always(
            PassKind::Line,
            0,
            ClassifyError::backend("HTTP 503", true),
        ));
        let dispatcher = Dispatcher::new(mock.clone(), settings(1, 3));

        let report = dispatcher
            .run(chunks(1, 3), profile(), None, &SilentProgress)
            .await;

        assert_eq!(mock.attempts(PassKind::Line, 0), 4);
        assert_eq!(report.failures[0].attempts, 4);
        let outcomes: Vec<AttemptOutcome> =
            report.log.sorted().iter().map(|e| e.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                AttemptOutcome::Retry,
                AttemptOutcome::Retry,
                AttemptOutcome::Retry,
                AttemptOutcome::Failed
            ]
        );
    }

    #[tokio::test]
    async fn transient_failures_recover() {
        let mock = Arc::new(MockClassifier::new().failing_times(
            PassKind::Line,
            1,
            2,
            ClassifyError::backend("HTTP 429", true),
        ));
        let dispatcher = Dispatcher::new(mock.clone(), settings(2, 3));

        let report = dispatcher
            .run(chunks(3, 2), profile(), None, &SilentProgress)
            .await;

        assert_eq!(report.status(), PassStatus::Success);
        assert_eq!(report.successes[1].attempts, 3);
        assert_eq!(report.log.attempts_for(1), 3);
        assert_eq!(report.log.len(), 5);
    }

    #[tokio::test]
    async fn malformed_responses_use_format_budget() {
        let mock = Arc::new(MockClassifier::new().failing_always(
            PassKind::Line,
            0,
            ClassifyError::format("not JSON"),
        ));
        let dispatcher = Dispatcher::new(mock.clone(), settings(1, 5));

        let report = dispatcher
            .run(chunks(1, 1), profile(), None, &SilentProgress)
            .await;

        // format_retries = 1 -> two attempts regardless of max_retries.
        assert_eq!(mock.attempts(PassKind::Line, 0), 2);
        assert_eq!(report.failures[0].error.kind(), "response_format");
    }

    #[tokio::test]
    async fn slow_calls_time_out_and_count_as_retryable() {
        let mock = Arc::new(MockClassifier::new().with_delay(
            PassKind::Line,
            0,
            Duration::from_millis(200),
        ));
        let dispatcher = Dispatcher::new(
            mock.clone(),
            DispatchSettings {
                concurrency: 1,
                retry: RetryPolicy::immediate(1, 0),
                call_timeout: Duration::from_millis(20),
            },
        );

        let report = dispatcher
            .run(chunks(1, 1), profile(), None, &SilentProgress)
            .await;

        assert_eq!(report.failures.len(), 1);
        assert!(matches!(report.failures[0].error, ClassifyError::Timeout(_)));
        assert_eq!(report.failures[0].attempts, 2);
    }

    #[tokio::test]
    async fn results_sorted_regardless_of_completion_order() {
        let mock = Arc::new(
            MockClassifier::new()
                .with_delay(PassKind::Line, 0, Duration::from_millis(60))
                .with_delay(PassKind::Line, 1, Duration::from_millis(30)),
        );
        let dispatcher = Dispatcher::new(mock, settings(3, 0));

        let report = dispatcher
            .run(chunks(3, 1), profile(), None, &SilentProgress)
            .await;

        let indexes: Vec<usize> = report.successes.iter().map(|s| s.index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
        // Chunk 2 finished first, so it was logged first.
        assert_eq!(report.log.entries()[0].chunk_index, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn dispatch_order_follows_chunk_index() {
        for _ in 0..20 {
            let mock = Arc::new(MockClassifier::new());
            let dispatcher = Dispatcher::new(mock.clone(), settings(1, 0));

            let report = dispatcher
                .run(chunks(40, 1), profile(), None, &SilentProgress)
                .await;

            assert_eq!(report.successes.len(), 40);
            let expected: Vec<RecordId> = (1..=40).map(RecordId::from_row).collect();
            assert_eq!(mock.received(PassKind::Line), expected);
            let logged: Vec<usize> = report.log.entries().iter().map(|e| e.chunk_index).collect();
            assert_eq!(logged, (0..40).collect::<Vec<_>>());
        }
    }

    struct RecordingSink {
        seen: Mutex<Vec<(usize, u32)>>,
        fail: bool,
    }

    #[async_trait]
    impl LogSink for RecordingSink {
        async fn append(&self, entry: &BatchLogEntry) -> Result<()> {
            if self.fail {
                return Err(LinetagError::Storage("disk full".into()));
            }
            self.seen
                .lock()
                .unwrap()
                .push((entry.chunk_index, entry.attempt));
            Ok(())
        }
    }

    #[tokio::test]
    async fn sink_receives_every_entry() {
        let sink = Arc::new(RecordingSink {
            seen: Mutex::new(Vec::new()),
            fail: false,
        });
        let mock = Arc::new(MockClassifier::new());
        let dispatcher = Dispatcher::new(mock, settings(2, 0)).with_sink(sink.clone());

        let report = dispatcher
            .run(chunks(4, 1), profile(), None, &SilentProgress)
            .await;

        assert_eq!(report.log.len(), 4);
        assert_eq!(sink.seen.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn sink_failures_are_not_fatal() {
        let sink = Arc::new(RecordingSink {
            seen: Mutex::new(Vec::new()),
            fail: true,
        });
        let mock = Arc::new(MockClassifier::new());
        let dispatcher = Dispatcher::new(mock, settings(1, 0)).with_sink(sink);

        let report = dispatcher
            .run(chunks(2, 1), profile(), None, &SilentProgress)
            .await;

        assert_eq!(report.status(), PassStatus::Success);
        assert_eq!(report.log.len(), 2);
    }

    #[tokio::test]
    async fn storage_sink_persists_log() {
        let db = std::env::temp_dir().join(format!("lt_dispatch_{}.db", uuid::Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&db).await.unwrap());
        let run_id = RunId::new();
        storage.insert_run(&run_id, "2026-10-12").await.unwrap();

        let sink = Arc::new(StorageSink::new(storage.clone(), run_id.clone()));
        let mock = Arc::new(MockClassifier::new().failing_times(
            PassKind::Line,
            0,
            1,
            ClassifyError::backend("HTTP 502", true),
        ));
        let dispatcher = Dispatcher::new(mock, settings(1, 2)).with_sink(sink);
        dispatcher
            .run(chunks(2, 1), profile(), None, &SilentProgress)
            .await;

        let rows = storage.list_batch_log(&run_id, Some(PassKind::Line)).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].outcome, AttemptOutcome::Retry);
        assert_eq!(rows[1].outcome, AttemptOutcome::Success);
    }
}
