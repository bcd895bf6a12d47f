//! Core batch classification engine for Linetag.
//!
//! This crate ties together chunking, concurrent dispatch to a classifier,
//! the two classification passes, and reconciliation of their outputs into
//! one merged table (see [`pipeline::run_pipeline`]).

pub mod chunker;
pub mod context;
pub mod dispatch;
pub mod merger;
pub mod notify;
pub mod pass;
pub mod pipeline;
pub mod progress;
pub mod publish;
pub mod retry;
pub mod source;
pub mod validate;

pub use context::RunContext;
pub use dispatch::{DispatchReport, DispatchSettings, Dispatcher, PassStatus, StorageSink};
pub use merger::{MergedRow, MergedTable};
pub use notify::{NoopNotifier, Notifier, WebhookNotifier};
pub use pass::{ItemPass, LinePass, PassController, PassOutcome, PassReport};
pub use pipeline::{PipelineDeps, PipelineOptions, RunStatus, RunSummary, run_pipeline};
pub use progress::{ProgressReporter, SilentProgress};
pub use publish::{HttpPublisher, Publisher};
pub use retry::RetryPolicy;
pub use source::{FileSource, HttpSource, RecordSource};
