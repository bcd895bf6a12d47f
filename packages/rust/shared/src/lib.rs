//! Shared types, error model, and configuration for Linetag.
//!
//! This crate is the foundation depended on by all other Linetag crates.
//! It provides:
//! - [`LinetagError`], the unified error type
//! - Domain types ([`Record`], [`Chunk`], [`Proposal`], [`PassKind`], [`RunId`])
//! - The [`ReferenceTaxonomy`] used to validate Item proposals
//! - Configuration ([`AppConfig`], [`BatchConfig`], config loading)

pub mod config;
pub mod error;
pub mod taxonomy;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BatchConfig, BatchSection, ClassifierConfig, DefaultsConfig, NotifyConfig,
    PassesConfig, PublishConfig, SourceConfig, config_dir, config_file_path, expand_home,
    init_config, load_config, load_config_from, validate_api_key, webhook_url,
};
pub use error::{LinetagError, Result};
pub use taxonomy::ReferenceTaxonomy;
pub use types::{
    AttemptOutcome, BatchLogEntry, Chunk, FieldChange, PassKind, Proposal, Record, RecordId,
    ResolutionStatus, RunId, labels_match, normalize_label,
};
