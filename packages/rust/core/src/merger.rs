//! Reconstitutes one canonical table from the final pass's chunk outputs.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use linetag_artifacts::{ArtifactLayout, ArtifactMeta, ChunkOutput, ChunkStatus};
use linetag_shared::{LinetagError, PassKind, RecordId, ResolutionStatus, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

/// One row of the merged output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedRow {
    pub id: RecordId,
    pub keyword: String,
    pub line: Option<String>,
    pub item: Option<String>,
    pub status: ResolutionStatus,
}

/// The merged table of one run, in chunk-index order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedTable {
    pub run_date: String,
    pub merged_at: DateTime<Utc>,
    /// Chunks whose final-pass dispatch failed; their records are carried.
    pub failed_chunks: Vec<usize>,
    pub rows: Vec<MergedRow>,
}

impl MergedTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn count(&self, status: ResolutionStatus) -> usize {
        self.rows.iter().filter(|r| r.status == status).count()
    }

    /// Rows with at least a Line.
    pub fn resolved(&self) -> usize {
        self.len() - self.count(ResolutionStatus::Unresolved)
    }

    pub fn unresolved(&self) -> usize {
        self.count(ResolutionStatus::Unresolved)
    }
}

/// Merge chunk outputs and check global invariants.
///
/// Fails with [`LinetagError::Reconciliation`] on a duplicate chunk index, a
/// duplicate record id, a record with an Item but no Line, or a row count
/// different from `expected`.
pub fn merge(run_date: &str, mut outputs: Vec<ChunkOutput>, expected: usize) -> Result<MergedTable> {
    outputs.sort_by_key(|o| o.chunk_index);

    let mut seen_chunks = HashSet::new();
    let mut seen_ids = HashSet::new();
    let mut failed_chunks = Vec::new();
    let mut rows = Vec::with_capacity(expected);

    for output in outputs {
        if !seen_chunks.insert(output.chunk_index) {
            return Err(LinetagError::reconciliation(format!(
                "chunk {} appears more than once",
                output.chunk_index
            )));
        }
        if output.status == ChunkStatus::Failed {
            failed_chunks.push(output.chunk_index);
        }

        for record in output.records {
            let Some(status) = record.status() else {
                return Err(LinetagError::reconciliation(format!(
                    "record {} in chunk {} has an item but no line",
                    record.id, output.chunk_index
                )));
            };
            if !seen_ids.insert(record.id.clone()) {
                return Err(LinetagError::reconciliation(format!(
                    "record id {} appears more than once",
                    record.id
                )));
            }
            rows.push(MergedRow {
                id: record.id,
                keyword: record.keyword,
                line: record.line,
                item: record.item,
                status,
            });
        }
    }

    if rows.len() != expected {
        return Err(LinetagError::reconciliation(format!(
            "merged {} records, expected {expected}",
            rows.len()
        )));
    }

    Ok(MergedTable {
        run_date: run_date.to_string(),
        merged_at: Utc::now(),
        failed_chunks,
        rows,
    })
}

/// Merge the chunk files of `pass` found in the run's artifact directory.
#[instrument(skip_all, fields(run_date = %layout.run_date_str(), %pass, expected))]
pub fn merge_pass_dir(layout: &ArtifactLayout, pass: PassKind, expected: usize) -> Result<MergedTable> {
    let outputs = layout.read_pass_outputs(pass)?;
    let table = merge(&layout.run_date_str(), outputs, expected)?;
    info!(
        rows = table.len(),
        fully_resolved = table.count(ResolutionStatus::FullyResolved),
        line_only = table.count(ResolutionStatus::LineOnly),
        unresolved = table.unresolved(),
        "merge complete"
    );
    Ok(table)
}

/// Record count of a pass on disk, used as the expected count when
/// re-merging a finished run.
pub fn records_in_pass_dir(layout: &ArtifactLayout, pass: PassKind) -> Result<usize> {
    Ok(layout
        .read_pass_outputs(pass)?
        .iter()
        .map(|o| o.records.len())
        .sum())
}

/// Write the merged table and register it in the run manifest.
pub fn write_merged_table(layout: &ArtifactLayout, table: &MergedTable) -> Result<ArtifactMeta> {
    let meta = layout.write_merged(table)?;
    layout.update_manifest("merged/", std::slice::from_ref(&meta))?;
    Ok(meta)
}
