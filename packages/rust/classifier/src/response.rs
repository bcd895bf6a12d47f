//! Reading a backend reply into one proposal per chunk record.

use std::collections::HashMap;
use std::sync::LazyLock;

use linetag_shared::{Chunk, Proposal, RecordId};
use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use crate::error::ClassifyError;

static FENCED_JSON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)\s*```").expect("valid regex"));

#[derive(Debug, Deserialize)]
struct ResultsEnvelope {
    results: Vec<Proposal>,
}

/// Strip a surrounding Markdown code fence, if any.
fn unfence(content: &str) -> &str {
    FENCED_JSON
        .captures(content)
        .and_then(|caps| caps.get(1))
        .map_or_else(|| content.trim(), |m| m.as_str())
}

/// Parse `{"results": [...]}` (or a bare array) out of the reply content.
pub fn parse_proposals(content: &str) -> Result<Vec<Proposal>, ClassifyError> {
    let body = unfence(content);
    if body.is_empty() {
        return Err(ClassifyError::format("empty reply"));
    }

    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| ClassifyError::format(format!("reply is not JSON: {e}")))?;

    let proposals = if value.is_array() {
        serde_json::from_value::<Vec<Proposal>>(value)
    } else {
        serde_json::from_value::<ResultsEnvelope>(value).map(|env| env.results)
    };

    proposals.map_err(|e| ClassifyError::format(format!("unexpected reply shape: {e}")))
}

/// Align parsed proposals with the chunk: exactly one proposal per record,
/// in chunk order.
///
/// Records the reply skipped become "no match". Ids the chunk does not
/// contain are ignored; for repeated ids the first answer wins.
pub fn align_with_chunk(chunk: &Chunk, proposals: Vec<Proposal>) -> Vec<Proposal> {
    let mut by_id: HashMap<RecordId, Proposal> = HashMap::with_capacity(proposals.len());
    for proposal in proposals {
        if !chunk.contains(&proposal.id) {
            warn!(chunk = chunk.index, id = %proposal.id, "reply names an id outside the chunk");
            continue;
        }
        if by_id.contains_key(&proposal.id) {
            warn!(chunk = chunk.index, id = %proposal.id, "duplicate id in reply, keeping first");
            continue;
        }
        by_id.insert(proposal.id.clone(), proposal);
    }

    chunk
        .records
        .iter()
        .map(|record| {
            by_id
                .remove(&record.id)
                .unwrap_or_else(|| Proposal::no_match(record.id.clone()))
        })
        .collect()
}
