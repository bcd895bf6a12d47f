//! Proposal validation against the reference taxonomy.

use linetag_classifier::ValidationRule;
use linetag_shared::{Proposal, ReferenceTaxonomy};

/// Why a proposal was narrowed before being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DowngradeReason {
    /// An Item arrived without a Line and none could be derived.
    ItemWithoutLine,
    /// The Line is not in the taxonomy.
    UnknownLine,
    /// The Item is not in the Line's allowed set.
    ItemNotInLine,
}

/// Result of checking one proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Apply as given (values in canonical spelling when a taxonomy was used).
    Accepted {
        line: Option<String>,
        item: Option<String>,
    },
    /// Apply the narrowed values; the rest of the proposal was rejected.
    Downgraded {
        line: Option<String>,
        item: Option<String>,
        reason: DowngradeReason,
    },
}

impl Verdict {
    pub fn values(&self) -> (Option<&str>, Option<&str>) {
        match self {
            Self::Accepted { line, item } | Self::Downgraded { line, item, .. } => {
                (line.as_deref(), item.as_deref())
            }
        }
    }

    pub fn is_downgrade(&self) -> bool {
        matches!(self, Self::Downgraded { .. })
    }
}

fn accepted(line: Option<&str>, item: Option<&str>) -> Verdict {
    Verdict::Accepted {
        line: line.map(str::to_string),
        item: item.map(str::to_string),
    }
}

fn downgraded(line: Option<&str>, reason: DowngradeReason) -> Verdict {
    Verdict::Downgraded {
        line: line.map(str::to_string),
        item: None,
        reason,
    }
}

/// Check a proposal under `rule`.
///
/// `ItemWithinLine` without a taxonomy rejects every labelled proposal.
pub fn validate(
    rule: ValidationRule,
    proposal: &Proposal,
    taxonomy: Option<&ReferenceTaxonomy>,
) -> Verdict {
    let line = proposal.line.as_deref();
    let item = proposal.item.as_deref();

    match rule {
        ValidationRule::None => match (line, item) {
            (None, Some(_)) => downgraded(None, DowngradeReason::ItemWithoutLine),
            _ => accepted(line, item),
        },
        ValidationRule::ItemWithinLine => {
            let Some(taxonomy) = taxonomy else {
                return match line {
                    None if item.is_none() => accepted(None, None),
                    _ => downgraded(None, DowngradeReason::UnknownLine),
                };
            };
            within_line(taxonomy, line, item)
        }
    }
}

fn within_line(taxonomy: &ReferenceTaxonomy, line: Option<&str>, item: Option<&str>) -> Verdict {
    match (line, item) {
        (None, None) => accepted(None, None),
        (Some(line), item) => {
            let Some(canonical_line) = taxonomy.canonical_line(line) else {
                return downgraded(None, DowngradeReason::UnknownLine);
            };
            match item {
                None => accepted(Some(canonical_line), None),
                Some(item) => match taxonomy.canonical_item(canonical_line, item) {
                    Some(canonical_item) => accepted(Some(canonical_line), Some(canonical_item)),
                    None => downgraded(Some(canonical_line), DowngradeReason::ItemNotInLine),
                },
            }
        }
        (None, Some(item)) => match taxonomy.owners_of_item(item).as_slice() {
            [(owner, canonical_item)] => accepted(Some(*owner), Some(*canonical_item)),
            _ => downgraded(None, DowngradeReason::ItemWithoutLine),
        },
    }
}
