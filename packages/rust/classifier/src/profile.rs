//! Prompt profiles: what a pass asks of the backend and which records it
//! sends.

use linetag_shared::{PassKind, Record};
use serde::{Deserialize, Serialize};

/// Which records a pass sends to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Eligibility {
    /// Every record.
    All,
    /// Records whose Line or Item is still null.
    MissingLineOrItem,
}

impl Eligibility {
    pub fn admits(&self, record: &Record) -> bool {
        match self {
            Self::All => true,
            Self::MissingLineOrItem => record.line.is_none() || record.item.is_none(),
        }
    }
}

/// How proposals are checked before they are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationRule {
    /// Accept proposals as returned (an Item without a Line is still dropped).
    None,
    /// The Item must belong to the Line's allowed set in the reference taxonomy.
    ItemWithinLine,
}

/// Everything a classifier needs to know about the pass it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptProfile {
    pub pass: PassKind,
    pub instructions: String,
    /// Whether the reference taxonomy is sent with each call.
    pub attach_reference: bool,
    pub eligibility: Eligibility,
    pub validation: ValidationRule,
}
