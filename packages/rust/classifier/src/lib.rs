//! Classification backends for Linetag.
//!
//! A [`Classifier`] turns one chunk of keyword records into one
//! [`Proposal`] per record. The batch dispatcher owns timeouts and retries;
//! implementations only report typed failures ([`ClassifyError`]).
//!
//! Two implementations ship here:
//! - [`HttpClassifier`]: OpenAI-compatible chat-completions endpoint
//! - `MockClassifier`: keyword table with scripted failures, behind the
//!   `mock` feature (testing only)

pub mod error;
pub mod http;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod profile;
pub mod response;

use async_trait::async_trait;
use linetag_shared::{Chunk, Proposal, ReferenceTaxonomy};

pub use error::ClassifyError;
pub use http::HttpClassifier;
#[cfg(any(test, feature = "mock"))]
pub use mock::MockClassifier;
pub use profile::{Eligibility, PromptProfile, ValidationRule};

/// A text-classification backend.
///
/// On success the result holds exactly one proposal per chunk record, in
/// chunk order.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Human-readable backend name for logs.
    fn name(&self) -> &str;

    async fn classify(
        &self,
        chunk: &Chunk,
        profile: &PromptProfile,
        reference: Option<&ReferenceTaxonomy>,
    ) -> Result<Vec<Proposal>, ClassifyError>;
}
