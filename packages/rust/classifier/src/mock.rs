//! Scripted classifier for tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use linetag_shared::{Chunk, PassKind, Proposal, RecordId, ReferenceTaxonomy};

use crate::Classifier;
use crate::error::ClassifyError;
use crate::profile::PromptProfile;

#[derive(Debug, Clone)]
struct ScriptedFailure {
    error: ClassifyError,
    /// `None` fails forever; `Some(n)` fails the first `n` attempts.
    remaining: Option<u32>,
}

#[derive(Debug, Default)]
struct MockState {
    attempts: HashMap<(PassKind, usize), u32>,
    failures: HashMap<(PassKind, usize), ScriptedFailure>,
    received: HashMap<PassKind, Vec<RecordId>>,
}

/// Classifier answering from a keyword table.
///
/// Answers are keyed by pass and lowercase keyword; unknown keywords get
/// "no match". Failures are scripted per (pass, chunk index).
#[derive(Debug, Default)]
pub struct MockClassifier {
    answers: HashMap<(PassKind, String), (Option<String>, Option<String>)>,
    delays: HashMap<(PassKind, usize), Duration>,
    state: Mutex<MockState>,
}

impl MockClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the answer for `keyword` in `pass`.
    pub fn with_answer(
        mut self,
        pass: PassKind,
        keyword: &str,
        line: Option<&str>,
        item: Option<&str>,
    ) -> Self {
        self.answers.insert(
            (pass, keyword.to_lowercase()),
            (line.map(str::to_string), item.map(str::to_string)),
        );
        self
    }

    /// Fail every attempt on the given chunk.
    pub fn failing_always(self, pass: PassKind, chunk: usize, error: ClassifyError) -> Self {
        self.script_failure(pass, chunk, error, None)
    }

    /// Fail the first `times` attempts on the given chunk, then answer normally.
    pub fn failing_times(
        self,
        pass: PassKind,
        chunk: usize,
        times: u32,
        error: ClassifyError,
    ) -> Self {
        self.script_failure(pass, chunk, error, Some(times))
    }

    /// Sleep before answering the given chunk.
    pub fn with_delay(mut self, pass: PassKind, chunk: usize, delay: Duration) -> Self {
        self.delays.insert((pass, chunk), delay);
        self
    }

    fn script_failure(
        mut self,
        pass: PassKind,
        chunk: usize,
        error: ClassifyError,
        remaining: Option<u32>,
    ) -> Self {
        if let Ok(state) = self.state.get_mut() {
            state
                .failures
                .insert((pass, chunk), ScriptedFailure { error, remaining });
        }
        self
    }

    /// Attempts made so far on a chunk.
    pub fn attempts(&self, pass: PassKind, chunk: usize) -> u32 {
        self.state
            .lock()
            .map(|s| s.attempts.get(&(pass, chunk)).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Total attempts across all chunks of a pass.
    pub fn total_attempts(&self, pass: PassKind) -> u32 {
        self.state
            .lock()
            .map(|s| {
                s.attempts
                    .iter()
                    .filter(|((p, _), _)| *p == pass)
                    .map(|(_, n)| n)
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Record ids sent to the backend in a pass, deduplicated, in arrival order.
    pub fn received(&self, pass: PassKind) -> Vec<RecordId> {
        self.state
            .lock()
            .map(|s| s.received.get(&pass).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Bookkeeping for one call; returns the scripted failure, if any fires.
    fn begin_attempt(&self, pass: PassKind, chunk: &Chunk) -> Option<ClassifyError> {
        let mut state = self.state.lock().ok()?;
        *state.attempts.entry((pass, chunk.index)).or_insert(0) += 1;

        let seen = state.received.entry(pass).or_default();
        for record in &chunk.records {
            if !seen.contains(&record.id) {
                seen.push(record.id.clone());
            }
        }

        let failure = state.failures.get_mut(&(pass, chunk.index))?;
        match failure.remaining.as_mut() {
            None => Some(failure.error.clone()),
            Some(0) => None,
            Some(n) => {
                *n -= 1;
                Some(failure.error.clone())
            }
        }
    }
}

#[async_trait]
impl Classifier for MockClassifier {
    fn name(&self) -> &str {
        "mock"
    }

    async fn classify(
        &self,
        chunk: &Chunk,
        profile: &PromptProfile,
        _reference: Option<&ReferenceTaxonomy>,
    ) -> Result<Vec<Proposal>, ClassifyError> {
        let pass = profile.pass;
        let failure = self.begin_attempt(pass, chunk);

        if let Some(delay) = self.delays.get(&(pass, chunk.index)) {
            tokio::time::sleep(*delay).await;
        }
        if let Some(error) = failure {
            return Err(error);
        }

        Ok(chunk
            .records
            .iter()
            .map(|record| {
                match self.answers.get(&(pass, record.keyword.to_lowercase())) {
                    Some((line, item)) => {
                        Proposal::new(record.id.clone(), line.as_deref(), item.as_deref())
                    }
                    None => Proposal::no_match(record.id.clone()),
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{Eligibility, ValidationRule};
    use linetag_shared::Record;

    fn line_profile() -> PromptProfile {
        PromptProfile {
            pass: PassKind::Line,
            instructions: String::new(),
            attach_reference: false,
            eligibility: Eligibility::All,
            validation: ValidationRule::None,
        }
    }

    fn chunk(index: usize) -> Chunk {
        Chunk {
            index,
            records: vec![Record::new(RecordId::new(index.to_string()), "Gear Pump")],
        }
    }

    #[tokio::test]
    async fn answers_by_keyword_case_insensitively() {
        let mock = MockClassifier::new().with_answer(PassKind::Line, "gear pump", Some("Pumps"), None);
        let proposals = mock.classify(&chunk(0), &line_profile(), None).await.unwrap();
        assert_eq!(proposals[0].line.as_deref(), Some("Pumps"));
        assert_eq!(mock.attempts(PassKind::Line, 0), 1);
        assert_eq!(mock.received(PassKind::Line), vec![RecordId::new("0")]);
    }

    #[tokio::test]
    async fn scripted_failures_run_out() {
        let mock = MockClassifier::new().failing_times(
            PassKind::Line,
            1,
            2,
            ClassifyError::backend("HTTP 503", true),
        );
        assert!(mock.classify(&chunk(1), &line_profile(), None).await.is_err());
        assert!(mock.classify(&chunk(1), &line_profile(), None).await.is_err());
        assert!(mock.classify(&chunk(1), &line_profile(), None).await.is_ok());
        assert!(mock.classify(&chunk(2), &line_profile(), None).await.is_ok());
        assert_eq!(mock.attempts(PassKind::Line, 1), 3);
        assert_eq!(mock.total_attempts(PassKind::Line), 4);
    }
}
