use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::models::{MatchDecision, Participant, ScoreWeights};

/// Pluggable compatibility strategy
///
/// Implementations must be pure and deterministic for the same attribute
/// inputs so matching passes are reproducible in tests.
pub trait CompatibilityPolicy: Send + Sync {
    /// Decide whether the candidate set may form a match
    ///
    /// Scores are totally ordered; the matcher prefers the best of several
    /// feasible sets found within one pass.
    fn evaluate(&self, candidates: &[Participant]) -> MatchDecision;
}

/// Evaluate a policy, absorbing panics as `NoMatch`
///
/// A faulty policy must never abort a matching pass.
pub fn evaluate_guarded(
    policy: &dyn CompatibilityPolicy,
    candidates: &[Participant],
) -> MatchDecision {
    match catch_unwind(AssertUnwindSafe(|| policy.evaluate(candidates))) {
        Ok(decision) => decision,
        Err(_) => {
            tracing::warn!(
                candidates = candidates.len(),
                "Compatibility policy panicked, treating as no-match"
            );
            MatchDecision::NoMatch
        }
    }
}

/// Maximum fluency spread tolerated within a set
const FLUENCY_TOLERANCE: u8 = 1;

/// Default policy for conversation-partner matching
///
/// Hard requirements: same language, fluency levels within tolerance, at
/// least one topic shared by the whole set, and no two members from the same
/// originating session. Soft signals (topic overlap size, dating agreement)
/// only shape the score.
#[derive(Debug, Clone)]
pub struct ConversationPolicy {
    weights: ScoreWeights,
}

impl ConversationPolicy {
    pub fn new(weights: ScoreWeights) -> Self {
        Self { weights }
    }

    pub fn with_default_weights() -> Self {
        Self {
            weights: ScoreWeights::default(),
        }
    }

    fn shared_topics(candidates: &[Participant]) -> Vec<String> {
        let mut iter = candidates.iter();
        let first = match iter.next() {
            Some(p) => p,
            None => return vec![],
        };
        let mut shared: HashSet<&str> =
            first.criteria.topics.iter().map(String::as_str).collect();
        for p in iter {
            let topics: HashSet<&str> = p.criteria.topics.iter().map(String::as_str).collect();
            shared.retain(|t| topics.contains(t));
        }
        shared.into_iter().map(str::to_string).collect()
    }
}

impl CompatibilityPolicy for ConversationPolicy {
    fn evaluate(&self, candidates: &[Participant]) -> MatchDecision {
        if candidates.len() < 2 {
            return MatchDecision::NoMatch;
        }

        // Distinct participants from distinct sessions
        let mut ids = HashSet::new();
        let mut sessions = HashSet::new();
        for p in candidates {
            if !ids.insert(p.id.as_str()) || !sessions.insert(p.session_id.as_str()) {
                return MatchDecision::NoMatch;
            }
        }

        let first = &candidates[0];
        if candidates
            .iter()
            .any(|p| p.criteria.bucket_key() != first.criteria.bucket_key())
        {
            return MatchDecision::NoMatch;
        }

        let min_fluency = candidates.iter().map(|p| p.criteria.fluency).min().unwrap_or(0);
        let max_fluency = candidates.iter().map(|p| p.criteria.fluency).max().unwrap_or(0);
        let spread = max_fluency - min_fluency;
        if spread > FLUENCY_TOLERANCE {
            return MatchDecision::NoMatch;
        }

        let shared = Self::shared_topics(candidates);
        if shared.is_empty() {
            return MatchDecision::NoMatch;
        }

        // A set where everyone wants dating-mode needs distinct genders
        if candidates.iter().all(|p| p.criteria.dating) {
            let mut genders = HashSet::new();
            if !candidates.iter().all(|p| genders.insert(p.gender.as_str())) {
                return MatchDecision::NoMatch;
            }
        }

        // Score components, each 0-1
        let language_score = 1.0;
        let fluency_score = 1.0 - (spread as f64 / (FLUENCY_TOLERANCE as f64 + 1.0));
        let smallest_topic_list = candidates
            .iter()
            .map(|p| p.criteria.topics.len())
            .min()
            .unwrap_or(1)
            .max(1);
        let topic_score = (shared.len() as f64 / smallest_topic_list as f64).min(1.0);
        let dating_agreement = candidates
            .iter()
            .all(|p| p.criteria.dating == first.criteria.dating);
        let dating_score = if dating_agreement { 1.0 } else { 0.0 };

        let score = language_score * self.weights.language
            + fluency_score * self.weights.fluency
            + topic_score * self.weights.topics
            + dating_score * self.weights.dating;

        tracing::trace!(
            score,
            fluency_score,
            topic_score,
            dating_score,
            shared = ?shared,
            "Candidate set is feasible"
        );

        MatchDecision::Match {
            score: score.clamp(0.0, 1.0),
        }
    }
}
