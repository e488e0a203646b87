//! Parley Engine - Matchmaking backend for the Parley conversation-partner service
//!
//! This library pairs waiting participants into conversation matches. It keeps
//! an arrival-ordered waiting pool sharded by language bucket, runs periodic
//! matching passes under a pluggable compatibility policy, walks each proposed
//! match through an explicit confirmation lifecycle, and delivers terminal
//! outcomes downstream with at-least-once retries and an idempotency key.

pub mod config;
pub mod core;
pub mod models;
pub mod routes;
pub mod services;

// Re-export commonly used types
pub use crate::core::{
    CompatibilityPolicy, ConversationPolicy, LifecycleManager, MatchEngine, Matcher, RequestQueue,
};
pub use crate::models::{MatchCriteria, MatchProposal, Participant, ProposalState, ScoreWeights};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        // Verify that the library exports work correctly
        let criteria = MatchCriteria {
            language: "EN".to_string(),
            fluency: 5,
            topics: vec!["music".to_string()],
            dating: false,
        };
        assert_eq!(criteria.bucket_key(), "en");
    }
}
