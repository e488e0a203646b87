// Unit tests exercising the public matching surface

use chrono::{Duration, Utc};
use parley_engine::core::policy::CompatibilityPolicy;
use parley_engine::core::{ConversationPolicy, RequestQueue};
use parley_engine::models::{MatchCriteria, Participant, ScoreWeights};

fn participant(id: &str, language: &str, fluency: u8, topics: &[&str], dating: bool) -> Participant {
    Participant::new(
        id.to_string(),
        format!("session-{}", id),
        format!("user-{}", id),
        "female".to_string(),
        "en".to_string(),
        MatchCriteria {
            language: language.to_string(),
            fluency,
            topics: topics.iter().map(|t| t.to_string()).collect(),
            dating,
        },
    )
}

#[test]
fn test_bucket_key_is_case_insensitive() {
    let a = participant("a", "EN", 5, &["music"], false);
    let b = participant("b", "en", 5, &["music"], false);
    assert_eq!(a.bucket_key(), b.bucket_key());
}

#[test]
fn test_policy_scores_identical_criteria_highest() {
    let policy = ConversationPolicy::with_default_weights();
    let a = participant("a", "en", 5, &["music", "films"], true);
    let mut b = participant("b", "en", 5, &["music", "films"], true);
    b.gender = "male".to_string();

    let decision = policy.evaluate(&[a, b]);
    let score = decision.score().expect("should match");
    assert!(score > 0.99, "identical criteria should score ~1.0, got {}", score);
}

#[test]
fn test_policy_rejects_cross_language_pairs() {
    let policy = ConversationPolicy::with_default_weights();
    let a = participant("a", "en", 5, &["music"], false);
    let b = participant("b", "de", 5, &["music"], false);

    assert!(!policy.evaluate(&[a, b]).is_match());
}

#[test]
fn test_policy_rejects_wide_fluency_gap() {
    let policy = ConversationPolicy::with_default_weights();
    let a = participant("a", "en", 2, &["music"], false);
    let b = participant("b", "en", 8, &["music"], false);

    assert!(!policy.evaluate(&[a, b]).is_match());
}

#[test]
fn test_policy_rejects_same_session() {
    let policy = ConversationPolicy::with_default_weights();
    let a = participant("a", "en", 5, &["music"], false);
    let mut b = participant("b", "en", 5, &["music"], false);
    b.session_id = a.session_id.clone();

    assert!(!policy.evaluate(&[a, b]).is_match());
}

#[test]
fn test_topic_overlap_raises_score() {
    let policy = ConversationPolicy::with_default_weights();

    let a = participant("a", "en", 5, &["music", "films"], false);
    let strong = participant("s", "en", 5, &["music", "films"], false);
    let weak = participant("w", "en", 5, &["music", "cars"], false);

    let full = policy.evaluate(&[a.clone(), strong]).score().unwrap();
    let partial = policy.evaluate(&[a, weak]).score().unwrap();
    assert!(full > partial);
}

#[test]
fn test_custom_weights_shift_emphasis() {
    let topics_heavy = ConversationPolicy::new(ScoreWeights {
        language: 0.1,
        fluency: 0.1,
        topics: 0.7,
        dating: 0.1,
    });
    let a = participant("a", "en", 5, &["music", "films"], false);
    let b = participant("b", "en", 5, &["music", "cars"], false);

    let default_score = ConversationPolicy::with_default_weights()
        .evaluate(&[a.clone(), b.clone()])
        .score()
        .unwrap();
    let heavy_score = topics_heavy.evaluate(&[a, b]).score().unwrap();
    // Half the topics overlap, so weighting topics harder lowers the score
    assert!(heavy_score < default_score);
}

#[test]
fn test_criteria_relaxation_widens_gradually() {
    let criteria = MatchCriteria {
        language: "en".to_string(),
        fluency: 5,
        topics: vec!["music".to_string()],
        dating: true,
    };

    let step1 = criteria.relax(1);
    assert!(!step1.dating, "first step drops the dating requirement");
    assert_eq!(step1.language, criteria.language, "language never relaxes");

    let step2 = criteria.relax(2);
    assert!(step2.topics.contains(&"general".to_string()));
}

#[test]
fn test_queue_is_fifo_within_bucket() {
    let queue = RequestQueue::new();
    let now = Utc::now();
    for (i, id) in ["first", "second", "third"].iter().enumerate() {
        let mut p = participant(id, "en", 5, &["music"], false);
        p.arrival_time = now - Duration::seconds(30 - i as i64 * 10);
        queue.enqueue(p).unwrap();
    }

    let order: Vec<String> = queue
        .dequeue_candidates("en", 10)
        .into_iter()
        .map(|p| p.id)
        .collect();
    assert_eq!(order, vec!["first", "second", "third"]);
}

#[test]
fn test_queue_remove_is_single_winner() {
    let queue = RequestQueue::new();
    queue
        .enqueue(participant("a", "en", 5, &["music"], false))
        .unwrap();

    assert!(queue.remove("a").is_ok());
    assert!(queue.remove("a").is_err());
}
