use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;

use crate::config::EngineSettings;
use crate::core::policy::{evaluate_guarded, CompatibilityPolicy};
use crate::core::queue::RequestQueue;
use crate::models::Participant;

/// Matching pass tunables
#[derive(Debug, Clone)]
pub struct MatcherConfig {
    pub group_size: usize,
    pub candidate_window: usize,
    pub score_threshold: f64,
    /// Wait age past which a participant is matched on any feasible set
    pub fairness_age: Duration,
    /// Wait time per criteria-relaxation step; zero disables relaxation
    pub relax_step: Duration,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            group_size: 2,
            candidate_window: 8,
            score_threshold: 0.5,
            fairness_age: Duration::seconds(60),
            relax_step: Duration::seconds(30),
        }
    }
}

impl From<&EngineSettings> for MatcherConfig {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            group_size: settings.group_size.clamp(2, 8),
            candidate_window: settings.candidate_window.max(1),
            score_threshold: settings.score_threshold,
            fairness_age: Duration::seconds(settings.fairness_age_secs as i64),
            relax_step: Duration::seconds(settings.relax_step_secs as i64),
        }
    }
}

/// Tracks participant ids that are mid-claim
///
/// Reservations make the pool-membership check and the removal a single
/// linearization point: an id is held before it leaves the pool and stays
/// held until its proposal terminates or the claim aborts. A submit for a
/// held id is rejected even though the id is in neither the pool nor an
/// admitted proposal yet.
pub trait ClaimRegistry: Send + Sync {
    /// Hold an id for an in-flight claim; false if it is already held
    fn reserve(&self, participant_id: &str) -> bool;
    /// Drop a hold after an aborted claim
    fn release(&self, participant_id: &str);
}

/// Registry for standalone passes with no lifecycle attached
pub struct NoReservations;

impl ClaimRegistry for NoReservations {
    fn reserve(&self, _: &str) -> bool {
        true
    }

    fn release(&self, _: &str) {}
}

/// A feasible set claimed out of the queue by a pass
#[derive(Debug)]
pub struct MatchedSet {
    pub participants: Vec<Participant>,
    pub score: f64,
}

/// Result of one matching pass over a bucket
#[derive(Debug, Default)]
pub struct PassOutcome {
    pub sets: Vec<MatchedSet>,
    pub scanned: usize,
    /// Claims aborted because a member was concurrently removed
    pub aborted_claims: usize,
}

/// Converts waiting participants into feasible sets, one bucket at a time
///
/// A pass scans a snapshot of the bucket in arrival order, evaluates each
/// anchor against a window of following candidates, and claims the best
/// feasible set all-or-nothing. Participants claimed within a pass are never
/// considered again in the same pass.
pub struct Matcher {
    policy: Arc<dyn CompatibilityPolicy>,
    cfg: MatcherConfig,
}

impl Matcher {
    pub fn new(policy: Arc<dyn CompatibilityPolicy>, cfg: MatcherConfig) -> Self {
        Self { policy, cfg }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.cfg
    }

    /// Run one pass over the given bucket
    pub fn run_pass(
        &self,
        queue: &RequestQueue,
        bucket_key: &str,
        registry: &dyn ClaimRegistry,
    ) -> PassOutcome {
        let snapshot = queue.dequeue_candidates(bucket_key, usize::MAX);
        let mut outcome = PassOutcome {
            scanned: snapshot.len(),
            ..Default::default()
        };

        if snapshot.len() < self.cfg.group_size {
            return outcome;
        }

        let now = Utc::now();
        let mut claimed: HashSet<String> = HashSet::new();

        for (i, anchor) in snapshot.iter().enumerate() {
            if claimed.contains(&anchor.id) {
                continue;
            }

            let window: Vec<&Participant> = snapshot[i + 1..]
                .iter()
                .filter(|p| !claimed.contains(&p.id))
                .take(self.cfg.candidate_window)
                .collect();

            if window.len() + 1 < self.cfg.group_size {
                continue;
            }

            let overdue = anchor.wait_age(now) >= self.cfg.fairness_age;
            let best = self.select_best_set(anchor, &window, now, overdue);

            let Some((member_ids, score)) = best else {
                continue;
            };

            match self.claim(queue, registry, &member_ids) {
                Some(participants) => {
                    claimed.extend(member_ids);
                    tracing::debug!(
                        bucket = bucket_key,
                        score,
                        members = participants.len(),
                        overdue,
                        "Claimed feasible set"
                    );
                    outcome.sets.push(MatchedSet { participants, score });
                }
                None => {
                    // A member was cancelled mid-claim; the set is void and
                    // the survivors went back with their age intact.
                    outcome.aborted_claims += 1;
                }
            }
        }

        outcome
    }

    /// Pick the highest-scoring feasible set anchored at `anchor`
    ///
    /// An overdue anchor accepts any feasible set, ignoring the score
    /// threshold, which bounds worst-case wait time.
    fn select_best_set(
        &self,
        anchor: &Participant,
        window: &[&Participant],
        now: DateTime<Utc>,
        overdue: bool,
    ) -> Option<(Vec<String>, f64)> {
        let needed = self.cfg.group_size - 1;
        let mut best: Option<(Vec<String>, f64)> = None;

        for combo in combinations(window.len(), needed) {
            let mut set = Vec::with_capacity(self.cfg.group_size);
            set.push(self.relaxed_view(anchor, now));
            for &idx in &combo {
                set.push(self.relaxed_view(window[idx], now));
            }

            let decision = evaluate_guarded(self.policy.as_ref(), &set);
            let Some(score) = decision.score() else {
                continue;
            };
            if !overdue && score < self.cfg.score_threshold {
                continue;
            }

            if best.as_ref().map_or(true, |(_, s)| score > *s) {
                let ids = set.into_iter().map(|p| p.id).collect();
                best = Some((ids, score));
            }
        }

        best
    }

    /// Claim every member atomically; on a lost race, roll the rest back
    ///
    /// Each member is reserved in the registry before leaving the pool, so
    /// there is no window in which a claimed id is in neither structure.
    fn claim(
        &self,
        queue: &RequestQueue,
        registry: &dyn ClaimRegistry,
        member_ids: &[String],
    ) -> Option<Vec<Participant>> {
        let mut reserved: Vec<&str> = Vec::with_capacity(member_ids.len());
        let mut removed = Vec::with_capacity(member_ids.len());

        for id in member_ids {
            if !registry.reserve(id) {
                tracing::debug!(participant = %id, "Claim lost a reservation race");
                Self::abort_claim(queue, registry, &reserved, removed);
                return None;
            }
            reserved.push(id.as_str());

            match queue.remove(id) {
                Ok(p) => removed.push(p),
                Err(_) => {
                    tracing::debug!(
                        participant = %id,
                        "Claim lost a removal race, returning members to the pool"
                    );
                    Self::abort_claim(queue, registry, &reserved, removed);
                    return None;
                }
            }
        }

        Some(removed)
    }

    /// Survivors go back first so their ids are never absent from both the
    /// pool and the registry at once
    fn abort_claim(
        queue: &RequestQueue,
        registry: &dyn ClaimRegistry,
        reserved: &[&str],
        survivors: Vec<Participant>,
    ) {
        for survivor in survivors {
            if let Err(e) = queue.reenqueue(survivor, false) {
                tracing::warn!("Failed to return participant after aborted claim: {}", e);
            }
        }
        for id in reserved {
            registry.release(id);
        }
    }

    /// Participant with criteria relaxed according to wait age
    fn relaxed_view(&self, participant: &Participant, now: DateTime<Utc>) -> Participant {
        if self.cfg.relax_step.is_zero() {
            return participant.clone();
        }
        let step = (participant.wait_age(now).num_seconds()
            / self.cfg.relax_step.num_seconds().max(1)) as u32;
        let mut relaxed = participant.clone();
        relaxed.criteria = participant.criteria.relax(step);
        relaxed
    }
}

/// Index combinations of size `k` out of `n` items
fn combinations(n: usize, k: usize) -> Vec<Vec<usize>> {
    if k > n {
        return vec![];
    }
    if k == 0 {
        return vec![vec![]];
    }
    let mut out = Vec::new();
    let mut current: Vec<usize> = (0..k).collect();
    loop {
        out.push(current.clone());
        // Advance the rightmost index that can still move
        let mut i = k;
        loop {
            if i == 0 {
                return out;
            }
            i -= 1;
            if current[i] != i + n - k {
                break;
            }
            if i == 0 {
                return out;
            }
        }
        current[i] += 1;
        for j in i + 1..k {
            current[j] = current[j - 1] + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::policy::ConversationPolicy;
    use crate::models::MatchCriteria;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn participant(id: &str, fluency: u8, topics: &[&str]) -> Participant {
        Participant::new(
            id.to_string(),
            format!("session-{}", id),
            format!("user-{}", id),
            "female".to_string(),
            "en".to_string(),
            MatchCriteria {
                language: "en".to_string(),
                fluency,
                topics: topics.iter().map(|t| t.to_string()).collect(),
                dating: false,
            },
        )
    }

    fn matcher() -> Matcher {
        Matcher::new(
            Arc::new(ConversationPolicy::with_default_weights()),
            MatcherConfig::default(),
        )
    }

    #[test]
    fn test_combinations() {
        assert_eq!(combinations(3, 2), vec![vec![0, 1], vec![0, 2], vec![1, 2]]);
        assert_eq!(combinations(2, 3), Vec::<Vec<usize>>::new());
        assert_eq!(combinations(4, 1).len(), 4);
    }

    #[test]
    fn test_pass_pairs_compatible_participants() {
        let queue = RequestQueue::new();
        queue.enqueue(participant("a", 5, &["music"])).unwrap();
        queue.enqueue(participant("b", 5, &["music"])).unwrap();

        let outcome = matcher().run_pass(&queue, "en", &NoReservations);

        assert_eq!(outcome.sets.len(), 1);
        assert_eq!(outcome.sets[0].participants.len(), 2);
        assert_eq!(queue.waiting_total(), 0);
    }

    #[test]
    fn test_undersized_bucket_is_left_waiting() {
        let queue = RequestQueue::new();
        queue.enqueue(participant("a", 5, &["music"])).unwrap();

        let outcome = matcher().run_pass(&queue, "en", &NoReservations);

        assert!(outcome.sets.is_empty());
        assert_eq!(queue.waiting_total(), 1);
    }

    #[test]
    fn test_empty_bucket_is_noop() {
        let queue = RequestQueue::new();
        let outcome = matcher().run_pass(&queue, "en", &NoReservations);
        assert!(outcome.sets.is_empty());
        assert_eq!(outcome.scanned, 0);
    }

    #[test]
    fn test_incompatible_participants_stay_waiting() {
        let queue = RequestQueue::new();
        queue.enqueue(participant("a", 1, &["music"])).unwrap();
        queue.enqueue(participant("b", 9, &["films"])).unwrap();

        let outcome = matcher().run_pass(&queue, "en", &NoReservations);

        assert!(outcome.sets.is_empty());
        assert_eq!(queue.waiting_total(), 2);
    }

    #[test]
    fn test_no_participant_in_two_sets_per_pass() {
        let queue = RequestQueue::new();
        for id in ["a", "b", "c", "d", "e"] {
            queue.enqueue(participant(id, 5, &["music"])).unwrap();
        }

        let outcome = matcher().run_pass(&queue, "en", &NoReservations);

        let mut seen = HashSet::new();
        for set in &outcome.sets {
            for p in &set.participants {
                assert!(seen.insert(p.id.clone()), "participant {} claimed twice", p.id);
            }
        }
        // Five compatible participants, pair size 2: two sets, one left over
        assert_eq!(outcome.sets.len(), 2);
        assert_eq!(queue.waiting_total(), 1);
    }

    #[test]
    fn test_best_scoring_partner_preferred() {
        let queue = RequestQueue::new();
        // Anchor shares both topics with "strong", only one with "weak"
        queue
            .enqueue(participant("anchor", 5, &["music", "films"]))
            .unwrap();
        queue.enqueue(participant("weak", 5, &["music", "cars"])).unwrap();
        queue
            .enqueue(participant("strong", 5, &["music", "films"]))
            .unwrap();

        let outcome = matcher().run_pass(&queue, "en", &NoReservations);

        assert!(!outcome.sets.is_empty());
        let first: Vec<&str> = outcome.sets[0]
            .participants
            .iter()
            .map(|p| p.id.as_str())
            .collect();
        assert!(first.contains(&"anchor"));
        assert!(first.contains(&"strong"));
    }

    #[test]
    fn test_fairness_override_accepts_suboptimal_set() {
        let queue = RequestQueue::new();
        let mut old = participant("old", 5, &["music", "films", "cars"]);
        old.arrival_time = Utc::now() - Duration::seconds(120);
        // Only one of three topics shared: below the default threshold once
        // weighted, but the overdue anchor takes it anyway.
        let other = participant("other", 4, &["cars"]);

        queue.enqueue(old).unwrap();
        queue.enqueue(other).unwrap();

        let mut cfg = MatcherConfig::default();
        cfg.score_threshold = 0.95;
        cfg.relax_step = Duration::zero();
        let matcher = Matcher::new(
            Arc::new(ConversationPolicy::with_default_weights()),
            cfg,
        );

        let outcome = matcher.run_pass(&queue, "en", &NoReservations);
        assert_eq!(outcome.sets.len(), 1);
    }

    #[test]
    fn test_threshold_blocks_weak_sets_for_fresh_arrivals() {
        let queue = RequestQueue::new();
        queue
            .enqueue(participant("a", 5, &["music", "films", "cars"]))
            .unwrap();
        queue.enqueue(participant("b", 4, &["cars"])).unwrap();

        let mut cfg = MatcherConfig::default();
        cfg.score_threshold = 0.95;
        cfg.relax_step = Duration::zero();
        let matcher = Matcher::new(
            Arc::new(ConversationPolicy::with_default_weights()),
            cfg,
        );

        let outcome = matcher.run_pass(&queue, "en", &NoReservations);
        assert!(outcome.sets.is_empty());
        assert_eq!(queue.waiting_total(), 2);
    }

    #[test]
    fn test_relaxation_unlocks_match_for_long_waiters() {
        let queue = RequestQueue::new();
        // No shared topics at face value; after two relaxation steps both
        // advertise "general" and become compatible.
        let mut a = participant("a", 5, &["music"]);
        let mut b = participant("b", 5, &["films"]);
        a.arrival_time = Utc::now() - Duration::seconds(90);
        b.arrival_time = Utc::now() - Duration::seconds(90);

        queue.enqueue(a).unwrap();
        queue.enqueue(b).unwrap();

        let outcome = matcher().run_pass(&queue, "en", &NoReservations);
        assert_eq!(outcome.sets.len(), 1);
        // Claimed participants keep their original criteria
        let topics: Vec<_> = outcome.sets[0]
            .participants
            .iter()
            .map(|p| p.criteria.topics.clone())
            .collect();
        assert!(topics.contains(&vec!["music".to_string()]));
    }

    /// Registry that yanks a queued participant out from under the first claim
    struct CancellingRegistry {
        queue: Arc<RequestQueue>,
        victim: &'static str,
        fired: AtomicBool,
    }

    impl ClaimRegistry for CancellingRegistry {
        fn reserve(&self, _: &str) -> bool {
            if !self.fired.swap(true, Ordering::SeqCst) {
                let _ = self.queue.remove(self.victim);
            }
            true
        }

        fn release(&self, _: &str) {}
    }

    #[test]
    fn test_lost_removal_race_rolls_back_claim() {
        let queue = Arc::new(RequestQueue::new());
        let mut a = participant("a", 5, &["music"]);
        a.arrival_time = Utc::now() - Duration::seconds(40);
        queue.enqueue(a).unwrap();
        queue.enqueue(participant("b", 5, &["music"])).unwrap();

        let registry = CancellingRegistry {
            queue: queue.clone(),
            victim: "b",
            fired: AtomicBool::new(false),
        };
        let outcome = matcher().run_pass(&queue, "en", &registry);

        // The set is void; the survivor went back with their age intact
        assert!(outcome.sets.is_empty());
        assert_eq!(outcome.aborted_claims, 1);
        assert!(queue.contains("a"));
        assert!(!queue.contains("b"));
        assert!(queue.peek_age("a").unwrap() >= Duration::seconds(39));
    }
}
