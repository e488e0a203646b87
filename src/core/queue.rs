use chrono::{Duration, Utc};
use dashmap::DashMap;
use thiserror::Error;

use crate::models::{Participant, ParticipantStatus};

/// Errors that can occur on the waiting pool
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Participant already waiting: {0}")]
    DuplicateParticipant(String),

    #[error("Participant not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone)]
struct IndexEntry {
    bucket: String,
}

/// The waiting pool, sharded by compatibility bucket
///
/// The participant index is the single linearization point: exactly one of
/// any set of concurrent `remove` calls for the same id wins. Bucket vectors
/// hold participants in arrival order (ties broken by id) so a pass scans
/// oldest-first and re-enqueued participants keep their fairness position.
pub struct RequestQueue {
    index: DashMap<String, IndexEntry>,
    buckets: DashMap<String, Vec<Participant>>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self {
            index: DashMap::new(),
            buckets: DashMap::new(),
        }
    }

    /// Add a participant to the pool
    ///
    /// The participant's own `arrival_time` is honored, which is what lets a
    /// re-enqueue after a failed proposal keep its original queue position.
    pub fn enqueue(&self, mut participant: Participant) -> Result<(), QueueError> {
        let bucket = participant.bucket_key();
        participant.status = ParticipantStatus::Waiting;

        // The bucket guard is held across the index insert and the vector
        // insert, so a remove that wins the index entry always finds the
        // participant in the bucket once it acquires the guard.
        let mut entries = self.buckets.entry(bucket.clone()).or_default();

        match self.index.entry(participant.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                drop(entries);
                self.buckets.remove_if(&bucket, |_, v| v.is_empty());
                return Err(QueueError::DuplicateParticipant(participant.id));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(IndexEntry {
                    bucket: bucket.clone(),
                });
            }
        }

        let pos = entries
            .binary_search_by(|p| {
                p.arrival_time
                    .cmp(&participant.arrival_time)
                    .then_with(|| p.id.cmp(&participant.id))
            })
            .unwrap_or_else(|pos| pos);
        entries.insert(pos, participant);

        Ok(())
    }

    /// Return a participant to the pool after a failed proposal
    pub fn reenqueue(&self, mut participant: Participant, reset_age: bool) -> Result<(), QueueError> {
        if reset_age {
            participant.arrival_time = Utc::now();
        }
        self.enqueue(participant)
    }

    /// Snapshot of waiting participants in a bucket, arrival-ascending
    ///
    /// Non-mutating; callers must claim members through `remove`.
    pub fn dequeue_candidates(&self, bucket_key: &str, limit: usize) -> Vec<Participant> {
        self.buckets
            .get(bucket_key)
            .map(|entries| entries.iter().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Atomically take a participant out of the pool
    ///
    /// Linearizable: the index removal decides the winner of any race with a
    /// concurrent cancel or another matching pass.
    pub fn remove(&self, participant_id: &str) -> Result<Participant, QueueError> {
        let (_, entry) = self
            .index
            .remove(participant_id)
            .ok_or_else(|| QueueError::NotFound(participant_id.to_string()))?;

        let removed = {
            let mut entries = self
                .buckets
                .get_mut(&entry.bucket)
                .ok_or_else(|| QueueError::NotFound(participant_id.to_string()))?;
            let pos = entries
                .iter()
                .position(|p| p.id == participant_id)
                .ok_or_else(|| QueueError::NotFound(participant_id.to_string()))?;
            entries.remove(pos)
        };

        self.buckets.remove_if(&entry.bucket, |_, v| v.is_empty());

        Ok(removed)
    }

    /// Wait duration of a participant still in the pool
    pub fn peek_age(&self, participant_id: &str) -> Result<Duration, QueueError> {
        // Index guard released before the bucket lock; enqueue acquires the
        // two in the opposite order.
        let bucket_key = self
            .index
            .get(participant_id)
            .map(|entry| entry.bucket.clone())
            .ok_or_else(|| QueueError::NotFound(participant_id.to_string()))?;
        let bucket = self
            .buckets
            .get(&bucket_key)
            .ok_or_else(|| QueueError::NotFound(participant_id.to_string()))?;
        bucket
            .iter()
            .find(|p| p.id == participant_id)
            .map(|p| p.wait_age(Utc::now()))
            .ok_or_else(|| QueueError::NotFound(participant_id.to_string()))
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.index.contains_key(participant_id)
    }

    pub fn waiting_total(&self) -> usize {
        self.index.len()
    }

    /// Keys of buckets that currently have waiting participants
    pub fn bucket_keys(&self) -> Vec<String> {
        self.buckets
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Waiting count per bucket
    pub fn bucket_sizes(&self) -> std::collections::HashMap<String, usize> {
        self.buckets
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| (entry.key().clone(), entry.value().len()))
            .collect()
    }

    /// Age of the longest-waiting participant across all buckets
    pub fn oldest_wait(&self) -> Option<Duration> {
        let now = Utc::now();
        self.buckets
            .iter()
            .filter_map(|entry| entry.value().first().map(|p| p.wait_age(now)))
            .max()
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MatchCriteria;
    use chrono::Duration;

    fn participant(id: &str, language: &str) -> Participant {
        Participant::new(
            id.to_string(),
            format!("session-{}", id),
            format!("user-{}", id),
            "female".to_string(),
            "en".to_string(),
            MatchCriteria {
                language: language.to_string(),
                fluency: 5,
                topics: vec!["music".to_string()],
                dating: false,
            },
        )
    }

    #[test]
    fn test_enqueue_and_duplicate() {
        let queue = RequestQueue::new();
        queue.enqueue(participant("a", "en")).unwrap();

        let err = queue.enqueue(participant("a", "en")).unwrap_err();
        assert!(matches!(err, QueueError::DuplicateParticipant(_)));
        assert_eq!(queue.waiting_total(), 1);
    }

    #[test]
    fn test_candidates_are_arrival_ordered() {
        let queue = RequestQueue::new();
        let mut first = participant("b", "en");
        let mut second = participant("a", "en");
        first.arrival_time = Utc::now() - Duration::seconds(10);
        second.arrival_time = Utc::now() - Duration::seconds(5);

        queue.enqueue(second).unwrap();
        queue.enqueue(first).unwrap();

        let candidates = queue.dequeue_candidates("en", 10);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].id, "b");
        assert_eq!(candidates[1].id, "a");
    }

    #[test]
    fn test_arrival_ties_broken_by_id() {
        let queue = RequestQueue::new();
        let now = Utc::now();
        let mut a = participant("a", "en");
        let mut b = participant("b", "en");
        a.arrival_time = now;
        b.arrival_time = now;

        queue.enqueue(b).unwrap();
        queue.enqueue(a).unwrap();

        let candidates = queue.dequeue_candidates("en", 10);
        assert_eq!(candidates[0].id, "a");
        assert_eq!(candidates[1].id, "b");
    }

    #[test]
    fn test_remove_wins_exactly_once() {
        let queue = RequestQueue::new();
        queue.enqueue(participant("a", "en")).unwrap();

        assert!(queue.remove("a").is_ok());
        assert!(matches!(queue.remove("a"), Err(QueueError::NotFound(_))));
        assert!(!queue.contains("a"));
    }

    #[test]
    fn test_buckets_are_isolated() {
        let queue = RequestQueue::new();
        queue.enqueue(participant("a", "en")).unwrap();
        queue.enqueue(participant("b", "de")).unwrap();

        assert_eq!(queue.dequeue_candidates("en", 10).len(), 1);
        assert_eq!(queue.dequeue_candidates("de", 10).len(), 1);
        assert_eq!(queue.bucket_keys().len(), 2);
    }

    #[test]
    fn test_reenqueue_preserves_position() {
        let queue = RequestQueue::new();
        let mut old = participant("old", "en");
        old.arrival_time = Utc::now() - Duration::seconds(60);
        queue.enqueue(old).unwrap();
        queue.enqueue(participant("young", "en")).unwrap();

        let removed = queue.remove("old").unwrap();
        queue.reenqueue(removed, false).unwrap();

        let candidates = queue.dequeue_candidates("en", 10);
        assert_eq!(candidates[0].id, "old");
    }

    #[test]
    fn test_reenqueue_reset_age_goes_to_back() {
        let queue = RequestQueue::new();
        let mut old = participant("old", "en");
        old.arrival_time = Utc::now() - Duration::seconds(60);
        let mut other = participant("other", "en");
        other.arrival_time = Utc::now() - Duration::seconds(30);
        queue.enqueue(old).unwrap();
        queue.enqueue(other).unwrap();

        let removed = queue.remove("old").unwrap();
        queue.reenqueue(removed, true).unwrap();

        let candidates = queue.dequeue_candidates("en", 10);
        assert_eq!(candidates[0].id, "other");
        assert_eq!(candidates[1].id, "old");
    }

    #[test]
    fn test_peek_age_grows() {
        let queue = RequestQueue::new();
        let mut p = participant("a", "en");
        p.arrival_time = Utc::now() - Duration::seconds(42);
        queue.enqueue(p).unwrap();

        let age = queue.peek_age("a").unwrap();
        assert!(age >= Duration::seconds(41));
        assert!(queue.peek_age("missing").is_err());
    }

    #[test]
    fn test_racing_enqueue_and_remove_keep_index_and_bucket_aligned() {
        let queue = std::sync::Arc::new(RequestQueue::new());

        for _ in 0..200 {
            let enq = {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    let _ = queue.enqueue(participant("a", "en"));
                })
            };
            let rem = {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    let _ = queue.remove("a");
                })
            };
            enq.join().unwrap();
            rem.join().unwrap();

            // Whatever interleaving happened, the bucket holds the
            // participant exactly when the index does.
            let in_bucket = queue.dequeue_candidates("en", 10).len();
            let in_index = queue.contains("a") as usize;
            assert_eq!(in_bucket, in_index);

            let _ = queue.remove("a");
        }
    }
}
