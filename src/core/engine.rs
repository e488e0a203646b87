use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::config::{EngineSettings, TriggerMode};
use crate::core::lifecycle::{LifecycleError, LifecycleManager};
use crate::core::matcher::Matcher;
use crate::core::queue::{QueueError, RequestQueue};
use crate::models::{Participant, ProposalState, StatsResponse};

/// Errors surfaced by the engine facade
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("Participant {0} already belongs to an active proposal")]
    AlreadyProposed(String),

    #[error("Invalid match id: {0}")]
    BadMatchId(String),
}

/// Top-level facade over the waiting pool, the matcher and the proposal
/// lifecycle
///
/// Owns pass scheduling: either fixed-interval ticks or a pass kicked per
/// enqueue with bursts coalesced through a `Notify`. Passes over different
/// buckets run concurrently; per-bucket guards keep two passes off the same
/// bucket at once.
pub struct MatchEngine {
    queue: Arc<RequestQueue>,
    matcher: Arc<Matcher>,
    lifecycle: Arc<LifecycleManager>,
    trigger: TriggerMode,
    pass_interval: std::time::Duration,
    pass_guards: DashMap<String, Arc<Mutex<()>>>,
    kick: Notify,
}

impl MatchEngine {
    pub fn new(
        queue: Arc<RequestQueue>,
        matcher: Arc<Matcher>,
        lifecycle: Arc<LifecycleManager>,
        settings: &EngineSettings,
    ) -> Self {
        Self {
            queue,
            matcher,
            lifecycle,
            trigger: settings.trigger,
            pass_interval: std::time::Duration::from_millis(settings.pass_interval_ms.max(10)),
            pass_guards: DashMap::new(),
            kick: Notify::new(),
        }
    }

    /// Admit a participant into the waiting pool
    ///
    /// Rejected while the participant is already waiting or inside a
    /// non-terminal proposal.
    pub fn submit(&self, participant: Participant) -> Result<(), EngineError> {
        if self.lifecycle.is_participant_active(&participant.id) {
            return Err(EngineError::AlreadyProposed(participant.id));
        }

        let bucket = participant.bucket_key();
        self.queue.enqueue(participant)?;
        tracing::debug!(bucket, "Participant admitted to the pool");

        if self.trigger == TriggerMode::Event {
            self.kick.notify_one();
        }
        Ok(())
    }

    /// Withdraw a participant, wherever they currently are
    ///
    /// Waiting participants leave the pool immediately; participants inside a
    /// proposal have their cancellation recorded against it.
    pub async fn cancel(&self, participant_id: &str) -> Result<(), EngineError> {
        match self.queue.remove(participant_id) {
            Ok(_) => {
                tracing::debug!(participant = participant_id, "Participant left the pool");
                Ok(())
            }
            Err(QueueError::NotFound(_)) => {
                self.lifecycle.cancel_participant(participant_id).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn confirm(
        &self,
        match_id: &str,
        participant_id: &str,
    ) -> Result<ProposalState, EngineError> {
        let id = parse_match_id(match_id)?;
        Ok(self.lifecycle.confirm(id, participant_id).await?)
    }

    pub async fn decline(
        &self,
        match_id: &str,
        participant_id: &str,
    ) -> Result<ProposalState, EngineError> {
        let id = parse_match_id(match_id)?;
        Ok(self.lifecycle.decline(id, participant_id).await?)
    }

    /// Run one matching pass over a single bucket
    ///
    /// Skips silently if another pass already holds this bucket; the next
    /// tick picks up whatever this one would have seen.
    pub async fn run_bucket_pass(self: &Arc<Self>, bucket_key: &str) -> usize {
        let guard = {
            let entry = self
                .pass_guards
                .entry(bucket_key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())));
            Arc::clone(entry.value())
        };

        let Ok(_held) = guard.try_lock() else {
            return 0;
        };

        // The lifecycle doubles as the claim registry: members are held from
        // the moment the pass claims them, so a resubmit racing the window
        // between claim and admit is rejected.
        let outcome = self
            .matcher
            .run_pass(&self.queue, bucket_key, self.lifecycle.as_ref());
        let matched = outcome.sets.len();
        for set in outcome.sets {
            self.lifecycle.admit(set).await;
        }
        matched
    }

    /// Run passes over every non-empty bucket, concurrently
    pub async fn run_passes(self: &Arc<Self>) -> usize {
        let buckets = self.queue.bucket_keys();
        let mut handles = Vec::with_capacity(buckets.len());

        for bucket in buckets {
            let engine = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                engine.run_bucket_pass(&bucket).await
            }));
        }

        let mut matched = 0;
        for handle in handles {
            matched += handle.await.unwrap_or(0);
        }
        matched
    }

    /// The scheduling loop; runs until the process exits
    pub async fn run(self: Arc<Self>) {
        tracing::info!(trigger = ?self.trigger, "Match engine running");
        match self.trigger {
            TriggerMode::Interval => {
                let mut ticker = tokio::time::interval(self.pass_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    self.run_passes().await;
                }
            }
            TriggerMode::Event => loop {
                self.kick.notified().await;
                // Coalesce a burst of enqueues into one round of passes
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                self.run_passes().await;
            },
        }
    }

    /// Observability snapshot for the stats endpoint
    pub fn stats(&self) -> StatsResponse {
        StatsResponse {
            waiting_total: self.queue.waiting_total(),
            buckets: self.queue.bucket_sizes(),
            oldest_wait_secs: self.queue.oldest_wait().map(|d| d.num_seconds()),
            active_proposals: self.lifecycle.active_proposals(),
        }
    }
}

fn parse_match_id(raw: &str) -> Result<Uuid, EngineError> {
    Uuid::parse_str(raw).map_err(|_| EngineError::BadMatchId(raw.to_string()))
}
