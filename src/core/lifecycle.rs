use chrono::{Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::LifecycleSettings;
use crate::core::matcher::{ClaimRegistry, MatchedSet};
use crate::core::queue::RequestQueue;
use crate::models::{
    MatchProposal, NotificationRecord, ParticipantResponse, ParticipantStatus, ProposalState,
};
use crate::services::audit::AuditLog;
use crate::services::gateway::GatewayClient;
use crate::services::notifier::Notifier;

/// Errors surfaced by proposal lifecycle operations
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Proposal not found: {0}")]
    NotFound(String),

    #[error("Invalid transition for participant {participant_id} on match {match_id}")]
    InvalidTransition {
        match_id: Uuid,
        participant_id: String,
    },
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub confirmation_timeout: Duration,
    pub reenqueue_resets_age: bool,
}

impl LifecycleConfig {
    pub fn from_settings(settings: &LifecycleSettings, reenqueue_resets_age: bool) -> Self {
        Self {
            confirmation_timeout: Duration::seconds(settings.confirmation_timeout_secs as i64),
            reenqueue_resets_age,
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout: Duration::seconds(30),
            reenqueue_resets_age: false,
        }
    }
}

/// Drives proposals from Proposed to a terminal state
///
/// Transitions for one proposal are serialized through its own lock; the
/// confirmation timer and the confirm/decline handlers each attempt the same
/// one-shot transition and only the winner acts. Different proposals
/// progress fully independently.
pub struct LifecycleManager {
    cfg: LifecycleConfig,
    queue: Arc<RequestQueue>,
    notifier: Arc<Notifier>,
    gateway: Option<Arc<GatewayClient>>,
    audit: Option<Arc<AuditLog>>,
    proposals: DashMap<Uuid, Arc<Mutex<MatchProposal>>>,
    /// Participant id to non-terminal proposal id; together with the queue
    /// index this enforces one non-terminal membership per participant
    active: DashMap<String, Uuid>,
}

impl LifecycleManager {
    pub fn new(
        cfg: LifecycleConfig,
        queue: Arc<RequestQueue>,
        notifier: Arc<Notifier>,
        gateway: Option<Arc<GatewayClient>>,
        audit: Option<Arc<AuditLog>>,
    ) -> Self {
        Self {
            cfg,
            queue,
            notifier,
            gateway,
            audit,
            proposals: DashMap::new(),
            active: DashMap::new(),
        }
    }

    /// True while the participant belongs to a non-terminal proposal
    pub fn is_participant_active(&self, participant_id: &str) -> bool {
        self.active.contains_key(participant_id)
    }

    pub fn active_proposals(&self) -> usize {
        self.proposals.len()
    }

    /// Id of the non-terminal proposal a participant belongs to, if any
    pub fn proposal_for(&self, participant_id: &str) -> Option<Uuid> {
        self.active.get(participant_id).map(|entry| *entry.value())
    }

    /// Take ownership of a claimed set and start its confirmation window
    pub async fn admit(self: &Arc<Self>, set: MatchedSet) -> Uuid {
        let proposal = MatchProposal::new(set.participants, set.score, self.cfg.confirmation_timeout);
        let match_id = proposal.id;
        let room_id = proposal.room_id;
        let deadline = proposal.deadline;
        let participant_ids = proposal.participant_ids();

        for pid in &participant_ids {
            self.active.insert(pid.clone(), match_id);
        }
        self.proposals
            .insert(match_id, Arc::new(Mutex::new(proposal)));

        tracing::info!(
            %match_id,
            participants = participant_ids.len(),
            score = set.score,
            "Proposal created"
        );

        // Out-of-band client notification through the gateway, best-effort
        if let Some(gateway) = self.gateway.clone() {
            let ids = participant_ids.clone();
            tokio::spawn(async move {
                if let Err(e) = gateway.notify_proposed(match_id, &ids, room_id).await {
                    tracing::warn!(%match_id, "Failed to notify gateway: {}", e);
                }
            });
        }

        // Confirmation timer; cancelled implicitly by losing the transition
        // race to a completed confirm/decline.
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let wait = (deadline - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;
            manager.handle_deadline(match_id).await;
        });

        match_id
    }

    /// Record a confirmation; transitions to Confirmed once all are in
    ///
    /// The timestamp is captured before the proposal lock is taken and
    /// compared against the deadline, so the confirm-vs-timeout race is
    /// decided by timestamp ordering rather than execution order.
    pub async fn confirm(
        &self,
        match_id: Uuid,
        participant_id: &str,
    ) -> Result<ProposalState, LifecycleError> {
        let received_at = Utc::now();
        let cell = self.proposal_cell(match_id)?;
        let mut proposal = cell.lock().await;

        if proposal.state != ProposalState::Proposed
            || !proposal.contains(participant_id)
            || received_at >= proposal.deadline
        {
            return Err(LifecycleError::InvalidTransition {
                match_id,
                participant_id: participant_id.to_string(),
            });
        }

        match proposal.responses.get(participant_id) {
            // Re-confirm is idempotent
            Some(ParticipantResponse::Confirmed(_)) => return Ok(proposal.state),
            Some(_) => {
                return Err(LifecycleError::InvalidTransition {
                    match_id,
                    participant_id: participant_id.to_string(),
                })
            }
            None => {}
        }

        proposal.responses.insert(
            participant_id.to_string(),
            ParticipantResponse::Confirmed(received_at),
        );

        if proposal.all_confirmed() {
            self.transition_terminal(&mut proposal, ProposalState::Confirmed)
                .await;
        } else if proposal.all_responded() {
            // The rest already cancelled; this confirmation was the last
            // outstanding response, so the proposal ends now.
            self.transition_terminal(&mut proposal, ProposalState::PartiallyDeclined)
                .await;
        }

        Ok(proposal.state)
    }

    /// Record a decline; terminates the proposal immediately
    pub async fn decline(
        &self,
        match_id: Uuid,
        participant_id: &str,
    ) -> Result<ProposalState, LifecycleError> {
        let received_at = Utc::now();
        let cell = self.proposal_cell(match_id)?;
        let mut proposal = cell.lock().await;

        if proposal.state != ProposalState::Proposed || !proposal.contains(participant_id) {
            return Err(LifecycleError::InvalidTransition {
                match_id,
                participant_id: participant_id.to_string(),
            });
        }

        proposal.responses.insert(
            participant_id.to_string(),
            ParticipantResponse::Declined(received_at),
        );
        self.transition_terminal(&mut proposal, ProposalState::PartiallyDeclined)
            .await;

        Ok(proposal.state)
    }

    /// Record a cancellation from a participant inside a proposal
    ///
    /// Unlike a decline, a cancel does not terminate on its own: the
    /// proposal ends as Cancelled once every member cancelled, as
    /// PartiallyDeclined once everyone has responded, or at the deadline.
    pub async fn cancel_participant(&self, participant_id: &str) -> Result<(), LifecycleError> {
        let received_at = Utc::now();
        let match_id = self
            .active
            .get(participant_id)
            .map(|entry| *entry.value())
            .ok_or_else(|| LifecycleError::NotFound(participant_id.to_string()))?;

        let cell = self.proposal_cell(match_id)?;
        let mut proposal = cell.lock().await;

        if proposal.state != ProposalState::Proposed || !proposal.contains(participant_id) {
            return Err(LifecycleError::InvalidTransition {
                match_id,
                participant_id: participant_id.to_string(),
            });
        }

        proposal.responses.insert(
            participant_id.to_string(),
            ParticipantResponse::Cancelled(received_at),
        );

        if proposal.all_cancelled() {
            self.transition_terminal(&mut proposal, ProposalState::Cancelled)
                .await;
        } else if proposal.all_responded() {
            self.transition_terminal(&mut proposal, ProposalState::PartiallyDeclined)
                .await;
        }

        Ok(())
    }

    /// Timer path: fires once at the confirmation deadline
    async fn handle_deadline(&self, match_id: Uuid) {
        let Ok(cell) = self.proposal_cell(match_id) else {
            return;
        };
        let mut proposal = cell.lock().await;

        if proposal.state != ProposalState::Proposed {
            // Lost the race to a confirm/decline transition
            return;
        }

        // Confirmations timestamped strictly before the deadline win even if
        // this callback runs first.
        let next = if proposal.all_confirmed() {
            ProposalState::Confirmed
        } else {
            ProposalState::Expired
        };
        self.transition_terminal(&mut proposal, next).await;
    }

    /// The single terminal transition; callers hold the proposal lock
    async fn transition_terminal(&self, proposal: &mut MatchProposal, next: ProposalState) {
        debug_assert!(next.is_terminal());
        proposal.state = next;
        let occurred_at = Utc::now();

        for pid in proposal.participant_ids() {
            self.active.remove(&pid);
        }

        let mut reenqueued = 0usize;
        for participant in proposal.participants.iter_mut() {
            let response = proposal.responses.get(&participant.id);
            match next {
                ProposalState::Confirmed => {
                    participant.status = ParticipantStatus::Confirmed;
                }
                ProposalState::Cancelled => {
                    participant.status = ParticipantStatus::Cancelled;
                }
                ProposalState::PartiallyDeclined | ProposalState::Expired => {
                    match response {
                        // Willing participants go back without losing their
                        // fairness position (unless age reset is configured)
                        Some(ParticipantResponse::Confirmed(_)) => {
                            let mut back = participant.clone();
                            back.status = ParticipantStatus::Waiting;
                            if let Err(e) =
                                self.queue.reenqueue(back, self.cfg.reenqueue_resets_age)
                            {
                                tracing::warn!(
                                    participant = %participant.id,
                                    "Failed to re-enqueue after {:?}: {}",
                                    next,
                                    e
                                );
                            } else {
                                reenqueued += 1;
                                participant.status = ParticipantStatus::Waiting;
                            }
                        }
                        Some(ParticipantResponse::Declined(_))
                        | Some(ParticipantResponse::Cancelled(_)) => {
                            participant.status = ParticipantStatus::Cancelled;
                        }
                        // Non-responders are dropped
                        None => {
                            participant.status = ParticipantStatus::Expired;
                        }
                    }
                }
                ProposalState::Proposed => unreachable!("terminal transition to Proposed"),
            }
        }

        tracing::info!(
            match_id = %proposal.id,
            state = ?next,
            reenqueued,
            "Proposal reached terminal state"
        );

        // The notification record must be durably queued before this
        // proposal's work is considered complete; delivery is background.
        let record = NotificationRecord::for_proposal(proposal, occurred_at);
        if let Err(e) = self.notifier.enqueue(record).await {
            tracing::error!(
                match_id = %proposal.id,
                "Failed to queue terminal notification: {}",
                e
            );
        }

        if let Some(audit) = self.audit.clone() {
            let snapshot = proposal.clone();
            tokio::spawn(async move {
                if let Err(e) = audit.append_terminal(&snapshot).await {
                    tracing::warn!(match_id = %snapshot.id, "Failed to audit proposal: {}", e);
                }
            });
        }

        self.proposals.remove(&proposal.id);
    }

    fn proposal_cell(&self, match_id: Uuid) -> Result<Arc<Mutex<MatchProposal>>, LifecycleError> {
        self.proposals
            .get(&match_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| LifecycleError::NotFound(match_id.to_string()))
    }

    /// Snapshot of a proposal's state, for handlers and tests
    pub async fn proposal_state(&self, match_id: Uuid) -> Option<ProposalState> {
        let cell = self.proposals.get(&match_id).map(|e| Arc::clone(e.value()))?;
        let proposal = cell.lock().await;
        Some(proposal.state)
    }
}

/// The active map doubles as the claim registry: a nil placeholder holds the
/// id from the moment a claim reserves it until `admit` overwrites it with
/// the real proposal id, so a concurrent submit sees the id as taken even
/// while it is in neither the pool nor an admitted proposal.
impl ClaimRegistry for LifecycleManager {
    fn reserve(&self, participant_id: &str) -> bool {
        match self.active.entry(participant_id.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(Uuid::nil());
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    fn release(&self, participant_id: &str) {
        // Only a placeholder may be released; a live proposal entry stays
        self.active
            .remove_if(participant_id, |_, match_id| match_id.is_nil());
    }
}
