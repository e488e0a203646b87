use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Conversation-matching criteria carried by every request
///
/// The schema is fixed per deployment so the compatibility policy stays
/// statically checkable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCriteria {
    pub language: String,
    /// Self-assessed fluency, 0-10
    pub fluency: u8,
    pub topics: Vec<String>,
    /// Open to dating-mode conversations
    #[serde(default)]
    pub dating: bool,
}

impl MatchCriteria {
    /// Bucket key bounding the matcher's search space
    pub fn bucket_key(&self) -> String {
        self.language.to_lowercase()
    }

    /// Loosen criteria for long-waiting participants
    ///
    /// Steps mirror how long a participant has been waiting: first the
    /// dating flag is dropped, then topics widen to "general", then a level
    /// of fluency tolerance is conceded.
    pub fn relax(&self, step: u32) -> MatchCriteria {
        let mut relaxed = self.clone();

        if step >= 1 {
            relaxed.dating = false;
        }
        if step >= 2 {
            relaxed.topics = vec!["general".to_string()];
        }
        if step >= 3 && relaxed.fluency > 0 {
            relaxed.fluency -= 1;
        }

        relaxed
    }
}

/// Where a participant currently sits in the matching flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantStatus {
    Waiting,
    Proposed,
    Confirmed,
    Cancelled,
    Expired,
}

/// An entity seeking to be matched
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    #[serde(rename = "participantId")]
    pub id: String,
    /// Originating session; two participants from one session never match
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub username: String,
    pub gender: String,
    #[serde(rename = "langCode")]
    pub lang_code: String,
    pub criteria: MatchCriteria,
    #[serde(rename = "arrivalTime")]
    pub arrival_time: DateTime<Utc>,
    pub status: ParticipantStatus,
}

impl Participant {
    pub fn new(
        id: String,
        session_id: String,
        username: String,
        gender: String,
        lang_code: String,
        criteria: MatchCriteria,
    ) -> Self {
        Self {
            id,
            session_id,
            username,
            gender,
            lang_code,
            criteria,
            arrival_time: Utc::now(),
            status: ParticipantStatus::Waiting,
        }
    }

    pub fn bucket_key(&self) -> String {
        self.criteria.bucket_key()
    }

    /// How long this participant has been waiting
    pub fn wait_age(&self, now: DateTime<Utc>) -> Duration {
        now - self.arrival_time
    }
}

/// Decision returned by a compatibility policy
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchDecision {
    NoMatch,
    Match { score: f64 },
}

impl MatchDecision {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchDecision::Match { .. })
    }

    pub fn score(&self) -> Option<f64> {
        match self {
            MatchDecision::Match { score } => Some(*score),
            MatchDecision::NoMatch => None,
        }
    }
}

/// Scoring weights for the default policy
#[derive(Debug, Clone, Copy)]
pub struct ScoreWeights {
    pub language: f64,
    pub fluency: f64,
    pub topics: f64,
    pub dating: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            language: 0.40,
            fluency: 0.25,
            topics: 0.25,
            dating: 0.10,
        }
    }
}

/// Lifecycle states of a match proposal
///
/// Transitions are monotonic: a terminal state is never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProposalState {
    Proposed,
    Confirmed,
    PartiallyDeclined,
    Expired,
    Cancelled,
}

impl ProposalState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProposalState::Proposed)
    }
}

/// How a participant answered a proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "at")]
pub enum ParticipantResponse {
    Confirmed(DateTime<Utc>),
    Declined(DateTime<Utc>),
    Cancelled(DateTime<Utc>),
}

/// A candidate pairing pending confirmation
///
/// The participant set is fixed at creation; cancellation terminates the
/// whole proposal rather than shrinking it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchProposal {
    #[serde(rename = "matchId")]
    pub id: Uuid,
    /// Conversation room handed to the gateway on success
    #[serde(rename = "roomId")]
    pub room_id: Uuid,
    pub participants: Vec<Participant>,
    #[serde(rename = "compatibilityScore")]
    pub score: f64,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    /// Confirmation deadline; responses timestamped at or past it are invalid
    pub deadline: DateTime<Utc>,
    pub state: ProposalState,
    pub responses: HashMap<String, ParticipantResponse>,
}

impl MatchProposal {
    pub fn new(mut participants: Vec<Participant>, score: f64, timeout: Duration) -> Self {
        let created_at = Utc::now();
        for p in &mut participants {
            p.status = ParticipantStatus::Proposed;
        }
        Self {
            id: Uuid::new_v4(),
            room_id: Uuid::new_v4(),
            participants,
            score,
            created_at,
            deadline: created_at + timeout,
            state: ProposalState::Proposed,
            responses: HashMap::new(),
        }
    }

    pub fn participant_ids(&self) -> Vec<String> {
        self.participants.iter().map(|p| p.id.clone()).collect()
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.participants.iter().any(|p| p.id == participant_id)
    }

    /// True once every participant has confirmed before the deadline
    pub fn all_confirmed(&self) -> bool {
        self.participants.iter().all(|p| {
            matches!(
                self.responses.get(&p.id),
                Some(ParticipantResponse::Confirmed(at)) if *at < self.deadline
            )
        })
    }

    /// True once every participant has cancelled
    pub fn all_cancelled(&self) -> bool {
        self.participants
            .iter()
            .all(|p| matches!(self.responses.get(&p.id), Some(ParticipantResponse::Cancelled(_))))
    }

    /// True once every participant has responded one way or another
    pub fn all_responded(&self) -> bool {
        self.participants
            .iter()
            .all(|p| self.responses.contains_key(&p.id))
    }
}

/// Delivery state of an outbound notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Pending,
    Delivered,
    Failed,
}

/// Payload shipped to the downstream consumer for a terminal proposal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchFoundPayload {
    #[serde(rename = "matchId")]
    pub match_id: Uuid,
    #[serde(rename = "roomId")]
    pub room_id: Uuid,
    #[serde(rename = "participantIds")]
    pub participant_ids: Vec<String>,
    pub state: ProposalState,
    #[serde(rename = "idempotencyKey")]
    pub idempotency_key: String,
    #[serde(rename = "occurredAt")]
    pub occurred_at: DateTime<Utc>,
}

/// Durable record guaranteeing one observable notification per proposal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    #[serde(rename = "matchId")]
    pub match_id: Uuid,
    #[serde(rename = "idempotencyKey")]
    pub idempotency_key: String,
    pub payload: MatchFoundPayload,
    #[serde(rename = "deliveryState")]
    pub delivery_state: DeliveryState,
    pub attempts: u32,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl NotificationRecord {
    /// Build the record for a terminal proposal; the idempotency key is the
    /// match id, so a re-delivery after restart carries an identical payload.
    pub fn for_proposal(proposal: &MatchProposal, occurred_at: DateTime<Utc>) -> Self {
        let payload = MatchFoundPayload {
            match_id: proposal.id,
            room_id: proposal.room_id,
            participant_ids: proposal.participant_ids(),
            state: proposal.state,
            idempotency_key: proposal.id.to_string(),
            occurred_at,
        };
        Self {
            match_id: proposal.id,
            idempotency_key: proposal.id.to_string(),
            payload,
            delivery_state: DeliveryState::Pending,
            attempts: 0,
            created_at: occurred_at,
        }
    }
}
