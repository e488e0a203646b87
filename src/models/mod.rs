// Model exports
pub mod domain;
pub mod requests;
pub mod responses;

pub use domain::{
    DeliveryState, MatchCriteria, MatchDecision, MatchFoundPayload, MatchProposal,
    NotificationRecord, Participant, ParticipantResponse, ParticipantStatus, ProposalState,
    ScoreWeights,
};
pub use requests::{CancelRequest, CriteriaRequest, ProposalResponseRequest, SubmitRequest};
pub use responses::{AckResponse, ErrorResponse, HealthResponse, StatsResponse};
