use serde::{Deserialize, Serialize};
use validator::Validate;

/// Criteria block accepted on submit
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CriteriaRequest {
    #[validate(length(min = 1))]
    pub language: String,
    #[validate(range(min = 0, max = 10))]
    pub fluency: u8,
    #[validate(length(min = 1))]
    pub topics: Vec<String>,
    #[serde(default)]
    pub dating: bool,
}

/// Request to join the waiting pool
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SubmitRequest {
    #[validate(length(min = 1))]
    #[serde(alias = "participant_id", rename = "participantId")]
    pub participant_id: String,
    #[validate(length(min = 1))]
    #[serde(alias = "session_id", rename = "sessionId")]
    pub session_id: String,
    #[validate(length(min = 1))]
    pub username: String,
    #[validate(length(min = 1))]
    pub gender: String,
    #[serde(alias = "lang_code", rename = "langCode", default = "default_lang_code")]
    pub lang_code: String,
    #[validate(nested)]
    pub criteria: CriteriaRequest,
}

fn default_lang_code() -> String {
    "en".to_string()
}

/// Request to leave the waiting pool
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CancelRequest {
    #[validate(length(min = 1))]
    #[serde(alias = "participant_id", rename = "participantId")]
    pub participant_id: String,
}

/// Confirm or decline a proposal
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ProposalResponseRequest {
    #[validate(length(min = 1))]
    #[serde(alias = "match_id", rename = "matchId")]
    pub match_id: String,
    #[validate(length(min = 1))]
    #[serde(alias = "participant_id", rename = "participantId")]
    pub participant_id: String,
}
