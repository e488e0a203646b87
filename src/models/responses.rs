use serde::{Deserialize, Serialize};

/// Generic acknowledgement for submit/cancel/confirm/decline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResponse {
    pub status: String,
    #[serde(rename = "participantId", skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<String>,
    #[serde(rename = "matchId", skip_serializing_if = "Option::is_none")]
    pub match_id: Option<String>,
}

impl AckResponse {
    pub fn accepted(participant_id: &str) -> Self {
        Self {
            status: "accepted".to_string(),
            participant_id: Some(participant_id.to_string()),
            match_id: None,
        }
    }

    pub fn ok(match_id: Option<&str>, participant_id: &str) -> Self {
        Self {
            status: "ok".to_string(),
            participant_id: Some(participant_id.to_string()),
            match_id: match_id.map(|m| m.to_string()),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub status_code: u16,
}

/// Queue/proposal counters for operators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    #[serde(rename = "waitingTotal")]
    pub waiting_total: usize,
    /// Waiting count per bucket key
    pub buckets: std::collections::HashMap<String, usize>,
    #[serde(rename = "oldestWaitSecs")]
    pub oldest_wait_secs: Option<i64>,
    #[serde(rename = "activeProposals")]
    pub active_proposals: usize,
}
