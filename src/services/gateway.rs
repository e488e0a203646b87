use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur when calling the gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("HTTP request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("Gateway returned error: {0}")]
    ApiError(String),
}

/// Client for the session gateway collaborator
///
/// The gateway is told when a proposal is created so it can inform connected
/// clients out-of-band. Calls are best-effort: a failure is logged and never
/// blocks the matching flow.
pub struct GatewayClient {
    client: Client,
    url: String,
}

impl GatewayClient {
    pub fn new(url: String, request_timeout: Duration) -> Result<Self, GatewayError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self { client, url })
    }

    /// Tell the gateway a proposal entered Proposed
    pub async fn notify_proposed(
        &self,
        match_id: Uuid,
        participant_ids: &[String],
        room_id: Uuid,
    ) -> Result<(), GatewayError> {
        let payload = serde_json::json!({
            "matchId": match_id,
            "roomId": room_id,
            "participantIds": participant_ids,
        });

        let response = self.client.post(&self.url).json(&payload).send().await?;

        if !response.status().is_success() {
            return Err(GatewayError::ApiError(format!(
                "Failed to notify gateway: {}",
                response.status()
            )));
        }

        tracing::debug!(%match_id, "Gateway notified of proposal");
        Ok(())
    }
}
