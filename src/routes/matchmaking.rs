use actix_web::{web, HttpResponse, Responder};
use std::sync::Arc;
use validator::Validate;

use crate::core::engine::{EngineError, MatchEngine};
use crate::core::queue::QueueError;
use crate::core::LifecycleError;
use crate::models::{
    AckResponse, CancelRequest, ErrorResponse, HealthResponse, MatchCriteria, Participant,
    ProposalResponseRequest, SubmitRequest,
};
use crate::services::AuditLog;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<MatchEngine>,
    pub audit: Option<Arc<AuditLog>>,
}

/// Configure all matchmaking routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .route("/queue/submit", web::post().to(submit))
        .route("/queue/cancel", web::post().to(cancel))
        .route("/matches/confirm", web::post().to(confirm))
        .route("/matches/decline", web::post().to(decline))
        .route("/queue/stats", web::get().to(stats));
}

/// Health check endpoint
async fn health_check(state: web::Data<AppState>) -> impl Responder {
    let db_healthy = match &state.audit {
        Some(audit) => audit.health_check().await.unwrap_or(false),
        None => true,
    };

    let status = if db_healthy { "healthy" } else { "degraded" };

    HttpResponse::Ok().json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now(),
    })
}

/// Join the waiting pool
///
/// POST /api/v1/queue/submit
///
/// Request body:
/// ```json
/// {
///   "participantId": "string",
///   "sessionId": "string",
///   "username": "string",
///   "gender": "string",
///   "langCode": "en",
///   "criteria": { "language": "en", "fluency": 5, "topics": ["music"], "dating": false }
/// }
/// ```
async fn submit(state: web::Data<AppState>, req: web::Json<SubmitRequest>) -> impl Responder {
    if let Err(errors) = req.validate() {
        tracing::info!("Validation failed for submit request: {:?}", errors);
        return HttpResponse::BadRequest().json(ErrorResponse {
            error: "Validation failed".to_string(),
            message: errors.to_string(),
            status_code: 400,
        });
    }

    let participant = Participant::new(
        req.participant_id.clone(),
        req.session_id.clone(),
        req.username.clone(),
        req.gender.clone(),
        req.lang_code.clone(),
        MatchCriteria {
            language: req.criteria.language.clone(),
            fluency: req.criteria.fluency,
            topics: req.criteria.topics.clone(),
            dating: req.criteria.dating,
        },
    );

    match state.engine.submit(participant) {
        Ok(()) => {
            tracing::info!(participant = %req.participant_id, "Participant submitted");
            HttpResponse::Accepted().json(AckResponse::accepted(&req.participant_id))
        }
        Err(e) => engine_error_response(e),
    }
}

/// Leave the waiting pool (or withdraw from an open proposal)
///
/// POST /api/v1/queue/cancel
async fn cancel(state: web::Data<AppState>, req: web::Json<CancelRequest>) -> impl Responder {
    if let Err(errors) = req.validate() {
        return HttpResponse::BadRequest().json(ErrorResponse {
            error: "Validation failed".to_string(),
            message: errors.to_string(),
            status_code: 400,
        });
    }

    match state.engine.cancel(&req.participant_id).await {
        Ok(()) => {
            tracing::info!(participant = %req.participant_id, "Participant cancelled");
            HttpResponse::Ok().json(AckResponse::ok(None, &req.participant_id))
        }
        Err(e) => engine_error_response(e),
    }
}

/// Accept an open proposal
///
/// POST /api/v1/matches/confirm
async fn confirm(
    state: web::Data<AppState>,
    req: web::Json<ProposalResponseRequest>,
) -> impl Responder {
    if let Err(errors) = req.validate() {
        return HttpResponse::BadRequest().json(ErrorResponse {
            error: "Validation failed".to_string(),
            message: errors.to_string(),
            status_code: 400,
        });
    }

    match state.engine.confirm(&req.match_id, &req.participant_id).await {
        Ok(proposal_state) => {
            tracing::info!(
                match_id = %req.match_id,
                participant = %req.participant_id,
                state = ?proposal_state,
                "Confirmation recorded"
            );
            HttpResponse::Ok().json(AckResponse::ok(Some(&req.match_id), &req.participant_id))
        }
        Err(e) => engine_error_response(e),
    }
}

/// Reject an open proposal
///
/// POST /api/v1/matches/decline
async fn decline(
    state: web::Data<AppState>,
    req: web::Json<ProposalResponseRequest>,
) -> impl Responder {
    if let Err(errors) = req.validate() {
        return HttpResponse::BadRequest().json(ErrorResponse {
            error: "Validation failed".to_string(),
            message: errors.to_string(),
            status_code: 400,
        });
    }

    match state.engine.decline(&req.match_id, &req.participant_id).await {
        Ok(_) => {
            tracing::info!(
                match_id = %req.match_id,
                participant = %req.participant_id,
                "Decline recorded"
            );
            HttpResponse::Ok().json(AckResponse::ok(Some(&req.match_id), &req.participant_id))
        }
        Err(e) => engine_error_response(e),
    }
}

/// Pool and proposal counters
///
/// GET /api/v1/queue/stats
async fn stats(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(state.engine.stats())
}

/// Map engine errors onto HTTP statuses
fn engine_error_response(err: EngineError) -> HttpResponse {
    let (status_code, error) = match &err {
        EngineError::Queue(QueueError::DuplicateParticipant(_)) => (409, "Already waiting"),
        EngineError::Queue(QueueError::NotFound(_)) => (404, "Not found"),
        EngineError::AlreadyProposed(_) => (409, "Already in a proposal"),
        EngineError::Lifecycle(LifecycleError::NotFound(_)) => (404, "Not found"),
        EngineError::Lifecycle(LifecycleError::InvalidTransition { .. }) => {
            (409, "Invalid transition")
        }
        EngineError::BadMatchId(_) => (400, "Invalid match id"),
    };

    let body = ErrorResponse {
        error: error.to_string(),
        message: err.to_string(),
        status_code,
    };

    match status_code {
        400 => HttpResponse::BadRequest().json(body),
        404 => HttpResponse::NotFound().json(body),
        409 => HttpResponse::Conflict().json(body),
        _ => HttpResponse::InternalServerError().json(body),
    }
}
