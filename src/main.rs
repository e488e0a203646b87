mod config;
mod core;
mod models;
mod routes;
mod services;

use actix_cors::Cors;
use actix_web::{error, http::StatusCode, middleware, web, App, HttpResponse, HttpServer};
use crate::config::{Settings, TriggerMode};
use crate::core::lifecycle::{LifecycleConfig, LifecycleManager};
use crate::core::matcher::{Matcher, MatcherConfig};
use crate::core::policy::ConversationPolicy;
use crate::core::{MatchEngine, RequestQueue};
use crate::models::ScoreWeights;
use crate::routes::AppState;
use crate::services::{AuditLog, GatewayClient, Notifier, RedisRecordStore, WebhookTransport};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// JSON error response for JSON payload errors
#[derive(Debug, serde::Serialize)]
pub struct JsonError {
    pub error: String,
    pub message: String,
    pub status_code: u16,
}

impl std::fmt::Display for JsonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error, self.message)
    }
}

impl std::error::Error for JsonError {}

impl error::ResponseError for JsonError {
    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::BAD_REQUEST))
            .content_type("application/json")
            .body(serde_json::to_string(self).unwrap_or_default())
    }
}

/// Handle JSON payload errors
pub fn handle_json_payload_error(
    err: error::JsonPayloadError,
    req: &actix_web::HttpRequest,
) -> actix_web::Error {
    tracing::info!("JSON payload error on {}: {}", req.path(), err);
    JsonError {
        error: "invalid_json".to_string(),
        message: format!("Invalid JSON: {}", err),
        status_code: 400,
    }
    .into()
}

/// Handle query payload errors
pub fn handle_query_payload_error(
    err: error::QueryPayloadError,
    _req: &actix_web::HttpRequest,
) -> actix_web::Error {
    JsonError {
        error: "invalid_query".to_string(),
        message: format!("Invalid query: {}", err),
        status_code: 400,
    }
    .into()
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load .env file if present
    dotenv::dotenv().ok();

    // Initialize logging
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_level(true);

    if log_format == "pretty" {
        subscriber.pretty().init();
    } else {
        subscriber.init();
    }

    info!("Starting Parley matchmaking engine...");

    // Load configuration
    let settings = Settings::load().unwrap_or_else(|e| {
        error!("Failed to load configuration: {}", e);
        panic!("Configuration error: {}", e);
    });

    info!("Configuration loaded successfully");

    // Notification record store (Redis)
    let l1_cache_size = settings.cache.l1_cache_size.unwrap_or(1000);
    let delivered_ttl = settings.cache.ttl_secs.unwrap_or(86400);

    let record_store = match RedisRecordStore::new(
        &settings.cache.redis_url,
        l1_cache_size,
        delivered_ttl,
    )
    .await
    {
        Ok(store) => {
            info!(
                "Record store initialized (L1: {} entries, delivered TTL: {}s)",
                l1_cache_size, delivered_ttl
            );
            Arc::new(store)
        }
        Err(e) => {
            error!("Failed to connect to Redis ({})", e);
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "Redis connection required",
            ));
        }
    };

    // Audit store (PostgreSQL)
    let audit = Arc::new(
        AuditLog::from_settings(
            &settings.database.url,
            settings.database.max_connections,
            settings.database.min_connections,
        )
        .await
        .unwrap_or_else(|e| {
            error!("Failed to connect to PostgreSQL: {}", e);
            panic!("PostgreSQL connection error: {}", e);
        }),
    );

    info!("Audit store initialized");

    // Outbound notifier with resumption of leftover pending records
    let transport = WebhookTransport::new(
        settings.webhooks.match_found_url.clone(),
        Duration::from_secs(settings.notifier.request_timeout_secs),
    )
    .unwrap_or_else(|e| {
        error!("Failed to build webhook transport: {}", e);
        panic!("Webhook transport error: {}", e);
    });

    let notifier = Notifier::spawn(
        Arc::new(transport),
        record_store,
        Some(audit.clone()),
        &settings.notifier,
    );

    match notifier.resume().await {
        Ok(0) => {}
        Ok(n) => info!("Resumed {} pending notification deliveries", n),
        Err(e) => error!("Failed to resume pending deliveries: {}", e),
    }

    // Optional gateway collaborator
    let gateway = match &settings.webhooks.gateway_url {
        Some(url) => {
            let client = GatewayClient::new(
                url.clone(),
                Duration::from_secs(settings.notifier.request_timeout_secs),
            )
            .unwrap_or_else(|e| {
                error!("Failed to build gateway client: {}", e);
                panic!("Gateway client error: {}", e);
            });
            Some(Arc::new(client))
        }
        None => None,
    };

    // Matching core
    let weights = ScoreWeights {
        language: settings.scoring.weights.language,
        fluency: settings.scoring.weights.fluency,
        topics: settings.scoring.weights.topics,
        dating: settings.scoring.weights.dating,
    };

    let queue = Arc::new(RequestQueue::new());
    let matcher = Arc::new(Matcher::new(
        Arc::new(ConversationPolicy::new(weights)),
        MatcherConfig::from(&settings.engine),
    ));
    let lifecycle = Arc::new(LifecycleManager::new(
        LifecycleConfig::from_settings(&settings.lifecycle, settings.engine.reenqueue_resets_age),
        queue.clone(),
        notifier,
        gateway,
        Some(audit.clone()),
    ));

    info!(
        "Matcher initialized (group size: {}, trigger: {:?})",
        matcher.config().group_size,
        settings.engine.trigger
    );

    let engine = Arc::new(MatchEngine::new(
        queue,
        matcher,
        lifecycle,
        &settings.engine,
    ));

    // Scheduling loop runs for the lifetime of the process
    if settings.engine.trigger == TriggerMode::Interval {
        info!(
            "Matching passes every {}ms",
            settings.engine.pass_interval_ms
        );
    }
    tokio::spawn(Arc::clone(&engine).run());

    // Build application state
    let app_state = AppState {
        engine,
        audit: Some(audit),
    };

    // Configure HTTP server
    let host = settings.server.host.clone();
    let port = settings.server.port;
    let workers = settings.server.workers.unwrap_or(4);

    info!("Starting HTTP server on {}:{}", host, port);

    HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(web::JsonConfig::default().error_handler(handle_json_payload_error))
            .app_data(web::QueryConfig::default().error_handler(handle_query_payload_error))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .configure(routes::configure_routes)
    })
    .workers(workers)
    .bind((host, port))?
    .run()
    .await
}
