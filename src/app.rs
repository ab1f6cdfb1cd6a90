use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::engine::{self, ConversationEvent, EventOutcome};
use crate::error::EngineError;
use crate::persist;
use crate::sweeper;
use crate::types::{
    AgentMessageBody, AppState, VisitorMessageBody, WhatsAppWebhookBody,
};
use crate::whatsapp;

/// Drops absorbed error classes per the propagation policy: only validation
/// failures reach the caller, everything else is logged and becomes an empty
/// outcome.
fn absorb(
    result: Result<EventOutcome, EngineError>,
    conversation_id: &str,
) -> Result<EventOutcome, EngineError> {
    match result {
        Err(err @ EngineError::Validation(_)) => Err(err),
        Err(err) => {
            warn!(conversation_id, error = %err, "event dropped");
            Ok(EventOutcome {
                conversation_id: conversation_id.to_string(),
                ..EventOutcome::default()
            })
        }
        ok => ok,
    }
}

async fn post_visitor_message(
    Path(widget_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<VisitorMessageBody>,
) -> impl IntoResponse {
    let conversation_id = body
        .conversation_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let event = ConversationEvent::VisitorMessage {
        widget_id,
        text: body.text,
        dedupe_key: body.client_message_id,
    };

    match absorb(
        engine::handle_event(&state, &conversation_id, event).await,
        &conversation_id,
    ) {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({
                "conversationId": conversation_id,
                "state": outcome.state,
                "outboundMessages": outcome.outbound,
            })),
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}

async fn post_agent_message(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<AgentMessageBody>,
) -> impl IntoResponse {
    let event = ConversationEvent::AgentMessage { text: body.text };
    match absorb(
        engine::handle_event(&state, &conversation_id, event).await,
        &conversation_id,
    ) {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({
                "state": outcome.state,
                "outboundMessages": outcome.outbound,
            })),
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}

/// Agent-queue listing: every live conversation, most recently active first.
async fn get_conversations(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut list = {
        let conversations = state.conversations.read().await;
        conversations
            .values()
            .filter(|c| !c.state.is_closed())
            .map(|c| c.summary())
            .collect::<Vec<_>>()
    };
    list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    Json(json!({ "conversations": list }))
}

async fn get_messages(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let conversations = state.conversations.read().await;
    match conversations.get(&conversation_id) {
        Some(conversation) => {
            (StatusCode::OK, Json(json!({ "messages": conversation.messages }))).into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "conversation not found" })),
        )
            .into_response(),
    }
}

async fn whatsapp_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let secret = std::env::var("WHATSAPP_WEBHOOK_SECRET").unwrap_or_default();
    let signature = headers
        .get("x-webhook-signature")
        .and_then(|value| value.to_str().ok());
    if !whatsapp::verify_webhook_signature(&secret, signature, &body) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid signature" })),
        )
            .into_response();
    }

    let Ok(payload) = serde_json::from_slice::<WhatsAppWebhookBody>(&body) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "malformed webhook payload" })),
        )
            .into_response();
    };

    let conversation_id = {
        let routes = state.whatsapp_routes.read().await;
        routes.get(&payload.external_message_id).cloned()
    };
    let Some(conversation_id) = conversation_id else {
        warn!(
            external_message_id = %payload.external_message_id,
            "whatsapp webhook did not match a conversation"
        );
        return (StatusCode::OK, Json(json!({ "outboundMessages": [] }))).into_response();
    };

    let event = ConversationEvent::WhatsAppInbound { text: payload.text };
    match absorb(
        engine::handle_event(&state, &conversation_id, event).await,
        &conversation_id,
    ) {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({ "outboundMessages": outcome.outbound })),
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}

async fn run_sweep(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = sweeper::run_inactivity_sweep(&state).await;
    (StatusCode::OK, Json(report))
}

async fn invalidate_widget_config(
    Path(widget_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    state.invalidate_widget_config(&widget_id).await;
    info!(widget_id, "widget config invalidated");
    (StatusCode::OK, Json(json!({ "ok": true })))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": chrono::Utc::now().to_rfc3339() }))
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/widget/{widget_id}/message", post(post_visitor_message))
        .route(
            "/api/widget/{widget_id}/config/invalidate",
            post(invalidate_widget_config),
        )
        .route("/api/conversations", get(get_conversations))
        .route(
            "/api/conversation/{conversation_id}/agent-message",
            post(post_agent_message),
        )
        .route(
            "/api/conversation/{conversation_id}/messages",
            get(get_messages),
        )
        .route("/api/whatsapp/webhook", post(whatsapp_webhook))
        .route("/api/sweep", post(run_sweep))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run() {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let port = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(4000);
    let sweep_interval_secs = std::env::var("SWEEP_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(60);

    let database_url = std::env::var("DATABASE_URL").unwrap_or_default();
    let db = if database_url.trim().is_empty() {
        warn!("DATABASE_URL not set; running with in-memory state only");
        None
    } else {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&database_url)
            .await
            .expect("failed to connect to postgres (check DATABASE_URL)");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("failed to run sqlx migrations");
        Some(pool)
    };

    let state = Arc::new(AppState::new(db));
    persist::hydrate(&state).await;
    sweeper::spawn_interval(state.clone(), sweep_interval_secs);

    let app = build_router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");

    info!(%addr, "widget chat server running");
    axum::serve(listener, app)
        .await
        .expect("server runtime failure");
}
