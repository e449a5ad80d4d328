use axum::extract::{Path, Query, State};
use axum::{
    Json, Router,
    http::{StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chanlink_domain::debounce::{FlushOutcome, MessageOutcome};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{error::ApiError, middleware as app_middleware, observability, state::AppState};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route(
            "/v1/inbound/:group_id/:conversation_id",
            post(receive_message),
        )
        .route(
            "/v1/inbound/:group_id/:conversation_id/flush",
            post(flush_conversation),
        )
        .route("/v1/oauth/authorize", get(begin_authorization))
        .route("/v1/oauth/callback", get(complete_authorization))
        .route(
            "/v1/channels/:channel_id/credential-state",
            get(credential_state),
        )
        .route("/v1/channels/:channel_id/token/ensure", post(ensure_token))
        .layer(middleware::from_fn(app_middleware::metrics_layer))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    environment: String,
    instance_id: String,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        environment: state.config.app_env.clone(),
        instance_id: state.aggregator.instance_id().to_string(),
    })
}

async fn metrics() -> Response {
    match observability::render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

async fn receive_message(
    State(state): State<AppState>,
    Path((group_id, conversation_id)): Path<(String, String)>,
    Json(payload): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if group_id.trim().is_empty() || conversation_id.trim().is_empty() {
        return Err(ApiError::Validation(
            "group_id and conversation_id are required".into(),
        ));
    }
    let outcome = state
        .aggregator
        .on_message(&conversation_id, &group_id, &payload)
        .await
        .map_err(|err| {
            tracing::error!(
                %conversation_id,
                %group_id,
                error = %err,
                "failed to buffer inbound message"
            );
            ApiError::Unavailable(err.to_string())
        })?;
    let owner = match outcome {
        MessageOutcome::Scheduled => "local",
        MessageOutcome::OwnedByPeer => "peer",
    };
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "buffered", "owner": owner })),
    ))
}

async fn flush_conversation(
    State(state): State<AppState>,
    Path((group_id, conversation_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let channel = state.aggregator.config().channel.clone();
    let outcome = state
        .aggregator
        .flush(&conversation_id, &group_id, &channel)
        .await
        .map_err(|err| ApiError::Unavailable(err.to_string()))?;
    let mut body = json!({ "outcome": outcome.as_str() });
    match outcome {
        FlushOutcome::Published { messages } | FlushOutcome::DeadLettered { messages } => {
            body["messages"] = json!(messages);
        }
        FlushOutcome::Retrying { attempt } => body["attempt"] = json!(attempt),
        FlushOutcome::Deferred { remaining } => {
            body["remaining_ms"] = json!(remaining.as_millis() as u64);
        }
        FlushOutcome::Empty | FlushOutcome::OwnedByPeer | FlushOutcome::InFlight => {}
    }
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
struct AuthorizeQuery {
    group_id: String,
}

async fn begin_authorization(
    State(state): State<AppState>,
    Query(query): Query<AuthorizeQuery>,
) -> Result<Json<Value>, ApiError> {
    let request = state
        .authorization
        .begin_authorization(&query.group_id)
        .await?;
    Ok(Json(json!({ "url": request.url, "state": request.state })))
}

/// The provider redirects here with `oa_id` naming the connected account.
#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: String,
    state: String,
    oa_id: String,
}

async fn complete_authorization(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Result<Json<Value>, ApiError> {
    if query.code.is_empty() || query.oa_id.is_empty() {
        return Err(ApiError::Validation("code and oa_id are required".into()));
    }
    let channel = state
        .authorization
        .complete_authorization(&query.state, &query.code, &query.oa_id)
        .await?;
    tracing::info!(
        channel_id = %channel.id,
        group_id = %channel.group_id,
        "channel connected"
    );
    Ok(Json(json!({
        "channel_id": channel.id,
        "group_id": channel.group_id,
        "provider_id": channel.provider_id,
        "expire_at_ms": channel.expire_at_ms,
    })))
}

async fn credential_state(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let credential = state.tokens.credential_state(&channel_id).await?;
    Ok(Json(json!({
        "channel_id": channel_id,
        "state": credential.as_str(),
    })))
}

/// Makes sure the channel holds a usable access token, refreshing it if
/// needed. The token itself never leaves the process.
async fn ensure_token(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.tokens.get_valid_access_token(&channel_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
