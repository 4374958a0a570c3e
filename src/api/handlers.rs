//! HTTP request handlers

use super::gateway::{twiml_reply, GatewayMessage};
use super::limits::rate_limited;
use super::sse::turn_stream;
use super::types::{
    ChatRequest, ChatResponse, ConversationDetailResponse, ErrorResponse, HealthResponse,
    SuccessResponse,
};
use super::AppState;
use crate::capability::InboundMessage;
use crate::db::{Channel, DbError};
use crate::router::InboundTurn;
use axum::{
    extract::{Form, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use std::collections::HashMap;

const DEVICE_ID_HEADER: &str = "x-device-id";

/// The gateway only understands response documents, errors included
const GATEWAY_ERROR_REPLY: &str = "Sorry, an error occurred. Please try again.";

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let limits = state.rate_limits;

    // Messaging gateway
    let gateway = rate_limited(
        Router::new().route("/api/webhook", post(gateway_webhook)),
        limits.webhook_per_minute,
    );
    // Web chat
    let web_chat = rate_limited(
        Router::new()
            .route("/chat", post(chat))
            .route("/chat/stream", post(chat_stream)),
        limits.chat_per_minute,
    );

    Router::new()
        .merge(gateway)
        .merge(web_chat)
        // Operator endpoints
        .route("/api/conversations/:id", get(get_conversation))
        .route("/api/conversations/:id/reset", post(reset_conversation))
        .route("/api/parties/:channel/:handle", delete(erase_party))
        .route("/health", get(health))
        .route("/version", get(get_version))
        .with_state(state)
}

// ============================================================
// Messaging Gateway
// ============================================================

async fn gateway_webhook(
    State(state): State<AppState>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let msg = match GatewayMessage::from_form(&form) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!(error = %e, "Rejected gateway message");
            return (
                StatusCode::BAD_REQUEST,
                [(header::CONTENT_TYPE, "text/xml")],
                twiml_reply(GATEWAY_ERROR_REPLY),
            )
                .into_response();
        }
    };
    tracing::info!(media = msg.media_urls.len(), "Gateway message received");

    let reply = state
        .router
        .reply(InboundTurn {
            channel: Channel::MessagingGateway,
            external_handle: msg.from,
            message: InboundMessage {
                text: msg.body,
                media_refs: msg.media_urls,
            },
        })
        .await;

    ([(header::CONTENT_TYPE, "text/xml")], twiml_reply(&reply)).into_response()
}

// ============================================================
// Web Chat
// ============================================================

fn web_chat_turn(headers: &HeaderMap, req: ChatRequest) -> Result<InboundTurn, AppError> {
    let device_id = headers
        .get(DEVICE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::BadRequest("X-Device-ID header is required".to_string()))?;

    if req.content.trim().is_empty() && req.media_urls.is_empty() {
        return Err(AppError::BadRequest(
            "Message must have content or media".to_string(),
        ));
    }

    Ok(InboundTurn {
        channel: Channel::WebChat,
        external_handle: device_id.to_string(),
        message: InboundMessage {
            text: req.content,
            media_refs: req.media_urls,
        },
    })
}

async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    let turn = web_chat_turn(&headers, req)?;
    let content = state.router.reply(turn).await;
    Ok(Json(ChatResponse { content }))
}

async fn chat_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> Result<Response, AppError> {
    let turn = web_chat_turn(&headers, req)?;
    // The turn task keeps running if the client goes away mid-stream
    let reply = state.router.handle_turn(turn);
    Ok(turn_stream(reply.events).into_response())
}

// ============================================================
// Operator Endpoints
// ============================================================

async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ConversationDetailResponse>, AppError> {
    let conversation = state.db.get_conversation(&id)?;
    let session_lock = state.db.session_lock(&id)?;
    let messages = state.db.get_messages(&id)?;

    Ok(Json(ConversationDetailResponse {
        conversation,
        session_lock,
        messages,
    }))
}

async fn reset_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, AppError> {
    state.db.get_conversation(&id)?;
    state.db.release_lock(&id)?;
    tracing::info!(conv_id = %id, "Operator reset conversation");
    Ok(Json(SuccessResponse { success: true }))
}

async fn erase_party(
    State(state): State<AppState>,
    Path((channel, handle)): Path<(String, String)>,
) -> Result<Json<SuccessResponse>, AppError> {
    let channel: Channel = channel.parse().map_err(AppError::BadRequest)?;
    if !state.db.erase_party(channel, &handle)? {
        return Err(AppError::NotFound(format!("No party {channel}/{handle}")));
    }
    tracing::info!(%channel, "Erased party and conversation history");
    Ok(Json(SuccessResponse { success: true }))
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn get_version() -> &'static str {
    concat!("intake-desk ", env!("CARGO_PKG_VERSION"))
}

// ============================================================
// Error Handling
// ============================================================

#[derive(Debug)]
enum AppError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl From<DbError> for AppError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::ConversationNotFound(_) => AppError::NotFound(e.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}
