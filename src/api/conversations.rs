//! Conversation API endpoints.
//!
//! - Post a user message (creates the conversation on first contact)
//! - Inspect a conversation or list all of them
//! - Close a conversation
//! - Stream a conversation's events over SSE

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        Json,
    },
    routing::{get, post},
    Router,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::events::RouterEvent;
use crate::router::{ConversationDetail, ConversationSummary, RouterError};

/// Create conversation routes.
pub fn routes() -> Router<Arc<super::routes::AppState>> {
    Router::new()
        .route("/", get(list_conversations))
        .route("/:id", get(get_conversation))
        .route("/:id/messages", post(post_message))
        .route("/:id/close", post(close_conversation))
        .route("/:id/events", get(stream_events))
}

// ─────────────────────────────────────────────────────────────────────────────
// Request/Response Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    pub content: String,
    /// Agent id to address; defaults to the roster's entry agent.
    #[serde(default)]
    pub recipient: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PostMessageResponse {
    pub conversation_id: String,
    pub accepted: bool,
}

fn router_error_response(err: RouterError) -> (StatusCode, String) {
    let status = match &err {
        RouterError::UnknownConversation(_) => StatusCode::NOT_FOUND,
        RouterError::ConversationEnded(_) => StatusCode::CONFLICT,
        RouterError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, err.to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// POST /api/conversations/:id/messages - Submit a user message.
async fn post_message(
    State(state): State<Arc<super::routes::AppState>>,
    Path(id): Path<String>,
    Json(req): Json<PostMessageRequest>,
) -> Result<Json<PostMessageResponse>, (StatusCode, String)> {
    if req.content.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "content must not be empty".to_string(),
        ));
    }

    state
        .router
        .submit(&id, req.content, req.recipient)
        .await
        .map_err(router_error_response)?;

    Ok(Json(PostMessageResponse {
        conversation_id: id,
        accepted: true,
    }))
}

/// GET /api/conversations - List all conversations.
async fn list_conversations(
    State(state): State<Arc<super::routes::AppState>>,
) -> Json<Vec<ConversationSummary>> {
    Json(state.router.list_conversations().await)
}

/// GET /api/conversations/:id - Summary plus full transcript.
async fn get_conversation(
    State(state): State<Arc<super::routes::AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ConversationDetail>, (StatusCode, String)> {
    state
        .router
        .conversation(&id)
        .await
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Conversation {} not found", id)))
}

/// POST /api/conversations/:id/close - End a conversation. The turn in
/// flight finishes and commits its cost before the close takes effect.
async fn close_conversation(
    State(state): State<Arc<super::routes::AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    state
        .router
        .close(&id)
        .await
        .map_err(router_error_response)?;
    Ok(Json(serde_json::json!({ "success": true })))
}

/// GET /api/conversations/:id/events - Stream this conversation's events.
///
/// The stream closes itself after the conversation ends. A subscriber that
/// falls behind loses the oldest events rather than stalling the router.
async fn stream_events(
    State(state): State<Arc<super::routes::AppState>>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    // Subscribe before the existence check so no event can slip between.
    let mut rx = state.router.subscribe();
    if state.router.conversation(&id).await.is_none() {
        return Err((StatusCode::NOT_FOUND, format!("Conversation {} not found", id)));
    }

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if event.conversation_id() != id {
                        continue;
                    }
                    let name = match &event {
                        RouterEvent::AgentReply { .. } => "agent_reply",
                        RouterEvent::ConversationEnded { .. } => "conversation_ended",
                    };
                    let done = matches!(&event, RouterEvent::ConversationEnded { .. });
                    yield Ok(Event::default().event(name).json_data(&event).unwrap());
                    if done {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Event subscriber for {} lagged by {} events", id, n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Ok(Sse::new(stream))
}
