//! REST surface of the chat core
//!
//! Commands (send, mark read) and queries (history, conversations,
//! presence) over JSON. Every endpoint authenticates with a Bearer
//! capability token; the verified claims carry the caller's identity, so
//! no endpoint trusts a sender id from the request body.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::instrument;

use crate::auth::{AuthError, Claims};
use crate::messages::{MessageError, MessageTarget, MessageWire};
use crate::presence::PresenceStatus;
use crate::server::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/chat/messages", post(send_message_handler))
        .route(
            "/api/chat/messages/private/:user_id",
            get(private_history_handler),
        )
        .route(
            "/api/chat/messages/group/:group_id",
            get(group_history_handler),
        )
        .route("/api/chat/messages/:id/read", post(mark_read_handler))
        .route("/api/chat/messages/:id/info", get(message_info_handler))
        .route("/api/chat/conversations", get(conversations_handler))
        .route("/api/chat/users/online", get(online_users_handler))
        .route("/api/chat/users/status", get(user_status_handler))
}

/// API-level error carrying the HTTP status mapping
#[derive(Debug)]
pub enum ApiError {
    Auth(AuthError),
    Message(MessageError),
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        ApiError::Auth(err)
    }
}

impl From<MessageError> for ApiError {
    fn from(err: MessageError) -> Self {
        ApiError::Message(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Auth(e) => (StatusCode::UNAUTHORIZED, e.to_string()),
            ApiError::Message(e) => {
                let status = match e {
                    MessageError::InvalidTarget
                    | MessageError::InvalidContent(_)
                    | MessageError::ContentTooLong { .. } => StatusCode::BAD_REQUEST,
                    MessageError::NotGroupMember(_)
                    | MessageError::Blocked
                    | MessageError::Forbidden => StatusCode::FORBIDDEN,
                    MessageError::NotFound(_) | MessageError::UserNotFound(_) => {
                        StatusCode::NOT_FOUND
                    }
                    MessageError::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Extract and verify the Bearer token from the Authorization header
fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Claims, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| AuthError::Malformed("missing bearer token".to_string()))?;
    Ok(state.verifier.verify(token)?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub receiver_id: Option<i64>,
    pub group_id: Option<i64>,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub page: usize,
    #[serde(default = "default_per_page")]
    pub per_page: usize,
}

fn default_per_page() -> usize {
    50
}

impl Pagination {
    /// Page size is capped so a single request cannot drain a long history
    pub fn per_page(&self) -> usize {
        self.per_page.clamp(1, 100)
    }
}

/// POST /api/chat/messages
#[instrument(skip(state, headers, request))]
async fn send_message_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<MessageWire>), ApiError> {
    let claims = authenticate(&state, &headers)?;
    let target = MessageTarget::from_parts(request.receiver_id, request.group_id)?;

    let message = state
        .chat
        .send_message(claims.user_id, target, request.content)
        .await?;

    Ok((StatusCode::CREATED, Json(message.to_wire())))
}

/// GET /api/chat/messages/private/:user_id?page=&per_page=
#[instrument(skip(state, headers))]
async fn private_history_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
    Query(pagination): Query<Pagination>,
) -> Result<Json<Vec<MessageWire>>, ApiError> {
    let claims = authenticate(&state, &headers)?;
    let messages = state
        .chat
        .private_history(claims.user_id, user_id, pagination.page, pagination.per_page())
        .await?;
    Ok(Json(messages.iter().map(|m| m.to_wire()).collect()))
}

/// GET /api/chat/messages/group/:group_id?page=&per_page=
#[instrument(skip(state, headers))]
async fn group_history_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(group_id): Path<i64>,
    Query(pagination): Query<Pagination>,
) -> Result<Json<Vec<MessageWire>>, ApiError> {
    let claims = authenticate(&state, &headers)?;
    let messages = state
        .chat
        .group_history(claims.user_id, group_id, pagination.page, pagination.per_page())
        .await?;
    Ok(Json(messages.iter().map(|m| m.to_wire()).collect()))
}

/// POST /api/chat/messages/:id/read
#[instrument(skip(state, headers))]
async fn mark_read_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(message_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let claims = authenticate(&state, &headers)?;
    state.chat.mark_read(claims.user_id, &message_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/chat/messages/:id/info
#[instrument(skip(state, headers))]
async fn message_info_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(message_id): Path<String>,
) -> Result<Json<crate::messages::MessageInfo>, ApiError> {
    authenticate(&state, &headers)?;
    let info = state.chat.message_info(&message_id).await?;
    Ok(Json(info))
}

/// GET /api/chat/conversations
#[instrument(skip(state, headers))]
async fn conversations_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<crate::conversations::ConversationSummary>>, ApiError> {
    let claims = authenticate(&state, &headers)?;
    let conversations = state.conversations.conversations(claims.user_id).await?;
    Ok(Json(conversations))
}

/// GET /api/chat/users/online
#[instrument(skip(state, headers))]
async fn online_users_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<String>>, ApiError> {
    authenticate(&state, &headers)?;
    Ok(Json(state.presence.online_users()))
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    /// Comma-separated user ids
    pub ids: String,
}

/// GET /api/chat/users/status?ids=1,2,3
///
/// Per id: `"online"`, the last-seen epoch millis as a string, or
/// `"offline"` for users with no presence record. Unknown ids are skipped.
#[instrument(skip(state, headers))]
async fn user_status_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<StatusQuery>,
) -> Result<Json<BTreeMap<i64, String>>, ApiError> {
    authenticate(&state, &headers)?;

    let mut statuses = BTreeMap::new();
    for id in query.ids.split(',').filter_map(|s| s.trim().parse::<i64>().ok()) {
        let username = match state.directory.username_of(id).await {
            Ok(name) => name,
            Err(_) => continue,
        };
        let status = if state.presence.is_online(&username) {
            "online".to_string()
        } else {
            match state.presence.status_of(&username) {
                PresenceStatus::OfflineSince(millis) => millis.to_string(),
                _ => "offline".to_string(),
            }
        };
        statuses.insert(id, status);
    }
    Ok(Json(statuses))
}
