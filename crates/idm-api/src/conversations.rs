use axum::{
    Extension, Json,
    extract::{FromRequestParts, Path, Query, State},
    http::{StatusCode, request::Parts},
    response::IntoResponse,
};
use axum_extra::extract::WithRejection;
use serde::Deserialize;

use idm_db::models::ConversationRow;
use idm_types::api::{
    AppendMessageRequest, Claims, CreateConversationRequest, CreateConversationResponse,
    SuccessResponse,
};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// Display cap. Absent means every conversation.
    pub limit: Option<u32>,
}

/// A conversation from the `{id}` path segment that the caller owns.
///
/// Extracting it runs the ownership guard, so any handler taking one is
/// already authorized.
pub struct OwnedConversation(pub ConversationRow);

impl FromRequestParts<AppState> for OwnedConversation {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let Path(conversation_id) = Path::<i64>::from_request_parts(parts, state)
            .await
            .map_err(|e| ApiError::Validation(e.body_text()))?;

        let user_id = parts
            .extensions
            .get::<Claims>()
            .map(|claims| claims.sub)
            .ok_or_else(|| ApiError::Auth("missing credentials".into()))?;

        let row = state.conversations.authorize(user_id, conversation_id).await?;
        Ok(Self(row))
    }
}

/// GET /api/conversations
pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let conversations = state.conversations.list_conversations(claims.sub, query.limit).await?;
    Ok(Json(conversations))
}

/// POST /api/conversations
pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    WithRejection(body, _): WithRejection<Option<Json<CreateConversationRequest>>, ApiError>,
) -> Result<impl IntoResponse, ApiError> {
    // No body at all means no title
    let title = body.and_then(|Json(req)| req.title);
    let id = state.conversations.create_conversation(claims.sub, title).await?;
    Ok((StatusCode::CREATED, Json(CreateConversationResponse { id })))
}

/// GET /api/conversations/{id}
pub async fn get_conversation(
    State(state): State<AppState>,
    OwnedConversation(row): OwnedConversation,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.conversations.detail_of(row).await?))
}

/// GET /api/conversations/{id}/messages
pub async fn get_messages(
    State(state): State<AppState>,
    OwnedConversation(row): OwnedConversation,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.conversations.messages_of(row.id).await?))
}

/// POST /api/conversations/{id}/messages
pub async fn append_message(
    State(state): State<AppState>,
    OwnedConversation(row): OwnedConversation,
    WithRejection(Json(req), _): WithRejection<Json<AppendMessageRequest>, ApiError>,
) -> Result<impl IntoResponse, ApiError> {
    state.chat.append(row.id, req.role, req.content).await?;
    Ok((StatusCode::CREATED, Json(SuccessResponse::ok())))
}

/// DELETE /api/conversations/{id}
pub async fn delete_conversation(
    State(state): State<AppState>,
    OwnedConversation(row): OwnedConversation,
) -> Result<impl IntoResponse, ApiError> {
    state.conversations.delete_of(row.id).await?;
    state.chat.forget(row.id).await;
    Ok(Json(SuccessResponse::ok()))
}
