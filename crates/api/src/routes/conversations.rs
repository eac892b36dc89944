use axum::extract::{Extension, Path, Query, State};
use axum::{Json, http::StatusCode};
use chorus_domain::conversations::{
    Conversation, ConversationCreate, ConversationKind, ConversationParticipant,
    ConversationSettings, ConversationSummary, Message, SendMessageInput, build_message_catchup,
};
use serde::Deserialize;
use validator::Validate;

use super::actor_identity;
use crate::middleware::AuthContext;
use crate::{error::ApiError, state::AppState, validation};

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateConversationRequest {
    kind: ConversationKind,
    #[validate(length(min = 1, max = 50))]
    participant_ids: Vec<String>,
    #[validate(length(min = 1, max = 100))]
    title: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub(super) struct SendMessageRequest {
    #[validate(length(min = 1, max = 2000))]
    body: String,
    #[validate(length(min = 1, max = 128))]
    request_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct MessageParams {
    limit: Option<usize>,
    since_created_at_ms: Option<i64>,
    since_message_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SettingsRequest {
    is_pinned: Option<bool>,
    is_muted: Option<bool>,
    muted_until_ms: Option<i64>,
}

pub(super) async fn create_conversation(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<CreateConversationRequest>,
) -> Result<(StatusCode, Json<Conversation>), ApiError> {
    validation::validate(&payload)?;
    let actor = actor_identity(&auth)?;
    let conversation = state
        .conversations
        .create_conversation(
            &actor,
            ConversationCreate {
                kind: payload.kind,
                participant_ids: payload.participant_ids,
                title: payload.title,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

pub(super) async fn list_conversations(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Vec<ConversationSummary>>, ApiError> {
    let actor = actor_identity(&auth)?;
    Ok(Json(state.conversations.list_conversations(&actor).await?))
}

pub(super) async fn get_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Conversation>, ApiError> {
    let actor = actor_identity(&auth)?;
    Ok(Json(
        state
            .conversations
            .get_conversation(&actor, &conversation_id)
            .await?,
    ))
}

pub(super) async fn list_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Query(params): Query<MessageParams>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let actor = actor_identity(&auth)?;
    let cursor = build_message_catchup(
        params.limit,
        params.since_created_at_ms,
        params.since_message_id,
    );
    Ok(Json(
        state
            .conversations
            .list_messages(&actor, &conversation_id, cursor)
            .await?,
    ))
}

pub(super) async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<Message>), ApiError> {
    validation::validate(&payload)?;
    let actor = actor_identity(&auth)?;
    let message = state
        .conversations
        .send_message(
            &actor,
            SendMessageInput {
                conversation_id,
                body: payload.body,
                request_id: payload.request_id,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

pub(super) async fn mark_read(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<ConversationParticipant>, ApiError> {
    let actor = actor_identity(&auth)?;
    Ok(Json(
        state
            .conversations
            .mark_read(&actor, &conversation_id)
            .await?,
    ))
}

pub(super) async fn leave(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<ConversationParticipant>, ApiError> {
    let actor = actor_identity(&auth)?;
    Ok(Json(
        state.conversations.leave(&actor, &conversation_id).await?,
    ))
}

pub(super) async fn update_settings(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<SettingsRequest>,
) -> Result<Json<ConversationParticipant>, ApiError> {
    let actor = actor_identity(&auth)?;
    let participant = state
        .conversations
        .update_settings(
            &actor,
            &conversation_id,
            ConversationSettings {
                is_pinned: payload.is_pinned,
                is_muted: payload.is_muted,
                muted_until_ms: payload.muted_until_ms,
            },
        )
        .await?;
    Ok(Json(participant))
}
