use axum::Json;
use axum::extract::{Extension, Path, Query, State};
use chorus_domain::notifications::{NotificationListQuery, PagedNotifications};
use serde::{Deserialize, Serialize};

use super::actor_identity;
use crate::middleware::AuthContext;
use crate::{error::ApiError, state::AppState};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct NotificationParams {
    cursor: Option<String>,
    limit: Option<usize>,
    include_read: Option<bool>,
}

#[derive(Serialize)]
pub(super) struct UnreadCountResponse {
    count: usize,
}

#[derive(Serialize)]
pub(super) struct MarkReadResponse {
    updated: bool,
}

#[derive(Serialize)]
pub(super) struct MarkAllReadResponse {
    updated: usize,
}

pub(super) async fn list_notifications(
    State(state): State<AppState>,
    Query(params): Query<NotificationParams>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<PagedNotifications>, ApiError> {
    let actor = actor_identity(&auth)?;
    let page = state
        .notifications
        .list(NotificationListQuery {
            recipient_id: actor.user_id,
            cursor: params.cursor,
            limit: params.limit,
            include_read: params.include_read,
        })
        .await?;
    Ok(Json(page))
}

pub(super) async fn unread_count(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<UnreadCountResponse>, ApiError> {
    let actor = actor_identity(&auth)?;
    let count = state.notifications.unread_count(&actor.user_id).await?;
    Ok(Json(UnreadCountResponse { count }))
}

pub(super) async fn mark_read(
    State(state): State<AppState>,
    Path(notification_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<MarkReadResponse>, ApiError> {
    let actor = actor_identity(&auth)?;
    let updated = state
        .notifications
        .mark_read(&actor.user_id, &notification_id)
        .await?;
    Ok(Json(MarkReadResponse { updated }))
}

pub(super) async fn mark_all_read(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<MarkAllReadResponse>, ApiError> {
    let actor = actor_identity(&auth)?;
    let updated = state.notifications.mark_all_read(&actor.user_id).await?;
    Ok(Json(MarkAllReadResponse { updated }))
}
