use axum::extract::{Extension, Path, Query, State};
use axum::{Json, http::StatusCode};
use chorus_domain::feed::{FeedFilter, FeedPage, FeedQuery};
use chorus_domain::posts::{Post, PostCreate};
use serde::Deserialize;
use validator::Validate;

use super::{actor_identity, optional_actor};
use crate::middleware::AuthContext;
use crate::{error::ApiError, state::AppState, validation};

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreatePostRequest {
    #[validate(length(min = 1, max = 2000))]
    body: String,
    parent_post_id: Option<String>,
    #[serde(default)]
    is_pinned: bool,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct FeedParams {
    cursor: Option<String>,
    filter: Option<String>,
    limit: Option<usize>,
}

pub(super) async fn create_post(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<CreatePostRequest>,
) -> Result<(StatusCode, Json<Post>), ApiError> {
    validation::validate(&payload)?;
    let actor = actor_identity(&auth)?;
    let post = state
        .posts
        .create(
            &actor,
            PostCreate {
                body: payload.body,
                parent_post_id: payload.parent_post_id,
                is_pinned: payload.is_pinned,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(post)))
}

pub(super) async fn delete_post(
    State(state): State<AppState>,
    Path(post_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Post>, ApiError> {
    let actor = actor_identity(&auth)?;
    Ok(Json(state.posts.delete(&actor, &post_id).await?))
}

pub(super) async fn list_feed(
    State(state): State<AppState>,
    Query(params): Query<FeedParams>,
    auth: Option<Extension<AuthContext>>,
) -> Result<Json<FeedPage>, ApiError> {
    let viewer = optional_actor(auth.as_ref().map(|Extension(auth)| auth));
    let page = state
        .feed
        .list(FeedQuery {
            viewer_id: viewer.map(|viewer| viewer.user_id),
            cursor: params.cursor,
            filter: FeedFilter::parse(params.filter.as_deref())?,
            limit: params.limit,
        })
        .await?;
    Ok(Json(page))
}
