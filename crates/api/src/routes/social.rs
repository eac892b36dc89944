use axum::extract::{Extension, Path, State};
use axum::Json;
use chorus_domain::profiles::{ProfileRegistration, ProfileUpdate, ProfileView, UserProfile};
use chorus_domain::social::{
    BlockToggle, BookmarkToggle, FollowRequestDecision, FollowRequestResolution, FollowToggle,
    LikeToggle, MuteToggle, RepostToggle,
};
use serde::Deserialize;
use validator::Validate;

use super::{actor_identity, optional_actor};
use crate::middleware::AuthContext;
use crate::{error::ApiError, state::AppState, validation};

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub(super) struct RegisterProfileRequest {
    #[validate(length(min = 3, max = 31))]
    username: String,
    #[validate(length(min = 1, max = 80))]
    display_name: Option<String>,
    #[validate(length(max = 280))]
    bio: Option<String>,
    #[serde(default)]
    is_private: bool,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub(super) struct UpdateProfileRequest {
    #[validate(length(min = 1, max = 80))]
    display_name: Option<String>,
    #[validate(length(max = 280))]
    bio: Option<String>,
    is_private: Option<bool>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub(super) struct LikeToggleRequest {
    #[validate(length(min = 1, max = 128))]
    post_id: String,
}

pub(super) async fn register_profile(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<RegisterProfileRequest>,
) -> Result<Json<UserProfile>, ApiError> {
    validation::validate(&payload)?;
    let actor = actor_identity(&auth)?;
    let profile = state
        .profiles
        .register(
            &actor,
            ProfileRegistration {
                username: payload.username,
                display_name: payload.display_name,
                bio: payload.bio,
                is_private: payload.is_private,
            },
        )
        .await?;
    Ok(Json(profile))
}

pub(super) async fn update_profile(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<UpdateProfileRequest>,
) -> Result<Json<UserProfile>, ApiError> {
    validation::validate(&payload)?;
    let actor = actor_identity(&auth)?;
    let profile = state
        .profiles
        .update(
            &actor,
            ProfileUpdate {
                display_name: payload.display_name,
                bio: payload.bio,
                is_private: payload.is_private,
            },
        )
        .await?;
    Ok(Json(profile))
}

pub(super) async fn get_profile(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    auth: Option<Extension<AuthContext>>,
) -> Result<Json<ProfileView>, ApiError> {
    let viewer = optional_actor(auth.as_ref().map(|Extension(auth)| auth));
    let view = state.profiles.get(viewer.as_ref(), &user_id).await?;
    Ok(Json(view))
}

pub(super) async fn toggle_follow(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<FollowToggle>, ApiError> {
    let actor = actor_identity(&auth)?;
    Ok(Json(state.social.toggle_follow(&actor, &user_id).await?))
}

pub(super) async fn accept_follow_request(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<FollowRequestResolution>, ApiError> {
    let actor = actor_identity(&auth)?;
    let resolution = state
        .social
        .respond_follow_request(&actor, &user_id, FollowRequestDecision::Accept)
        .await?;
    Ok(Json(resolution))
}

pub(super) async fn decline_follow_request(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<FollowRequestResolution>, ApiError> {
    let actor = actor_identity(&auth)?;
    let resolution = state
        .social
        .respond_follow_request(&actor, &user_id, FollowRequestDecision::Decline)
        .await?;
    Ok(Json(resolution))
}

pub(super) async fn toggle_block(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<BlockToggle>, ApiError> {
    let actor = actor_identity(&auth)?;
    Ok(Json(state.social.toggle_block(&actor, &user_id).await?))
}

pub(super) async fn toggle_mute(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<MuteToggle>, ApiError> {
    let actor = actor_identity(&auth)?;
    Ok(Json(state.social.toggle_mute(&actor, &user_id).await?))
}

pub(super) async fn toggle_like(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<LikeToggleRequest>,
) -> Result<Json<LikeToggle>, ApiError> {
    validation::validate(&payload)?;
    let actor = actor_identity(&auth)?;
    Ok(Json(state.social.toggle_like(&actor, &payload.post_id).await?))
}

pub(super) async fn toggle_repost(
    State(state): State<AppState>,
    Path(post_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<RepostToggle>, ApiError> {
    let actor = actor_identity(&auth)?;
    Ok(Json(state.social.toggle_repost(&actor, &post_id).await?))
}

pub(super) async fn toggle_bookmark(
    State(state): State<AppState>,
    Path(post_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<BookmarkToggle>, ApiError> {
    let actor = actor_identity(&auth)?;
    Ok(Json(state.social.toggle_bookmark(&actor, &post_id).await?))
}
