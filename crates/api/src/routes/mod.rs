mod conversations;
mod notifications;
mod posts;
mod social;

use axum::extract::State;
use axum::{
    Json, Router,
    http::{StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post, put},
};
use chorus_domain::identity::ActorIdentity;
use serde::Serialize;

use crate::middleware::AuthContext;
use crate::{error::ApiError, middleware as app_middleware, observability, realtime, state::AppState};

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/v1/users/me",
            put(social::register_profile).patch(social::update_profile),
        )
        .route("/v1/follows/:user_id/follow", post(social::toggle_follow))
        .route(
            "/v1/follows/:user_id/requests/accept",
            post(social::accept_follow_request),
        )
        .route(
            "/v1/follows/:user_id/requests/decline",
            post(social::decline_follow_request),
        )
        .route("/v1/blocks/:user_id", post(social::toggle_block))
        .route("/v1/mutes/:user_id", post(social::toggle_mute))
        .route("/v1/likes/like-toggle", post(social::toggle_like))
        .route("/v1/reposts/:post_id", post(social::toggle_repost))
        .route("/v1/bookmarks/:post_id", post(social::toggle_bookmark))
        .route("/v1/posts/:post_id", delete(posts::delete_post))
        .route("/v1/notifications", get(notifications::list_notifications))
        .route(
            "/v1/notifications/unread-count",
            get(notifications::unread_count),
        )
        .route(
            "/v1/notifications/read-all",
            patch(notifications::mark_all_read),
        )
        .route(
            "/v1/notifications/:notification_id/read",
            patch(notifications::mark_read),
        )
        .route(
            "/v1/conversations",
            post(conversations::create_conversation).get(conversations::list_conversations),
        )
        .route(
            "/v1/conversations/:conversation_id",
            get(conversations::get_conversation),
        )
        .route(
            "/v1/conversations/:conversation_id/messages",
            get(conversations::list_messages).post(conversations::send_message),
        )
        .route(
            "/v1/conversations/:conversation_id/read",
            post(conversations::mark_read),
        )
        .route(
            "/v1/conversations/:conversation_id/leave",
            post(conversations::leave),
        )
        .route(
            "/v1/conversations/:conversation_id/settings",
            patch(conversations::update_settings),
        )
        .route("/v1/realtime/messaging", get(realtime::messaging_socket))
        .route(
            "/v1/realtime/notifications",
            get(realtime::notifications_socket),
        )
        .route("/v1/realtime/profile", get(realtime::profile_socket))
        .route_layer(middleware::from_fn(app_middleware::require_auth_middleware));

    let mut app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/users/:user_id", get(social::get_profile))
        .route(
            "/v1/posts",
            get(posts::list_feed).post(posts::create_post),
        )
        .merge(protected)
        .layer(middleware::from_fn(app_middleware::metrics_layer))
        .layer(app_middleware::timeout_layer())
        .layer(app_middleware::trace_layer())
        .layer(app_middleware::set_request_id_layer())
        .layer(app_middleware::propagate_request_id_layer())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            app_middleware::auth_middleware,
        ))
        .layer(middleware::from_fn(
            app_middleware::correlation_id_middleware,
        ));

    if !state.config.is_test() {
        app = app.layer(app_middleware::rate_limit_layer());
    }

    app.with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    environment: String,
    storage: &'static str,
}

async fn health(State(state): State<AppState>) -> Response {
    let storage = state.db.name();
    match state.db.health_check().await {
        Ok(()) => Json(HealthResponse {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
            environment: state.config.app_env.clone(),
            storage,
        })
        .into_response(),
        Err(err) => {
            tracing::warn!(error = %err, storage, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "degraded",
                    version: env!("CARGO_PKG_VERSION"),
                    environment: state.config.app_env.clone(),
                    storage,
                }),
            )
                .into_response()
        }
    }
}

async fn metrics() -> Response {
    match observability::render_metrics() {
        Some(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

pub(crate) fn actor_identity(auth: &AuthContext) -> Result<ActorIdentity, ApiError> {
    let user_id = auth
        .user_id
        .as_ref()
        .filter(|user_id| !user_id.trim().is_empty())
        .ok_or(ApiError::Unauthorized)?;
    Ok(ActorIdentity {
        user_id: user_id.to_string(),
        username: auth
            .username
            .clone()
            .unwrap_or_else(|| user_id.to_string()),
    })
}

pub(crate) fn optional_actor(auth: Option<&AuthContext>) -> Option<ActorIdentity> {
    auth.filter(|auth| auth.is_authenticated)
        .and_then(|auth| actor_identity(auth).ok())
}
