use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use chorus_domain::identity::ActorIdentity;
use chorus_domain::presence::{Channel, OutboundEvent, PendingConnection};
use chorus_infra::config::AppConfig;
use jsonwebtoken::{EncodingKey, Header, encode};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tower_util::ServiceExt;

use crate::realtime::{self, ConnectionContext};
use crate::routes;
use crate::state::AppState;

const SECRET: &str = "test-secret";

#[derive(Serialize)]
struct Claims {
    sub: String,
    username: String,
    exp: usize,
}

fn test_token(user_id: &str) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time")
        .as_secs();
    let claims = Claims {
        sub: user_id.to_string(),
        username: format!("{user_id}_name"),
        exp: (now + 3600) as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .expect("token")
}

fn test_app_state_router() -> (AppState, Router) {
    let state = AppState::in_memory(AppConfig::for_tests());
    let app = routes::router(state.clone());
    (state, app)
}

fn actor(user_id: &str) -> ActorIdentity {
    ActorIdentity {
        user_id: user_id.to_string(),
        username: format!("{user_id}_name"),
    }
}

async fn call(
    app: &Router,
    method: &str,
    uri: &str,
    user_id: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user_id) = user_id {
        builder = builder.header("authorization", format!("Bearer {}", test_token(user_id)));
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    };
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}

async fn register(app: &Router, user_id: &str, username: &str, is_private: bool) {
    let (status, body) = call(
        app,
        "PUT",
        "/v1/users/me",
        Some(user_id),
        Some(json!({ "username": username, "isPrivate": is_private })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "register {user_id}: {body}");
}

async fn create_post(app: &Router, user_id: &str, body: &str) -> String {
    let (status, post) = call(
        app,
        "POST",
        "/v1/posts",
        Some(user_id),
        Some(json!({ "body": body })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{post}");
    post["postId"].as_str().expect("post id").to_string()
}

async fn connect(
    state: &AppState,
    user_id: &str,
    channel: Channel,
) -> (
    ConnectionContext,
    chorus_domain::presence::Registration,
    mpsc::UnboundedReceiver<OutboundEvent>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let registration = state
        .presence
        .register(PendingConnection::new(channel, Some(user_id.to_string())), tx)
        .await
        .expect("registration");
    let ctx = ConnectionContext {
        state: state.clone(),
        actor: actor(user_id),
        connection_id: registration.connection_id,
        channel,
    };
    (ctx, registration, rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<OutboundEvent>) -> Vec<OutboundEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn health_reports_memory_storage() {
    let (_, app) = test_app_state_router();
    let (status, body) = call(&app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["storage"], "memory");
    assert_eq!(body["environment"], "test");
}

#[tokio::test]
async fn protected_routes_reject_missing_or_bad_tokens() {
    let (_, app) = test_app_state_router();

    let (status, body) = call(&app, "GET", "/v1/notifications", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "unauthorized");

    let request = Request::builder()
        .method("GET")
        .uri("/v1/notifications/unread-count")
        .header("authorization", "Bearer not-a-jwt")
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let (status, _) = call(&app, "GET", "/v1/realtime/messaging", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = call(
        &app,
        "POST",
        "/v1/posts",
        None,
        Some(json!({ "body": "anonymous" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "unauthorized");
}

#[tokio::test]
async fn token_in_query_string_authenticates() {
    let (_, app) = test_app_state_router();
    register(&app, "alice", "alice", false).await;
    let uri = format!("/v1/notifications/unread-count?token={}", test_token("alice"));
    let (status, body) = call(&app, "GET", &uri, None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 0);
}

#[tokio::test]
async fn profile_registration_normalizes_and_is_publicly_readable() {
    let (_, app) = test_app_state_router();
    let (status, profile) = call(
        &app,
        "PUT",
        "/v1/users/me",
        Some("alice"),
        Some(json!({ "username": "@Alice_01", "bio": "hello" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(profile["username"], "alice_01");
    assert_eq!(profile["displayName"], "alice_01");
    assert_eq!(profile["followersCount"], 0);

    let (status, view) = call(&app, "GET", "/v1/users/alice", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["userId"], "alice");
    assert_eq!(view["isFollowing"], false);

    let (status, body) = call(
        &app,
        "PUT",
        "/v1/users/me",
        Some("bob"),
        Some(json!({ "username": "ab" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");

    let (status, body) = call(&app, "GET", "/v1/users/nobody", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn follow_toggle_updates_counters_and_unread_count() {
    let (_, app) = test_app_state_router();
    register(&app, "alice", "alice", false).await;
    register(&app, "bob", "bob", false).await;

    let (status, toggle) = call(&app, "POST", "/v1/follows/alice/follow", Some("bob"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(toggle["state"], "following");
    assert_eq!(toggle["isFollowing"], true);
    assert_eq!(toggle["follower"]["followingCount"], 1);
    assert_eq!(toggle["following"]["followersCount"], 1);

    let (_, view) = call(&app, "GET", "/v1/users/alice", Some("bob"), None).await;
    assert_eq!(view["followersCount"], 1);
    assert_eq!(view["isFollowing"], true);

    let (_, count) = call(
        &app,
        "GET",
        "/v1/notifications/unread-count",
        Some("alice"),
        None,
    )
    .await;
    assert_eq!(count["count"], 1);

    let (status, toggle) = call(&app, "POST", "/v1/follows/alice/follow", Some("bob"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(toggle["state"], "not_following");
    assert_eq!(toggle["following"]["followersCount"], 0);

    let (_, count) = call(
        &app,
        "GET",
        "/v1/notifications/unread-count",
        Some("alice"),
        None,
    )
    .await;
    assert_eq!(count["count"], 0);

    let (status, body) = call(&app, "POST", "/v1/follows/bob/follow", Some("bob"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");
}

#[tokio::test]
async fn private_profile_follow_goes_through_request() {
    let (_, app) = test_app_state_router();
    register(&app, "alice", "alice", true).await;
    register(&app, "bob", "bob", false).await;

    let (_, toggle) = call(&app, "POST", "/v1/follows/alice/follow", Some("bob"), None).await;
    assert_eq!(toggle["state"], "requested");
    assert_eq!(toggle["following"]["followersCount"], 0);

    let (status, _) = call(
        &app,
        "POST",
        "/v1/follows/bob/requests/accept",
        Some("alice"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, view) = call(&app, "GET", "/v1/users/alice", Some("bob"), None).await;
    assert_eq!(view["followersCount"], 1);
    assert_eq!(view["isFollowing"], true);
    assert_eq!(view["followRequested"], false);

    let (status, _) = call(
        &app,
        "POST",
        "/v1/follows/bob/requests/decline",
        Some("alice"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn block_forbids_follow_and_hides_profile() {
    let (_, app) = test_app_state_router();
    register(&app, "alice", "alice", false).await;
    register(&app, "bob", "bob", false).await;

    let (status, block) = call(&app, "POST", "/v1/blocks/bob", Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(block["blocked"], true);

    let (status, body) = call(&app, "POST", "/v1/follows/alice/follow", Some("bob"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "forbidden");

    let (status, _) = call(&app, "GET", "/v1/users/alice", Some("bob"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, block) = call(&app, "POST", "/v1/blocks/bob", Some("alice"), None).await;
    assert_eq!(block["blocked"], false);
    let (status, _) = call(&app, "POST", "/v1/follows/alice/follow", Some("bob"), None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn like_toggle_flips_and_feed_reports_flags() {
    let (_, app) = test_app_state_router();
    register(&app, "alice", "alice", false).await;
    register(&app, "bob", "bob", false).await;
    let post_id = create_post(&app, "alice", "first light").await;

    let (status, like) = call(
        &app,
        "POST",
        "/v1/likes/like-toggle",
        Some("bob"),
        Some(json!({ "postId": post_id })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(like["liked"], true);
    assert_eq!(like["likeCount"], 1);

    let (_, feed) = call(&app, "GET", "/v1/posts", Some("bob"), None).await;
    assert_eq!(feed["posts"][0]["postId"], post_id.as_str());
    assert_eq!(feed["posts"][0]["isLiked"], true);
    assert_eq!(feed["posts"][0]["likeCount"], 1);

    let (_, notifications) = call(&app, "GET", "/v1/notifications", Some("alice"), None).await;
    assert_eq!(notifications["items"][0]["type"], "LIKE");

    let (_, like) = call(
        &app,
        "POST",
        "/v1/likes/like-toggle",
        Some("bob"),
        Some(json!({ "postId": post_id })),
    )
    .await;
    assert_eq!(like["liked"], false);
    assert_eq!(like["likeCount"], 0);

    let (_, anonymous) = call(&app, "GET", "/v1/posts", None, None).await;
    assert_eq!(anonymous["posts"][0]["isLiked"], false);

    let (status, _) = call(
        &app,
        "POST",
        "/v1/likes/like-toggle",
        Some("bob"),
        Some(json!({ "postId": "missing" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn feed_pages_follow_the_cursor() {
    let (_, app) = test_app_state_router();
    register(&app, "alice", "alice", false).await;
    let mut ids = Vec::new();
    for body in ["one", "two", "three"] {
        ids.push(create_post(&app, "alice", body).await);
        tokio::time::sleep(Duration::from_millis(3)).await;
    }

    let (status, first) = call(&app, "GET", "/v1/posts?limit=2", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["posts"].as_array().map(Vec::len), Some(2));
    assert_eq!(first["posts"][0]["postId"], ids[2].as_str());
    assert_eq!(first["pagination"]["hasMore"], true);
    let cursor = first["pagination"]["nextCursor"]
        .as_str()
        .expect("cursor")
        .to_string();

    let (_, second) = call(
        &app,
        "GET",
        &format!("/v1/posts?limit=2&cursor={cursor}"),
        None,
        None,
    )
    .await;
    assert_eq!(second["posts"].as_array().map(Vec::len), Some(1));
    assert_eq!(second["posts"][0]["postId"], ids[0].as_str());
    assert_eq!(second["pagination"]["hasMore"], false);

    let (status, body) = call(&app, "GET", "/v1/posts?filter=trending", None, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");
}

#[tokio::test]
async fn deleting_a_post_is_author_only() {
    let (_, app) = test_app_state_router();
    register(&app, "alice", "alice", false).await;
    register(&app, "bob", "bob", false).await;
    let post_id = create_post(&app, "alice", "mine").await;

    let uri = format!("/v1/posts/{post_id}");
    let (status, _) = call(&app, "DELETE", &uri, Some("bob"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = call(&app, "DELETE", &uri, Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);

    let (_, feed) = call(&app, "GET", "/v1/posts", None, None).await;
    assert_eq!(feed["posts"].as_array().map(Vec::len), Some(0));
}

#[tokio::test]
async fn notifications_mark_read_and_read_all() {
    let (_, app) = test_app_state_router();
    register(&app, "alice", "alice", false).await;
    register(&app, "bob", "bob", false).await;
    register(&app, "carol", "carol", false).await;
    call(&app, "POST", "/v1/follows/alice/follow", Some("bob"), None).await;
    call(&app, "POST", "/v1/follows/alice/follow", Some("carol"), None).await;

    let (status, page) = call(&app, "GET", "/v1/notifications", Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    let items = page["items"].as_array().expect("items");
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|item| item["type"] == "FOLLOW"));

    let notification_id = items[0]["notificationId"]
        .as_str()
        .expect("id")
        .to_string();
    let (status, body) = call(
        &app,
        "PATCH",
        &format!("/v1/notifications/{notification_id}/read"),
        Some("alice"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["updated"], true);

    let (status, body) = call(
        &app,
        "PATCH",
        &format!("/v1/notifications/{notification_id}/read"),
        Some("bob"),
        None,
    )
    .await;
    assert!(status == StatusCode::OK || status == StatusCode::NOT_FOUND);
    if status == StatusCode::OK {
        assert_eq!(body["updated"], false);
    }

    let (_, body) = call(&app, "PATCH", "/v1/notifications/read-all", Some("alice"), None).await;
    assert_eq!(body["updated"], 1);
    let (_, count) = call(
        &app,
        "GET",
        "/v1/notifications/unread-count",
        Some("alice"),
        None,
    )
    .await;
    assert_eq!(count["count"], 0);

    let (_, unread_only) = call(
        &app,
        "GET",
        "/v1/notifications?includeRead=false",
        Some("alice"),
        None,
    )
    .await;
    assert_eq!(unread_only["items"].as_array().map(Vec::len), Some(0));
}

#[tokio::test]
async fn direct_conversation_flow_over_http() {
    let (_, app) = test_app_state_router();
    register(&app, "alice", "alice", false).await;
    register(&app, "bob", "bob", false).await;
    register(&app, "carol", "carol", false).await;

    let (status, conversation) = call(
        &app,
        "POST",
        "/v1/conversations",
        Some("alice"),
        Some(json!({ "kind": "direct", "participantIds": ["bob"] })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{conversation}");
    let conversation_id = conversation["conversationId"]
        .as_str()
        .expect("conversation id")
        .to_string();

    let (_, again) = call(
        &app,
        "POST",
        "/v1/conversations",
        Some("bob"),
        Some(json!({ "kind": "direct", "participantIds": ["alice"] })),
    )
    .await;
    assert_eq!(again["conversationId"], conversation_id.as_str());

    let messages_uri = format!("/v1/conversations/{conversation_id}/messages");
    let (status, message) = call(
        &app,
        "POST",
        &messages_uri,
        Some("alice"),
        Some(json!({ "body": "hi bob", "requestId": "req-1" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let (_, replay) = call(
        &app,
        "POST",
        &messages_uri,
        Some("alice"),
        Some(json!({ "body": "hi bob", "requestId": "req-1" })),
    )
    .await;
    assert_eq!(replay["messageId"], message["messageId"]);

    let (_, summaries) = call(&app, "GET", "/v1/conversations", Some("bob"), None).await;
    assert_eq!(summaries[0]["conversationId"], conversation_id.as_str());
    assert_eq!(summaries[0]["participant"]["unreadCount"], 1);

    let (status, messages) = call(&app, "GET", &messages_uri, Some("bob"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(messages.as_array().map(Vec::len), Some(1));

    let (status, body) = call(&app, "GET", &messages_uri, Some("carol"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "forbidden");

    let (status, participant) = call(
        &app,
        "POST",
        &format!("/v1/conversations/{conversation_id}/read"),
        Some("bob"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(participant["unreadCount"], 0);
}

#[tokio::test]
async fn notifications_socket_handles_inbound_events() {
    let (state, app) = test_app_state_router();
    register(&app, "alice", "alice", false).await;
    register(&app, "bob", "bob", false).await;
    call(&app, "POST", "/v1/follows/alice/follow", Some("bob"), None).await;

    let (ctx, registration, mut rx) = connect(&state, "alice", Channel::Notifications).await;
    let initial = realtime::on_connect(&ctx, &registration).await;
    assert_eq!(initial.len(), 1);
    assert_eq!(initial[0].event, "notifications:initial");
    assert_eq!(initial[0].data["unreadCount"], 1);

    let replies = realtime::dispatch(&ctx, r#"{"event":"get-notifications","data":{"limit":5}}"#).await;
    assert_eq!(replies[0].event, "notifications:initial");
    let notification_id = replies[0].data["notifications"][0]["notificationId"]
        .as_str()
        .expect("id")
        .to_string();

    let text = json!({
        "event": "mark-notification-read",
        "data": { "notificationId": notification_id }
    })
    .to_string();
    assert!(realtime::dispatch(&ctx, &text).await.is_empty());
    let pushed = drain(&mut rx);
    assert_eq!(pushed.last().map(|event| event.event.as_str()), Some("unread-count"));
    assert_eq!(pushed.last().map(|event| event.data["count"].clone()), Some(json!(0)));

    let replies = realtime::dispatch(&ctx, r#"{"event":"unknown-thing"}"#).await;
    assert_eq!(replies[0].event, "error");
    let replies = realtime::dispatch(&ctx, "not json").await;
    assert_eq!(replies[0].event, "error");

    realtime::on_disconnect(&state, &registration).await;
    assert!(!state.presence.is_online("alice").await);
}

#[tokio::test]
async fn messaging_socket_tracks_presence_and_rooms() {
    let (state, app) = test_app_state_router();
    register(&app, "alice", "alice", false).await;
    register(&app, "bob", "bob", false).await;
    register(&app, "carol", "carol", false).await;
    let (_, conversation) = call(
        &app,
        "POST",
        "/v1/conversations",
        Some("alice"),
        Some(json!({ "kind": "direct", "participantIds": ["bob"] })),
    )
    .await;
    let conversation_id = conversation["conversationId"]
        .as_str()
        .expect("id")
        .to_string();

    let (alice, alice_registration, mut alice_rx) = connect(&state, "alice", Channel::Messaging).await;
    assert!(realtime::on_connect(&alice, &alice_registration).await.is_empty());
    let events = drain(&mut alice_rx);
    assert_eq!(events[0].event, "online-users");
    assert_eq!(events[0].data["userIds"], json!(["alice"]));

    let (_, view) = call(&app, "GET", "/v1/users/alice", None, None).await;
    assert_eq!(view["isOnline"], true);

    let (bob, bob_registration, mut bob_rx) = connect(&state, "bob", Channel::Messaging).await;
    realtime::on_connect(&bob, &bob_registration).await;
    let events = drain(&mut alice_rx);
    assert_eq!(events[0].data["userIds"], json!(["alice", "bob"]));
    drain(&mut bob_rx);

    let join = json!({ "event": "join-chat", "data": { "conversationId": conversation_id } }).to_string();
    assert!(realtime::dispatch(&alice, &join).await.is_empty());
    assert!(realtime::dispatch(&bob, &join).await.is_empty());

    let typing = json!({ "event": "typing", "data": { "conversationId": conversation_id } }).to_string();
    realtime::dispatch(&alice, &typing).await;
    let events = drain(&mut bob_rx);
    assert_eq!(events[0].event, "user-typing");
    assert!(drain(&mut alice_rx).is_empty());

    let send = json!({
        "event": "send-message",
        "data": { "conversationId": conversation_id, "body": "ping", "requestId": "ws-1" }
    })
    .to_string();
    realtime::dispatch(&alice, &send).await;
    assert_eq!(drain(&mut bob_rx)[0].event, "receive-message");
    assert_eq!(drain(&mut alice_rx)[0].event, "receive-message");

    let (carol, carol_registration, _carol_rx) = connect(&state, "carol", Channel::Messaging).await;
    let replies = realtime::dispatch(&carol, &join).await;
    assert_eq!(replies[0].event, "error");

    realtime::on_disconnect(&state, &carol_registration).await;
    realtime::on_disconnect(&state, &bob_registration).await;
    let events = drain(&mut alice_rx);
    let last = events.last().expect("online-users after bob left");
    assert_eq!(last.event, "online-users");
    assert_eq!(last.data["userIds"], json!(["alice"]));
    let (_, view) = call(&app, "GET", "/v1/users/bob", None, None).await;
    assert_eq!(view["isOnline"], false);
}

#[tokio::test]
async fn profile_socket_streams_profile_updates() {
    let (state, app) = test_app_state_router();
    register(&app, "alice", "alice", false).await;
    register(&app, "bob", "bob", false).await;

    let (ctx, _registration, mut rx) = connect(&state, "bob", Channel::Realtime).await;
    let replies = realtime::dispatch(&ctx, r#"{"event":"room:join","data":{"userId":"alice"}}"#).await;
    assert_eq!(replies[0].event, "room:joined");
    assert_eq!(replies[0].data["room"], "profile:alice");

    let (status, _) = call(
        &app,
        "PATCH",
        "/v1/users/me",
        Some("alice"),
        Some(json!({ "bio": "new bio" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let events = drain(&mut rx);
    assert_eq!(events[0].event, "profile.updated");
    assert_eq!(events[0].data["bio"], "new bio");

    let replies = realtime::dispatch(&ctx, r#"{"event":"room:leave","data":{"userId":"alice"}}"#).await;
    assert_eq!(replies[0].event, "room:left");
    call(
        &app,
        "PATCH",
        "/v1/users/me",
        Some("alice"),
        Some(json!({ "bio": "again" })),
    )
    .await;
    assert!(drain(&mut rx).is_empty());

    let replies = realtime::dispatch(&ctx, r#"{"event":"room:join","data":{"userId":"ghost"}}"#).await;
    assert_eq!(replies[0].event, "error");
}
