mod messaging;
mod notifications;
mod profile;

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Extension, State};
use axum::response::Response;
use chorus_domain::DomainResult;
use chorus_domain::error::DomainError;
use chorus_domain::identity::ActorIdentity;
use chorus_domain::notifications::EVENT_NOTIFICATIONS_INITIAL;
use chorus_domain::ports::realtime::FanoutTarget;
use chorus_domain::presence::{
    Channel, OutboundEvent, PendingConnection, Registration, online_users_event,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::interval;

use crate::error::ApiError;
use crate::middleware::AuthContext;
use crate::observability;
use crate::routes::actor_identity;
use crate::state::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Everything an inbound event handler may touch for one live connection.
#[derive(Clone)]
pub(crate) struct ConnectionContext {
    pub state: AppState,
    pub actor: ActorIdentity,
    pub connection_id: u64,
    pub channel: Channel,
}

#[derive(Debug, Deserialize)]
struct InboundEnvelope {
    event: String,
    #[serde(default)]
    data: Value,
}

pub async fn messaging_socket(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    upgrade(state, auth, ws, Channel::Messaging)
}

pub async fn notifications_socket(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    upgrade(state, auth, ws, Channel::Notifications)
}

pub async fn profile_socket(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    upgrade(state, auth, ws, Channel::Realtime)
}

fn upgrade(
    state: AppState,
    auth: AuthContext,
    ws: WebSocketUpgrade,
    channel: Channel,
) -> Result<Response, ApiError> {
    let actor = actor_identity(&auth)?;
    Ok(ws.on_upgrade(move |socket| async move {
        run_session(socket, state, actor, channel).await;
    }))
}

async fn run_session(socket: WebSocket, state: AppState, actor: ActorIdentity, channel: Channel) {
    let (mut sender, mut incoming) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundEvent>();

    let registration = match state
        .presence
        .register(
            PendingConnection::new(channel, Some(actor.user_id.clone())),
            outbound_tx,
        )
        .await
    {
        Ok(registration) => registration,
        Err(err) => {
            observability::register_realtime_connection(channel.as_str(), "rejected");
            let _ = sender
                .send(Message::Text(encode(&OutboundEvent::error(err.to_string()))))
                .await;
            let _ = sender
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: "registration failed".into(),
                })))
                .await;
            return;
        }
    };
    observability::register_realtime_connection(channel.as_str(), "accepted");
    observability::set_realtime_active_connections(state.presence.connection_count().await);
    tracing::debug!(
        user_id = %registration.user_id,
        connection_id = registration.connection_id,
        channel = channel.as_str(),
        "realtime connection registered"
    );

    let ctx = ConnectionContext {
        state: state.clone(),
        actor,
        connection_id: registration.connection_id,
        channel,
    };

    for event in on_connect(&ctx, &registration).await {
        if sender.send(Message::Text(encode(&event))).await.is_err() {
            on_disconnect(&state, &registration).await;
            return;
        }
    }

    let mut heartbeat = interval(HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                let Some(event) = outbound else {
                    break;
                };
                if sender.send(Message::Text(encode(&event))).await.is_err() {
                    break;
                }
            }
            frame = incoming.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let mut closed = false;
                        for reply in dispatch(&ctx, &text).await {
                            if sender.send(Message::Text(encode(&reply))).await.is_err() {
                                closed = true;
                                break;
                            }
                        }
                        if closed {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    on_disconnect(&state, &registration).await;
}

/// Side effects of a fresh registration. Returns the events meant only for
/// the new connection.
pub(crate) async fn on_connect(
    ctx: &ConnectionContext,
    registration: &Registration,
) -> Vec<OutboundEvent> {
    let state = &ctx.state;
    if registration.first_on_any_channel {
        if let Err(err) = state.profiles.mark_online(&registration.user_id).await {
            tracing::warn!(error = %err, user_id = %registration.user_id, "failed to persist online flag");
        }
    }

    let mut replies = Vec::new();
    match ctx.channel {
        Channel::Messaging => {
            let event = online_users_event(state.presence.online_users(Channel::Messaging).await);
            if registration.first_for_user {
                state
                    .fanout
                    .emit(Channel::Messaging, FanoutTarget::Channel, event)
                    .await;
            } else {
                replies.push(event);
            }
        }
        Channel::Notifications => {
            match state.notifications.initial_snapshot(&registration.user_id).await {
                Ok(snapshot) => match serde_json::to_value(&snapshot) {
                    Ok(data) => replies.push(OutboundEvent::new(EVENT_NOTIFICATIONS_INITIAL, data)),
                    Err(err) => replies.push(OutboundEvent::error(err.to_string())),
                },
                Err(err) => replies.push(error_event(&err)),
            }
        }
        Channel::Realtime => {}
    }
    replies
}

pub(crate) async fn on_disconnect(state: &AppState, registration: &Registration) {
    let disconnection = state.presence.unregister(registration).await;
    if !disconnection.removed {
        return;
    }
    observability::set_realtime_active_connections(state.presence.connection_count().await);

    if registration.channel == Channel::Messaging && disconnection.last_for_user {
        let event = online_users_event(state.presence.online_users(Channel::Messaging).await);
        state
            .fanout
            .emit(Channel::Messaging, FanoutTarget::Channel, event)
            .await;
    }
    if disconnection.last_on_any_channel {
        if let Err(err) = state.profiles.mark_offline(&registration.user_id).await {
            tracing::warn!(error = %err, user_id = %registration.user_id, "failed to persist offline flag");
        }
    }
    tracing::debug!(
        user_id = %registration.user_id,
        connection_id = registration.connection_id,
        channel = registration.channel.as_str(),
        "realtime connection closed"
    );
}

/// Routes one inbound text frame to the channel's handlers. Failures come
/// back as a single `error` event; the connection stays open.
pub(crate) async fn dispatch(ctx: &ConnectionContext, text: &str) -> Vec<OutboundEvent> {
    let envelope: InboundEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(_) => {
            observability::register_realtime_event(ctx.channel.as_str(), "invalid", "error");
            return vec![OutboundEvent::error("malformed event envelope")];
        }
    };

    let result = match ctx.channel {
        Channel::Messaging => messaging::handle(ctx, &envelope.event, envelope.data).await,
        Channel::Notifications => notifications::handle(ctx, &envelope.event, envelope.data).await,
        Channel::Realtime => profile::handle(ctx, &envelope.event, envelope.data).await,
    };

    match result {
        Ok(replies) => {
            observability::register_realtime_event(ctx.channel.as_str(), &envelope.event, "ok");
            replies
        }
        Err(err) => {
            observability::register_realtime_event(ctx.channel.as_str(), &envelope.event, "error");
            vec![error_event(&err)]
        }
    }
}

fn parse_payload<T: DeserializeOwned>(data: Value) -> DomainResult<T> {
    serde_json::from_value(data)
        .map_err(|err| DomainError::Validation(format!("invalid event payload: {err}")))
}

fn unknown_event(event: &str) -> DomainError {
    DomainError::Validation(format!("unknown event: {event}"))
}

fn error_event(err: &DomainError) -> OutboundEvent {
    match err {
        DomainError::Storage(message) => {
            tracing::error!(error = %message, "realtime handler storage failure");
            OutboundEvent::error("internal error")
        }
        other => OutboundEvent::error(other.to_string()),
    }
}

fn encode(event: &OutboundEvent) -> String {
    serde_json::to_string(event).unwrap_or_else(|_| {
        "{\"event\":\"error\",\"data\":{\"message\":\"encoding failed\"}}".to_string()
    })
}
