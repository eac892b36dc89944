use chorus_domain::DomainResult;
use chorus_domain::conversations::{SendMessageInput, conversation_room};
use chorus_domain::presence::OutboundEvent;
use serde::Deserialize;
use serde_json::Value;

use super::{ConnectionContext, parse_payload, unknown_event};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessagePayload {
    conversation_id: String,
    body: String,
    #[serde(default)]
    request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationPayload {
    conversation_id: String,
}

pub(super) async fn handle(
    ctx: &ConnectionContext,
    event: &str,
    data: Value,
) -> DomainResult<Vec<OutboundEvent>> {
    match event {
        "send-message" => send_message(ctx, parse_payload(data)?).await,
        "typing" => typing(ctx, parse_payload(data)?, true).await,
        "stop-typing" => typing(ctx, parse_payload(data)?, false).await,
        "join-chat" => join_chat(ctx, parse_payload(data)?).await,
        "leave-chat" => leave_chat(ctx, parse_payload(data)?).await,
        "mark-read" => mark_read(ctx, parse_payload(data)?).await,
        other => Err(unknown_event(other)),
    }
}

/// The sender's own copy arrives as `receive-message` through fanout.
async fn send_message(
    ctx: &ConnectionContext,
    payload: SendMessagePayload,
) -> DomainResult<Vec<OutboundEvent>> {
    ctx.state
        .conversations
        .send_message(
            &ctx.actor,
            SendMessageInput {
                conversation_id: payload.conversation_id,
                body: payload.body,
                request_id: payload.request_id,
            },
        )
        .await?;
    Ok(Vec::new())
}

async fn typing(
    ctx: &ConnectionContext,
    payload: ConversationPayload,
    is_typing: bool,
) -> DomainResult<Vec<OutboundEvent>> {
    ctx.state
        .conversations
        .notify_typing(&ctx.actor, &payload.conversation_id, is_typing)
        .await?;
    Ok(Vec::new())
}

async fn join_chat(
    ctx: &ConnectionContext,
    payload: ConversationPayload,
) -> DomainResult<Vec<OutboundEvent>> {
    ctx.state
        .conversations
        .assert_active_participant(&ctx.actor.user_id, &payload.conversation_id)
        .await?;
    ctx.state
        .presence
        .join_room(ctx.connection_id, &conversation_room(&payload.conversation_id))
        .await;
    Ok(Vec::new())
}

async fn leave_chat(
    ctx: &ConnectionContext,
    payload: ConversationPayload,
) -> DomainResult<Vec<OutboundEvent>> {
    ctx.state
        .presence
        .leave_room(ctx.connection_id, &conversation_room(&payload.conversation_id))
        .await;
    Ok(Vec::new())
}

async fn mark_read(
    ctx: &ConnectionContext,
    payload: ConversationPayload,
) -> DomainResult<Vec<OutboundEvent>> {
    ctx.state
        .conversations
        .mark_read(&ctx.actor, &payload.conversation_id)
        .await?;
    Ok(Vec::new())
}
