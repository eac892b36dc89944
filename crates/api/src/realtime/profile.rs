use chorus_domain::DomainResult;
use chorus_domain::presence::OutboundEvent;
use chorus_domain::profiles::profile_room;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{ConnectionContext, parse_payload, unknown_event};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoomPayload {
    user_id: String,
}

pub(super) async fn handle(
    ctx: &ConnectionContext,
    event: &str,
    data: Value,
) -> DomainResult<Vec<OutboundEvent>> {
    match event {
        "room:join" => join(ctx, parse_payload(data)?).await,
        "room:leave" => leave(ctx, parse_payload(data)?).await,
        other => Err(unknown_event(other)),
    }
}

/// Watching a profile only needs the profile to exist and be active.
async fn join(ctx: &ConnectionContext, payload: RoomPayload) -> DomainResult<Vec<OutboundEvent>> {
    let profile = ctx.state.profiles.require_active(&payload.user_id).await?;
    let room = profile_room(&profile.user_id);
    ctx.state.presence.join_room(ctx.connection_id, &room).await;
    Ok(vec![OutboundEvent::new("room:joined", json!({ "room": room }))])
}

async fn leave(ctx: &ConnectionContext, payload: RoomPayload) -> DomainResult<Vec<OutboundEvent>> {
    let room = profile_room(&payload.user_id);
    ctx.state.presence.leave_room(ctx.connection_id, &room).await;
    Ok(vec![OutboundEvent::new("room:left", json!({ "room": room }))])
}
