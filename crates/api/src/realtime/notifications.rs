use chorus_domain::DomainResult;
use chorus_domain::error::DomainError;
use chorus_domain::notifications::{EVENT_NOTIFICATIONS_INITIAL, NotificationListQuery};
use chorus_domain::presence::OutboundEvent;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{ConnectionContext, parse_payload, unknown_event};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetNotificationsPayload {
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    include_read: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarkReadPayload {
    notification_id: String,
}

pub(super) async fn handle(
    ctx: &ConnectionContext,
    event: &str,
    data: Value,
) -> DomainResult<Vec<OutboundEvent>> {
    match event {
        "get-notifications" => {
            let payload = if data.is_null() {
                GetNotificationsPayload::default()
            } else {
                parse_payload(data)?
            };
            get_notifications(ctx, payload).await
        }
        "mark-notification-read" => mark_read(ctx, parse_payload(data)?).await,
        "mark-all-read" => mark_all_read(ctx).await,
        other => Err(unknown_event(other)),
    }
}

async fn get_notifications(
    ctx: &ConnectionContext,
    payload: GetNotificationsPayload,
) -> DomainResult<Vec<OutboundEvent>> {
    let notifications = &ctx.state.notifications;
    let page = notifications
        .list(NotificationListQuery {
            recipient_id: ctx.actor.user_id.clone(),
            cursor: payload.cursor,
            limit: payload.limit,
            include_read: payload.include_read,
        })
        .await?;
    let unread_count = notifications.unread_count(&ctx.actor.user_id).await?;
    let items =
        serde_json::to_value(&page.items).map_err(|err| DomainError::Storage(err.to_string()))?;
    Ok(vec![OutboundEvent::new(
        EVENT_NOTIFICATIONS_INITIAL,
        json!({
            "notifications": items,
            "unreadCount": unread_count,
            "nextCursor": page.next_cursor,
        }),
    )])
}

/// `unread-count` is pushed by the service when anything changed.
async fn mark_read(
    ctx: &ConnectionContext,
    payload: MarkReadPayload,
) -> DomainResult<Vec<OutboundEvent>> {
    ctx.state
        .notifications
        .mark_read(&ctx.actor.user_id, &payload.notification_id)
        .await?;
    Ok(Vec::new())
}

async fn mark_all_read(ctx: &ConnectionContext) -> DomainResult<Vec<OutboundEvent>> {
    ctx.state
        .notifications
        .mark_all_read(&ctx.actor.user_id)
        .await?;
    Ok(Vec::new())
}
