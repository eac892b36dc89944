use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::DomainResult;
use crate::error::DomainError;
use crate::ports::notifications::{NotificationRepository, NotificationRepositoryListQuery};
use crate::ports::realtime::FanoutGateway;
use crate::presence::{Channel, OutboundEvent};
use crate::util::now_ms;

pub const DEFAULT_DEDUPE_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;
const DEFAULT_LIMIT: usize = 20;
const MAX_LIMIT: usize = 50;

pub const EVENT_NEW_NOTIFICATION: &str = "new-notification";
pub const EVENT_UNREAD_COUNT: &str = "unread-count";
pub const EVENT_NOTIFICATIONS_INITIAL: &str = "notifications:initial";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    Like,
    Repost,
    Follow,
    FollowRequest,
    Comment,
    Mention,
}

impl NotificationType {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationType::Like => "LIKE",
            NotificationType::Repost => "REPOST",
            NotificationType::Follow => "FOLLOW",
            NotificationType::FollowRequest => "FOLLOW_REQUEST",
            NotificationType::Comment => "COMMENT",
            NotificationType::Mention => "MENTION",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "LIKE" => Some(NotificationType::Like),
            "REPOST" => Some(NotificationType::Repost),
            "FOLLOW" => Some(NotificationType::Follow),
            "FOLLOW_REQUEST" => Some(NotificationType::FollowRequest),
            "COMMENT" => Some(NotificationType::Comment),
            "MENTION" => Some(NotificationType::Mention),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub notification_id: String,
    pub recipient_id: String,
    pub actor_id: String,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub post_id: Option<String>,
    pub is_read: bool,
    pub created_at_ms: i64,
    pub read_at_ms: Option<i64>,
    pub dedupe_key: String,
}

/// The `(recipient, actor, type, post)` tuple that identifies "the same"
/// notification for dedup and toggle-off cleanup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotificationKey {
    pub recipient_id: String,
    pub actor_id: String,
    pub notification_type: NotificationType,
    pub post_id: Option<String>,
}

impl NotificationKey {
    pub fn new(
        recipient_id: impl Into<String>,
        actor_id: impl Into<String>,
        notification_type: NotificationType,
        post_id: Option<String>,
    ) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            actor_id: actor_id.into(),
            notification_type,
            post_id,
        }
    }

    /// Each part is length-prefixed, so ids containing the separator cannot
    /// make two different tuples collide.
    pub fn dedupe_key(&self) -> String {
        let post = match self.post_id.as_deref() {
            Some(post_id) => format!("{}:{post_id}", post_id.len()),
            None => "-".to_string(),
        };
        format!(
            "{}:{}|{}:{}|{}|{post}",
            self.recipient_id.len(),
            self.recipient_id,
            self.actor_id.len(),
            self.actor_id,
            self.notification_type.as_str(),
        )
    }

    pub fn is_self_directed(&self) -> bool {
        self.recipient_id == self.actor_id
    }
}

#[derive(Clone, Debug)]
pub struct NotificationCreate {
    pub key: NotificationKey,
    pub request_ts_ms: Option<i64>,
}

impl NotificationCreate {
    pub fn new(key: NotificationKey) -> Self {
        Self {
            key,
            request_ts_ms: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DedupeOutcome {
    Created(Notification),
    Existing(Notification),
}

impl DedupeOutcome {
    pub fn is_created(&self) -> bool {
        matches!(self, DedupeOutcome::Created(_))
    }

    pub fn into_notification(self) -> Notification {
        match self {
            DedupeOutcome::Created(notification) | DedupeOutcome::Existing(notification) => {
                notification
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct NotificationListQuery {
    pub recipient_id: String,
    pub cursor: Option<String>,
    pub limit: Option<usize>,
    pub include_read: Option<bool>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PagedNotifications {
    pub items: Vec<Notification>,
    pub next_cursor: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationSnapshot {
    pub notifications: Vec<Notification>,
    pub unread_count: usize,
}

#[derive(Clone)]
pub struct NotificationService {
    repository: Arc<dyn NotificationRepository>,
    fanout: Arc<dyn FanoutGateway>,
    dedupe_window_ms: i64,
}

impl NotificationService {
    pub fn new(repository: Arc<dyn NotificationRepository>, fanout: Arc<dyn FanoutGateway>) -> Self {
        Self {
            repository,
            fanout,
            dedupe_window_ms: DEFAULT_DEDUPE_WINDOW_MS,
        }
    }

    pub fn with_dedupe_window_ms(mut self, dedupe_window_ms: i64) -> Self {
        self.dedupe_window_ms = dedupe_window_ms.max(0);
        self
    }

    /// Creates the notification unless an identical one exists inside the
    /// dedup window. Self-directed notifications are dropped. Only a freshly
    /// created row is pushed to the recipient.
    pub async fn create(&self, input: NotificationCreate) -> DomainResult<Option<Notification>> {
        validate_key(&input.key)?;
        if input.key.is_self_directed() {
            return Ok(None);
        }

        let created_at_ms = input.request_ts_ms.unwrap_or_else(now_ms);
        let notification = Notification {
            notification_id: crate::util::uuid_v7_without_dashes(),
            recipient_id: input.key.recipient_id.clone(),
            actor_id: input.key.actor_id.clone(),
            notification_type: input.key.notification_type,
            post_id: input.key.post_id.clone(),
            is_read: false,
            created_at_ms,
            read_at_ms: None,
            dedupe_key: input.key.dedupe_key(),
        };

        let window_start_ms = created_at_ms.saturating_sub(self.dedupe_window_ms);
        let outcome = self
            .repository
            .create_deduplicated(&notification, window_start_ms)
            .await?;

        let notification = match outcome {
            DedupeOutcome::Created(notification) => notification,
            DedupeOutcome::Existing(existing) => return Ok(Some(existing)),
        };

        let payload = serde_json::to_value(&notification)
            .map_err(|err| DomainError::Storage(err.to_string()))?;
        self.fanout
            .emit_to_user(
                Channel::Notifications,
                &notification.recipient_id,
                OutboundEvent::new(EVENT_NEW_NOTIFICATION, payload),
            )
            .await;
        self.push_unread_count(&notification.recipient_id).await?;
        Ok(Some(notification))
    }

    /// Deletes every row for the tuple. Used when a toggle is switched off.
    pub async fn remove_for(&self, key: &NotificationKey) -> DomainResult<usize> {
        validate_key(key)?;
        if key.is_self_directed() {
            return Ok(0);
        }
        let removed = self.repository.delete_matching(key).await?;
        if removed > 0 {
            self.push_unread_count(&key.recipient_id).await?;
        }
        Ok(removed)
    }

    /// Unknown ids and rows owned by someone else are a silent no-op.
    pub async fn mark_read(&self, recipient_id: &str, notification_id: &str) -> DomainResult<bool> {
        validate_recipient(recipient_id)?;
        let changed = self
            .repository
            .mark_read(recipient_id, notification_id, now_ms())
            .await?;
        if changed {
            self.push_unread_count(recipient_id).await?;
        }
        Ok(changed)
    }

    pub async fn mark_all_read(&self, recipient_id: &str) -> DomainResult<usize> {
        validate_recipient(recipient_id)?;
        let changed = self.repository.mark_all_read(recipient_id, now_ms()).await?;
        if changed > 0 {
            self.push_unread_count(recipient_id).await?;
        }
        Ok(changed)
    }

    pub async fn unread_count(&self, recipient_id: &str) -> DomainResult<usize> {
        validate_recipient(recipient_id)?;
        self.repository.unread_count(recipient_id).await
    }

    pub async fn list(&self, query: NotificationListQuery) -> DomainResult<PagedNotifications> {
        validate_recipient(&query.recipient_id)?;
        let limit = normalize_limit(query.limit)?;
        let (cursor_created_at_ms, cursor_notification_id) =
            parse_notification_cursor(query.cursor.as_deref())?;

        let mut items = self
            .repository
            .list_notifications(&NotificationRepositoryListQuery {
                recipient_id: query.recipient_id,
                cursor_created_at_ms,
                cursor_notification_id,
                limit: limit + 1,
                include_read: query.include_read.unwrap_or(true),
            })
            .await?;

        let has_more = items.len() > limit;
        items.truncate(limit);
        let next_cursor = items
            .last()
            .filter(|_| has_more)
            .map(|item| make_notification_cursor(item.created_at_ms, &item.notification_id));
        Ok(PagedNotifications { items, next_cursor })
    }

    /// Latest page plus unread count, sent as `notifications:initial` when a
    /// client connects.
    pub async fn initial_snapshot(&self, recipient_id: &str) -> DomainResult<NotificationSnapshot> {
        let page = self
            .list(NotificationListQuery {
                recipient_id: recipient_id.to_string(),
                cursor: None,
                limit: None,
                include_read: Some(true),
            })
            .await?;
        let unread_count = self.unread_count(recipient_id).await?;
        Ok(NotificationSnapshot {
            notifications: page.items,
            unread_count,
        })
    }

    async fn push_unread_count(&self, recipient_id: &str) -> DomainResult<()> {
        let count = self.repository.unread_count(recipient_id).await?;
        self.fanout
            .emit_to_user(
                Channel::Notifications,
                recipient_id,
                unread_count_event(count),
            )
            .await;
        Ok(())
    }
}

pub fn unread_count_event(count: usize) -> OutboundEvent {
    OutboundEvent::new(EVENT_UNREAD_COUNT, json!({ "count": count }))
}

fn validate_recipient(recipient_id: &str) -> DomainResult<()> {
    if recipient_id.trim().is_empty() {
        return Err(DomainError::Validation("recipient_id is required".into()));
    }
    Ok(())
}

fn validate_key(key: &NotificationKey) -> DomainResult<()> {
    validate_recipient(&key.recipient_id)?;
    if key.actor_id.trim().is_empty() {
        return Err(DomainError::Validation("actor_id is required".into()));
    }
    Ok(())
}

fn normalize_limit(limit: Option<usize>) -> DomainResult<usize> {
    let limit = limit.unwrap_or(DEFAULT_LIMIT);
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(DomainError::Validation(format!(
            "limit must be between 1 and {MAX_LIMIT}"
        )));
    }
    Ok(limit)
}

fn parse_notification_cursor(value: Option<&str>) -> DomainResult<(Option<i64>, Option<String>)> {
    let Some(value) = value.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok((None, None));
    };
    let (created_at_ms, notification_id) = value.split_once(':').ok_or_else(|| {
        DomainError::Validation(
            "invalid cursor format; expected <created_at_ms>:<notification_id>".into(),
        )
    })?;
    let created_at_ms = created_at_ms
        .parse::<i64>()
        .map_err(|_| DomainError::Validation("invalid cursor format".into()))?;
    if notification_id.is_empty() {
        return Err(DomainError::Validation("invalid cursor format".into()));
    }
    Ok((Some(created_at_ms), Some(notification_id.to_string())))
}

fn make_notification_cursor(created_at_ms: i64, notification_id: &str) -> String {
    format!("{created_at_ms}:{notification_id}")
}
