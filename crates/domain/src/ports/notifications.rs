use crate::DomainResult;
use crate::notifications::{DedupeOutcome, Notification, NotificationKey};
use crate::ports::BoxFuture;

#[derive(Clone, Debug)]
pub struct NotificationRepositoryListQuery {
    pub recipient_id: String,
    pub cursor_created_at_ms: Option<i64>,
    pub cursor_notification_id: Option<String>,
    pub limit: usize,
    pub include_read: bool,
}

#[allow(clippy::needless_pass_by_value)]
pub trait NotificationRepository: Send + Sync {
    /// Persists `notification` unless a row with the same dedupe key exists with
    /// `created_at_ms >= window_start_ms`, in which case that row is returned.
    /// The check and the insert are one atomic unit.
    fn create_deduplicated(
        &self,
        notification: &Notification,
        window_start_ms: i64,
    ) -> BoxFuture<'_, DomainResult<DedupeOutcome>>;

    fn delete_matching(&self, key: &NotificationKey) -> BoxFuture<'_, DomainResult<usize>>;

    /// Flags the row as read when it belongs to `recipient_id` and is unread.
    /// Returns whether a row changed.
    fn mark_read(
        &self,
        recipient_id: &str,
        notification_id: &str,
        read_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<bool>>;

    fn mark_all_read(
        &self,
        recipient_id: &str,
        read_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<usize>>;

    fn unread_count(&self, recipient_id: &str) -> BoxFuture<'_, DomainResult<usize>>;

    fn list_notifications(
        &self,
        query: &NotificationRepositoryListQuery,
    ) -> BoxFuture<'_, DomainResult<Vec<Notification>>>;
}
