use crate::DomainResult;
use crate::posts::Post;
use crate::ports::BoxFuture;
use crate::profiles::{UserCounters, UserProfile};
use crate::social::{CounterSnapshot, RelationEdge, RelationKind};

/// Storage port for profiles, posts and relationship edges.
///
/// Every method that touches a counter applies the edge/post mutation and the
/// counter delta as one atomic unit. A duplicate `insert_edge` must fail with
/// `DomainError::Conflict`; a `remove_edge` that finds nothing returns `None`.
#[allow(clippy::needless_pass_by_value)]
pub trait SocialGraphRepository: Send + Sync {
    fn upsert_user(&self, profile: &UserProfile) -> BoxFuture<'_, DomainResult<UserProfile>>;

    fn get_user(&self, user_id: &str) -> BoxFuture<'_, DomainResult<Option<UserProfile>>>;

    fn find_users_by_username(
        &self,
        usernames: &[String],
    ) -> BoxFuture<'_, DomainResult<Vec<UserProfile>>>;

    fn user_counters(&self, user_id: &str) -> BoxFuture<'_, DomainResult<Option<UserCounters>>>;

    fn set_presence(
        &self,
        user_id: &str,
        is_online: bool,
        seen_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<()>>;

    /// Inserts the post, bumps the author's posts count and, for replies, the
    /// parent's reply count.
    fn create_post(&self, post: &Post) -> BoxFuture<'_, DomainResult<Post>>;

    fn get_post(&self, post_id: &str) -> BoxFuture<'_, DomainResult<Option<Post>>>;

    /// Soft-deletes a live post and reverses the counters `create_post` applied.
    /// Returns `None` when the post is missing or already deleted.
    fn soft_delete_post(
        &self,
        post_id: &str,
        deleted_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<Option<Post>>>;

    fn get_edge(
        &self,
        kind: RelationKind,
        actor_id: &str,
        target_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<RelationEdge>>>;

    fn insert_edge(&self, edge: &RelationEdge) -> BoxFuture<'_, DomainResult<CounterSnapshot>>;

    fn remove_edge(
        &self,
        kind: RelationKind,
        actor_id: &str,
        target_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<CounterSnapshot>>>;

    /// Replaces a pending follow request with a follow edge. `None` when no
    /// request exists.
    fn accept_follow_request(
        &self,
        follow: &RelationEdge,
    ) -> BoxFuture<'_, DomainResult<Option<CounterSnapshot>>>;
}
