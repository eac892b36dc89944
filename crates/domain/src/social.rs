use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::DomainResult;
use crate::error::DomainError;
use crate::identity::ActorIdentity;
use crate::notifications::{NotificationCreate, NotificationKey, NotificationService, NotificationType};
use crate::ports::social::SocialGraphRepository;
use crate::posts::Post;
use crate::profiles::{ProfileService, UserCounters, UserProfile};
use crate::util::now_ms;

/// The initial attempt plus one reinterpretation after a unique-constraint
/// collision or a concurrent delete.
pub const MAX_TOGGLE_ATTEMPTS: usize = 2;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    Follow,
    FollowRequest,
    Like,
    Repost,
    Bookmark,
    Block,
    Mute,
}

impl RelationKind {
    pub const ALL: [RelationKind; 7] = [
        RelationKind::Follow,
        RelationKind::FollowRequest,
        RelationKind::Like,
        RelationKind::Repost,
        RelationKind::Bookmark,
        RelationKind::Block,
        RelationKind::Mute,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RelationKind::Follow => "follow",
            RelationKind::FollowRequest => "follow_request",
            RelationKind::Like => "like",
            RelationKind::Repost => "repost",
            RelationKind::Bookmark => "bookmark",
            RelationKind::Block => "block",
            RelationKind::Mute => "mute",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }

    pub fn targets_post(self) -> bool {
        matches!(
            self,
            RelationKind::Like | RelationKind::Repost | RelationKind::Bookmark
        )
    }

    pub fn notification_type(self) -> Option<NotificationType> {
        match self {
            RelationKind::Follow => Some(NotificationType::Follow),
            RelationKind::FollowRequest => Some(NotificationType::FollowRequest),
            RelationKind::Like => Some(NotificationType::Like),
            RelationKind::Repost => Some(NotificationType::Repost),
            RelationKind::Bookmark | RelationKind::Block | RelationKind::Mute => None,
        }
    }
}

/// One persisted relationship row, unique per `(kind, actor_id, target_id)`.
/// `target_id` is a user id or, for post-scoped kinds, a post id.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RelationEdge {
    pub edge_id: String,
    pub kind: RelationKind,
    pub actor_id: String,
    pub target_id: String,
    pub created_at_ms: i64,
}

impl RelationEdge {
    pub fn new(kind: RelationKind, actor_id: &str, target_id: &str) -> Self {
        Self {
            edge_id: crate::util::uuid_v7_without_dashes(),
            kind,
            actor_id: actor_id.to_string(),
            target_id: target_id.to_string(),
            created_at_ms: now_ms(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PostCounters {
    pub post_id: String,
    pub like_count: i64,
    pub repost_count: i64,
    pub reply_count: i64,
}

impl From<&Post> for PostCounters {
    fn from(post: &Post) -> Self {
        Self {
            post_id: post.post_id.clone(),
            like_count: post.like_count,
            repost_count: post.repost_count,
            reply_count: post.reply_count,
        }
    }
}

/// Counters re-read after the atomic unit that changed an edge commits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CounterSnapshot {
    Users {
        actor: UserCounters,
        target: UserCounters,
    },
    Post(PostCounters),
}

impl CounterSnapshot {
    fn into_users(self) -> DomainResult<(UserCounters, UserCounters)> {
        match self {
            CounterSnapshot::Users { actor, target } => Ok((actor, target)),
            CounterSnapshot::Post(_) => Err(DomainError::Storage(
                "expected user counters for a user relation".into(),
            )),
        }
    }

    fn into_post(self) -> DomainResult<PostCounters> {
        match self {
            CounterSnapshot::Post(counters) => Ok(counters),
            CounterSnapshot::Users { .. } => Err(DomainError::Storage(
                "expected post counters for a post relation".into(),
            )),
        }
    }
}

#[derive(Clone, Debug)]
struct EdgeChange {
    created: bool,
    edge: Option<RelationEdge>,
    counters: CounterSnapshot,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FollowState {
    NotFollowing,
    Following,
    Requested,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FollowToggle {
    pub state: FollowState,
    pub is_following: bool,
    pub follower: UserCounters,
    pub following: UserCounters,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LikeToggle {
    pub liked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub like: Option<RelationEdge>,
    pub like_count: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RepostToggle {
    pub reposted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repost: Option<RelationEdge>,
    pub repost_count: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkToggle {
    pub bookmarked: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlockToggle {
    pub blocked: bool,
    pub blocker: UserCounters,
    pub blocked_user: UserCounters,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MuteToggle {
    pub muted: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FollowRequestDecision {
    Accept,
    Decline,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FollowRequestResolution {
    pub accepted: bool,
    pub follower: UserCounters,
    pub following: UserCounters,
}

/// Orchestrates relationship toggles: precondition checks, the atomic
/// edge+counter mutation, then notification and profile fanout.
#[derive(Clone)]
pub struct SocialGraphService {
    repository: Arc<dyn SocialGraphRepository>,
    notifications: NotificationService,
    profiles: ProfileService,
}

impl SocialGraphService {
    pub fn new(
        repository: Arc<dyn SocialGraphRepository>,
        notifications: NotificationService,
        profiles: ProfileService,
    ) -> Self {
        Self {
            repository,
            notifications,
            profiles,
        }
    }

    /// Follow/unfollow. Following a private profile files a follow request
    /// instead; toggling again while the request is pending withdraws it.
    pub async fn toggle_follow(
        &self,
        actor: &ActorIdentity,
        target_user_id: &str,
    ) -> DomainResult<FollowToggle> {
        let target_user_id = normalize_target(target_user_id, "user_id")?;
        if target_user_id == actor.user_id {
            return Err(DomainError::Validation("cannot follow yourself".into()));
        }
        self.require_actor(actor).await?;
        let target = self.profiles.require_active(&target_user_id).await?;
        self.assert_not_blocked(&actor.user_id, &target.user_id)
            .await?;

        let kind = if self
            .has_edge(RelationKind::Follow, &actor.user_id, &target.user_id)
            .await?
        {
            RelationKind::Follow
        } else if self
            .has_edge(RelationKind::FollowRequest, &actor.user_id, &target.user_id)
            .await?
            || target.is_private
        {
            RelationKind::FollowRequest
        } else {
            RelationKind::Follow
        };

        let change = self
            .toggle_edge(kind, &actor.user_id, &target.user_id)
            .await?;
        self.after_user_toggle(kind, &actor.user_id, &target.user_id, change.created)
            .await;

        let (follower, following) = change.counters.into_users()?;
        let state = match (kind, change.created) {
            (RelationKind::Follow, true) => FollowState::Following,
            (RelationKind::FollowRequest, true) => FollowState::Requested,
            _ => FollowState::NotFollowing,
        };
        Ok(FollowToggle {
            state,
            is_following: state == FollowState::Following,
            follower,
            following,
        })
    }

    /// Accepts or declines a pending request addressed to `actor`.
    pub async fn respond_follow_request(
        &self,
        actor: &ActorIdentity,
        requester_id: &str,
        decision: FollowRequestDecision,
    ) -> DomainResult<FollowRequestResolution> {
        let requester_id = normalize_target(requester_id, "user_id")?;
        if requester_id == actor.user_id {
            return Err(DomainError::Validation(
                "cannot respond to your own follow request".into(),
            ));
        }

        let counters = match decision {
            FollowRequestDecision::Accept => {
                let follow = RelationEdge::new(RelationKind::Follow, &requester_id, &actor.user_id);
                self.repository.accept_follow_request(&follow).await?
            }
            FollowRequestDecision::Decline => {
                self.repository
                    .remove_edge(RelationKind::FollowRequest, &requester_id, &actor.user_id)
                    .await?
            }
        }
        .ok_or(DomainError::NotFound)?;

        let service = self.clone();
        let recipient_id = actor.user_id.clone();
        let accepted = decision == FollowRequestDecision::Accept;
        let follower_id = requester_id.clone();
        run_side_effect("follow_request_resolved", async move {
            service
                .notifications
                .remove_for(&NotificationKey::new(
                    recipient_id.clone(),
                    follower_id.clone(),
                    NotificationType::FollowRequest,
                    None,
                ))
                .await?;
            if accepted {
                service.profiles.publish_current(&follower_id).await?;
                service.profiles.publish_current(&recipient_id).await?;
            }
            Ok(())
        })
        .await;

        let (follower, following) = counters.into_users()?;
        Ok(FollowRequestResolution {
            accepted,
            follower,
            following,
        })
    }

    pub async fn toggle_like(&self, actor: &ActorIdentity, post_id: &str) -> DomainResult<LikeToggle> {
        let (change, _post) = self.toggle_post_edge(RelationKind::Like, actor, post_id).await?;
        let counters = change.counters.into_post()?;
        Ok(LikeToggle {
            liked: change.created,
            like: change.edge,
            like_count: counters.like_count,
        })
    }

    pub async fn toggle_repost(
        &self,
        actor: &ActorIdentity,
        post_id: &str,
    ) -> DomainResult<RepostToggle> {
        let (change, _post) = self
            .toggle_post_edge(RelationKind::Repost, actor, post_id)
            .await?;
        let counters = change.counters.into_post()?;
        Ok(RepostToggle {
            reposted: change.created,
            repost: change.edge,
            repost_count: counters.repost_count,
        })
    }

    pub async fn toggle_bookmark(
        &self,
        actor: &ActorIdentity,
        post_id: &str,
    ) -> DomainResult<BookmarkToggle> {
        let (change, _post) = self
            .toggle_post_edge(RelationKind::Bookmark, actor, post_id)
            .await?;
        Ok(BookmarkToggle {
            bookmarked: change.created,
        })
    }

    /// Blocking severs follows and pending requests in both directions inside
    /// the same atomic unit as the block row.
    pub async fn toggle_block(
        &self,
        actor: &ActorIdentity,
        target_user_id: &str,
    ) -> DomainResult<BlockToggle> {
        let target_user_id = normalize_target(target_user_id, "user_id")?;
        if target_user_id == actor.user_id {
            return Err(DomainError::Validation("cannot block yourself".into()));
        }
        self.require_actor(actor).await?;
        let target = self.profiles.require_active(&target_user_id).await?;

        let change = self
            .toggle_edge(RelationKind::Block, &actor.user_id, &target.user_id)
            .await?;
        self.after_user_toggle(
            RelationKind::Block,
            &actor.user_id,
            &target.user_id,
            change.created,
        )
        .await;

        let (blocker, blocked_user) = change.counters.into_users()?;
        Ok(BlockToggle {
            blocked: change.created,
            blocker,
            blocked_user,
        })
    }

    pub async fn toggle_mute(
        &self,
        actor: &ActorIdentity,
        target_user_id: &str,
    ) -> DomainResult<MuteToggle> {
        let target_user_id = normalize_target(target_user_id, "user_id")?;
        if target_user_id == actor.user_id {
            return Err(DomainError::Validation("cannot mute yourself".into()));
        }
        self.require_actor(actor).await?;
        let target = self.profiles.require_active(&target_user_id).await?;
        let change = self
            .toggle_edge(RelationKind::Mute, &actor.user_id, &target.user_id)
            .await?;
        Ok(MuteToggle {
            muted: change.created,
        })
    }

    pub async fn is_following(&self, follower_id: &str, following_id: &str) -> DomainResult<bool> {
        self.has_edge(RelationKind::Follow, follower_id, following_id)
            .await
    }

    pub async fn assert_not_blocked(&self, actor_id: &str, other_id: &str) -> DomainResult<()> {
        ensure_not_blocked(self.repository.as_ref(), actor_id, other_id).await
    }

    async fn toggle_post_edge(
        &self,
        kind: RelationKind,
        actor: &ActorIdentity,
        post_id: &str,
    ) -> DomainResult<(EdgeChange, Post)> {
        let post_id = normalize_target(post_id, "post_id")?;
        self.require_actor(actor).await?;
        let post = self
            .repository
            .get_post(&post_id)
            .await?
            .filter(Post::is_live)
            .ok_or(DomainError::NotFound)?;
        // Removing an existing interaction stays possible across a block.
        if !self.has_edge(kind, &actor.user_id, &post.post_id).await? {
            self.assert_not_blocked(&actor.user_id, &post.author_id)
                .await?;
        }

        let change = self.toggle_edge(kind, &actor.user_id, &post.post_id).await?;

        if let Some(notification_type) = kind.notification_type() {
            let key = NotificationKey::new(
                post.author_id.clone(),
                actor.user_id.clone(),
                notification_type,
                Some(post.post_id.clone()),
            );
            self.sync_notification(key, change.created).await;
        }
        Ok((change, post))
    }

    /// Create-or-delete decided by current state. A create that collides with
    /// a concurrent insert becomes a delete; a delete that finds nothing
    /// becomes a create. A second collision surfaces `Conflict`.
    async fn toggle_edge(
        &self,
        kind: RelationKind,
        actor_id: &str,
        target_id: &str,
    ) -> DomainResult<EdgeChange> {
        let mut create = !self.has_edge(kind, actor_id, target_id).await?;

        for attempt in 0..MAX_TOGGLE_ATTEMPTS {
            if create {
                let edge = RelationEdge::new(kind, actor_id, target_id);
                match self.repository.insert_edge(&edge).await {
                    Ok(counters) => {
                        return Ok(EdgeChange {
                            created: true,
                            edge: Some(edge),
                            counters,
                        });
                    }
                    Err(DomainError::Conflict) => {
                        debug!(kind = kind.as_str(), attempt, "edge exists, toggling off");
                        create = false;
                    }
                    Err(err) => return Err(err),
                }
            } else {
                match self.repository.remove_edge(kind, actor_id, target_id).await? {
                    Some(counters) => {
                        return Ok(EdgeChange {
                            created: false,
                            edge: None,
                            counters,
                        });
                    }
                    None => {
                        debug!(kind = kind.as_str(), attempt, "edge vanished, toggling on");
                        create = true;
                    }
                }
            }
        }

        Err(DomainError::Conflict)
    }

    async fn after_user_toggle(
        &self,
        kind: RelationKind,
        actor_id: &str,
        target_id: &str,
        created: bool,
    ) {
        let service = self.clone();
        let actor_id = actor_id.to_string();
        let target_id = target_id.to_string();
        run_side_effect("user_relation_changed", async move {
            if let Some(notification_type) = kind.notification_type() {
                let key = NotificationKey::new(
                    target_id.clone(),
                    actor_id.clone(),
                    notification_type,
                    None,
                );
                service.apply_notification(key, created).await?;
            }
            if matches!(kind, RelationKind::Follow | RelationKind::Block) {
                service.profiles.publish_current(&actor_id).await?;
                service.profiles.publish_current(&target_id).await?;
            }
            Ok(())
        })
        .await;
    }

    async fn sync_notification(&self, key: NotificationKey, created: bool) {
        let service = self.clone();
        run_side_effect("relation_notification", async move {
            service.apply_notification(key, created).await
        })
        .await;
    }

    async fn apply_notification(&self, key: NotificationKey, created: bool) -> DomainResult<()> {
        if created {
            self.notifications
                .create(NotificationCreate::new(key))
                .await?;
        } else {
            self.notifications.remove_for(&key).await?;
        }
        Ok(())
    }

    async fn require_actor(&self, actor: &ActorIdentity) -> DomainResult<UserProfile> {
        self.repository
            .get_user(&actor.user_id)
            .await?
            .filter(UserProfile::is_active)
            .ok_or_else(|| DomainError::Validation("actor profile is required".into()))
    }

    async fn has_edge(&self, kind: RelationKind, actor_id: &str, target_id: &str) -> DomainResult<bool> {
        Ok(self
            .repository
            .get_edge(kind, actor_id, target_id)
            .await?
            .is_some())
    }
}

/// Runs a post-commit side effect on its own task so that a caller dropping
/// the request future cannot cancel it. The handle is awaited; failures are
/// logged and swallowed.
pub(crate) async fn run_side_effect<F>(label: &'static str, task: F)
where
    F: Future<Output = DomainResult<()>> + Send + 'static,
{
    match tokio::spawn(task).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(side_effect = label, error = %err, "side effect failed"),
        Err(err) => warn!(side_effect = label, error = %err, "side effect task did not complete"),
    }
}

fn normalize_target(value: &str, field: &str) -> DomainResult<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(DomainError::Validation(format!("{field} is required")));
    }
    Ok(value.to_string())
}

/// Fails with `Forbidden` when either user blocks the other.
pub(crate) async fn ensure_not_blocked(
    repository: &dyn SocialGraphRepository,
    actor_id: &str,
    other_id: &str,
) -> DomainResult<()> {
    if actor_id == other_id {
        return Ok(());
    }
    let forward = repository
        .get_edge(RelationKind::Block, actor_id, other_id)
        .await?;
    let backward = repository
        .get_edge(RelationKind::Block, other_id, actor_id)
        .await?;
    if forward.is_some() || backward.is_some() {
        return Err(DomainError::Forbidden("interaction is blocked".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relation_kind_round_trips_through_str() {
        for kind in RelationKind::ALL {
            assert_eq!(RelationKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(RelationKind::parse("friend"), None);
    }

    #[test]
    fn only_post_relations_target_posts() {
        assert!(RelationKind::Like.targets_post());
        assert!(RelationKind::Bookmark.targets_post());
        assert!(!RelationKind::Follow.targets_post());
        assert!(!RelationKind::Mute.targets_post());
    }

    #[test]
    fn silent_relations_have_no_notification_type() {
        assert_eq!(RelationKind::Bookmark.notification_type(), None);
        assert_eq!(RelationKind::Block.notification_type(), None);
        assert_eq!(
            RelationKind::FollowRequest.notification_type(),
            Some(NotificationType::FollowRequest)
        );
    }

    #[test]
    fn like_toggle_omits_absent_edge() {
        let value = serde_json::to_value(LikeToggle {
            liked: false,
            like: None,
            like_count: 0,
        })
        .unwrap();
        assert_eq!(value, serde_json::json!({ "liked": false, "likeCount": 0 }));
    }
}
