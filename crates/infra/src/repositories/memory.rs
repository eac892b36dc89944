use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chorus_domain::DomainResult;
use chorus_domain::conversations::{
    Conversation, ConversationParticipant, ConversationSummary, Message, MessageAppend,
    MessageCatchup,
};
use chorus_domain::error::DomainError;
use chorus_domain::feed::{FeedCursorKey, InteractionFlags, compare_feed_order};
use chorus_domain::notifications::{DedupeOutcome, Notification, NotificationKey};
use chorus_domain::ports::BoxFuture;
use chorus_domain::ports::conversations::ConversationRepository;
use chorus_domain::ports::feed::{FeedRepository, FeedRepositoryQuery};
use chorus_domain::ports::notifications::{
    NotificationRepository, NotificationRepositoryListQuery,
};
use chorus_domain::ports::social::SocialGraphRepository;
use chorus_domain::posts::Post;
use chorus_domain::profiles::{UserCounters, UserProfile};
use chorus_domain::social::{CounterSnapshot, PostCounters, RelationEdge, RelationKind};
use tokio::sync::RwLock;

type EdgeKey = (RelationKind, String, String);

fn edge_key(kind: RelationKind, actor_id: &str, target_id: &str) -> EdgeKey {
    (kind, actor_id.to_string(), target_id.to_string())
}

#[derive(Default)]
struct SocialState {
    users: HashMap<String, UserProfile>,
    posts: HashMap<String, Post>,
    edges: HashMap<EdgeKey, RelationEdge>,
}

impl SocialState {
    fn adjust_counters(&mut self, kind: RelationKind, actor_id: &str, target_id: &str, delta: i64) {
        match kind {
            RelationKind::Follow => {
                if let Some(actor) = self.users.get_mut(actor_id) {
                    actor.following_count += delta;
                }
                if let Some(target) = self.users.get_mut(target_id) {
                    target.followers_count += delta;
                }
            }
            RelationKind::Like => {
                if let Some(post) = self.posts.get_mut(target_id) {
                    post.like_count += delta;
                }
            }
            RelationKind::Repost => {
                if let Some(post) = self.posts.get_mut(target_id) {
                    post.repost_count += delta;
                }
            }
            RelationKind::FollowRequest
            | RelationKind::Bookmark
            | RelationKind::Block
            | RelationKind::Mute => {}
        }
    }

    fn remove_and_adjust(&mut self, kind: RelationKind, actor_id: &str, target_id: &str) -> bool {
        if self
            .edges
            .remove(&edge_key(kind, actor_id, target_id))
            .is_none()
        {
            return false;
        }
        self.adjust_counters(kind, actor_id, target_id, -1);
        true
    }

    /// Follows and pending requests in both directions.
    fn sever(&mut self, left: &str, right: &str) {
        for kind in [RelationKind::Follow, RelationKind::FollowRequest] {
            self.remove_and_adjust(kind, left, right);
            self.remove_and_adjust(kind, right, left);
        }
    }

    fn user_counters(&self, user_id: &str) -> DomainResult<UserCounters> {
        self.users
            .get(user_id)
            .map(UserProfile::counters)
            .ok_or(DomainError::NotFound)
    }

    fn snapshot(
        &self,
        kind: RelationKind,
        actor_id: &str,
        target_id: &str,
    ) -> DomainResult<CounterSnapshot> {
        if kind.targets_post() {
            let post = self.posts.get(target_id).ok_or(DomainError::NotFound)?;
            return Ok(CounterSnapshot::Post(PostCounters::from(post)));
        }
        Ok(CounterSnapshot::Users {
            actor: self.user_counters(actor_id)?,
            target: self.user_counters(target_id)?,
        })
    }
}

/// Users, posts and edges behind one lock, so an edge and its counters always
/// change together.
#[derive(Clone, Default)]
pub struct InMemorySocialStore {
    state: Arc<RwLock<SocialState>>,
}

impl InMemorySocialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored edges of `kind`, used to check counters against rows.
    pub async fn edge_count(&self, kind: RelationKind) -> usize {
        self.state
            .read()
            .await
            .edges
            .keys()
            .filter(|(edge_kind, _, _)| *edge_kind == kind)
            .count()
    }
}

impl SocialGraphRepository for InMemorySocialStore {
    fn upsert_user(&self, profile: &UserProfile) -> BoxFuture<'_, DomainResult<UserProfile>> {
        let profile = profile.clone();
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.write().await;
            let taken = state.users.values().any(|other| {
                other.user_id != profile.user_id && other.username == profile.username
            });
            if taken {
                return Err(DomainError::Conflict);
            }
            let stored = match state.users.get(&profile.user_id) {
                Some(existing) => UserProfile {
                    followers_count: existing.followers_count,
                    following_count: existing.following_count,
                    posts_count: existing.posts_count,
                    is_online: existing.is_online,
                    last_seen_at_ms: existing.last_seen_at_ms,
                    created_at_ms: existing.created_at_ms,
                    ..profile
                },
                None => profile,
            };
            state.users.insert(stored.user_id.clone(), stored.clone());
            Ok(stored)
        })
    }

    fn get_user(&self, user_id: &str) -> BoxFuture<'_, DomainResult<Option<UserProfile>>> {
        let user_id = user_id.to_string();
        let state = self.state.clone();
        Box::pin(async move { Ok(state.read().await.users.get(&user_id).cloned()) })
    }

    fn find_users_by_username(
        &self,
        usernames: &[String],
    ) -> BoxFuture<'_, DomainResult<Vec<UserProfile>>> {
        let usernames: HashSet<String> = usernames.iter().cloned().collect();
        let state = self.state.clone();
        Box::pin(async move {
            let mut profiles: Vec<_> = state
                .read()
                .await
                .users
                .values()
                .filter(|profile| usernames.contains(&profile.username))
                .cloned()
                .collect();
            profiles.sort_by(|a, b| a.username.cmp(&b.username));
            Ok(profiles)
        })
    }

    fn user_counters(&self, user_id: &str) -> BoxFuture<'_, DomainResult<Option<UserCounters>>> {
        let user_id = user_id.to_string();
        let state = self.state.clone();
        Box::pin(async move {
            Ok(state
                .read()
                .await
                .users
                .get(&user_id)
                .map(UserProfile::counters))
        })
    }

    fn set_presence(
        &self,
        user_id: &str,
        is_online: bool,
        seen_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<()>> {
        let user_id = user_id.to_string();
        let state = self.state.clone();
        Box::pin(async move {
            if let Some(profile) = state.write().await.users.get_mut(&user_id) {
                profile.is_online = is_online;
                profile.last_seen_at_ms = Some(seen_at_ms);
            }
            Ok(())
        })
    }

    fn create_post(&self, post: &Post) -> BoxFuture<'_, DomainResult<Post>> {
        let post = post.clone();
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.write().await;
            if state.posts.contains_key(&post.post_id) {
                return Err(DomainError::Conflict);
            }
            if let Some(parent_post_id) = post.parent_post_id.as_deref() {
                let parent = state
                    .posts
                    .get_mut(parent_post_id)
                    .filter(|parent| parent.is_live())
                    .ok_or(DomainError::NotFound)?;
                parent.reply_count += 1;
            }
            if let Some(author) = state.users.get_mut(&post.author_id) {
                author.posts_count += 1;
            }
            state.posts.insert(post.post_id.clone(), post.clone());
            Ok(post)
        })
    }

    fn get_post(&self, post_id: &str) -> BoxFuture<'_, DomainResult<Option<Post>>> {
        let post_id = post_id.to_string();
        let state = self.state.clone();
        Box::pin(async move { Ok(state.read().await.posts.get(&post_id).cloned()) })
    }

    fn soft_delete_post(
        &self,
        post_id: &str,
        deleted_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<Option<Post>>> {
        let post_id = post_id.to_string();
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.write().await;
            let Some(post) = state.posts.get_mut(&post_id).filter(|post| post.is_live()) else {
                return Ok(None);
            };
            post.deleted_at_ms = Some(deleted_at_ms);
            post.updated_at_ms = deleted_at_ms;
            let deleted = post.clone();

            if let Some(author) = state.users.get_mut(&deleted.author_id) {
                author.posts_count -= 1;
            }
            if let Some(parent) = deleted
                .parent_post_id
                .as_deref()
                .and_then(|parent_post_id| state.posts.get_mut(parent_post_id))
            {
                parent.reply_count -= 1;
            }
            Ok(Some(deleted))
        })
    }

    fn get_edge(
        &self,
        kind: RelationKind,
        actor_id: &str,
        target_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<RelationEdge>>> {
        let key = edge_key(kind, actor_id, target_id);
        let state = self.state.clone();
        Box::pin(async move { Ok(state.read().await.edges.get(&key).cloned()) })
    }

    fn insert_edge(&self, edge: &RelationEdge) -> BoxFuture<'_, DomainResult<CounterSnapshot>> {
        let edge = edge.clone();
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.write().await;
            let key = edge_key(edge.kind, &edge.actor_id, &edge.target_id);
            if state.edges.contains_key(&key) {
                return Err(DomainError::Conflict);
            }
            state.edges.insert(key, edge.clone());
            state.adjust_counters(edge.kind, &edge.actor_id, &edge.target_id, 1);
            if edge.kind == RelationKind::Block {
                state.sever(&edge.actor_id, &edge.target_id);
            }
            state.snapshot(edge.kind, &edge.actor_id, &edge.target_id)
        })
    }

    fn remove_edge(
        &self,
        kind: RelationKind,
        actor_id: &str,
        target_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<CounterSnapshot>>> {
        let actor_id = actor_id.to_string();
        let target_id = target_id.to_string();
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.write().await;
            if !state.remove_and_adjust(kind, &actor_id, &target_id) {
                return Ok(None);
            }
            state.snapshot(kind, &actor_id, &target_id).map(Some)
        })
    }

    fn accept_follow_request(
        &self,
        follow: &RelationEdge,
    ) -> BoxFuture<'_, DomainResult<Option<CounterSnapshot>>> {
        let follow = follow.clone();
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.write().await;
            if !state.remove_and_adjust(
                RelationKind::FollowRequest,
                &follow.actor_id,
                &follow.target_id,
            ) {
                return Ok(None);
            }
            let key = edge_key(RelationKind::Follow, &follow.actor_id, &follow.target_id);
            if !state.edges.contains_key(&key) {
                state.edges.insert(key, follow.clone());
                state.adjust_counters(RelationKind::Follow, &follow.actor_id, &follow.target_id, 1);
            }
            state
                .snapshot(RelationKind::Follow, &follow.actor_id, &follow.target_id)
                .map(Some)
        })
    }
}

impl FeedRepository for InMemorySocialStore {
    fn get_post(&self, post_id: &str) -> BoxFuture<'_, DomainResult<Option<Post>>> {
        SocialGraphRepository::get_post(self, post_id)
    }

    fn list_following_ids(&self, user_id: &str) -> BoxFuture<'_, DomainResult<Vec<String>>> {
        let user_id = user_id.to_string();
        let state = self.state.clone();
        Box::pin(async move {
            Ok(state
                .read()
                .await
                .edges
                .values()
                .filter(|edge| edge.kind == RelationKind::Follow && edge.actor_id == user_id)
                .map(|edge| edge.target_id.clone())
                .collect())
        })
    }

    fn list_hidden_author_ids(
        &self,
        viewer_id: &str,
    ) -> BoxFuture<'_, DomainResult<Vec<String>>> {
        let viewer_id = viewer_id.to_string();
        let state = self.state.clone();
        Box::pin(async move {
            let state = state.read().await;
            let mut hidden: Vec<String> = state
                .edges
                .values()
                .filter_map(|edge| match edge.kind {
                    RelationKind::Block | RelationKind::Mute if edge.actor_id == viewer_id => {
                        Some(edge.target_id.clone())
                    }
                    RelationKind::Block if edge.target_id == viewer_id => {
                        Some(edge.actor_id.clone())
                    }
                    _ => None,
                })
                .collect();
            hidden.sort();
            hidden.dedup();
            Ok(hidden)
        })
    }

    fn list_posts(&self, query: &FeedRepositoryQuery) -> BoxFuture<'_, DomainResult<Vec<Post>>> {
        let query = query.clone();
        let state = self.state.clone();
        Box::pin(async move {
            let authors: Option<HashSet<String>> =
                query.author_ids.map(|ids| ids.into_iter().collect());
            let excluded: HashSet<String> = query.excluded_author_ids.into_iter().collect();
            let cursor: Option<FeedCursorKey> = query.cursor;

            let mut posts: Vec<Post> = state
                .read()
                .await
                .posts
                .values()
                .filter(|post| post.is_live())
                .filter(|post| {
                    authors
                        .as_ref()
                        .is_none_or(|authors| authors.contains(&post.author_id))
                })
                .filter(|post| !excluded.contains(&post.author_id))
                .filter(|post| cursor.as_ref().is_none_or(|cursor| cursor.precedes(post)))
                .cloned()
                .collect();
            posts.sort_by(compare_feed_order);
            posts.truncate(query.limit);
            Ok(posts)
        })
    }

    fn interaction_flags(
        &self,
        viewer_id: &str,
        post_ids: &[String],
    ) -> BoxFuture<'_, DomainResult<HashMap<String, InteractionFlags>>> {
        let viewer_id = viewer_id.to_string();
        let post_ids = post_ids.to_vec();
        let state = self.state.clone();
        Box::pin(async move {
            let state = state.read().await;
            let has = |kind: RelationKind, post_id: &str| {
                state
                    .edges
                    .contains_key(&edge_key(kind, &viewer_id, post_id))
            };
            Ok(post_ids
                .iter()
                .map(|post_id| {
                    (
                        post_id.clone(),
                        InteractionFlags {
                            is_liked: has(RelationKind::Like, post_id),
                            is_reposted: has(RelationKind::Repost, post_id),
                            is_bookmarked: has(RelationKind::Bookmark, post_id),
                        },
                    )
                })
                .collect())
        })
    }
}

#[derive(Clone, Default)]
pub struct InMemoryNotificationRepository {
    rows: Arc<RwLock<Vec<Notification>>>,
}

impl InMemoryNotificationRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NotificationRepository for InMemoryNotificationRepository {
    fn create_deduplicated(
        &self,
        notification: &Notification,
        window_start_ms: i64,
    ) -> BoxFuture<'_, DomainResult<DedupeOutcome>> {
        let notification = notification.clone();
        let rows = self.rows.clone();
        Box::pin(async move {
            let mut rows = rows.write().await;
            if let Some(existing) = rows
                .iter()
                .filter(|row| {
                    row.dedupe_key == notification.dedupe_key
                        && row.created_at_ms >= window_start_ms
                })
                .max_by_key(|row| row.created_at_ms)
            {
                return Ok(DedupeOutcome::Existing(existing.clone()));
            }
            rows.push(notification.clone());
            Ok(DedupeOutcome::Created(notification))
        })
    }

    fn delete_matching(&self, key: &NotificationKey) -> BoxFuture<'_, DomainResult<usize>> {
        let dedupe_key = key.dedupe_key();
        let rows = self.rows.clone();
        Box::pin(async move {
            let mut rows = rows.write().await;
            let before = rows.len();
            rows.retain(|row| row.dedupe_key != dedupe_key);
            Ok(before - rows.len())
        })
    }

    fn mark_read(
        &self,
        recipient_id: &str,
        notification_id: &str,
        read_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<bool>> {
        let recipient_id = recipient_id.to_string();
        let notification_id = notification_id.to_string();
        let rows = self.rows.clone();
        Box::pin(async move {
            let mut rows = rows.write().await;
            let Some(row) = rows.iter_mut().find(|row| {
                row.notification_id == notification_id
                    && row.recipient_id == recipient_id
                    && !row.is_read
            }) else {
                return Ok(false);
            };
            row.is_read = true;
            row.read_at_ms = Some(read_at_ms);
            Ok(true)
        })
    }

    fn mark_all_read(
        &self,
        recipient_id: &str,
        read_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<usize>> {
        let recipient_id = recipient_id.to_string();
        let rows = self.rows.clone();
        Box::pin(async move {
            let mut rows = rows.write().await;
            let mut changed = 0;
            for row in rows
                .iter_mut()
                .filter(|row| row.recipient_id == recipient_id && !row.is_read)
            {
                row.is_read = true;
                row.read_at_ms = Some(read_at_ms);
                changed += 1;
            }
            Ok(changed)
        })
    }

    fn unread_count(&self, recipient_id: &str) -> BoxFuture<'_, DomainResult<usize>> {
        let recipient_id = recipient_id.to_string();
        let rows = self.rows.clone();
        Box::pin(async move {
            Ok(rows
                .read()
                .await
                .iter()
                .filter(|row| row.recipient_id == recipient_id && !row.is_read)
                .count())
        })
    }

    fn list_notifications(
        &self,
        query: &NotificationRepositoryListQuery,
    ) -> BoxFuture<'_, DomainResult<Vec<Notification>>> {
        let query = query.clone();
        let rows = self.rows.clone();
        Box::pin(async move {
            let mut items: Vec<_> = rows
                .read()
                .await
                .iter()
                .filter(|row| row.recipient_id == query.recipient_id)
                .filter(|row| query.include_read || !row.is_read)
                .filter(|row| match query.cursor_created_at_ms {
                    None => true,
                    Some(cursor_ms) => {
                        row.created_at_ms < cursor_ms
                            || row.created_at_ms == cursor_ms
                                && query
                                    .cursor_notification_id
                                    .as_ref()
                                    .is_some_and(|id| row.notification_id < *id)
                    }
                })
                .cloned()
                .collect();
            items.sort_by(|a, b| {
                b.created_at_ms
                    .cmp(&a.created_at_ms)
                    .then_with(|| b.notification_id.cmp(&a.notification_id))
            });
            items.truncate(query.limit);
            Ok(items)
        })
    }
}

#[derive(Default)]
struct ConversationState {
    conversations: HashMap<String, Conversation>,
    direct: HashMap<String, String>,
    participants: HashMap<(String, String), ConversationParticipant>,
    messages: HashMap<String, Vec<Message>>,
    by_request: HashMap<(String, String), String>,
}

impl ConversationState {
    fn participants_of(&self, conversation_id: &str) -> Vec<ConversationParticipant> {
        let mut participants: Vec<_> = self
            .participants
            .values()
            .filter(|participant| participant.conversation_id == conversation_id)
            .cloned()
            .collect();
        participants.sort_by(|a, b| {
            a.joined_at_ms
                .cmp(&b.joined_at_ms)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        participants
    }

    fn find_message(&self, conversation_id: &str, message_id: &str) -> Option<&Message> {
        self.messages
            .get(conversation_id)?
            .iter()
            .find(|message| message.message_id == message_id)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryConversationRepository {
    state: Arc<RwLock<ConversationState>>,
}

impl InMemoryConversationRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConversationRepository for InMemoryConversationRepository {
    fn create_conversation(
        &self,
        conversation: &Conversation,
        participants: &[ConversationParticipant],
    ) -> BoxFuture<'_, DomainResult<Conversation>> {
        let conversation = conversation.clone();
        let participants = participants.to_vec();
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.write().await;
            if state
                .conversations
                .contains_key(&conversation.conversation_id)
            {
                return Err(DomainError::Conflict);
            }
            if let Some(direct_key) = conversation.direct_key.as_ref() {
                if state.direct.contains_key(direct_key) {
                    return Err(DomainError::Conflict);
                }
                state
                    .direct
                    .insert(direct_key.clone(), conversation.conversation_id.clone());
            }
            for participant in participants {
                state.participants.insert(
                    (
                        participant.conversation_id.clone(),
                        participant.user_id.clone(),
                    ),
                    participant,
                );
            }
            state
                .conversations
                .insert(conversation.conversation_id.clone(), conversation.clone());
            Ok(conversation)
        })
    }

    fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<Conversation>>> {
        let conversation_id = conversation_id.to_string();
        let state = self.state.clone();
        Box::pin(async move {
            Ok(state
                .read()
                .await
                .conversations
                .get(&conversation_id)
                .cloned())
        })
    }

    fn find_direct(&self, direct_key: &str) -> BoxFuture<'_, DomainResult<Option<Conversation>>> {
        let direct_key = direct_key.to_string();
        let state = self.state.clone();
        Box::pin(async move {
            let state = state.read().await;
            Ok(state
                .direct
                .get(&direct_key)
                .and_then(|conversation_id| state.conversations.get(conversation_id))
                .cloned())
        })
    }

    fn get_participant(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<ConversationParticipant>>> {
        let key = (conversation_id.to_string(), user_id.to_string());
        let state = self.state.clone();
        Box::pin(async move { Ok(state.read().await.participants.get(&key).cloned()) })
    }

    fn list_participants(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'_, DomainResult<Vec<ConversationParticipant>>> {
        let conversation_id = conversation_id.to_string();
        let state = self.state.clone();
        Box::pin(async move { Ok(state.read().await.participants_of(&conversation_id)) })
    }

    fn list_for_user(
        &self,
        user_id: &str,
    ) -> BoxFuture<'_, DomainResult<Vec<ConversationSummary>>> {
        let user_id = user_id.to_string();
        let state = self.state.clone();
        Box::pin(async move {
            let state = state.read().await;
            let summaries = state
                .participants
                .values()
                .filter(|participant| participant.user_id == user_id)
                .filter_map(|participant| {
                    let conversation = state
                        .conversations
                        .get(&participant.conversation_id)?
                        .clone();
                    let participant_ids = state
                        .participants_of(&conversation.conversation_id)
                        .into_iter()
                        .filter(ConversationParticipant::is_active)
                        .map(|participant| participant.user_id)
                        .collect();
                    let last_message = conversation
                        .last_message_id
                        .as_deref()
                        .and_then(|message_id| {
                            state.find_message(&conversation.conversation_id, message_id)
                        })
                        .cloned();
                    Some(ConversationSummary {
                        conversation,
                        participant: participant.clone(),
                        participant_ids,
                        last_message,
                    })
                })
                .collect();
            Ok(summaries)
        })
    }

    fn update_participant(
        &self,
        participant: &ConversationParticipant,
    ) -> BoxFuture<'_, DomainResult<ConversationParticipant>> {
        let participant = participant.clone();
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.write().await;
            let key = (
                participant.conversation_id.clone(),
                participant.user_id.clone(),
            );
            let stored = state.participants.get_mut(&key).ok_or(DomainError::NotFound)?;
            // Counters belong to append/mark_read; keep whatever is stored.
            let updated = ConversationParticipant {
                unread_count: stored.unread_count,
                mention_count: stored.mention_count,
                last_read_at_ms: stored.last_read_at_ms,
                ..participant
            };
            *stored = updated.clone();
            Ok(updated)
        })
    }

    fn append_message(&self, message: &Message) -> BoxFuture<'_, DomainResult<MessageAppend>> {
        let message = message.clone();
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.write().await;
            let request_key = (message.conversation_id.clone(), message.request_id.clone());
            let active_participant_ids: Vec<String> = state
                .participants_of(&message.conversation_id)
                .into_iter()
                .filter(ConversationParticipant::is_active)
                .map(|participant| participant.user_id)
                .collect();

            if let Some(existing_id) = state.by_request.get(&request_key) {
                if let Some(existing) =
                    state.find_message(&message.conversation_id, existing_id)
                {
                    return Ok(MessageAppend {
                        message: existing.clone(),
                        created: false,
                        active_participant_ids,
                    });
                }
            }

            let conversation = state
                .conversations
                .get_mut(&message.conversation_id)
                .ok_or(DomainError::NotFound)?;
            conversation.last_message_id = Some(message.message_id.clone());
            conversation.last_message_at_ms = Some(message.created_at_ms);
            conversation.updated_at_ms = message.created_at_ms;

            for participant in state.participants.values_mut().filter(|participant| {
                participant.conversation_id == message.conversation_id
                    && participant.user_id != message.sender_id
                    && participant.is_active()
            }) {
                participant.unread_count += 1;
                if message.mentions.contains(&participant.user_id) {
                    participant.mention_count += 1;
                }
            }

            state
                .messages
                .entry(message.conversation_id.clone())
                .or_default()
                .push(message.clone());
            state
                .by_request
                .insert(request_key, message.message_id.clone());

            Ok(MessageAppend {
                message,
                created: true,
                active_participant_ids,
            })
        })
    }

    fn list_messages(
        &self,
        conversation_id: &str,
        cursor: &MessageCatchup,
    ) -> BoxFuture<'_, DomainResult<Vec<Message>>> {
        let conversation_id = conversation_id.to_string();
        let cursor = cursor.clone();
        let state = self.state.clone();
        Box::pin(async move {
            if cursor.since_created_at_ms.is_none() && cursor.since_message_id.is_some() {
                return Err(DomainError::Validation(
                    "since_message_id requires since_created_at_ms".into(),
                ));
            }
            let mut messages = state
                .read()
                .await
                .messages
                .get(&conversation_id)
                .cloned()
                .unwrap_or_default();
            messages.sort_by(|a, b| {
                a.created_at_ms
                    .cmp(&b.created_at_ms)
                    .then_with(|| a.message_id.cmp(&b.message_id))
            });
            Ok(messages
                .into_iter()
                .filter(|message| match cursor.since_created_at_ms {
                    None => true,
                    Some(since_created_at_ms) => {
                        message.created_at_ms > since_created_at_ms
                            || message.created_at_ms == since_created_at_ms
                                && cursor
                                    .since_message_id
                                    .as_ref()
                                    .is_none_or(|message_id| message.message_id > *message_id)
                    }
                })
                .take(cursor.limit)
                .collect())
        })
    }

    fn mark_read(
        &self,
        conversation_id: &str,
        user_id: &str,
        read_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<Option<ConversationParticipant>>> {
        let key = (conversation_id.to_string(), user_id.to_string());
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.write().await;
            let Some(participant) = state.participants.get_mut(&key) else {
                return Ok(None);
            };
            participant.unread_count = 0;
            participant.mention_count = 0;
            participant.last_read_at_ms = Some(read_at_ms);
            Ok(Some(participant.clone()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(user_id: &str) -> UserProfile {
        UserProfile {
            user_id: user_id.to_string(),
            username: user_id.to_string(),
            display_name: user_id.to_string(),
            bio: None,
            is_private: false,
            followers_count: 0,
            following_count: 0,
            posts_count: 0,
            is_online: false,
            last_seen_at_ms: None,
            created_at_ms: 1,
            updated_at_ms: 1,
            deleted_at_ms: None,
        }
    }

    #[tokio::test]
    async fn duplicate_edge_insert_is_a_conflict() {
        let store = InMemorySocialStore::new();
        store.upsert_user(&profile("alice")).await.unwrap();
        store.upsert_user(&profile("bob")).await.unwrap();

        let edge = RelationEdge::new(RelationKind::Follow, "alice", "bob");
        store.insert_edge(&edge).await.unwrap();
        let err = store.insert_edge(&edge).await.unwrap_err();
        assert!(matches!(err, DomainError::Conflict));
        assert_eq!(store.edge_count(RelationKind::Follow).await, 1);
    }

    #[tokio::test]
    async fn block_severs_follows_both_ways() {
        let store = InMemorySocialStore::new();
        store.upsert_user(&profile("alice")).await.unwrap();
        store.upsert_user(&profile("bob")).await.unwrap();
        store
            .insert_edge(&RelationEdge::new(RelationKind::Follow, "alice", "bob"))
            .await
            .unwrap();
        store
            .insert_edge(&RelationEdge::new(RelationKind::Follow, "bob", "alice"))
            .await
            .unwrap();

        let snapshot = store
            .insert_edge(&RelationEdge::new(RelationKind::Block, "alice", "bob"))
            .await
            .unwrap();
        let CounterSnapshot::Users { actor, target } = snapshot else {
            panic!("expected user counters");
        };
        assert_eq!(actor.followers_count, 0);
        assert_eq!(actor.following_count, 0);
        assert_eq!(target.followers_count, 0);
        assert_eq!(target.following_count, 0);
        assert_eq!(store.edge_count(RelationKind::Follow).await, 0);
    }

    #[tokio::test]
    async fn upsert_keeps_counters_and_rejects_taken_username() {
        let store = InMemorySocialStore::new();
        store.upsert_user(&profile("alice")).await.unwrap();
        store.upsert_user(&profile("bob")).await.unwrap();
        store
            .insert_edge(&RelationEdge::new(RelationKind::Follow, "bob", "alice"))
            .await
            .unwrap();

        let mut renamed = profile("alice");
        renamed.display_name = "Alice A".into();
        let stored = store.upsert_user(&renamed).await.unwrap();
        assert_eq!(stored.followers_count, 1);

        let mut clash = profile("bob");
        clash.username = "alice".into();
        assert!(matches!(
            store.upsert_user(&clash).await.unwrap_err(),
            DomainError::Conflict
        ));
    }

    #[tokio::test]
    async fn message_replay_returns_stored_row() {
        let repo = InMemoryConversationRepository::new();
        let conversation = Conversation {
            conversation_id: "c1".into(),
            kind: chorus_domain::conversations::ConversationKind::Direct,
            title: None,
            direct_key: Some("a:b".into()),
            created_by: "a".into(),
            last_message_id: None,
            last_message_at_ms: None,
            created_at_ms: 1,
            updated_at_ms: 1,
        };
        repo.create_conversation(
            &conversation,
            &[
                ConversationParticipant::new("c1", "a", 1),
                ConversationParticipant::new("c1", "b", 1),
            ],
        )
        .await
        .unwrap();

        let message = Message {
            conversation_id: "c1".into(),
            message_id: "m1".into(),
            sender_id: "a".into(),
            body: "hi".into(),
            mentions: vec!["b".into()],
            request_id: "r1".into(),
            created_at_ms: 5,
        };
        let first = repo.append_message(&message).await.unwrap();
        let replay = repo
            .append_message(&Message {
                message_id: "m2".into(),
                ..message
            })
            .await
            .unwrap();
        assert!(first.created);
        assert!(!replay.created);
        assert_eq!(replay.message.message_id, "m1");

        let receiver = repo.get_participant("c1", "b").await.unwrap().unwrap();
        assert_eq!(receiver.unread_count, 1);
        assert_eq!(receiver.mention_count, 1);
        let sender = repo.get_participant("c1", "a").await.unwrap().unwrap();
        assert_eq!(sender.unread_count, 0);
    }
}
