use std::collections::HashMap;
use std::sync::Arc;

use chorus_domain::DomainResult;
use chorus_domain::conversations::{
    Conversation, ConversationKind, ConversationParticipant, ConversationSummary, Message,
    MessageAppend, MessageCatchup,
};
use chorus_domain::error::DomainError;
use chorus_domain::feed::{FeedCursorKey, InteractionFlags};
use chorus_domain::notifications::{DedupeOutcome, Notification, NotificationKey, NotificationType};
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
use chorus_domain::util::format_ms_rfc3339;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use surrealdb::Surreal;
use surrealdb::engine::remote::ws::Client;

const RELATION_EXISTS: &str = "relation_exists";
const RELATION_MISSING: &str = "relation_missing";
const USERNAME_TAKEN: &str = "username_taken";
const ROW_MISSING: &str = "row_missing";

const USER_FIELDS: &str = "user_id, username, display_name, bio, is_private, followers_count, \
    following_count, posts_count, is_online, last_seen_at_ms, created_at_ms, updated_at_ms, \
    deleted_at_ms";
const POST_FIELDS: &str = "post_id, author_id, body, parent_post_id, is_pinned, like_count, \
    repost_count, reply_count, created_at_ms, updated_at_ms, deleted_at_ms";
const EDGE_FIELDS: &str = "edge_id, kind, actor_id, target_id, created_at_ms";
const NOTIFICATION_FIELDS: &str = "notification_id, recipient_id, actor_id, notification_type, \
    post_id, is_read, created_at_ms, read_at_ms, dedupe_key";
const CONVERSATION_FIELDS: &str = "conversation_id, kind, title, direct_key, created_by, \
    last_message_id, last_message_at_ms, created_at_ms, updated_at_ms";
const PARTICIPANT_FIELDS: &str = "conversation_id, user_id, is_pinned, is_muted, muted_until_ms, \
    last_read_at_ms, left_at_ms, joined_at_ms, unread_count, mention_count";
const MESSAGE_FIELDS: &str =
    "conversation_id, message_id, sender_id, body, mentions, request_id, created_at_ms";

fn map_surreal_error(err: surrealdb::Error) -> DomainError {
    classify_error_message(&err.to_string())
}

fn classify_error_message(message: &str) -> DomainError {
    let message = message.to_lowercase();
    if message.contains(RELATION_MISSING) || message.contains(ROW_MISSING) {
        return DomainError::NotFound;
    }
    if message.contains(RELATION_EXISTS)
        || message.contains(USERNAME_TAKEN)
        || message.contains("already exists")
        || message.contains("already contains")
        || message.contains("duplicate")
        || message.contains("unique")
        || message.contains("conflict")
    {
        return DomainError::Conflict;
    }
    DomainError::Storage(format!("surreal query failed: {message}"))
}

/// Inside a failed transaction every statement reports an error, most of them
/// a generic "not executed" one. The specific error wins.
fn surface_statement_errors(
    response: &mut surrealdb::IndexedResults,
    statements: usize,
) -> DomainResult<()> {
    let mut failure: Option<DomainError> = None;
    for index in 0..statements {
        let Err(err) = response.take::<surrealdb::types::Value>(index) else {
            continue;
        };
        let mapped = map_surreal_error(err);
        failure = match (failure, mapped) {
            (None, mapped) => Some(mapped),
            (Some(DomainError::Storage(_)), mapped) => Some(mapped),
            (Some(existing), _) => Some(existing),
        };
    }
    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn take_rows<T: DeserializeOwned>(
    response: &mut surrealdb::IndexedResults,
    index: usize,
    label: &str,
) -> DomainResult<Vec<T>> {
    let rows: Vec<Value> = response
        .take(index)
        .map_err(|err| DomainError::Storage(format!("invalid query result: {err}")))?;
    rows.into_iter()
        .map(|row| {
            serde_json::from_value::<T>(row)
                .map_err(|err| DomainError::Storage(format!("invalid {label} row: {err}")))
        })
        .collect()
}

fn counter_updates(kind: RelationKind, delta: &str) -> String {
    match kind {
        RelationKind::Follow => format!(
            "UPDATE user_profile SET following_count {delta}= 1 WHERE user_id = $actor_id RETURN NONE;\n\
             UPDATE user_profile SET followers_count {delta}= 1 WHERE user_id = $target_id RETURN NONE;"
        ),
        RelationKind::Like => format!(
            "UPDATE post SET like_count {delta}= 1 WHERE post_id = $target_id RETURN NONE;"
        ),
        RelationKind::Repost => format!(
            "UPDATE post SET repost_count {delta}= 1 WHERE post_id = $target_id RETURN NONE;"
        ),
        RelationKind::FollowRequest
        | RelationKind::Bookmark
        | RelationKind::Block
        | RelationKind::Mute => String::new(),
    }
}

fn statement_count(query: &str) -> usize {
    query
        .split(";\n")
        .map(str::trim)
        .filter(|statement| {
            !statement.is_empty()
                && !statement.starts_with("BEGIN")
                && !statement.starts_with("COMMIT")
        })
        .count()
}

#[derive(Debug, Deserialize)]
struct UserRow {
    user_id: String,
    username: String,
    display_name: String,
    bio: Option<String>,
    is_private: bool,
    followers_count: i64,
    following_count: i64,
    posts_count: i64,
    #[serde(default)]
    is_online: bool,
    last_seen_at_ms: Option<i64>,
    created_at_ms: i64,
    updated_at_ms: i64,
    deleted_at_ms: Option<i64>,
}

impl From<UserRow> for UserProfile {
    fn from(row: UserRow) -> Self {
        Self {
            user_id: row.user_id,
            username: row.username,
            display_name: row.display_name,
            bio: row.bio,
            is_private: row.is_private,
            followers_count: row.followers_count,
            following_count: row.following_count,
            posts_count: row.posts_count,
            is_online: row.is_online,
            last_seen_at_ms: row.last_seen_at_ms,
            created_at_ms: row.created_at_ms,
            updated_at_ms: row.updated_at_ms,
            deleted_at_ms: row.deleted_at_ms,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PostRow {
    post_id: String,
    author_id: String,
    body: String,
    parent_post_id: Option<String>,
    is_pinned: bool,
    like_count: i64,
    repost_count: i64,
    reply_count: i64,
    created_at_ms: i64,
    updated_at_ms: i64,
    deleted_at_ms: Option<i64>,
}

impl From<PostRow> for Post {
    fn from(row: PostRow) -> Self {
        Self {
            post_id: row.post_id,
            author_id: row.author_id,
            body: row.body,
            parent_post_id: row.parent_post_id,
            is_pinned: row.is_pinned,
            like_count: row.like_count,
            repost_count: row.repost_count,
            reply_count: row.reply_count,
            created_at_ms: row.created_at_ms,
            updated_at_ms: row.updated_at_ms,
            deleted_at_ms: row.deleted_at_ms,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EdgeRow {
    edge_id: String,
    kind: String,
    actor_id: String,
    target_id: String,
    created_at_ms: i64,
}

impl TryFrom<EdgeRow> for RelationEdge {
    type Error = DomainError;

    fn try_from(row: EdgeRow) -> Result<Self, Self::Error> {
        let kind = RelationKind::parse(&row.kind)
            .ok_or_else(|| DomainError::Storage(format!("unknown relation kind {}", row.kind)))?;
        Ok(Self {
            edge_id: row.edge_id,
            kind,
            actor_id: row.actor_id,
            target_id: row.target_id,
            created_at_ms: row.created_at_ms,
        })
    }
}

#[derive(Debug, Deserialize)]
struct NotificationRow {
    notification_id: String,
    recipient_id: String,
    actor_id: String,
    notification_type: String,
    post_id: Option<String>,
    is_read: bool,
    created_at_ms: i64,
    read_at_ms: Option<i64>,
    dedupe_key: String,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = DomainError;

    fn try_from(row: NotificationRow) -> Result<Self, Self::Error> {
        let notification_type = NotificationType::parse(&row.notification_type).ok_or_else(|| {
            DomainError::Storage(format!(
                "unknown notification type {}",
                row.notification_type
            ))
        })?;
        Ok(Self {
            notification_id: row.notification_id,
            recipient_id: row.recipient_id,
            actor_id: row.actor_id,
            notification_type,
            post_id: row.post_id,
            is_read: row.is_read,
            created_at_ms: row.created_at_ms,
            read_at_ms: row.read_at_ms,
            dedupe_key: row.dedupe_key,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ConversationRow {
    conversation_id: String,
    kind: String,
    title: Option<String>,
    direct_key: Option<String>,
    created_by: String,
    last_message_id: Option<String>,
    last_message_at_ms: Option<i64>,
    created_at_ms: i64,
    updated_at_ms: i64,
}

impl TryFrom<ConversationRow> for Conversation {
    type Error = DomainError;

    fn try_from(row: ConversationRow) -> Result<Self, Self::Error> {
        let kind = match row.kind.as_str() {
            "direct" => ConversationKind::Direct,
            "group" => ConversationKind::Group,
            other => {
                return Err(DomainError::Storage(format!(
                    "unknown conversation kind {other}"
                )));
            }
        };
        Ok(Self {
            conversation_id: row.conversation_id,
            kind,
            title: row.title,
            direct_key: row.direct_key,
            created_by: row.created_by,
            last_message_id: row.last_message_id,
            last_message_at_ms: row.last_message_at_ms,
            created_at_ms: row.created_at_ms,
            updated_at_ms: row.updated_at_ms,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ParticipantRow {
    conversation_id: String,
    user_id: String,
    is_pinned: bool,
    is_muted: bool,
    muted_until_ms: Option<i64>,
    last_read_at_ms: Option<i64>,
    left_at_ms: Option<i64>,
    joined_at_ms: i64,
    unread_count: i64,
    mention_count: i64,
}

impl From<ParticipantRow> for ConversationParticipant {
    fn from(row: ParticipantRow) -> Self {
        Self {
            conversation_id: row.conversation_id,
            user_id: row.user_id,
            is_pinned: row.is_pinned,
            is_muted: row.is_muted,
            muted_until_ms: row.muted_until_ms,
            last_read_at_ms: row.last_read_at_ms,
            left_at_ms: row.left_at_ms,
            joined_at_ms: row.joined_at_ms,
            unread_count: row.unread_count,
            mention_count: row.mention_count,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessageRow {
    conversation_id: String,
    message_id: String,
    sender_id: String,
    body: String,
    #[serde(default)]
    mentions: Vec<String>,
    request_id: String,
    created_at_ms: i64,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Self {
            conversation_id: row.conversation_id,
            message_id: row.message_id,
            sender_id: row.sender_id,
            body: row.body,
            mentions: row.mentions,
            request_id: row.request_id,
            created_at_ms: row.created_at_ms,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CountRow {
    total: i64,
}

/// Users, posts and relation edges. Toggles run as SurrealQL transactions so
/// the edge row and its counters commit together.
#[derive(Clone)]
pub struct SurrealSocialStore {
    client: Arc<Surreal<Client>>,
}

impl SurrealSocialStore {
    pub fn with_client(client: Arc<Surreal<Client>>) -> Self {
        Self { client }
    }

    async fn fetch_user(&self, user_id: &str) -> DomainResult<Option<UserProfile>> {
        let mut response = self
            .client
            .query(format!(
                "SELECT {USER_FIELDS} FROM user_profile WHERE user_id = $user_id LIMIT 1"
            ))
            .bind(("user_id", user_id.to_string()))
            .await
            .map_err(map_surreal_error)?;
        let mut rows: Vec<UserRow> = take_rows(&mut response, 0, "user_profile")?;
        Ok(rows.pop().map(UserProfile::from))
    }

    async fn fetch_post(&self, post_id: &str) -> DomainResult<Option<Post>> {
        let mut response = self
            .client
            .query(format!(
                "SELECT {POST_FIELDS} FROM post WHERE post_id = $post_id LIMIT 1"
            ))
            .bind(("post_id", post_id.to_string()))
            .await
            .map_err(map_surreal_error)?;
        let mut rows: Vec<PostRow> = take_rows(&mut response, 0, "post")?;
        Ok(rows.pop().map(Post::from))
    }

    async fn snapshot(
        &self,
        kind: RelationKind,
        actor_id: &str,
        target_id: &str,
    ) -> DomainResult<CounterSnapshot> {
        if kind.targets_post() {
            let post = self
                .fetch_post(target_id)
                .await?
                .ok_or(DomainError::NotFound)?;
            return Ok(CounterSnapshot::Post(PostCounters::from(&post)));
        }
        let actor = self
            .fetch_user(actor_id)
            .await?
            .ok_or(DomainError::NotFound)?;
        let target = self
            .fetch_user(target_id)
            .await?
            .ok_or(DomainError::NotFound)?;
        Ok(CounterSnapshot::Users {
            actor: actor.counters(),
            target: target.counters(),
        })
    }

    async fn run_transaction(
        &self,
        query: String,
        binds: Vec<(&'static str, Value)>,
    ) -> DomainResult<()> {
        let statements = statement_count(&query);
        let mut pending = self.client.query(query);
        for (name, value) in binds {
            pending = pending.bind((name, value));
        }
        let mut response = pending.await.map_err(map_surreal_error)?;
        surface_statement_errors(&mut response, statements)
    }
}

impl SocialGraphRepository for SurrealSocialStore {
    fn upsert_user(&self, profile: &UserProfile) -> BoxFuture<'_, DomainResult<UserProfile>> {
        let profile = profile.clone();
        Box::pin(async move {
            let query = format!(
                "BEGIN TRANSACTION;\n\
                 IF (SELECT VALUE user_id FROM user_profile WHERE username = $username AND user_id != $user_id LIMIT 1)[0] != NONE {{ THROW \"{USERNAME_TAKEN}\" }};\n\
                 IF (SELECT VALUE user_id FROM user_profile WHERE user_id = $user_id LIMIT 1)[0] = NONE {{ \
                     CREATE user_profile SET user_id = $user_id, username = $username, display_name = $display_name, \
                         bio = $bio, is_private = $is_private, followers_count = 0, following_count = 0, posts_count = 0, \
                         is_online = false, last_seen_at_ms = NONE, created_at_ms = $created_at_ms, \
                         created_at = <datetime>$created_at, updated_at_ms = $updated_at_ms, deleted_at_ms = NONE RETURN NONE \
                 }} ELSE {{ \
                     UPDATE user_profile SET username = $username, display_name = $display_name, bio = $bio, \
                         is_private = $is_private, updated_at_ms = $updated_at_ms, deleted_at_ms = NONE \
                         WHERE user_id = $user_id RETURN NONE \
                 }};\n\
                 COMMIT TRANSACTION;"
            );
            self.run_transaction(
                query,
                vec![
                    ("user_id", Value::from(profile.user_id.clone())),
                    ("username", Value::from(profile.username.clone())),
                    ("display_name", Value::from(profile.display_name.clone())),
                    ("bio", profile.bio.clone().map_or(Value::Null, Value::from)),
                    ("is_private", Value::from(profile.is_private)),
                    ("created_at_ms", Value::from(profile.created_at_ms)),
                    ("created_at", Value::from(format_ms_rfc3339(profile.created_at_ms))),
                    ("updated_at_ms", Value::from(profile.updated_at_ms)),
                ],
            )
            .await?;
            self.fetch_user(&profile.user_id)
                .await?
                .ok_or(DomainError::NotFound)
        })
    }

    fn get_user(&self, user_id: &str) -> BoxFuture<'_, DomainResult<Option<UserProfile>>> {
        let user_id = user_id.to_string();
        Box::pin(async move { self.fetch_user(&user_id).await })
    }

    fn find_users_by_username(
        &self,
        usernames: &[String],
    ) -> BoxFuture<'_, DomainResult<Vec<UserProfile>>> {
        let usernames = usernames.to_vec();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(format!(
                    "SELECT {USER_FIELDS} FROM user_profile WHERE username IN $usernames ORDER BY username ASC"
                ))
                .bind(("usernames", usernames))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<UserRow> = take_rows(&mut response, 0, "user_profile")?;
            Ok(rows.into_iter().map(UserProfile::from).collect())
        })
    }

    fn user_counters(&self, user_id: &str) -> BoxFuture<'_, DomainResult<Option<UserCounters>>> {
        let user_id = user_id.to_string();
        Box::pin(async move {
            Ok(self
                .fetch_user(&user_id)
                .await?
                .map(|profile| profile.counters()))
        })
    }

    fn set_presence(
        &self,
        user_id: &str,
        is_online: bool,
        seen_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<()>> {
        let user_id = user_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            client
                .query(
                    "UPDATE user_profile SET is_online = $is_online, last_seen_at_ms = $seen_at_ms \
                     WHERE user_id = $user_id RETURN NONE",
                )
                .bind(("user_id", user_id))
                .bind(("is_online", is_online))
                .bind(("seen_at_ms", seen_at_ms))
                .await
                .map_err(map_surreal_error)?;
            Ok(())
        })
    }

    fn create_post(&self, post: &Post) -> BoxFuture<'_, DomainResult<Post>> {
        let post = post.clone();
        Box::pin(async move {
            let query = format!(
                "BEGIN TRANSACTION;\n\
                 IF $parent_post_id AND (SELECT VALUE post_id FROM post WHERE post_id = $parent_post_id AND !deleted_at_ms LIMIT 1)[0] = NONE {{ THROW \"{ROW_MISSING}\" }};\n\
                 CREATE post SET post_id = $post_id, author_id = $author_id, body = $body, \
                     parent_post_id = $parent_post_id, is_pinned = $is_pinned, like_count = 0, repost_count = 0, \
                     reply_count = 0, created_at_ms = $created_at_ms, created_at = <datetime>$created_at, \
                     updated_at_ms = $created_at_ms, deleted_at_ms = NONE RETURN NONE;\n\
                 UPDATE user_profile SET posts_count += 1 WHERE user_id = $author_id RETURN NONE;\n\
                 IF $parent_post_id {{ UPDATE post SET reply_count += 1 WHERE post_id = $parent_post_id RETURN NONE }};\n\
                 COMMIT TRANSACTION;"
            );
            self.run_transaction(
                query,
                vec![
                    ("post_id", Value::from(post.post_id.clone())),
                    ("author_id", Value::from(post.author_id.clone())),
                    ("body", Value::from(post.body.clone())),
                    (
                        "parent_post_id",
                        post.parent_post_id.clone().map_or(Value::Null, Value::from),
                    ),
                    ("is_pinned", Value::from(post.is_pinned)),
                    ("created_at_ms", Value::from(post.created_at_ms)),
                    ("created_at", Value::from(format_ms_rfc3339(post.created_at_ms))),
                ],
            )
            .await?;
            self.fetch_post(&post.post_id)
                .await?
                .ok_or(DomainError::NotFound)
        })
    }

    fn get_post(&self, post_id: &str) -> BoxFuture<'_, DomainResult<Option<Post>>> {
        let post_id = post_id.to_string();
        Box::pin(async move { self.fetch_post(&post_id).await })
    }

    fn soft_delete_post(
        &self,
        post_id: &str,
        deleted_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<Option<Post>>> {
        let post_id = post_id.to_string();
        Box::pin(async move {
            let query = format!(
                "BEGIN TRANSACTION;\n\
                 LET $target = (SELECT author_id, parent_post_id FROM post WHERE post_id = $post_id AND !deleted_at_ms LIMIT 1)[0];\n\
                 IF $target = NONE {{ THROW \"{ROW_MISSING}\" }};\n\
                 UPDATE post SET deleted_at_ms = $deleted_at_ms, updated_at_ms = $deleted_at_ms WHERE post_id = $post_id RETURN NONE;\n\
                 UPDATE user_profile SET posts_count -= 1 WHERE user_id = $target.author_id RETURN NONE;\n\
                 IF $target.parent_post_id {{ UPDATE post SET reply_count -= 1 WHERE post_id = $target.parent_post_id RETURN NONE }};\n\
                 COMMIT TRANSACTION;"
            );
            match self
                .run_transaction(
                    query,
                    vec![
                        ("post_id", Value::from(post_id.clone())),
                        ("deleted_at_ms", Value::from(deleted_at_ms)),
                    ],
                )
                .await
            {
                Ok(()) => self.fetch_post(&post_id).await,
                Err(DomainError::NotFound) => Ok(None),
                Err(err) => Err(err),
            }
        })
    }

    fn get_edge(
        &self,
        kind: RelationKind,
        actor_id: &str,
        target_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<RelationEdge>>> {
        let actor_id = actor_id.to_string();
        let target_id = target_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(format!(
                    "SELECT {EDGE_FIELDS} FROM relation_edge \
                     WHERE kind = $kind AND actor_id = $actor_id AND target_id = $target_id LIMIT 1"
                ))
                .bind(("kind", kind.as_str().to_string()))
                .bind(("actor_id", actor_id))
                .bind(("target_id", target_id))
                .await
                .map_err(map_surreal_error)?;
            let mut rows: Vec<EdgeRow> = take_rows(&mut response, 0, "relation_edge")?;
            rows.pop().map(RelationEdge::try_from).transpose()
        })
    }

    fn insert_edge(&self, edge: &RelationEdge) -> BoxFuture<'_, DomainResult<CounterSnapshot>> {
        let edge = edge.clone();
        Box::pin(async move {
            let mut query = format!(
                "BEGIN TRANSACTION;\n\
                 IF (SELECT VALUE edge_id FROM relation_edge WHERE kind = $kind AND actor_id = $actor_id AND target_id = $target_id LIMIT 1)[0] != NONE {{ THROW \"{RELATION_EXISTS}\" }};\n\
                 CREATE relation_edge SET edge_id = $edge_id, kind = $kind, actor_id = $actor_id, \
                     target_id = $target_id, created_at_ms = $created_at_ms, created_at = <datetime>$created_at RETURN NONE;\n\
                 {}\n",
                counter_updates(edge.kind, "+")
            );
            if edge.kind == RelationKind::Block {
                for (from, to) in [("$actor_id", "$target_id"), ("$target_id", "$actor_id")] {
                    query.push_str(&format!(
                        "IF array::len((DELETE relation_edge WHERE kind = 'follow' AND actor_id = {from} AND target_id = {to} RETURN BEFORE)) > 0 {{ \
                             UPDATE user_profile SET following_count -= 1 WHERE user_id = {from} RETURN NONE; \
                             UPDATE user_profile SET followers_count -= 1 WHERE user_id = {to} RETURN NONE; \
                         }};\n\
                         DELETE relation_edge WHERE kind = 'follow_request' AND actor_id = {from} AND target_id = {to} RETURN NONE;\n"
                    ));
                }
            }
            query.push_str("COMMIT TRANSACTION;");

            self.run_transaction(
                query,
                vec![
                    ("edge_id", Value::from(edge.edge_id.clone())),
                    ("kind", Value::from(edge.kind.as_str())),
                    ("actor_id", Value::from(edge.actor_id.clone())),
                    ("target_id", Value::from(edge.target_id.clone())),
                    ("created_at_ms", Value::from(edge.created_at_ms)),
                    ("created_at", Value::from(format_ms_rfc3339(edge.created_at_ms))),
                ],
            )
            .await?;
            self.snapshot(edge.kind, &edge.actor_id, &edge.target_id)
                .await
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
        Box::pin(async move {
            let query = format!(
                "BEGIN TRANSACTION;\n\
                 IF array::len((DELETE relation_edge WHERE kind = $kind AND actor_id = $actor_id AND target_id = $target_id RETURN BEFORE)) = 0 {{ THROW \"{RELATION_MISSING}\" }};\n\
                 {}\n\
                 COMMIT TRANSACTION;",
                counter_updates(kind, "-")
            );
            let outcome = self
                .run_transaction(
                    query,
                    vec![
                        ("kind", Value::from(kind.as_str())),
                        ("actor_id", Value::from(actor_id.clone())),
                        ("target_id", Value::from(target_id.clone())),
                    ],
                )
                .await;
            match outcome {
                Ok(()) => self.snapshot(kind, &actor_id, &target_id).await.map(Some),
                Err(DomainError::NotFound) => Ok(None),
                Err(err) => Err(err),
            }
        })
    }

    fn accept_follow_request(
        &self,
        follow: &RelationEdge,
    ) -> BoxFuture<'_, DomainResult<Option<CounterSnapshot>>> {
        let follow = follow.clone();
        Box::pin(async move {
            let query = format!(
                "BEGIN TRANSACTION;\n\
                 IF array::len((DELETE relation_edge WHERE kind = 'follow_request' AND actor_id = $actor_id AND target_id = $target_id RETURN BEFORE)) = 0 {{ THROW \"{RELATION_MISSING}\" }};\n\
                 IF (SELECT VALUE edge_id FROM relation_edge WHERE kind = 'follow' AND actor_id = $actor_id AND target_id = $target_id LIMIT 1)[0] = NONE {{ \
                     CREATE relation_edge SET edge_id = $edge_id, kind = 'follow', actor_id = $actor_id, \
                         target_id = $target_id, created_at_ms = $created_at_ms, created_at = <datetime>$created_at RETURN NONE; \
                     UPDATE user_profile SET following_count += 1 WHERE user_id = $actor_id RETURN NONE; \
                     UPDATE user_profile SET followers_count += 1 WHERE user_id = $target_id RETURN NONE; \
                 }};\n\
                 COMMIT TRANSACTION;"
            );
            let outcome = self
                .run_transaction(
                    query,
                    vec![
                        ("edge_id", Value::from(follow.edge_id.clone())),
                        ("actor_id", Value::from(follow.actor_id.clone())),
                        ("target_id", Value::from(follow.target_id.clone())),
                        ("created_at_ms", Value::from(follow.created_at_ms)),
                        ("created_at", Value::from(format_ms_rfc3339(follow.created_at_ms))),
                    ],
                )
                .await;
            match outcome {
                Ok(()) => self
                    .snapshot(RelationKind::Follow, &follow.actor_id, &follow.target_id)
                    .await
                    .map(Some),
                Err(DomainError::NotFound) => Ok(None),
                Err(err) => Err(err),
            }
        })
    }
}

impl FeedRepository for SurrealSocialStore {
    fn get_post(&self, post_id: &str) -> BoxFuture<'_, DomainResult<Option<Post>>> {
        let post_id = post_id.to_string();
        Box::pin(async move { self.fetch_post(&post_id).await })
    }

    fn list_following_ids(&self, user_id: &str) -> BoxFuture<'_, DomainResult<Vec<String>>> {
        let user_id = user_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(
                    "SELECT VALUE target_id FROM relation_edge WHERE kind = 'follow' AND actor_id = $user_id",
                )
                .bind(("user_id", user_id))
                .await
                .map_err(map_surreal_error)?;
            take_rows(&mut response, 0, "following id")
        })
    }

    fn list_hidden_author_ids(
        &self,
        viewer_id: &str,
    ) -> BoxFuture<'_, DomainResult<Vec<String>>> {
        let viewer_id = viewer_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(
                    "SELECT VALUE target_id FROM relation_edge WHERE kind IN ['block', 'mute'] AND actor_id = $viewer_id;\n\
                     SELECT VALUE actor_id FROM relation_edge WHERE kind = 'block' AND target_id = $viewer_id;",
                )
                .bind(("viewer_id", viewer_id))
                .await
                .map_err(map_surreal_error)?;
            let mut hidden: Vec<String> = take_rows(&mut response, 0, "hidden author id")?;
            hidden.extend(take_rows::<String>(&mut response, 1, "blocking author id")?);
            hidden.sort();
            hidden.dedup();
            Ok(hidden)
        })
    }

    fn list_posts(&self, query: &FeedRepositoryQuery) -> BoxFuture<'_, DomainResult<Vec<Post>>> {
        let query = query.clone();
        let client = self.client.clone();
        Box::pin(async move {
            let mut statement = format!("SELECT {POST_FIELDS} FROM post WHERE !deleted_at_ms");
            if query.author_ids.is_some() {
                statement.push_str(" AND author_id IN $author_ids");
            }
            if !query.excluded_author_ids.is_empty() {
                statement.push_str(" AND author_id NOTINSIDE $excluded_author_ids");
            }
            if let Some(cursor) = query.cursor.as_ref() {
                statement.push_str(&cursor_condition(cursor));
            }
            statement.push_str(
                " ORDER BY is_pinned DESC, created_at_ms DESC, post_id DESC LIMIT $limit",
            );

            let cursor = query.cursor.unwrap_or(FeedCursorKey {
                is_pinned: false,
                created_at_ms: 0,
                post_id: String::new(),
            });
            let mut response = client
                .query(statement)
                .bind(("author_ids", query.author_ids.unwrap_or_default()))
                .bind(("excluded_author_ids", query.excluded_author_ids))
                .bind(("cursor_created_at_ms", cursor.created_at_ms))
                .bind(("cursor_post_id", cursor.post_id))
                .bind(("limit", query.limit as i64))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<PostRow> = take_rows(&mut response, 0, "post")?;
            Ok(rows.into_iter().map(Post::from).collect())
        })
    }

    fn interaction_flags(
        &self,
        viewer_id: &str,
        post_ids: &[String],
    ) -> BoxFuture<'_, DomainResult<HashMap<String, InteractionFlags>>> {
        let viewer_id = viewer_id.to_string();
        let post_ids = post_ids.to_vec();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(
                    "SELECT kind, target_id FROM relation_edge \
                     WHERE actor_id = $viewer_id AND kind IN ['like', 'repost', 'bookmark'] \
                     AND target_id IN $post_ids",
                )
                .bind(("viewer_id", viewer_id))
                .bind(("post_ids", post_ids.clone()))
                .await
                .map_err(map_surreal_error)?;

            #[derive(Deserialize)]
            struct FlagRow {
                kind: String,
                target_id: String,
            }

            let rows: Vec<FlagRow> = take_rows(&mut response, 0, "interaction")?;
            let mut flags: HashMap<String, InteractionFlags> = post_ids
                .into_iter()
                .map(|post_id| (post_id, InteractionFlags::default()))
                .collect();
            for row in rows {
                let Some(entry) = flags.get_mut(&row.target_id) else {
                    continue;
                };
                match RelationKind::parse(&row.kind) {
                    Some(RelationKind::Like) => entry.is_liked = true,
                    Some(RelationKind::Repost) => entry.is_reposted = true,
                    Some(RelationKind::Bookmark) => entry.is_bookmarked = true,
                    _ => {}
                }
            }
            Ok(flags)
        })
    }
}

/// Rows strictly after the cursor in `is_pinned DESC, created_at_ms DESC,
/// post_id DESC` order.
fn cursor_condition(cursor: &FeedCursorKey) -> String {
    let tail = "(created_at_ms < $cursor_created_at_ms OR \
                (created_at_ms = $cursor_created_at_ms AND post_id < $cursor_post_id))";
    if cursor.is_pinned {
        format!(" AND (is_pinned = false OR (is_pinned = true AND {tail}))")
    } else {
        format!(" AND is_pinned = false AND {tail}")
    }
}

#[derive(Clone)]
pub struct SurrealNotificationRepository {
    client: Arc<Surreal<Client>>,
}

impl SurrealNotificationRepository {
    pub fn with_client(client: Arc<Surreal<Client>>) -> Self {
        Self { client }
    }

    fn decode(rows: Vec<NotificationRow>) -> DomainResult<Vec<Notification>> {
        rows.into_iter().map(Notification::try_from).collect()
    }
}

impl NotificationRepository for SurrealNotificationRepository {
    fn create_deduplicated(
        &self,
        notification: &Notification,
        window_start_ms: i64,
    ) -> BoxFuture<'_, DomainResult<DedupeOutcome>> {
        let notification = notification.clone();
        let client = self.client.clone();
        Box::pin(async move {
            let query = format!(
                "BEGIN TRANSACTION;\n\
                 IF (SELECT VALUE notification_id FROM notification WHERE dedupe_key = $dedupe_key AND created_at_ms >= $window_start_ms LIMIT 1)[0] = NONE {{ \
                     CREATE notification SET notification_id = $notification_id, recipient_id = $recipient_id, \
                         actor_id = $actor_id, notification_type = $notification_type, post_id = $post_id, \
                         is_read = false, created_at_ms = $created_at_ms, created_at = <datetime>$created_at, \
                         read_at_ms = NONE, dedupe_key = $dedupe_key RETURN NONE \
                 }};\n\
                 SELECT {NOTIFICATION_FIELDS} FROM notification WHERE dedupe_key = $dedupe_key \
                     AND created_at_ms >= $window_start_ms ORDER BY created_at_ms DESC LIMIT 1;\n\
                 COMMIT TRANSACTION;"
            );
            let statements = statement_count(&query);
            let mut response = client
                .query(query)
                .bind(("notification_id", notification.notification_id.clone()))
                .bind(("recipient_id", notification.recipient_id.clone()))
                .bind(("actor_id", notification.actor_id.clone()))
                .bind((
                    "notification_type",
                    notification.notification_type.as_str().to_string(),
                ))
                .bind(("post_id", notification.post_id.clone()))
                .bind(("created_at_ms", notification.created_at_ms))
                .bind(("created_at", format_ms_rfc3339(notification.created_at_ms)))
                .bind(("dedupe_key", notification.dedupe_key.clone()))
                .bind(("window_start_ms", window_start_ms))
                .await
                .map_err(map_surreal_error)?;
            surface_statement_errors(&mut response, statements - 1)?;
            let rows: Vec<NotificationRow> =
                take_rows(&mut response, statements - 1, "notification")?;
            let stored = Self::decode(rows)?
                .pop()
                .ok_or_else(|| DomainError::Storage("dedup insert returned no row".into()))?;
            if stored.notification_id == notification.notification_id {
                Ok(DedupeOutcome::Created(stored))
            } else {
                Ok(DedupeOutcome::Existing(stored))
            }
        })
    }

    fn delete_matching(&self, key: &NotificationKey) -> BoxFuture<'_, DomainResult<usize>> {
        let dedupe_key = key.dedupe_key();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query("DELETE notification WHERE dedupe_key = $dedupe_key RETURN BEFORE")
                .bind(("dedupe_key", dedupe_key))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response
                .take(0)
                .map_err(|err| DomainError::Storage(format!("invalid query result: {err}")))?;
            Ok(rows.len())
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
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(
                    "UPDATE notification SET is_read = true, read_at_ms = $read_at_ms \
                     WHERE notification_id = $notification_id AND recipient_id = $recipient_id \
                     AND is_read = false RETURN notification_id",
                )
                .bind(("notification_id", notification_id))
                .bind(("recipient_id", recipient_id))
                .bind(("read_at_ms", read_at_ms))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response
                .take(0)
                .map_err(|err| DomainError::Storage(format!("invalid query result: {err}")))?;
            Ok(!rows.is_empty())
        })
    }

    fn mark_all_read(
        &self,
        recipient_id: &str,
        read_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<usize>> {
        let recipient_id = recipient_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(
                    "UPDATE notification SET is_read = true, read_at_ms = $read_at_ms \
                     WHERE recipient_id = $recipient_id AND is_read = false RETURN notification_id",
                )
                .bind(("recipient_id", recipient_id))
                .bind(("read_at_ms", read_at_ms))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response
                .take(0)
                .map_err(|err| DomainError::Storage(format!("invalid query result: {err}")))?;
            Ok(rows.len())
        })
    }

    fn unread_count(&self, recipient_id: &str) -> BoxFuture<'_, DomainResult<usize>> {
        let recipient_id = recipient_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(
                    "SELECT count() AS total FROM notification \
                     WHERE recipient_id = $recipient_id AND is_read = false GROUP ALL",
                )
                .bind(("recipient_id", recipient_id))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<CountRow> = take_rows(&mut response, 0, "count")?;
            Ok(rows
                .first()
                .map_or(0, |row| usize::try_from(row.total).unwrap_or(0)))
        })
    }

    fn list_notifications(
        &self,
        query: &NotificationRepositoryListQuery,
    ) -> BoxFuture<'_, DomainResult<Vec<Notification>>> {
        let query = query.clone();
        let client = self.client.clone();
        Box::pin(async move {
            let mut statement = format!(
                "SELECT {NOTIFICATION_FIELDS} FROM notification WHERE recipient_id = $recipient_id"
            );
            if !query.include_read {
                statement.push_str(" AND is_read = false");
            }
            if query.cursor_created_at_ms.is_some() {
                statement.push_str(
                    " AND (created_at_ms < $cursor_created_at_ms OR \
                     (created_at_ms = $cursor_created_at_ms AND notification_id < $cursor_notification_id))",
                );
            }
            statement.push_str(" ORDER BY created_at_ms DESC, notification_id DESC LIMIT $limit");

            let mut response = client
                .query(statement)
                .bind(("recipient_id", query.recipient_id))
                .bind(("cursor_created_at_ms", query.cursor_created_at_ms.unwrap_or(0)))
                .bind((
                    "cursor_notification_id",
                    query.cursor_notification_id.unwrap_or_default(),
                ))
                .bind(("limit", query.limit as i64))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<NotificationRow> = take_rows(&mut response, 0, "notification")?;
            Self::decode(rows)
        })
    }
}

#[derive(Clone)]
pub struct SurrealConversationRepository {
    client: Arc<Surreal<Client>>,
}

impl SurrealConversationRepository {
    pub fn with_client(client: Arc<Surreal<Client>>) -> Self {
        Self { client }
    }

    async fn fetch_conversation(&self, conversation_id: &str) -> DomainResult<Option<Conversation>> {
        let mut response = self
            .client
            .query(format!(
                "SELECT {CONVERSATION_FIELDS} FROM conversation WHERE conversation_id = $conversation_id LIMIT 1"
            ))
            .bind(("conversation_id", conversation_id.to_string()))
            .await
            .map_err(map_surreal_error)?;
        let mut rows: Vec<ConversationRow> = take_rows(&mut response, 0, "conversation")?;
        rows.pop().map(Conversation::try_from).transpose()
    }

    async fn fetch_participants(
        &self,
        conversation_id: &str,
    ) -> DomainResult<Vec<ConversationParticipant>> {
        let mut response = self
            .client
            .query(format!(
                "SELECT {PARTICIPANT_FIELDS} FROM conversation_participant \
                 WHERE conversation_id = $conversation_id ORDER BY joined_at_ms ASC, user_id ASC"
            ))
            .bind(("conversation_id", conversation_id.to_string()))
            .await
            .map_err(map_surreal_error)?;
        let rows: Vec<ParticipantRow> = take_rows(&mut response, 0, "conversation_participant")?;
        Ok(rows.into_iter().map(ConversationParticipant::from).collect())
    }

    async fn fetch_participant(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> DomainResult<Option<ConversationParticipant>> {
        let mut response = self
            .client
            .query(format!(
                "SELECT {PARTICIPANT_FIELDS} FROM conversation_participant \
                 WHERE conversation_id = $conversation_id AND user_id = $user_id LIMIT 1"
            ))
            .bind(("conversation_id", conversation_id.to_string()))
            .bind(("user_id", user_id.to_string()))
            .await
            .map_err(map_surreal_error)?;
        let mut rows: Vec<ParticipantRow> =
            take_rows(&mut response, 0, "conversation_participant")?;
        Ok(rows.pop().map(ConversationParticipant::from))
    }

    async fn fetch_message(
        &self,
        conversation_id: &str,
        field: &str,
        value: &str,
    ) -> DomainResult<Option<Message>> {
        let mut response = self
            .client
            .query(format!(
                "SELECT {MESSAGE_FIELDS} FROM message \
                 WHERE conversation_id = $conversation_id AND {field} = $value LIMIT 1"
            ))
            .bind(("conversation_id", conversation_id.to_string()))
            .bind(("value", value.to_string()))
            .await
            .map_err(map_surreal_error)?;
        let mut rows: Vec<MessageRow> = take_rows(&mut response, 0, "message")?;
        Ok(rows.pop().map(Message::from))
    }

    async fn active_participant_ids(&self, conversation_id: &str) -> DomainResult<Vec<String>> {
        Ok(self
            .fetch_participants(conversation_id)
            .await?
            .into_iter()
            .filter(ConversationParticipant::is_active)
            .map(|participant| participant.user_id)
            .collect())
    }
}

impl ConversationRepository for SurrealConversationRepository {
    fn create_conversation(
        &self,
        conversation: &Conversation,
        participants: &[ConversationParticipant],
    ) -> BoxFuture<'_, DomainResult<Conversation>> {
        let conversation = conversation.clone();
        let participants = participants.to_vec();
        Box::pin(async move {
            let mut query = String::from("BEGIN TRANSACTION;\n");
            if conversation.direct_key.is_some() {
                query.push_str(
                    "CREATE direct_conversation SET direct_key = $direct_key, \
                     conversation_id = $conversation_id RETURN NONE;\n",
                );
            }
            query.push_str(
                "CREATE conversation SET conversation_id = $conversation_id, kind = $kind, title = $title, \
                 direct_key = $direct_key, created_by = $created_by, last_message_id = NONE, \
                 last_message_at_ms = NONE, created_at_ms = $created_at_ms, updated_at_ms = $created_at_ms RETURN NONE;\n\
                 FOR $user_id IN $participant_ids { \
                     CREATE conversation_participant SET conversation_id = $conversation_id, user_id = $user_id, \
                         is_pinned = false, is_muted = false, muted_until_ms = NONE, last_read_at_ms = NONE, \
                         left_at_ms = NONE, joined_at_ms = $created_at_ms, unread_count = 0, mention_count = 0 RETURN NONE; \
                 };\n\
                 COMMIT TRANSACTION;",
            );
            let statements = statement_count(&query);
            let kind = match conversation.kind {
                ConversationKind::Direct => "direct",
                ConversationKind::Group => "group",
            };
            let participant_ids: Vec<String> = participants
                .iter()
                .map(|participant| participant.user_id.clone())
                .collect();
            let mut response = self
                .client
                .query(query)
                .bind(("conversation_id", conversation.conversation_id.clone()))
                .bind(("kind", kind.to_string()))
                .bind(("title", conversation.title.clone()))
                .bind(("direct_key", conversation.direct_key.clone()))
                .bind(("created_by", conversation.created_by.clone()))
                .bind(("created_at_ms", conversation.created_at_ms))
                .bind(("participant_ids", participant_ids))
                .await
                .map_err(map_surreal_error)?;
            surface_statement_errors(&mut response, statements)?;
            Ok(conversation)
        })
    }

    fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<Conversation>>> {
        let conversation_id = conversation_id.to_string();
        Box::pin(async move { self.fetch_conversation(&conversation_id).await })
    }

    fn find_direct(&self, direct_key: &str) -> BoxFuture<'_, DomainResult<Option<Conversation>>> {
        let direct_key = direct_key.to_string();
        Box::pin(async move {
            let mut response = self
                .client
                .query(
                    "SELECT VALUE conversation_id FROM direct_conversation WHERE direct_key = $direct_key LIMIT 1",
                )
                .bind(("direct_key", direct_key))
                .await
                .map_err(map_surreal_error)?;
            let mut ids: Vec<String> = take_rows(&mut response, 0, "direct_conversation")?;
            match ids.pop() {
                Some(conversation_id) => self.fetch_conversation(&conversation_id).await,
                None => Ok(None),
            }
        })
    }

    fn get_participant(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<ConversationParticipant>>> {
        let conversation_id = conversation_id.to_string();
        let user_id = user_id.to_string();
        Box::pin(async move { self.fetch_participant(&conversation_id, &user_id).await })
    }

    fn list_participants(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'_, DomainResult<Vec<ConversationParticipant>>> {
        let conversation_id = conversation_id.to_string();
        Box::pin(async move { self.fetch_participants(&conversation_id).await })
    }

    fn list_for_user(
        &self,
        user_id: &str,
    ) -> BoxFuture<'_, DomainResult<Vec<ConversationSummary>>> {
        let user_id = user_id.to_string();
        Box::pin(async move {
            let mut response = self
                .client
                .query(format!(
                    "SELECT {PARTICIPANT_FIELDS} FROM conversation_participant WHERE user_id = $user_id"
                ))
                .bind(("user_id", user_id))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<ParticipantRow> =
                take_rows(&mut response, 0, "conversation_participant")?;

            let mut summaries = Vec::with_capacity(rows.len());
            for participant in rows.into_iter().map(ConversationParticipant::from) {
                let Some(conversation) = self
                    .fetch_conversation(&participant.conversation_id)
                    .await?
                else {
                    continue;
                };
                let participant_ids = self
                    .active_participant_ids(&conversation.conversation_id)
                    .await?;
                let last_message = match conversation.last_message_id.as_deref() {
                    Some(message_id) => {
                        self.fetch_message(&conversation.conversation_id, "message_id", message_id)
                            .await?
                    }
                    None => None,
                };
                summaries.push(ConversationSummary {
                    conversation,
                    participant,
                    participant_ids,
                    last_message,
                });
            }
            Ok(summaries)
        })
    }

    fn update_participant(
        &self,
        participant: &ConversationParticipant,
    ) -> BoxFuture<'_, DomainResult<ConversationParticipant>> {
        let participant = participant.clone();
        Box::pin(async move {
            self.client
                .query(
                    "UPDATE conversation_participant SET is_pinned = $is_pinned, is_muted = $is_muted, \
                     muted_until_ms = $muted_until_ms, left_at_ms = $left_at_ms, joined_at_ms = $joined_at_ms \
                     WHERE conversation_id = $conversation_id AND user_id = $user_id RETURN NONE",
                )
                .bind(("conversation_id", participant.conversation_id.clone()))
                .bind(("user_id", participant.user_id.clone()))
                .bind(("is_pinned", participant.is_pinned))
                .bind(("is_muted", participant.is_muted))
                .bind(("muted_until_ms", participant.muted_until_ms))
                .bind(("left_at_ms", participant.left_at_ms))
                .bind(("joined_at_ms", participant.joined_at_ms))
                .await
                .map_err(map_surreal_error)?;
            self.fetch_participant(&participant.conversation_id, &participant.user_id)
                .await?
                .ok_or(DomainError::NotFound)
        })
    }

    fn append_message(&self, message: &Message) -> BoxFuture<'_, DomainResult<MessageAppend>> {
        let message = message.clone();
        Box::pin(async move {
            if let Some(existing) = self
                .fetch_message(&message.conversation_id, "request_id", &message.request_id)
                .await?
            {
                return Ok(MessageAppend {
                    message: existing,
                    created: false,
                    active_participant_ids: self
                        .active_participant_ids(&message.conversation_id)
                        .await?,
                });
            }

            let query = format!(
                "BEGIN TRANSACTION;\n\
                 IF (SELECT VALUE conversation_id FROM conversation WHERE conversation_id = $conversation_id LIMIT 1)[0] = NONE {{ THROW \"{ROW_MISSING}\" }};\n\
                 CREATE message SET conversation_id = $conversation_id, message_id = $message_id, \
                     sender_id = $sender_id, body = $body, mentions = $mentions, request_id = $request_id, \
                     created_at_ms = $created_at_ms RETURN NONE;\n\
                 UPDATE conversation SET last_message_id = $message_id, last_message_at_ms = $created_at_ms, \
                     updated_at_ms = $created_at_ms WHERE conversation_id = $conversation_id RETURN NONE;\n\
                 UPDATE conversation_participant SET unread_count += 1 \
                     WHERE conversation_id = $conversation_id AND user_id != $sender_id AND !left_at_ms RETURN NONE;\n\
                 UPDATE conversation_participant SET mention_count += 1 \
                     WHERE conversation_id = $conversation_id AND user_id IN $mentions AND user_id != $sender_id \
                     AND !left_at_ms RETURN NONE;\n\
                 COMMIT TRANSACTION;"
            );
            let statements = statement_count(&query);
            let mut response = self
                .client
                .query(query)
                .bind(("conversation_id", message.conversation_id.clone()))
                .bind(("message_id", message.message_id.clone()))
                .bind(("sender_id", message.sender_id.clone()))
                .bind(("body", message.body.clone()))
                .bind(("mentions", message.mentions.clone()))
                .bind(("request_id", message.request_id.clone()))
                .bind(("created_at_ms", message.created_at_ms))
                .await
                .map_err(map_surreal_error)?;

            match surface_statement_errors(&mut response, statements) {
                Ok(()) => {}
                // unique (conversation_id, request_id): a concurrent replay won
                Err(DomainError::Conflict) => {
                    let existing = self
                        .fetch_message(&message.conversation_id, "request_id", &message.request_id)
                        .await?
                        .ok_or(DomainError::Conflict)?;
                    return Ok(MessageAppend {
                        message: existing,
                        created: false,
                        active_participant_ids: self
                            .active_participant_ids(&message.conversation_id)
                            .await?,
                    });
                }
                Err(err) => return Err(err),
            }

            let active_participant_ids = self
                .active_participant_ids(&message.conversation_id)
                .await?;
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
        let client = self.client.clone();
        Box::pin(async move {
            if cursor.since_created_at_ms.is_none() && cursor.since_message_id.is_some() {
                return Err(DomainError::Validation(
                    "since_message_id requires since_created_at_ms".into(),
                ));
            }
            let mut statement = format!(
                "SELECT {MESSAGE_FIELDS} FROM message WHERE conversation_id = $conversation_id"
            );
            match (cursor.since_created_at_ms, cursor.since_message_id.as_ref()) {
                (Some(_), Some(_)) => statement.push_str(
                    " AND (created_at_ms > $since_created_at_ms OR \
                     (created_at_ms = $since_created_at_ms AND message_id > $since_message_id))",
                ),
                (Some(_), None) => statement.push_str(" AND created_at_ms >= $since_created_at_ms"),
                _ => {}
            }
            statement.push_str(" ORDER BY created_at_ms ASC, message_id ASC LIMIT $limit");

            let mut response = client
                .query(statement)
                .bind(("conversation_id", conversation_id))
                .bind(("since_created_at_ms", cursor.since_created_at_ms.unwrap_or(0)))
                .bind(("since_message_id", cursor.since_message_id.unwrap_or_default()))
                .bind(("limit", cursor.limit as i64))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<MessageRow> = take_rows(&mut response, 0, "message")?;
            Ok(rows.into_iter().map(Message::from).collect())
        })
    }

    fn mark_read(
        &self,
        conversation_id: &str,
        user_id: &str,
        read_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<Option<ConversationParticipant>>> {
        let conversation_id = conversation_id.to_string();
        let user_id = user_id.to_string();
        Box::pin(async move {
            self.client
                .query(
                    "UPDATE conversation_participant SET unread_count = 0, mention_count = 0, \
                     last_read_at_ms = $read_at_ms \
                     WHERE conversation_id = $conversation_id AND user_id = $user_id RETURN NONE",
                )
                .bind(("conversation_id", conversation_id.clone()))
                .bind(("user_id", user_id.clone()))
                .bind(("read_at_ms", read_at_ms))
                .await
                .map_err(map_surreal_error)?;
            self.fetch_participant(&conversation_id, &user_id).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thrown_markers_map_to_domain_errors() {
        assert!(matches!(
            classify_error_message("An error occurred: relation_exists"),
            DomainError::Conflict
        ));
        assert!(matches!(
            classify_error_message("An error occurred: relation_missing"),
            DomainError::NotFound
        ));
        assert!(matches!(
            classify_error_message("Database index `relation_edge_unique` already contains ['follow', 'a', 'b']"),
            DomainError::Conflict
        ));
        assert!(matches!(
            classify_error_message("connection reset"),
            DomainError::Storage(_)
        ));
    }

    #[test]
    fn statement_count_skips_transaction_markers() {
        let query = format!(
            "BEGIN TRANSACTION;\nIF true {{ THROW \"x\" }};\n{}\nCOMMIT TRANSACTION;",
            counter_updates(RelationKind::Follow, "+")
        );
        assert_eq!(statement_count(&query), 3);
        assert_eq!(counter_updates(RelationKind::Bookmark, "-"), "");
    }

    #[test]
    fn cursor_condition_depends_on_pinned_state() {
        let pinned = cursor_condition(&FeedCursorKey {
            is_pinned: true,
            created_at_ms: 1,
            post_id: "p".into(),
        });
        assert!(pinned.contains("is_pinned = false OR"));
        let unpinned = cursor_condition(&FeedCursorKey {
            is_pinned: false,
            created_at_ms: 1,
            post_id: "p".into(),
        });
        assert!(unpinned.starts_with(" AND is_pinned = false AND"));
    }
}
