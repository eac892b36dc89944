use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::DomainResult;
use crate::error::DomainError;
use crate::identity::ActorIdentity;
use crate::ports::conversations::ConversationRepository;
use crate::ports::realtime::{FanoutGateway, FanoutTarget};
use crate::ports::social::SocialGraphRepository;
use crate::posts::parse_mentions;
use crate::presence::{Channel, OutboundEvent};
use crate::social::ensure_not_blocked;
use crate::util::{dedupe_ids, now_ms};

const MAX_BODY_LENGTH: usize = 2_000;
const MAX_GROUP_PARTICIPANTS: usize = 50;
const MAX_TITLE_LENGTH: usize = 100;
const MAX_MESSAGES_PER_REQUEST: usize = 200;

pub const EVENT_RECEIVE_MESSAGE: &str = "receive-message";
pub const EVENT_MESSAGE_READ: &str = "message-read";
pub const EVENT_USER_TYPING: &str = "user-typing";
pub const EVENT_USER_STOP_TYPING: &str = "user-stop-typing";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub conversation_id: String,
    pub kind: ConversationKind,
    pub title: Option<String>,
    /// Sorted `user:user` pair; only set for direct conversations.
    pub direct_key: Option<String>,
    pub created_by: String,
    pub last_message_id: Option<String>,
    pub last_message_at_ms: Option<i64>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationParticipant {
    pub conversation_id: String,
    pub user_id: String,
    pub is_pinned: bool,
    pub is_muted: bool,
    pub muted_until_ms: Option<i64>,
    pub last_read_at_ms: Option<i64>,
    pub left_at_ms: Option<i64>,
    pub joined_at_ms: i64,
    pub unread_count: i64,
    pub mention_count: i64,
}

impl ConversationParticipant {
    pub fn new(conversation_id: &str, user_id: &str, joined_at_ms: i64) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            is_pinned: false,
            is_muted: false,
            muted_until_ms: None,
            last_read_at_ms: None,
            left_at_ms: None,
            joined_at_ms,
            unread_count: 0,
            mention_count: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.left_at_ms.is_none()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub conversation_id: String,
    pub message_id: String,
    pub sender_id: String,
    pub body: String,
    /// User ids of active participants mentioned in the body.
    pub mentions: Vec<String>,
    pub request_id: String,
    pub created_at_ms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub participant: ConversationParticipant,
    pub participant_ids: Vec<String>,
    pub last_message: Option<Message>,
}

#[derive(Clone, Debug)]
pub struct MessageAppend {
    pub message: Message,
    /// False when the request id was replayed.
    pub created: bool,
    pub active_participant_ids: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct ConversationCreate {
    pub kind: ConversationKind,
    pub participant_ids: Vec<String>,
    pub title: Option<String>,
}

#[derive(Clone, Debug)]
pub struct SendMessageInput {
    pub conversation_id: String,
    pub body: String,
    pub request_id: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct ConversationSettings {
    pub is_pinned: Option<bool>,
    pub is_muted: Option<bool>,
    pub muted_until_ms: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct MessageCatchup {
    pub since_created_at_ms: Option<i64>,
    pub since_message_id: Option<String>,
    pub limit: usize,
}

#[derive(Clone)]
pub struct ConversationService {
    repository: Arc<dyn ConversationRepository>,
    social: Arc<dyn SocialGraphRepository>,
    fanout: Arc<dyn FanoutGateway>,
}

impl ConversationService {
    pub fn new(
        repository: Arc<dyn ConversationRepository>,
        social: Arc<dyn SocialGraphRepository>,
        fanout: Arc<dyn FanoutGateway>,
    ) -> Self {
        Self {
            repository,
            social,
            fanout,
        }
    }

    /// Direct conversations are unique per pair: asking again returns the
    /// existing one and re-activates the caller if they had left it.
    pub async fn create_conversation(
        &self,
        actor: &ActorIdentity,
        input: ConversationCreate,
    ) -> DomainResult<Conversation> {
        let input = validate_create_input(&actor.user_id, input)?;
        for user_id in &input.participant_ids {
            self.social
                .get_user(user_id)
                .await?
                .filter(|profile| profile.is_active())
                .ok_or(DomainError::NotFound)?;
            self.assert_not_blocked(&actor.user_id, user_id).await?;
        }

        let now = now_ms();
        let pair_key = match input.kind {
            ConversationKind::Direct => Some(direct_key(&actor.user_id, &input.participant_ids[0])),
            ConversationKind::Group => None,
        };

        if let Some(pair_key) = pair_key.as_deref() {
            if let Some(existing) = self.repository.find_direct(pair_key).await? {
                self.rejoin(&existing.conversation_id, &actor.user_id).await?;
                return Ok(existing);
            }
        }

        let conversation = Conversation {
            conversation_id: crate::util::uuid_v7_without_dashes(),
            kind: input.kind,
            title: input.title,
            direct_key: pair_key.clone(),
            created_by: actor.user_id.clone(),
            last_message_id: None,
            last_message_at_ms: None,
            created_at_ms: now,
            updated_at_ms: now,
        };
        let participants: Vec<ConversationParticipant> = std::iter::once(actor.user_id.clone())
            .chain(input.participant_ids)
            .map(|user_id| ConversationParticipant::new(&conversation.conversation_id, &user_id, now))
            .collect();

        match self
            .repository
            .create_conversation(&conversation, &participants)
            .await
        {
            Ok(conversation) => Ok(conversation),
            Err(DomainError::Conflict) => match pair_key.as_deref() {
                Some(pair_key) => self
                    .repository
                    .find_direct(pair_key)
                    .await?
                    .ok_or(DomainError::Conflict),
                None => Err(DomainError::Conflict),
            },
            Err(err) => Err(err),
        }
    }

    /// Active conversations, pinned first, then most recent activity.
    pub async fn list_conversations(
        &self,
        actor: &ActorIdentity,
    ) -> DomainResult<Vec<ConversationSummary>> {
        let mut summaries = self.repository.list_for_user(&actor.user_id).await?;
        summaries.retain(|summary| summary.participant.is_active());
        summaries.sort_by(|left, right| {
            right
                .participant
                .is_pinned
                .cmp(&left.participant.is_pinned)
                .then_with(|| activity_ms(right).cmp(&activity_ms(left)))
                .then_with(|| {
                    right
                        .conversation
                        .conversation_id
                        .cmp(&left.conversation.conversation_id)
                })
        });
        Ok(summaries)
    }

    pub async fn get_conversation(
        &self,
        actor: &ActorIdentity,
        conversation_id: &str,
    ) -> DomainResult<Conversation> {
        self.assert_active_participant(&actor.user_id, conversation_id)
            .await?;
        self.repository
            .get_conversation(conversation_id)
            .await?
            .ok_or(DomainError::NotFound)
    }

    /// Appends atomically, then pushes `receive-message` to every active
    /// participant. Replaying a request id returns the stored message and
    /// pushes nothing.
    pub async fn send_message(
        &self,
        actor: &ActorIdentity,
        input: SendMessageInput,
    ) -> DomainResult<Message> {
        let conversation = self
            .repository
            .get_conversation(&input.conversation_id)
            .await?
            .ok_or(DomainError::NotFound)?;
        self.assert_active_participant(&actor.user_id, &conversation.conversation_id)
            .await?;

        let body = input.body.trim().to_string();
        validate_message_body(&body)?;

        let participants = self
            .repository
            .list_participants(&conversation.conversation_id)
            .await?;
        let active_ids: HashSet<String> = participants
            .iter()
            .filter(|participant| participant.is_active())
            .map(|participant| participant.user_id.clone())
            .collect();

        if conversation.kind == ConversationKind::Direct {
            for participant in participants
                .iter()
                .filter(|participant| participant.user_id != actor.user_id)
            {
                self.assert_not_blocked(&actor.user_id, &participant.user_id)
                    .await?;
            }
        }

        let mentions = self
            .resolve_mentions(&body, &actor.user_id, &active_ids)
            .await?;
        let message = Message {
            conversation_id: conversation.conversation_id.clone(),
            message_id: crate::util::uuid_v7_without_dashes(),
            sender_id: actor.user_id.clone(),
            body,
            mentions,
            request_id: input
                .request_id
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(crate::util::uuid_v7_without_dashes),
            created_at_ms: now_ms(),
        };

        let appended = self.repository.append_message(&message).await?;
        if appended.created {
            let data = serde_json::to_value(&appended.message)
                .map_err(|err| DomainError::Storage(err.to_string()))?;
            for user_id in &appended.active_participant_ids {
                self.fanout
                    .emit_to_user(
                        Channel::Messaging,
                        user_id,
                        OutboundEvent::new(EVENT_RECEIVE_MESSAGE, data.clone()),
                    )
                    .await;
            }
        }
        Ok(appended.message)
    }

    pub async fn list_messages(
        &self,
        actor: &ActorIdentity,
        conversation_id: &str,
        cursor: MessageCatchup,
    ) -> DomainResult<Vec<Message>> {
        self.assert_active_participant(&actor.user_id, conversation_id)
            .await?;
        self.repository.list_messages(conversation_id, &cursor).await
    }

    /// Clears unread and mention counters and tells the conversation room.
    pub async fn mark_read(
        &self,
        actor: &ActorIdentity,
        conversation_id: &str,
    ) -> DomainResult<ConversationParticipant> {
        self.assert_active_participant(&actor.user_id, conversation_id)
            .await?;
        let read_at_ms = now_ms();
        let participant = self
            .repository
            .mark_read(conversation_id, &actor.user_id, read_at_ms)
            .await?
            .ok_or(DomainError::NotFound)?;

        self.fanout
            .emit_to_room(
                Channel::Messaging,
                &conversation_room(conversation_id),
                OutboundEvent::new(
                    EVENT_MESSAGE_READ,
                    json!({
                        "conversationId": conversation_id,
                        "userId": actor.user_id,
                        "readAtMs": read_at_ms,
                    }),
                ),
            )
            .await;
        Ok(participant)
    }

    /// The participant row is kept with `left_at_ms` set.
    pub async fn leave(
        &self,
        actor: &ActorIdentity,
        conversation_id: &str,
    ) -> DomainResult<ConversationParticipant> {
        let mut participant = self
            .assert_active_participant(&actor.user_id, conversation_id)
            .await?;
        participant.left_at_ms = Some(now_ms());
        participant.is_pinned = false;
        self.repository.update_participant(&participant).await
    }

    pub async fn update_settings(
        &self,
        actor: &ActorIdentity,
        conversation_id: &str,
        settings: ConversationSettings,
    ) -> DomainResult<ConversationParticipant> {
        let mut participant = self
            .assert_active_participant(&actor.user_id, conversation_id)
            .await?;
        if let Some(is_pinned) = settings.is_pinned {
            participant.is_pinned = is_pinned;
        }
        if let Some(is_muted) = settings.is_muted {
            participant.is_muted = is_muted;
            if !is_muted {
                participant.muted_until_ms = None;
            }
        }
        if let Some(muted_until_ms) = settings.muted_until_ms {
            if muted_until_ms <= now_ms() {
                return Err(DomainError::Validation(
                    "muted_until_ms must be in the future".into(),
                ));
            }
            participant.is_muted = true;
            participant.muted_until_ms = Some(muted_until_ms);
        }
        self.repository.update_participant(&participant).await
    }

    /// Relays a typing indicator to the other members of the conversation room.
    pub async fn notify_typing(
        &self,
        actor: &ActorIdentity,
        conversation_id: &str,
        is_typing: bool,
    ) -> DomainResult<()> {
        self.assert_active_participant(&actor.user_id, conversation_id)
            .await?;
        let event = if is_typing {
            EVENT_USER_TYPING
        } else {
            EVENT_USER_STOP_TYPING
        };
        self.fanout
            .emit(
                Channel::Messaging,
                FanoutTarget::Room {
                    room: conversation_room(conversation_id),
                    except_user: Some(actor.user_id.clone()),
                },
                OutboundEvent::new(
                    event,
                    json!({
                        "conversationId": conversation_id,
                        "userId": actor.user_id,
                        "username": actor.username,
                    }),
                ),
            )
            .await;
        Ok(())
    }

    /// Fails with `Forbidden` unless `user_id` is a participant who has not left.
    pub async fn assert_active_participant(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> DomainResult<ConversationParticipant> {
        let participant = self
            .repository
            .get_participant(conversation_id, user_id)
            .await?
            .ok_or_else(|| {
                DomainError::Forbidden("user is not a participant of this conversation".into())
            })?;
        if !participant.is_active() {
            return Err(DomainError::Forbidden(
                "user has left this conversation".into(),
            ));
        }
        Ok(participant)
    }

    async fn rejoin(&self, conversation_id: &str, user_id: &str) -> DomainResult<()> {
        let Some(mut participant) = self
            .repository
            .get_participant(conversation_id, user_id)
            .await?
        else {
            return Ok(());
        };
        if participant.is_active() {
            return Ok(());
        }
        participant.left_at_ms = None;
        participant.joined_at_ms = now_ms();
        self.repository.update_participant(&participant).await?;
        Ok(())
    }

    async fn resolve_mentions(
        &self,
        body: &str,
        sender_id: &str,
        active_ids: &HashSet<String>,
    ) -> DomainResult<Vec<String>> {
        let usernames = parse_mentions(body);
        if usernames.is_empty() {
            return Ok(Vec::new());
        }
        let profiles = self.social.find_users_by_username(&usernames).await?;
        Ok(profiles
            .into_iter()
            .map(|profile| profile.user_id)
            .filter(|user_id| user_id != sender_id && active_ids.contains(user_id))
            .collect())
    }

    async fn assert_not_blocked(&self, actor_id: &str, other_id: &str) -> DomainResult<()> {
        ensure_not_blocked(self.social.as_ref(), actor_id, other_id).await
    }
}

pub fn conversation_room(conversation_id: &str) -> String {
    format!("conversation:{conversation_id}")
}

pub fn direct_key(left: &str, right: &str) -> String {
    if left <= right {
        format!("{left}:{right}")
    } else {
        format!("{right}:{left}")
    }
}

pub fn build_message_catchup(
    limit: Option<usize>,
    since_created_at_ms: Option<i64>,
    since_message_id: Option<String>,
) -> MessageCatchup {
    let safe_limit = limit.unwrap_or(50).clamp(1, MAX_MESSAGES_PER_REQUEST);
    MessageCatchup {
        since_created_at_ms,
        since_message_id,
        limit: safe_limit,
    }
}

fn activity_ms(summary: &ConversationSummary) -> i64 {
    summary
        .conversation
        .last_message_at_ms
        .unwrap_or(summary.conversation.created_at_ms)
}

fn validate_create_input(
    actor_id: &str,
    mut input: ConversationCreate,
) -> DomainResult<ConversationCreate> {
    input.participant_ids = dedupe_ids(input.participant_ids)
        .into_iter()
        .filter(|user_id| user_id != actor_id)
        .collect();
    input.title = input
        .title
        .map(|title| title.trim().to_string())
        .filter(|title| !title.is_empty());

    if input.participant_ids.is_empty() {
        return Err(DomainError::Validation(
            "at least one other participant is required".into(),
        ));
    }
    match input.kind {
        ConversationKind::Direct => {
            if input.participant_ids.len() != 1 {
                return Err(DomainError::Validation(
                    "direct conversations have exactly one other participant".into(),
                ));
            }
            input.title = None;
        }
        ConversationKind::Group => {
            if input.participant_ids.len() + 1 > MAX_GROUP_PARTICIPANTS {
                return Err(DomainError::Validation(format!(
                    "group conversations allow at most {MAX_GROUP_PARTICIPANTS} participants"
                )));
            }
        }
    }
    if input
        .title
        .as_ref()
        .is_some_and(|title| title.chars().count() > MAX_TITLE_LENGTH)
    {
        return Err(DomainError::Validation(format!(
            "title exceeds max length of {MAX_TITLE_LENGTH}"
        )));
    }
    Ok(input)
}

fn validate_message_body(body: &str) -> DomainResult<()> {
    if body.is_empty() {
        return Err(DomainError::Validation("body is required".into()));
    }
    if body.chars().count() > MAX_BODY_LENGTH {
        return Err(DomainError::Validation(format!(
            "body exceeds max length of {MAX_BODY_LENGTH}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_key_is_order_independent() {
        assert_eq!(direct_key("b", "a"), direct_key("a", "b"));
        assert_eq!(direct_key("a", "b"), "a:b");
    }

    #[test]
    fn create_input_drops_self_and_duplicates() {
        let input = validate_create_input(
            "me",
            ConversationCreate {
                kind: ConversationKind::Group,
                participant_ids: vec!["me".into(), "you".into(), "you".into(), "them".into()],
                title: Some("  crew ".into()),
            },
        )
        .unwrap();
        assert_eq!(input.participant_ids, vec!["you".to_string(), "them".to_string()]);
        assert_eq!(input.title.as_deref(), Some("crew"));
    }

    #[test]
    fn direct_requires_exactly_one_other() {
        let err = validate_create_input(
            "me",
            ConversationCreate {
                kind: ConversationKind::Direct,
                participant_ids: vec!["a".into(), "b".into()],
                title: None,
            },
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert!(
            validate_create_input(
                "me",
                ConversationCreate {
                    kind: ConversationKind::Direct,
                    participant_ids: vec!["me".into()],
                    title: None,
                },
            )
            .is_err()
        );
    }

    #[test]
    fn catchup_limit_is_clamped() {
        assert_eq!(build_message_catchup(None, None, None).limit, 50);
        assert_eq!(build_message_catchup(Some(0), None, None).limit, 1);
        assert_eq!(build_message_catchup(Some(9_999), None, None).limit, 200);
    }

    #[test]
    fn message_body_validation() {
        assert!(validate_message_body("").is_err());
        assert!(validate_message_body(&"x".repeat(2_001)).is_err());
        assert!(validate_message_body("hi").is_ok());
    }
}
