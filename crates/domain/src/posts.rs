use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::error::DomainError;
use crate::identity::ActorIdentity;
use crate::notifications::{NotificationCreate, NotificationKey, NotificationService, NotificationType};
use crate::ports::social::SocialGraphRepository;
use crate::social::{ensure_not_blocked, run_side_effect};
use crate::util::{dedupe_ids, now_ms};

const MAX_BODY_LENGTH: usize = 500;
const MAX_MENTIONS_PER_POST: usize = 20;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub post_id: String,
    pub author_id: String,
    pub body: String,
    pub parent_post_id: Option<String>,
    pub is_pinned: bool,
    pub like_count: i64,
    pub repost_count: i64,
    pub reply_count: i64,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub deleted_at_ms: Option<i64>,
}

impl Post {
    pub fn is_live(&self) -> bool {
        self.deleted_at_ms.is_none()
    }
}

#[derive(Clone, Debug)]
pub struct PostCreate {
    pub body: String,
    pub parent_post_id: Option<String>,
    pub is_pinned: bool,
}

#[derive(Clone)]
pub struct PostService {
    repository: Arc<dyn SocialGraphRepository>,
    notifications: NotificationService,
}

impl PostService {
    pub fn new(
        repository: Arc<dyn SocialGraphRepository>,
        notifications: NotificationService,
    ) -> Self {
        Self {
            repository,
            notifications,
        }
    }

    pub async fn create(&self, actor: &ActorIdentity, input: PostCreate) -> DomainResult<Post> {
        let body = input.body.trim().to_string();
        validate_body(&body)?;
        let author = self
            .repository
            .get_user(&actor.user_id)
            .await?
            .filter(|profile| profile.is_active())
            .ok_or_else(|| DomainError::Validation("author profile is required".into()))?;

        let parent = match input
            .parent_post_id
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
        {
            Some(parent_post_id) => {
                let parent = self.get(&parent_post_id).await?;
                self.assert_not_blocked(&author.user_id, &parent.author_id)
                    .await?;
                Some(parent)
            }
            None => None,
        };

        let now = now_ms();
        let post = Post {
            post_id: crate::util::uuid_v7_without_dashes(),
            author_id: author.user_id.clone(),
            body,
            parent_post_id: parent.as_ref().map(|parent| parent.post_id.clone()),
            is_pinned: input.is_pinned,
            like_count: 0,
            repost_count: 0,
            reply_count: 0,
            created_at_ms: now,
            updated_at_ms: now,
            deleted_at_ms: None,
        };
        let post = self.repository.create_post(&post).await?;

        let mentions = parse_mentions(&post.body);
        let service = self.clone();
        let created = post.clone();
        let parent_author_id = parent.map(|parent| parent.author_id);
        run_side_effect("post_notifications", async move {
            service
                .notify_for_post(&created, parent_author_id, mentions)
                .await
        })
        .await;

        Ok(post)
    }

    /// Soft delete. Only the author may delete; counters are reversed in the
    /// same atomic unit as the delete.
    pub async fn delete(&self, actor: &ActorIdentity, post_id: &str) -> DomainResult<Post> {
        let post = self.get(post_id).await?;
        if post.author_id != actor.user_id {
            return Err(DomainError::Forbidden(
                "only the author can delete this post".into(),
            ));
        }
        self.repository
            .soft_delete_post(&post.post_id, now_ms())
            .await?
            .ok_or(DomainError::NotFound)
    }

    pub async fn get(&self, post_id: &str) -> DomainResult<Post> {
        let post_id = post_id.trim();
        if post_id.is_empty() {
            return Err(DomainError::Validation("post_id is required".into()));
        }
        self.repository
            .get_post(post_id)
            .await?
            .filter(Post::is_live)
            .ok_or(DomainError::NotFound)
    }

    async fn notify_for_post(
        &self,
        post: &Post,
        parent_author_id: Option<String>,
        mentions: Vec<String>,
    ) -> DomainResult<()> {
        if let Some(parent_author_id) = parent_author_id {
            self.notifications
                .create(NotificationCreate::new(NotificationKey::new(
                    parent_author_id,
                    post.author_id.clone(),
                    NotificationType::Comment,
                    Some(post.post_id.clone()),
                )))
                .await?;
        }

        if mentions.is_empty() {
            return Ok(());
        }
        let mentioned = self.repository.find_users_by_username(&mentions).await?;
        for profile in mentioned.into_iter().filter(|profile| profile.is_active()) {
            if profile.user_id == post.author_id
                || self
                    .assert_not_blocked(&post.author_id, &profile.user_id)
                    .await
                    .is_err()
            {
                continue;
            }
            self.notifications
                .create(NotificationCreate::new(NotificationKey::new(
                    profile.user_id,
                    post.author_id.clone(),
                    NotificationType::Mention,
                    Some(post.post_id.clone()),
                )))
                .await?;
        }
        Ok(())
    }

    async fn assert_not_blocked(&self, actor_id: &str, other_id: &str) -> DomainResult<()> {
        ensure_not_blocked(self.repository.as_ref(), actor_id, other_id).await
    }
}

/// `@username` tokens, lowercased and deduplicated in order of appearance.
pub fn parse_mentions(body: &str) -> Vec<String> {
    let mut mentions = Vec::new();
    let mut chars = body.char_indices().peekable();
    while let Some((index, ch)) = chars.next() {
        if ch != '@' {
            continue;
        }
        let preceded_by_word = body[..index]
            .chars()
            .next_back()
            .is_some_and(|prev| prev.is_ascii_alphanumeric() || prev == '_');
        let mut name = String::new();
        while let Some((_, next)) = chars.peek() {
            if next.is_ascii_alphanumeric() || *next == '_' {
                name.push(next.to_ascii_lowercase());
                chars.next();
            } else {
                break;
            }
        }
        if !preceded_by_word && (3..=30).contains(&name.len()) {
            mentions.push(name);
        }
    }
    let mut mentions = dedupe_ids(mentions);
    mentions.truncate(MAX_MENTIONS_PER_POST);
    mentions
}

fn validate_body(body: &str) -> DomainResult<()> {
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
    fn mentions_are_lowercased_and_deduplicated() {
        assert_eq!(
            parse_mentions("hey @Alice and @bob_2, also @alice again"),
            vec!["alice".to_string(), "bob_2".to_string()]
        );
    }

    #[test]
    fn email_addresses_and_short_handles_are_not_mentions() {
        assert!(parse_mentions("mail me at someone@example.com").is_empty());
        assert!(parse_mentions("@ab is too short").is_empty());
    }

    #[test]
    fn body_validation_rejects_empty_and_long() {
        assert!(validate_body("").is_err());
        assert!(validate_body(&"x".repeat(501)).is_err());
        assert!(validate_body("hello").is_ok());
    }
}
