use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::error::DomainError;
use crate::identity::ActorIdentity;
use crate::ports::realtime::FanoutGateway;
use crate::ports::social::SocialGraphRepository;
use crate::presence::{Channel, OutboundEvent};
use crate::social::RelationKind;
use crate::util::now_ms;

pub const EVENT_PROFILE_UPDATED: &str = "profile.updated";
const MIN_USERNAME_LENGTH: usize = 3;
const MAX_USERNAME_LENGTH: usize = 30;
const MAX_DISPLAY_NAME_LENGTH: usize = 80;
const MAX_BIO_LENGTH: usize = 280;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub user_id: String,
    pub username: String,
    pub display_name: String,
    pub bio: Option<String>,
    pub is_private: bool,
    pub followers_count: i64,
    pub following_count: i64,
    pub posts_count: i64,
    pub is_online: bool,
    pub last_seen_at_ms: Option<i64>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub deleted_at_ms: Option<i64>,
}

impl UserProfile {
    pub fn is_active(&self) -> bool {
        self.deleted_at_ms.is_none()
    }

    pub fn counters(&self) -> UserCounters {
        UserCounters {
            user_id: self.user_id.clone(),
            followers_count: self.followers_count,
            following_count: self.following_count,
            posts_count: self.posts_count,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserCounters {
    pub user_id: String,
    pub followers_count: i64,
    pub following_count: i64,
    pub posts_count: i64,
}

#[derive(Clone, Debug)]
pub struct ProfileRegistration {
    pub username: String,
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub is_private: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ProfileUpdate {
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub is_private: Option<bool>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProfileView {
    #[serde(flatten)]
    pub profile: UserProfile,
    pub is_following: bool,
    pub follows_you: bool,
    pub follow_requested: bool,
    pub is_blocked: bool,
    pub is_muted: bool,
}

#[derive(Clone)]
pub struct ProfileService {
    repository: Arc<dyn SocialGraphRepository>,
    fanout: Arc<dyn FanoutGateway>,
}

impl ProfileService {
    pub fn new(
        repository: Arc<dyn SocialGraphRepository>,
        fanout: Arc<dyn FanoutGateway>,
    ) -> Self {
        Self { repository, fanout }
    }

    /// Creates the caller's profile, or overwrites the editable fields when it
    /// already exists. Counters and presence are never taken from input.
    pub async fn register(
        &self,
        actor: &ActorIdentity,
        input: ProfileRegistration,
    ) -> DomainResult<UserProfile> {
        let username = normalize_username(&input.username)?;
        let display_name = match input.display_name {
            Some(value) => normalize_display_name(&value)?,
            None => username.clone(),
        };
        let bio = normalize_bio(input.bio)?;
        let now = now_ms();

        let existing = self.repository.get_user(&actor.user_id).await?;
        let profile = match existing {
            Some(mut profile) => {
                profile.username = username;
                profile.display_name = display_name;
                profile.bio = bio;
                profile.is_private = input.is_private;
                profile.updated_at_ms = now;
                profile.deleted_at_ms = None;
                profile
            }
            None => UserProfile {
                user_id: actor.user_id.clone(),
                username,
                display_name,
                bio,
                is_private: input.is_private,
                followers_count: 0,
                following_count: 0,
                posts_count: 0,
                is_online: false,
                last_seen_at_ms: None,
                created_at_ms: now,
                updated_at_ms: now,
                deleted_at_ms: None,
            },
        };

        let profile = self.repository.upsert_user(&profile).await?;
        self.publish_profile(&profile).await;
        Ok(profile)
    }

    pub async fn update(
        &self,
        actor: &ActorIdentity,
        input: ProfileUpdate,
    ) -> DomainResult<UserProfile> {
        let mut profile = self.require_active(&actor.user_id).await?;
        if let Some(display_name) = input.display_name {
            profile.display_name = normalize_display_name(&display_name)?;
        }
        if input.bio.is_some() {
            profile.bio = normalize_bio(input.bio)?;
        }
        if let Some(is_private) = input.is_private {
            profile.is_private = is_private;
        }
        profile.updated_at_ms = now_ms();

        let profile = self.repository.upsert_user(&profile).await?;
        self.publish_profile(&profile).await;
        Ok(profile)
    }

    pub async fn get(
        &self,
        viewer: Option<&ActorIdentity>,
        user_id: &str,
    ) -> DomainResult<ProfileView> {
        let profile = self.require_active(user_id).await?;
        let mut view = ProfileView {
            profile,
            is_following: false,
            follows_you: false,
            follow_requested: false,
            is_blocked: false,
            is_muted: false,
        };

        let Some(viewer) = viewer.filter(|viewer| viewer.user_id != user_id) else {
            return Ok(view);
        };
        if self
            .repository
            .get_edge(RelationKind::Block, user_id, &viewer.user_id)
            .await?
            .is_some()
        {
            return Err(DomainError::NotFound);
        }

        view.is_following = self
            .has_edge(RelationKind::Follow, &viewer.user_id, user_id)
            .await?;
        view.follows_you = self
            .has_edge(RelationKind::Follow, user_id, &viewer.user_id)
            .await?;
        view.follow_requested = self
            .has_edge(RelationKind::FollowRequest, &viewer.user_id, user_id)
            .await?;
        view.is_blocked = self
            .has_edge(RelationKind::Block, &viewer.user_id, user_id)
            .await?;
        view.is_muted = self
            .has_edge(RelationKind::Mute, &viewer.user_id, user_id)
            .await?;
        Ok(view)
    }

    pub async fn mark_online(&self, user_id: &str) -> DomainResult<()> {
        self.repository.set_presence(user_id, true, now_ms()).await
    }

    pub async fn mark_offline(&self, user_id: &str) -> DomainResult<()> {
        self.repository.set_presence(user_id, false, now_ms()).await
    }

    /// Re-reads the profile and pushes it to everybody watching `profile:<id>`.
    pub async fn publish_current(&self, user_id: &str) -> DomainResult<()> {
        if let Some(profile) = self.repository.get_user(user_id).await? {
            self.publish_profile(&profile).await;
        }
        Ok(())
    }

    pub async fn require_active(&self, user_id: &str) -> DomainResult<UserProfile> {
        self.repository
            .get_user(user_id)
            .await?
            .filter(UserProfile::is_active)
            .ok_or(DomainError::NotFound)
    }

    async fn has_edge(&self, kind: RelationKind, actor_id: &str, target_id: &str) -> DomainResult<bool> {
        Ok(self
            .repository
            .get_edge(kind, actor_id, target_id)
            .await?
            .is_some())
    }

    async fn publish_profile(&self, profile: &UserProfile) {
        let Ok(data) = serde_json::to_value(profile) else {
            return;
        };
        self.fanout
            .emit_to_room(
                Channel::Realtime,
                &profile_room(&profile.user_id),
                OutboundEvent::new(EVENT_PROFILE_UPDATED, data),
            )
            .await;
    }
}

pub fn profile_room(user_id: &str) -> String {
    format!("profile:{user_id}")
}

fn normalize_username(value: &str) -> DomainResult<String> {
    let username = value.trim().trim_start_matches('@').to_lowercase();
    let length = username.chars().count();
    if !(MIN_USERNAME_LENGTH..=MAX_USERNAME_LENGTH).contains(&length) {
        return Err(DomainError::Validation(format!(
            "username must be between {MIN_USERNAME_LENGTH} and {MAX_USERNAME_LENGTH} characters"
        )));
    }
    if !username
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
    {
        return Err(DomainError::Validation(
            "username may only contain letters, digits and underscores".into(),
        ));
    }
    Ok(username)
}

fn normalize_display_name(value: &str) -> DomainResult<String> {
    let display_name = value.trim().to_string();
    if display_name.is_empty() {
        return Err(DomainError::Validation("display_name is required".into()));
    }
    if display_name.chars().count() > MAX_DISPLAY_NAME_LENGTH {
        return Err(DomainError::Validation(format!(
            "display_name exceeds max length of {MAX_DISPLAY_NAME_LENGTH}"
        )));
    }
    Ok(display_name)
}

fn normalize_bio(value: Option<String>) -> DomainResult<Option<String>> {
    let Some(bio) = value.map(|bio| bio.trim().to_string()) else {
        return Ok(None);
    };
    if bio.chars().count() > MAX_BIO_LENGTH {
        return Err(DomainError::Validation(format!(
            "bio exceeds max length of {MAX_BIO_LENGTH}"
        )));
    }
    Ok(Some(bio).filter(|bio| !bio.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_is_lowercased_and_stripped() {
        assert_eq!(normalize_username(" @Alice_01 ").unwrap(), "alice_01");
    }

    #[test]
    fn username_rejects_bad_characters_and_length() {
        assert!(normalize_username("ab").is_err());
        assert!(normalize_username("has space").is_err());
        assert!(normalize_username(&"x".repeat(31)).is_err());
    }

    #[test]
    fn blank_bio_is_cleared() {
        assert_eq!(normalize_bio(Some("   ".into())).unwrap(), None);
        assert!(normalize_bio(Some("y".repeat(281))).is_err());
    }

    #[test]
    fn profile_view_flattens_profile_fields() {
        let view = ProfileView {
            profile: UserProfile {
                user_id: "u1".into(),
                username: "alice".into(),
                display_name: "Alice".into(),
                bio: None,
                is_private: false,
                followers_count: 2,
                following_count: 1,
                posts_count: 0,
                is_online: true,
                last_seen_at_ms: Some(10),
                created_at_ms: 1,
                updated_at_ms: 1,
                deleted_at_ms: None,
            },
            is_following: true,
            follows_you: false,
            follow_requested: false,
            is_blocked: false,
            is_muted: false,
        };
        let value = serde_json::to_value(&view).unwrap();
        assert_eq!(value["followersCount"], 2);
        assert_eq!(value["isFollowing"], true);
        assert_eq!(value["userId"], "u1");
    }
}
