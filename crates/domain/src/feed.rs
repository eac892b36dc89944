use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::error::DomainError;
use crate::ports::feed::{FeedRepository, FeedRepositoryQuery};
use crate::posts::Post;

const DEFAULT_LIMIT: usize = 20;
const MAX_LIMIT: usize = 100;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FeedFilter {
    #[default]
    All,
    Following,
}

impl FeedFilter {
    pub fn parse(value: Option<&str>) -> DomainResult<Self> {
        match value.map(str::trim).filter(|value| !value.is_empty()) {
            None | Some("all") => Ok(FeedFilter::All),
            Some("following") => Ok(FeedFilter::Following),
            Some(other) => Err(DomainError::Validation(format!(
                "filter must be all or following, got {other}"
            ))),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct FeedQuery {
    pub viewer_id: Option<String>,
    /// Post id of the last row the client has seen.
    pub cursor: Option<String>,
    pub filter: FeedFilter,
    pub limit: Option<usize>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InteractionFlags {
    pub is_liked: bool,
    pub is_reposted: bool,
    pub is_bookmarked: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedPost {
    #[serde(flatten)]
    pub post: Post,
    #[serde(flatten)]
    pub flags: InteractionFlags,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedPage {
    pub posts: Vec<FeedPost>,
    pub pagination: Pagination,
}

/// Position of a post in feed order, resolved from the cursor post's row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeedCursorKey {
    pub is_pinned: bool,
    pub created_at_ms: i64,
    pub post_id: String,
}

impl FeedCursorKey {
    pub fn from_post(post: &Post) -> Self {
        Self {
            is_pinned: post.is_pinned,
            created_at_ms: post.created_at_ms,
            post_id: post.post_id.clone(),
        }
    }

    /// True when `post` sorts strictly after this cursor.
    pub fn precedes(&self, post: &Post) -> bool {
        compare_keys(self, &FeedCursorKey::from_post(post)) == Ordering::Less
    }
}

/// Pinned first, then newest first, then post id descending.
pub fn compare_feed_order(left: &Post, right: &Post) -> Ordering {
    compare_keys(&FeedCursorKey::from_post(left), &FeedCursorKey::from_post(right))
}

fn compare_keys(left: &FeedCursorKey, right: &FeedCursorKey) -> Ordering {
    right
        .is_pinned
        .cmp(&left.is_pinned)
        .then_with(|| right.created_at_ms.cmp(&left.created_at_ms))
        .then_with(|| right.post_id.cmp(&left.post_id))
}

#[derive(Clone)]
pub struct FeedService {
    repository: Arc<dyn FeedRepository>,
}

impl FeedService {
    pub fn new(repository: Arc<dyn FeedRepository>) -> Self {
        Self { repository }
    }

    pub async fn list(&self, query: FeedQuery) -> DomainResult<FeedPage> {
        let limit = normalize_limit(query.limit)?;
        let viewer_id = query
            .viewer_id
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let author_ids = match (query.filter, viewer_id.as_deref()) {
            (FeedFilter::All, _) => None,
            (FeedFilter::Following, None) => {
                return Err(DomainError::Validation(
                    "following filter requires an authenticated viewer".into(),
                ));
            }
            (FeedFilter::Following, Some(viewer_id)) => {
                let mut ids = self.repository.list_following_ids(viewer_id).await?;
                ids.push(viewer_id.to_string());
                Some(crate::util::dedupe_ids(ids))
            }
        };

        let cursor = match query
            .cursor
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            Some(post_id) => {
                let post = self
                    .repository
                    .get_post(post_id)
                    .await?
                    .ok_or_else(|| DomainError::Validation("unknown cursor".into()))?;
                Some(FeedCursorKey::from_post(&post))
            }
            None => None,
        };

        let excluded_author_ids = match viewer_id.as_deref() {
            Some(viewer_id) => self.repository.list_hidden_author_ids(viewer_id).await?,
            None => Vec::new(),
        };

        let mut rows = self
            .repository
            .list_posts(&FeedRepositoryQuery {
                cursor,
                author_ids,
                excluded_author_ids,
                limit: limit + 1,
            })
            .await?;

        let has_more = rows.len() > limit;
        rows.truncate(limit);
        let next_cursor = rows
            .last()
            .filter(|_| has_more)
            .map(|post| post.post_id.clone());

        let flags = match viewer_id.as_deref() {
            Some(viewer_id) if !rows.is_empty() => {
                let post_ids: Vec<String> = rows.iter().map(|post| post.post_id.clone()).collect();
                self.repository
                    .interaction_flags(viewer_id, &post_ids)
                    .await?
            }
            _ => Default::default(),
        };

        let posts = rows
            .into_iter()
            .map(|post| FeedPost {
                flags: flags.get(&post.post_id).copied().unwrap_or_default(),
                post,
            })
            .collect();

        Ok(FeedPage {
            posts,
            pagination: Pagination {
                has_more,
                next_cursor,
            },
        })
    }
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

#[cfg(test)]
mod tests {
    use super::*;

    fn post(post_id: &str, created_at_ms: i64, is_pinned: bool) -> Post {
        Post {
            post_id: post_id.to_string(),
            author_id: "author".to_string(),
            body: "body".to_string(),
            parent_post_id: None,
            is_pinned,
            like_count: 0,
            repost_count: 0,
            reply_count: 0,
            created_at_ms,
            updated_at_ms: created_at_ms,
            deleted_at_ms: None,
        }
    }

    #[test]
    fn pinned_posts_sort_before_newer_posts() {
        let mut posts = vec![
            post("a", 10, false),
            post("b", 30, false),
            post("c", 5, true),
            post("d", 30, false),
        ];
        posts.sort_by(compare_feed_order);
        let order: Vec<_> = posts.iter().map(|post| post.post_id.as_str()).collect();
        assert_eq!(order, vec!["c", "d", "b", "a"]);
    }

    #[test]
    fn cursor_precedes_only_later_rows() {
        let cursor = FeedCursorKey::from_post(&post("b", 30, false));
        assert!(cursor.precedes(&post("a", 30, false)));
        assert!(cursor.precedes(&post("z", 10, false)));
        assert!(!cursor.precedes(&post("b", 30, false)));
        assert!(!cursor.precedes(&post("c", 30, false)));
        assert!(!cursor.precedes(&post("p", 1, true)));
    }

    #[test]
    fn limit_bounds_are_enforced() {
        assert_eq!(normalize_limit(None).unwrap(), 20);
        assert!(normalize_limit(Some(0)).is_err());
        assert!(normalize_limit(Some(101)).is_err());
        assert_eq!(normalize_limit(Some(100)).unwrap(), 100);
    }

    #[test]
    fn filter_parse_accepts_known_values() {
        assert_eq!(FeedFilter::parse(None).unwrap(), FeedFilter::All);
        assert_eq!(
            FeedFilter::parse(Some("following")).unwrap(),
            FeedFilter::Following
        );
        assert!(FeedFilter::parse(Some("trending")).is_err());
    }

    #[test]
    fn feed_post_flattens_flags() {
        let value = serde_json::to_value(FeedPost {
            post: post("a", 1, false),
            flags: InteractionFlags {
                is_liked: true,
                ..Default::default()
            },
        })
        .unwrap();
        assert_eq!(value["isLiked"], true);
        assert_eq!(value["postId"], "a");
        assert_eq!(value["isBookmarked"], false);
    }
}
