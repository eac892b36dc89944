use std::collections::HashMap;

use crate::DomainResult;
use crate::feed::{FeedCursorKey, InteractionFlags};
use crate::posts::Post;
use crate::ports::BoxFuture;

#[derive(Clone, Debug)]
pub struct FeedRepositoryQuery {
    pub cursor: Option<FeedCursorKey>,
    /// `None` means every author.
    pub author_ids: Option<Vec<String>>,
    pub excluded_author_ids: Vec<String>,
    pub limit: usize,
}

#[allow(clippy::needless_pass_by_value)]
pub trait FeedRepository: Send + Sync {
    fn get_post(&self, post_id: &str) -> BoxFuture<'_, DomainResult<Option<Post>>>;

    fn list_following_ids(&self, user_id: &str) -> BoxFuture<'_, DomainResult<Vec<String>>>;

    /// Authors the viewer blocked or muted, plus authors that blocked the viewer.
    fn list_hidden_author_ids(&self, viewer_id: &str)
    -> BoxFuture<'_, DomainResult<Vec<String>>>;

    /// Live posts ordered pinned first, then `created_at_ms` and `post_id`
    /// descending, strictly after `cursor` when present.
    fn list_posts(&self, query: &FeedRepositoryQuery) -> BoxFuture<'_, DomainResult<Vec<Post>>>;

    /// One batched existence check for the viewer's like/repost/bookmark rows.
    fn interaction_flags(
        &self,
        viewer_id: &str,
        post_ids: &[String],
    ) -> BoxFuture<'_, DomainResult<HashMap<String, InteractionFlags>>>;
}
