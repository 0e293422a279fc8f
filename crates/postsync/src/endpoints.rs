//! Query and mutation endpoints for posts.
//!
//! Each endpoint knows which remote operation it issues, how the response is
//! normalized, and which tags it provides or invalidates.

use std::fmt;

use chrono::{DateTime, Duration, Utc};

use crate::patch::{EntityEdit, FieldChange, OptimisticUpdate};
use crate::remote::RemoteSource;
use crate::tags::{POST_TAG, Tag};
use crate::{
    EntityStore, NewPost, Post, PostChanges, PostId, PostUpdate, RawPost, Reactions, SyncError,
    UserId,
};

/// Cache key: an endpoint name plus its argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueryKey {
    /// Every post.
    GetPosts,
    /// Posts written by one author.
    GetPostsByUserId(UserId),
}

impl QueryKey {
    pub fn endpoint(&self) -> &'static str {
        match self {
            QueryKey::GetPosts => "getPosts",
            QueryKey::GetPostsByUserId(_) => "getPostsByUserId",
        }
    }

    fn author(&self) -> Option<UserId> {
        match self {
            QueryKey::GetPosts => None,
            QueryKey::GetPostsByUserId(user) => Some(*user),
        }
    }

    /// Tags a successful result of this query depends on.
    ///
    /// Only the full list provides the wildcard tag, so creating a post
    /// refreshes it but not the per-author lists.
    pub fn provides_tags(&self, data: &EntityStore<Post>) -> Vec<Tag> {
        let per_post = data.ids().iter().map(|id| Tag::id(POST_TAG, id));
        match self {
            QueryKey::GetPosts => std::iter::once(Tag::list(POST_TAG)).chain(per_post).collect(),
            QueryKey::GetPostsByUserId(_) => per_post.collect(),
        }
    }

    /// Issue the remote call and normalize the response.
    pub(crate) async fn fetch(&self, remote: &dyn RemoteSource) -> Result<EntityStore<Post>, SyncError> {
        let raw = remote.list(self.author()).await?;
        Ok(normalize_posts(raw, Utc::now()))
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryKey::GetPosts => write!(f, "{}(undefined)", self.endpoint()),
            QueryKey::GetPostsByUserId(user) => write!(f, "{}({})", self.endpoint(), user),
        }
    }
}

/// Normalize a list response into an entity store.
///
/// Posts without a date are spaced one minute apart going back from `now`,
/// in response order. Posts without reactions get zeroed counters.
pub fn normalize_posts(raw: Vec<RawPost>, now: DateTime<Utc>) -> EntityStore<Post> {
    let mut minutes = 1;
    let posts = raw.into_iter().map(|post| {
        let fallback = if post.date.is_none() {
            let date = now - Duration::minutes(minutes);
            minutes += 1;
            date
        } else {
            now
        };
        normalize_post(post, fallback)
    });
    EntityStore::from_records(posts)
}

/// Normalize one post, using `fallback_date` if it has none.
pub fn normalize_post(raw: RawPost, fallback_date: DateTime<Utc>) -> Post {
    Post {
        id: raw.id,
        title: raw.title,
        body: raw.body,
        user_id: raw.user_id,
        date: raw.date.unwrap_or(fallback_date),
        reactions: raw.reactions.unwrap_or_default(),
    }
}

/// A write against the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostMutation {
    AddNewPost(NewPost),
    UpdatePost(PostUpdate),
    DeletePost(PostId),
    /// Replace a post's reaction counters.
    AddReaction { post_id: PostId, reactions: Reactions },
}

/// What a settled mutation returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutput {
    Created(Post),
    Updated(Post),
    Deleted(PostId),
}

impl MutationOutput {
    /// The authoritative post, for creates and updates.
    pub fn post(&self) -> Option<&Post> {
        match self {
            MutationOutput::Created(post) | MutationOutput::Updated(post) => Some(post),
            MutationOutput::Deleted(_) => None,
        }
    }
}

impl PostMutation {
    pub fn endpoint(&self) -> &'static str {
        match self {
            PostMutation::AddNewPost(_) => "addNewPost",
            PostMutation::UpdatePost(_) => "updatePost",
            PostMutation::DeletePost(_) => "deletePost",
            PostMutation::AddReaction { .. } => "addReaction",
        }
    }

    /// Reject malformed requests before anything is patched or sent.
    pub fn validate(&self) -> Result<(), SyncError> {
        match self {
            PostMutation::AddNewPost(post) => post.validate(),
            PostMutation::UpdatePost(update) => update.validate(),
            PostMutation::DeletePost(_) | PostMutation::AddReaction { .. } => Ok(()),
        }
    }

    /// Tags whose dependents must refetch once this mutation succeeds.
    ///
    /// Reactions declare none: the optimistic value already matches what the
    /// remote stores.
    pub fn invalidates_tags(&self) -> Vec<Tag> {
        match self {
            PostMutation::AddNewPost(_) => vec![Tag::list(POST_TAG)],
            PostMutation::UpdatePost(update) => vec![Tag::id(POST_TAG, &update.id)],
            PostMutation::DeletePost(id) => vec![Tag::id(POST_TAG, id)],
            PostMutation::AddReaction { .. } => Vec::new(),
        }
    }

    /// The speculative edit this mutation applies by default, if any.
    pub fn optimistic_update(&self) -> Option<OptimisticUpdate> {
        match self {
            PostMutation::AddReaction { post_id, reactions } => {
                let edit = EntityEdit::new(post_id.clone(), FieldChange::Reactions(*reactions));
                Some(OptimisticUpdate::new(QueryKey::GetPosts, move |_| vec![edit]))
            }
            _ => None,
        }
    }

    /// Issue the remote call.
    pub(crate) async fn execute(&self, remote: &dyn RemoteSource) -> Result<MutationOutput, SyncError> {
        let now = Utc::now();
        match self {
            PostMutation::AddNewPost(post) => {
                let raw = remote.create(&post.clone().into_fields(now)).await?;
                Ok(MutationOutput::Created(normalize_post(raw, now)))
            }
            PostMutation::UpdatePost(update) => {
                let changes = PostChanges {
                    title: Some(update.title.clone()),
                    body: Some(update.body.clone()),
                    user_id: update.user_id,
                    date: Some(now),
                    reactions: None,
                };
                let raw = remote.update(&update.id, &changes).await?;
                Ok(MutationOutput::Updated(normalize_post(raw, now)))
            }
            PostMutation::DeletePost(id) => {
                remote.delete(id).await?;
                Ok(MutationOutput::Deleted(id.clone()))
            }
            PostMutation::AddReaction { post_id, reactions } => {
                let changes = PostChanges {
                    reactions: Some(*reactions),
                    ..PostChanges::default()
                };
                let raw = remote.update(post_id, &changes).await?;
                Ok(MutationOutput::Updated(normalize_post(raw, now)))
            }
        }
    }
}
