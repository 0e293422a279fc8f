//! The owned sync client.
//!
//! [`SyncClient`] wires the cache, the mutation executor and the refetch
//! scheduler together. Nothing is global: two clients never share state.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::{QueryCache, QuerySubscription};
use crate::mutation::{MutationExecutor, MutationRequest, PendingMutation};
use crate::remote::RemoteSource;
use crate::scheduler::{RefetchScheduler, invalidation_channel};
use crate::{
    EntityStore, NewPost, Post, PostId, PostMutation, PostUpdate, QueryKey, ReactionKind,
    Reactions, SyncConfig, SyncError, UserId,
};

/// Client-side view of the remote posts, kept in sync through queries and
/// mutations.
pub struct SyncClient {
    cache: Arc<QueryCache>,
    executor: MutationExecutor,
    shutdown_tx: watch::Sender<bool>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl SyncClient {
    /// Validate the configuration and start the refetch scheduler.
    pub async fn start(remote: Arc<dyn RemoteSource>, config: SyncConfig) -> Result<Self, SyncError> {
        config.validate()?;
        info!(
            keep_unused_secs = config.keep_unused_for.as_secs(),
            refetch_on_subscribe = ?config.refetch_on_subscribe,
            "starting sync client"
        );

        let cache = QueryCache::new(Arc::clone(&remote), config);
        let (invalidations_tx, invalidations_rx) = invalidation_channel();
        let executor = MutationExecutor::new(Arc::clone(&cache), remote, invalidations_tx);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = RefetchScheduler::new(Arc::clone(&cache), invalidations_rx);
        let handle = tokio::spawn(scheduler.run(shutdown_rx));

        Ok(Self {
            cache,
            executor,
            shutdown_tx,
            scheduler: Mutex::new(Some(handle)),
        })
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    pub fn subscribe(&self, key: QueryKey) -> QuerySubscription {
        self.cache.subscribe(key)
    }

    /// Subscribe to the full post list.
    pub fn posts(&self) -> QuerySubscription {
        self.subscribe(QueryKey::GetPosts)
    }

    /// Subscribe to the posts of one author.
    pub fn posts_by_user(&self, user: UserId) -> QuerySubscription {
        self.subscribe(QueryKey::GetPostsByUserId(user))
    }

    pub fn mutate(&self, request: impl Into<MutationRequest>) -> PendingMutation {
        self.executor.mutate(request)
    }

    pub fn add_new_post(&self, post: NewPost) -> PendingMutation {
        self.mutate(PostMutation::AddNewPost(post))
    }

    pub fn update_post(&self, update: PostUpdate) -> PendingMutation {
        self.mutate(PostMutation::UpdatePost(update))
    }

    pub fn delete_post(&self, id: PostId) -> PendingMutation {
        self.mutate(PostMutation::DeletePost(id))
    }

    /// Replace a post's reaction counters, patching the post list right away.
    pub fn add_reaction(&self, post_id: PostId, reactions: Reactions) -> PendingMutation {
        self.mutate(PostMutation::AddReaction { post_id, reactions })
    }

    /// Add one reaction of `kind` to a post, counting from the cached list.
    ///
    /// Fails with [`SyncError::NotFound`] if the post list is not loaded or
    /// does not contain the post.
    pub fn react(&self, post_id: PostId, kind: ReactionKind) -> PendingMutation {
        let Some(current) = self.select_post_by_id(&post_id) else {
            return PendingMutation::ready(None, Err(SyncError::NotFound(post_id)));
        };
        debug!(id = %post_id, %kind, "reacting");
        self.add_reaction(post_id, current.reactions.incremented(kind))
    }

    fn all_posts(&self) -> Option<Arc<EntityStore<Post>>> {
        self.cache.data(&QueryKey::GetPosts)
    }

    /// Every cached post, newest first. Empty until the post list is loaded.
    pub fn select_all_posts(&self) -> Vec<Post> {
        self.all_posts()
            .map(|store| store.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn select_post_ids(&self) -> Vec<PostId> {
        self.all_posts()
            .map(|store| store.ids().to_vec())
            .unwrap_or_default()
    }

    pub fn select_post_by_id(&self, id: &PostId) -> Option<Post> {
        self.all_posts()?.get(id).cloned()
    }

    /// Posts by one author, filtered from the full list.
    pub fn select_posts_by_user(&self, user: UserId) -> Vec<Post> {
        self.all_posts()
            .map(|store| {
                store
                    .filter(|post| post.user_id == Some(user))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Stop the refetch scheduler and wait for it to exit.
    ///
    /// Mutations still settle afterwards; their invalidations refetch inline.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let handle = self
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                debug!(error = %err, "refetch scheduler task ended abnormally");
            }
        }
        info!("sync client shut down");
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RawPost;
    use crate::remote::{MemoryRemote, RemoteOp};
    use pretty_assertions::assert_eq;

    fn raw(id: u64, user: u64) -> RawPost {
        RawPost {
            id: PostId::from(id),
            title: format!("post {id}"),
            body: "body".to_string(),
            user_id: Some(UserId(user)),
            date: None,
            reactions: None,
        }
    }

    async fn loaded(remote: Arc<MemoryRemote>) -> (SyncClient, QuerySubscription) {
        let client = SyncClient::start(remote, SyncConfig::default()).await.unwrap();
        let mut posts = client.posts();
        posts.wait_settled().await.unwrap();
        (client, posts)
    }

    #[tokio::test]
    async fn test_selectors_empty_before_load() {
        let client = SyncClient::start(Arc::new(MemoryRemote::new()), SyncConfig::default())
            .await
            .unwrap();
        assert!(client.select_all_posts().is_empty());
        assert!(client.select_post_ids().is_empty());
        assert_eq!(client.select_post_by_id(&PostId::from(1)), None);
    }

    #[tokio::test]
    async fn test_selectors_read_post_list() {
        let remote = Arc::new(MemoryRemote::with_posts([raw(1, 1), raw(2, 2), raw(3, 1)]));
        let (client, _posts) = loaded(remote).await;

        let ids: Vec<_> = client.select_post_ids().iter().map(|id| id.to_string()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(client.select_posts_by_user(UserId(1)).len(), 2);
        assert_eq!(client.select_post_by_id(&PostId::from(2)).unwrap().title, "post 2");
    }

    #[tokio::test]
    async fn test_react_increments_from_cache() {
        let remote = Arc::new(MemoryRemote::with_posts([raw(1, 1)]));
        let (client, _posts) = loaded(remote.clone()).await;

        client.react(PostId::from(1), ReactionKind::Heart).await.unwrap();
        client.react(PostId::from(1), ReactionKind::Heart).await.unwrap();

        let post = client.select_post_by_id(&PostId::from(1)).unwrap();
        assert_eq!(post.reactions.heart, 2);
        assert_eq!(remote.snapshot()[0].reactions.unwrap().heart, 2);
    }

    #[tokio::test]
    async fn test_react_unknown_post() {
        let remote = Arc::new(MemoryRemote::with_posts([raw(1, 1)]));
        let (client, _posts) = loaded(remote.clone()).await;

        let result = client.react(PostId::from(9), ReactionKind::Wow).await;
        assert_eq!(result, Err(SyncError::NotFound(PostId::from(9))));
        assert_eq!(remote.calls(RemoteOp::Update), 0);
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let config = SyncConfig::builder()
            .refetch_on_subscribe(crate::RefetchOnSubscribe::IfOlderThan(std::time::Duration::ZERO))
            .build();
        let result = SyncClient::start(Arc::new(MemoryRemote::new()), config).await;
        assert!(matches!(result, Err(SyncError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_mutations_refetch_after_shutdown() {
        let remote = Arc::new(MemoryRemote::with_posts([raw(1, 1)]));
        let (client, mut posts) = loaded(remote.clone()).await;
        client.shutdown().await;

        client
            .add_new_post(NewPost::new("later", "body", UserId(1)))
            .await
            .unwrap();
        let state = posts.wait_for(|s| s.is_success() && s.posts().len() == 2).await.unwrap();
        assert_eq!(state.posts()[0].title, "later");
    }
}
