//! The remote source of truth, as consumed by the cache.
//!
//! The core does not assume a wire protocol. [`MemoryRemote`] is a complete
//! in-process implementation with call counting, a hold/release gate and
//! one-shot failure injection; `postsync-http` provides the REST one.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::trace;

use crate::{PostChanges, PostFields, PostId, RawPost, SyncError, UserId};

/// Operations the cache issues against the remote.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// All posts, or only those by one author.
    async fn list(&self, author: Option<UserId>) -> Result<Vec<RawPost>, SyncError>;

    /// Create a post and return it with its assigned identity.
    async fn create(&self, fields: &PostFields) -> Result<RawPost, SyncError>;

    /// Apply a partial update and return the stored post.
    async fn update(&self, id: &PostId, changes: &PostChanges) -> Result<RawPost, SyncError>;

    /// Delete a post.
    async fn delete(&self, id: &PostId) -> Result<(), SyncError>;
}

/// A remote operation, for counting, holding and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    List,
    Create,
    Update,
    Delete,
}

impl RemoteOp {
    fn index(self) -> usize {
        match self {
            RemoteOp::List => 0,
            RemoteOp::Create => 1,
            RemoteOp::Update => 2,
            RemoteOp::Delete => 3,
        }
    }
}

/// In-process remote backed by an ordered map.
pub struct MemoryRemote {
    posts: Mutex<BTreeMap<PostId, RawPost>>,
    next_id: AtomicU64,
    calls: [AtomicUsize; 4],
    held: watch::Sender<HashSet<RemoteOp>>,
    failures: Mutex<HashSet<RemoteOp>>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        let (held, _) = watch::channel(HashSet::new());
        Self {
            posts: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            calls: Default::default(),
            held,
            failures: Mutex::new(HashSet::new()),
        }
    }

    /// Seed the remote. Numeric ids advance the id counter past them.
    pub fn with_posts(posts: impl IntoIterator<Item = RawPost>) -> Self {
        let remote = Self::new();
        {
            let mut stored = remote.posts();
            for post in posts {
                if let Ok(n) = post.id.as_str().parse::<u64>() {
                    remote.next_id.fetch_max(n + 1, Ordering::SeqCst);
                }
                stored.insert(post.id.clone(), post);
            }
        }
        remote
    }

    /// Suspend calls of this kind until [`release`](Self::release).
    pub fn hold(&self, op: RemoteOp) {
        self.held.send_modify(|held| {
            held.insert(op);
        });
    }

    pub fn release(&self, op: RemoteOp) {
        self.held.send_modify(|held| {
            held.remove(&op);
        });
    }

    /// Make the next call of this kind fail with a transport error.
    pub fn fail_next(&self, op: RemoteOp) {
        self.failures().insert(op);
    }

    /// Number of calls of this kind issued so far, settled or not.
    pub fn calls(&self, op: RemoteOp) -> usize {
        self.calls[op.index()].load(Ordering::SeqCst)
    }

    /// The remote's current contents.
    pub fn snapshot(&self) -> Vec<RawPost> {
        self.posts().values().cloned().collect()
    }

    fn posts(&self) -> MutexGuard<'_, BTreeMap<PostId, RawPost>> {
        self.posts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn failures(&self) -> MutexGuard<'_, HashSet<RemoteOp>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count the call, wait out any hold, then consume an injected failure.
    async fn enter(&self, op: RemoteOp) -> Result<(), SyncError> {
        self.calls[op.index()].fetch_add(1, Ordering::SeqCst);
        trace!(?op, "memory remote: call issued");

        let mut held = self.held.subscribe();
        if held.wait_for(|held| !held.contains(&op)).await.is_err() {
            return Err(SyncError::Cancelled("memory remote dropped".to_string()));
        }

        if self.failures().remove(&op) {
            return Err(SyncError::Transport(format!("injected {op:?} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteSource for MemoryRemote {
    async fn list(&self, author: Option<UserId>) -> Result<Vec<RawPost>, SyncError> {
        self.enter(RemoteOp::List).await?;
        Ok(self
            .posts()
            .values()
            .filter(|post| author.is_none() || post.user_id == author)
            .cloned()
            .collect())
    }

    async fn create(&self, fields: &PostFields) -> Result<RawPost, SyncError> {
        self.enter(RemoteOp::Create).await?;
        let id = PostId::from(self.next_id.fetch_add(1, Ordering::SeqCst));
        let post = fields.clone().with_id(id.clone());
        self.posts().insert(id, post.clone());
        Ok(post)
    }

    async fn update(&self, id: &PostId, changes: &PostChanges) -> Result<RawPost, SyncError> {
        self.enter(RemoteOp::Update).await?;
        let mut posts = self.posts();
        let post = posts
            .get_mut(id)
            .ok_or_else(|| SyncError::NotFound(id.clone()))?;
        changes.apply_to(post);
        Ok(post.clone())
    }

    async fn delete(&self, id: &PostId) -> Result<(), SyncError> {
        self.enter(RemoteOp::Delete).await?;
        self.posts()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| SyncError::NotFound(id.clone()))
    }
}
