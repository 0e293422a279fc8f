//! Mutation execution with optimistic patches.
//!
//! A mutation runs in three steps:
//!
//! 1. Its optimistic update, if any, is applied to the target cache entry
//!    synchronously, before [`MutationExecutor::mutate`] returns.
//! 2. The remote call runs on a spawned task, so it settles even if the
//!    caller drops the [`PendingMutation`].
//! 3. On success the patch is committed and the mutation's tags are
//!    invalidated. On failure the patch is reverted and the error is returned
//!    to whoever awaits the handle.

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::QueryCache;
use crate::patch::{OptimisticUpdate, PatchHandle};
use crate::remote::RemoteSource;
use crate::scheduler::{self, InvalidationSender};
use crate::{MutationOutput, PostMutation, SyncError};

/// Future resolving to a mutation's outcome.
pub type MutationFuture = Pin<Box<dyn Future<Output = Result<MutationOutput, SyncError>> + Send>>;

/// A mutation plus the optimistic update to apply while it is in flight.
#[derive(Debug)]
pub struct MutationRequest {
    pub mutation: PostMutation,
    pub optimistic: Option<OptimisticUpdate>,
}

impl MutationRequest {
    /// A request using the mutation's default optimistic update.
    pub fn new(mutation: PostMutation) -> Self {
        let optimistic = mutation.optimistic_update();
        Self {
            mutation,
            optimistic,
        }
    }

    #[must_use]
    pub fn with_optimistic(mut self, update: OptimisticUpdate) -> Self {
        self.optimistic = Some(update);
        self
    }

    #[must_use]
    pub fn without_optimistic(mut self) -> Self {
        self.optimistic = None;
        self
    }
}

impl From<PostMutation> for MutationRequest {
    fn from(mutation: PostMutation) -> Self {
        Self::new(mutation)
    }
}

/// Runs mutations against the remote and reconciles the cache.
pub struct MutationExecutor {
    cache: Arc<QueryCache>,
    remote: Arc<dyn RemoteSource>,
    invalidations: InvalidationSender,
}

impl MutationExecutor {
    pub fn new(
        cache: Arc<QueryCache>,
        remote: Arc<dyn RemoteSource>,
        invalidations: InvalidationSender,
    ) -> Self {
        Self {
            cache,
            remote,
            invalidations,
        }
    }

    /// Start a mutation. The optimistic patch is visible once this returns.
    pub fn mutate(&self, request: impl Into<MutationRequest>) -> PendingMutation {
        self.submit(request.into())
    }

    #[tracing::instrument(skip(self, request), fields(endpoint = request.mutation.endpoint()))]
    fn submit(&self, request: MutationRequest) -> PendingMutation {
        let MutationRequest {
            mutation,
            optimistic,
        } = request;

        if let Err(err) = mutation.validate() {
            debug!(error = %err, "mutation rejected before dispatch");
            return PendingMutation::ready(None, Err(err));
        }

        let patch = optimistic.and_then(|update| self.cache.apply_patch(update));
        if let Some(handle) = &patch {
            debug!(patch = %handle.id, key = %handle.key, applied = handle.applied, "optimistic patch applied");
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            if let Some(handle) = &patch {
                self.cache.revert_patch(handle);
            }
            let err = SyncError::Cancelled("no async runtime to run the mutation on".to_string());
            return PendingMutation::ready(patch, Err(err));
        };

        let settle = Settle {
            cache: Arc::clone(&self.cache),
            remote: Arc::clone(&self.remote),
            invalidations: self.invalidations.clone(),
            patch: patch.clone(),
        };
        let task = runtime.spawn(settle.run(mutation));

        PendingMutation {
            patch,
            outcome: Outcome::Running(task),
        }
    }
}

/// Everything the spawned task needs to finish a mutation.
struct Settle {
    cache: Arc<QueryCache>,
    remote: Arc<dyn RemoteSource>,
    invalidations: InvalidationSender,
    patch: Option<PatchHandle>,
}

impl Settle {
    async fn run(self, mutation: PostMutation) -> Result<MutationOutput, SyncError> {
        let endpoint = mutation.endpoint();
        let output = match mutation.execute(self.remote.as_ref()).await {
            Ok(output) => output,
            Err(err) => {
                warn!(endpoint, error = %err, "mutation failed");
                if let Some(handle) = &self.patch {
                    let resolution = self.cache.revert_patch(handle);
                    debug!(patch = %handle.id, ?resolution, "optimistic patch resolved");
                }
                return Err(err);
            }
        };

        if let Some(handle) = &self.patch {
            let resolution = self.cache.settle_patch(handle);
            debug!(patch = %handle.id, ?resolution, "optimistic patch resolved");
        }

        match (&mutation, &output) {
            (PostMutation::DeletePost(_), MutationOutput::Deleted(id)) => {
                let touched = self.cache.remove_post(id);
                debug!(id = %id, touched, "deleted post removed from cache");
            }
            (PostMutation::AddReaction { post_id, .. }, MutationOutput::Updated(post)) => {
                self.cache
                    .merge_reactions(post_id, post.reactions, self.patch.as_ref());
            }
            _ => {}
        }

        let tags = mutation.invalidates_tags();
        if !tags.is_empty() {
            let event = self.cache.invalidate_tags(&tags);
            if !event.is_empty() {
                if let Err(unsent) = self.invalidations.send(event) {
                    // Scheduler is gone; refetch directly.
                    scheduler::dispatch(&self.cache, &unsent.0);
                }
            }
        }

        debug!(endpoint, "mutation settled");
        Ok(output)
    }
}

enum Outcome {
    Ready(Result<MutationOutput, SyncError>),
    Running(JoinHandle<Result<MutationOutput, SyncError>>),
}

/// Handle to an in-flight mutation.
///
/// Await it (or call [`result`](Self::result)) for the outcome. Dropping it
/// does not cancel the remote call.
pub struct PendingMutation {
    patch: Option<PatchHandle>,
    outcome: Outcome,
}

impl PendingMutation {
    pub(crate) fn ready(patch: Option<PatchHandle>, result: Result<MutationOutput, SyncError>) -> Self {
        Self {
            patch,
            outcome: Outcome::Ready(result),
        }
    }

    /// The optimistic patch applied for this mutation, if any.
    pub fn patch(&self) -> Option<&PatchHandle> {
        self.patch.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        match &self.outcome {
            Outcome::Ready(_) => true,
            Outcome::Running(task) => task.is_finished(),
        }
    }

    /// Wait for the remote call and cache reconciliation to finish.
    pub async fn result(self) -> Result<MutationOutput, SyncError> {
        match self.outcome {
            Outcome::Ready(result) => result,
            Outcome::Running(task) => task.await?,
        }
    }
}

impl IntoFuture for PendingMutation {
    type Output = Result<MutationOutput, SyncError>;
    type IntoFuture = MutationFuture;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.result())
    }
}

impl std::fmt::Debug for PendingMutation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingMutation")
            .field("patch", &self.patch)
            .field("finished", &self.is_finished())
            .finish()
    }
}
