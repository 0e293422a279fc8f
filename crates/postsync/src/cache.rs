//! Query result cache.
//!
//! One entry per [`QueryKey`]. Entries move through
//! `Uninitialized -> Loading -> Success | Error` and go back to `Loading` only
//! when invalidated, explicitly refetched, or when a new subscription's
//! refetch policy asks for it. All state lives behind a single lock that is
//! never held across an `.await`, so every transition is atomic with respect
//! to other tasks.
//!
//! Fetches run on spawned tasks. A fetch that outlives its last subscriber
//! still completes and populates the cache.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::patch::{
    EntityEdit, FieldChange, OptimisticUpdate, PatchHandle, PatchId, PatchResolution, PatchStack,
};
use crate::remote::RemoteSource;
use crate::scheduler::InvalidationEvent;
use crate::tags::{Tag, TagIndex};
use crate::{
    EntityStore, Post, PostId, QueryKey, Reactions, RefetchOnSubscribe, SyncConfig, SyncError,
};

/// Lifecycle status of a cache entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueryStatus {
    #[default]
    Uninitialized,
    Loading,
    Success,
    Error,
}

/// What subscribers see of a cache entry.
#[derive(Debug, Clone, Default)]
pub struct QueryState {
    pub status: QueryStatus,
    /// Last successfully fetched snapshot, kept through later failures.
    pub data: Option<Arc<EntityStore<Post>>>,
    /// Error of the most recent fetch, if it failed.
    pub error: Option<SyncError>,
    /// Identifier of the most recently started fetch.
    pub request_id: u64,
    /// When the current data was fetched.
    pub fulfilled_at: Option<Instant>,
}

impl QueryState {
    /// Loading with nothing to show yet.
    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading && self.data.is_none()
    }

    /// Any fetch in flight, including background refetches.
    pub fn is_fetching(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.status, QueryStatus::Success | QueryStatus::Error)
    }

    /// Posts of the current snapshot in list order.
    pub fn posts(&self) -> Vec<Post> {
        self.data
            .as_deref()
            .map(|store| store.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Bookkeeping for one cached query.
struct CacheEntry {
    state: QueryState,
    updates_tx: watch::Sender<QueryState>,
    subscribers: usize,
    refetch_pending: bool,
    /// Bumped whenever the subscriber count changes to or from zero, so a
    /// stale eviction timer can tell it lost the race.
    retention_epoch: u64,
    patches: PatchStack,
}

impl CacheEntry {
    fn new() -> Self {
        let state = QueryState::default();
        let (updates_tx, _) = watch::channel(state.clone());
        Self {
            state,
            updates_tx,
            subscribers: 0,
            refetch_pending: false,
            retention_epoch: 0,
            patches: PatchStack::new(),
        }
    }

    fn publish(&self) {
        self.updates_tx.send_replace(self.state.clone());
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<QueryKey, CacheEntry>,
    tags: TagIndex<QueryKey>,
    next_request_id: u64,
    next_patch_id: u64,
}

impl CacheState {
    /// Move an entry to `Loading` and allocate a request id, unless a fetch is
    /// already in flight.
    fn begin_fetch(&mut self, key: &QueryKey) -> Option<u64> {
        let entry = self.entries.get_mut(key)?;
        if entry.state.status == QueryStatus::Loading {
            return None;
        }
        self.next_request_id += 1;
        entry.state.status = QueryStatus::Loading;
        entry.state.request_id = self.next_request_id;
        entry.publish();
        Some(self.next_request_id)
    }
}

/// Cache of query results keyed by endpoint and argument.
pub struct QueryCache {
    state: Mutex<CacheState>,
    remote: Arc<dyn RemoteSource>,
    config: SyncConfig,
}

impl QueryCache {
    pub fn new(remote: Arc<dyn RemoteSource>, config: SyncConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CacheState::default()),
            remote,
            config,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a subscriber, creating the entry and starting a fetch if needed.
    ///
    /// A subscription arriving while a fetch is in flight shares it.
    pub fn subscribe(self: &Arc<Self>, key: QueryKey) -> QuerySubscription {
        let (receiver, request_id) = {
            let mut state = self.lock();
            let entry = state.entries.entry(key.clone()).or_insert_with(CacheEntry::new);
            entry.subscribers += 1;
            if entry.subscribers == 1 {
                entry.retention_epoch += 1;
            }

            let wants_fetch = match entry.state.status {
                QueryStatus::Uninitialized | QueryStatus::Error => true,
                QueryStatus::Loading => false,
                QueryStatus::Success => self.is_stale(&entry.state),
            };
            trace!(key = %key, subscribers = entry.subscribers, wants_fetch, "cache: subscribed");

            let receiver = entry.updates_tx.subscribe();
            let request_id = if wants_fetch { state.begin_fetch(&key) } else { None };
            (receiver, request_id)
        };

        if let Some(request_id) = request_id {
            self.spawn_fetch(key.clone(), request_id);
        }

        QuerySubscription {
            cache: Arc::clone(self),
            key,
            receiver,
            active: true,
        }
    }

    fn is_stale(&self, state: &QueryState) -> bool {
        match self.config.refetch_on_subscribe {
            RefetchOnSubscribe::Never => false,
            RefetchOnSubscribe::Always => true,
            RefetchOnSubscribe::IfOlderThan(max_age) => state
                .fulfilled_at
                .is_none_or(|fetched| fetched.elapsed() >= max_age),
        }
    }

    /// Detach a subscriber. At zero the entry is evicted once the retention
    /// window passes without a new subscriber.
    pub fn unsubscribe(self: &Arc<Self>, key: &QueryKey) {
        let mut state = self.lock();
        let Some(entry) = state.entries.get_mut(key) else {
            return;
        };
        entry.subscribers = entry.subscribers.saturating_sub(1);
        trace!(key = %key, subscribers = entry.subscribers, "cache: unsubscribed");
        if entry.subscribers == 0 {
            entry.retention_epoch += 1;
            let epoch = entry.retention_epoch;
            drop(state);
            self.schedule_eviction(key.clone(), epoch);
        }
    }

    fn schedule_eviction(self: &Arc<Self>, key: QueryKey, epoch: u64) {
        let cache = Arc::clone(self);
        let keep_for = self.config.keep_unused_for;
        let spawned = spawn_detached(async move {
            tokio::time::sleep(keep_for).await;
            cache.evict_if_unused(&key, epoch);
        });
        if !spawned {
            // No runtime left to wait on; the retention window can't elapse.
            debug!("cache: no runtime for retention timer, keeping entry");
        }
    }

    fn evict_if_unused(&self, key: &QueryKey, epoch: u64) {
        let mut state = self.lock();
        let unused = state
            .entries
            .get(key)
            .is_some_and(|entry| entry.subscribers == 0 && entry.retention_epoch == epoch);
        if unused {
            if let Some(entry) = state.entries.remove(key) {
                debug!(key = %key, dropped_patches = entry.patches.len(), "cache: evicted unused entry");
            }
            state.tags.forget(key);
        }
    }

    /// Start a refetch for a key.
    ///
    /// If a fetch is already in flight, exactly one more is queued behind it.
    /// Returns `false` if the key is not cached.
    pub fn refetch(self: &Arc<Self>, key: &QueryKey) -> bool {
        let request_id = {
            let mut state = self.lock();
            let Some(entry) = state.entries.get_mut(key) else {
                return false;
            };
            if entry.state.status == QueryStatus::Loading {
                entry.refetch_pending = true;
                trace!(key = %key, "cache: refetch queued behind in-flight fetch");
                return true;
            }
            state.begin_fetch(key)
        };

        if let Some(request_id) = request_id {
            self.spawn_fetch(key.clone(), request_id);
        }
        true
    }

    fn spawn_fetch(self: &Arc<Self>, key: QueryKey, request_id: u64) {
        debug!(key = %key, request_id, "cache: fetch started");
        let cache = Arc::clone(self);
        let task_key = key.clone();
        let spawned = spawn_detached(async move {
            let result = task_key.fetch(cache.remote.as_ref()).await;
            cache.complete_fetch(&task_key, request_id, result);
        });
        if !spawned {
            self.complete_fetch(
                &key,
                request_id,
                Err(SyncError::Cancelled("no async runtime to fetch on".to_string())),
            );
        }
    }

    /// Commit a fetch result: normalized data and tags first, then status.
    fn complete_fetch(
        self: &Arc<Self>,
        key: &QueryKey,
        request_id: u64,
        result: Result<EntityStore<Post>, SyncError>,
    ) {
        let mut guard = self.lock();
        let state = &mut *guard;

        let recreated = !state.entries.contains_key(key);
        let entry = state.entries.entry(key.clone()).or_insert_with(CacheEntry::new);
        if request_id < entry.state.request_id {
            trace!(key = %key, request_id, "cache: ignoring result of superseded fetch");
            return;
        }
        entry.state.request_id = request_id;

        match result {
            Ok(store) => {
                let superseded = entry.patches.clear();
                entry.state.status = QueryStatus::Success;
                entry.state.error = None;
                entry.state.fulfilled_at = Some(Instant::now());
                let tags = key.provides_tags(&store);
                entry.state.data = Some(Arc::new(store));
                debug!(key = %key, request_id, superseded, tags = tags.len(), "cache: fetch succeeded");
                state.tags.record_provides(key, tags);
            }
            Err(err) => {
                warn!(key = %key, request_id, error = %err, "cache: fetch failed, keeping stale data");
                entry.state.status = QueryStatus::Error;
                entry.state.error = Some(err);
            }
        }

        let Some(entry) = state.entries.get_mut(key) else {
            return;
        };
        entry.publish();

        let follow_up = std::mem::take(&mut entry.refetch_pending);
        let epoch = (recreated && entry.subscribers == 0).then_some(entry.retention_epoch);
        let next_request = if follow_up { state.begin_fetch(key) } else { None };
        drop(guard);

        if let Some(epoch) = epoch {
            self.schedule_eviction(key.clone(), epoch);
        }
        if let Some(next_request) = next_request {
            self.spawn_fetch(key.clone(), next_request);
        }
    }

    /// Keys depending on any of the given tags. Scheduling their refetch is
    /// up to the caller.
    pub fn invalidate_tags(&self, tags: &[Tag]) -> InvalidationEvent {
        let keys = self.lock().tags.invalidate(tags);
        debug!(tags = ?tags.iter().map(Tag::to_string).collect::<Vec<_>>(), affected = keys.len(), "cache: tags invalidated");
        InvalidationEvent {
            tags: tags.to_vec(),
            keys,
        }
    }

    /// Current state of an entry, if cached.
    pub fn state_of(&self, key: &QueryKey) -> Option<QueryState> {
        self.lock().entries.get(key).map(|entry| entry.state.clone())
    }

    /// Current snapshot of an entry, if it has data.
    pub fn data(&self, key: &QueryKey) -> Option<Arc<EntityStore<Post>>> {
        self.lock()
            .entries
            .get(key)
            .and_then(|entry| entry.state.data.clone())
    }

    pub fn subscriber_count(&self, key: &QueryKey) -> usize {
        self.lock().entries.get(key).map_or(0, |entry| entry.subscribers)
    }

    pub fn outstanding_patches(&self, key: &QueryKey) -> usize {
        self.lock()
            .entries
            .get(key)
            .map_or(0, |entry| entry.patches.len())
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.lock().entries.contains_key(key)
    }

    /// Tags a key currently provides.
    pub fn provided_tags(&self, key: &QueryKey) -> Vec<Tag> {
        self.lock()
            .tags
            .provided_by(key)
            .map(|tags| tags.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Apply an optimistic update to its entry's snapshot.
    ///
    /// Returns `None` if the entry has no data to patch.
    pub fn apply_patch(&self, update: OptimisticUpdate) -> Option<PatchHandle> {
        let mut state = self.lock();
        state.next_patch_id += 1;
        let id = PatchId(state.next_patch_id);

        let Some(entry) = state.entries.get_mut(&update.key) else {
            debug!(key = %update.key, "cache: nothing cached to patch");
            return None;
        };
        let Some(data) = entry.state.data.as_mut() else {
            debug!(key = %update.key, "cache: entry has no data to patch");
            return None;
        };

        // Subscribers keep the snapshot they were handed; we patch a copy.
        let snapshot = Arc::make_mut(data);
        let edits = (update.recipe)(snapshot);
        let applied = entry.patches.push(snapshot, id, edits);
        entry.publish();

        Some(PatchHandle {
            key: update.key,
            id,
            applied,
        })
    }

    /// The remote call behind a patch succeeded.
    pub fn settle_patch(&self, handle: &PatchHandle) -> PatchResolution {
        let mut state = self.lock();
        let settled = state
            .entries
            .get_mut(&handle.key)
            .is_some_and(|entry| entry.patches.settle(handle.id));
        if settled {
            PatchResolution::Committed
        } else {
            trace!(patch = %handle.id, "cache: settled patch was already superseded");
            PatchResolution::Superseded
        }
    }

    /// The remote call behind a patch failed: restore the prior values.
    pub fn revert_patch(&self, handle: &PatchHandle) -> PatchResolution {
        let mut state = self.lock();
        let Some(entry) = state.entries.get_mut(&handle.key) else {
            debug!(patch = %handle.id, "cache: entry evicted, nothing to revert");
            return PatchResolution::Superseded;
        };
        let Some(data) = entry.state.data.as_mut() else {
            return PatchResolution::Superseded;
        };

        match entry.patches.revert(Arc::make_mut(data), handle.id) {
            Some(dropped) => {
                entry.publish();
                PatchResolution::Reverted { dropped }
            }
            None => {
                debug!(patch = %handle.id, "cache: snapshot replaced since patch, revert dropped");
                PatchResolution::Superseded
            }
        }
    }

    /// Remove a post from every cached snapshot. Returns the number of
    /// entries that held it.
    pub fn remove_post(&self, id: &PostId) -> usize {
        let mut state = self.lock();
        let mut touched = 0;
        for (key, entry) in state.entries.iter_mut() {
            let Some(data) = entry.state.data.as_mut() else {
                continue;
            };
            if !data.contains(id) {
                continue;
            }
            Arc::make_mut(data).remove(id);
            entry.publish();
            touched += 1;
            trace!(key = %key, id = %id, "cache: post removed from snapshot");
        }
        touched
    }

    /// Write a post's authoritative reaction counters into every snapshot
    /// that holds it.
    ///
    /// Where a later optimistic patch still overwrites the counters, the
    /// value goes under that patch instead, so the pending speculation stays
    /// visible and a revert lands on the server value. `confirmed` is the
    /// patch of the mutation that returned the counters. Returns the number
    /// of snapshots changed.
    pub fn merge_reactions(
        &self,
        id: &PostId,
        reactions: Reactions,
        confirmed: Option<&PatchHandle>,
    ) -> usize {
        let edit = EntityEdit::new(id.clone(), FieldChange::Reactions(reactions));
        let mut state = self.lock();
        let mut touched = 0;
        for (key, entry) in state.entries.iter_mut() {
            let Some(data) = entry.state.data.as_mut() else {
                continue;
            };
            if !data.contains(id) {
                continue;
            }
            let own = confirmed.filter(|handle| &handle.key == key).map(|handle| handle.id);
            if entry.patches.rebase(own, &edit) {
                trace!(key = %key, id = %id, "cache: reactions held under pending patch");
                continue;
            }
            if data.get(id).is_some_and(|post| post.reactions == reactions) {
                continue;
            }
            Arc::make_mut(data).update(id, |post| post.reactions = reactions);
            entry.publish();
            touched += 1;
        }
        touched
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }
}

/// Spawn onto the current Tokio runtime, if there is one.
fn spawn_detached<F>(future: F) -> bool
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
            true
        }
        Err(_) => false,
    }
}

/// A live subscription to one cache entry.
///
/// Dropping an active subscription unsubscribes it.
pub struct QuerySubscription {
    cache: Arc<QueryCache>,
    key: QueryKey,
    receiver: watch::Receiver<QueryState>,
    active: bool,
}

impl QuerySubscription {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// The entry's state as of the last update.
    pub fn current(&self) -> QueryState {
        self.receiver.borrow().clone()
    }

    /// Wait for the next update.
    pub async fn changed(&mut self) -> Result<QueryState, SyncError> {
        self.receiver
            .changed()
            .await
            .map_err(|_| SyncError::Cancelled(format!("{} was evicted", self.key)))?;
        Ok(self.current())
    }

    /// Wait until the state satisfies a predicate (checked immediately too).
    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(&QueryState) -> bool,
    ) -> Result<QueryState, SyncError> {
        let key = &self.key;
        self.receiver
            .wait_for(|state| predicate(state))
            .await
            .map(|state| QueryState::clone(&state))
            .map_err(|_| SyncError::Cancelled(format!("{key} was evicted")))
    }

    /// Wait until no fetch is in flight and the entry has settled.
    pub async fn wait_settled(&mut self) -> Result<QueryState, SyncError> {
        self.wait_for(QueryState::is_settled).await
    }

    /// Force a refetch of this entry.
    pub fn refetch(&self) -> bool {
        self.cache.refetch(&self.key)
    }

    /// Detach explicitly. Equivalent to dropping.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if std::mem::take(&mut self.active) {
            self.cache.unsubscribe(&self.key);
        }
    }
}

impl Drop for QuerySubscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for QuerySubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuerySubscription")
            .field("key", &self.key)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}
