//! Refetch scheduling.
//!
//! Invalidation only computes which cache entries are stale. The
//! [`RefetchScheduler`] receives those results as [`InvalidationEvent`]s and
//! decides when to refetch them.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::QueryKey;
use crate::cache::QueryCache;
use crate::tags::Tag;

/// Outcome of invalidating a set of tags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationEvent {
    /// Tags that were invalidated.
    pub tags: Vec<Tag>,
    /// Cache keys that provided at least one of them.
    pub keys: BTreeSet<QueryKey>,
}

impl InvalidationEvent {
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

pub type InvalidationSender = mpsc::UnboundedSender<InvalidationEvent>;
pub type InvalidationReceiver = mpsc::UnboundedReceiver<InvalidationEvent>;

pub fn invalidation_channel() -> (InvalidationSender, InvalidationReceiver) {
    mpsc::unbounded_channel()
}

/// Turns invalidation events into refetches.
///
/// Every affected entry is refetched, subscribed or not. An entry that is
/// already loading gets one follow-up fetch queued behind the current one.
pub struct RefetchScheduler {
    cache: Arc<QueryCache>,
    events: InvalidationReceiver,
}

impl RefetchScheduler {
    pub fn new(cache: Arc<QueryCache>, events: InvalidationReceiver) -> Self {
        Self { cache, events }
    }

    /// Process events until shutdown is signalled or every sender is gone.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        info!("refetch scheduler starting");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("refetch scheduler received shutdown signal");
                        break;
                    }
                }
                event = self.events.recv() => {
                    let Some(event) = event else {
                        debug!("refetch scheduler: all senders dropped");
                        break;
                    };
                    self.dispatch(&event);
                }
            }
        }

        info!("refetch scheduler shut down");
    }

    /// Refetch every key of an event. Returns how many were cached.
    pub fn dispatch(&self, event: &InvalidationEvent) -> usize {
        dispatch(&self.cache, event)
    }
}

/// Refetch every key of an event against a cache.
pub(crate) fn dispatch(cache: &Arc<QueryCache>, event: &InvalidationEvent) -> usize {
    let refetched = event.keys.iter().filter(|key| cache.refetch(key)).count();
    debug!(
        tags = ?event.tags.iter().map(Tag::to_string).collect::<Vec<_>>(),
        keys = event.keys.len(),
        refetched,
        "scheduler: dispatched invalidation"
    );
    refetched
}
