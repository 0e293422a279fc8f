//! Client-side synchronization of posts and their reaction counts.
//!
//! This crate keeps a normalized local copy of remote posts consistent with
//! the server through request/response calls only.
//!
//! ## Features
//!
//! - **Entity Store**: records deduplicated by id with a stable, ordered view
//! - **Tag Index**: maps cache entries to the tags they provide
//! - **Query Cache**: shared fetches, subscriptions with a retention window,
//!   stale data kept through failed refetches
//! - **Mutations**: optimistic patches that roll back cleanly on failure
//! - **Refetch Scheduler**: turns tag invalidations into refetches
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use postsync::{MemoryRemote, ReactionKind, SyncClient, SyncConfig};
//!
//! # async fn demo() -> Result<(), postsync::SyncError> {
//! let client = SyncClient::start(Arc::new(MemoryRemote::new()), SyncConfig::default()).await?;
//! let mut posts = client.posts();
//! posts.wait_settled().await?;
//!
//! if let Some(first) = client.select_post_ids().first().cloned() {
//!     client.react(first, ReactionKind::Rocket).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
mod client;
pub mod config;
mod endpoints;
mod error;
pub mod mutation;
pub mod patch;
pub mod remote;
pub mod scheduler;
pub mod store;
pub mod tags;
mod types;

pub use cache::{QueryCache, QueryState, QueryStatus, QuerySubscription};
pub use client::SyncClient;
pub use config::{DEFAULT_KEEP_UNUSED_SECS, RefetchOnSubscribe, SyncConfig, SyncConfigBuilder};
pub use endpoints::{MutationOutput, PostMutation, QueryKey, normalize_post, normalize_posts};
pub use error::SyncError;
pub use mutation::{MutationExecutor, MutationRequest, PendingMutation};
pub use patch::{EntityEdit, FieldChange, OptimisticUpdate, PatchHandle, PatchId, PatchResolution};
pub use remote::{MemoryRemote, RemoteOp, RemoteSource};
pub use scheduler::{InvalidationEvent, RefetchScheduler};
pub use store::{Entity, EntityStore};
pub use tags::{POST_TAG, Tag, TagId, TagIndex};
pub use types::*;
