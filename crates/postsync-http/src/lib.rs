//! REST remote source for postsync.
//!
//! [`HttpRemote`] implements [`postsync::RemoteSource`] against a
//! json-server style `/posts` collection.
//!
//! ## Features
//!
//! - **Client**: list/create/update/delete over JSON
//! - **Retry**: exponential backoff on transient failures and rate limits

mod client;
mod config;
mod error;

pub use client::HttpRemote;
pub use config::HttpRemoteConfig;
pub use error::HttpError;
