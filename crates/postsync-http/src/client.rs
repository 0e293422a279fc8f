//! `RemoteSource` over a JSON REST server.
//!
//! The server exposes a `/posts` collection in the json-server shape:
//!
//! | operation | request                  |
//! |-----------|--------------------------|
//! | list      | `GET /posts[?userId=N]`  |
//! | create    | `POST /posts`            |
//! | update    | `PATCH /posts/{id}`      |
//! | delete    | `DELETE /posts/{id}`     |

use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use postsync::{PostChanges, PostFields, PostId, RawPost, RemoteSource, SyncError, UserId};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::{HttpError, HttpRemoteConfig};

/// What a request targets, which decides how its failures are handled.
#[derive(Debug, Clone, Copy)]
enum Call<'a> {
    /// `GET` of the collection. A 404 means the server has no posts route.
    List,
    /// `POST` to the collection. Not safe to repeat once the server may
    /// have accepted it.
    Create,
    /// `PATCH`/`DELETE` of one post. A 404 means the post is gone.
    Item(&'a PostId),
}

impl Call<'_> {
    fn may_retry(self, err: &HttpError) -> bool {
        match self {
            Call::Create => err.is_safe_to_resend(),
            Call::List | Call::Item(_) => err.is_transient(),
        }
    }
}

/// Client for the posts REST API.
pub struct HttpRemote {
    http: Client,
    base_url: Url,
    config: HttpRemoteConfig,
}

impl HttpRemote {
    pub fn new(config: HttpRemoteConfig) -> Result<Self, HttpError> {
        let base_url = config.parsed_base_url()?;
        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            http,
            base_url,
            config,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn posts_url(&self) -> Result<Url, HttpError> {
        self.base_url
            .join("posts")
            .map_err(|e| HttpError::InvalidUrl(e.to_string()))
    }

    fn post_url(&self, id: &PostId) -> Result<Url, HttpError> {
        let mut url = self.posts_url()?;
        url.path_segments_mut()
            .map_err(|()| HttpError::InvalidUrl(self.base_url.to_string()))?
            .push(id.as_str());
        Ok(url)
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.config.initial_backoff,
            max_interval: self.config.max_backoff,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Send a request, retrying failures `call` allows with exponential
    /// backoff.
    async fn send(
        &self,
        op: &'static str,
        call: Call<'_>,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<String, HttpError> {
        let mut backoff = self.backoff();
        let mut attempt = 0;

        loop {
            let result = match build().send().await {
                Ok(response) => Self::handle_response(response, call).await,
                Err(e) => Err(HttpError::from(e)),
            };

            match result {
                Ok(body) => return Ok(body),
                Err(e) if call.may_retry(&e) && attempt < self.config.max_retries => {
                    attempt += 1;
                    let wait = match &e {
                        HttpError::RateLimited {
                            retry_after_secs: Some(secs),
                        } => Duration::from_secs(*secs),
                        _ => backoff.next_backoff().unwrap_or(self.config.max_backoff),
                    };
                    warn!(
                        op,
                        attempt,
                        backoff_ms = wait.as_millis() as u64,
                        error = %e,
                        "transient error, retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn handle_response(response: reqwest::Response, call: Call<'_>) -> Result<String, HttpError> {
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            return Err(HttpError::RateLimited { retry_after_secs });
        }

        if let (StatusCode::NOT_FOUND, Call::Item(id)) = (status, call) {
            return Err(HttpError::NotFound(id.to_string()));
        }

        let body = response.text().await?;
        if !status.is_success() {
            return Err(HttpError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    fn parse<T: DeserializeOwned>(body: &str) -> Result<T, HttpError> {
        Ok(serde_json::from_str(body)?)
    }
}

#[async_trait]
impl RemoteSource for HttpRemote {
    #[tracing::instrument(skip(self))]
    async fn list(&self, author: Option<UserId>) -> Result<Vec<RawPost>, SyncError> {
        let url = self.posts_url()?;
        let body = self
            .send("list", Call::List, || {
                let request = self.http.get(url.clone());
                match author {
                    Some(user) => request.query(&[("userId", user.0)]),
                    None => request,
                }
            })
            .await?;
        let posts: Vec<RawPost> = Self::parse(&body)?;
        debug!(count = posts.len(), "listed posts");
        Ok(posts)
    }

    #[tracing::instrument(skip(self, fields))]
    async fn create(&self, fields: &PostFields) -> Result<RawPost, SyncError> {
        let url = self.posts_url()?;
        let body = self
            .send("create", Call::Create, || self.http.post(url.clone()).json(fields))
            .await?;
        let post: RawPost = Self::parse(&body)?;
        debug!(id = %post.id, "created post");
        Ok(post)
    }

    #[tracing::instrument(skip(self, id, changes), fields(id = %id))]
    async fn update(&self, id: &PostId, changes: &PostChanges) -> Result<RawPost, SyncError> {
        let url = self.post_url(id)?;
        let body = self
            .send("update", Call::Item(id), || self.http.patch(url.clone()).json(changes))
            .await?;
        Ok(Self::parse(&body)?)
    }

    #[tracing::instrument(skip(self, id), fields(id = %id))]
    async fn delete(&self, id: &PostId) -> Result<(), SyncError> {
        let url = self.post_url(id)?;
        self.send("delete", Call::Item(id), || self.http.delete(url.clone()))
            .await?;
        Ok(())
    }
}
