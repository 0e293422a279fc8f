//! Core record types for posts and their reaction counters.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::SyncError;

/// Identity of a post.
///
/// Remote servers emit ids as either JSON numbers or strings, so the id is
/// kept in its string form. Ordering is lexicographic on that form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PostId(String);

impl PostId {
    /// Create an id from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The string form of this id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for PostId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for PostId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PostId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Serialize for PostId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // Numeric ids go back out as numbers so json-server keeps its types.
        match self.0.parse::<u64>() {
            Ok(n) => serializer.serialize_u64(n),
            Err(_) => serializer.serialize_str(&self.0),
        }
    }
}

impl<'de> Deserialize<'de> for PostId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Number(u64),
            Text(String),
        }

        Ok(match Wire::deserialize(deserializer)? {
            Wire::Number(n) => Self(n.to_string()),
            Wire::Text(s) => Self(s),
        })
    }
}

/// Reference to the author of a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Number(u64),
            Text(String),
        }

        match Wire::deserialize(deserializer)? {
            Wire::Number(n) => Ok(Self(n)),
            Wire::Text(s) => s
                .trim()
                .parse()
                .map(Self)
                .map_err(|_| serde::de::Error::custom(format!("invalid user id: {s:?}"))),
        }
    }
}

/// The fixed set of reactions a post can receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReactionKind {
    ThumbsUp,
    Wow,
    Heart,
    Rocket,
    Coffee,
}

impl ReactionKind {
    /// All reaction kinds in display order.
    pub const ALL: [ReactionKind; 5] = [
        ReactionKind::ThumbsUp,
        ReactionKind::Wow,
        ReactionKind::Heart,
        ReactionKind::Rocket,
        ReactionKind::Coffee,
    ];

    /// Wire name of this reaction.
    pub fn name(self) -> &'static str {
        match self {
            ReactionKind::ThumbsUp => "thumbsUp",
            ReactionKind::Wow => "wow",
            ReactionKind::Heart => "heart",
            ReactionKind::Rocket => "rocket",
            ReactionKind::Coffee => "coffee",
        }
    }
}

impl fmt::Display for ReactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ReactionKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReactionKind::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| SyncError::InvalidInput(format!("unknown reaction: {s}")))
    }
}

/// Reaction counters for a post. Unsigned, so they can never go negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Reactions {
    pub thumbs_up: u32,
    pub wow: u32,
    pub heart: u32,
    pub rocket: u32,
    pub coffee: u32,
}

impl Reactions {
    /// Current count for a reaction.
    pub fn get(&self, kind: ReactionKind) -> u32 {
        match kind {
            ReactionKind::ThumbsUp => self.thumbs_up,
            ReactionKind::Wow => self.wow,
            ReactionKind::Heart => self.heart,
            ReactionKind::Rocket => self.rocket,
            ReactionKind::Coffee => self.coffee,
        }
    }

    fn slot(&mut self, kind: ReactionKind) -> &mut u32 {
        match kind {
            ReactionKind::ThumbsUp => &mut self.thumbs_up,
            ReactionKind::Wow => &mut self.wow,
            ReactionKind::Heart => &mut self.heart,
            ReactionKind::Rocket => &mut self.rocket,
            ReactionKind::Coffee => &mut self.coffee,
        }
    }

    /// Copy of these counters with one reaction incremented.
    #[must_use]
    pub fn incremented(mut self, kind: ReactionKind) -> Self {
        let slot = self.slot(kind);
        *slot = slot.saturating_add(1);
        self
    }

    /// Sum of all counters.
    pub fn total(&self) -> u64 {
        ReactionKind::ALL
            .into_iter()
            .map(|kind| u64::from(self.get(kind)))
            .sum()
    }
}

/// A normalized post record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: PostId,
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub date: DateTime<Utc>,
    pub reactions: Reactions,
}

/// A post as returned by the remote source, before normalization.
///
/// Seeded servers commonly omit `date` and `reactions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPost {
    pub id: PostId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reactions: Option<Reactions>,
}

impl From<Post> for RawPost {
    fn from(post: Post) -> Self {
        Self {
            id: post.id,
            title: post.title,
            body: post.body,
            user_id: post.user_id,
            date: Some(post.date),
            reactions: Some(post.reactions),
        }
    }
}

/// Fields for a post that has not been created yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPost {
    pub title: String,
    pub body: String,
    pub user_id: Option<UserId>,
}

impl NewPost {
    pub fn new(title: impl Into<String>, body: impl Into<String>, user_id: UserId) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            user_id: Some(user_id),
        }
    }

    /// Reject posts with a blank title, blank body or no author.
    pub fn validate(&self) -> Result<(), SyncError> {
        require_fields(&self.title, &self.body, self.user_id)
    }

    /// Full field set sent to the remote: stamped with `date` and zeroed
    /// reactions.
    pub fn into_fields(self, date: DateTime<Utc>) -> PostFields {
        PostFields {
            title: self.title,
            body: self.body,
            user_id: self.user_id,
            date,
            reactions: Reactions::default(),
        }
    }
}

/// Every field of a post except its identity, as sent on create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostFields {
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub date: DateTime<Utc>,
    pub reactions: Reactions,
}

impl PostFields {
    /// Attach an identity assigned by the remote.
    pub fn with_id(self, id: PostId) -> RawPost {
        RawPost {
            id,
            title: self.title,
            body: self.body,
            user_id: self.user_id,
            date: Some(self.date),
            reactions: Some(self.reactions),
        }
    }
}

/// Replacement fields for an existing post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostUpdate {
    pub id: PostId,
    pub title: String,
    pub body: String,
    pub user_id: Option<UserId>,
}

impl PostUpdate {
    pub fn validate(&self) -> Result<(), SyncError> {
        require_fields(&self.title, &self.body, self.user_id)
    }
}

fn require_fields(title: &str, body: &str, user_id: Option<UserId>) -> Result<(), SyncError> {
    if title.trim().is_empty() {
        return Err(SyncError::InvalidInput("title must not be empty".to_string()));
    }
    if body.trim().is_empty() {
        return Err(SyncError::InvalidInput("body must not be empty".to_string()));
    }
    if user_id.is_none() {
        return Err(SyncError::InvalidInput("an author is required".to_string()));
    }
    Ok(())
}

/// Partial field set sent with an update. Absent fields are left untouched
/// by the remote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostChanges {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reactions: Option<Reactions>,
}

impl PostChanges {
    /// Apply these changes to a stored post.
    pub fn apply_to(&self, post: &mut RawPost) {
        if let Some(title) = &self.title {
            post.title = title.clone();
        }
        if let Some(body) = &self.body {
            post.body = body.clone();
        }
        if let Some(user_id) = self.user_id {
            post.user_id = Some(user_id);
        }
        if let Some(date) = self.date {
            post.date = Some(date);
        }
        if let Some(reactions) = self.reactions {
            post.reactions = Some(reactions);
        }
    }
}
