//! Invalidation tags and the index from tags to cached query keys.
//!
//! The index only answers "which keys are stale"; deciding when to refetch
//! them belongs to the [`RefetchScheduler`](crate::RefetchScheduler).

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::Hash;

use tracing::trace;

/// Entity type name used by post tags.
pub const POST_TAG: &str = "Post";

/// The id half of a tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TagId {
    /// Wildcard sentinel: "the list of this type". Only matches itself.
    List,
    /// A concrete record id.
    Id(String),
}

/// A declared dependency label such as `Post:LIST` or `Post:3`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag {
    pub kind: &'static str,
    pub id: TagId,
}

impl Tag {
    /// The wildcard list tag for a type.
    pub fn list(kind: &'static str) -> Self {
        Self {
            kind,
            id: TagId::List,
        }
    }

    /// The tag of a single record.
    pub fn id(kind: &'static str, id: impl fmt::Display) -> Self {
        Self {
            kind,
            id: TagId::Id(id.to_string()),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            TagId::List => write!(f, "{}:LIST", self.kind),
            TagId::Id(id) => write!(f, "{}:{}", self.kind, id),
        }
    }
}

/// Bidirectional map between cache keys and the tags they provide.
#[derive(Debug, Clone)]
pub struct TagIndex<K> {
    by_tag: HashMap<Tag, BTreeSet<K>>,
    by_key: HashMap<K, BTreeSet<Tag>>,
}

impl<K> Default for TagIndex<K> {
    fn default() -> Self {
        Self {
            by_tag: HashMap::new(),
            by_key: HashMap::new(),
        }
    }
}

impl<K: Clone + Eq + Hash + Ord + fmt::Display> TagIndex<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a key with the tags it currently depends on, replacing any
    /// previous association for that key.
    pub fn record_provides(&mut self, key: &K, tags: impl IntoIterator<Item = Tag>) {
        self.forget(key);

        let tags: BTreeSet<Tag> = tags.into_iter().collect();
        for tag in &tags {
            self.by_tag.entry(tag.clone()).or_default().insert(key.clone());
        }
        trace!(key = %key, count = tags.len(), "tags: recorded provides");
        if !tags.is_empty() {
            self.by_key.insert(key.clone(), tags);
        }
    }

    /// Drop every association for a key.
    pub fn forget(&mut self, key: &K) {
        let Some(tags) = self.by_key.remove(key) else {
            return;
        };
        for tag in tags {
            if let Some(keys) = self.by_tag.get_mut(&tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_tag.remove(&tag);
                }
            }
        }
    }

    /// Keys providing at least one of the given tags. Each key appears once
    /// no matter how many of its tags match.
    ///
    /// Matching is exact: `Post:LIST` does not match `Post:3`.
    pub fn invalidate<'a>(&self, tags: impl IntoIterator<Item = &'a Tag>) -> BTreeSet<K> {
        tags.into_iter()
            .filter_map(|tag| self.by_tag.get(tag))
            .flatten()
            .cloned()
            .collect()
    }

    /// Tags a key currently provides.
    pub fn provided_by(&self, key: &K) -> Option<&BTreeSet<Tag>> {
        self.by_key.get(key)
    }

    /// Number of distinct tags with at least one provider.
    pub fn tag_count(&self) -> usize {
        self.by_tag.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> TagIndex<String> {
        let mut index = TagIndex::new();
        index.record_provides(
            &"all".to_string(),
            [Tag::list(POST_TAG), Tag::id(POST_TAG, 1), Tag::id(POST_TAG, 2)],
        );
        index.record_provides(&"user-1".to_string(), [Tag::id(POST_TAG, 2)]);
        index
    }

    #[test]
    fn test_tag_display() {
        assert_eq!(Tag::list(POST_TAG).to_string(), "Post:LIST");
        assert_eq!(Tag::id(POST_TAG, 7).to_string(), "Post:7");
    }

    #[test]
    fn test_invalidate_returns_each_key_once() {
        let index = index();
        let keys = index.invalidate(&[Tag::id(POST_TAG, 2), Tag::list(POST_TAG)]);

        assert_eq!(keys.into_iter().collect::<Vec<_>>(), vec!["all", "user-1"]);
    }

    #[test]
    fn test_list_tag_is_not_hierarchical() {
        let mut index = TagIndex::new();
        index.record_provides(&"user-1".to_string(), [Tag::id(POST_TAG, 2)]);

        assert!(index.invalidate(&[Tag::list(POST_TAG)]).is_empty());
    }

    #[test]
    fn test_unknown_tag_is_noop() {
        assert!(index().invalidate(&[Tag::id(POST_TAG, 99)]).is_empty());
    }

    #[test]
    fn test_record_provides_replaces_previous() {
        let mut index = index();
        index.record_provides(&"all".to_string(), [Tag::list(POST_TAG), Tag::id(POST_TAG, 3)]);

        assert!(!index.invalidate(&[Tag::id(POST_TAG, 1)]).contains("all"));
        assert!(index.invalidate(&[Tag::id(POST_TAG, 3)]).contains("all"));
    }

    #[test]
    fn test_forget_cleans_empty_tags() {
        let mut index = index();
        index.forget(&"all".to_string());
        index.forget(&"user-1".to_string());

        assert_eq!(index.tag_count(), 0);
        assert!(index.provided_by(&"all".to_string()).is_none());
    }
}
