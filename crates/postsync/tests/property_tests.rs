//! Property-based tests for tag invalidation and patch reverts.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{TimeZone, Utc};
use proptest::prelude::*;

use postsync::patch::PatchStack;
use postsync::{
    EntityEdit, EntityStore, FieldChange, POST_TAG, PatchId, Post, PostId, Reactions, Tag,
    TagIndex, UserId,
};

const POSTS: u64 = 5;

// Strategy for tags: mostly per-id, sometimes the list wildcard.
fn tag() -> impl Strategy<Value = Tag> {
    prop_oneof![
        1 => Just(Tag::list(POST_TAG)),
        4 => (0u64..8).prop_map(|id| Tag::id(POST_TAG, id)),
    ]
}

// Strategy for which tags each of a handful of keys provides.
fn provides() -> impl Strategy<Value = BTreeMap<u8, BTreeSet<Tag>>> {
    prop::collection::btree_map(0u8..6, prop::collection::btree_set(tag(), 0..5), 0..6)
}

fn seed() -> EntityStore<Post> {
    EntityStore::from_records((0..POSTS).map(|id| Post {
        id: PostId::from(id),
        title: format!("post {id}"),
        body: String::new(),
        user_id: Some(UserId(1)),
        date: Utc.with_ymd_and_hms(2024, 1, 1, 0, id as u32, 0).unwrap(),
        reactions: Reactions::default(),
    }))
}

// Strategy for one patch: a few field edits against existing posts.
fn patch() -> impl Strategy<Value = Vec<EntityEdit>> {
    let change = prop_oneof![
        (0u32..10).prop_map(|n| FieldChange::Reactions(Reactions {
            thumbs_up: n,
            ..Reactions::default()
        })),
        "[a-z]{1,8}".prop_map(FieldChange::Title),
        (0u32..60).prop_map(|m| FieldChange::Date(
            Utc.with_ymd_and_hms(2024, 1, 2, 0, m, 0).unwrap()
        )),
    ];
    prop::collection::vec(
        (0..POSTS, change).prop_map(|(id, change)| EntityEdit::new(PostId::from(id), change)),
        1..4,
    )
}

fn apply_plain(store: &mut EntityStore<Post>, edits: &[EntityEdit]) {
    for edit in edits {
        store.update(&edit.id, |post| match edit.change.clone() {
            FieldChange::Title(title) => post.title = title,
            FieldChange::Body(body) => post.body = body,
            FieldChange::Author(user_id) => post.user_id = user_id,
            FieldChange::Date(date) => post.date = date,
            FieldChange::Reactions(reactions) => post.reactions = reactions,
        });
    }
}

proptest! {
    #[test]
    fn invalidation_matches_brute_force(
        provided in provides(),
        invalidated in prop::collection::vec(tag(), 0..4),
    ) {
        let mut index = TagIndex::new();
        for (key, tags) in &provided {
            index.record_provides(key, tags.iter().cloned());
        }

        let expected: BTreeSet<u8> = provided
            .iter()
            .filter(|(_, tags)| invalidated.iter().any(|t| tags.contains(t)))
            .map(|(key, _)| *key)
            .collect();

        prop_assert_eq!(index.invalidate(&invalidated), expected);
    }

    #[test]
    fn forgotten_keys_never_invalidate(
        provided in provides(),
        invalidated in prop::collection::vec(tag(), 0..4),
    ) {
        let mut index = TagIndex::new();
        for (key, tags) in &provided {
            index.record_provides(key, tags.iter().cloned());
        }
        for key in provided.keys() {
            index.forget(key);
        }

        prop_assert!(index.invalidate(&invalidated).is_empty());
        prop_assert_eq!(index.tag_count(), 0);
    }

    #[test]
    fn reverting_all_patches_restores_snapshot(
        patches in prop::collection::vec(patch(), 1..6),
        order in any::<u64>(),
    ) {
        let original = seed();
        let mut store = original.clone();
        let mut stack = PatchStack::new();

        let mut ids: Vec<PatchId> = Vec::new();
        for (n, edits) in patches.into_iter().enumerate() {
            let id = PatchId(n as u64 + 1);
            stack.push(&mut store, id, edits);
            ids.push(id);
        }

        // Start reverting somewhere in the middle, not only top-down.
        let len = ids.len() as u64;
        ids.rotate_left((order % len) as usize);
        for id in ids {
            prop_assert_eq!(stack.revert(&mut store, id), Some(0));
        }

        prop_assert_eq!(store, original);
        prop_assert!(stack.is_empty());
    }

    #[test]
    fn revert_equals_replaying_survivors(
        patches in prop::collection::vec(patch(), 1..6),
        reverted in prop::collection::vec(any::<bool>(), 6),
    ) {
        let mut store = seed();
        let mut stack = PatchStack::new();
        for (n, edits) in patches.iter().enumerate() {
            stack.push(&mut store, PatchId(n as u64 + 1), edits.clone());
        }

        let mut expected = seed();
        for (n, edits) in patches.iter().enumerate() {
            if reverted[n] {
                stack.revert(&mut store, PatchId(n as u64 + 1));
            } else {
                apply_plain(&mut expected, edits);
            }
        }

        prop_assert_eq!(store, expected);
    }
}

#[test]
fn test_list_tag_does_not_match_ids() {
    let mut index = TagIndex::new();
    index.record_provides(&"all", [Tag::list(POST_TAG), Tag::id(POST_TAG, 1)]);
    index.record_provides(&"mine", [Tag::id(POST_TAG, 1)]);

    let hit = index.invalidate(&[Tag::list(POST_TAG)]);
    assert_eq!(hit.into_iter().collect::<Vec<_>>(), vec!["all"]);

    let hit = index.invalidate(&[Tag::id(POST_TAG, 1)]);
    assert_eq!(hit.len(), 2);
}
