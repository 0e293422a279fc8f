//! Reversible edits applied speculatively to cached snapshots.
//!
//! A patch is an ordered list of field edits. Applying it yields the inverse
//! edits needed to restore the prior values. Each cache entry keeps its
//! outstanding patches on a [`PatchStack`] so that reverting one patch while
//! later patches are still in flight unwinds them in reverse order first and
//! then replays them on top of the restored snapshot.

use std::fmt;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::{EntityStore, Post, PostId, QueryKey, Reactions, UserId};

/// Identity of an applied patch, unique per cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PatchId(pub u64);

impl fmt::Display for PatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "patch#{}", self.0)
    }
}

/// New value for one field of a post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldChange {
    Title(String),
    Body(String),
    Author(Option<UserId>),
    Date(DateTime<Utc>),
    Reactions(Reactions),
}

impl FieldChange {
    /// Write this value into the post and return the value it replaced.
    fn apply(self, post: &mut Post) -> FieldChange {
        match self {
            FieldChange::Title(title) => FieldChange::Title(std::mem::replace(&mut post.title, title)),
            FieldChange::Body(body) => FieldChange::Body(std::mem::replace(&mut post.body, body)),
            FieldChange::Author(user_id) => {
                FieldChange::Author(std::mem::replace(&mut post.user_id, user_id))
            }
            FieldChange::Date(date) => FieldChange::Date(std::mem::replace(&mut post.date, date)),
            FieldChange::Reactions(reactions) => {
                FieldChange::Reactions(std::mem::replace(&mut post.reactions, reactions))
            }
        }
    }
}

/// A field edit addressed to one post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityEdit {
    pub id: PostId,
    pub change: FieldChange,
}

impl EntityEdit {
    pub fn new(id: PostId, change: FieldChange) -> Self {
        Self { id, change }
    }

    /// Whether both edits write the same field of the same post.
    pub fn targets_same_field(&self, other: &EntityEdit) -> bool {
        self.id == other.id && std::mem::discriminant(&self.change) == std::mem::discriminant(&other.change)
    }
}

/// Computes the edits of an optimistic patch from the current snapshot.
pub type PatchRecipe = Box<dyn FnOnce(&EntityStore<Post>) -> Vec<EntityEdit> + Send>;

/// Speculative change to one cache entry, applied before the remote call
/// settles.
pub struct OptimisticUpdate {
    pub key: QueryKey,
    pub recipe: PatchRecipe,
}

impl OptimisticUpdate {
    pub fn new(
        key: QueryKey,
        recipe: impl FnOnce(&EntityStore<Post>) -> Vec<EntityEdit> + Send + 'static,
    ) -> Self {
        Self {
            key,
            recipe: Box::new(recipe),
        }
    }
}

impl fmt::Debug for OptimisticUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimisticUpdate")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Handle to an applied patch, used to settle or revert exactly that patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchHandle {
    pub key: QueryKey,
    pub id: PatchId,
    /// Number of edits that found their entity and were applied.
    pub applied: usize,
}

/// How a patch was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchResolution {
    /// Remote call succeeded; the speculative values stay.
    Committed,
    /// Remote call failed; prior values restored. `dropped` counts edits whose
    /// entity had disappeared and so had nothing left to restore.
    Reverted { dropped: usize },
    /// The entry's snapshot was replaced or evicted before resolution.
    Superseded,
}

#[derive(Debug, Clone)]
struct AppliedPatch {
    id: PatchId,
    forward: Vec<EntityEdit>,
    inverse: Vec<EntityEdit>,
    settled: bool,
}

/// Outstanding patches of one cache entry, oldest first.
#[derive(Debug, Clone, Default)]
pub struct PatchStack {
    patches: Vec<AppliedPatch>,
}

impl PatchStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply edits on top of the snapshot and remember how to undo them.
    ///
    /// Returns the number of edits applied; edits naming an absent post are
    /// skipped.
    pub fn push(&mut self, store: &mut EntityStore<Post>, id: PatchId, edits: Vec<EntityEdit>) -> usize {
        let (forward, inverse) = apply_edits(store, edits);
        let applied = inverse.len();
        debug!(patch = %id, applied, depth = self.patches.len() + 1, "patch applied");
        self.patches.push(AppliedPatch {
            id,
            forward,
            inverse,
            settled: false,
        });
        applied
    }

    /// Mark a patch as confirmed. Returns `false` if the stack no longer has it.
    pub fn settle(&mut self, id: PatchId) -> bool {
        let Some(patch) = self.patches.iter_mut().find(|p| p.id == id) else {
            return false;
        };
        patch.settled = true;
        self.drain_settled();
        trace!(patch = %id, depth = self.patches.len(), "patch settled");
        true
    }

    /// Undo one patch, unwinding and replaying everything applied after it.
    ///
    /// Returns the number of dropped inverse edits, or `None` if the stack no
    /// longer has the patch.
    pub fn revert(&mut self, store: &mut EntityStore<Post>, id: PatchId) -> Option<usize> {
        let position = self.patches.iter().position(|p| p.id == id)?;
        let mut above = self.patches.split_off(position + 1);
        let target = self.patches.pop()?;

        for patch in above.iter().rev() {
            undo_edits(store, &patch.inverse);
        }
        let dropped = undo_edits(store, &target.inverse);

        for patch in &mut above {
            let (forward, inverse) = apply_edits(store, std::mem::take(&mut patch.forward));
            patch.forward = forward;
            patch.inverse = inverse;
        }
        self.patches.extend(above);
        self.drain_settled();

        debug!(patch = %id, dropped, depth = self.patches.len(), "patch reverted");
        Some(dropped)
    }

    /// Fold an authoritative value for one field under the patches that
    /// overwrite it.
    ///
    /// `confirmed` is the patch whose remote call returned the value; its
    /// own forward edits take the value, and only patches above it count.
    /// When the stack no longer holds it, every remaining patch is later.
    /// Returns `true` if a later patch absorbed the value into its inverse,
    /// in which case the visible snapshot must stay as it is. Otherwise the
    /// caller writes the value into the snapshot.
    pub fn rebase(&mut self, confirmed: Option<PatchId>, edit: &EntityEdit) -> bool {
        let start = match confirmed.and_then(|id| self.patches.iter().position(|p| p.id == id)) {
            Some(position) => {
                for forward in &mut self.patches[position].forward {
                    if forward.targets_same_field(edit) {
                        forward.change = edit.change.clone();
                    }
                }
                position + 1
            }
            None => 0,
        };

        let later = self.patches[start..]
            .iter_mut()
            .flat_map(|patch| patch.inverse.iter_mut())
            .find(|inverse| inverse.targets_same_field(edit));
        match later {
            Some(inverse) => {
                inverse.change = edit.change.clone();
                trace!(id = %edit.id, "authoritative value queued under pending patch");
                true
            }
            None => false,
        }
    }

    // A confirmed patch with nothing outstanding below it can never be
    // unwound again.
    fn drain_settled(&mut self) {
        let confirmed = self.patches.iter().take_while(|p| p.settled).count();
        self.patches.drain(..confirmed);
    }

    /// Forget every outstanding patch without touching the snapshot.
    pub fn clear(&mut self) -> usize {
        let count = self.patches.len();
        self.patches.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }
}

/// Apply edits in order. Returns the edits kept (those whose post exists)
/// and their inverses in application order.
fn apply_edits(store: &mut EntityStore<Post>, edits: Vec<EntityEdit>) -> (Vec<EntityEdit>, Vec<EntityEdit>) {
    let mut forward = Vec::with_capacity(edits.len());
    let mut inverse = Vec::with_capacity(edits.len());

    for edit in edits {
        let mut previous = None;
        let change = edit.change.clone();
        let found = store.update(&edit.id, |post| previous = Some(change.apply(post)));
        match previous {
            Some(old) if found => {
                inverse.push(EntityEdit::new(edit.id.clone(), old));
                forward.push(edit);
            }
            _ => trace!(id = %edit.id, "patch edit skipped, post not cached"),
        }
    }

    (forward, inverse)
}

/// Apply inverse edits newest first. Returns how many found no post.
fn undo_edits(store: &mut EntityStore<Post>, inverse: &[EntityEdit]) -> usize {
    let mut dropped = 0;
    for edit in inverse.iter().rev() {
        let change = edit.change.clone();
        if !store.update(&edit.id, |post| {
            change.apply(post);
        }) {
            trace!(id = %edit.id, "revert dropped, post no longer cached");
            dropped += 1;
        }
    }
    dropped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ReactionKind;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn store() -> EntityStore<Post> {
        EntityStore::from_records((1..=3).map(|id| Post {
            id: PostId::from(id),
            title: format!("post {id}"),
            body: "body".to_string(),
            user_id: Some(UserId(1)),
            date: Utc.with_ymd_and_hms(2024, 3, 1, 0, id as u32, 0).unwrap(),
            reactions: Reactions::default(),
        }))
    }

    fn react(id: u64, thumbs_up: u32) -> Vec<EntityEdit> {
        vec![EntityEdit::new(
            PostId::from(id),
            FieldChange::Reactions(Reactions {
                thumbs_up,
                ..Reactions::default()
            }),
        )]
    }

    fn thumbs(store: &EntityStore<Post>, id: u64) -> u32 {
        store.get(&PostId::from(id)).unwrap().reactions.get(ReactionKind::ThumbsUp)
    }

    #[test]
    fn test_revert_restores_snapshot_exactly() {
        let original = store();
        let mut snapshot = original.clone();
        let mut stack = PatchStack::new();

        let applied = stack.push(&mut snapshot, PatchId(1), react(1, 1));
        assert_eq!(applied, 1);
        assert_eq!(thumbs(&snapshot, 1), 1);

        assert_eq!(stack.revert(&mut snapshot, PatchId(1)), Some(0));
        assert_eq!(snapshot, original);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_revert_of_date_edit_restores_order() {
        let original = store();
        let mut snapshot = original.clone();
        let mut stack = PatchStack::new();
        let newest = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

        stack.push(
            &mut snapshot,
            PatchId(1),
            vec![EntityEdit::new(PostId::from(1), FieldChange::Date(newest))],
        );
        assert_eq!(snapshot.ids()[0], PostId::from(1));

        stack.revert(&mut snapshot, PatchId(1));
        assert_eq!(snapshot, original);
    }

    #[test]
    fn test_edits_for_missing_posts_are_skipped() {
        let mut snapshot = store();
        let mut stack = PatchStack::new();

        assert_eq!(stack.push(&mut snapshot, PatchId(1), react(9, 4)), 0);
        assert_eq!(snapshot, store());
    }

    #[test]
    fn test_out_of_order_revert_keeps_later_patch() {
        let mut snapshot = store();
        let mut stack = PatchStack::new();

        stack.push(&mut snapshot, PatchId(1), react(1, 1));
        stack.push(&mut snapshot, PatchId(2), react(1, 2));
        assert_eq!(thumbs(&snapshot, 1), 2);

        // Reverting the first patch unwinds the second, restores 0, then
        // replays the second on top.
        stack.revert(&mut snapshot, PatchId(1));
        assert_eq!(thumbs(&snapshot, 1), 2);
        assert_eq!(stack.len(), 1);

        stack.revert(&mut snapshot, PatchId(2));
        assert_eq!(snapshot, store());
    }

    #[test]
    fn test_revert_under_settled_patch() {
        let mut snapshot = store();
        let mut stack = PatchStack::new();

        stack.push(&mut snapshot, PatchId(1), react(1, 1));
        stack.push(&mut snapshot, PatchId(2), react(2, 5));
        assert!(stack.settle(PatchId(2)));
        // Still outstanding below, so the settled patch stays on the stack.
        assert_eq!(stack.len(), 2);

        stack.revert(&mut snapshot, PatchId(1));
        assert_eq!(thumbs(&snapshot, 1), 0);
        assert_eq!(thumbs(&snapshot, 2), 5);
    }

    #[test]
    fn test_settle_drains_confirmed_prefix() {
        let mut snapshot = store();
        let mut stack = PatchStack::new();

        stack.push(&mut snapshot, PatchId(1), react(1, 1));
        stack.push(&mut snapshot, PatchId(2), react(2, 1));
        stack.settle(PatchId(2));
        stack.settle(PatchId(1));

        assert!(stack.is_empty());
        assert!(!stack.settle(PatchId(1)));
        assert_eq!(stack.revert(&mut snapshot, PatchId(1)), None);
    }

    #[test]
    fn test_rebase_goes_under_later_patch() {
        let mut snapshot = store();
        let mut stack = PatchStack::new();

        stack.push(&mut snapshot, PatchId(1), react(1, 1));
        stack.push(&mut snapshot, PatchId(2), react(1, 2));
        assert!(stack.settle(PatchId(1)));

        // The server answered 1 for the first call; the second is pending.
        let authoritative = react(1, 1).remove(0);
        assert!(stack.rebase(Some(PatchId(1)), &authoritative));
        assert_eq!(thumbs(&snapshot, 1), 2);

        // Failing the pending patch lands on the server value.
        assert_eq!(stack.revert(&mut snapshot, PatchId(2)), Some(0));
        assert_eq!(thumbs(&snapshot, 1), 1);
    }

    #[test]
    fn test_rebase_rewrites_confirmed_forward_edit() {
        let mut snapshot = store();
        let mut stack = PatchStack::new();

        stack.push(&mut snapshot, PatchId(1), react(2, 4));
        stack.push(&mut snapshot, PatchId(2), react(1, 1));
        assert!(stack.settle(PatchId(2)));

        // Nothing above the confirmed patch: the caller owns the snapshot.
        let authoritative = react(1, 7).remove(0);
        assert!(!stack.rebase(Some(PatchId(2)), &authoritative));
        snapshot.update(&PostId::from(1), |post| post.reactions.thumbs_up = 7);

        // Replaying the confirmed patch after a revert keeps the server value.
        stack.revert(&mut snapshot, PatchId(1));
        assert_eq!(thumbs(&snapshot, 1), 7);
        assert_eq!(thumbs(&snapshot, 2), 0);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_rebase_ignores_other_fields() {
        let mut stack = PatchStack::new();
        let mut snapshot = store();
        stack.push(
            &mut snapshot,
            PatchId(1),
            vec![EntityEdit::new(PostId::from(1), FieldChange::Title("t".to_string()))],
        );

        assert!(!stack.rebase(None, &react(1, 3).remove(0)));
        assert!(!stack.rebase(None, &react(2, 3).remove(0)));
    }

    #[test]
    fn test_revert_drops_edits_for_removed_posts() {
        let mut snapshot = store();
        let mut stack = PatchStack::new();

        stack.push(&mut snapshot, PatchId(1), react(2, 3));
        snapshot.remove(&PostId::from(2));

        assert_eq!(stack.revert(&mut snapshot, PatchId(1)), Some(1));
        assert_eq!(snapshot.len(), 2);
    }
}
