//! Normalized entity storage.
//!
//! An [`EntityStore`] maps identity to record and keeps a sorted sequence of
//! identities for list views. It performs no I/O; the query cache holds one
//! store per cached result and replaces it wholesale on refetch.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use tracing::trace;

use crate::Post;

/// A record that can live in an [`EntityStore`].
pub trait Entity: Clone {
    /// Stable identity of the record.
    type Id: Clone + Eq + Hash + Ord + fmt::Debug + fmt::Display;

    fn id(&self) -> &Self::Id;

    /// Order used for the store's list view. Must be total for distinct ids.
    fn sort_cmp(a: &Self, b: &Self) -> Ordering;
}

impl Entity for Post {
    type Id = crate::PostId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    /// Newest first, ties broken by id.
    fn sort_cmp(a: &Self, b: &Self) -> Ordering {
        b.date.cmp(&a.date).then_with(|| a.id.cmp(&b.id))
    }
}

/// Identity-keyed records plus their sorted id sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityStore<E: Entity> {
    entities: HashMap<E::Id, E>,
    ids: Vec<E::Id>,
}

impl<E: Entity> Default for EntityStore<E> {
    fn default() -> Self {
        Self {
            entities: HashMap::new(),
            ids: Vec::new(),
        }
    }
}

impl<E: Entity> EntityStore<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a batch of records. Later duplicates win.
    pub fn from_records(records: impl IntoIterator<Item = E>) -> Self {
        let mut store = Self::new();
        store.replace_all(records);
        store
    }

    /// Discard all contents and index the given records.
    pub fn replace_all(&mut self, records: impl IntoIterator<Item = E>) {
        self.entities.clear();
        for record in records {
            self.entities.insert(record.id().clone(), record);
        }

        let mut sorted: Vec<&E> = self.entities.values().collect();
        sorted.sort_by(|a, b| E::sort_cmp(a, b));
        self.ids = sorted.into_iter().map(|e| e.id().clone()).collect();
        trace!(count = self.ids.len(), "store: replaced all records");
    }

    /// Insert or overwrite a record, moving it to its sorted position.
    ///
    /// Returns the previous record with the same identity, if any.
    pub fn upsert(&mut self, record: E) -> Option<E> {
        let previous = self.detach(record.id());
        let position = self.insertion_point(&record);
        self.ids.insert(position, record.id().clone());
        trace!(id = %record.id(), position, "store: record upserted");
        self.entities.insert(record.id().clone(), record);
        previous
    }

    /// Remove a record and its ordering slot. No-op if absent.
    pub fn remove(&mut self, id: &E::Id) -> Option<E> {
        let removed = self.detach(id);
        if removed.is_some() {
            trace!(id = %id, "store: record removed");
        }
        removed
    }

    /// Apply an in-place edit to a stored record, keeping the order intact.
    ///
    /// Returns `false` without calling `edit` if the record is absent.
    pub fn update(&mut self, id: &E::Id, edit: impl FnOnce(&mut E)) -> bool {
        let Some(mut record) = self.detach(id) else {
            return false;
        };
        edit(&mut record);
        debug_assert!(record.id() == id, "entity identity is immutable");
        self.upsert(record);
        true
    }

    /// Look up a record. Absent and not-yet-loaded are the same answer.
    pub fn get(&self, id: &E::Id) -> Option<&E> {
        self.entities.get(id)
    }

    pub fn contains(&self, id: &E::Id) -> bool {
        self.entities.contains_key(id)
    }

    /// Identities in list order.
    pub fn ids(&self) -> &[E::Id] {
        &self.ids
    }

    /// Records in list order.
    pub fn iter(&self) -> impl Iterator<Item = &E> + '_ {
        self.ids.iter().filter_map(|id| self.entities.get(id))
    }

    /// Records in list order matching a predicate.
    pub fn filter<'a>(
        &'a self,
        mut predicate: impl FnMut(&E) -> bool + 'a,
    ) -> impl Iterator<Item = &'a E> + 'a {
        self.iter().filter(move |e: &&E| predicate(*e))
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Take a record out of both the map and the ordering.
    fn detach(&mut self, id: &E::Id) -> Option<E> {
        let record = self.entities.get(id)?;
        let position = self.slot_of(record).or_else(|| self.ids.iter().position(|i| i == id));
        if let Some(position) = position {
            self.ids.remove(position);
        }
        self.entities.remove(id)
    }

    fn slot_of(&self, record: &E) -> Option<usize> {
        self.ids
            .binary_search_by(|slot_id| self.compare_slot(slot_id, record))
            .ok()
    }

    fn insertion_point(&self, record: &E) -> usize {
        match self
            .ids
            .binary_search_by(|slot_id| self.compare_slot(slot_id, record))
        {
            Ok(position) | Err(position) => position,
        }
    }

    fn compare_slot(&self, slot_id: &E::Id, record: &E) -> Ordering {
        match self.entities.get(slot_id) {
            Some(existing) => E::sort_cmp(existing, record),
            None => Ordering::Less,
        }
    }
}
