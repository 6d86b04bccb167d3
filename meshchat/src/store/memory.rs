//! In-memory [`EntityStore`] backed by insertion-ordered tables.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Entity, EntityStore, Query, StoreError};
use crate::ids::{IdGenerator, RandomIds};

/// One `Vec<E>` per entity type, keyed by the type.
type Tables = HashMap<TypeId, Box<dyn Any + Send>>;

/// In-memory implementation of [`EntityStore`].
///
/// Every operation takes the single table lock for its whole duration, so
/// each call is atomic, but nothing is atomic across calls. Data is lost
/// when the store is dropped.
pub struct InMemoryStore {
    ids: Arc<dyn IdGenerator>,
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    /// Creates an empty store that assigns UUID v7 ids.
    #[must_use]
    pub fn new() -> Self {
        Self::with_ids(Arc::new(RandomIds))
    }

    /// Creates an empty store that assigns ids from `ids`.
    #[must_use]
    pub fn with_ids(ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            ids,
            tables: Mutex::new(HashMap::new()),
        }
    }

    /// Number of records currently held for `E`.
    #[must_use]
    pub fn count<E: Entity>(&self) -> usize {
        self.with_table(|table: &mut Vec<E>| table.len())
            .unwrap_or_default()
    }

    fn with_table<E: Entity, R>(
        &self,
        f: impl FnOnce(&mut Vec<E>) -> R,
    ) -> Result<R, StoreError> {
        let mut tables = self.tables.lock();
        let table = tables
            .entry(TypeId::of::<E>())
            .or_insert_with(|| Box::new(Vec::<E>::new()));
        table
            .downcast_mut::<Vec<E>>()
            .map(f)
            .ok_or(StoreError::TableMismatch(E::KIND))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStore for InMemoryStore {
    async fn list<E: Entity>(&self) -> Result<Vec<E>, StoreError> {
        self.with_table(|table: &mut Vec<E>| table.clone())
    }

    async fn filter<E: Entity>(&self, query: Query<E>) -> Result<Vec<E>, StoreError> {
        self.with_table(|table: &mut Vec<E>| query.select(table.iter()))
    }

    async fn create<E: Entity>(&self, draft: E::Draft) -> Result<E, StoreError> {
        let id = E::Id::from(self.ids.next_id());
        let record = E::assemble(id, draft);
        self.with_table(|table: &mut Vec<E>| {
            table.push(record.clone());
            record
        })
    }

    async fn update<E: Entity>(
        &self,
        id: &E::Id,
        patch: E::Patch,
    ) -> Result<Option<E>, StoreError> {
        self.with_table(|table: &mut Vec<E>| {
            table.iter_mut().find(|r| r.id() == id).map(|record| {
                record.apply(patch);
                record.clone()
            })
        })
    }

    async fn delete<E: Entity>(&self, id: &E::Id) -> Result<bool, StoreError> {
        self.with_table(|table: &mut Vec<E>| {
            let before = table.len();
            table.retain(|r| r.id() != id);
            table.len() != before
        })
    }
}
