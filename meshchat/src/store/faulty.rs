//! Fault-injecting [`EntityStore`] wrapper.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{Entity, EntityStore, Query, StoreError};

/// Classes of store operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `list`, `filter` and `get`.
    Read,
    /// `create`.
    Create,
    /// `update`.
    Update,
    /// `delete`.
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Read => "read",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Wraps a store and fails selected operation classes on demand.
///
/// Failures apply to every entity type. Operations that are not failing
/// pass straight through to the inner store.
#[derive(Debug)]
pub struct FaultyStore<S> {
    inner: S,
    read: AtomicBool,
    create: AtomicBool,
    update: AtomicBool,
    delete: AtomicBool,
}

impl<S: EntityStore> FaultyStore<S> {
    /// Wraps `inner` with every operation healthy.
    pub const fn new(inner: S) -> Self {
        Self {
            inner,
            read: AtomicBool::new(false),
            create: AtomicBool::new(false),
            update: AtomicBool::new(false),
            delete: AtomicBool::new(false),
        }
    }

    /// Turns failure injection for `op` on or off.
    pub fn set_failing(&self, op: Operation, failing: bool) {
        self.flag(op).store(failing, Ordering::SeqCst);
    }

    /// Returns the wrapped store.
    pub const fn inner(&self) -> &S {
        &self.inner
    }

    const fn flag(&self, op: Operation) -> &AtomicBool {
        match op {
            Operation::Read => &self.read,
            Operation::Create => &self.create,
            Operation::Update => &self.update,
            Operation::Delete => &self.delete,
        }
    }

    fn check<E: Entity>(&self, op: Operation) -> Result<(), StoreError> {
        if self.flag(op).load(Ordering::SeqCst) {
            tracing::debug!(%op, kind = %E::KIND, "injected store failure");
            Err(StoreError::Unavailable(format!(
                "injected {op} failure on {}",
                E::KIND
            )))
        } else {
            Ok(())
        }
    }
}

impl<S: EntityStore> EntityStore for FaultyStore<S> {
    async fn list<E: Entity>(&self) -> Result<Vec<E>, StoreError> {
        self.check::<E>(Operation::Read)?;
        self.inner.list::<E>().await
    }

    async fn filter<E: Entity>(&self, query: Query<E>) -> Result<Vec<E>, StoreError> {
        self.check::<E>(Operation::Read)?;
        self.inner.filter::<E>(query).await
    }

    async fn create<E: Entity>(&self, draft: E::Draft) -> Result<E, StoreError> {
        self.check::<E>(Operation::Create)?;
        self.inner.create::<E>(draft).await
    }

    async fn update<E: Entity>(
        &self,
        id: &E::Id,
        patch: E::Patch,
    ) -> Result<Option<E>, StoreError> {
        self.check::<E>(Operation::Update)?;
        self.inner.update::<E>(id, patch).await
    }

    async fn delete<E: Entity>(&self, id: &E::Id) -> Result<bool, StoreError> {
        self.check::<E>(Operation::Delete)?;
        self.inner.delete::<E>(id).await
    }
}
