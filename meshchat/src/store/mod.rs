//! Entity store contract consumed by the delivery engine and the session.
//!
//! The store is a keyed record table per entity type with per-call
//! atomicity only. It offers no transactions and no uniqueness
//! constraints; every higher invariant is maintained by the callers
//! through read-then-write patterns that tolerate interleaving.
//!
//! Implementations:
//! - [`InMemoryStore`]: insertion-ordered tables behind one lock.
//! - [`FaultyStore`]: wrapper that fails selected operations on demand.

pub mod faulty;
pub mod memory;

use std::cmp::Ordering;
use std::fmt;

use meshchat_proto::contact::{
    Contact, ContactPatch, NewContact, NewProfile, Profile, ProfilePatch,
};
use meshchat_proto::conversation::{Conversation, ConversationPatch, NewConversation};
use meshchat_proto::ids::{ContactId, ConversationId, MessageId, ProfileId};
use meshchat_proto::message::{Message, MessagePatch, NewMessage};

pub use faulty::{FaultyStore, Operation};
pub use memory::InMemoryStore;

/// The record tables a store holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// Local user profiles.
    Profile,
    /// Remote contacts.
    Contact,
    /// Conversations with contacts.
    Conversation,
    /// Chat messages.
    Message,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Profile => "profile",
            Self::Contact => "contact",
            Self::Conversation => "conversation",
            Self::Message => "message",
        };
        f.write_str(name)
    }
}

/// Errors reported by an entity store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The backing storage could not serve the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A table held records of an unexpected type.
    #[error("{0} table is corrupted")]
    TableMismatch(EntityKind),
}

/// A record type that can live in an [`EntityStore`].
pub trait Entity: Clone + Send + Sync + 'static {
    /// Identifier type, assigned by the store on creation.
    type Id: Clone + Eq + fmt::Display + From<String> + Send + Sync + 'static;
    /// Fields supplied on creation.
    type Draft: Send + 'static;
    /// Partial update.
    type Patch: Send + 'static;

    /// Which table the record belongs to.
    const KIND: EntityKind;

    /// The record's identifier.
    fn id(&self) -> &Self::Id;

    /// Builds a record from a draft and its freshly assigned id.
    fn assemble(id: Self::Id, draft: Self::Draft) -> Self;

    /// Applies a partial update in place.
    fn apply(&mut self, patch: Self::Patch);
}

/// Sort direction for a [`Query`] ordering hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Smallest key first; ties keep insertion order.
    Ascending,
    /// Exact mirror of [`Direction::Ascending`].
    Descending,
}

type Predicate<E> = Box<dyn Fn(&E) -> bool + Send + Sync>;
type Comparator<E> = Box<dyn Fn(&E, &E) -> Ordering + Send + Sync>;

/// Selection over one table: predicate, optional ordering, optional limit.
///
/// The limit is applied after ordering, so "newest N" is expressed as a
/// descending order plus a limit.
pub struct Query<E> {
    predicate: Option<Predicate<E>>,
    order: Option<(Comparator<E>, Direction)>,
    limit: Option<usize>,
}

impl<E: 'static> Query<E> {
    /// Selects every record.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            predicate: None,
            order: None,
            limit: None,
        }
    }

    /// Selects records for which `predicate` holds.
    pub fn matching(predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Some(Box::new(predicate)),
            order: None,
            limit: None,
        }
    }

    /// Orders results by a key.
    #[must_use]
    pub fn order_by<K: Ord + 'static>(
        mut self,
        key: impl Fn(&E) -> K + Send + Sync + 'static,
        direction: Direction,
    ) -> Self {
        let compare = move |a: &E, b: &E| key(a).cmp(&key(b));
        self.order = Some((Box::new(compare), direction));
        self
    }

    /// Caps the number of results.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns `true` if `record` passes the predicate.
    pub fn matches(&self, record: &E) -> bool {
        self.predicate.as_ref().is_none_or(|p| p(record))
    }

    /// Runs the query over records given in insertion order.
    pub fn select<'a>(&self, records: impl IntoIterator<Item = &'a E>) -> Vec<E>
    where
        E: Clone + 'a,
    {
        let mut selected: Vec<E> = records
            .into_iter()
            .filter(|r| self.matches(r))
            .cloned()
            .collect();
        if let Some((compare, direction)) = &self.order {
            selected.sort_by(|a, b| compare(a, b));
            if *direction == Direction::Descending {
                selected.reverse();
            }
        }
        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        selected
    }
}

impl<E: 'static> Default for Query<E> {
    fn default() -> Self {
        Self::all()
    }
}

impl<E> fmt::Debug for Query<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("filtered", &self.predicate.is_some())
            .field("direction", &self.order.as_ref().map(|(_, d)| *d))
            .field("limit", &self.limit)
            .finish()
    }
}

/// Keyed record store, one table per [`Entity`] type.
///
/// Each call is atomic on its own. Nothing spans calls.
pub trait EntityStore: Send + Sync {
    /// Returns every record of the table in insertion order.
    fn list<E: Entity>(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<E>, StoreError>> + Send;

    /// Returns the records selected by `query`.
    fn filter<E: Entity>(
        &self,
        query: Query<E>,
    ) -> impl std::future::Future<Output = Result<Vec<E>, StoreError>> + Send;

    /// Inserts a record and returns it with its assigned id.
    fn create<E: Entity>(
        &self,
        draft: E::Draft,
    ) -> impl std::future::Future<Output = Result<E, StoreError>> + Send;

    /// Applies a partial update. Returns `None` if the record does not exist.
    fn update<E: Entity>(
        &self,
        id: &E::Id,
        patch: E::Patch,
    ) -> impl std::future::Future<Output = Result<Option<E>, StoreError>> + Send;

    /// Removes a record. Returns `false` if it did not exist.
    fn delete<E: Entity>(
        &self,
        id: &E::Id,
    ) -> impl std::future::Future<Output = Result<bool, StoreError>> + Send;

    /// Looks up a single record by id.
    fn get<E: Entity>(
        &self,
        id: &E::Id,
    ) -> impl std::future::Future<Output = Result<Option<E>, StoreError>> + Send {
        let id = id.clone();
        async move {
            let mut found = self
                .filter(Query::matching(move |record: &E| *record.id() == id).limit(1))
                .await?;
            Ok(found.pop())
        }
    }
}

impl Entity for Profile {
    type Id = ProfileId;
    type Draft = NewProfile;
    type Patch = ProfilePatch;

    const KIND: EntityKind = EntityKind::Profile;

    fn id(&self) -> &ProfileId {
        &self.id
    }

    fn assemble(id: ProfileId, draft: NewProfile) -> Self {
        draft.with_id(id)
    }

    fn apply(&mut self, patch: ProfilePatch) {
        patch.apply(self);
    }
}

impl Entity for Contact {
    type Id = ContactId;
    type Draft = NewContact;
    type Patch = ContactPatch;

    const KIND: EntityKind = EntityKind::Contact;

    fn id(&self) -> &ContactId {
        &self.id
    }

    fn assemble(id: ContactId, draft: NewContact) -> Self {
        draft.with_id(id)
    }

    fn apply(&mut self, patch: ContactPatch) {
        patch.apply(self);
    }
}

impl Entity for Conversation {
    type Id = ConversationId;
    type Draft = NewConversation;
    type Patch = ConversationPatch;

    const KIND: EntityKind = EntityKind::Conversation;

    fn id(&self) -> &ConversationId {
        &self.id
    }

    fn assemble(id: ConversationId, draft: NewConversation) -> Self {
        draft.with_id(id)
    }

    fn apply(&mut self, patch: ConversationPatch) {
        patch.apply(self);
    }
}

impl Entity for Message {
    type Id = MessageId;
    type Draft = NewMessage;
    type Patch = MessagePatch;

    const KIND: EntityKind = EntityKind::Message;

    fn id(&self) -> &MessageId {
        &self.id
    }

    fn assemble(id: MessageId, draft: NewMessage) -> Self {
        draft.with_id(id)
    }

    fn apply(&mut self, patch: MessagePatch) {
        patch.apply(self);
    }
}
