//! Multi-kind entity queries.
//!
//! A [`ComponentSet`] is a tuple of component types, `(A,)` through
//! `(A, B, C, D)`. The registry uses it to select entities holding *all* of
//! the listed kinds and, for typed queries, to borrow those components.
//!
//! Queries only take `&EntityRegistry`; producing results never mutates
//! entity state.

use std::marker::PhantomData;

use crate::component::Component;
use crate::entity::{Entity, EntityId};
use crate::kind::KindId;

// ---------------------------------------------------------------------------
// ComponentSet
// ---------------------------------------------------------------------------

/// A tuple of component kinds that an entity must hold to match a query.
pub trait ComponentSet {
    /// Borrowed components yielded for a matching entity.
    type Refs<'e>;

    /// The kinds in this set, in tuple order.
    fn kinds() -> Vec<KindId>;

    /// Whether `entity` holds every kind in the set.
    fn matches(entity: &Entity) -> bool;

    /// Borrow every component of the set, or `None` if one is missing.
    fn fetch(entity: &Entity) -> Option<Self::Refs<'_>>;
}

impl<A: Component> ComponentSet for (A,) {
    type Refs<'e> = (&'e A,);

    fn kinds() -> Vec<KindId> {
        vec![KindId::of::<A>()]
    }

    fn matches(entity: &Entity) -> bool {
        entity.has::<A>()
    }

    fn fetch(entity: &Entity) -> Option<Self::Refs<'_>> {
        let c = entity.components();
        Some((c.get::<A>()?,))
    }
}

impl<A: Component, B: Component> ComponentSet for (A, B) {
    type Refs<'e> = (&'e A, &'e B);

    fn kinds() -> Vec<KindId> {
        vec![KindId::of::<A>(), KindId::of::<B>()]
    }

    fn matches(entity: &Entity) -> bool {
        entity.has::<A>() && entity.has::<B>()
    }

    fn fetch(entity: &Entity) -> Option<Self::Refs<'_>> {
        let c = entity.components();
        Some((c.get::<A>()?, c.get::<B>()?))
    }
}

impl<A: Component, B: Component, C: Component> ComponentSet for (A, B, C) {
    type Refs<'e> = (&'e A, &'e B, &'e C);

    fn kinds() -> Vec<KindId> {
        vec![KindId::of::<A>(), KindId::of::<B>(), KindId::of::<C>()]
    }

    fn matches(entity: &Entity) -> bool {
        entity.has::<A>() && entity.has::<B>() && entity.has::<C>()
    }

    fn fetch(entity: &Entity) -> Option<Self::Refs<'_>> {
        let c = entity.components();
        Some((c.get::<A>()?, c.get::<B>()?, c.get::<C>()?))
    }
}

impl<A: Component, B: Component, C: Component, D: Component> ComponentSet for (A, B, C, D) {
    type Refs<'e> = (&'e A, &'e B, &'e C, &'e D);

    fn kinds() -> Vec<KindId> {
        vec![
            KindId::of::<A>(),
            KindId::of::<B>(),
            KindId::of::<C>(),
            KindId::of::<D>(),
        ]
    }

    fn matches(entity: &Entity) -> bool {
        entity.has::<A>() && entity.has::<B>() && entity.has::<C>() && entity.has::<D>()
    }

    fn fetch(entity: &Entity) -> Option<Self::Refs<'_>> {
        let c = entity.components();
        Some((c.get::<A>()?, c.get::<B>()?, c.get::<C>()?, c.get::<D>()?))
    }
}

// ---------------------------------------------------------------------------
// Iterators
// ---------------------------------------------------------------------------

/// Iterator over live entities holding every kind of `Q`.
pub struct EntitiesWith<'w, Q: ComponentSet> {
    slots: std::slice::Iter<'w, Option<Entity>>,
    _marker: PhantomData<fn() -> Q>,
}

impl<'w, Q: ComponentSet> EntitiesWith<'w, Q> {
    pub(crate) fn new(slots: &'w [Option<Entity>]) -> Self {
        Self {
            slots: slots.iter(),
            _marker: PhantomData,
        }
    }
}

impl<'w, Q: ComponentSet> Iterator for EntitiesWith<'w, Q> {
    type Item = &'w Entity;

    fn next(&mut self) -> Option<Self::Item> {
        self.slots
            .by_ref()
            .flatten()
            .find(|entity| Q::matches(entity))
    }
}

/// Iterator yielding `(EntityId, (&A, &B, ...))` for every matching entity.
pub struct QueryIter<'w, Q: ComponentSet> {
    slots: std::slice::Iter<'w, Option<Entity>>,
    _marker: PhantomData<fn() -> Q>,
}

impl<'w, Q: ComponentSet> QueryIter<'w, Q> {
    pub(crate) fn new(slots: &'w [Option<Entity>]) -> Self {
        Self {
            slots: slots.iter(),
            _marker: PhantomData,
        }
    }
}

impl<'w, Q: ComponentSet> Iterator for QueryIter<'w, Q> {
    type Item = (EntityId, Q::Refs<'w>);

    fn next(&mut self) -> Option<Self::Item> {
        for entity in self.slots.by_ref().flatten() {
            if let Some(refs) = Q::fetch(entity) {
                return Some((entity.id(), refs));
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
