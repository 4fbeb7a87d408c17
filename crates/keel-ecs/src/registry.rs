//! The [`EntityRegistry`] owns every live entity.
//!
//! Besides creation, lookup and removal it tracks parent/child links and
//! records an [`EntityEvent`] for every lifecycle change. The registry never
//! calls into systems itself: whoever drives the simulation drains the events
//! with [`EntityRegistry::drain_events`] and fans them out.

use std::collections::HashMap;

use crate::component::Component;
use crate::entity::{Entity, EntityAllocator, EntityId};
use crate::query::{ComponentSet, EntitiesWith, QueryIter};
use crate::EcsError;

// ---------------------------------------------------------------------------
// EntityEvent
// ---------------------------------------------------------------------------

/// A lifecycle change waiting to be announced to systems.
#[derive(Debug)]
pub enum EntityEvent {
    /// A new entity is live, with its initial components attached.
    Registered(EntityId),
    /// The component set of a live entity changed through the registry.
    Changed(EntityId),
    /// An entity was removed. It is carried here, components included, so
    /// observers can still inspect it before it is dropped.
    Removed(Entity),
}

impl EntityEvent {
    /// The entity the event is about.
    pub fn entity_id(&self) -> EntityId {
        match self {
            EntityEvent::Registered(id) | EntityEvent::Changed(id) => *id,
            EntityEvent::Removed(entity) => entity.id(),
        }
    }
}

// ---------------------------------------------------------------------------
// EntityRegistry
// ---------------------------------------------------------------------------

/// Owner of all entities, their names, and their hierarchy links.
#[derive(Debug, Default)]
pub struct EntityRegistry {
    allocator: EntityAllocator,
    /// Indexed by `EntityId::index`.
    slots: Vec<Option<Entity>>,
    names: HashMap<String, EntityId>,
    /// child -> parent
    parents: HashMap<EntityId, EntityId>,
    /// Counter behind synthesized `entity{N}` names.
    next_anonymous: u64,
    events: Vec<EntityEvent>,
}

impl EntityRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    // -- lifecycle ----------------------------------------------------------

    /// Create an entity, run `post_create` on it to attach its initial
    /// components, and queue an [`EntityEvent::Registered`].
    ///
    /// With `name == None` a unique `entity{N}` name is synthesized.
    ///
    /// # Errors
    ///
    /// [`EcsError::AlreadyExists`] if a live entity already uses `name`; the
    /// existing entity is left untouched and `post_create` is not called.
    pub fn create_entity<F>(&mut self, name: Option<&str>, post_create: F) -> Result<EntityId, EcsError>
    where
        F: FnOnce(&mut Entity),
    {
        let name = match name {
            Some(name) if self.names.contains_key(name) => {
                return Err(EcsError::AlreadyExists {
                    name: name.to_owned(),
                });
            }
            Some(name) => name.to_owned(),
            None => self.synthesize_name(),
        };

        let id = self.allocator.allocate();
        let mut entity = Entity::new(id, name.clone());
        post_create(&mut entity);

        let idx = id.index() as usize;
        if idx >= self.slots.len() {
            self.slots.resize_with(idx + 1, || None);
        }
        tracing::debug!(entity = %id, %name, components = entity.kinds().len(), "entity created");
        self.slots[idx] = Some(entity);
        self.names.insert(name, id);
        self.events.push(EntityEvent::Registered(id));
        Ok(id)
    }

    /// Remove an entity and queue an [`EntityEvent::Removed`] that owns the
    /// detached entity.
    ///
    /// The entity's hierarchy links survive until
    /// [`release_links`](Self::release_links), so observers of the event
    /// can still walk to its parent and children.
    ///
    /// # Errors
    ///
    /// [`EcsError::EntityNotFound`] if `id` is stale or was never allocated.
    pub fn remove_entity(&mut self, id: EntityId) -> Result<(), EcsError> {
        if !self.allocator.is_alive(id) {
            return Err(EcsError::EntityNotFound { entity: id });
        }
        let entity = self
            .slots
            .get_mut(id.index() as usize)
            .and_then(Option::take)
            .ok_or(EcsError::EntityNotFound { entity: id })?;
        self.allocator.deallocate(id);
        self.names.remove(entity.name());

        tracing::debug!(entity = %id, name = entity.name(), "entity removed");
        self.events.push(EntityEvent::Removed(entity));
        Ok(())
    }

    /// Remove the entity called `name`, returning its former id.
    pub fn remove_entity_named(&mut self, name: &str) -> Result<EntityId, EcsError> {
        let id = self.id_of(name)?;
        self.remove_entity(id)?;
        Ok(id)
    }

    fn synthesize_name(&mut self) -> String {
        loop {
            let candidate = format!("entity{}", self.next_anonymous);
            self.next_anonymous += 1;
            if !self.names.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    // -- lookup -------------------------------------------------------------

    /// The entity with identifier `id`.
    pub fn entity(&self, id: EntityId) -> Result<&Entity, EcsError> {
        self.slots
            .get(id.index() as usize)
            .and_then(Option::as_ref)
            .filter(|e| e.id() == id)
            .ok_or(EcsError::EntityNotFound { entity: id })
    }

    /// The entity with identifier `id`, mutably.
    ///
    /// Components attached through this reference do not queue a
    /// [`EntityEvent::Changed`]; use [`attach_component`](Self::attach_component)
    /// when systems must re-evaluate the entity.
    pub fn entity_mut(&mut self, id: EntityId) -> Result<&mut Entity, EcsError> {
        self.slots
            .get_mut(id.index() as usize)
            .and_then(Option::as_mut)
            .filter(|e| e.id() == id)
            .ok_or(EcsError::EntityNotFound { entity: id })
    }

    /// The entity called `name`.
    pub fn entity_named(&self, name: &str) -> Result<&Entity, EcsError> {
        self.entity(self.id_of(name)?)
    }

    /// The entity called `name`, mutably.
    pub fn entity_named_mut(&mut self, name: &str) -> Result<&mut Entity, EcsError> {
        let id = self.id_of(name)?;
        self.entity_mut(id)
    }

    /// Identifier of the entity called `name`.
    pub fn id_of(&self, name: &str) -> Result<EntityId, EcsError> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| EcsError::NameNotFound {
                name: name.to_owned(),
            })
    }

    /// Whether `id` refers to a live entity.
    pub fn contains(&self, id: EntityId) -> bool {
        self.allocator.is_alive(id)
    }

    /// Whether a live entity is called `name`.
    pub fn has_entity(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether no entity is live.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Every live entity, in slot order.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> + '_ {
        self.slots.iter().flatten()
    }

    // -- queries ------------------------------------------------------------

    /// Every live entity holding all kinds of `Q`.
    ///
    /// Order is slot order: stable as long as no entity is created or removed.
    pub fn get_entities<Q: ComponentSet>(&self) -> EntitiesWith<'_, Q> {
        EntitiesWith::new(&self.slots)
    }

    /// `(id, components)` for every live entity holding all kinds of `Q`.
    pub fn query<Q: ComponentSet>(&self) -> QueryIter<'_, Q> {
        QueryIter::new(&self.slots)
    }

    /// Snapshot of the ids matching `Q`, for callers that need to mutate
    /// entities while walking the result.
    pub fn entity_ids_with<Q: ComponentSet>(&self) -> Vec<EntityId> {
        self.get_entities::<Q>().map(Entity::id).collect()
    }

    // -- components ---------------------------------------------------------

    /// Attach `component` to entity `id` and queue an
    /// [`EntityEvent::Changed`] so systems can re-evaluate membership.
    pub fn attach_component<T: Component>(&mut self, id: EntityId, component: T) -> Result<&mut T, EcsError> {
        let entity = self
            .slots
            .get_mut(id.index() as usize)
            .and_then(Option::as_mut)
            .filter(|e| e.id() == id)
            .ok_or(EcsError::EntityNotFound { entity: id })?;
        self.events.push(EntityEvent::Changed(id));
        Ok(entity.attach(component))
    }

    /// Detach and return the component of kind `T` from entity `id`, queueing
    /// an [`EntityEvent::Changed`].
    pub fn detach_component<T: Component>(&mut self, id: EntityId) -> Result<T, EcsError> {
        let component = self.entity_mut(id)?.detach::<T>()?;
        self.events.push(EntityEvent::Changed(id));
        Ok(component)
    }

    // -- hierarchy ----------------------------------------------------------

    /// Record `parent` as the parent of `child`, replacing any previous link.
    pub fn add_link(&mut self, parent: EntityId, child: EntityId) -> Result<(), EcsError> {
        for id in [parent, child] {
            if !self.contains(id) {
                return Err(EcsError::EntityNotFound { entity: id });
            }
        }
        self.parents.insert(child, parent);
        Ok(())
    }

    /// Drop the link recorded for `child`, returning its former parent.
    pub fn remove_link(&mut self, child: EntityId) -> Result<EntityId, EcsError> {
        self.parents
            .remove(&child)
            .ok_or(EcsError::LinkNotFound { child })
    }

    /// The parent recorded for `child`.
    pub fn parent_of(&self, child: EntityId) -> Result<&Entity, EcsError> {
        let parent = self
            .parents
            .get(&child)
            .ok_or(EcsError::LinkNotFound { child })?;
        self.entity(*parent)
    }

    /// Live children linked under `parent`, in slot order.
    pub fn children_of(&self, parent: EntityId) -> Vec<EntityId> {
        let mut children: Vec<EntityId> = self
            .parents
            .iter()
            .filter(|(child, p)| **p == parent && self.contains(**child))
            .map(|(child, _)| *child)
            .collect();
        children.sort_by_key(|id| id.index());
        children
    }

    /// Drop every link from or to a removed entity. Live entities are left
    /// alone.
    pub fn release_links(&mut self, id: EntityId) {
        if self.contains(id) {
            return;
        }
        self.parents.remove(&id);
        self.parents.retain(|_, parent| *parent != id);
    }

    // -- events -------------------------------------------------------------

    /// Take every queued lifecycle event, oldest first.
    pub fn drain_events(&mut self) -> Vec<EntityEvent> {
        std::mem::take(&mut self.events)
    }

    /// Whether lifecycle events are waiting to be drained.
    pub fn has_pending_events(&self) -> bool {
        !self.events.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
