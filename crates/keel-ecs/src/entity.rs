//! Entity handles and the [`Entity`] record.
//!
//! Handles are generational: when a slot is reused its generation moves on,
//! so a handle to a removed entity never resolves to its successor.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::component::{Component, ComponentStore};
use crate::kind::{short_name, KindId};
use crate::EcsError;

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// Handle of an entity: a registry slot plus the generation of that slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId {
    index: u32,
    generation: u32,
}

impl EntityId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Registry slot.
    pub fn index(self) -> u32 {
        self.index
    }

    /// How many times the slot was reused before this entity took it.
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({self})")
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

// ---------------------------------------------------------------------------
// EntityAllocator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct SlotState {
    generation: u32,
    alive: bool,
}

/// Hands out [`EntityId`]s. Freed slots are reused oldest first.
#[derive(Debug, Default)]
pub(crate) struct EntityAllocator {
    slots: Vec<SlotState>,
    free: VecDeque<u32>,
}

impl EntityAllocator {
    pub(crate) fn allocate(&mut self) -> EntityId {
        match self.free.pop_front() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.alive = true;
                EntityId::new(index, slot.generation)
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(SlotState {
                    generation: 0,
                    alive: true,
                });
                EntityId::new(index, 0)
            }
        }
    }

    /// Free the slot of `id` and advance its generation. `false` if `id` was
    /// already dead.
    pub(crate) fn deallocate(&mut self, id: EntityId) -> bool {
        if !self.is_alive(id) {
            return false;
        }
        let slot = &mut self.slots[id.index as usize];
        slot.alive = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push_back(id.index);
        true
    }

    pub(crate) fn is_alive(&self, id: EntityId) -> bool {
        self.slots
            .get(id.index as usize)
            .is_some_and(|slot| slot.alive && slot.generation == id.generation)
    }
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A named entity and the components it owns.
///
/// Entities are created and destroyed by the
/// [`EntityRegistry`](crate::registry::EntityRegistry); components can be
/// attached directly here (for instance from a creation callback) or through
/// the registry when systems must be told the component set changed.
#[derive(Debug)]
pub struct Entity {
    id: EntityId,
    name: String,
    components: ComponentStore,
}

impl Entity {
    pub(crate) fn new(id: EntityId, name: String) -> Self {
        Self {
            id,
            name,
            components: ComponentStore::new(),
        }
    }

    /// This entity's identifier.
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// This entity's unique name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach `component`, replacing any previous component of the same kind.
    pub fn attach<T: Component>(&mut self, component: T) -> &mut T {
        self.components.attach(component)
    }

    /// Remove and return the component of kind `T`.
    pub fn detach<T: Component>(&mut self) -> Result<T, EcsError> {
        self.components
            .detach::<T>()
            .ok_or_else(|| self.missing::<T>())
    }

    /// The component of kind `T`.
    pub fn get<T: Component>(&self) -> Result<&T, EcsError> {
        self.components.get::<T>().ok_or_else(|| self.missing::<T>())
    }

    /// The component of kind `T`, mutably.
    pub fn get_mut<T: Component>(&mut self) -> Result<&mut T, EcsError> {
        let name = &self.name;
        self.components
            .get_mut::<T>()
            .ok_or_else(|| EcsError::ComponentNotFound {
                entity: name.clone(),
                kind: std::any::type_name::<T>(),
            })
    }

    /// Whether the entity holds a component of kind `T`.
    pub fn has<T: Component>(&self) -> bool {
        self.components.has::<T>()
    }

    /// Held kinds, in first-attach order.
    pub fn kinds(&self) -> &[KindId] {
        self.components.kinds()
    }

    /// The underlying component store.
    pub fn components(&self) -> &ComponentStore {
        &self.components
    }

    /// Structured description of the entity for debugging tools.
    ///
    /// ```text
    /// { "id": "0v0", "name": "player", "components": { "Position": { "x": 1.0, ... } } }
    /// ```
    ///
    /// Components without attributes are rendered with their `Debug` string.
    pub fn describe(&self) -> Value {
        let mut components = Map::new();
        for (kind, component) in self.components.iter() {
            let rendered = match component.attributes() {
                Some(attrs) => Value::Object(attrs),
                None => Value::String(component.debug_string()),
            };
            components.insert(short_name(kind.name()).to_owned(), rendered);
        }
        serde_json::json!({
            "id": self.id.to_string(),
            "name": self.name,
            "components": components,
        })
    }

    fn missing<T: Component>(&self) -> EcsError {
        EcsError::ComponentNotFound {
            entity: self.name.clone(),
            kind: std::any::type_name::<T>(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::attributes_of;

    #[derive(Debug, PartialEq, serde::Serialize)]
    struct Pos {
        x: f32,
    }

    impl Component for Pos {
        fn attributes(&self) -> Option<Map<String, Value>> {
            attributes_of(self)
        }
    }

    #[derive(Debug, PartialEq)]
    struct Tag;

    impl Component for Tag {}

    #[test]
    fn reused_slot_gets_new_generation() {
        let mut alloc = EntityAllocator::default();
        let a = alloc.allocate();
        let b = alloc.allocate();
        assert!(alloc.deallocate(a));
        assert!(!alloc.deallocate(a));

        let c = alloc.allocate();
        assert_eq!((c.index(), c.generation()), (a.index(), 1));
        assert_eq!(c.to_string(), "0v1");
        assert!(!alloc.is_alive(a));
        assert!(alloc.is_alive(b) && alloc.is_alive(c));
    }

    #[test]
    fn missing_component_is_not_found() {
        let mut e = Entity::new(EntityId::new(0, 0), "e".to_owned());
        let err = e.get::<Pos>().unwrap_err();
        assert!(err.is_not_found());
        assert!(e.get_mut::<Pos>().is_err());
        assert!(e.detach::<Pos>().is_err());
    }

    #[test]
    fn describe_lists_components_in_order() {
        let mut e = Entity::new(EntityId::new(3, 0), "crate".to_owned());
        e.attach(Tag);
        e.attach(Pos { x: 2.0 });

        let desc = e.describe();
        assert_eq!(desc["name"], "crate");
        assert_eq!(desc["id"], "3v0");
        assert_eq!(desc["components"]["Tag"], "Tag");
        assert_eq!(desc["components"]["Pos"]["x"], 2.0);

        let keys: Vec<&String> = desc["components"].as_object().unwrap().keys().collect();
        assert_eq!(keys.len(), 2);
    }
}
