//! Keel ECS -- entity/component storage for the Keel engine kernel.
//!
//! This crate holds the data half of the kernel: stable kind identifiers for
//! arbitrary Rust types, a heterogeneous per-entity component store, and the
//! entity registry with its name index, hierarchy links, multi-kind queries
//! and lifecycle event queue. Scheduling and messaging live in `keel-engine`.
//!
//! # Quick Start
//!
//! ```
//! use keel_ecs::prelude::*;
//!
//! #[derive(Debug, PartialEq)]
//! struct Position { x: f32, y: f32 }
//! impl Component for Position {}
//!
//! #[derive(Debug, PartialEq)]
//! struct Velocity { dx: f32, dy: f32 }
//! impl Component for Velocity {}
//!
//! let mut registry = EntityRegistry::new();
//! let ship = registry
//!     .create_entity(Some("ship"), |e| {
//!         e.attach(Position { x: 0.0, y: 0.0 });
//!         e.attach(Velocity { dx: 1.0, dy: 0.0 });
//!     })
//!     .unwrap();
//!
//! assert_eq!(registry.get_entities::<(Position, Velocity)>().count(), 1);
//! assert_eq!(
//!     registry.entity(ship).unwrap().get::<Position>().unwrap(),
//!     &Position { x: 0.0, y: 0.0 }
//! );
//! ```

#![deny(unsafe_code)]

pub mod component;
pub mod entity;
pub mod kind;
pub mod query;
pub mod registry;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by registry and component-store operations.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// A live entity already uses the requested name.
    #[error("an entity named '{name}' already exists")]
    AlreadyExists { name: String },

    /// The entity does not exist (stale generation or never allocated).
    #[error("entity {entity} does not exist (stale or never allocated)")]
    EntityNotFound { entity: entity::EntityId },

    /// No live entity carries the requested name.
    #[error("no entity named '{name}'")]
    NameNotFound { name: String },

    /// The entity does not hold a component of the requested kind.
    #[error("entity '{entity}' has no component of kind {kind}")]
    ComponentNotFound { entity: String, kind: &'static str },

    /// No parent link was recorded for the entity.
    #[error("entity {child} has no parent link")]
    LinkNotFound { child: entity::EntityId },
}

impl EcsError {
    /// Whether this is one of the "lookup found nothing" errors.
    pub fn is_not_found(&self) -> bool {
        !matches!(self, EcsError::AlreadyExists { .. })
    }
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::component::{attributes_of, Component, ComponentStore};
    pub use crate::entity::{Entity, EntityId};
    pub use crate::kind::{AsAny, KindId, KindRegistry};
    pub use crate::query::ComponentSet;
    pub use crate::registry::{EntityEvent, EntityRegistry};
    pub use crate::EcsError;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::prelude::*;

    #[derive(Debug, Clone, PartialEq, serde::Serialize)]
    struct Position {
        x: f32,
        y: f32,
    }

    impl Component for Position {
        fn attributes(&self) -> Option<serde_json::Map<String, serde_json::Value>> {
            attributes_of(self)
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Velocity {
        dx: f32,
        dy: f32,
    }

    impl Component for Velocity {}

    #[test]
    fn attach_get_detach_cycle() {
        let mut reg = EntityRegistry::new();
        let e = reg.create_entity(None, |_| {}).unwrap();

        reg.attach_component(e, Position { x: 1.0, y: 2.0 }).unwrap();
        assert!(reg.entity(e).unwrap().has::<Position>());
        assert_eq!(
            reg.entity(e).unwrap().get::<Position>().unwrap(),
            &Position { x: 1.0, y: 2.0 }
        );

        reg.detach_component::<Position>(e).unwrap();
        let entity = reg.entity(e).unwrap();
        assert!(!entity.has::<Position>());
        assert!(entity.get::<Position>().unwrap_err().is_not_found());
    }

    #[test]
    fn reattach_same_kind_overwrites() {
        let mut reg = EntityRegistry::new();
        let e = reg
            .create_entity(Some("e"), |e| {
                e.attach(Position { x: 1.0, y: 2.0 });
            })
            .unwrap();
        reg.attach_component(e, Position { x: 99.0, y: 100.0 }).unwrap();

        let entity = reg.entity(e).unwrap();
        assert_eq!(entity.kinds().len(), 1);
        assert_eq!(
            entity.get::<Position>().unwrap(),
            &Position { x: 99.0, y: 100.0 }
        );
    }

    #[test]
    fn mutate_through_query_snapshot() {
        let mut reg = EntityRegistry::new();
        for i in 0..4 {
            reg.create_entity(None, |e| {
                e.attach(Position { x: i as f32, y: 0.0 });
                if i % 2 == 0 {
                    e.attach(Velocity { dx: 1.0, dy: 1.0 });
                }
            })
            .unwrap();
        }

        for id in reg.entity_ids_with::<(Position, Velocity)>() {
            let entity = reg.entity_mut(id).unwrap();
            let vel = entity.get::<Velocity>().unwrap().clone();
            let pos = entity.get_mut::<Position>().unwrap();
            pos.x += vel.dx;
            pos.y += vel.dy;
        }

        let moved: Vec<f32> = reg
            .query::<(Position, Velocity)>()
            .map(|(_, (p, _))| p.x)
            .collect();
        assert_eq!(moved, vec![1.0, 3.0]);
    }

    #[test]
    fn describe_uses_attributes() {
        let mut reg = EntityRegistry::new();
        let e = reg
            .create_entity(Some("sensor"), |e| {
                e.attach(Position { x: 3.0, y: 4.0 });
                e.attach(Velocity { dx: 0.0, dy: 0.0 });
            })
            .unwrap();
        let desc = reg.entity(e).unwrap().describe();
        assert_eq!(desc["components"]["Position"]["y"], 4.0);
        assert_eq!(
            desc["components"]["Velocity"],
            "Velocity { dx: 0.0, dy: 0.0 }"
        );
    }
}
